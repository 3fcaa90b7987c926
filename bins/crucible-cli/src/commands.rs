// CLI commands: pure database operations against the shared store

use anyhow::Result;
use crucible_common::store::JobStore;

pub async fn add_key(db_path: &str, description: &str) -> Result<()> {
    let store = JobStore::open(db_path).await?;
    let key = store.create_key(description).await?;

    println!("Created API key: {}", key.key);
    if !key.description.is_empty() {
        println!("  description: {}", key.description);
    }
    Ok(())
}

pub async fn list_keys(db_path: &str) -> Result<()> {
    let store = JobStore::open(db_path).await?;
    let keys = store.list_keys().await?;

    if keys.is_empty() {
        println!("No API keys.");
        return Ok(());
    }

    println!("{:<38} {:<22} description", "key", "created");
    for key in keys {
        println!(
            "{:<38} {:<22} {}",
            key.key,
            key.created_at.format("%Y-%m-%d %H:%M:%S"),
            key.description
        );
    }
    Ok(())
}

pub async fn revoke_key(db_path: &str, key: &str) -> Result<()> {
    let store = JobStore::open(db_path).await?;
    if store.revoke_key(key).await? {
        println!("Revoked {key}");
    } else {
        println!("No such key: {key}");
    }
    Ok(())
}

pub async fn show_stats(db_path: &str) -> Result<()> {
    let store = JobStore::open(db_path).await?;
    let stats = store.stats().await?;

    println!("Jobs");
    println!("  total:        {}", stats.total_jobs);
    println!("  not started:  {}", stats.not_started);
    println!("  running:      {}", stats.running);
    println!("  done:         {}", stats.done);
    println!("  crashed:      {}", stats.crashed);
    println!("  timed out:    {}", stats.timed_out);
    println!("  avg run time: {:.0} ms", stats.avg_execution_ms);
    Ok(())
}

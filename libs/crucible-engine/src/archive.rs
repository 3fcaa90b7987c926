//! Staging of job inputs into the sandbox filesystem.

use anyhow::{bail, Context, Result};
use crucible_common::types::InputFile;

/// The source file's fixed name inside the sandbox working directory. The
/// default sandbox command compiles and runs exactly this file.
pub const MAIN_SOURCE_FILE: &str = "Main.java";

/// Rejects names that could escape the sandbox working directory. Input
/// files land flat next to the source; there is no reason for separators
/// or parent references.
pub fn validate_file_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("input file name is empty");
    }
    if name.contains('/') || name.contains('\\') {
        bail!("input file name '{name}' contains a path separator");
    }
    if name.contains("..") {
        bail!("input file name '{name}' contains a parent-directory reference");
    }
    Ok(())
}

/// Builds the tar archive uploaded into the sandbox: the program source
/// under [`MAIN_SOURCE_FILE`] plus each input file under its given name.
pub fn build_archive(source: &str, files: &[InputFile]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    append_entry(&mut builder, MAIN_SOURCE_FILE, source.as_bytes())?;
    for file in files {
        validate_file_name(&file.name)?;
        append_entry(&mut builder, &file.name, file.content.as_bytes())?;
    }
    builder.into_inner().context("failed to finish input archive")
}

fn append_entry(builder: &mut tar::Builder<Vec<u8>>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, name, data)
        .with_context(|| format!("failed to append '{name}' to input archive"))
}

/// Single-quotes one argument for the sandbox's `sh -c` command line.
pub fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

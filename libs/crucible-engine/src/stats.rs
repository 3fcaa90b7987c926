//! Peak CPU and memory tracking from the runtime's statistics stream.

use crate::sandbox::StatsStream;
use futures_util::StreamExt;
use tokio::sync::oneshot;
use tracing::debug;

/// One statistics frame. CPU totals come in pairs (current and previous
/// frame) so each sample carries its own delta.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSample {
    pub cpu_total_ns: u64,
    pub precpu_total_ns: u64,
    pub system_cpu_ns: Option<u64>,
    pub presystem_cpu_ns: Option<u64>,
    pub online_cpus: u64,
    pub memory_usage_bytes: u64,
}

/// Monotonic peaks across a sampling window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceUsage {
    pub peak_cpu_pct: f64,
    pub peak_memory_mb: f64,
}

impl ResourceUsage {
    /// Folds one sample into the peaks. The CPU percentage is
    /// `100 x online_cpus x cpu_delta / system_delta`; the sample is skipped
    /// when the system delta is zero or negative (the very first frame has
    /// no previous totals to diff against).
    pub fn observe(&mut self, sample: &StatsSample) {
        if let (Some(system), Some(presystem)) = (sample.system_cpu_ns, sample.presystem_cpu_ns) {
            if system > presystem && sample.cpu_total_ns >= sample.precpu_total_ns {
                let cpu_delta = (sample.cpu_total_ns - sample.precpu_total_ns) as f64;
                let system_delta = (system - presystem) as f64;
                let pct = 100.0 * sample.online_cpus as f64 * cpu_delta / system_delta;
                if pct > self.peak_cpu_pct {
                    self.peak_cpu_pct = pct;
                }
            }
        }

        let memory_mb = sample.memory_usage_bytes as f64 / (1024.0 * 1024.0);
        if memory_mb > self.peak_memory_mb {
            self.peak_memory_mb = memory_mb;
        }
    }
}

/// Consumes statistics frames until the supervisor signals stop or the
/// stream ends, then returns the final peaks. Unreadable frames are skipped;
/// nothing in here can abort the job.
pub async fn sample_peaks(mut stream: StatsStream, mut stop: oneshot::Receiver<()>) -> ResourceUsage {
    let mut usage = ResourceUsage::default();
    loop {
        tokio::select! {
            _ = &mut stop => break,
            frame = stream.next() => match frame {
                Some(Ok(sample)) => usage.observe(&sample),
                Some(Err(e)) => debug!(error = %e, "skipping unreadable stats frame"),
                None => break,
            },
        }
    }
    usage
}

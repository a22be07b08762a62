use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryPolicy;

const STATE_DIR_NAME: &str = ".nomad-lrms";

/// Configuration for one execution host.
///
/// Paths are interpreted on the target host, i.e. by the transport.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Total cores the ledger may hand out. `None` discovers the host's count.
    pub total_cores: Option<u32>,
    /// Total memory in bytes. `None` discovers the host's `MemTotal`.
    pub total_memory: Option<u64>,
    /// Largest core request a single job may make.
    pub max_cores_per_job: Option<u32>,
    /// Largest memory request (bytes) a single job may make.
    pub max_memory_per_job: Option<u64>,
    /// Directory under which per-job execution directories are created.
    pub spool_dir: PathBuf,
    /// Location of the persisted ledger snapshot.
    pub ledger_path: PathBuf,
    /// Measurement utility used by the launcher (GNU time compatible).
    pub time_cmd: PathBuf,
    /// Upper bound for any single transport call.
    pub transport_timeout_ms: u64,
    /// Backoff while waiting for the launcher's PID file.
    pub pid_file_retry: RetryPolicy,
    /// Backoff for transient failures of process-table queries.
    pub poll_retry: RetryPolicy,
    /// Interval between polls in `wait_for_termination`.
    pub poll_interval_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        let state_dir = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(STATE_DIR_NAME);
        Self {
            total_cores: None,
            total_memory: None,
            max_cores_per_job: None,
            max_memory_per_job: None,
            spool_dir: state_dir.join("spool"),
            ledger_path: state_dir.join("ledger.json"),
            time_cmd: PathBuf::from("/usr/bin/time"),
            transport_timeout_ms: 30_000,
            pid_file_retry: RetryPolicy::pid_file(),
            poll_retry: RetryPolicy::process_poll(),
            poll_interval_ms: 1_000,
        }
    }
}

impl BackendConfig {
    /// Config with every host-side path rooted at `state_dir`.
    pub fn rooted_at(state_dir: impl Into<PathBuf>) -> Self {
        let state_dir = state_dir.into();
        Self {
            spool_dir: state_dir.join("spool"),
            ledger_path: state_dir.join("ledger.json"),
            ..Default::default()
        }
    }

    pub fn with_capacity(mut self, cores: u32, memory: u64) -> Self {
        self.total_cores = Some(cores);
        self.total_memory = Some(memory);
        self
    }

    pub fn with_job_limits(mut self, cores: Option<u32>, memory: Option<u64>) -> Self {
        self.max_cores_per_job = cores;
        self.max_memory_per_job = memory;
        self
    }

    pub fn with_time_cmd(mut self, time_cmd: impl Into<PathBuf>) -> Self {
        self.time_cmd = time_cmd.into();
        self
    }

    pub fn transport_timeout(&self) -> Duration {
        Duration::from_millis(self.transport_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

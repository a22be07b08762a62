use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scheduler::ledger::LedgerEntry;
use crate::worker::usage::UsageReport;

/// Lifecycle of a job as seen by the controller.
///
/// Transitions only move forward:
/// `Pending -> Submitted -> {Running | Stopped}* -> Terminating -> Freed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Submitted,
    Running,
    Stopped,
    Terminating,
    Freed,
}

impl JobState {
    /// A process may still exist for the job.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobState::Submitted | JobState::Running | JobState::Stopped
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Submitted => write!(f, "submitted"),
            JobState::Running => write!(f, "running"),
            JobState::Stopped => write!(f, "stopped"),
            JobState::Terminating => write!(f, "terminating"),
            JobState::Freed => write!(f, "freed"),
        }
    }
}

/// How a terminated job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(i32),
    /// No usage report was written, so the outcome cannot be known.
    Unknown,
}

impl ExitStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exited with {}", code),
            ExitStatus::Signaled(signal) => write!(f, "killed by signal {}", signal),
            ExitStatus::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A file copied into the execution directory before launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFile {
    /// Path on the backend's machine.
    pub source: PathBuf,
    /// Path relative to the execution directory.
    pub target: PathBuf,
}

/// What to run and what it needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub arguments: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    /// Send stderr into the stdout file.
    pub join: bool,
    pub inputs: Vec<InputFile>,
    pub cores: u32,
    /// Requested memory in bytes.
    pub memory: u64,
}

impl JobSpec {
    pub fn new<I, S>(arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            arguments: arguments.into_iter().map(Into::into).collect(),
            cores: 1,
            ..Default::default()
        }
    }

    pub fn with_resources(mut self, cores: u32, memory: u64) -> Self {
        self.cores = cores;
        self.memory = memory;
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(name.into(), value.into());
        self
    }

    pub fn with_stdin(mut self, path: impl Into<String>) -> Self {
        self.stdin = Some(path.into());
        self
    }

    pub fn with_stdout(mut self, path: impl Into<String>) -> Self {
        self.stdout = Some(path.into());
        self
    }

    pub fn with_stderr(mut self, path: impl Into<String>) -> Self {
        self.stderr = Some(path.into());
        self
    }

    pub fn joined(mut self) -> Self {
        self.join = true;
        self
    }

    pub fn with_input(mut self, source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        self.inputs.push(InputFile {
            source: source.into(),
            target: target.into(),
        });
        self
    }

    /// Redirection file for `stream`, relative to the execution directory.
    pub fn output_path(&self, stream: OutputStream) -> Option<&str> {
        match stream {
            OutputStream::Stdout => self.stdout.as_deref(),
            OutputStream::Stderr if self.join => self.stdout.as_deref(),
            OutputStream::Stderr => self.stderr.as_deref(),
        }
    }
}

/// The controller's view of one application.
///
/// Created by the caller in `Pending`, then driven by the controller. The
/// lifecycle fields are read-only from outside the crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: Uuid,
    pub spec: JobSpec,
    pub(crate) state: JobState,
    pub(crate) pid: Option<u32>,
    pub(crate) exec_dir: Option<PathBuf>,
    pub(crate) usage: Option<UsageReport>,
    pub(crate) exit_status: Option<ExitStatus>,
    pub(crate) failure: Option<String>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) submitted_at: Option<DateTime<Utc>>,
    pub(crate) terminated_at: Option<DateTime<Utc>>,
}

impl JobHandle {
    pub fn new(spec: JobSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            spec,
            state: JobState::Pending,
            pid: None,
            exec_dir: None,
            usage: None,
            exit_status: None,
            failure: None,
            created_at: Utc::now(),
            submitted_at: None,
            terminated_at: None,
        }
    }

    /// Rebuild a handle for a job found in the ledger after a restart. The
    /// original command line is not part of the ledger and stays empty.
    pub fn from_entry(entry: &LedgerEntry) -> Self {
        let mut handle = Self::new(JobSpec::default().with_resources(entry.cores, entry.memory));
        handle.state = if entry.terminated {
            JobState::Terminating
        } else {
            JobState::Submitted
        };
        handle.pid = Some(entry.pid);
        handle.exec_dir = Some(entry.exec_dir.clone());
        handle.created_at = entry.booked_at;
        handle.submitted_at = Some(entry.booked_at);
        handle
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn exec_dir(&self) -> Option<&Path> {
        self.exec_dir.as_deref()
    }

    pub fn usage(&self) -> Option<&UsageReport> {
        self.usage.as_ref()
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Why a terminated job is considered failed even without an exit code.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        self.submitted_at
    }

    pub fn terminated_at(&self) -> Option<DateTime<Utc>> {
        self.terminated_at
    }

    /// Terminated with exit code zero and a usage report on disk.
    pub fn succeeded(&self) -> bool {
        matches!(self.state, JobState::Terminating | JobState::Freed)
            && self.exit_status.map(|s| s.is_success()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_handle_is_pending() {
        let handle = JobHandle::new(JobSpec::new(["echo", "hello"]));
        assert_eq!(handle.state(), JobState::Pending);
        assert_eq!(handle.spec.arguments, vec!["echo", "hello"]);
        assert_eq!(handle.spec.cores, 1);
        assert!(handle.pid().is_none());
        assert!(handle.exec_dir().is_none());
        assert!(!handle.succeeded());
    }

    #[test]
    fn output_path_follows_join() {
        let spec = JobSpec::new(["true"]).with_stdout("out.txt").with_stderr("err.txt");
        assert_eq!(spec.output_path(OutputStream::Stdout), Some("out.txt"));
        assert_eq!(spec.output_path(OutputStream::Stderr), Some("err.txt"));

        let joined = spec.joined();
        assert_eq!(joined.output_path(OutputStream::Stderr), Some("out.txt"));
    }

    #[test]
    fn from_entry_restores_state() {
        let mut entry = LedgerEntry::new(4242, 2, 1 << 30, PathBuf::from("/spool/job-1"));
        let handle = JobHandle::from_entry(&entry);
        assert_eq!(handle.state(), JobState::Submitted);
        assert_eq!(handle.pid(), Some(4242));
        assert_eq!(handle.exec_dir(), Some(Path::new("/spool/job-1")));
        assert_eq!(handle.spec.cores, 2);

        entry.terminated = true;
        assert_eq!(JobHandle::from_entry(&entry).state(), JobState::Terminating);
    }

    #[test]
    fn exit_status_display() {
        assert_eq!(ExitStatus::Exited(0).to_string(), "exited with 0");
        assert_eq!(ExitStatus::Signaled(9).to_string(), "killed by signal 9");
        assert_eq!(ExitStatus::Unknown.to_string(), "unknown");
        assert!(ExitStatus::Exited(0).is_success());
        assert!(!ExitStatus::Unknown.is_success());
    }

    #[test]
    fn state_activity() {
        assert!(!JobState::Pending.is_active());
        assert!(JobState::Running.is_active());
        assert!(JobState::Stopped.is_active());
        assert!(!JobState::Terminating.is_active());
        assert_eq!(JobState::Terminating.to_string(), "terminating");
    }
}

use std::path::PathBuf;

use thiserror::Error;

use crate::scheduler::JobState;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum LrmsError {
    #[error(
        "Insufficient capacity: requested {requested_cores} cores / {requested_memory} bytes, \
         available {available_cores} cores / {available_memory} bytes"
    )]
    NoCapacity {
        requested_cores: u32,
        requested_memory: u64,
        available_cores: u32,
        available_memory: u64,
    },

    #[error("Request exceeds limit: {0}")]
    LimitExceeded(String),

    #[error("Execution setup failed in {exec_dir:?}: {reason}")]
    Submission {
        exec_dir: Option<PathBuf>,
        reason: String,
    },

    #[error("Ledger error at {path:?}: {reason}")]
    Ledger { path: PathBuf, reason: String },

    #[error("Host discovery failed: {0}")]
    HostDiscovery(String),

    #[error("Measurement utility unavailable: {0}")]
    MeasurementUnavailable(String),

    #[error("Invalid job state for {operation}: {state}")]
    InvalidState {
        operation: &'static str,
        state: JobState,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl LrmsError {
    /// True for rejections made before the host was touched; the caller may
    /// retry the same job elsewhere.
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            LrmsError::NoCapacity { .. } | LrmsError::LimitExceeded(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, LrmsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_errors_are_classified() {
        let no_capacity = LrmsError::NoCapacity {
            requested_cores: 3,
            requested_memory: 1,
            available_cores: 2,
            available_memory: 1,
        };
        assert!(no_capacity.is_admission());
        assert!(LrmsError::LimitExceeded("cores".into()).is_admission());

        let setup = LrmsError::Submission {
            exec_dir: None,
            reason: "boom".into(),
        };
        assert!(!setup.is_admission());
        assert!(!LrmsError::Transport(TransportError::Timeout("ps".into())).is_admission());
    }
}

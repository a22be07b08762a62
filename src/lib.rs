pub mod config;
pub mod error;
pub mod retry;
pub mod scheduler;
pub mod shutdown;
pub mod transport;
pub mod worker;

pub use config::BackendConfig;
pub use error::{LrmsError, Result};
pub use scheduler::{ExitStatus, JobHandle, JobSpec, JobState, OutputStream};
pub use transport::{LocalTransport, Transport};
pub use worker::{Controller, UsageReport};

//! Job execution on a host.
//!
//! Jobs are not children of the backend. Each one runs behind a generated
//! launcher that detaches from the backend, records its pid, and has the
//! measurement utility append a usage report when the command exits. The
//! backend learns everything afterwards from the host:
//!
//! - [`wrapper`]: execution-directory layout, launcher rendering, staging and
//!   detached start
//! - [`usage`]: parser for the `Key=Value` usage report
//! - [`controller`]: the per-job state machine (submit, poll, cancel, free)
//!
//! # Execution directory
//!
//! ```text
//! <spool>/job-<uuid>/            staged inputs, stdout/stderr files
//! <spool>/job-<uuid>/.wrapper/pid
//! <spool>/job-<uuid>/.wrapper/launcher
//! <spool>/job-<uuid>/.wrapper/usage.report
//! ```

pub mod controller;
pub mod usage;
pub mod wrapper;

pub use controller::Controller;
pub use usage::UsageReport;
pub use wrapper::WrapperLayout;

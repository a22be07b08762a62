pub mod job;
pub mod ledger;

pub use job::{ExitStatus, InputFile, JobHandle, JobSpec, JobState, OutputStream};
pub use ledger::{HostCapacity, Ledger, LedgerEntry, Reservation};

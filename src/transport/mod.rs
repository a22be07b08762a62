//! Host access abstraction.
//!
//! The controller never touches a host directly: every command, file read
//! and file write goes through a [`Transport`]. A transport may be the local
//! shell ([`LocalTransport`]) or a remote connection implemented elsewhere;
//! authentication, pooling and reconnection are its own business.
//!
//! Every call made by this crate is wrapped in [`bounded`] so that a hung
//! remote host surfaces as [`TransportError::Timeout`] instead of wedging the
//! caller.

pub mod local;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use local::LocalTransport;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Not found: {0:?}")]
    NotFound(PathBuf),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Command failed to start: {0}")]
    Spawn(String),

    #[error("Command `{command}` exited with {exit_code}: {stderr}")]
    Command {
        command: String,
        exit_code: i32,
        stderr: String,
    },
}

impl TransportError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            TransportError::NotFound(path.to_path_buf())
        } else {
            TransportError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, TransportError::NotFound(_))
    }
}

/// Result of a command run through [`Transport::execute_command`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Primitives the backend needs from a host.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    async fn connect(&self) -> Result<(), TransportError>;

    /// Run `command` through the host's POSIX shell. With `detach` the call
    /// returns as soon as the command has been started in the background,
    /// and the command must outlive both the call and the calling process.
    async fn execute_command(
        &self,
        command: &str,
        detach: bool,
    ) -> Result<CommandOutput, TransportError>;

    async fn read_file(&self, path: &Path) -> Result<Vec<u8>, TransportError>;

    /// Replace `path` with `contents`. Readers observe either the previous
    /// file or the complete new one.
    async fn write_file(&self, path: &Path, contents: &[u8]) -> Result<(), TransportError>;

    /// Copy a file from the backend's machine to the host.
    async fn put(&self, local: &Path, remote: &Path) -> Result<(), TransportError>;

    /// Copy a file from the host to the backend's machine.
    async fn get(&self, remote: &Path, local: &Path) -> Result<(), TransportError>;

    async fn remove(&self, path: &Path) -> Result<(), TransportError>;

    async fn remove_tree(&self, path: &Path) -> Result<(), TransportError>;

    async fn makedirs(&self, path: &Path) -> Result<(), TransportError>;

    async fn chmod(&self, path: &Path, mode: u32) -> Result<(), TransportError>;

    async fn is_dir(&self, path: &Path) -> Result<bool, TransportError>;

    async fn exists(&self, path: &Path) -> Result<bool, TransportError>;

    async fn list_dir(&self, path: &Path) -> Result<Vec<String>, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Await a transport call for at most `limit`.
pub async fn bounded<T, F>(limit: Duration, what: &str, call: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(format!(
            "{} after {}ms",
            what,
            limit.as_millis()
        ))),
    }
}

/// Quote `value` as a single POSIX shell word.
pub fn sh_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// [`sh_quote`] for paths; non-UTF-8 bytes are replaced lossily.
pub fn sh_quote_path(path: &Path) -> String {
    sh_quote(&path.to_string_lossy())
}

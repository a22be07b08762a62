use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use uuid::Uuid;

use super::{CommandOutput, Transport, TransportError};

/// Transport for the machine the backend itself runs on.
///
/// Commands run through `/bin/sh -c`. Detached commands are backgrounded by a
/// throwaway shell that exits immediately, so the job is reparented away from
/// this process and is never one of our children.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    shell: PathBuf,
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalTransport {
    pub fn new() -> Self {
        Self {
            shell: PathBuf::from("/bin/sh"),
        }
    }

    fn process_output(
        command: &str,
        result: std::io::Result<std::process::Output>,
    ) -> Result<CommandOutput, TransportError> {
        let output = result.map_err(|e| TransportError::Spawn(format!("{}: {}", command, e)))?;
        // Killed by a signal: report it the way a shell would.
        let exit_code = output.status.code().unwrap_or_else(|| {
            use std::os::unix::process::ExitStatusExt;
            128 + output.status.signal().unwrap_or(0)
        });
        let result = CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        tracing::trace!(command, exit_code, "Local command finished");
        Ok(result)
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn execute_command(
        &self,
        command: &str,
        detach: bool,
    ) -> Result<CommandOutput, TransportError> {
        let script = if detach {
            format!("(\n{}\n) </dev/null >/dev/null 2>&1 &", command)
        } else {
            command.to_string()
        };
        let result = Command::new(&self.shell)
            .arg("-c")
            .arg(&script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;
        Self::process_output(command, result)
    }

    async fn read_file(&self, path: &Path) -> Result<Vec<u8>, TransportError> {
        tokio::fs::read(path)
            .await
            .map_err(|e| TransportError::io(path, e))
    }

    async fn write_file(&self, path: &Path, contents: &[u8]) -> Result<(), TransportError> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let staging = path.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));
        if let Err(e) = tokio::fs::write(&staging, contents).await {
            return Err(TransportError::io(&staging, e));
        }
        if let Err(e) = tokio::fs::rename(&staging, path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(TransportError::io(path, e));
        }
        Ok(())
    }

    async fn put(&self, local: &Path, remote: &Path) -> Result<(), TransportError> {
        tokio::fs::copy(local, remote)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::io(local, e))
    }

    async fn get(&self, remote: &Path, local: &Path) -> Result<(), TransportError> {
        tokio::fs::copy(remote, local)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::io(remote, e))
    }

    async fn remove(&self, path: &Path) -> Result<(), TransportError> {
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| TransportError::io(path, e))
    }

    async fn remove_tree(&self, path: &Path) -> Result<(), TransportError> {
        tokio::fs::remove_dir_all(path)
            .await
            .map_err(|e| TransportError::io(path, e))
    }

    async fn makedirs(&self, path: &Path) -> Result<(), TransportError> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| TransportError::io(path, e))
    }

    async fn chmod(&self, path: &Path, mode: u32) -> Result<(), TransportError> {
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(|e| TransportError::io(path, e))
    }

    async fn is_dir(&self, path: &Path) -> Result<bool, TransportError> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(TransportError::io(path, e)),
        }
    }

    async fn exists(&self, path: &Path) -> Result<bool, TransportError> {
        tokio::fs::try_exists(path)
            .await
            .map_err(|e| TransportError::io(path, e))
    }

    async fn list_dir(&self, path: &Path) -> Result<Vec<String>, TransportError> {
        let mut entries = tokio::fs::read_dir(path)
            .await
            .map_err(|e| TransportError::io(path, e))?;
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| TransportError::io(path, e))?
        {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names)
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn execute_captures_output_and_exit_code() {
        let transport = LocalTransport::new();

        let out = transport.execute_command("echo hello", false).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "hello\n");

        let out = transport
            .execute_command("echo oops >&2; exit 3", false)
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stderr, "oops\n");
    }

    #[tokio::test]
    async fn detached_command_returns_before_completion() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("done");
        let transport = LocalTransport::new();

        let started = std::time::Instant::now();
        let out = transport
            .execute_command(&format!("sleep 1; touch '{}'", marker.display()), true)
            .await
            .unwrap();
        assert!(out.success());
        assert!(started.elapsed() < std::time::Duration::from_millis(900));
        assert!(!marker.exists());

        tokio::time::sleep(std::time::Duration::from_millis(1_500)).await;
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn write_file_replaces_whole_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("snapshot.json");
        let transport = LocalTransport::new();

        transport.write_file(&path, b"first version").await.unwrap();
        transport.write_file(&path, b"v2").await.unwrap();

        assert_eq!(transport.read_file(&path).await.unwrap(), b"v2");
        // No staging files left behind
        assert_eq!(
            transport.list_dir(dir.path()).await.unwrap(),
            vec!["snapshot.json".to_string()]
        );
    }

    #[tokio::test]
    async fn missing_paths_report_not_found() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        let transport = LocalTransport::new();

        assert!(transport.read_file(&missing).await.unwrap_err().is_not_found());
        assert!(transport.remove_tree(&missing).await.unwrap_err().is_not_found());
        assert!(!transport.is_dir(&missing).await.unwrap());
        assert!(!transport.exists(&missing).await.unwrap());
    }

    #[tokio::test]
    async fn makedirs_chmod_and_list() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a/b/c");
        let transport = LocalTransport::new();

        transport.makedirs(&nested).await.unwrap();
        assert!(transport.is_dir(&nested).await.unwrap());

        let script = nested.join("run.sh");
        transport.write_file(&script, b"#!/bin/sh\n").await.unwrap();
        transport.chmod(&script, 0o755).await.unwrap();
        let mode = std::fs::metadata(&script).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);

        assert_eq!(
            transport.list_dir(&nested).await.unwrap(),
            vec!["run.sh".to_string()]
        );
    }
}

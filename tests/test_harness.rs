//! Test harness for running jobs against the local machine.
//!
//! Provides an isolated state directory per test, a measurement utility
//! (GNU time when installed, otherwise a small sh stand-in honouring the same
//! `-o/-a/-f` flags), and a transport wrapper that injects failures.

#![allow(dead_code)]

use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use nomad_lrms::config::BackendConfig;
use nomad_lrms::retry::RetryPolicy;
use nomad_lrms::scheduler::{JobHandle, JobState};
use nomad_lrms::transport::{CommandOutput, LocalTransport, Transport, TransportError};
use nomad_lrms::worker::Controller;

pub const GIB: u64 = 1 << 30;

const TIME_STAND_IN: &str = r#"#!/bin/sh
out=/dev/stderr
fmt=''
while [ $# -gt 0 ]; do
    case "$1" in
        -o) out="$2"; shift 2 ;;
        -a) shift ;;
        -f) fmt="$2"; shift 2 ;;
        --version) echo "time stand-in 1.0"; exit 0 ;;
        --) shift; break ;;
        *) break ;;
    esac
done
start=$(date +%s.%N)
"$@"
rc=$?
end=$(date +%s.%N)
wall=$(awk -v s="$start" -v e="$end" 'BEGIN { printf "%.2f", e - s }')
{
    if [ "$rc" -gt 128 ]; then
        echo "Command terminated by signal $((rc - 128))"
    elif [ "$rc" -ne 0 ]; then
        echo "Command exited with non-zero status $rc"
    fi
    printf '%s\n' "$fmt" | sed -e 's/\\n/\n/g' -e "s/%e/$wall/g" -e "s/%x/$rc/g" -e 's/%[A-Za-z]/0/g'
} >> "$out"
exit "$rc"
"#;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn gnu_time_installed() -> bool {
    std::process::Command::new("/usr/bin/time")
        .arg("--version")
        .output()
        .map(|out| {
            let banner = format!(
                "{}{}",
                String::from_utf8_lossy(&out.stdout),
                String::from_utf8_lossy(&out.stderr)
            );
            out.status.success() && banner.contains("GNU")
        })
        .unwrap_or(false)
}

/// Isolated state directory and config for one test.
pub struct TestHost {
    pub dir: TempDir,
    pub config: BackendConfig,
}

impl TestHost {
    pub fn new(cores: u32, memory: u64) -> Self {
        init_tracing();
        let dir = TempDir::new().expect("Failed to create temp dir");

        let time_cmd = if gnu_time_installed() {
            PathBuf::from("/usr/bin/time")
        } else {
            let path = dir.path().join("bin/time");
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, TIME_STAND_IN).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        };

        let mut config = BackendConfig::rooted_at(dir.path().join("state"))
            .with_capacity(cores, memory)
            .with_time_cmd(time_cmd);
        config.transport_timeout_ms = 10_000;
        config.poll_interval_ms = 50;
        config.pid_file_retry = RetryPolicy::new(10, 20, 1_000, 0.0);
        config.poll_retry = RetryPolicy::new(4, 10, 100, 0.0);

        Self { dir, config }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub async fn controller(&self) -> Controller {
        Controller::connect(Arc::new(LocalTransport::new()), self.config.clone())
            .await
            .expect("controller should connect")
    }

    pub async fn controller_with(&self, transport: Arc<dyn Transport>) -> Controller {
        Controller::connect(transport, self.config.clone())
            .await
            .expect("controller should connect")
    }
}

/// Poll `handle` until it stops being active, at most `attempts` times.
pub async fn poll_until_terminated(
    controller: &Controller,
    handle: &mut JobHandle,
    attempts: usize,
) -> JobState {
    for _ in 0..attempts {
        let state = controller.poll(handle).await.expect("poll should succeed");
        if !state.is_active() {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    handle.state()
}

/// Send `signal` to `pid` from outside the backend.
pub fn send_signal(signal: &str, pid: u32) {
    let status = std::process::Command::new("kill")
        .arg(format!("-{}", signal))
        .arg(pid.to_string())
        .status()
        .expect("kill should run");
    assert!(status.success(), "kill -{} {} failed", signal, pid);
}

/// Local transport that fails on demand.
#[derive(Debug, Default)]
pub struct FaultyTransport {
    inner: LocalTransport,
    /// Number of upcoming `ps` invocations that fail.
    pub failing_status_checks: AtomicU32,
    /// Fail every `write_file` while set.
    pub failing_writes: AtomicBool,
    /// Detached commands never return while set.
    pub stalled_launches: AtomicBool,
}

impl FaultyTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for FaultyTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.inner.connect().await
    }

    async fn execute_command(
        &self,
        command: &str,
        detach: bool,
    ) -> Result<CommandOutput, TransportError> {
        if command.starts_with("ps ")
            && self
                .failing_status_checks
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(TransportError::Connection("injected ps failure".into()));
        }
        if detach && self.stalled_launches.load(Ordering::SeqCst) {
            return std::future::pending().await;
        }
        self.inner.execute_command(command, detach).await
    }

    async fn read_file(&self, path: &Path) -> Result<Vec<u8>, TransportError> {
        self.inner.read_file(path).await
    }

    async fn write_file(&self, path: &Path, contents: &[u8]) -> Result<(), TransportError> {
        if self.failing_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Connection("injected write failure".into()));
        }
        self.inner.write_file(path, contents).await
    }

    async fn put(&self, local: &Path, remote: &Path) -> Result<(), TransportError> {
        self.inner.put(local, remote).await
    }

    async fn get(&self, remote: &Path, local: &Path) -> Result<(), TransportError> {
        self.inner.get(remote, local).await
    }

    async fn remove(&self, path: &Path) -> Result<(), TransportError> {
        self.inner.remove(path).await
    }

    async fn remove_tree(&self, path: &Path) -> Result<(), TransportError> {
        self.inner.remove_tree(path).await
    }

    async fn makedirs(&self, path: &Path) -> Result<(), TransportError> {
        self.inner.makedirs(path).await
    }

    async fn chmod(&self, path: &Path, mode: u32) -> Result<(), TransportError> {
        self.inner.chmod(path, mode).await
    }

    async fn is_dir(&self, path: &Path) -> Result<bool, TransportError> {
        self.inner.is_dir(path).await
    }

    async fn exists(&self, path: &Path) -> Result<bool, TransportError> {
        self.inner.exists(path).await
    }

    async fn list_dir(&self, path: &Path) -> Result<Vec<String>, TransportError> {
        self.inner.list_dir(path).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.close().await
    }
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(50)).await;
    assert!(result, "{}", message);
}

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::BackendConfig;
use crate::error::{LrmsError, Result};
use crate::scheduler::{
    ExitStatus, HostCapacity, JobHandle, JobState, Ledger, LedgerEntry, OutputStream,
};
use crate::transport::{bounded, sh_quote_path, Transport, TransportError};
use crate::worker::wrapper::{self, WrapperLayout};

/// What the process table says about a pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessProbe {
    Running,
    Stopped,
    Gone,
}

/// Drives jobs through their lifecycle on one host.
///
/// Ledger mutations are serialized behind a single async mutex; everything
/// else (staging, launching, polling) runs concurrently across handles. Share
/// the controller with `Arc` to submit from several tasks.
#[derive(Debug)]
pub struct Controller {
    transport: Arc<dyn Transport>,
    config: BackendConfig,
    ledger: Mutex<Ledger>,
}

impl Controller {
    /// Connect to the host, settle its capacity and load the ledger.
    pub async fn connect(transport: Arc<dyn Transport>, config: BackendConfig) -> Result<Self> {
        let timeout = config.transport_timeout();
        bounded(timeout, "connect", transport.connect()).await?;

        let capacity = match (config.total_cores, config.total_memory) {
            (Some(cores), Some(memory)) => HostCapacity::new(cores, memory),
            (cores, memory) => {
                let found = HostCapacity::discover(transport.as_ref(), timeout).await?;
                HostCapacity::new(cores.unwrap_or(found.cores), memory.unwrap_or(found.memory))
            }
        };

        let mut ledger = Ledger::new(
            transport.clone(),
            config.ledger_path.clone(),
            capacity,
            timeout,
        );
        ledger.reload().await?;
        tracing::info!(
            cores = capacity.cores,
            memory = capacity.memory,
            tracked = ledger.len(),
            ledger = %config.ledger_path.display(),
            "Controller ready"
        );

        Ok(Self {
            transport,
            config,
            ledger: Mutex::new(ledger),
        })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Verify the measurement utility can be run on the host.
    pub async fn check_time_cmd(&self) -> Result<()> {
        let command = format!("{} --version", sh_quote_path(&self.config.time_cmd));
        let out = bounded(
            self.config.transport_timeout(),
            "time --version",
            self.transport.execute_command(&command, false),
        )
        .await?;
        if !out.success() {
            return Err(LrmsError::MeasurementUnavailable(format!(
                "{} exited with {}: {}",
                self.config.time_cmd.display(),
                out.exit_code,
                out.stderr.trim()
            )));
        }
        let banner = format!("{}{}", out.stdout, out.stderr);
        if !banner.contains("GNU") {
            tracing::warn!(
                time_cmd = %self.config.time_cmd.display(),
                banner = banner.trim(),
                "Measurement utility does not identify as GNU time"
            );
        }
        Ok(())
    }

    pub async fn capacity(&self) -> HostCapacity {
        self.ledger.lock().await.capacity()
    }

    /// Free (cores, memory) according to the in-memory ledger.
    pub async fn available(&self) -> (u32, u64) {
        self.ledger.lock().await.available()
    }

    /// Whether the ledger currently tracks `pid`.
    pub async fn is_tracked(&self, pid: u32) -> bool {
        self.ledger.lock().await.contains(pid)
    }

    /// Submissions currently holding capacity while their job is launched.
    pub async fn launching(&self) -> usize {
        self.ledger.lock().await.reserved()
    }

    /// Retry a ledger rewrite that failed earlier.
    pub async fn persist_ledger(&self) -> Result<()> {
        self.ledger.lock().await.persist().await
    }

    /// Launch a pending job.
    ///
    /// Capacity is claimed before anything is written on the host, so a
    /// [`LrmsError::NoCapacity`] or [`LrmsError::LimitExceeded`] leaves no
    /// trace. The claim is held by a [`crate::scheduler::Reservation`] and
    /// given back if this future is dropped before the job is booked. A
    /// [`LrmsError::Submission`] leaves the execution directory for diagnosis
    /// and the handle `Pending`. A [`LrmsError::Ledger`] after a
    /// successful launch leaves the handle `Submitted` and the booking in
    /// memory; [`Controller::persist_ledger`] retries the write.
    pub async fn submit(&self, handle: &mut JobHandle) -> Result<()> {
        if handle.state != JobState::Pending {
            return Err(LrmsError::InvalidState {
                operation: "submit",
                state: handle.state,
            });
        }
        self.check_limits(handle).await?;
        if handle.spec.arguments.is_empty() {
            return Err(LrmsError::Submission {
                exec_dir: None,
                reason: "empty command line".into(),
            });
        }
        if let Some(name) = handle
            .spec
            .environment
            .keys()
            .find(|name| !wrapper::is_env_name(name))
        {
            return Err(LrmsError::Submission {
                exec_dir: None,
                reason: format!("invalid environment variable name {:?}", name),
            });
        }

        let (cores, memory) = (handle.spec.cores, handle.spec.memory);
        let reservation = {
            let mut ledger = self.ledger.lock().await;
            ledger.reload().await?;
            ledger.reserve(handle.id, cores, memory)?
        };

        let launched = self.launch(handle).await;
        let mut ledger = self.ledger.lock().await;
        drop(reservation);
        let (layout, pid) = launched?;

        handle.pid = Some(pid);
        handle.state = JobState::Submitted;
        handle.submitted_at = Some(Utc::now());
        tracing::info!(job_id = %handle.id, pid, exec_dir = %layout.root.display(), "Job submitted");

        ledger
            .book(LedgerEntry::new(pid, cores, memory, layout.root))
            .await
    }

    async fn launch(&self, handle: &mut JobHandle) -> Result<(WrapperLayout, u32)> {
        let layout = match wrapper::prepare(self.transport.as_ref(), &self.config, &handle.spec).await
        {
            Ok(layout) => layout,
            Err(e) => {
                if let LrmsError::Submission {
                    exec_dir: Some(dir),
                    ..
                } = &e
                {
                    handle.exec_dir = Some(dir.clone());
                }
                tracing::error!(job_id = %handle.id, error = %e, "Execution setup failed");
                return Err(e);
            }
        };
        handle.exec_dir = Some(layout.root.clone());

        match wrapper::launch(self.transport.as_ref(), &self.config, &layout).await {
            Ok(pid) => Ok((layout, pid)),
            Err(e) => {
                tracing::error!(job_id = %handle.id, error = %e, "Launch failed");
                Err(e)
            }
        }
    }

    async fn check_limits(&self, handle: &JobHandle) -> Result<()> {
        let spec = &handle.spec;
        let capacity = self.capacity().await;
        if spec.cores == 0 {
            return Err(LrmsError::LimitExceeded("a job needs at least one core".into()));
        }
        let max_cores = self
            .config
            .max_cores_per_job
            .unwrap_or(capacity.cores)
            .min(capacity.cores);
        if spec.cores > max_cores {
            return Err(LrmsError::LimitExceeded(format!(
                "{} cores requested, at most {} per job",
                spec.cores, max_cores
            )));
        }
        let max_memory = self
            .config
            .max_memory_per_job
            .unwrap_or(capacity.memory)
            .min(capacity.memory);
        if spec.memory > max_memory {
            return Err(LrmsError::LimitExceeded(format!(
                "{} bytes requested, at most {} per job",
                spec.memory, max_memory
            )));
        }
        Ok(())
    }

    /// Refresh the job's state from the host.
    ///
    /// Once `Terminating` has been observed, further polls return it without
    /// touching the host.
    pub async fn poll(&self, handle: &mut JobHandle) -> Result<JobState> {
        let pid = match (handle.state, handle.pid) {
            (JobState::Terminating | JobState::Freed, _) => return Ok(handle.state),
            (state, Some(pid)) if state.is_active() => pid,
            (state, _) => {
                return Err(LrmsError::InvalidState {
                    operation: "poll",
                    state,
                })
            }
        };

        let probe = self
            .config
            .poll_retry
            .run("process probe", |_| self.probe(pid))
            .await?;
        let next = match probe {
            ProcessProbe::Running => JobState::Running,
            ProcessProbe::Stopped => JobState::Stopped,
            ProcessProbe::Gone => {
                self.observe_termination(handle, pid).await?;
                return Ok(handle.state);
            }
        };
        if next != handle.state {
            tracing::debug!(job_id = %handle.id, pid, state = %next, "Job state changed");
            handle.state = next;
        }
        Ok(next)
    }

    async fn probe(&self, pid: u32) -> std::result::Result<ProcessProbe, TransportError> {
        let command = format!("ps -o stat= -p {}", pid);
        let out = bounded(
            self.config.transport_timeout(),
            "ps",
            self.transport.execute_command(&command, false),
        )
        .await?;
        match out.stdout.trim().chars().next() {
            // Zombies have exited; only their parent has not reaped them yet.
            Some('Z') | Some('X') => Ok(ProcessProbe::Gone),
            Some('T') | Some('t') => Ok(ProcessProbe::Stopped),
            Some(_) => Ok(ProcessProbe::Running),
            None if out.exit_code == 1 && out.stderr.trim().is_empty() => Ok(ProcessProbe::Gone),
            None => Err(TransportError::Command {
                command,
                exit_code: out.exit_code,
                stderr: out.stderr.trim().to_string(),
            }),
        }
    }

    /// Record the end of a job whose process no longer exists.
    async fn observe_termination(&self, handle: &mut JobHandle, pid: u32) -> Result<()> {
        let usage = match handle.exec_dir.as_ref() {
            Some(root) => {
                let layout = WrapperLayout::new(root.clone());
                wrapper::read_usage(
                    self.transport.as_ref(),
                    self.config.transport_timeout(),
                    &layout,
                )
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(job_id = %handle.id, pid, error = %e, "Could not read usage report");
                    None
                })
            }
            None => None,
        };

        self.ledger.lock().await.mark_terminated(pid).await?;

        let exit_status = usage
            .as_ref()
            .map(|u| u.exit_status())
            .unwrap_or(ExitStatus::Unknown);
        handle.failure = match (&usage, exit_status) {
            (None, _) => Some("process vanished without writing a usage report".into()),
            (Some(_), ExitStatus::Unknown) => Some("usage report is incomplete".into()),
            _ => None,
        };
        if let Some(reason) = &handle.failure {
            tracing::warn!(job_id = %handle.id, pid, reason = %reason, "Job outcome unknown");
        }
        handle.usage = usage;
        handle.exit_status = Some(exit_status);
        handle.terminated_at = Some(Utc::now());
        handle.state = JobState::Terminating;
        tracing::info!(job_id = %handle.id, pid, exit_status = %exit_status, "Job terminated");
        Ok(())
    }

    /// Ask the job to terminate.
    ///
    /// The job's own processes are signalled first so the measurement utility
    /// survives long enough to write its report. If the process is already
    /// gone the job moves to `Terminating` right away; otherwise keep polling.
    pub async fn cancel(&self, handle: &mut JobHandle) -> Result<()> {
        let pid = match (handle.state, handle.pid) {
            (JobState::Terminating | JobState::Freed, _) => return Ok(()),
            (state, Some(pid)) if state.is_active() => pid,
            (state, _) => {
                return Err(LrmsError::InvalidState {
                    operation: "cancel",
                    state,
                })
            }
        };

        // kill(1) succeeds against zombies, so look before signalling
        if self.config.poll_retry.run("process probe", |_| self.probe(pid)).await?
            == ProcessProbe::Gone
        {
            tracing::debug!(job_id = %handle.id, pid, "Process already gone on cancel");
            return self.observe_termination(handle, pid).await;
        }

        let command = format!("pkill -TERM -P {pid} || kill -TERM {pid}", pid = pid);
        let out = bounded(
            self.config.transport_timeout(),
            "kill",
            self.transport.execute_command(&command, false),
        )
        .await?;
        if out.success() {
            tracing::info!(job_id = %handle.id, pid, "Termination signal sent");
            return Ok(());
        }

        match self.probe(pid).await? {
            ProcessProbe::Gone => {
                tracing::debug!(job_id = %handle.id, pid, "Process already gone on cancel");
                self.observe_termination(handle, pid).await
            }
            _ => Err(TransportError::Command {
                command,
                exit_code: out.exit_code,
                stderr: out.stderr.trim().to_string(),
            }
            .into()),
        }
    }

    /// Remove the execution directory and the ledger entry. Calling it again
    /// is a no-op.
    pub async fn free(&self, handle: &mut JobHandle) -> Result<()> {
        match handle.state {
            JobState::Freed => return Ok(()),
            state if state.is_active() => {
                return Err(LrmsError::InvalidState {
                    operation: "free",
                    state,
                })
            }
            _ => {}
        }

        if let Some(root) = handle.exec_dir.clone() {
            match bounded(
                self.config.transport_timeout(),
                "rm -r",
                self.transport.remove_tree(&root),
            )
            .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        if let Some(pid) = handle.pid {
            self.ledger.lock().await.release(pid).await?;
        }

        handle.state = JobState::Freed;
        tracing::info!(job_id = %handle.id, pid = ?handle.pid, "Job freed");
        Ok(())
    }

    /// Bytes of the job's stdout or stderr file from `offset` on. Streams
    /// redirected to `/dev/null` or not yet created read as empty.
    pub async fn peek(
        &self,
        handle: &JobHandle,
        stream: OutputStream,
        offset: usize,
    ) -> Result<Vec<u8>> {
        let (Some(root), Some(relative)) = (handle.exec_dir.as_ref(), handle.spec.output_path(stream))
        else {
            return Ok(Vec::new());
        };
        let path: PathBuf = root.join(relative);
        let bytes = match bounded(
            self.config.transport_timeout(),
            "peek",
            self.transport.read_file(&path),
        )
        .await
        {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(bytes.get(offset..).map(<[u8]>::to_vec).unwrap_or_default())
    }

    /// Rebuild handles for every job in the persisted ledger, e.g. after the
    /// backend restarted. Terminated jobs get their usage report re-read.
    pub async fn recover(&self) -> Result<Vec<JobHandle>> {
        let entries: Vec<LedgerEntry> = {
            let mut ledger = self.ledger.lock().await;
            ledger.reload().await?;
            ledger.entries().cloned().collect()
        };

        let mut handles = Vec::with_capacity(entries.len());
        for entry in &entries {
            let mut handle = JobHandle::from_entry(entry);
            if entry.terminated {
                let layout = WrapperLayout::new(entry.exec_dir.clone());
                let usage = wrapper::read_usage(
                    self.transport.as_ref(),
                    self.config.transport_timeout(),
                    &layout,
                )
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(pid = entry.pid, error = %e, "Could not read usage report");
                    None
                });
                handle.exit_status = Some(
                    usage
                        .as_ref()
                        .map(|u| u.exit_status())
                        .unwrap_or(ExitStatus::Unknown),
                );
                handle.usage = usage;
            }
            handles.push(handle);
        }
        tracing::info!(jobs = handles.len(), "Recovered jobs from ledger");
        Ok(handles)
    }

    /// Poll until the job is `Terminating` or `token` is cancelled, returning
    /// the last observed state.
    pub async fn wait_for_termination(
        &self,
        handle: &mut JobHandle,
        token: &CancellationToken,
    ) -> Result<JobState> {
        loop {
            let state = self.poll(handle).await?;
            if !state.is_active() {
                return Ok(state);
            }
            tokio::select! {
                _ = token.cancelled() => return Ok(state),
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }
    }
}

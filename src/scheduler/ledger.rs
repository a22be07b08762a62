use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LrmsError, Result};
use crate::transport::{bounded, Transport};

const SNAPSHOT_VERSION: u32 = 1;

/// Declared core and memory budget of one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCapacity {
    pub cores: u32,
    /// Bytes.
    pub memory: u64,
}

impl HostCapacity {
    pub fn new(cores: u32, memory: u64) -> Self {
        Self { cores, memory }
    }

    /// Ask the host for its core count (`nproc`) and `MemTotal`.
    pub async fn discover(transport: &dyn Transport, timeout: Duration) -> Result<Self> {
        let nproc = bounded(timeout, "nproc", transport.execute_command("nproc", false)).await?;
        let cores = nproc
            .stdout
            .trim()
            .parse::<u32>()
            .map_err(|_| LrmsError::HostDiscovery(format!("unexpected nproc output {:?}", nproc.stdout)))?;

        let meminfo = bounded(
            timeout,
            "meminfo",
            transport.read_file(Path::new("/proc/meminfo")),
        )
        .await?;
        let memory = parse_mem_total(&String::from_utf8_lossy(&meminfo))
            .ok_or_else(|| LrmsError::HostDiscovery("no MemTotal in /proc/meminfo".into()))?;

        tracing::info!(cores, memory, "Discovered host capacity");
        Ok(Self { cores, memory })
    }
}

fn parse_mem_total(meminfo: &str) -> Option<u64> {
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

/// Bookkeeping for one admitted job, keyed by its process id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub pid: u32,
    pub cores: u32,
    pub memory: u64,
    pub exec_dir: PathBuf,
    pub terminated: bool,
    pub booked_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(pid: u32, cores: u32, memory: u64, exec_dir: PathBuf) -> Self {
        Self {
            pid,
            cores,
            memory,
            exec_dir,
            terminated: false,
            booked_at: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    entries: Vec<LedgerEntry>,
}

type Reservations = Arc<Mutex<HashMap<Uuid, (u32, u64)>>>;

/// Capacity claimed for a job that is being launched. Dropping it gives the
/// capacity back, also when the submitting future is cancelled.
#[derive(Debug)]
#[must_use = "the reservation is released as soon as it is dropped"]
pub struct Reservation {
    job_id: Uuid,
    reservations: Reservations,
}

impl Reservation {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        lock_reservations(&self.reservations).remove(&self.job_id);
    }
}

fn lock_reservations(reservations: &Reservations) -> MutexGuard<'_, HashMap<Uuid, (u32, u64)>> {
    // The map stays consistent even if a holder panicked.
    reservations
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Reservations of one host, persisted as a single snapshot file.
///
/// Several backends may share the file. Every mutation first re-reads the
/// snapshot so that entries booked or released by the others survive, then
/// rewrites it whole. When a rewrite fails the in-memory change is kept and the
/// error returned; [`Ledger::persist`] can be called again to retry. Until a rewrite succeeds, [`Ledger::reload`] writes
/// the in-memory entries instead of reading them back.
///
/// Reservations made with [`Ledger::reserve`] cover jobs that are being
/// launched and have no process id yet. They count against capacity but are
/// never persisted, and are released when the returned [`Reservation`] drops.
#[derive(Debug)]
pub struct Ledger {
    transport: Arc<dyn Transport>,
    path: PathBuf,
    timeout: Duration,
    capacity: HostCapacity,
    entries: BTreeMap<u32, LedgerEntry>,
    reservations: Reservations,
    unsynced: bool,
}

impl Ledger {
    pub fn new(
        transport: Arc<dyn Transport>,
        path: PathBuf,
        capacity: HostCapacity,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            path,
            timeout,
            capacity,
            entries: BTreeMap::new(),
            reservations: Reservations::default(),
            unsynced: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> HostCapacity {
        self.capacity
    }

    /// Replace the in-memory entries with the persisted snapshot. A missing
    /// file means nothing has been booked on this host yet.
    pub async fn reload(&mut self) -> Result<()> {
        if self.unsynced {
            return self.persist().await;
        }
        self.read_snapshot().await
    }

    /// Pick up changes other backends made, unless ours are not written yet.
    async fn refresh(&mut self) -> Result<()> {
        if self.unsynced {
            return Ok(());
        }
        self.read_snapshot().await
    }

    async fn read_snapshot(&mut self) -> Result<()> {
        let bytes = match bounded(
            self.timeout,
            "ledger read",
            self.transport.read_file(&self.path),
        )
        .await
        {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => {
                tracing::debug!(path = %self.path.display(), "No ledger snapshot, starting empty");
                self.entries.clear();
                return Ok(());
            }
            Err(e) => return Err(self.error(e)),
        };

        let snapshot: Snapshot = serde_json::from_slice(&bytes).map_err(|e| self.error(e))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(self.error(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        self.entries = snapshot
            .entries
            .into_iter()
            .map(|entry| (entry.pid, entry))
            .collect();
        tracing::debug!(path = %self.path.display(), entries = self.entries.len(), "Ledger reloaded");
        Ok(())
    }

    /// Cores and memory not claimed by live entries or pending reservations.
    pub fn available(&self) -> (u32, u64) {
        let (mut cores, mut memory) = (0u32, 0u64);
        for entry in self.entries.values().filter(|e| !e.terminated) {
            cores = cores.saturating_add(entry.cores);
            memory = memory.saturating_add(entry.memory);
        }
        for (res_cores, res_memory) in lock_reservations(&self.reservations).values() {
            cores = cores.saturating_add(*res_cores);
            memory = memory.saturating_add(*res_memory);
        }
        (
            self.capacity.cores.saturating_sub(cores),
            self.capacity.memory.saturating_sub(memory),
        )
    }

    /// Whether a request fits right now. Does not claim anything.
    pub fn admit(&self, cores: u32, memory: u64) -> bool {
        let (free_cores, free_memory) = self.available();
        cores <= free_cores && memory <= free_memory
    }

    /// Claim capacity for a job that is about to be launched.
    pub fn reserve(&mut self, job_id: Uuid, cores: u32, memory: u64) -> Result<Reservation> {
        if !self.admit(cores, memory) {
            let (available_cores, available_memory) = self.available();
            return Err(LrmsError::NoCapacity {
                requested_cores: cores,
                requested_memory: memory,
                available_cores,
                available_memory,
            });
        }
        lock_reservations(&self.reservations).insert(job_id, (cores, memory));
        Ok(Reservation {
            job_id,
            reservations: self.reservations.clone(),
        })
    }

    /// Number of reservations currently held.
    pub fn reserved(&self) -> usize {
        lock_reservations(&self.reservations).len()
    }

    /// Record a launched job.
    ///
    /// The process already exists, so a booking that no longer fits after
    /// another backend's changes were merged is still recorded, with a warning.
    pub async fn book(&mut self, entry: LedgerEntry) -> Result<()> {
        let refreshed = self.refresh().await;
        if refreshed.is_ok() && !self.admit(entry.cores, entry.memory) {
            let (available_cores, available_memory) = self.available();
            tracing::warn!(
                pid = entry.pid,
                cores = entry.cores,
                memory = entry.memory,
                available_cores,
                available_memory,
                "Host over-committed by a concurrent backend"
            );
        }
        tracing::info!(
            pid = entry.pid,
            cores = entry.cores,
            memory = entry.memory,
            exec_dir = %entry.exec_dir.display(),
            "Booking job"
        );
        self.entries.insert(entry.pid, entry);
        self.commit(refreshed, true).await
    }

    /// Flag the entry as terminated so it stops counting against capacity.
    /// Returns false when the pid is unknown; re-marking does not rewrite.
    pub async fn mark_terminated(&mut self, pid: u32) -> Result<bool> {
        let refreshed = self.refresh().await;
        let changed = match self.entries.get_mut(&pid) {
            Some(entry) if entry.terminated => false,
            Some(entry) => {
                entry.terminated = true;
                tracing::debug!(pid, "Ledger entry marked terminated");
                true
            }
            None => return refreshed.map(|_| false),
        };
        self.commit(refreshed, changed).await?;
        Ok(true)
    }

    /// Drop the entry. Releasing an unknown pid is a no-op.
    pub async fn release(&mut self, pid: u32) -> Result<Option<LedgerEntry>> {
        let refreshed = self.refresh().await;
        let Some(entry) = self.entries.remove(&pid) else {
            return refreshed.map(|_| None);
        };
        tracing::debug!(pid, "Ledger entry released");
        self.commit(refreshed, true).await?;
        Ok(Some(entry))
    }

    /// Write a change made on top of `refreshed`. If the re-read failed the
    /// change stays in memory, unwritten, and the read error is returned.
    async fn commit(&mut self, refreshed: Result<()>, changed: bool) -> Result<()> {
        if let Err(e) = refreshed {
            if changed {
                self.unsynced = true;
            }
            return Err(e);
        }
        if changed {
            self.persist().await
        } else {
            Ok(())
        }
    }

    pub fn get(&self, pid: u32) -> Option<&LedgerEntry> {
        self.entries.get(&pid)
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.entries.contains_key(&pid)
    }

    pub fn entries(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rewrite the whole snapshot from the in-memory entries.
    pub async fn persist(&mut self) -> Result<()> {
        let written = self.write_snapshot().await;
        self.unsynced = written.is_err();
        if let Err(e) = &written {
            tracing::warn!(path = %self.path.display(), error = %e, "Ledger rewrite failed");
        }
        written
    }

    async fn write_snapshot(&self) -> Result<()> {
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            entries: self.entries.values().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot).map_err(|e| self.error(e))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            bounded(self.timeout, "ledger mkdir", self.transport.makedirs(parent))
                .await
                .map_err(|e| self.error(e))?;
        }
        bounded(
            self.timeout,
            "ledger write",
            self.transport.write_file(&self.path, &bytes),
        )
        .await
        .map_err(|e| self.error(e))
    }

    fn error(&self, reason: impl std::fmt::Display) -> LrmsError {
        LrmsError::Ledger {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }
}

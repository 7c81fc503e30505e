//! Process-wide network statistics and connection history.
//!
//! One `Aggregator` is shared by every transfer session. Each operation
//! takes the internal mutex, applies its counter/history update and — where
//! the protocol contract requires it — rewrites the full snapshot to disk
//! before releasing the lock, so concurrent sessions can never lose each
//! other's updates. Per-chunk upload accounting deliberately skips the disk
//! write; the completed upload persists the final state.
//!
//! The snapshot shape below is also the persisted JSON and the body of the
//! wire protocol's `STATS` reply.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::dlog;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StatsError {
    Io(io::Error),
    Serde(serde_json::Error),
}

impl fmt::Display for StatsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatsError::Io(e) => write!(f, "stats io error: {e}"),
            StatsError::Serde(e) => write!(f, "stats serialization error: {e}"),
        }
    }
}

impl std::error::Error for StatsError {}

impl From<io::Error> for StatsError {
    fn from(e: io::Error) -> Self {
        StatsError::Io(e)
    }
}

impl From<serde_json::Error> for StatsError {
    fn from(e: serde_json::Error) -> Self {
        StatsError::Serde(e)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One connection's lifetime accounting. Mutated only through the owning
/// session's aggregator calls while the connection is open, then frozen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub client_id: u64,
    pub address: String,
    /// Seconds since the Unix epoch, fractional.
    pub connection_time: f64,
    #[serde(default)]
    pub bytes_uploaded: u64,
    #[serde(default)]
    pub bytes_downloaded: u64,
    #[serde(default)]
    pub active: bool,
}

/// The full aggregate state: persisted JSON, `STATS` reply body, and the
/// shape re-hydrated at process start.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    #[serde(default)]
    pub total_connections: u64,
    #[serde(default)]
    pub active_connections: u64,
    #[serde(default)]
    pub total_bytes_uploaded: u64,
    #[serde(default)]
    pub total_bytes_downloaded: u64,
    /// Exponentially smoothed bytes/second, folded at upload completion.
    #[serde(default)]
    pub upload_rate: f64,
    #[serde(default)]
    pub download_rate: f64,
    #[serde(default)]
    pub connection_history: Vec<ConnectionRecord>,
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

struct AggregatorInner {
    snapshot: StatsSnapshot,
    next_client_id: u64,
}

struct AggregatorShared {
    path: PathBuf,
    history_cap: usize,
    inner: Mutex<AggregatorInner>,
}

/// Handle to the shared aggregator. Cheap to clone; all clones observe one
/// state.
#[derive(Clone)]
pub struct Aggregator {
    shared: Arc<AggregatorShared>,
}

impl Aggregator {
    /// Load the persisted snapshot (missing or corrupt files load as empty)
    /// and normalize it for a fresh process: no connection survives a process
    /// boundary, so stale `active` history entries are finalized and the
    /// active count resets to zero.
    pub fn open(path: &Path, history_cap: usize) -> Result<Self, StatsError> {
        let mut snapshot: StatsSnapshot = match fs::read_to_string(path) {
            Ok(data) => serde_json::from_str(&data).unwrap_or_else(|e| {
                dlog!("stats: ignoring corrupt snapshot {}: {e}", path.display());
                StatsSnapshot::default()
            }),
            Err(_) => StatsSnapshot::default(),
        };

        let mut stale = 0usize;
        for record in snapshot.connection_history.iter_mut().filter(|r| r.active) {
            record.active = false;
            stale += 1;
        }
        if stale > 0 {
            dlog!("stats: finalized {stale} stale connection record(s) from a previous run");
        }
        snapshot.active_connections = 0;

        let next_client_id = snapshot
            .connection_history
            .iter()
            .map(|r| r.client_id)
            .max()
            .map_or(1, |max| max + 1);

        Ok(Self {
            shared: Arc::new(AggregatorShared {
                path: path.to_path_buf(),
                history_cap,
                inner: Mutex::new(AggregatorInner {
                    snapshot,
                    next_client_id,
                }),
            }),
        })
    }

    /// Register an accepted connection: assigns a process-unique client id,
    /// bumps the totals and appends a history record. Persists.
    pub fn on_connect(&self, address: &str) -> u64 {
        let mut inner = self.lock_inner();
        let client_id = inner.next_client_id;
        inner.next_client_id += 1;

        inner.snapshot.total_connections += 1;
        inner.snapshot.active_connections += 1;
        inner.snapshot.connection_history.push(ConnectionRecord {
            client_id,
            address: address.to_string(),
            connection_time: now_epoch(),
            bytes_uploaded: 0,
            bytes_downloaded: 0,
            active: true,
        });
        enforce_cap(
            &mut inner.snapshot.connection_history,
            self.shared.history_cap,
        );
        self.persist(&inner.snapshot);
        client_id
    }

    /// Finalize a connection: decrements the active count and freezes the
    /// history record. Persists. Safe to call exactly once per connection
    /// from any close path.
    pub fn on_disconnect(&self, client_id: u64) {
        let mut inner = self.lock_inner();
        inner.snapshot.active_connections = inner.snapshot.active_connections.saturating_sub(1);
        if let Some(record) = find_record(&mut inner.snapshot.connection_history, client_id) {
            record.active = false;
        }
        self.persist(&inner.snapshot);
    }

    /// Count received upload bytes. Deliberately not persisted: raw chunks
    /// arrive at high frequency and the completed upload persists the total.
    pub fn on_bytes_uploaded(&self, client_id: u64, n: u64) {
        let mut inner = self.lock_inner();
        inner.snapshot.total_bytes_uploaded += n;
        if let Some(record) = find_record(&mut inner.snapshot.connection_history, client_id) {
            record.bytes_uploaded += n;
        }
    }

    /// Count a completed download's bytes. Persists.
    pub fn on_bytes_downloaded(&self, client_id: u64, n: u64) {
        let mut inner = self.lock_inner();
        inner.snapshot.total_bytes_downloaded += n;
        if let Some(record) = find_record(&mut inner.snapshot.connection_history, client_id) {
            record.bytes_downloaded += n;
        }
        self.persist(&inner.snapshot);
    }

    /// Fold a completed upload into the smoothed upload rate:
    /// `new = (old + sample) / 2`. A zero elapsed time contributes no sample.
    /// Persists.
    pub fn on_upload_complete(&self, total_bytes: u64, elapsed_secs: f64) {
        let mut inner = self.lock_inner();
        if elapsed_secs > 0.0 {
            let sample = total_bytes as f64 / elapsed_secs;
            inner.snapshot.upload_rate = (inner.snapshot.upload_rate + sample) / 2.0;
        }
        self.persist(&inner.snapshot);
    }

    /// The current aggregate state including the full retained history.
    pub fn snapshot(&self) -> StatsSnapshot {
        self.lock_inner().snapshot.clone()
    }

    fn lock_inner(&self) -> MutexGuard<'_, AggregatorInner> {
        self.shared.inner.lock().unwrap()
    }

    /// Rewrite the snapshot through a temp file and an atomic rename.
    /// Persistence failures are logged, never propagated into a session: a
    /// full disk must not tear down live transfers.
    fn persist(&self, snapshot: &StatsSnapshot) {
        let result = serde_json::to_string(snapshot)
            .map_err(StatsError::from)
            .and_then(|data| {
                let tmp = self.shared.path.with_extension("tmp");
                fs::write(&tmp, data)?;
                fs::rename(&tmp, &self.shared.path)?;
                Ok(())
            });
        if let Err(e) = result {
            dlog!("stats: failed to persist snapshot: {e}");
        }
    }
}

/// Newest matching record wins: ids are unique within a run, and the live
/// record for an id is always the most recently appended one.
fn find_record(history: &mut [ConnectionRecord], client_id: u64) -> Option<&mut ConnectionRecord> {
    history.iter_mut().rev().find(|r| r.client_id == client_id)
}

/// Retention: evict the oldest finished record first; an oldest still-active
/// record goes only when no finished one remains.
fn enforce_cap(history: &mut Vec<ConnectionRecord>, cap: usize) {
    while history.len() > cap {
        match history.iter().position(|r| !r.active) {
            Some(pos) => {
                history.remove(pos);
            }
            None => {
                history.remove(0);
            }
        }
    }
}

//! Durable swap state log.
//!
//! The store keeps, per swap, one immutable contract record plus an ordered
//! event log with monotonic sequence numbers. Every append is fsynced before
//! it is acknowledged; an executor never performs an externally visible
//! action before the state advance behind it is durable.

use crate::error::{Error, Result};
use crate::kernel::{SwapEvent, SwapState};
use crate::types::{Contract, SwapHash, TerminalOutcome};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Mutex;
use time::OffsetDateTime;

/// Type alias for store futures.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// One entry of a swap's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Monotonic per-swap sequence number, assigned by the store.
    pub seq: u64,
    /// When the event was applied; replayed as the transition timestamp.
    pub time: OffsetDateTime,
    pub event: SwapEvent,
    /// Full state snapshot after applying the event.
    pub state: SwapState,
}

/// The final outcome record. Survives garbage collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalRecord {
    pub outcome: TerminalOutcome,
    pub time: OffsetDateTime,
}

/// A swap as loaded from the store.
#[derive(Debug, Clone)]
pub struct StoredSwap {
    pub contract: Contract,
    pub events: Vec<EventRecord>,
}

impl StoredSwap {
    /// The most recent durable state: the last snapshot, or the initial
    /// state if no event was recorded yet.
    pub fn latest_state(&self) -> SwapState {
        match self.events.last() {
            Some(record) => record.state.clone(),
            None => SwapState::initial(self.contract.clone()),
        }
    }
}

/// Typed storage trait for swap data.
///
/// Implementations guarantee per-swap linearisability: concurrent callers
/// keyed by different swap hashes never interfere, and appends for one hash
/// are totally ordered.
pub trait SwapStore: Send + Sync {
    /// Record the contract for a new swap. Append-once: fails if the hash
    /// already exists.
    fn put_contract(&self, swap_hash: SwapHash, contract: &Contract) -> StoreFuture<'_, ()>;

    /// Append an event and the resulting state snapshot to the swap's log.
    ///
    /// All-or-nothing, fsynced before returning; returns the assigned
    /// sequence number. Rejected once the swap is terminal.
    fn append_event(
        &self,
        swap_hash: SwapHash,
        event: &SwapEvent,
        state: &SwapState,
    ) -> StoreFuture<'_, u64>;

    /// Load every non-terminal swap with its full event history.
    fn load_all(&self) -> StoreFuture<'_, Vec<StoredSwap>>;

    /// Commit the final outcome of a swap. Idempotent; subsequent
    /// `append_event` calls on this hash are rejected.
    fn mark_terminal(&self, swap_hash: SwapHash, outcome: TerminalOutcome) -> StoreFuture<'_, ()>;
}

#[derive(Debug, Default, Clone, Copy)]
struct SwapLogState {
    next_seq: u64,
    terminal: bool,
}

/// File-backed swap store.
///
/// Layout: one directory per swap hash containing `contract.json`, an
/// `events.log` with one JSON record per line, and `terminal.json` once the
/// swap has ended. A partially written final line (crash mid-append) is
/// discarded on load, so the recovered state is always either the pre-event
/// or the post-event snapshot.
pub struct FileSwapStore {
    root: PathBuf,
    logs: Mutex<HashMap<SwapHash, SwapLogState>>,
}

const CONTRACT_FILE: &str = "contract.json";
const EVENTS_FILE: &str = "events.log";
const TERMINAL_FILE: &str = "terminal.json";

impl FileSwapStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .map_err(|e| Error::Storage(format!("Failed to create store root: {}", e)))?;

        let mut logs = HashMap::new();
        for entry in fs::read_dir(&root)
            .map_err(|e| Error::Storage(format!("Failed to read store root: {}", e)))?
        {
            let entry = entry.map_err(|e| Error::Storage(format!("Failed to read entry: {}", e)))?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Ok(swap_hash) = SwapHash::from_hex(name) else {
                continue;
            };

            let events = read_events(&entry.path().join(EVENTS_FILE))?;
            logs.insert(
                swap_hash,
                SwapLogState {
                    next_seq: events.last().map(|r| r.seq + 1).unwrap_or(0),
                    terminal: entry.path().join(TERMINAL_FILE).exists(),
                },
            );
        }

        Ok(Self {
            root,
            logs: Mutex::new(logs),
        })
    }

    fn swap_dir(&self, swap_hash: SwapHash) -> PathBuf {
        self.root.join(swap_hash.to_hex())
    }

    /// Remove the contract and event log of terminal swaps older than
    /// `retention`, preserving the final outcome record.
    pub fn collect_garbage(&self, retention: time::Duration) -> Result<usize> {
        let cutoff = OffsetDateTime::now_utc() - retention;
        let mut removed = 0;

        let terminal_hashes: Vec<SwapHash> = {
            let logs = self.logs.lock().expect("store lock poisoned");
            logs.iter()
                .filter(|(_, log)| log.terminal)
                .map(|(hash, _)| *hash)
                .collect()
        };

        for swap_hash in terminal_hashes {
            let dir = self.swap_dir(swap_hash);
            let terminal_path = dir.join(TERMINAL_FILE);
            let Ok(data) = fs::read_to_string(&terminal_path) else {
                continue;
            };
            let record: TerminalRecord = serde_json::from_str(&data)?;
            if record.time >= cutoff {
                continue;
            }

            for file in [CONTRACT_FILE, EVENTS_FILE] {
                let path = dir.join(file);
                if path.exists() {
                    fs::remove_file(&path)
                        .map_err(|e| Error::Storage(format!("Failed to remove {}: {}", file, e)))?;
                }
            }
            removed += 1;
        }

        Ok(removed)
    }
}

impl SwapStore for FileSwapStore {
    fn put_contract(&self, swap_hash: SwapHash, contract: &Contract) -> StoreFuture<'_, ()> {
        let contract = contract.clone();
        Box::pin(async move {
            let mut logs = self.logs.lock().expect("store lock poisoned");
            if logs.contains_key(&swap_hash) {
                return Err(Error::Storage(format!(
                    "Contract for swap {} already exists",
                    swap_hash
                )));
            }

            let dir = self.swap_dir(swap_hash);
            fs::create_dir_all(&dir)
                .map_err(|e| Error::Storage(format!("Failed to create swap dir: {}", e)))?;
            write_json_durable(&dir.join(CONTRACT_FILE), &contract)?;

            logs.insert(swap_hash, SwapLogState::default());
            Ok(())
        })
    }

    fn append_event(
        &self,
        swap_hash: SwapHash,
        event: &SwapEvent,
        state: &SwapState,
    ) -> StoreFuture<'_, u64> {
        let event = event.clone();
        let state = state.clone();
        Box::pin(async move {
            let mut logs = self.logs.lock().expect("store lock poisoned");
            let log = logs
                .get_mut(&swap_hash)
                .ok_or_else(|| Error::Storage(format!("No contract for swap {}", swap_hash)))?;
            if log.terminal {
                return Err(Error::Storage(format!(
                    "Swap {} is terminal; no further events accepted",
                    swap_hash
                )));
            }

            let record = EventRecord {
                seq: log.next_seq,
                time: state.last_update,
                event,
                state,
            };
            let mut line = serde_json::to_string(&record)?;
            line.push('\n');

            let path = self.swap_dir(swap_hash).join(EVENTS_FILE);
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| Error::Storage(format!("Failed to open event log: {}", e)))?;
            file.write_all(line.as_bytes())
                .map_err(|e| Error::Storage(format!("Failed to append event: {}", e)))?;
            file.sync_all()
                .map_err(|e| Error::Storage(format!("Failed to sync event log: {}", e)))?;

            log.next_seq += 1;
            Ok(record.seq)
        })
    }

    fn load_all(&self) -> StoreFuture<'_, Vec<StoredSwap>> {
        Box::pin(async move {
            let logs = self.logs.lock().expect("store lock poisoned");
            let mut swaps = Vec::new();

            for (swap_hash, log) in logs.iter() {
                if log.terminal {
                    continue;
                }
                let dir = self.swap_dir(*swap_hash);
                let contract_data = fs::read_to_string(dir.join(CONTRACT_FILE))
                    .map_err(|e| Error::Storage(format!("Failed to read contract: {}", e)))?;
                let contract: Contract = serde_json::from_str(&contract_data)?;
                let events = read_events(&dir.join(EVENTS_FILE))?;
                swaps.push(StoredSwap { contract, events });
            }

            swaps.sort_by_key(|swap| swap.contract.creation_time);
            Ok(swaps)
        })
    }

    fn mark_terminal(&self, swap_hash: SwapHash, outcome: TerminalOutcome) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut logs = self.logs.lock().expect("store lock poisoned");
            let log = logs
                .get_mut(&swap_hash)
                .ok_or_else(|| Error::Storage(format!("No contract for swap {}", swap_hash)))?;
            if log.terminal {
                return Ok(());
            }

            let record = TerminalRecord {
                outcome,
                time: OffsetDateTime::now_utc(),
            };
            write_json_durable(&self.swap_dir(swap_hash).join(TERMINAL_FILE), &record)?;

            log.terminal = true;
            Ok(())
        })
    }
}

fn write_json_durable<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec(value)?;
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| Error::Storage(format!("Failed to create {}: {}", path.display(), e)))?;
    file.write_all(&data)
        .map_err(|e| Error::Storage(format!("Failed to write {}: {}", path.display(), e)))?;
    file.sync_all()
        .map_err(|e| Error::Storage(format!("Failed to sync {}: {}", path.display(), e)))?;
    Ok(())
}

/// Read an event log, discarding a torn final line left by a crash
/// mid-append. Corruption anywhere else is an error.
fn read_events(path: &Path) -> Result<Vec<EventRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let data = fs::read_to_string(path)
        .map_err(|e| Error::Storage(format!("Failed to read event log: {}", e)))?;

    let lines: Vec<&str> = data.lines().filter(|line| !line.is_empty()).collect();
    let mut events = Vec::with_capacity(lines.len());
    for (index, line) in lines.iter().enumerate() {
        match serde_json::from_str::<EventRecord>(line) {
            Ok(record) => events.push(record),
            Err(e) if index == lines.len() - 1 => {
                log::warn!(
                    "Discarding torn final record in {}: {}",
                    path.display(),
                    e
                );
                break;
            }
            Err(e) => {
                return Err(Error::Storage(format!(
                    "Corrupt event log {} at record {}: {}",
                    path.display(),
                    index,
                    e
                )));
            }
        }
    }
    Ok(events)
}

//! Durable log adapter: the consensus engine's log store backed by the
//! write-ahead log and the snapshotter.
//!
//! The in-memory log store serves the engine's reads; every mutation that
//! must survive a crash goes through the WAL or a snapshot file first.

use std::path::{Path, PathBuf};

use raft::eraftpb::{ConfState, Entry, HardState, Snapshot};
use raft::storage::MemStorage;
use raft::{GetEntriesContext, RaftState, Storage};

use crate::error::{Error, Result};
use crate::raft::snap::Snapshotter;
use crate::raft::wal::{Wal, WalError, WalRecovery};

pub struct DurableLog {
    mem: MemStorage,
    wal: Wal,
    snapshotter: Snapshotter,
    /// Newest persisted snapshot. Served to the engine when it needs one
    /// for a slow follower: the in-memory log store does not retain
    /// snapshot payloads.
    latest: Option<Snapshot>,
}

fn wal_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("wal")
}

fn snap_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("snap")
}

impl DurableLog {
    /// Whether a state directory already holds a log.
    pub fn exists(state_dir: &Path) -> bool {
        Wal::exists(&wal_dir(state_dir))
    }

    /// Creates a fresh log. With a non-empty voter set the log store is
    /// seeded with a synthetic snapshot so the engine starts from that
    /// configuration; a joining node passes no voters and waits for the
    /// leader's snapshot instead.
    pub fn bootstrap(state_dir: &Path, metadata: &[u8], voters: Vec<u64>) -> Result<DurableLog> {
        let snapshotter = Snapshotter::new(snap_dir(state_dir))?;
        let wal = Wal::create(&wal_dir(state_dir), metadata)?;

        let mut log = DurableLog {
            mem: MemStorage::new(),
            wal,
            snapshotter,
            latest: None,
        };
        if !voters.is_empty() {
            let mut snapshot = Snapshot::default();
            snapshot.mut_metadata().index = 1;
            snapshot.mut_metadata().term = 1;
            snapshot.mut_metadata().mut_conf_state().voters = voters;
            // Persist the seed snapshot so recovery re-derives the same
            // configuration before replaying the log.
            log.save_snapshot(&snapshot)?;
            log.mem
                .wl()
                .apply_snapshot(snapshot)
                .map_err(|_| Error::ApplySnapshot)?;
        }
        Ok(log)
    }

    /// Reloads durable state. A torn WAL tail is repaired exactly once;
    /// any other failure, or a second one, is fatal. Returns the WAL
    /// metadata blob and the newest snapshot file, which the caller
    /// restores into the memory store.
    pub fn open(state_dir: &Path) -> Result<(DurableLog, Vec<u8>, Option<Snapshot>)> {
        let snapshotter = Snapshotter::new(snap_dir(state_dir))?;
        let snapshot = snapshotter.load()?;
        let walsnap = snapshot
            .as_ref()
            .map(|s| (s.get_metadata().term, s.get_metadata().index));

        let dir = wal_dir(state_dir);
        let (wal, recovered) = match Wal::open(&dir, walsnap) {
            Ok(read) => read,
            Err(WalError::TornTail { segment, offset }) => {
                log::warn!(
                    "wal read failed with torn tail in {} at {}, attempting repair",
                    segment.display(),
                    offset
                );
                if !Wal::repair(&dir)? {
                    return Err(WalError::TornTail { segment, offset }.into());
                }
                log::info!("repaired wal tail, re-reading");
                Wal::open(&dir, walsnap)?
            }
            Err(err) => return Err(err.into()),
        };
        let WalRecovery {
            metadata,
            hard_state,
            entries,
            snapshot: pointer,
        } = recovered;

        // Pointers are recorded only after their snapshot file is durable,
        // so a pointer the snapshot directory cannot satisfy means the
        // directory lost a snapshot. Refuse to start from it.
        if let Some((term, index)) = pointer {
            let newest = snapshot
                .as_ref()
                .map(|s| s.get_metadata().index)
                .unwrap_or(0);
            if newest < index {
                log::error!(
                    "wal points at snapshot (term {}, index {}) but the newest snapshot file is at index {}",
                    term,
                    index,
                    newest
                );
                return Err(Error::ApplySnapshot);
            }
        }

        let mem = MemStorage::new();
        if let Some(snapshot) = &snapshot {
            mem.wl()
                .apply_snapshot(snapshot.clone())
                .map_err(|_| Error::ApplySnapshot)?;
        }
        if let Some(hard_state) = hard_state {
            mem.wl().set_hardstate(hard_state);
        }
        mem.wl().append(&entries).map_err(|_| Error::AppendEntry)?;

        Ok((
            DurableLog {
                mem,
                wal,
                snapshotter,
                latest: snapshot.clone(),
            },
            metadata,
            snapshot,
        ))
    }

    /// Persists a hard-state/entries batch: WAL first, then the log store.
    pub fn save(&mut self, hard_state: Option<&HardState>, entries: &[Entry]) -> Result<()> {
        self.wal.save(hard_state, entries).map_err(|err| {
            log::error!("wal save failed: {}", err);
            if entries.is_empty() {
                Error::SetHardState
            } else {
                Error::AppendEntry
            }
        })?;

        if let Some(hard_state) = hard_state {
            self.mem.wl().set_hardstate(hard_state.clone());
        }
        self.mem
            .wl()
            .append(entries)
            .map_err(|_| Error::AppendEntry)?;
        Ok(())
    }

    /// Persists a snapshot: file first, then the WAL pointer, then the
    /// release of obsolete segments. Recovery cross-checks the pointer
    /// against the snapshot directory, so a crash between the two steps
    /// leaves at worst an unreferenced file, never a dangling pointer.
    pub fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        let meta = snapshot.get_metadata();
        self.snapshotter.save(snapshot).map_err(|err| {
            log::error!("snapshot save failed: {}", err);
            Error::ApplySnapshot
        })?;
        self.wal.save_snapshot(meta.term, meta.index)?;
        self.wal.release_to(meta.index)?;
        self.latest = Some(snapshot.clone());
        Ok(())
    }

    /// Applies a snapshot received from the leader: persist it, then load
    /// it into the log store.
    pub fn apply_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        self.save_snapshot(&snapshot)?;
        self.mem
            .wl()
            .apply_snapshot(snapshot)
            .map_err(|_| Error::ApplySnapshot)?;
        Ok(())
    }

    /// Builds a snapshot of the log store at `applied` carrying the store
    /// payload. Returns None when an equal or newer snapshot exists.
    pub fn create_snapshot(&mut self, applied: u64, data: Vec<u8>) -> Result<Option<Snapshot>> {
        let mut snapshot = match self.mem.snapshot(applied, 0) {
            Ok(snapshot) => snapshot,
            Err(raft::Error::Store(raft::StorageError::SnapshotOutOfDate))
            | Err(raft::Error::Store(raft::StorageError::SnapshotTemporarilyUnavailable)) => {
                return Ok(None)
            }
            Err(err) => return Err(err.into()),
        };
        if snapshot.get_metadata().index < applied {
            return Ok(None);
        }
        snapshot.set_data(data.into());
        Ok(Some(snapshot))
    }

    /// Discards log entries up to `to`, keeping the store bounded.
    pub fn compact(&mut self, to: u64) -> Result<()> {
        if to <= self.mem.first_index()? {
            return Ok(());
        }
        match self.mem.wl().compact(to) {
            Ok(()) => Ok(()),
            Err(raft::Error::Store(raft::StorageError::Compacted)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn set_conf_state(&mut self, conf_state: ConfState) {
        self.mem.wl().set_conf_state(conf_state);
    }

    pub fn set_commit(&mut self, commit: u64) {
        self.mem.wl().mut_hard_state().commit = commit;
    }

    pub fn close(&mut self) -> Result<()> {
        self.wal.close()?;
        Ok(())
    }
}

impl Storage for DurableLog {
    fn initial_state(&self) -> raft::Result<RaftState> {
        self.mem.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        self.mem.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        self.mem.term(idx)
    }

    fn first_index(&self) -> raft::Result<u64> {
        self.mem.first_index()
    }

    fn last_index(&self) -> raft::Result<u64> {
        self.mem.last_index()
    }

    fn snapshot(&self, request_index: u64, to: u64) -> raft::Result<Snapshot> {
        // Prefer the persisted snapshot, which still carries the store
        // payload the in-memory log store drops.
        if let Some(snapshot) = &self.latest {
            if snapshot.get_metadata().index >= request_index {
                return Ok(snapshot.clone());
            }
        }
        self.mem.snapshot(request_index, to)
    }
}

//! Write-ahead log: record-framed segment files.
//!
//! Every record is `[len u32][crc32 u32][payload]` where the payload is a
//! bincode-encoded [`Record`]. Entries and hard states carry the protobuf
//! encoding of their eraftpb types. A segment begins with a metadata record
//! so any single segment identifies its node; rotation carries the latest
//! hard state forward so old segments can be released after a snapshot.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use protobuf::Message as PbMessage;
use raft::eraftpb::{Entry, HardState};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const SEGMENT_MAX_BYTES: u64 = 64 * 1024 * 1024;
const RECORD_HEADER_SIZE: usize = 8;
const MAX_RECORD_BYTES: u32 = 256 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("wal i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wal encoding error: {0}")]
    Encode(#[from] bincode::Error),

    /// Short read at the end of the newest segment. Repairable once.
    #[error("wal torn tail in {segment} at offset {offset}")]
    TornTail { segment: PathBuf, offset: u64 },

    /// Checksum or framing failure anywhere else. Not repairable.
    #[error("wal corruption in {segment} at offset {offset}")]
    Corrupt { segment: PathBuf, offset: u64 },

    #[error("wal has no metadata record")]
    NoMetadata,
}

#[derive(Debug, Serialize, Deserialize)]
enum Record {
    /// Node identity blob, written at the head of every segment.
    Metadata(Vec<u8>),
    /// Protobuf-encoded eraftpb.Entry.
    Entry(Vec<u8>),
    /// Protobuf-encoded eraftpb.HardState.
    HardState(Vec<u8>),
    /// Pointer to a durable snapshot file.
    Snapshot { term: u64, index: u64 },
}

struct SegmentInfo {
    path: PathBuf,
    /// Highest entry index written into this segment.
    max_entry: Option<u64>,
}

/// Everything [`Wal::open`] reads back from the segments.
pub struct WalRecovery {
    pub metadata: Vec<u8>,
    pub hard_state: Option<HardState>,
    pub entries: Vec<Entry>,
    /// Newest snapshot pointer recorded in the log. The file it names
    /// must exist, since pointers are written only after their files.
    pub snapshot: Option<(u64, u64)>,
}

pub struct Wal {
    dir: PathBuf,
    active: File,
    active_seq: u64,
    active_size: u64,
    segments: BTreeMap<u64, SegmentInfo>,
    metadata: Vec<u8>,
    last_hard_state: Option<Vec<u8>>,
}

fn segment_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("segment_{:020}.log", seq))
}

fn segment_seq(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .strip_prefix("segment_")?
        .strip_suffix(".log")?
        .parse()
        .ok()
}

fn list_segments(dir: &Path) -> Result<BTreeMap<u64, PathBuf>, WalError> {
    let mut segments = BTreeMap::new();
    for dirent in fs::read_dir(dir)? {
        let path = dirent?.path();
        if let Some(seq) = segment_seq(&path) {
            segments.insert(seq, path);
        }
    }
    Ok(segments)
}

fn encode_record(record: &Record) -> Result<Vec<u8>, WalError> {
    let payload = bincode::serialize(record)?;
    let mut framed = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
    framed.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    framed.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    framed.extend_from_slice(&payload);
    Ok(framed)
}

enum ReadFailure {
    /// Clean end of segment.
    Eof,
    /// Partial record at the tail.
    Torn,
    /// Framing, checksum or decode failure.
    Corrupt,
}

/// Reads one record, or reports how the segment ends at this offset.
fn read_record(file: &mut File) -> Result<Record, ReadFailure> {
    let mut header = [0u8; RECORD_HEADER_SIZE];
    let mut filled = 0;
    while filled < header.len() {
        match file.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Err(ReadFailure::Eof),
            Ok(0) => return Err(ReadFailure::Torn),
            Ok(n) => filled += n,
            Err(_) => return Err(ReadFailure::Corrupt),
        }
    }

    let len = u32::from_le_bytes(header[..4].try_into().unwrap());
    let crc = u32::from_le_bytes(header[4..].try_into().unwrap());
    if len > MAX_RECORD_BYTES {
        return Err(ReadFailure::Corrupt);
    }

    let mut payload = vec![0u8; len as usize];
    let mut filled = 0;
    while filled < payload.len() {
        match file.read(&mut payload[filled..]) {
            Ok(0) => return Err(ReadFailure::Torn),
            Ok(n) => filled += n,
            Err(_) => return Err(ReadFailure::Corrupt),
        }
    }

    if crc32fast::hash(&payload) != crc {
        return Err(ReadFailure::Corrupt);
    }
    bincode::deserialize(&payload).map_err(|_| ReadFailure::Corrupt)
}

impl Wal {
    /// Whether a write-ahead log already exists under `dir`.
    pub fn exists(dir: &Path) -> bool {
        list_segments(dir).map(|s| !s.is_empty()).unwrap_or(false)
    }

    /// Creates a fresh log with the given metadata blob as its first record.
    pub fn create(dir: &Path, metadata: &[u8]) -> Result<Wal, WalError> {
        fs::create_dir_all(dir)?;
        let path = segment_path(dir, 0);
        let active = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        let mut segments = BTreeMap::new();
        segments.insert(
            0,
            SegmentInfo {
                path,
                max_entry: None,
            },
        );
        let mut wal = Wal {
            dir: dir.to_path_buf(),
            active,
            active_seq: 0,
            active_size: 0,
            segments,
            metadata: metadata.to_vec(),
            last_hard_state: None,
        };
        wal.append_record(&Record::Metadata(metadata.to_vec()))?;
        wal.sync()?;
        Ok(wal)
    }

    /// Opens an existing log positioned after the snapshot at
    /// `snap = (term, index)` and reads it back fully: the metadata blob,
    /// the last hard state, all entries above the snapshot index, and the
    /// newest snapshot pointer on record.
    pub fn open(dir: &Path, snap: Option<(u64, u64)>) -> Result<(Wal, WalRecovery), WalError> {
        let listed = list_segments(dir)?;
        if listed.is_empty() {
            return Err(WalError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no wal segments",
            )));
        }
        let last_seq = *listed.keys().next_back().unwrap();

        let mut metadata: Option<Vec<u8>> = None;
        let mut hard_state_bytes: Option<Vec<u8>> = None;
        let mut entries: Vec<Entry> = Vec::new();
        let mut snapshot_pointer: Option<(u64, u64)> = None;
        let mut segments = BTreeMap::new();
        let mut active_size = 0;

        for (&seq, path) in &listed {
            let mut file = File::open(path)?;
            let mut offset = 0u64;
            let mut max_entry = None;
            loop {
                match read_record(&mut file) {
                    Ok(record) => {
                        offset = file.stream_position()?;
                        match record {
                            Record::Metadata(blob) => {
                                metadata.get_or_insert(blob);
                            }
                            Record::Entry(bytes) => {
                                let mut entry = Entry::default();
                                entry.merge_from_bytes(&bytes).map_err(|_| {
                                    WalError::Corrupt {
                                        segment: path.clone(),
                                        offset,
                                    }
                                })?;
                                max_entry = Some(entry.index);
                                // A conflicting append rewrites the tail.
                                while entries.last().map_or(false, |last| last.index >= entry.index)
                                {
                                    entries.pop();
                                }
                                entries.push(entry);
                            }
                            Record::HardState(bytes) => {
                                hard_state_bytes = Some(bytes);
                            }
                            Record::Snapshot { term, index } => {
                                snapshot_pointer = Some((term, index));
                            }
                        }
                    }
                    Err(ReadFailure::Eof) => break,
                    Err(ReadFailure::Torn) if seq == last_seq => {
                        return Err(WalError::TornTail {
                            segment: path.clone(),
                            offset,
                        });
                    }
                    Err(_) => {
                        return Err(WalError::Corrupt {
                            segment: path.clone(),
                            offset,
                        });
                    }
                }
            }
            if seq == last_seq {
                active_size = offset;
            }
            segments.insert(
                seq,
                SegmentInfo {
                    path: path.clone(),
                    max_entry,
                },
            );
        }

        let metadata = metadata.ok_or(WalError::NoMetadata)?;

        let hard_state = match &hard_state_bytes {
            Some(bytes) => {
                let mut hs = HardState::default();
                hs.merge_from_bytes(bytes).map_err(|_| WalError::Corrupt {
                    segment: segment_path(dir, last_seq),
                    offset: 0,
                })?;
                Some(hs)
            }
            None => None,
        };

        if let Some((_, index)) = snap {
            entries.retain(|entry| entry.index > index);
        }

        let active = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&segments[&last_seq].path)?;
        let mut wal = Wal {
            dir: dir.to_path_buf(),
            active,
            active_seq: last_seq,
            active_size,
            segments,
            metadata: metadata.clone(),
            last_hard_state: hard_state_bytes,
        };
        wal.active.seek(SeekFrom::End(0))?;
        Ok((
            wal,
            WalRecovery {
                metadata,
                hard_state,
                entries,
                snapshot: snapshot_pointer,
            },
        ))
    }

    fn append_record(&mut self, record: &Record) -> Result<(), WalError> {
        let framed = encode_record(record)?;
        self.active.write_all(&framed)?;
        self.active_size += framed.len() as u64;
        Ok(())
    }

    fn sync(&mut self) -> Result<(), WalError> {
        self.active.sync_data()?;
        Ok(())
    }

    /// Durably appends a hard-state/entries batch. The batch is recoverable
    /// once this returns.
    pub fn save(&mut self, hard_state: Option<&HardState>, entries: &[Entry]) -> Result<(), WalError> {
        if hard_state.is_none() && entries.is_empty() {
            return Ok(());
        }

        for entry in entries {
            let bytes = entry
                .write_to_bytes()
                .map_err(|e| WalError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
            self.append_record(&Record::Entry(bytes))?;
            if let Some(info) = self.segments.get_mut(&self.active_seq) {
                info.max_entry = Some(entry.index);
            }
        }
        if let Some(hs) = hard_state {
            let bytes = hs
                .write_to_bytes()
                .map_err(|e| WalError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
            self.append_record(&Record::HardState(bytes.clone()))?;
            self.last_hard_state = Some(bytes);
        }
        self.sync()?;

        if self.active_size >= SEGMENT_MAX_BYTES {
            self.cut()?;
        }
        Ok(())
    }

    /// Records a pointer to a durable snapshot file. Written only after the
    /// snapshot file itself is on disk, so recovery never chases a missing
    /// file.
    pub fn save_snapshot(&mut self, term: u64, index: u64) -> Result<(), WalError> {
        self.append_record(&Record::Snapshot { term, index })?;
        self.sync()
    }

    /// Starts a new segment, carrying metadata and the latest hard state
    /// forward.
    pub(crate) fn cut(&mut self) -> Result<(), WalError> {
        self.sync()?;
        let seq = self.active_seq + 1;
        let path = segment_path(&self.dir, seq);
        self.active = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        self.active_seq = seq;
        self.active_size = 0;
        self.segments.insert(
            seq,
            SegmentInfo {
                path,
                max_entry: None,
            },
        );
        let metadata = Record::Metadata(self.metadata.clone());
        self.append_record(&metadata)?;
        if let Some(bytes) = self.last_hard_state.clone() {
            self.append_record(&Record::HardState(bytes))?;
        }
        self.sync()
    }

    /// Deletes segments made obsolete by a snapshot at `index`.
    pub fn release_to(&mut self, index: u64) -> Result<(), WalError> {
        let releasable: Vec<u64> = self
            .segments
            .iter()
            .filter(|(&seq, info)| {
                seq != self.active_seq && info.max_entry.unwrap_or(0) <= index
            })
            .map(|(&seq, _)| seq)
            .collect();
        for seq in releasable {
            if let Some(info) = self.segments.remove(&seq) {
                fs::remove_file(&info.path)?;
            }
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), WalError> {
        self.sync()
    }

    /// Attempts to repair a torn tail by truncating the newest segment at
    /// its last complete record. Returns false when the damage is not a
    /// torn tail (checksum or framing corruption), which is unrepairable.
    pub fn repair(dir: &Path) -> Result<bool, WalError> {
        let listed = list_segments(dir)?;
        let (_, path) = match listed.iter().next_back() {
            Some((&seq, path)) => (seq, path.clone()),
            None => return Ok(false),
        };

        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mut valid_end = 0u64;
        loop {
            match read_record(&mut file) {
                Ok(_) => valid_end = file.stream_position()?,
                Err(ReadFailure::Eof) => return Ok(true),
                Err(ReadFailure::Torn) => {
                    log::info!(
                        "repairing torn wal tail in {} at offset {}",
                        path.display(),
                        valid_end
                    );
                    file.set_len(valid_end)?;
                    file.sync_all()?;
                    return Ok(true);
                }
                Err(ReadFailure::Corrupt) => return Ok(false),
            }
        }
    }
}

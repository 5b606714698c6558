//! Snapshot files, one per captured (term, index).

use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

use protobuf::Message as PbMessage;
use raft::eraftpb::Snapshot;

use crate::error::Result;

const SNAP_SUFFIX: &str = ".snap";

pub struct Snapshotter {
    dir: PathBuf,
}

fn snap_name(term: u64, index: u64) -> String {
    format!("{:016x}-{:016x}{}", term, index, SNAP_SUFFIX)
}

fn parse_snap_name(name: &str) -> Option<(u64, u64)> {
    let stem = name.strip_suffix(SNAP_SUFFIX)?;
    let (term, index) = stem.split_once('-')?;
    Some((
        u64::from_str_radix(term, 16).ok()?,
        u64::from_str_radix(index, 16).ok()?,
    ))
}

impl Snapshotter {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Snapshotter { dir })
    }

    /// Writes the snapshot to a temporary file and renames it into place,
    /// so a partially-written snapshot is never visible under its final
    /// name.
    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let meta = snapshot.get_metadata();
        let path = self.dir.join(snap_name(meta.term, meta.index));
        let tmp_path = self.dir.join("snapshot.tmp");

        let data = snapshot.write_to_bytes()?;
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(&data)?;
        tmp.sync_all()?;
        drop(tmp);

        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// Loads the newest snapshot, or None when the directory holds no
    /// usable snapshot.
    pub fn load(&self) -> Result<Option<Snapshot>> {
        let mut found: Vec<(u64, u64, PathBuf)> = Vec::new();
        for dirent in fs::read_dir(&self.dir)? {
            let path = dirent?.path();
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if let Some((term, index)) = parse_snap_name(name) {
                    found.push((term, index, path));
                }
            }
        }
        found.sort();

        // Newest first; skip anything unreadable.
        for (_, _, path) in found.iter().rev() {
            let data = match fs::read(path) {
                Ok(data) => data,
                Err(err) => {
                    log::warn!("skipping unreadable snapshot {}: {}", path.display(), err);
                    continue;
                }
            };
            let mut snapshot = Snapshot::default();
            match snapshot.merge_from_bytes(&data) {
                Ok(()) => return Ok(Some(snapshot)),
                Err(err) => {
                    log::warn!("skipping corrupt snapshot {}: {}", path.display(), err);
                }
            }
        }
        Ok(None)
    }

    /// Number of snapshot files currently on disk.
    pub fn count(&self) -> Result<usize> {
        let mut count = 0;
        for dirent in fs::read_dir(&self.dir)? {
            let path = dirent?.path();
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(parse_snap_name)
                .is_some()
            {
                count += 1;
            }
        }
        Ok(count)
    }
}

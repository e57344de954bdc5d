//! Point-in-time snapshots for fast cold starts.
//!
//! A snapshot file is `dump-<unix seconds>.rdb` in the directory of the
//! configured path, written to a `.tmp` sibling first and atomically
//! renamed into place. The payload is a framed bincode encoding:
//!
//! ```text
//! [magic "EKVS"][version u8][payload len u64 le][bincode records][crc32 le]
//! ```
//!
//! The CRC covers the payload, so a torn or bit-flipped file is rejected
//! at load time instead of silently producing garbage.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{KvError, Result};

use super::engine::{now_unix, PersistRecord};

const MAGIC: &[u8; 4] = b"EKVS";
const VERSION: u8 = 1;
/// magic + version + payload length
const HEADER_LEN: usize = 4 + 1 + 8;

/// Writes and discovers full-state dump files.
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    /// Serializes `records` into a freshly named dump file and returns its
    /// final path.
    pub fn save(&self, records: &[PersistRecord]) -> Result<PathBuf> {
        fs::create_dir_all(self.dir())?;
        let name = format!("dump-{}.rdb", now_unix());
        self.save_as(&name, records)
    }

    fn save_as(&self, name: &str, records: &[PersistRecord]) -> Result<PathBuf> {
        let final_path = self.dir().join(name);
        let tmp_path = final_path.with_extension("rdb.tmp");

        let payload =
            bincode::serialize(records).map_err(|e| KvError::Internal(e.to_string()))?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        let mut file = File::create(&tmp_path)?;
        file.write_all(MAGIC)?;
        file.write_all(&[VERSION])?;
        file.write_all(&(payload.len() as u64).to_le_bytes())?;
        file.write_all(&payload)?;
        file.write_all(&crc.to_le_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, &final_path)?;
        debug!(path = %final_path.display(), records = records.len(), "snapshot written");
        Ok(final_path)
    }

    /// Finds the newest `dump-*.rdb` in the snapshot directory (falling
    /// back to the literal configured path) and decodes it. Returns `None`
    /// when no snapshot exists.
    pub fn load_latest(&self) -> Result<Option<(Vec<PersistRecord>, PathBuf)>> {
        let mut candidates: Vec<PathBuf> = Vec::new();
        match fs::read_dir(self.dir()) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let name = entry.file_name();
                    let name = name.to_string_lossy();
                    if name.starts_with("dump-") && name.ends_with(".rdb") {
                        candidates.push(entry.path());
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        }

        if candidates.is_empty() && self.path.is_file() {
            candidates.push(self.path.clone());
        }
        if candidates.is_empty() {
            return Ok(None);
        }

        // dump file names embed the unix timestamp, so the lexicographic
        // maximum is the newest
        candidates.sort();
        let Some(latest) = candidates.pop() else {
            return Ok(None);
        };
        let records = load_file(&latest)?;
        info!(path = %latest.display(), records = records.len(), "snapshot loaded");
        Ok(Some((records, latest)))
    }
}

fn load_file(path: &Path) -> Result<Vec<PersistRecord>> {
    let data = fs::read(path)?;
    if data.len() < HEADER_LEN + 4 || &data[..4] != MAGIC {
        return Err(KvError::Internal(format!(
            "bad snapshot header in {}",
            path.display()
        )));
    }
    let version = data[4];
    if version != VERSION {
        return Err(KvError::Internal(format!(
            "unsupported snapshot version {version}"
        )));
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&data[5..13]);
    let payload_len = u64::from_le_bytes(len_bytes) as usize;
    if data.len() != HEADER_LEN + payload_len + 4 {
        return Err(KvError::Internal(format!(
            "snapshot {} is truncated",
            path.display()
        )));
    }
    let payload = &data[HEADER_LEN..HEADER_LEN + payload_len];

    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&data[HEADER_LEN + payload_len..]);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    if hasher.finalize() != u32::from_le_bytes(crc_bytes) {
        return Err(KvError::Internal(format!(
            "snapshot {} failed checksum",
            path.display()
        )));
    }

    bincode::deserialize(payload).map_err(|e| KvError::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn record(key: &str, value: &str, expires_at: i64) -> PersistRecord {
        PersistRecord {
            key: key.to_string(),
            value: Bytes::from(value.to_string()),
            expires_at,
        }
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path().join("dump.rdb"));
        let records = vec![record("a", "1", 0), record("b", "2", 9_999_999_999)];

        let path = store.save(&records).unwrap();
        assert!(path.file_name().unwrap().to_string_lossy().ends_with(".rdb"));

        let (loaded, loaded_path) = store.load_latest().unwrap().unwrap();
        assert_eq!(loaded_path, path);
        let mut loaded = loaded;
        loaded.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(loaded, records);
    }

    #[test]
    fn empty_directory_loads_nothing() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path().join("dump.rdb"));
        assert!(store.load_latest().unwrap().is_none());
    }

    #[test]
    fn missing_directory_loads_nothing() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path().join("absent").join("dump.rdb"));
        assert!(store.load_latest().unwrap().is_none());
    }

    #[test]
    fn newest_dump_wins() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path().join("dump.rdb"));
        store
            .save_as("dump-1000000001.rdb", &[record("k", "old", 0)])
            .unwrap();
        store
            .save_as("dump-1000000002.rdb", &[record("k", "new", 0)])
            .unwrap();

        let (records, path) = store.load_latest().unwrap().unwrap();
        assert!(path.ends_with("dump-1000000002.rdb"));
        assert_eq!(records[0].value, Bytes::from("new"));
    }

    #[test]
    fn tmp_files_are_not_discovered() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path().join("dump.rdb"));
        fs::write(dir.path().join("dump-9999999999.rdb.tmp"), b"junk").unwrap();
        assert!(store.load_latest().unwrap().is_none());
    }

    #[test]
    fn corrupt_snapshot_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path().join("dump.rdb"));
        let path = store.save(&[record("k", "v", 0)]).unwrap();

        // flip one payload byte
        let mut bytes = fs::read(&path).unwrap();
        let middle = HEADER_LEN + 2;
        bytes[middle] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        assert!(store.load_latest().is_err());
    }

    #[test]
    fn garbage_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path().join("dump.rdb"));
        fs::write(dir.path().join("dump-1234567890.rdb"), b"not a snapshot").unwrap();
        assert!(store.load_latest().is_err());
    }

    #[test]
    fn falls_back_to_configured_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("legacy.rdb");
        let store = SnapshotStore::new(&path);
        // a valid snapshot at the literal path, not dump-*.rdb
        let written = store.save_as("legacy.rdb", &[record("k", "v", 0)]).unwrap();
        assert_eq!(written, path);

        let (records, found) = store.load_latest().unwrap().unwrap();
        assert_eq!(found, path);
        assert_eq!(records[0].key, "k");
    }
}

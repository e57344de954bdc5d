//! Append-only log persistence.
//!
//! Every acknowledged write is recorded as one tab-separated text line:
//!
//! ```text
//! SET\t<key>\t<base64 value>\t<expires_at unix seconds>\n
//! DEL\t<key>\n
//! ```
//!
//! Keys are stored verbatim; values travel base64 encoded so a line never
//! contains a stray tab or newline. `expires_at` of `0` means no expiry.
//!
//! ## Replay
//!
//! On startup the log is scanned line by line into a last-write-wins map.
//! The first line that fails to parse (wrong field count, bad base64,
//! non-numeric timestamp, unknown verb, or a final line missing its
//! newline) marks a corrupt tail: the file is truncated back to the end of
//! the last good line and the records accumulated up to that point are
//! returned for restoration.
//!
//! ## Rewrite
//!
//! Once the file reaches the configured threshold the log is compacted
//! online: a temp file receives one `SET` line per live entry while an
//! incremental buffer captures every append that lands during the
//! rewrite. The buffer is drained into the temp file and the rename and
//! reopen happen under the log lock, so an acknowledged append is never
//! absent from the new file. Appends are not fsync'd individually; the
//! file is synced on explicit request, after a rewrite and at shutdown.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use tracing::{info, warn};

use crate::error::Result;

use super::engine::PersistRecord;

/// Single-writer append log with online compaction.
pub struct AppendLog {
    path: PathBuf,
    rewrite_threshold: u64,
    inner: Mutex<LogInner>,
}

#[derive(Default)]
struct LogInner {
    file: Option<File>,
    rewriting: bool,
    /// Lines appended while a rewrite is in flight; drained into the new
    /// file before it replaces the log.
    rewrite_buf: Vec<u8>,
}

enum ParsedOp {
    Set(PersistRecord),
    Del(String),
}

impl AppendLog {
    pub fn new(path: impl Into<PathBuf>, rewrite_threshold: u64) -> Self {
        Self {
            path: path.into(),
            rewrite_threshold,
            inner: Mutex::new(LogInner::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens (creating if needed) the log, replays it, truncates any
    /// corrupt tail, and leaves the handle positioned for appends.
    ///
    /// Returns the live records accumulated before the first malformed
    /// line, last write winning per key and deletes removing entries.
    pub fn open_and_replay(&self) -> Result<Vec<PersistRecord>> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.path)?;

        let (records, good_offset, malformed) = parse_log(&mut file)?;
        if let Some(reason) = malformed {
            warn!(
                path = %self.path.display(),
                offset = good_offset,
                reason = %reason,
                "corrupt tail in append log, truncating"
            );
            file.set_len(good_offset)?;
        }
        file.seek(SeekFrom::End(0))?;

        let mut inner = self.inner.lock().unwrap();
        inner.file = Some(file);
        Ok(records)
    }

    pub fn append_set(&self, key: &str, value: &[u8], expires_at: i64) -> Result<()> {
        let line = format!("SET\t{}\t{}\t{}\n", key, BASE64.encode(value), expires_at);
        self.append(line.as_bytes())
    }

    pub fn append_del(&self, key: &str) -> Result<()> {
        let line = format!("DEL\t{key}\n");
        self.append(line.as_bytes())
    }

    fn append(&self, buf: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let LogInner {
            file,
            rewriting,
            rewrite_buf,
        } = &mut *inner;
        let Some(file) = file.as_mut() else {
            return Ok(());
        };
        file.write_all(buf)?;
        if *rewriting {
            rewrite_buf.extend_from_slice(buf);
        }
        Ok(())
    }

    /// Whether the file has reached the rewrite threshold and no rewrite
    /// is already running.
    pub fn needs_rewrite(&self) -> bool {
        if self.rewrite_threshold == 0 {
            return false;
        }
        let inner = self.inner.lock().unwrap();
        if inner.rewriting {
            return false;
        }
        let Some(file) = inner.file.as_ref() else {
            return false;
        };
        file.metadata()
            .map(|m| m.len() >= self.rewrite_threshold)
            .unwrap_or(false)
    }

    /// Compacts the log to one `SET` line per record in `records`, plus
    /// whatever lands in the incremental buffer while the temp file is
    /// being written. On any failure the original log stays canonical and
    /// a later trigger retries.
    pub fn rewrite(&self, records: &[PersistRecord]) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.file.is_none() || inner.rewriting {
                return Ok(());
            }
            inner.rewriting = true;
            inner.rewrite_buf.clear();
        }

        let tmp_path = PathBuf::from(format!("{}.rewrite.tmp", self.path.display()));
        match self.rewrite_into(&tmp_path, records) {
            Ok(()) => {
                info!(path = %self.path.display(), records = records.len(), "append log rewritten");
                Ok(())
            }
            Err(err) => {
                let _ = fs::remove_file(&tmp_path);
                let mut inner = self.inner.lock().unwrap();
                inner.rewriting = false;
                inner.rewrite_buf.clear();
                warn!(error = %err, "append log rewrite failed, original log kept");
                Err(err)
            }
        }
    }

    fn rewrite_into(&self, tmp_path: &Path, records: &[PersistRecord]) -> Result<()> {
        let mut tmp = File::create(tmp_path)?;
        {
            let mut writer = BufWriter::new(&mut tmp);
            for record in records {
                let line = format!(
                    "SET\t{}\t{}\t{}\n",
                    record.key,
                    BASE64.encode(&record.value),
                    record.expires_at
                );
                writer.write_all(line.as_bytes())?;
            }
            writer.flush()?;
        }

        // From buffer drain to reopen the lock stays held, so no append
        // can slip in after the buffer is copied but before the swap.
        let mut inner = self.inner.lock().unwrap();
        tmp.write_all(&inner.rewrite_buf)?;
        tmp.sync_all()?;
        drop(tmp);
        fs::rename(tmp_path, &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        inner.file = Some(file);
        inner.rewrite_buf.clear();
        inner.rewriting = false;
        Ok(())
    }

    /// Flushes the file to stable storage.
    pub fn sync(&self) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        if let Some(file) = inner.file.as_ref() {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Releases the file handle. Further appends become no-ops.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(file) = inner.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Current file size in bytes.
    pub fn size(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner
            .file
            .as_ref()
            .and_then(|f| f.metadata().ok())
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

/// Scans the whole file. Returns the accumulated live records, the byte
/// offset just past the last well-formed line, and the parse failure (if
/// any) that ended the scan.
fn parse_log(file: &mut File) -> Result<(Vec<PersistRecord>, u64, Option<String>)> {
    file.seek(SeekFrom::Start(0))?;
    let mut reader = BufReader::new(file);
    let mut live: HashMap<String, PersistRecord> = HashMap::new();
    let mut offset: u64 = 0;
    let mut buf: Vec<u8> = Vec::new();

    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            break;
        }
        if buf.last() != Some(&b'\n') {
            let records = live.into_values().collect();
            return Ok((records, offset, Some("unterminated final line".to_string())));
        }
        let line = &buf[..buf.len() - 1];
        if !line.is_empty() {
            match parse_line(line) {
                Ok(ParsedOp::Set(record)) => {
                    live.insert(record.key.clone(), record);
                }
                Ok(ParsedOp::Del(key)) => {
                    live.remove(&key);
                }
                Err(reason) => {
                    let records = live.into_values().collect();
                    return Ok((records, offset, Some(reason)));
                }
            }
        }
        offset += n as u64;
    }

    Ok((live.into_values().collect(), offset, None))
}

fn parse_line(line: &[u8]) -> std::result::Result<ParsedOp, String> {
    let text = std::str::from_utf8(line).map_err(|_| "non-utf8 line".to_string())?;
    let fields: Vec<&str> = text.split('\t').collect();
    match fields.first().copied() {
        Some("SET") => {
            if fields.len() != 4 {
                return Err(format!("set line has {} fields", fields.len()));
            }
            let value = BASE64
                .decode(fields[2])
                .map_err(|_| "set line value is not base64".to_string())?;
            let expires_at: i64 = fields[3]
                .parse()
                .map_err(|_| "set line timestamp is not numeric".to_string())?;
            Ok(ParsedOp::Set(PersistRecord {
                key: fields[1].to_string(),
                value: Bytes::from(value),
                expires_at,
            }))
        }
        Some("DEL") => {
            if fields.len() != 2 {
                return Err(format!("del line has {} fields", fields.len()));
            }
            Ok(ParsedOp::Del(fields[1].to_string()))
        }
        Some(verb) => Err(format!("unknown verb: {verb}")),
        None => Err("empty line".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn log_in(dir: &TempDir) -> AppendLog {
        AppendLog::new(dir.path().join("appendonly.aof"), 0)
    }

    fn records_by_key(records: Vec<PersistRecord>) -> HashMap<String, PersistRecord> {
        records.into_iter().map(|r| (r.key.clone(), r)).collect()
    }

    #[test]
    fn append_and_replay() {
        let dir = TempDir::new().unwrap();
        let log = log_in(&dir);
        assert!(log.open_and_replay().unwrap().is_empty());
        log.append_set("a", b"v1", 0).unwrap();
        log.append_set("b", b"v2", 12345).unwrap();
        log.append_del("a").unwrap();
        log.close().unwrap();

        let log = log_in(&dir);
        let records = records_by_key(log.open_and_replay().unwrap());
        assert_eq!(records.len(), 1);
        assert_eq!(records["b"].value, Bytes::from("v2"));
        assert_eq!(records["b"].expires_at, 12345);
    }

    #[test]
    fn replay_is_last_write_wins() {
        let dir = TempDir::new().unwrap();
        let log = log_in(&dir);
        log.open_and_replay().unwrap();
        log.append_set("k", b"old", 0).unwrap();
        log.append_set("k", b"new", 0).unwrap();
        log.close().unwrap();

        let log = log_in(&dir);
        let records = log.open_and_replay().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value, Bytes::from("new"));
    }

    #[test]
    fn corrupt_tail_is_truncated_and_prefix_recovered() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("appendonly.aof");
        fs::write(&path, "SET\tk1\tdjE=\t0\nBROKEN\tline\nSET\tk2\tdjI=\t0\n").unwrap();

        let log = AppendLog::new(&path, 0);
        let records = log.open_and_replay().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, "k1");
        assert_eq!(records[0].value, Bytes::from("v1"));
        log.close().unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(!content.contains("BROKEN"));
        assert_eq!(content, "SET\tk1\tdjE=\t0\n");
    }

    #[test]
    fn arbitrary_garbage_tail_keeps_good_prefix() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("appendonly.aof");
        let mut bytes = b"SET\ta\tdjE=\t0\nDEL\tb\n".to_vec();
        bytes.extend_from_slice(&[0xff, 0x00, 0x9c, b'\n', b'S']);
        fs::write(&path, &bytes).unwrap();

        let log = AppendLog::new(&path, 0);
        let records = log.open_and_replay().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, "a");

        let content = fs::read(&path).unwrap();
        assert_eq!(content, b"SET\ta\tdjE=\t0\nDEL\tb\n");
    }

    #[test]
    fn unterminated_final_line_is_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("appendonly.aof");
        fs::write(&path, "SET\ta\tdjE=\t0\nSET\tb\tdjI=").unwrap();

        let log = AppendLog::new(&path, 0);
        let records = log.open_and_replay().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, "a");
        assert_eq!(fs::read_to_string(&path).unwrap(), "SET\ta\tdjE=\t0\n");
    }

    #[test]
    fn bad_base64_and_bad_timestamp_truncate() {
        for tail in ["SET\tk\tnot base64!\t0\n", "SET\tk\tdjE=\tsoon\n"] {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("appendonly.aof");
            fs::write(&path, format!("SET\ta\tdjE=\t0\n{tail}")).unwrap();

            let log = AppendLog::new(&path, 0);
            let records = log.open_and_replay().unwrap();
            assert_eq!(records.len(), 1, "tail: {tail:?}");
            assert_eq!(fs::read_to_string(&path).unwrap(), "SET\ta\tdjE=\t0\n");
        }
    }

    #[test]
    fn rewrite_compacts_to_live_sets_only() {
        let dir = TempDir::new().unwrap();
        let log = log_in(&dir);
        log.open_and_replay().unwrap();
        for i in 0..50 {
            log.append_set("hot", format!("v{i}").as_bytes(), 0).unwrap();
        }
        log.append_set("cold", b"x", 0).unwrap();
        log.append_del("cold").unwrap();
        let before = log.size();

        let live = vec![PersistRecord {
            key: "hot".to_string(),
            value: Bytes::from("v49"),
            expires_at: 0,
        }];
        log.rewrite(&live).unwrap();

        let after = log.size();
        assert!(after < before);
        let content = fs::read_to_string(log.path()).unwrap();
        assert_eq!(content.matches("SET\t").count(), 1);
        assert!(!content.contains("DEL\t"));
        assert!(content.contains("SET\thot\t"));
    }

    #[test]
    fn appends_after_rewrite_land_in_new_file() {
        let dir = TempDir::new().unwrap();
        let log = log_in(&dir);
        log.open_and_replay().unwrap();
        log.append_set("a", b"1", 0).unwrap();
        log.rewrite(&[PersistRecord {
            key: "a".to_string(),
            value: Bytes::from("1"),
            expires_at: 0,
        }])
        .unwrap();
        log.append_set("b", b"2", 0).unwrap();
        log.close().unwrap();

        let log = log_in(&dir);
        let records = records_by_key(log.open_and_replay().unwrap());
        assert_eq!(records.len(), 2);
        assert_eq!(records["b"].value, Bytes::from("2"));
    }

    #[test]
    fn needs_rewrite_respects_threshold() {
        let dir = TempDir::new().unwrap();
        let log = AppendLog::new(dir.path().join("appendonly.aof"), 64);
        log.open_and_replay().unwrap();
        assert!(!log.needs_rewrite());
        for _ in 0..10 {
            log.append_set("key", b"some value", 0).unwrap();
        }
        assert!(log.needs_rewrite());
    }

    #[test]
    fn append_without_open_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let log = log_in(&dir);
        log.append_set("k", b"v", 0).unwrap();
        assert_eq!(log.size(), 0);
    }
}

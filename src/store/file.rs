//! File-backed adapter.
//!
//! Layout under the root directory:
//!
//! ```text
//! streams/<subject>.jsonl   one EventRecord per line, append-only
//! indexes/<key>.json        {member: score}
//! kv/<key>.json             {value, expires_at}
//! ```
//!
//! Names are encoded so any subject or key maps to one flat file name.
//! Mutations are serialized through one lock, which also caches each stream's
//! line offsets. Reads take it only to look those up and read the file
//! outside it. Notification is in-process only.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, broadcast};
use tracing::debug;

use super::memory::MemoryTransport;
use super::{Notice, StoreAdapter, Transport};
use crate::error::{Error, Result};
use crate::model::event::{
    Direction, EventRecord, IndexEntry, IndexRange, NewEvent, ReadOptions, sort_entries,
};

#[derive(Debug, Serialize, Deserialize)]
struct KvFile {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

impl KvFile {
    fn new(value: Value, ttl: Option<Duration>) -> Result<Self> {
        let expires_at = match ttl {
            Some(ttl) => Some(
                Utc::now()
                    + chrono::Duration::from_std(ttl)
                        .map_err(|e| Error::Validation(format!("ttl out of range: {e}")))?,
            ),
            None => None,
        };
        Ok(Self { value, expires_at })
    }

    fn is_live(&self) -> bool {
        self.expires_at.is_none_or(|at| at > Utc::now())
    }
}

/// Where each record of one stream file starts.
#[derive(Debug, Default)]
struct StreamMeta {
    /// `offsets[i]` is the first byte of the line holding id `i + 1`.
    offsets: Vec<u64>,
    /// One past the last complete line.
    end: u64,
}

impl StreamMeta {
    fn scan(bytes: &[u8]) -> Self {
        let mut meta = Self::default();
        let mut start = 0;
        while let Some(newline) = bytes[start..].iter().position(|b| *b == b'\n') {
            let line = &bytes[start..start + newline];
            if !line.iter().all(u8::is_ascii_whitespace) {
                meta.offsets.push(start as u64);
            }
            start += newline + 1;
            meta.end = start as u64;
        }
        meta
    }

    fn len(&self) -> usize {
        self.offsets.len()
    }

    /// Byte range covering the records at positions `first..=last`.
    fn bytes_of(&self, first: usize, last: usize) -> (u64, u64) {
        let end = self.offsets.get(last + 1).copied().unwrap_or(self.end);
        (self.offsets[first], end)
    }
}

pub struct FileStore {
    root: PathBuf,
    /// Serializes mutations. Caches per-subject line offsets, filled lazily
    /// from disk on first touch.
    io: Mutex<HashMap<String, StreamMeta>>,
    notices: broadcast::Sender<Notice>,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in ["streams", "indexes", "kv"] {
            fs::create_dir_all(root.join(dir)).await?;
        }
        debug!(root = %root.display(), "file store opened");
        let (notices, _) = broadcast::channel(1024);
        Ok(Self {
            root,
            io: Mutex::new(HashMap::new()),
            notices,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn stream_path(&self, subject: &str) -> PathBuf {
        self.root
            .join("streams")
            .join(format!("{}.jsonl", encode_name(subject)))
    }

    fn index_path(&self, key: &str) -> PathBuf {
        self.root
            .join("indexes")
            .join(format!("{}.json", encode_name(key)))
    }

    fn kv_path(&self, key: &str) -> PathBuf {
        self.root.join("kv").join(format!("{}.json", encode_name(key)))
    }

    /// Offsets of `subject`, scanning its file on first use. A torn final
    /// line left by an interrupted append is cut off.
    async fn stream_meta<'a>(
        &self,
        streams: &'a mut HashMap<String, StreamMeta>,
        subject: &str,
    ) -> Result<&'a mut StreamMeta> {
        if !streams.contains_key(subject) {
            let path = self.stream_path(subject);
            let meta = match fs::read(&path).await {
                Ok(bytes) => {
                    let meta = StreamMeta::scan(&bytes);
                    if meta.end < bytes.len() as u64 {
                        debug!(subject, torn = bytes.len() as u64 - meta.end, "truncating torn stream tail");
                        fs::OpenOptions::new()
                            .write(true)
                            .open(&path)
                            .await?
                            .set_len(meta.end)
                            .await?;
                    }
                    meta
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => StreamMeta::default(),
                Err(e) => return Err(e.into()),
            };
            streams.insert(subject.to_string(), meta);
        }
        Ok(streams.entry(subject.to_string()).or_default())
    }

    async fn load_index(&self, key: &str) -> Result<HashMap<String, f64>> {
        match fs::read(self.index_path(key)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_kv(&self, key: &str) -> Result<Option<KvFile>> {
        let path = self.kv_path(key);
        let entry: KvFile = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if entry.is_live() {
            Ok(Some(entry))
        } else {
            remove_if_exists(&path).await?;
            Ok(None)
        }
    }

    async fn store_kv(&self, key: &str, entry: &KvFile) -> Result<()> {
        write_atomic(&self.kv_path(key), &serde_json::to_vec(entry)?).await
    }
}

#[async_trait]
impl StoreAdapter for FileStore {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn health_check(&self) -> Result<()> {
        fs::metadata(&self.root)
            .await
            .map(|_| ())
            .map_err(|e| Error::AdapterUnavailable(format!("{}: {e}", self.root.display())))
    }

    async fn append(&self, subject: &str, event: NewEvent) -> Result<EventRecord> {
        let mut streams = self.io.lock().await;
        let meta = self.stream_meta(&mut streams, subject).await?;
        let record = event.into_record(subject, meta.len() as u64 + 1);

        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.stream_path(subject))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;

        meta.offsets.push(meta.end);
        meta.end += line.len() as u64;
        drop(streams);

        let _ = self.notices.send(Notice {
            subject: subject.to_string(),
            id: record.id,
        });
        Ok(record)
    }

    async fn read(&self, subject: &str, opts: &ReadOptions) -> Result<Vec<EventRecord>> {
        let (start, end) = {
            let mut streams = self.io.lock().await;
            let meta = self.stream_meta(&mut streams, subject).await?;
            let span = opts.span(meta.len());
            if span.is_empty() {
                return Ok(Vec::new());
            }
            meta.bytes_of(span.start, span.end - 1)
        };
        // Lines before `end` are complete and never rewritten, so appends
        // may proceed while we read.
        let bytes = read_range(&self.stream_path(subject), start, end).await?;
        let mut records = bytes
            .split(|b| *b == b'\n')
            .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
            .map(|line| serde_json::from_slice(line).map_err(Error::from))
            .collect::<Result<Vec<EventRecord>>>()?;
        if opts.direction == Direction::Backward {
            records.reverse();
        }
        Ok(records)
    }

    async fn count(&self, subject: &str) -> Result<u64> {
        let mut streams = self.io.lock().await;
        Ok(self.stream_meta(&mut streams, subject).await?.len() as u64)
    }

    async fn delete_stream(&self, subject: &str) -> Result<()> {
        let mut streams = self.io.lock().await;
        remove_if_exists(&self.stream_path(subject)).await?;
        streams.remove(subject);
        Ok(())
    }

    async fn index_write(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let _guard = self.io.lock().await;
        let mut members = self.load_index(key).await?;
        members.insert(member.to_string(), score);
        write_atomic(&self.index_path(key), &serde_json::to_vec(&members)?).await
    }

    async fn index_read(&self, key: &str, range: &IndexRange) -> Result<Vec<IndexEntry>> {
        let mut entries: Vec<IndexEntry> = self
            .load_index(key)
            .await?
            .into_iter()
            .map(|(member, score)| IndexEntry { member, score })
            .collect();
        sort_entries(&mut entries);
        Ok(range.apply(entries))
    }

    async fn index_count(&self, key: &str) -> Result<u64> {
        Ok(self.load_index(key).await?.len() as u64)
    }

    async fn index_remove(&self, key: &str, member: &str) -> Result<()> {
        let _guard = self.io.lock().await;
        let mut members = self.load_index(key).await?;
        if members.remove(member).is_none() {
            return Ok(());
        }
        if members.is_empty() {
            remove_if_exists(&self.index_path(key)).await
        } else {
            write_atomic(&self.index_path(key), &serde_json::to_vec(&members)?).await
        }
    }

    async fn delete_index(&self, key: &str) -> Result<()> {
        let _guard = self.io.lock().await;
        remove_if_exists(&self.index_path(key)).await
    }

    async fn kv_get(&self, key: &str) -> Result<Option<Value>> {
        let _guard = self.io.lock().await;
        Ok(self.load_kv(key).await?.map(|e| e.value))
    }

    async fn kv_set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        let _guard = self.io.lock().await;
        self.store_kv(key, &KvFile::new(value, ttl)?).await
    }

    async fn kv_delete(&self, key: &str) -> Result<bool> {
        let _guard = self.io.lock().await;
        let live = self.load_kv(key).await?.is_some();
        remove_if_exists(&self.kv_path(key)).await?;
        Ok(live)
    }

    async fn kv_increment(&self, key: &str, by: i64) -> Result<i64> {
        let _guard = self.io.lock().await;
        let current = match self.load_kv(key).await? {
            Some(entry) => entry.value.as_i64().ok_or_else(|| {
                Error::Validation(format!("kv key '{key}' does not hold an integer"))
            })?,
            None => 0,
        };
        let next = current + by;
        self.store_kv(key, &KvFile::new(Value::from(next), None)?)
            .await?;
        Ok(next)
    }

    async fn kv_set_if_absent(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let _guard = self.io.lock().await;
        if self.load_kv(key).await?.is_some() {
            return Ok(false);
        }
        self.store_kv(key, &KvFile::new(value, ttl)?).await?;
        Ok(true)
    }

    async fn kv_compare_and_set(
        &self,
        key: &str,
        expected: &Value,
        value: Option<Value>,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let _guard = self.io.lock().await;
        match self.load_kv(key).await? {
            Some(entry) if &entry.value == expected => {}
            _ => return Ok(false),
        }
        match value {
            Some(value) => self.store_kv(key, &KvFile::new(value, ttl)?).await?,
            None => remove_if_exists(&self.kv_path(key)).await?,
        }
        Ok(true)
    }

    async fn kv_take(&self, key: &str) -> Result<Option<Value>> {
        let _guard = self.io.lock().await;
        let Some(entry) = self.load_kv(key).await? else {
            return Ok(None);
        };
        remove_if_exists(&self.kv_path(key)).await?;
        Ok(Some(entry.value))
    }

    fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(MemoryTransport::new(self.notices.subscribe()))
    }
}

/// Flatten an arbitrary subject or key into a portable file name:
/// ASCII alphanumerics and `-` pass through, every other byte becomes `_XX`.
fn encode_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("_{byte:02X}"));
        }
    }
    out
}

async fn read_range(path: &Path, start: u64, end: u64) -> Result<Vec<u8>> {
    let mut file = match fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let len = usize::try_from(end - start)
        .map_err(|_| Error::Other(format!("stream span of {} bytes is too large", end - start)))?;
    file.seek(SeekFrom::Start(start)).await?;
    let mut buf = vec![0; len];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_records_line_starts_and_skips_a_torn_tail() {
        let meta = StreamMeta::scan(b"{\"a\":1}\n\n{\"b\":2}\n{\"c\"");
        assert_eq!(meta.offsets, [0, 9]);
        assert_eq!(meta.end, 17);
        assert_eq!(meta.bytes_of(0, 0), (0, 9));
        assert_eq!(meta.bytes_of(1, 1), (9, 17));
        assert_eq!(StreamMeta::scan(b"").len(), 0);
    }

    #[test]
    fn encoding_is_flat_and_injective() {
        assert_eq!(encode_name("run:abc-1"), "run_3Aabc-1");
        assert_eq!(encode_name("flow-runs/x"), "flow-runs_2Fx");
        assert_ne!(encode_name("a_3A"), encode_name("a:"));
        assert!(!encode_name("../../etc/passwd").contains('/'));
    }
}

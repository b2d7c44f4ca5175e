//! Durable message journal.
//!
//! Every accepted inbound and every sent outbound frame is appended under
//! (session, direction, sequence number). The journal serves ResendRequest
//! replay and seeds sequence counters on session re-establishment.
//!
//! [`FileMessageStore`] writes JSON Lines with a sidecar offset index per
//! direction; a single worker task owns the files, serializing writes per
//! session while appends from many sessions multiplex over a channel.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{self, metadata, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};

use crate::config::StorageBackend;
use crate::session::SessionId;

/// Direction of message flow relative to this server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Received from the counterparty.
    Inbound,
    /// Sent to the counterparty.
    Outbound,
}

impl Direction {
    fn idx_suffix(self) -> &'static str {
        match self {
            Direction::Inbound => "in",
            Direction::Outbound => "out",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The journal already holds this (session, direction, seq).
    #[error("duplicate {direction:?} message at seq {seq}")]
    DuplicateSeq { direction: Direction, seq: u64 },

    #[error("journal io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal worker stopped")]
    Closed,
}

/// A persisted frame with its metadata, one JSON line on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessageRecord {
    pub session: SessionId,
    pub direction: Direction,
    pub seq: u64,
    /// Wall time of the append, milliseconds since the epoch.
    pub ts_millis: i64,
    /// Base64-encoded wire frame.
    pub payload_b64: String,
}

#[async_trait]
pub trait MessageStore: Send + Sync + 'static {
    /// Append one frame. Atomic: on `Ok` the record is durable per the
    /// configured policy; a duplicate (session, direction, seq) is an error.
    async fn append(
        &self,
        session: &SessionId,
        direction: Direction,
        seq: u64,
        frame: &[u8],
        wall: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Frames with `begin_seq <= seq <= end_seq`, ascending. `None` for
    /// `end_seq` means unbounded.
    async fn range(
        &self,
        session: &SessionId,
        direction: Direction,
        begin_seq: u64,
        end_seq: Option<u64>,
    ) -> Result<Vec<(u64, Bytes)>, StoreError>;

    /// Highest stored sequence number, zero if none.
    async fn last_seq(&self, session: &SessionId, direction: Direction)
        -> Result<u64, StoreError>;

    /// Retire the session's journal so sequence numbering can restart at 1.
    /// Invoked when an authorized counterparty logs on with
    /// ResetSeqNumFlag=Y; implementations may archive rather than delete.
    async fn reset(&self, session: &SessionId) -> Result<(), StoreError>;
}

pub fn make_store(backend: &StorageBackend) -> Arc<dyn MessageStore> {
    match backend {
        StorageBackend::Memory => Arc::new(MemoryMessageStore::new()),
        StorageBackend::File { base_dir } => Arc::new(FileMessageStore::new(base_dir.clone())),
    }
}

/// Heap-backed store for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    inner: Mutex<HashMap<(SessionId, Direction), std::collections::BTreeMap<u64, Bytes>>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn append(
        &self,
        session: &SessionId,
        direction: Direction,
        seq: u64,
        frame: &[u8],
        _wall: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let log = inner.entry((session.clone(), direction)).or_default();
        if log.contains_key(&seq) {
            return Err(StoreError::DuplicateSeq { direction, seq });
        }
        log.insert(seq, Bytes::copy_from_slice(frame));
        Ok(())
    }

    async fn range(
        &self,
        session: &SessionId,
        direction: Direction,
        begin_seq: u64,
        end_seq: Option<u64>,
    ) -> Result<Vec<(u64, Bytes)>, StoreError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(log) = inner.get(&(session.clone(), direction)) else {
            return Ok(Vec::new());
        };
        let end = end_seq.unwrap_or(u64::MAX);
        Ok(log
            .range(begin_seq..=end)
            .map(|(s, f)| (*s, f.clone()))
            .collect())
    }

    async fn last_seq(
        &self,
        session: &SessionId,
        direction: Direction,
    ) -> Result<u64, StoreError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner
            .get(&(session.clone(), direction))
            .and_then(|log| log.last_key_value())
            .map(|(s, _)| *s)
            .unwrap_or(0))
    }

    async fn reset(&self, session: &SessionId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.remove(&(session.clone(), Direction::Inbound));
        inner.remove(&(session.clone(), Direction::Outbound));
        Ok(())
    }
}

/// When to sync journal writes to stable storage.
#[derive(Debug, Clone)]
pub enum DurabilityPolicy {
    /// fsync after every write.
    Always,
    /// fsync at most once per the given interval.
    IntervalMs(u64),
    /// Leave syncing to the operating system.
    Disabled,
}

#[derive(Debug, Clone)]
pub struct FileStoreConfig {
    pub base_dir: PathBuf,
    pub channel_capacity: usize,
    pub durability: DurabilityPolicy,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("data/journal"),
            channel_capacity: 8192,
            durability: DurabilityPolicy::IntervalMs(500),
        }
    }
}

type Ack = oneshot::Sender<Result<(), StoreError>>;

enum StoreOp {
    Append { record: StoredMessageRecord, ack: Ack },
    Reset { session: SessionId, ack: Ack },
}

/// File-backed journal: `<stem>.jsonl` data plus `<stem>.<dir>.idx`
/// offset indexes for sequence-keyed retrieval.
#[derive(Clone)]
pub struct FileMessageStore {
    tx: mpsc::Sender<StoreOp>,
    cfg: FileStoreConfig,
}

impl FileMessageStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self::new_with_config(FileStoreConfig {
            base_dir: base_dir.into(),
            ..FileStoreConfig::default()
        })
    }

    pub fn new_with_config(cfg: FileStoreConfig) -> Self {
        let (tx, mut rx) = mpsc::channel::<StoreOp>(cfg.channel_capacity);
        let cfg_clone = cfg.clone();
        tokio::spawn(async move {
            let _ = fs::create_dir_all(&cfg_clone.base_dir).await;
            let mut worker = StoreWorker {
                cfg: cfg_clone,
                last_seqs: HashMap::new(),
                last_sync: Instant::now(),
            };
            while let Some(op) = rx.recv().await {
                match op {
                    StoreOp::Append { record, ack } => {
                        let _ = ack.send(worker.write(&record).await);
                    }
                    StoreOp::Reset { session, ack } => {
                        let _ = ack.send(worker.retire(&session).await);
                    }
                }
            }
        });
        Self { tx, cfg }
    }

    fn data_path(&self, session: &SessionId) -> PathBuf {
        self.cfg
            .base_dir
            .join(format!("{}.jsonl", session.file_stem()))
    }

    fn idx_path(&self, session: &SessionId, direction: Direction) -> PathBuf {
        self.cfg.base_dir.join(format!(
            "{}.{}.idx",
            session.file_stem(),
            direction.idx_suffix()
        ))
    }
}

struct StoreWorker {
    cfg: FileStoreConfig,
    /// Highest appended seq per (stem, direction); lazily recovered from
    /// the index so duplicate rejection survives restarts.
    last_seqs: HashMap<(String, Direction), u64>,
    last_sync: Instant,
}

impl StoreWorker {
    async fn write(&mut self, rec: &StoredMessageRecord) -> Result<(), StoreError> {
        let stem = rec.session.file_stem();
        let data_path = self.cfg.base_dir.join(format!("{}.jsonl", stem));
        let idx_path = self.cfg.base_dir.join(format!(
            "{}.{}.idx",
            stem,
            rec.direction.idx_suffix()
        ));

        let key = (stem, rec.direction);
        let last = if let Some(last) = self.last_seqs.get(&key).copied() {
            last
        } else {
            let recovered = read_last_idx_seq(&idx_path).await?;
            self.last_seqs.insert(key.clone(), recovered);
            recovered
        };
        if rec.seq <= last {
            return Err(StoreError::DuplicateSeq {
                direction: rec.direction,
                seq: rec.seq,
            });
        }

        let offset = match metadata(&data_path).await {
            Ok(m) => m.len(),
            Err(_) => 0,
        };

        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&data_path)
            .await?;
        let line = serde_json::to_string(rec).map_err(std::io::Error::other)?;
        f.write_all(line.as_bytes()).await?;
        f.write_all(b"\n").await?;

        let mut idx = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&idx_path)
            .await?;
        idx.write_all(format!("{} {}\n", rec.seq, offset).as_bytes())
            .await?;

        match self.cfg.durability {
            DurabilityPolicy::Always => {
                f.sync_data().await?;
                idx.sync_data().await?;
            }
            DurabilityPolicy::IntervalMs(ms) => {
                if self.last_sync.elapsed() >= Duration::from_millis(ms) {
                    f.sync_data().await?;
                    self.last_sync = Instant::now();
                }
            }
            DurabilityPolicy::Disabled => {}
        }

        self.last_seqs.insert(key, rec.seq);
        Ok(())
    }

    /// Move the session's journal files aside so a reset session starts a
    /// fresh, collision-free sequence space. The old files stay on disk
    /// for audit.
    async fn retire(&mut self, session: &SessionId) -> Result<(), StoreError> {
        let stem = session.file_stem();
        self.last_seqs.remove(&(stem.clone(), Direction::Inbound));
        self.last_seqs.remove(&(stem.clone(), Direction::Outbound));

        let epoch = chrono::Utc::now().timestamp_millis();
        let names = [
            format!("{}.jsonl", stem),
            format!("{}.in.idx", stem),
            format!("{}.out.idx", stem),
        ];
        for name in names {
            let path = self.cfg.base_dir.join(&name);
            let archived = self.cfg.base_dir.join(format!("{}.{}", name, epoch));
            match fs::rename(&path, &archived).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

async fn read_last_idx_seq(idx_path: &std::path::Path) -> Result<u64, StoreError> {
    let content = match fs::read_to_string(idx_path).await {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut last = 0u64;
    for line in content.lines() {
        if let Some(seq) = line
            .split_whitespace()
            .next()
            .and_then(|s| s.parse::<u64>().ok())
        {
            last = last.max(seq);
        }
    }
    Ok(last)
}

#[async_trait]
impl MessageStore for FileMessageStore {
    async fn append(
        &self,
        session: &SessionId,
        direction: Direction,
        seq: u64,
        frame: &[u8],
        wall: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let op = StoreOp::Append {
            record: StoredMessageRecord {
                session: session.clone(),
                direction,
                seq,
                ts_millis: wall.timestamp_millis(),
                payload_b64: general_purpose::STANDARD.encode(frame),
            },
            ack: ack_tx,
        };
        self.tx.send(op).await.map_err(|_| StoreError::Closed)?;
        ack_rx.await.map_err(|_| StoreError::Closed)?
    }

    async fn range(
        &self,
        session: &SessionId,
        direction: Direction,
        begin_seq: u64,
        end_seq: Option<u64>,
    ) -> Result<Vec<(u64, Bytes)>, StoreError> {
        let idx_content = match fs::read_to_string(self.idx_path(session, direction)).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let end = end_seq.unwrap_or(u64::MAX);
        let mut offsets: Vec<(u64, u64)> = Vec::new();
        for line in idx_content.lines() {
            let mut it = line.split_whitespace();
            let seq = it.next().and_then(|s| s.parse::<u64>().ok());
            let off = it.next().and_then(|s| s.parse::<u64>().ok());
            if let (Some(seq), Some(off)) = (seq, off) {
                if seq >= begin_seq && seq <= end {
                    offsets.push((seq, off));
                }
            }
        }
        offsets.sort_by_key(|(s, _)| *s);
        if offsets.is_empty() {
            return Ok(Vec::new());
        }

        let mut file = File::open(self.data_path(session)).await?;
        let mut out: Vec<(u64, Bytes)> = Vec::with_capacity(offsets.len());
        for (seq, off) in offsets {
            file.seek(std::io::SeekFrom::Start(off)).await?;
            let mut reader = BufReader::new(&mut file);
            let mut line = String::new();
            reader.read_line(&mut line).await?;
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(rec) = serde_json::from_str::<StoredMessageRecord>(&line) {
                if let Ok(bytes) = general_purpose::STANDARD.decode(&rec.payload_b64) {
                    out.push((seq, Bytes::from(bytes)));
                }
            }
        }
        Ok(out)
    }

    async fn last_seq(
        &self,
        session: &SessionId,
        direction: Direction,
    ) -> Result<u64, StoreError> {
        read_last_idx_seq(&self.idx_path(session, direction)).await
    }

    async fn reset(&self, session: &SessionId) -> Result<(), StoreError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let op = StoreOp::Reset {
            session: session.clone(),
            ack: ack_tx,
        };
        self.tx.send(op).await.map_err(|_| StoreError::Closed)?;
        ack_rx.await.map_err(|_| StoreError::Closed)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sid() -> SessionId {
        SessionId::new("SRV", "CLI")
    }

    fn wall() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 8, 0, 0).unwrap()
    }

    async fn exercise_store(store: &dyn MessageStore) {
        let id = sid();
        for seq in 1..=5u64 {
            store
                .append(
                    &id,
                    Direction::Outbound,
                    seq,
                    format!("frame-{seq}").as_bytes(),
                    wall(),
                )
                .await
                .unwrap();
        }
        store
            .append(&id, Direction::Inbound, 1, b"in-1", wall())
            .await
            .unwrap();

        // Duplicate append is an error, per direction.
        assert!(matches!(
            store
                .append(&id, Direction::Outbound, 3, b"dup", wall())
                .await,
            Err(StoreError::DuplicateSeq {
                direction: Direction::Outbound,
                seq: 3
            })
        ));

        let got = store
            .range(&id, Direction::Outbound, 2, Some(4))
            .await
            .unwrap();
        assert_eq!(
            got,
            vec![
                (2, Bytes::from_static(b"frame-2")),
                (3, Bytes::from_static(b"frame-3")),
                (4, Bytes::from_static(b"frame-4")),
            ]
        );

        // Unbounded end reads through the tail.
        let got = store
            .range(&id, Direction::Outbound, 4, None)
            .await
            .unwrap();
        assert_eq!(got.len(), 2);

        assert_eq!(store.last_seq(&id, Direction::Outbound).await.unwrap(), 5);
        assert_eq!(store.last_seq(&id, Direction::Inbound).await.unwrap(), 1);
        assert_eq!(
            store
                .last_seq(&SessionId::new("SRV", "OTHER"), Direction::Outbound)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn memory_store_contract() {
        exercise_store(&MemoryMessageStore::new()).await;
    }

    #[tokio::test]
    async fn file_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMessageStore::new_with_config(FileStoreConfig {
            base_dir: dir.path().to_path_buf(),
            durability: DurabilityPolicy::Always,
            ..FileStoreConfig::default()
        });
        exercise_store(&store).await;
    }

    #[tokio::test]
    async fn reset_reopens_the_sequence_space() {
        let dir = tempfile::tempdir().unwrap();
        let id = sid();
        for store in [
            Box::new(MemoryMessageStore::new()) as Box<dyn MessageStore>,
            Box::new(FileMessageStore::new(dir.path())),
        ] {
            store
                .append(&id, Direction::Outbound, 1, b"old-1", wall())
                .await
                .unwrap();
            store.reset(&id).await.unwrap();
            assert_eq!(store.last_seq(&id, Direction::Outbound).await.unwrap(), 0);
            assert!(store
                .range(&id, Direction::Outbound, 1, None)
                .await
                .unwrap()
                .is_empty());
            store
                .append(&id, Direction::Outbound, 1, b"new-1", wall())
                .await
                .unwrap();
            assert_eq!(
                store.range(&id, Direction::Outbound, 1, None).await.unwrap(),
                vec![(1, Bytes::from_static(b"new-1"))]
            );
        }
    }

    #[tokio::test]
    async fn file_store_rejects_duplicates_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let id = sid();
        {
            let store = FileMessageStore::new(dir.path());
            store
                .append(&id, Direction::Outbound, 7, b"persisted", wall())
                .await
                .unwrap();
        }
        // A fresh instance recovers the high-water mark from the index.
        let store = FileMessageStore::new(dir.path());
        assert_eq!(store.last_seq(&id, Direction::Outbound).await.unwrap(), 7);
        assert!(matches!(
            store
                .append(&id, Direction::Outbound, 7, b"again", wall())
                .await,
            Err(StoreError::DuplicateSeq { .. })
        ));
        store
            .append(&id, Direction::Outbound, 8, b"next", wall())
            .await
            .unwrap();
    }
}

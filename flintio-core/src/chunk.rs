//! Chunk engine: append ordering, the open/sealed state machine, and the
//! pending queue that buffers out-of-order appends until the gap below them
//! closes or their timer fires.

use crate::error::{FlintError, Result};
use crate::future::Promise;
use crate::store::{
    FileHandleRef, OpenFlags, Store, ATTR_APPEND_OUT_OF_ORDER, ATTR_DIGEST, ATTR_DIGEST_SHA256,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use ulid::Ulid;

pub const DEFAULT_PENDING_APPEND_TIMEOUT: Duration = Duration::from_secs(5);

/// 128-bit chunk identifier. The canonical string form doubles as the
/// backend object key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(Ulid);

impl ChunkId {
    pub fn generate() -> ChunkId {
        ChunkId(Ulid::new())
    }

    /// Inclusive lower bound for enumeration.
    pub fn zero() -> ChunkId {
        ChunkId(Ulid::nil())
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({})", self.0)
    }
}

impl FromStr for ChunkId {
    type Err = FlintError;

    fn from_str(s: &str) -> Result<ChunkId> {
        Ulid::from_string(s)
            .map(ChunkId)
            .map_err(|err| FlintError::InvalidArgument(format!("bad chunk id {:?}: {}", s, err)))
    }
}

/// Creation-time options, persisted as backend attributes so they survive
/// restart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkOptions {
    #[serde(default)]
    pub append_out_of_order: bool,
    #[serde(default)]
    pub digest: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkState {
    /// No durable append has landed yet.
    Init,
    Open,
    Sealed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkStat {
    pub size: u64,
    pub state: ChunkState,
    pub options: ChunkOptions,
}

struct PendingAppend {
    data: Bytes,
    promise: Promise<u64>,
    timer: AbortHandle,
}

struct ChunkInner {
    state: ChunkState,
    committed_size: u64,
    // Keyed by (offset, seq): duplicate offsets stay distinct entries and
    // drain in arrival order within the same offset.
    pending: BTreeMap<(u64, u64), PendingAppend>,
    next_seq: u64,
    digest: Option<Sha256>,
}

/// One append-only byte sequence. All mutable state sits behind one async
/// mutex; holding it across the backend append is what serializes
/// size-affecting transitions, so two racers on the same offset resolve as
/// one winner and one stale rejection.
pub struct Chunk {
    id: ChunkId,
    options: ChunkOptions,
    pending_timeout: Duration,
    store: Arc<dyn Store>,
    handle: FileHandleRef,
    weak: Weak<Chunk>,
    inner: Mutex<ChunkInner>,
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk").field("id", &self.id).finish()
    }
}

impl Chunk {
    /// Create a fresh chunk: new id, exclusive-create at the backend,
    /// options persisted as attributes.
    pub async fn create(
        store: Arc<dyn Store>,
        options: ChunkOptions,
        pending_timeout: Duration,
    ) -> Result<Arc<Chunk>> {
        let id = ChunkId::generate();
        let key = id.to_string();
        let handle = store.open(&key, OpenFlags::create_exclusive()).await?;
        store
            .set_attr(
                &handle,
                ATTR_APPEND_OUT_OF_ORDER,
                bool_attr(options.append_out_of_order),
            )
            .await?;
        store
            .set_attr(&handle, ATTR_DIGEST, bool_attr(options.digest))
            .await?;

        tracing::debug!(chunk = %id, ?options, "created chunk");
        Ok(Self::assemble(
            id,
            options,
            pending_timeout,
            store,
            handle,
            ChunkState::Init,
            0,
        ))
    }

    /// Reconstruct a chunk found at the backend during startup load. The
    /// node cannot know whether the writer finished, so recovered chunks
    /// come back sealed; options and size are recovered from the backend.
    pub async fn load(
        store: Arc<dyn Store>,
        id: ChunkId,
        pending_timeout: Duration,
    ) -> Result<Arc<Chunk>> {
        let key = id.to_string();
        let handle = store.open(&key, OpenFlags::read_only()).await?;
        let append_out_of_order = store.get_attr(&handle, ATTR_APPEND_OUT_OF_ORDER).await?;
        let digest = store.get_attr(&handle, ATTR_DIGEST).await?;
        let size = store.size(&handle).await?;

        let options = ChunkOptions {
            append_out_of_order: append_out_of_order == "1",
            digest: digest == "1",
        };
        Ok(Self::assemble(
            id,
            options,
            pending_timeout,
            store,
            handle,
            ChunkState::Sealed,
            size,
        ))
    }

    fn assemble(
        id: ChunkId,
        options: ChunkOptions,
        pending_timeout: Duration,
        store: Arc<dyn Store>,
        handle: FileHandleRef,
        state: ChunkState,
        committed_size: u64,
    ) -> Arc<Chunk> {
        let digest = (options.digest && state != ChunkState::Sealed).then(Sha256::new);
        Arc::new_cyclic(|weak| Chunk {
            id,
            options,
            pending_timeout,
            store,
            handle,
            weak: weak.clone(),
            inner: Mutex::new(ChunkInner {
                state,
                committed_size,
                pending: BTreeMap::new(),
                next_seq: 0,
                digest,
            }),
        })
    }

    pub fn id(&self) -> ChunkId {
        self.id
    }

    pub fn options(&self) -> ChunkOptions {
        self.options
    }

    pub async fn stat(&self) -> ChunkStat {
        let inner = self.inner.lock().await;
        ChunkStat {
            size: inner.committed_size,
            state: inner.state,
            options: self.options,
        }
    }

    pub async fn size(&self) -> u64 {
        self.inner.lock().await.committed_size
    }

    /// Append `data` at `offset`. Returns the committed size after this
    /// append has landed durably.
    ///
    /// An offset below the committed size is stale and rejected without
    /// mutating anything. An offset exactly at the committed size is
    /// appended durably and then drains whatever queued appends it
    /// unblocked. An offset beyond the committed size is queued (when the
    /// chunk allows out-of-order appends) and the caller suspends until
    /// either a drain or the pending timer resolves its entry; exactly one
    /// of the two does, decided by who removes the entry under the lock.
    pub async fn append(&self, data: Bytes, offset: u64) -> Result<u64> {
        let waiter = {
            let mut inner = self.inner.lock().await;

            if offset < inner.committed_size {
                return Err(FlintError::InvalidArgument(format!(
                    "invalid offset at {}@{}, current size: {}",
                    offset,
                    data.len(),
                    inner.committed_size
                )));
            }

            if offset == inner.committed_size {
                if inner.state == ChunkState::Sealed {
                    return Err(FlintError::PermissionDenied(format!(
                        "chunk {} is sealed",
                        self.id
                    )));
                }
                let len = data.len() as u64;
                self.store.append(&self.handle, offset, data.clone()).await?;
                inner.committed_size += len;
                if let Some(hasher) = inner.digest.as_mut() {
                    hasher.update(&data);
                }
                if inner.state == ChunkState::Init {
                    inner.state = ChunkState::Open;
                }
                // The return value reflects only this append; entries the
                // drain applies report through their own channels.
                let committed = inner.committed_size;
                self.drain(&mut inner).await;
                return Ok(committed);
            }

            if !self.options.append_out_of_order {
                return Err(FlintError::InvalidArgument(format!(
                    "invalid offset at {}@{}, current size: {} (out-of-order appends disabled)",
                    offset,
                    data.len(),
                    inner.committed_size
                )));
            }

            let seq = inner.next_seq;
            inner.next_seq += 1;
            let (promise, waiter) = Promise::pair();
            let timer = self.arm_pending_timer(offset, seq);
            inner.pending.insert(
                (offset, seq),
                PendingAppend {
                    data,
                    promise,
                    timer,
                },
            );
            tracing::debug!(
                chunk = %self.id,
                offset,
                committed = inner.committed_size,
                "queued out-of-order append"
            );
            waiter
        };

        // Suspend outside the lock; drains and timers need it.
        waiter.await
    }

    /// Resolve queued appends in ascending offset order: entries below the
    /// committed size are stale, an entry exactly at it is appended durably
    /// (chaining further drains), the first entry beyond it stops the scan.
    /// Caller holds the chunk lock.
    async fn drain(&self, inner: &mut ChunkInner) {
        loop {
            let Some((&(offset, _), _)) = inner.pending.first_key_value() else {
                break;
            };

            if offset < inner.committed_size {
                if let Some(((offset, _), entry)) = inner.pending.pop_first() {
                    entry.timer.abort();
                    entry.promise.set_error(FlintError::InvalidArgument(format!(
                        "invalid offset at {}@{}, current size: {}",
                        offset,
                        entry.data.len(),
                        inner.committed_size
                    )));
                }
                continue;
            }

            if offset > inner.committed_size {
                break;
            }

            let Some((_, entry)) = inner.pending.pop_first() else {
                break;
            };
            entry.timer.abort();
            let len = entry.data.len() as u64;
            match self
                .store
                .append(&self.handle, offset, entry.data.clone())
                .await
            {
                Ok(()) => {
                    inner.committed_size += len;
                    if let Some(hasher) = inner.digest.as_mut() {
                        hasher.update(&entry.data);
                    }
                    entry.promise.set_value(inner.committed_size);
                }
                Err(err) => {
                    tracing::error!(
                        chunk = %self.id,
                        offset,
                        error = %err,
                        "backend append failed while draining queue"
                    );
                    entry.promise.set_error(err);
                    // Committed size did not advance; later entries keep
                    // waiting for their own trigger.
                    break;
                }
            }
        }
    }

    fn arm_pending_timer(&self, offset: u64, seq: u64) -> AbortHandle {
        let weak = self.weak.clone();
        let timeout = self.pending_timeout;
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(chunk) = weak.upgrade() {
                chunk.expire_pending(offset, seq).await;
            }
        });
        task.abort_handle()
    }

    /// Timer path. Losing the race against a drain means the entry is
    /// already gone from the map, and the expiry is a no-op.
    async fn expire_pending(&self, offset: u64, seq: u64) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.pending.remove(&(offset, seq)) {
            tracing::warn!(
                chunk = %self.id,
                offset,
                committed = inner.committed_size,
                timeout = ?self.pending_timeout,
                "queued append timed out waiting for earlier bytes"
            );
            entry.promise.set_error(FlintError::Timeout(format!(
                "append at offset {} waited {:?} for offset {} to be filled",
                offset, self.pending_timeout, inner.committed_size
            )));
        }
    }

    /// One-way transition to `Sealed`. Queued appends are not failed
    /// proactively; they resolve through drain or timeout. Returns the
    /// final committed size.
    pub async fn seal(&self) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        inner.state = ChunkState::Sealed;
        self.store.seal(&self.handle).await?;
        if let Some(hasher) = inner.digest.take() {
            let digest = hex::encode(hasher.finalize());
            self.store
                .set_attr(&self.handle, ATTR_DIGEST_SHA256, &digest)
                .await?;
        }
        tracing::debug!(chunk = %self.id, size = inner.committed_size, "sealed chunk");
        Ok(inner.committed_size)
    }

    /// Read `length` bytes from `offset`. The committed size is snapshotted
    /// under the lock; the backend read itself runs without it.
    pub async fn read(&self, offset: u64, length: u64) -> Result<Bytes> {
        {
            let inner = self.inner.lock().await;
            let end = offset.checked_add(length).ok_or_else(|| {
                FlintError::InvalidArgument("read range overflows".to_string())
            })?;
            if end > inner.committed_size {
                return Err(FlintError::InvalidArgument(format!(
                    "read {}..{} beyond committed size {}",
                    offset, end, inner.committed_size
                )));
            }
        }
        self.store.read(&self.handle, offset, length).await
    }
}

fn bool_attr(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn mem_store() -> Arc<dyn Store> {
        Arc::new(MemStore::new())
    }

    async fn open_chunk(store: &Arc<dyn Store>, options: ChunkOptions) -> Arc<Chunk> {
        Chunk::create(store.clone(), options, TIMEOUT).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_initial_state() {
        let store = mem_store();
        let chunk = open_chunk(&store, ChunkOptions::default()).await;

        let stat = chunk.stat().await;
        assert_eq!(stat.state, ChunkState::Init);
        assert_eq!(stat.size, 0);
        assert!(!chunk.id().to_string().is_empty());
    }

    #[tokio::test]
    async fn test_in_order_append_and_read() {
        let store = mem_store();
        let chunk = open_chunk(&store, ChunkOptions::default()).await;

        assert_eq!(chunk.append(Bytes::from_static(b"Hello"), 0).await.unwrap(), 5);
        assert_eq!(
            chunk.append(Bytes::from_static(b", World!"), 5).await.unwrap(),
            13
        );

        assert_eq!(chunk.stat().await.state, ChunkState::Open);
        assert_eq!(
            chunk.read(0, 13).await.unwrap(),
            Bytes::from_static(b"Hello, World!")
        );
        assert_eq!(chunk.read(7, 5).await.unwrap(), Bytes::from_static(b"World"));
    }

    #[tokio::test]
    async fn test_stale_append_rejected_without_mutation() {
        let store = mem_store();
        let chunk = open_chunk(&store, ChunkOptions::default()).await;

        chunk.append(Bytes::from_static(b"hello"), 0).await.unwrap();
        let err = chunk.append(Bytes::from_static(b"x"), 2).await.unwrap_err();
        assert!(matches!(err, FlintError::InvalidArgument(_)));

        assert_eq!(chunk.size().await, 5);
        assert_eq!(chunk.read(0, 5).await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_future_offset_rejected_when_out_of_order_disabled() {
        let store = mem_store();
        let chunk = open_chunk(&store, ChunkOptions::default()).await;

        let err = chunk
            .append(Bytes::from_static(b"hello"), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, FlintError::InvalidArgument(_)));
        assert_eq!(chunk.size().await, 0);
    }

    #[tokio::test]
    async fn test_out_of_order_appends_coalesce() {
        let store = mem_store();
        let chunk = open_chunk(
            &store,
            ChunkOptions {
                append_out_of_order: true,
                ..Default::default()
            },
        )
        .await;

        // Reverse submission order: 10, then 5, then 0.
        let later = {
            let chunk = chunk.clone();
            tokio::spawn(async move { chunk.append(Bytes::from_static(b"CCCCC"), 10).await })
        };
        let middle = {
            let chunk = chunk.clone();
            tokio::spawn(async move { chunk.append(Bytes::from_static(b"BBBBB"), 5).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(chunk.append(Bytes::from_static(b"AAAAA"), 0).await.unwrap(), 5);

        assert_eq!(middle.await.unwrap().unwrap(), 10);
        assert_eq!(later.await.unwrap().unwrap(), 15);

        assert_eq!(chunk.size().await, 15);
        assert_eq!(
            chunk.read(0, 15).await.unwrap(),
            Bytes::from_static(b"AAAAABBBBBCCCCC")
        );
    }

    #[tokio::test]
    async fn test_pending_append_times_out() {
        let store = mem_store();
        let chunk = Chunk::create(
            store.clone(),
            ChunkOptions {
                append_out_of_order: true,
                ..Default::default()
            },
            Duration::from_millis(100),
        )
        .await
        .unwrap();

        let err = chunk
            .append(Bytes::from_static(b"BBBBB"), 5)
            .await
            .unwrap_err();
        assert!(matches!(err, FlintError::Timeout(_)));

        // The timed-out waiter is gone; filling the gap later does not
        // resurrect it.
        assert_eq!(chunk.append(Bytes::from_static(b"AAAAA"), 0).await.unwrap(), 5);
        assert_eq!(chunk.size().await, 5);
        assert_eq!(chunk.read(0, 5).await.unwrap(), Bytes::from_static(b"AAAAA"));

        // A fresh append at the once-timed-out offset is evaluated fresh.
        assert_eq!(chunk.append(Bytes::from_static(b"BBBBB"), 5).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_duplicate_queued_offset_single_winner() {
        let store = mem_store();
        let chunk = open_chunk(
            &store,
            ChunkOptions {
                append_out_of_order: true,
                ..Default::default()
            },
        )
        .await;

        let first = {
            let chunk = chunk.clone();
            tokio::spawn(async move { chunk.append(Bytes::from_static(b"11111"), 5).await })
        };
        let second = {
            let chunk = chunk.clone();
            tokio::spawn(async move { chunk.append(Bytes::from_static(b"22222"), 5).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        chunk.append(Bytes::from_static(b"00000"), 0).await.unwrap();

        let outcomes = [first.await.unwrap(), second.await.unwrap()];
        let wins = outcomes.iter().filter(|r| r.is_ok()).count();
        let stale = outcomes
            .iter()
            .filter(|r| matches!(r, Err(FlintError::InvalidArgument(_))))
            .count();
        assert_eq!((wins, stale), (1, 1));
        assert_eq!(chunk.size().await, 10);
    }

    #[tokio::test]
    async fn test_seal_gates_appends_keeps_reads() {
        let store = mem_store();
        let chunk = open_chunk(&store, ChunkOptions::default()).await;

        chunk.append(Bytes::from_static(b"hello"), 0).await.unwrap();
        assert_eq!(chunk.seal().await.unwrap(), 5);
        assert_eq!(chunk.stat().await.state, ChunkState::Sealed);

        let err = chunk
            .append(Bytes::from_static(b" more"), 5)
            .await
            .unwrap_err();
        assert!(matches!(err, FlintError::PermissionDenied(_)));

        assert_eq!(chunk.read(0, 5).await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_read_beyond_committed_size() {
        let store = mem_store();
        let chunk = open_chunk(&store, ChunkOptions::default()).await;

        chunk.append(Bytes::from_static(b"hello"), 0).await.unwrap();
        assert!(matches!(
            chunk.read(0, 6).await.unwrap_err(),
            FlintError::InvalidArgument(_)
        ));
        assert!(matches!(
            chunk.read(u64::MAX, 2).await.unwrap_err(),
            FlintError::InvalidArgument(_)
        ));
    }

    #[tokio::test]
    async fn test_digest_persisted_on_seal() {
        let store = mem_store();
        let chunk = open_chunk(
            &store,
            ChunkOptions {
                digest: true,
                ..Default::default()
            },
        )
        .await;

        chunk.append(Bytes::from_static(b"hello"), 0).await.unwrap();
        chunk.seal().await.unwrap();

        let handle = store
            .open(&chunk.id().to_string(), OpenFlags::read_only())
            .await
            .unwrap();
        let digest = store.get_attr(&handle, ATTR_DIGEST_SHA256).await.unwrap();
        let expected = hex::encode(Sha256::digest(b"hello"));
        assert_eq!(digest, expected);
    }

    #[tokio::test]
    async fn test_load_recovers_sealed_chunk() {
        let store = mem_store();
        let options = ChunkOptions {
            append_out_of_order: true,
            digest: false,
        };
        let chunk = open_chunk(&store, options).await;
        chunk.append(Bytes::from_static(b"recovered"), 0).await.unwrap();
        chunk.seal().await.unwrap();
        let id = chunk.id();
        drop(chunk);

        let loaded = Chunk::load(store.clone(), id, TIMEOUT).await.unwrap();
        let stat = loaded.stat().await;
        assert_eq!(stat.state, ChunkState::Sealed);
        assert_eq!(stat.size, 9);
        assert_eq!(stat.options, options);
        assert_eq!(
            loaded.read(0, 9).await.unwrap(),
            Bytes::from_static(b"recovered")
        );
    }
}

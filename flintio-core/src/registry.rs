//! Per-node chunk registry: the id -> live chunk map, plus bulk
//! reconstruction from the backend at startup.

use crate::chunk::{Chunk, ChunkId, ChunkOptions};
use crate::error::{FlintError, Result};
use crate::store::Store;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Holds at most one live [`Chunk`] per id. Lookups hand out shared
/// references, so a chunk removed from the registry stays alive for callers
/// still operating on it. The map lock guards only the map and is never
/// held across backend I/O.
pub struct ChunkRegistry {
    store: Arc<dyn Store>,
    pending_timeout: Duration,
    chunks: Mutex<BTreeMap<ChunkId, Arc<Chunk>>>,
}

impl ChunkRegistry {
    pub fn new(store: Arc<dyn Store>, pending_timeout: Duration) -> ChunkRegistry {
        ChunkRegistry {
            store,
            pending_timeout,
            chunks: Mutex::new(BTreeMap::new()),
        }
    }

    pub async fn create_chunk(&self, options: ChunkOptions) -> Result<Arc<Chunk>> {
        let chunk = Chunk::create(self.store.clone(), options, self.pending_timeout).await?;
        let mut chunks = self.chunks.lock().await;
        chunks.insert(chunk.id(), chunk.clone());
        Ok(chunk)
    }

    pub async fn get_chunk(&self, id: ChunkId) -> Result<Arc<Chunk>> {
        let chunks = self.chunks.lock().await;
        chunks
            .get(&id)
            .cloned()
            .ok_or_else(|| FlintError::NotFound(format!("chunk {}", id)))
    }

    /// Unregister the chunk and delete its backend object. In-flight
    /// operations on the removed chunk keep running on their own
    /// references; this does not wait for them.
    pub async fn remove_chunk(&self, id: ChunkId) -> Result<()> {
        {
            let mut chunks = self.chunks.lock().await;
            if chunks.remove(&id).is_none() {
                return Err(FlintError::NotFound(format!("chunk {}", id)));
            }
        }
        self.store.remove(&id.to_string()).await?;
        tracing::debug!(chunk = %id, "removed chunk");
        Ok(())
    }

    /// Invoke `callback` for up to `limit` ids, ascending from the first id
    /// `>= start`. A callback failure is logged and skipped; one faulty
    /// listener cannot abort enumeration for the rest.
    pub async fn list_chunk<F>(&self, start: ChunkId, limit: u32, mut callback: F)
    where
        F: FnMut(ChunkId) -> Result<()>,
    {
        let chunks = self.chunks.lock().await;
        for (&id, _) in chunks.range(start..).take(limit as usize) {
            if let Err(err) = callback(id) {
                tracing::warn!(chunk = %id, error = %err, "list callback failed");
            }
        }
    }

    /// Rebuild the registry from the backend. Every enumerated object comes
    /// back as a sealed chunk; undecodable keys and failed reconstructions
    /// are logged and skipped. Runs once at startup, before the node
    /// accepts traffic.
    pub async fn load(&self) -> Result<()> {
        let mut paths = Vec::new();
        self.store.for_each(&mut |path| paths.push(path.to_string()));

        let mut loaded = 0usize;
        for path in paths {
            let id = match path.parse::<ChunkId>() {
                Ok(id) => id,
                Err(err) => {
                    tracing::warn!(path = %path, error = %err, "skipping object with undecodable key");
                    continue;
                }
            };
            let chunk = match Chunk::load(self.store.clone(), id, self.pending_timeout).await {
                Ok(chunk) => chunk,
                Err(err) => {
                    tracing::error!(chunk = %id, error = %err, "failed to reconstruct chunk");
                    continue;
                }
            };
            let mut chunks = self.chunks.lock().await;
            chunks.insert(id, chunk);
            loaded += 1;
        }

        tracing::info!(chunks = loaded, "registry loaded from store");
        Ok(())
    }

    pub async fn chunk_count(&self) -> usize {
        self.chunks.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ChunkState, DEFAULT_PENDING_APPEND_TIMEOUT};
    use crate::store::MemStore;
    use bytes::Bytes;

    fn registry() -> ChunkRegistry {
        ChunkRegistry::new(
            Arc::new(MemStore::new()),
            DEFAULT_PENDING_APPEND_TIMEOUT,
        )
    }

    #[tokio::test]
    async fn test_create_get_remove() {
        let registry = registry();

        let chunk = registry
            .create_chunk(ChunkOptions::default())
            .await
            .unwrap();
        let id = chunk.id();

        let found = registry.get_chunk(id).await.unwrap();
        assert_eq!(found.id(), id);

        registry.remove_chunk(id).await.unwrap();
        assert!(matches!(
            registry.get_chunk(id).await.unwrap_err(),
            FlintError::NotFound(_)
        ));
        assert!(matches!(
            registry.remove_chunk(id).await.unwrap_err(),
            FlintError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_removed_chunk_stays_usable_for_holders() {
        let registry = registry();

        let chunk = registry
            .create_chunk(ChunkOptions::default())
            .await
            .unwrap();
        chunk.append(Bytes::from_static(b"hello"), 0).await.unwrap();

        registry.remove_chunk(chunk.id()).await.unwrap();

        // The held reference still answers; only the registry entry and the
        // backend object are gone.
        assert_eq!(chunk.size().await, 5);
    }

    #[tokio::test]
    async fn test_list_chunk_paginates_in_order() {
        let registry = registry();

        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(
                registry
                    .create_chunk(ChunkOptions::default())
                    .await
                    .unwrap()
                    .id(),
            );
        }
        ids.sort();

        let mut seen = Vec::new();
        registry
            .list_chunk(ChunkId::zero(), 3, |id| {
                seen.push(id);
                Ok(())
            })
            .await;
        assert_eq!(seen, ids[..3]);

        // Resume from the last id returned; it is included again, the way
        // an inclusive start bound reads.
        let mut rest = Vec::new();
        registry
            .list_chunk(ids[2], 100, |id| {
                rest.push(id);
                Ok(())
            })
            .await;
        assert_eq!(rest, ids[2..]);
    }

    #[tokio::test]
    async fn test_list_chunk_callback_failure_skipped() {
        let registry = registry();
        for _ in 0..3 {
            registry
                .create_chunk(ChunkOptions::default())
                .await
                .unwrap();
        }

        let mut seen = 0;
        registry
            .list_chunk(ChunkId::zero(), 100, |_| {
                seen += 1;
                if seen == 2 {
                    Err(FlintError::Internal("listener hiccup".to_string()))
                } else {
                    Ok(())
                }
            })
            .await;
        // Enumeration kept going past the failing callback.
        assert_eq!(seen, 3);
    }

    #[tokio::test]
    async fn test_load_reconstructs_sealed_chunks() {
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let registry = ChunkRegistry::new(store.clone(), DEFAULT_PENDING_APPEND_TIMEOUT);

        let mut sizes = BTreeMap::new();
        for payload in [&b"one"[..], &b"three"[..], &b"fifteen-bytes!!"[..]] {
            let chunk = registry
                .create_chunk(ChunkOptions::default())
                .await
                .unwrap();
            chunk.append(Bytes::copy_from_slice(payload), 0).await.unwrap();
            chunk.seal().await.unwrap();
            sizes.insert(chunk.id(), payload.len() as u64);
        }

        // A fresh registry over the same store recovers everything sealed.
        let reloaded = ChunkRegistry::new(store, DEFAULT_PENDING_APPEND_TIMEOUT);
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.chunk_count().await, sizes.len());

        for (&id, &size) in &sizes {
            let chunk = reloaded.get_chunk(id).await.unwrap();
            let stat = chunk.stat().await;
            assert_eq!(stat.state, ChunkState::Sealed);
            assert_eq!(stat.size, size);
        }
    }
}

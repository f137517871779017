//! Flintio Core - storage-node core for an append-only chunk store
//!
//! One node of a distributed chunk store:
//! - chunks are append-only byte sequences, sealed read-only when complete
//! - appends may arrive out of offset order and are buffered until the gap
//!   below them closes or a timer gives up on them
//! - the metadata/namespace plane and topology registry live elsewhere;
//!   this crate only owns the per-node chunk engine and registry

pub mod chunk;
pub mod config;
pub mod error;
pub mod future;
pub mod registry;
pub mod store;

pub use chunk::{
    Chunk, ChunkId, ChunkOptions, ChunkState, ChunkStat, DEFAULT_PENDING_APPEND_TIMEOUT,
};
pub use config::{ChunkConfig, Config, NodeConfig, StoreConfig};
pub use error::{FlintError, Result};
pub use future::{AsyncResult, Promise};
pub use registry::ChunkRegistry;
pub use store::{
    create_store, FileHandle, FileHandleRef, LocalStore, MemStore, OpenFlags, Store,
    ATTR_APPEND_OUT_OF_ORDER, ATTR_DIGEST, ATTR_DIGEST_SHA256,
};

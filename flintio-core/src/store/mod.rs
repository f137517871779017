//! Pluggable byte-object backends beneath the chunk engine.
//!
//! A [`Store`] keeps one append-only object per chunk, addressed by the
//! chunk's canonical id string. Every operation returns through an
//! [`AsyncResult`] so callers on any task consume backend completions the
//! same way they consume queued-append completions.

pub mod local;
pub mod mem;

use crate::error::{FlintError, Result};
use crate::future::AsyncResult;
use bytes::Bytes;
use std::any::Any;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

pub use local::LocalStore;
pub use mem::MemStore;

/// Attribute key for the out-of-order append option ("0"/"1").
pub const ATTR_APPEND_OUT_OF_ORDER: &str = "append-out-of-order";
/// Attribute key for the digest option ("0"/"1").
pub const ATTR_DIGEST: &str = "digest";
/// Attribute key for the hex SHA-256 persisted when a digesting chunk seals.
pub const ATTR_DIGEST_SHA256: &str = "digest-sha256";

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    pub create: bool,
    pub exclusive: bool,
    pub write: bool,
}

impl OpenFlags {
    /// Exclusive creation of a fresh object; collides with `AlreadyExists`.
    pub fn create_exclusive() -> OpenFlags {
        OpenFlags {
            create: true,
            exclusive: true,
            write: true,
        }
    }

    /// Open an existing object without write access; missing objects fail
    /// with `NotFound`.
    pub fn read_only() -> OpenFlags {
        OpenFlags::default()
    }
}

/// Opaque per-object handle returned by [`Store::open`]. Backends downcast
/// through `as_any` to reach their own handle type.
pub trait FileHandle: Send + Sync + 'static {
    fn path(&self) -> &str;
    fn as_any(&self) -> &dyn Any;
}

impl std::fmt::Debug for dyn FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("path", &self.path())
            .finish()
    }
}

pub type FileHandleRef = Arc<dyn FileHandle>;

pub trait Store: Send + Sync + 'static {
    fn open(&self, path: &str, flags: OpenFlags) -> AsyncResult<FileHandleRef>;

    /// Append-only write. `offset` must equal the object's current length;
    /// it validates placement and never seeks.
    fn append(&self, fh: &FileHandleRef, offset: u64, data: Bytes) -> AsyncResult<()>;

    fn read(&self, fh: &FileHandleRef, offset: u64, length: u64) -> AsyncResult<Bytes>;

    fn size(&self, fh: &FileHandleRef) -> AsyncResult<u64>;

    /// Mark the object read-only at the backend.
    fn seal(&self, fh: &FileHandleRef) -> AsyncResult<()>;

    fn remove(&self, path: &str) -> AsyncResult<()>;

    fn set_attr(&self, fh: &FileHandleRef, key: &str, value: &str) -> AsyncResult<()>;

    fn get_attr(&self, fh: &FileHandleRef, key: &str) -> AsyncResult<String>;

    fn list_attrs(&self, fh: &FileHandleRef) -> AsyncResult<BTreeMap<String, String>>;

    /// Synchronous enumeration of object keys. Only used by startup load.
    fn for_each(&self, callback: &mut dyn FnMut(&str));
}

/// Build a store from a URI:
///   memory://          volatile in-memory backend
///   local://path/to/dir one file per chunk under the directory
pub fn create_store(uri: &str) -> Result<Arc<dyn Store>> {
    if let Some(path) = uri.strip_prefix("local://") {
        if path.is_empty() {
            return Err(FlintError::Config(
                "local:// store requires a directory path".to_string(),
            ));
        }
        return Ok(Arc::new(LocalStore::new(Path::new(path))?));
    }

    if uri == "memory://" {
        return Ok(Arc::new(MemStore::new()));
    }

    Err(FlintError::Config(format!("unknown store uri: {}", uri)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_store_schemes() {
        assert!(create_store("memory://").is_ok());
        assert!(matches!(
            create_store("s3://bucket"),
            Err(FlintError::Config(_))
        ));
        assert!(matches!(create_store("local://"), Err(FlintError::Config(_))));
    }
}

//! Local-filesystem backend: one append-only file per chunk under a data
//! directory, attributes in a `<key>.attrs` sidecar JSON file.

use super::{FileHandle, FileHandleRef, OpenFlags, Store};
use crate::error::{FlintError, Result};
use crate::future::{AsyncResult, Promise};
use bytes::Bytes;
use std::any::Any;
use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

const ATTRS_SUFFIX: &str = ".attrs";

struct LocalFileHandle {
    path: String,
    file_path: PathBuf,
}

impl FileHandle for LocalFileHandle {
    fn path(&self) -> &str {
        &self.path
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct LocalStore {
    data_path: PathBuf,
}

impl LocalStore {
    pub fn new(data_path: &Path) -> Result<LocalStore> {
        std::fs::create_dir_all(data_path)?;
        Ok(LocalStore {
            data_path: data_path.to_path_buf(),
        })
    }

    fn file_path(&self, path: &str) -> PathBuf {
        self.data_path.join(path)
    }

    fn attrs_path(file_path: &Path) -> PathBuf {
        let mut name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.push_str(ATTRS_SUFFIX);
        file_path.with_file_name(name)
    }

    fn handle_paths(fh: &FileHandleRef) -> Result<(String, PathBuf)> {
        match fh.as_any().downcast_ref::<LocalFileHandle>() {
            Some(handle) => Ok((handle.path.clone(), handle.file_path.clone())),
            None => Err(FlintError::InvalidArgument(
                "handle does not belong to this store".to_string(),
            )),
        }
    }
}

fn map_io(err: std::io::Error, path: &str) -> FlintError {
    match err.kind() {
        std::io::ErrorKind::NotFound => FlintError::NotFound(path.to_string()),
        std::io::ErrorKind::AlreadyExists => FlintError::AlreadyExists(path.to_string()),
        std::io::ErrorKind::PermissionDenied => FlintError::PermissionDenied(path.to_string()),
        _ => FlintError::Io(err),
    }
}

async fn load_attrs(attrs_path: &Path) -> Result<BTreeMap<String, String>> {
    match fs::read(attrs_path).await {
        Ok(raw) => serde_json::from_slice(&raw)
            .map_err(|err| FlintError::Internal(format!("corrupt attrs file: {}", err))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(err) => Err(FlintError::Io(err)),
    }
}

async fn save_attrs(attrs_path: &Path, attrs: &BTreeMap<String, String>) -> Result<()> {
    let raw = serde_json::to_vec(attrs)
        .map_err(|err| FlintError::Internal(format!("encode attrs: {}", err)))?;
    fs::write(attrs_path, raw).await?;
    Ok(())
}

impl Store for LocalStore {
    fn open(&self, path: &str, flags: OpenFlags) -> AsyncResult<FileHandleRef> {
        let key = path.to_string();
        let file_path = self.file_path(path);
        let (promise, result) = Promise::pair();
        tokio::spawn(async move {
            let open = if flags.create {
                fs::OpenOptions::new()
                    .write(true)
                    .create(!flags.exclusive)
                    .create_new(flags.exclusive)
                    .open(&file_path)
                    .await
            } else {
                fs::File::open(&file_path).await
            };
            match open {
                Ok(_) => {
                    tracing::debug!(path = %key, "opened backend object");
                    promise.set_value(Arc::new(LocalFileHandle {
                        path: key,
                        file_path,
                    }) as FileHandleRef);
                }
                Err(err) => promise.set_error(map_io(err, &key)),
            }
        });
        result
    }

    fn append(&self, fh: &FileHandleRef, offset: u64, data: Bytes) -> AsyncResult<()> {
        let (key, file_path) = match Self::handle_paths(fh) {
            Ok(paths) => paths,
            Err(err) => return AsyncResult::error(err),
        };
        let (promise, result) = Promise::pair();
        tokio::spawn(async move {
            let open = fs::OpenOptions::new().append(true).open(&file_path).await;
            let mut file = match open {
                Ok(file) => file,
                Err(err) => return promise.set_error(map_io(err, &key)),
            };
            let current = match file.metadata().await {
                Ok(meta) => meta.len(),
                Err(err) => return promise.set_error(map_io(err, &key)),
            };
            if current != offset {
                return promise.set_error(FlintError::InvalidArgument(format!(
                    "append at {} but object length is {}",
                    offset, current
                )));
            }
            if let Err(err) = file.write_all(&data).await {
                return promise.set_error(map_io(err, &key));
            }
            if let Err(err) = file.sync_all().await {
                return promise.set_error(map_io(err, &key));
            }
            promise.set_value(());
        });
        result
    }

    fn read(&self, fh: &FileHandleRef, offset: u64, length: u64) -> AsyncResult<Bytes> {
        let (key, file_path) = match Self::handle_paths(fh) {
            Ok(paths) => paths,
            Err(err) => return AsyncResult::error(err),
        };
        let (promise, result) = Promise::pair();
        tokio::spawn(async move {
            let mut file = match fs::File::open(&file_path).await {
                Ok(file) => file,
                Err(err) => return promise.set_error(map_io(err, &key)),
            };
            if let Err(err) = file.seek(SeekFrom::Start(offset)).await {
                return promise.set_error(map_io(err, &key));
            }
            let mut buf = vec![0u8; length as usize];
            match file.read_exact(&mut buf).await {
                Ok(_) => promise.set_value(Bytes::from(buf)),
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    promise.set_error(FlintError::InvalidArgument(format!(
                        "read {}..{} beyond end of object",
                        offset,
                        offset.saturating_add(length)
                    )));
                }
                Err(err) => promise.set_error(map_io(err, &key)),
            }
        });
        result
    }

    fn size(&self, fh: &FileHandleRef) -> AsyncResult<u64> {
        let (key, file_path) = match Self::handle_paths(fh) {
            Ok(paths) => paths,
            Err(err) => return AsyncResult::error(err),
        };
        let (promise, result) = Promise::pair();
        tokio::spawn(async move {
            match fs::metadata(&file_path).await {
                Ok(meta) => promise.set_value(meta.len()),
                Err(err) => promise.set_error(map_io(err, &key)),
            }
        });
        result
    }

    fn seal(&self, fh: &FileHandleRef) -> AsyncResult<()> {
        let (key, file_path) = match Self::handle_paths(fh) {
            Ok(paths) => paths,
            Err(err) => return AsyncResult::error(err),
        };
        let (promise, result) = Promise::pair();
        tokio::spawn(async move {
            let meta = match fs::metadata(&file_path).await {
                Ok(meta) => meta,
                Err(err) => return promise.set_error(map_io(err, &key)),
            };
            let mut perms = meta.permissions();
            perms.set_readonly(true);
            match fs::set_permissions(&file_path, perms).await {
                Ok(()) => promise.set_value(()),
                Err(err) => promise.set_error(map_io(err, &key)),
            }
        });
        result
    }

    fn remove(&self, path: &str) -> AsyncResult<()> {
        let key = path.to_string();
        let file_path = self.file_path(path);
        let attrs_path = Self::attrs_path(&file_path);
        let (promise, result) = Promise::pair();
        tokio::spawn(async move {
            if let Err(err) = fs::remove_file(&file_path).await {
                return promise.set_error(map_io(err, &key));
            }
            // Sidecar may legitimately be absent.
            if let Err(err) = fs::remove_file(&attrs_path).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %key, error = %err, "failed to remove attrs sidecar");
                }
            }
            promise.set_value(());
        });
        result
    }

    fn set_attr(&self, fh: &FileHandleRef, key: &str, value: &str) -> AsyncResult<()> {
        let (_, file_path) = match Self::handle_paths(fh) {
            Ok(paths) => paths,
            Err(err) => return AsyncResult::error(err),
        };
        let attrs_path = Self::attrs_path(&file_path);
        let key = key.to_string();
        let value = value.to_string();
        let (promise, result) = Promise::pair();
        tokio::spawn(async move {
            let mut attrs = match load_attrs(&attrs_path).await {
                Ok(attrs) => attrs,
                Err(err) => return promise.set_error(err),
            };
            attrs.insert(key, value);
            match save_attrs(&attrs_path, &attrs).await {
                Ok(()) => promise.set_value(()),
                Err(err) => promise.set_error(err),
            }
        });
        result
    }

    fn get_attr(&self, fh: &FileHandleRef, key: &str) -> AsyncResult<String> {
        let (object, file_path) = match Self::handle_paths(fh) {
            Ok(paths) => paths,
            Err(err) => return AsyncResult::error(err),
        };
        let attrs_path = Self::attrs_path(&file_path);
        let key = key.to_string();
        let (promise, result) = Promise::pair();
        tokio::spawn(async move {
            match load_attrs(&attrs_path).await {
                Ok(attrs) => match attrs.get(&key) {
                    Some(value) => promise.set_value(value.clone()),
                    None => promise
                        .set_error(FlintError::NotFound(format!("{}#{}", object, key))),
                },
                Err(err) => promise.set_error(err),
            }
        });
        result
    }

    fn list_attrs(&self, fh: &FileHandleRef) -> AsyncResult<BTreeMap<String, String>> {
        let (_, file_path) = match Self::handle_paths(fh) {
            Ok(paths) => paths,
            Err(err) => return AsyncResult::error(err),
        };
        let attrs_path = Self::attrs_path(&file_path);
        let (promise, result) = Promise::pair();
        tokio::spawn(async move {
            match load_attrs(&attrs_path).await {
                Ok(attrs) => promise.set_value(attrs),
                Err(err) => promise.set_error(err),
            }
        });
        result
    }

    fn for_each(&self, callback: &mut dyn FnMut(&str)) {
        let entries = match std::fs::read_dir(&self.data_path) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::error!(path = %self.data_path.display(), error = %err, "failed to enumerate store");
                return;
            }
        };
        for entry in entries.flatten() {
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(ATTRS_SUFFIX) || name.ends_with(".tmp") {
                continue;
            }
            callback(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();

        let fh = store
            .open("chunk-a", OpenFlags::create_exclusive())
            .await
            .unwrap();
        store
            .append(&fh, 0, Bytes::from_static(b"hello"))
            .await
            .unwrap();
        store
            .append(&fh, 5, Bytes::from_static(b" world"))
            .await
            .unwrap();

        assert_eq!(store.size(&fh).await.unwrap(), 11);
        assert_eq!(
            store.read(&fh, 6, 5).await.unwrap(),
            Bytes::from_static(b"world")
        );

        let err = store
            .append(&fh, 3, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, FlintError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_exclusive_create_collision() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();

        store
            .open("chunk-a", OpenFlags::create_exclusive())
            .await
            .unwrap();
        let err = store
            .open("chunk-a", OpenFlags::create_exclusive())
            .await
            .unwrap_err();
        assert!(matches!(err, FlintError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_attrs_survive_in_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();

        let fh = store
            .open("chunk-a", OpenFlags::create_exclusive())
            .await
            .unwrap();
        store.set_attr(&fh, "append-out-of-order", "1").await.unwrap();
        store.set_attr(&fh, "digest", "0").await.unwrap();

        let reopened = store
            .open("chunk-a", OpenFlags::read_only())
            .await
            .unwrap();
        assert_eq!(
            store
                .get_attr(&reopened, "append-out-of-order")
                .await
                .unwrap(),
            "1"
        );
        let attrs = store.list_attrs(&reopened).await.unwrap();
        assert_eq!(attrs.len(), 2);

        // Sidecar files stay out of enumeration.
        let mut seen = Vec::new();
        store.for_each(&mut |path| seen.push(path.to_string()));
        assert_eq!(seen, vec!["chunk-a"]);
    }

    #[tokio::test]
    async fn test_seal_marks_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();

        let fh = store
            .open("chunk-a", OpenFlags::create_exclusive())
            .await
            .unwrap();
        store
            .append(&fh, 0, Bytes::from_static(b"data"))
            .await
            .unwrap();
        store.seal(&fh).await.unwrap();

        let err = store
            .append(&fh, 4, Bytes::from_static(b"more"))
            .await
            .unwrap_err();
        assert!(matches!(err, FlintError::PermissionDenied(_)));

        // Removal still works on sealed objects.
        store.remove("chunk-a").await.unwrap();
        assert!(matches!(
            store.remove("chunk-a").await.unwrap_err(),
            FlintError::NotFound(_)
        ));
    }
}

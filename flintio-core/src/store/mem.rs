//! Volatile in-memory backend for local development and tests.

use super::{FileHandle, FileHandleRef, OpenFlags, Store};
use crate::error::FlintError;
use crate::future::AsyncResult;
use bytes::Bytes;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

struct MemFileHandle {
    path: String,
}

impl FileHandle for MemFileHandle {
    fn path(&self) -> &str {
        &self.path
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
struct MemObject {
    data: Vec<u8>,
    attrs: BTreeMap<String, String>,
    sealed: bool,
}

/// Everything completes synchronously; results are handed back through
/// already-resolved [`AsyncResult`]s.
#[derive(Default)]
pub struct MemStore {
    objects: Mutex<HashMap<String, MemObject>>,
}

impl MemStore {
    pub fn new() -> MemStore {
        MemStore::default()
    }

    fn handle_path(fh: &FileHandleRef) -> Result<String, FlintError> {
        match fh.as_any().downcast_ref::<MemFileHandle>() {
            Some(handle) => Ok(handle.path.clone()),
            None => Err(FlintError::InvalidArgument(
                "handle does not belong to this store".to_string(),
            )),
        }
    }
}

impl Store for MemStore {
    fn open(&self, path: &str, flags: OpenFlags) -> AsyncResult<FileHandleRef> {
        let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        let exists = objects.contains_key(path);

        if flags.create && flags.exclusive && exists {
            return AsyncResult::error(FlintError::AlreadyExists(path.to_string()));
        }
        if !flags.create && !exists {
            return AsyncResult::error(FlintError::NotFound(path.to_string()));
        }
        if flags.create && !exists {
            objects.insert(path.to_string(), MemObject::default());
        }

        AsyncResult::ready(Arc::new(MemFileHandle {
            path: path.to_string(),
        }) as FileHandleRef)
    }

    fn append(&self, fh: &FileHandleRef, offset: u64, data: Bytes) -> AsyncResult<()> {
        let path = match Self::handle_path(fh) {
            Ok(path) => path,
            Err(err) => return AsyncResult::error(err),
        };
        let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        let Some(object) = objects.get_mut(&path) else {
            return AsyncResult::error(FlintError::NotFound(path));
        };
        if object.sealed {
            return AsyncResult::error(FlintError::PermissionDenied(format!(
                "{} is sealed",
                path
            )));
        }
        if offset != object.data.len() as u64 {
            return AsyncResult::error(FlintError::InvalidArgument(format!(
                "append at {} but object length is {}",
                offset,
                object.data.len()
            )));
        }
        object.data.extend_from_slice(&data);
        AsyncResult::ready(())
    }

    fn read(&self, fh: &FileHandleRef, offset: u64, length: u64) -> AsyncResult<Bytes> {
        let path = match Self::handle_path(fh) {
            Ok(path) => path,
            Err(err) => return AsyncResult::error(err),
        };
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        let Some(object) = objects.get(&path) else {
            return AsyncResult::error(FlintError::NotFound(path));
        };
        let Some(end) = offset.checked_add(length) else {
            return AsyncResult::error(FlintError::InvalidArgument(
                "read range overflows".to_string(),
            ));
        };
        if end > object.data.len() as u64 {
            return AsyncResult::error(FlintError::InvalidArgument(format!(
                "read {}..{} but object length is {}",
                offset,
                end,
                object.data.len()
            )));
        }
        AsyncResult::ready(Bytes::copy_from_slice(
            &object.data[offset as usize..end as usize],
        ))
    }

    fn size(&self, fh: &FileHandleRef) -> AsyncResult<u64> {
        let path = match Self::handle_path(fh) {
            Ok(path) => path,
            Err(err) => return AsyncResult::error(err),
        };
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        match objects.get(&path) {
            Some(object) => AsyncResult::ready(object.data.len() as u64),
            None => AsyncResult::error(FlintError::NotFound(path)),
        }
    }

    fn seal(&self, fh: &FileHandleRef) -> AsyncResult<()> {
        let path = match Self::handle_path(fh) {
            Ok(path) => path,
            Err(err) => return AsyncResult::error(err),
        };
        let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        match objects.get_mut(&path) {
            Some(object) => {
                object.sealed = true;
                AsyncResult::ready(())
            }
            None => AsyncResult::error(FlintError::NotFound(path)),
        }
    }

    fn remove(&self, path: &str) -> AsyncResult<()> {
        let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        match objects.remove(path) {
            Some(_) => AsyncResult::ready(()),
            None => AsyncResult::error(FlintError::NotFound(path.to_string())),
        }
    }

    fn set_attr(&self, fh: &FileHandleRef, key: &str, value: &str) -> AsyncResult<()> {
        let path = match Self::handle_path(fh) {
            Ok(path) => path,
            Err(err) => return AsyncResult::error(err),
        };
        let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        match objects.get_mut(&path) {
            Some(object) => {
                object.attrs.insert(key.to_string(), value.to_string());
                AsyncResult::ready(())
            }
            None => AsyncResult::error(FlintError::NotFound(path)),
        }
    }

    fn get_attr(&self, fh: &FileHandleRef, key: &str) -> AsyncResult<String> {
        let path = match Self::handle_path(fh) {
            Ok(path) => path,
            Err(err) => return AsyncResult::error(err),
        };
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        let Some(object) = objects.get(&path) else {
            return AsyncResult::error(FlintError::NotFound(path));
        };
        match object.attrs.get(key) {
            Some(value) => AsyncResult::ready(value.clone()),
            None => AsyncResult::error(FlintError::NotFound(format!("{}#{}", path, key))),
        }
    }

    fn list_attrs(&self, fh: &FileHandleRef) -> AsyncResult<BTreeMap<String, String>> {
        let path = match Self::handle_path(fh) {
            Ok(path) => path,
            Err(err) => return AsyncResult::error(err),
        };
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        match objects.get(&path) {
            Some(object) => AsyncResult::ready(object.attrs.clone()),
            None => AsyncResult::error(FlintError::NotFound(path)),
        }
    }

    fn for_each(&self, callback: &mut dyn FnMut(&str)) {
        let mut paths: Vec<String> = {
            let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
            objects.keys().cloned().collect()
        };
        paths.sort();
        for path in paths {
            callback(&path);
        }
    }
}

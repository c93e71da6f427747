//! In-memory object store for testing.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use super::{ObjectId, ObjectStore};
use crate::remote::TransportError;

/// Exit code reported for unknown objects, matching the client's ENOENT.
const NOT_FOUND_EXIT: i32 = 2;

#[derive(Debug, Default)]
struct Inner {
    objects: HashMap<String, Vec<u8>>,
    deleted: HashSet<String>,
    corrupted: HashSet<String>,
    corrupt_all: bool,
    fail_puts: bool,
}

/// Thread-safe in-memory data plane.
///
/// Clones share the same objects, so one store can back many workers. Faults
/// can be injected per object (`corrupt`, `lose`) or globally.
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryObjectStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().objects.len()
    }

    /// True if no objects are stored.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().objects.is_empty()
    }

    /// Return flipped content for one object on every `get`.
    pub fn corrupt(&self, id: &ObjectId) {
        self.inner.lock().unwrap().corrupted.insert(id.0.clone());
    }

    /// Return flipped content for every `get`.
    pub fn corrupt_all(&self) {
        self.inner.lock().unwrap().corrupt_all = true;
    }

    /// Drop an object without recording a delete, as if the service lost it.
    pub fn lose(&self, id: &ObjectId) {
        self.inner.lock().unwrap().objects.remove(&id.0);
    }

    /// Make every `put` fail.
    pub fn fail_puts(&self) {
        self.inner.lock().unwrap().fail_puts = true;
    }

    fn not_found(verb: &str, id: &ObjectId, deleted: bool) -> TransportError {
        let reason = if deleted { "object deleted" } else { "object not found" };
        TransportError::CommandFailed {
            host: "memory".to_string(),
            command: format!("{} -i {}", verb, id),
            exit_code: NOT_FOUND_EXIT,
            stderr: reason.to_string(),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, path: &Path) -> Result<ObjectId, TransportError> {
        if self.inner.lock().unwrap().fail_puts {
            return Err(TransportError::CommandFailed {
                host: "memory".to_string(),
                command: format!("put -f {}", path.display()),
                exit_code: 1,
                stderr: "put refused".to_string(),
            });
        }
        let content = tokio::fs::read(path).await?;
        let id = Uuid::new_v4().simple().to_string();
        self.inner.lock().unwrap().objects.insert(id.clone(), content);
        Ok(ObjectId(id))
    }

    async fn get(&self, id: &ObjectId, out: &Path) -> Result<(), TransportError> {
        let content = {
            let inner = self.inner.lock().unwrap();
            let mut content = inner
                .objects
                .get(&id.0)
                .cloned()
                .ok_or_else(|| Self::not_found("get", id, inner.deleted.contains(&id.0)))?;
            if inner.corrupt_all || inner.corrupted.contains(&id.0) {
                match content.first_mut() {
                    Some(byte) => *byte ^= 0xFF,
                    None => content.push(0),
                }
            }
            content
        };
        tokio::fs::write(out, content).await?;
        Ok(())
    }

    async fn delete(&self, id: &ObjectId) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.objects.remove(&id.0).is_none() {
            return Err(Self::not_found("delete", id, inner.deleted.contains(&id.0)));
        }
        inner.deleted.insert(id.0.clone());
        Ok(())
    }
}

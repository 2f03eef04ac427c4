use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use haven_core::{BlobLocator, BlobStore, HavenError, HavenResult};

use crate::audit::{AuditEntry, AuditStore};

// ---------------------------------------------------------------------------
// Audit stores
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryAuditStore {
    entries: Mutex<Vec<AuditEntry>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditStore for InMemoryAuditStore {
    fn append(&self, entry: &AuditEntry) -> HavenResult<()> {
        self.entries
            .lock()
            .map_err(|_| HavenError::AuditPersistence("audit store lock poisoned".into()))?
            .push(entry.clone());
        Ok(())
    }

    fn load(&self) -> HavenResult<Vec<AuditEntry>> {
        let mut entries = self
            .entries
            .lock()
            .map(|e| e.clone())
            .map_err(|_| HavenError::AuditPersistence("audit store lock poisoned".into()))?;
        entries.sort_by_key(|e| e.sequence);
        Ok(entries)
    }
}

impl<T: AuditStore + ?Sized> AuditStore for Arc<T> {
    fn append(&self, entry: &AuditEntry) -> HavenResult<()> {
        (**self).append(entry)
    }

    fn load(&self) -> HavenResult<Vec<AuditEntry>> {
        (**self).load()
    }
}

/// Append-only JSON-lines file, one entry per line.
pub struct JsonlAuditStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlAuditStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditStore for JsonlAuditStore {
    fn append(&self, entry: &AuditEntry) -> HavenResult<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| HavenError::AuditPersistence("audit file lock poisoned".into()))?;
        let mut line = serde_json::to_vec(entry)
            .map_err(|e| HavenError::AuditPersistence(format!("encode: {}", e)))?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| HavenError::AuditPersistence(format!("open audit log: {}", e)))?;
        file.write_all(&line)
            .and_then(|_| file.flush())
            .map_err(|e| HavenError::AuditPersistence(format!("write audit log: {}", e)))
    }

    fn load(&self) -> HavenResult<Vec<AuditEntry>> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(HavenError::Storage(format!("open audit log: {}", e))),
        };
        let mut entries = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| HavenError::Storage(format!("read audit log: {}", e)))?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: AuditEntry = serde_json::from_str(&line).map_err(|e| {
                HavenError::Serialization(format!("audit log line {}: {}", n + 1, e))
            })?;
            entries.push(entry);
        }
        // Concurrent appends can land out of order.
        entries.sort_by_key(|e| e.sequence);
        Ok(entries)
    }
}

// ---------------------------------------------------------------------------
// Blob stores
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStore for InMemoryBlobStore {
    fn put(&self, key: &str, bytes: &[u8]) -> HavenResult<BlobLocator> {
        let locator = format!("mem://{key}");
        self.blobs
            .lock()
            .map_err(|_| HavenError::Storage("blob store lock poisoned".into()))?
            .insert(locator.clone(), bytes.to_vec());
        Ok(BlobLocator(locator))
    }

    fn get(&self, locator: &BlobLocator) -> HavenResult<Vec<u8>> {
        self.blobs
            .lock()
            .map_err(|_| HavenError::Storage("blob store lock poisoned".into()))?
            .get(locator.as_str())
            .cloned()
            .ok_or_else(|| HavenError::NotFound(format!("blob {}", locator)))
    }
}

/// One file per blob under a root directory.
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> HavenResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| HavenError::Storage(format!("create {}: {}", root.display(), e)))?;
        Ok(Self { root })
    }

    fn validate_key(key: &str) -> HavenResult<()> {
        let ok = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if ok {
            Ok(())
        } else {
            Err(HavenError::Storage(format!("invalid blob key: {key}")))
        }
    }
}

impl BlobStore for FileBlobStore {
    fn put(&self, key: &str, bytes: &[u8]) -> HavenResult<BlobLocator> {
        Self::validate_key(key)?;
        let path = self.root.join(key);
        fs::write(&path, bytes)
            .map_err(|e| HavenError::Storage(format!("write {}: {}", path.display(), e)))?;
        Ok(BlobLocator(path.to_string_lossy().into_owned()))
    }

    fn get(&self, locator: &BlobLocator) -> HavenResult<Vec<u8>> {
        let not_found = || HavenError::NotFound(format!("blob {}", locator));
        // Exactly one plain file name below the root; `..` and nested paths
        // never resolve.
        let key = Path::new(locator.as_str())
            .strip_prefix(&self.root)
            .ok()
            .and_then(|rel| {
                let mut parts = rel.components();
                match (parts.next(), parts.next()) {
                    (Some(Component::Normal(name)), None) => name.to_str(),
                    _ => None,
                }
            })
            .ok_or_else(not_found)?;
        Self::validate_key(key).map_err(|_| not_found())?;
        let path = self.root.join(key);
        fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => HavenError::NotFound(format!("blob {}", locator)),
            _ => HavenError::Storage(format!("read {}: {}", path.display(), e)),
        })
    }
}

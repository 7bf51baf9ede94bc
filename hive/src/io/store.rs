//! Persistence port: durable key/document storage.
//!
//! Keys are `/`-separated paths of `[A-Za-z0-9._-]` segments. Both stores are
//! internally synchronized; callers never coordinate locking themselves.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, anyhow};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

use crate::io::document::{Document, DocumentError};

const EXTENSION: &str = "md";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document '{0}' not found")]
    NotFound(String),
    #[error("invalid key '{0}'")]
    InvalidKey(String),
    #[error("document '{key}' is malformed: {source}")]
    Malformed {
        key: String,
        #[source]
        source: DocumentError,
    },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub trait Store: Send + Sync {
    fn read(&self, key: &str) -> Result<Document, StoreError>;
    fn write(&self, key: &str, doc: &Document) -> Result<(), StoreError>;
    /// Keys starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

pub fn validate_key(key: &str) -> Result<(), StoreError> {
    let valid = !key.is_empty()
        && key.split('/').all(|segment| {
            !segment.is_empty()
                && segment != "."
                && segment != ".."
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        });
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

fn render(key: &str, doc: &Document) -> Result<String, StoreError> {
    doc.render().map_err(|source| StoreError::Malformed {
        key: key.to_string(),
        source,
    })
}

fn parse(key: &str, raw: &str) -> Result<Document, StoreError> {
    Document::parse(raw).map_err(|source| StoreError::Malformed {
        key: key.to_string(),
        source,
    })
}

/// One `.md` file per key under a root directory.
pub struct FileStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.{EXTENSION}"))
    }
}

impl Store for FileStore {
    fn read(&self, key: &str) -> Result<Document, StoreError> {
        validate_key(key)?;
        let path = self.path_for(key);
        let _guard = self.lock.lock().map_err(|_| anyhow!("file store lock poisoned"))?;
        if !path.exists() {
            return Err(StoreError::NotFound(key.to_string()));
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("read document {}", path.display()))?;
        parse(key, &raw)
    }

    fn write(&self, key: &str, doc: &Document) -> Result<(), StoreError> {
        validate_key(key)?;
        let raw = render(key, doc)?;
        let path = self.path_for(key);
        let _guard = self.lock.lock().map_err(|_| anyhow!("file store lock poisoned"))?;
        write_atomic(&path, &raw)?;
        debug!(key, path = %path.display(), "document written");
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("file store lock poisoned"))?;
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let suffix = format!(".{EXTENSION}");
        let mut keys = Vec::new();
        for entry in WalkDir::new(&self.root) {
            let entry = entry.with_context(|| format!("walk {}", self.root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let relative = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if let Some(key) = relative.strip_suffix(&suffix)
                && key.starts_with(prefix)
            {
                keys.push(key.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}

fn write_atomic(path: &Path, contents: &str) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("document path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("md.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp document {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace document {}", path.display()))?;
    Ok(())
}

/// In-process store. Documents are kept rendered so the codec is exercised
/// the same way as on disk.
#[derive(Default)]
pub struct MemoryStore {
    docs: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn read(&self, key: &str) -> Result<Document, StoreError> {
        validate_key(key)?;
        let docs = self.docs.lock().map_err(|_| anyhow!("memory store lock poisoned"))?;
        let raw = docs
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        parse(key, raw)
    }

    fn write(&self, key: &str, doc: &Document) -> Result<(), StoreError> {
        validate_key(key)?;
        let raw = render(key, doc)?;
        let mut docs = self.docs.lock().map_err(|_| anyhow!("memory store lock poisoned"))?;
        docs.insert(key.to_string(), raw);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let docs = self.docs.lock().map_err(|_| anyhow!("memory store lock poisoned"))?;
        Ok(docs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

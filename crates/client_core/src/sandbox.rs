use std::{
    fs, io,
    path::PathBuf,
    sync::{Mutex, PoisonError},
};

use anyhow::{Context, Result};
use shared::protocol::Document;

/// Local mirror of a sandbox canvas, kept in sync on every change so an
/// unsaved sandbox survives a reload.
pub trait SandboxCache: Send + Sync {
    fn store(&self, document: &Document) -> Result<()>;
    fn load(&self) -> Result<Option<Document>>;
}

#[derive(Default)]
pub struct MemorySandboxCache {
    latest: Mutex<Option<Document>>,
}

impl MemorySandboxCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SandboxCache for MemorySandboxCache {
    fn store(&self, document: &Document) -> Result<()> {
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(document.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<Document>> {
        Ok(self
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

pub struct FileSandboxCache {
    path: PathBuf,
}

impl FileSandboxCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SandboxCache for FileSandboxCache {
    fn store(&self, document: &Document) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create sandbox cache dir {}", parent.display())
            })?;
        }
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, document.as_str())
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        match fs::rename(&tmp_path, &self.path) {
            Ok(()) => Ok(()),
            Err(rename_err) => {
                if self.path.exists() {
                    fs::remove_file(&self.path).with_context(|| {
                        format!("failed to remove stale {}", self.path.display())
                    })?;
                    fs::rename(&tmp_path, &self.path)
                        .with_context(|| format!("failed to replace {}", self.path.display()))
                } else {
                    Err(rename_err)
                        .with_context(|| format!("failed to replace {}", self.path.display()))
                }
            }
        }
    }

    fn load(&self) -> Result<Option<Document>> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(Some(Document::new(text))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("failed to read {}", self.path.display()))
            }
        }
    }
}

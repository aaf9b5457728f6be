//! Persisted launcher layout and app state.
//!
//! The layout is a small versioned JSON document. Loading never fails the
//! boot: a missing, corrupt or unreadable document falls back to the default
//! layout with a warning.
//!
//! ```json
//! {
//!   "version": 1,
//!   "app_order": ["launcher", "calculator"],
//!   "app_state": { "clock": { "uptime_ms": 1200 } }
//! }
//! ```

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};

use crate::error::LayoutError;

/// Versioned layout document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedLayout {
    /// Document version, for migration
    pub version: u32,
    /// Launcher order of app ids
    #[serde(default)]
    pub app_order: Vec<String>,
    /// Last saved state per app id
    #[serde(default)]
    pub app_state: BTreeMap<String, serde_json::Value>,
}

impl PersistedLayout {
    /// Current document version.
    pub const CURRENT_VERSION: u32 = 1;

    /// Layout at the current version.
    pub fn new(app_order: Vec<String>, app_state: BTreeMap<String, serde_json::Value>) -> Self {
        Self { version: Self::CURRENT_VERSION, app_order, app_state }
    }

    /// Whether the document predates the current version.
    pub fn needs_migration(&self) -> bool {
        self.version < Self::CURRENT_VERSION
    }

    /// Bring an older document up to the current version.
    pub fn migrate(&mut self) {
        // Version 0 documents were written before app state existed.
        if self.version == 0 {
            self.app_state.clear();
        }
        self.version = Self::CURRENT_VERSION;
    }

    /// Parse a document, migrating older versions.
    ///
    /// # Errors
    /// Returns `Malformed` for invalid JSON or a version from the future.
    pub fn try_decode(bytes: &[u8]) -> Result<Self, LayoutError> {
        let mut layout: Self = serde_json::from_slice(bytes)?;
        if layout.version > Self::CURRENT_VERSION {
            return Err(LayoutError::Malformed(serde::de::Error::custom(format!(
                "unsupported layout version {}",
                layout.version
            ))));
        }
        if layout.needs_migration() {
            layout.migrate();
        }
        Ok(layout)
    }

    /// Parse a document, falling back to the default layout.
    pub fn decode(bytes: Option<&[u8]>) -> Self {
        let Some(bytes) = bytes else {
            return Self::new(Vec::new(), BTreeMap::new());
        };

        match Self::try_decode(bytes) {
            Ok(layout) => layout,
            Err(error) => {
                tracing::warn!(%error, "persisted layout unusable, using defaults");
                Self::new(Vec::new(), BTreeMap::new())
            },
        }
    }

    /// Serialize to JSON.
    pub fn encode(&self) -> Result<Vec<u8>, LayoutError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

/// Where a device keeps its layout.
pub trait LayoutStore: Send + Sync {
    /// Load the stored document, `None` if nothing was saved yet.
    fn load(&self) -> Result<Option<Vec<u8>>, LayoutError>;

    /// Replace the stored document.
    fn save(&self, bytes: &[u8]) -> Result<(), LayoutError>;
}

/// In-memory store, for tests and headless sessions.
#[derive(Debug, Default)]
pub struct MemoryLayoutStore {
    document: Mutex<Option<Vec<u8>>>,
}

impl MemoryLayoutStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LayoutStore for MemoryLayoutStore {
    fn load(&self) -> Result<Option<Vec<u8>>, LayoutError> {
        Ok(self.document.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn save(&self, bytes: &[u8]) -> Result<(), LayoutError> {
        *self.document.lock().unwrap_or_else(PoisonError::into_inner) = Some(bytes.to_vec());
        Ok(())
    }
}

/// Store backed by one file.
///
/// Saves go through a sibling temp file and a rename so that a crash never
/// leaves a half-written document behind.
#[derive(Debug, Clone)]
pub struct FileLayoutStore {
    path: PathBuf,
}

impl FileLayoutStore {
    /// Store at `path`. The file need not exist yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl LayoutStore for FileLayoutStore {
    fn load(&self) -> Result<Option<Vec<u8>>, LayoutError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, bytes: &[u8]) -> Result<(), LayoutError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

//! Records persisted between builds

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ChunkId;
use crate::error::Result;

/// State carried from one build to the next
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Records {
    /// Splits made by aggressive splitting, replayed in later builds
    #[serde(default)]
    pub aggressive_splits: Vec<SplitRecord>,
}

/// A split decision, identified by the module identifiers it contained
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitRecord {
    /// Module identifiers relative to the project context, sorted
    pub modules: Vec<String>,

    #[serde(default)]
    pub hash: Option<String>,

    #[serde(default)]
    pub id: Option<ChunkId>,

    /// Set while saving when the chunk no longer matches; never persisted
    #[serde(skip)]
    pub invalid: bool,
}

impl SplitRecord {
    pub fn new(modules: Vec<String>) -> Self {
        Self {
            modules,
            ..Self::default()
        }
    }
}

impl Records {
    /// Load records from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let records: Records = serde_json::from_str(&content)?;
        debug!(
            "Loaded {} aggressive splits from {}",
            records.aggressive_splits.len(),
            path.display()
        );
        Ok(records)
    }

    /// Load records, starting empty when the file does not exist yet
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.aggressive_splits.is_empty()
    }
}

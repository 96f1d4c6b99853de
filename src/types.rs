//! Core types for nozomi-dl

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Item identifier as stored in data blobs and sorted-ID lists
pub type ItemId = u32;

/// Unordered set of matching item identifiers
pub type ResultSet = HashSet<ItemId>;

/// One file of a retrievable item
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileManifestEntry {
    /// Name the file gets inside the archive
    pub logical_name: String,
    /// Hex content hash, used to derive the download URL
    pub content_hash: String,
}

impl FileManifestEntry {
    /// Create a manifest entry
    pub fn new(logical_name: impl Into<String>, content_hash: impl Into<String>) -> Self {
        Self {
            logical_name: logical_name.into(),
            content_hash: content_hash.into(),
        }
    }
}

/// Result ordering for search
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultOrder {
    /// Set order, no sorting
    #[default]
    Unordered,
    /// Descending by identifier
    NewestFirst,
}

/// Event emitted during retrieval
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Retrieval of an item started
    Started {
        /// Item being retrieved
        item: ItemId,
        /// Number of files in the manifest
        total: usize,
    },

    /// One file finished downloading
    FileDownloaded {
        /// Item being retrieved
        item: ItemId,
        /// Logical name of the file
        name: String,
        /// Files finished so far
        completed: usize,
        /// Number of files in the manifest
        total: usize,
    },

    /// Derived URLs were rejected and the routing table was refreshed
    ObfuscationRefreshed {
        /// Item being retrieved
        item: ItemId,
    },

    /// Archive assembled
    Completed {
        /// Item that was retrieved
        item: ItemId,
        /// Number of archived files
        files: usize,
        /// Total downloaded bytes
        bytes: u64,
    },

    /// Retrieval failed
    Failed {
        /// Item being retrieved
        item: ItemId,
        /// Error message
        error: String,
    },
}

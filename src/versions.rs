//! Index version tokens
//!
//! Every logical index is published under an opaque version token that changes
//! whenever the index is rebuilt. Node and data files embed the token in their
//! names, so a stale token either 404s or, worse, points at a file whose layout
//! no longer matches the addresses we hold.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::config::EndpointConfig;
use crate::error::{Error, Result};
use crate::fetch::RangedFetcher;

/// The logical indexes published by the index host
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexKind {
    /// Per-tag B-trees (any field not listed below)
    Tag,
    /// Full-text item index
    Galleries,
    /// Language index
    Languages,
    /// Sorted-list URL index
    NozomiUrl,
}

impl IndexKind {
    /// All indexes, in refresh order
    pub const ALL: [IndexKind; 4] = [
        IndexKind::Tag,
        IndexKind::Galleries,
        IndexKind::Languages,
        IndexKind::NozomiUrl,
    ];

    /// Directory on the index host
    pub fn dir(&self) -> &'static str {
        match self {
            IndexKind::Tag => "tagindex",
            IndexKind::Galleries => "galleriesindex",
            IndexKind::Languages => "languagesindex",
            IndexKind::NozomiUrl => "nozomiurlindex",
        }
    }

    /// Index that stores `field`
    pub fn for_field(field: &str) -> Self {
        match field {
            "galleries" => IndexKind::Galleries,
            "languages" => IndexKind::Languages,
            "nozomiurl" => IndexKind::NozomiUrl,
            _ => IndexKind::Tag,
        }
    }
}

/// Path of an index file, e.g. `galleriesindex/galleries.1717132361.index`
pub fn index_file_path(field: &str, version: &str, extension: &str) -> String {
    format!(
        "{}/{}.{}.{}",
        IndexKind::for_field(field).dir(),
        field,
        version,
        extension
    )
}

/// Cache of version tokens, one per [`IndexKind`]
///
/// Lookups take a read lock. A refresh fetches the new token without holding
/// any lock and then swaps it in under the write lock, so readers never wait
/// on the network and never see a half-written entry.
pub struct IndexVersions {
    fetcher: RangedFetcher,
    endpoints: EndpointConfig,
    versions: RwLock<HashMap<IndexKind, String>>,
}

impl IndexVersions {
    /// Create an empty cache; tokens are fetched on first use
    pub fn new(fetcher: RangedFetcher, endpoints: EndpointConfig) -> Self {
        Self {
            fetcher,
            endpoints,
            versions: RwLock::new(HashMap::new()),
        }
    }

    /// Current token for `kind`, fetching it if none is cached
    pub async fn get(&self, kind: IndexKind) -> Result<String> {
        if let Some(version) = self.versions.read().await.get(&kind) {
            return Ok(version.clone());
        }
        self.refresh(kind).await
    }

    /// Install a token directly, bypassing the network
    pub async fn set(&self, kind: IndexKind, version: impl Into<String>) {
        self.versions.write().await.insert(kind, version.into());
    }

    /// Fetch the current token for `kind` and swap it in
    pub async fn refresh(&self, kind: IndexKind) -> Result<String> {
        let url = self.endpoints.index_url(&format!(
            "{}/version?_={}",
            kind.dir(),
            chrono::Utc::now().timestamp_millis()
        ));
        let body = self.fetcher.fetch(&url).await?;
        let version = String::from_utf8_lossy(&body).trim().to_string();
        if version.is_empty() {
            tracing::error!(index = kind.dir(), "Empty version token");
            return Err(Error::InvalidInput(format!("empty version token from {url}")));
        }

        let previous = self
            .versions
            .write()
            .await
            .insert(kind, version.clone());
        tracing::info!(
            index = kind.dir(),
            version = %version,
            previous = ?previous,
            "Index version refreshed"
        );
        Ok(version)
    }

    /// Refresh `kind` unless another task already replaced `seen`
    ///
    /// Returns the token now in effect.
    pub async fn refresh_if_unchanged(&self, kind: IndexKind, seen: &str) -> Result<String> {
        if let Some(current) = self.versions.read().await.get(&kind)
            && current != seen
        {
            return Ok(current.clone());
        }
        self.refresh(kind).await
    }

    /// Refresh every index concurrently
    pub async fn refresh_all(&self) -> Result<()> {
        futures::future::try_join_all(IndexKind::ALL.iter().map(|kind| self.refresh(*kind)))
            .await?;
        Ok(())
    }

    /// Copy of all cached tokens
    pub async fn snapshot(&self) -> HashMap<IndexKind, String> {
        self.versions.read().await.clone()
    }
}

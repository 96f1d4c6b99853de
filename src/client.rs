//! Session facade
//!
//! [`NozomiClient`] owns one logical session: a version cache, a routing table
//! cache and a shared transport. Everything it hands out borrows those, so a
//! refresh triggered by one search is seen by every later call.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::archive::{archive_file_name, save_archive};
use crate::btree::IndexClient;
use crate::config::Config;
use crate::error::Result;
use crate::fetch::{HttpTransport, RangedFetcher, Transport};
use crate::gallery::{Gallery, GalleryClient};
use crate::nozomi::NozomiReader;
use crate::obfuscation::ObfuscationResolver;
use crate::pipeline::{Pipeline, RetrievalJob, Retrieved};
use crate::search::{SearchOptions, Searcher};
use crate::types::{Event, ItemId, ResultSet};
use crate::versions::IndexVersions;

/// Capacity of the progress event channel
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Search and download client for one session
#[derive(Clone)]
pub struct NozomiClient {
    config: Arc<Config>,
    versions: Arc<IndexVersions>,
    resolver: Arc<ObfuscationResolver>,
    searcher: Searcher,
    galleries: GalleryClient,
    pipeline: Pipeline,
    event_tx: broadcast::Sender<Event>,
}

impl NozomiClient {
    /// Create a client that talks HTTP
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let transport = HttpTransport::new(&config)?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Create a client over a custom transport
    pub fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let fetcher = RangedFetcher::new(transport, config.retry.clone());
        let endpoints = config.endpoints.clone();

        let versions = Arc::new(IndexVersions::new(fetcher.clone(), endpoints.clone()));
        let resolver = Arc::new(ObfuscationResolver::new(
            fetcher.clone(),
            endpoints.clone(),
            config.obfuscation.clone(),
        ));
        let searcher = Searcher::new(
            IndexClient::new(fetcher.clone(), endpoints.clone(), versions.clone()),
            NozomiReader::new(fetcher.clone(), endpoints.clone()),
        );
        let galleries = GalleryClient::new(fetcher.clone(), endpoints.clone());
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let pipeline = Pipeline::new(
            fetcher,
            resolver.clone(),
            endpoints,
            config.download.clone(),
            event_tx.clone(),
        );

        Ok(Self {
            config: Arc::new(config),
            versions,
            resolver,
            searcher,
            galleries,
            pipeline,
            event_tx,
        })
    }

    /// Subscribe to retrieval progress events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Configuration in effect
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Index version cache
    pub fn versions(&self) -> &Arc<IndexVersions> {
        &self.versions
    }

    /// Routing table cache
    pub fn resolver(&self) -> &Arc<ObfuscationResolver> {
        &self.resolver
    }

    /// Query evaluator
    pub fn searcher(&self) -> &Searcher {
        &self.searcher
    }

    /// Fetch every index version token
    ///
    /// Optional: tokens are fetched lazily on first use.
    pub async fn refresh_versions(&self) -> Result<()> {
        self.versions.refresh_all().await
    }

    /// Evaluate a query
    pub async fn search(&self, query: &str) -> Result<ResultSet> {
        self.searcher.evaluate(query).await
    }

    /// Evaluate a query with a preference filter and ordering
    pub async fn search_with(&self, query: &str, options: &SearchOptions) -> Result<Vec<ItemId>> {
        self.searcher.evaluate_sorted(query, options).await
    }

    /// Fetch an item record; `None` when the item does not exist
    pub async fn gallery(&self, id: ItemId) -> Result<Option<Gallery>> {
        self.galleries.fetch(id).await
    }

    /// Download every file of `gallery` into an in-memory archive
    pub async fn download(
        &self,
        gallery: &Gallery,
        cancel: &CancellationToken,
    ) -> Result<Retrieved> {
        let manifest = gallery.manifest(&self.config.download.extension);
        let referer = gallery.referer(&self.config.endpoints.referer_base)?;
        self.pipeline
            .retrieve(
                RetrievalJob {
                    item: gallery.id,
                    manifest: &manifest,
                    referer: Some(&referer),
                },
                cancel,
            )
            .await
    }

    /// Download item `id` and save it as `{dir}/{title}.zip`
    ///
    /// Returns `None` when the item does not exist. Nothing is written unless
    /// every file was retrieved.
    pub async fn download_to(
        &self,
        id: ItemId,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Option<PathBuf>> {
        let Some(gallery) = self.gallery(id).await? else {
            tracing::warn!(id, "Item does not exist, skipping");
            return Ok(None);
        };
        let retrieved = self.download(&gallery, cancel).await?;
        let path = dir.join(archive_file_name(&gallery.title));
        save_archive(&path, &retrieved.archive).await?;
        Ok(Some(path))
    }
}

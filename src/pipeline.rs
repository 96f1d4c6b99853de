//! Bounded-concurrency retrieval
//!
//! All files of one item are fetched through a buffered stream that never has
//! more than `max_concurrency` requests in flight. The archive is only built
//! once every file has arrived, so a failed or cancelled retrieval writes
//! nothing.
//!
//! Failure policy:
//!
//! - 403/404 on a derived URL means the routing table rotated: refresh it once
//!   and retry the whole batch; a second rejection is [`Error::DownloadFailed`]
//! - 5xx (including 503 after retries) is [`Error::ServerOverloaded`]; retries
//!   used up on transport errors stay [`Error::Exhausted`]

use std::future::Future;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::broadcast;
use tokio::task::spawn_blocking;
use tokio_util::sync::CancellationToken;

use crate::archive::{ArchiveEntry, write_archive};
use crate::config::{DownloadConfig, EndpointConfig};
use crate::error::{Error, Result};
use crate::fetch::{RangedFetcher, Request};
use crate::obfuscation::{ObfuscationResolver, ObfuscationTable};
use crate::types::{Event, FileManifestEntry, ItemId};

/// One item to retrieve
#[derive(Clone, Copy, Debug)]
pub struct RetrievalJob<'a> {
    /// Item identifier, used for events and logs
    pub item: ItemId,
    /// Files to fetch
    pub manifest: &'a [FileManifestEntry],
    /// Referer header identifying the item's page
    pub referer: Option<&'a str>,
}

/// Retrieved archive
#[derive(Clone, Debug)]
pub struct Retrieved {
    /// ZIP bytes
    pub archive: Vec<u8>,
    /// Number of archived files
    pub files: usize,
    /// Downloaded bytes before compression
    pub bytes: u64,
}

/// Downloads manifests and packs them into archives
#[derive(Clone)]
pub struct Pipeline {
    fetcher: RangedFetcher,
    resolver: Arc<ObfuscationResolver>,
    endpoints: EndpointConfig,
    download: DownloadConfig,
    event_tx: broadcast::Sender<Event>,
}

impl Pipeline {
    /// Create a pipeline publishing progress on `event_tx`
    pub fn new(
        fetcher: RangedFetcher,
        resolver: Arc<ObfuscationResolver>,
        endpoints: EndpointConfig,
        download: DownloadConfig,
        event_tx: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            fetcher,
            resolver,
            endpoints,
            download,
            event_tx,
        }
    }

    /// Retrieve with the configured concurrency limit
    pub async fn retrieve(
        &self,
        job: RetrievalJob<'_>,
        cancel: &CancellationToken,
    ) -> Result<Retrieved> {
        self.retrieve_with(job, self.download.max_concurrency, cancel)
            .await
    }

    /// Retrieve every file of `job` with at most `max_concurrency` requests in flight
    pub async fn retrieve_with(
        &self,
        job: RetrievalJob<'_>,
        max_concurrency: usize,
        cancel: &CancellationToken,
    ) -> Result<Retrieved> {
        let result = self.run(job, max_concurrency.max(1), cancel).await;
        match &result {
            Ok(retrieved) => {
                tracing::info!(
                    item = job.item,
                    files = retrieved.files,
                    bytes = retrieved.bytes,
                    "Retrieval complete"
                );
                self.event_tx
                    .send(Event::Completed {
                        item: job.item,
                        files: retrieved.files,
                        bytes: retrieved.bytes,
                    })
                    .ok();
            }
            Err(e) => {
                tracing::error!(item = job.item, error = %e, "Retrieval failed");
                self.event_tx
                    .send(Event::Failed {
                        item: job.item,
                        error: e.to_string(),
                    })
                    .ok();
            }
        }
        result
    }

    async fn run(
        &self,
        job: RetrievalJob<'_>,
        concurrency: usize,
        cancel: &CancellationToken,
    ) -> Result<Retrieved> {
        if job.manifest.is_empty() {
            return Err(Error::DownloadFailed {
                reason: format!("item {} has no files", job.item),
            });
        }
        self.event_tx
            .send(Event::Started {
                item: job.item,
                total: job.manifest.len(),
            })
            .ok();

        let table = until_cancelled(cancel, self.resolver.resolve()).await?;
        let entries = match self.fetch_batch(job, &table, concurrency, cancel).await {
            Err(Error::StaleObfuscation { status, url }) => {
                tracing::warn!(
                    item = job.item,
                    status,
                    url = %url,
                    "Derived URL rejected, refreshing obfuscation table"
                );
                let table =
                    until_cancelled(cancel, self.resolver.refresh_if_unchanged(&table)).await?;
                self.event_tx
                    .send(Event::ObfuscationRefreshed { item: job.item })
                    .ok();
                match self.fetch_batch(job, &table, concurrency, cancel).await {
                    Err(Error::StaleObfuscation { status, url }) => {
                        return Err(Error::DownloadFailed {
                            reason: format!(
                                "HTTP {status} on {url} after refreshing the obfuscation table"
                            ),
                        });
                    }
                    other => other?,
                }
            }
            other => other?,
        };

        let files = entries.len();
        let bytes = entries.iter().map(|e| e.data.len() as u64).sum::<u64>();
        let archive = spawn_blocking(move || write_archive(entries))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(format!("archive task panicked: {e}"))))??;

        Ok(Retrieved {
            archive,
            files,
            bytes,
        })
    }

    /// Fetch every file once with the given table
    async fn fetch_batch(
        &self,
        job: RetrievalJob<'_>,
        table: &ObfuscationTable,
        concurrency: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<ArchiveEntry>> {
        let urls = job
            .manifest
            .iter()
            .map(|file| {
                table
                    .resource_url(
                        &file.content_hash,
                        &self.download.extension,
                        &self.endpoints.cdn_domain,
                    )
                    .map(|url| (file.logical_name.as_str(), url))
            })
            .collect::<Result<Vec<_>>>()?;

        let total = urls.len();
        let mut downloads = stream::iter(urls)
            .map(|(name, url)| self.fetch_file(name, url, job.referer, concurrency))
            .buffer_unordered(concurrency);

        let mut entries = Vec::with_capacity(total);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::warn!(item = job.item, completed = entries.len(), total, "Retrieval cancelled");
                    return Err(Error::Cancelled);
                }
                next = downloads.next() => match next {
                    Some(Ok(entry)) => {
                        self.event_tx
                            .send(Event::FileDownloaded {
                                item: job.item,
                                name: entry.name.clone(),
                                completed: entries.len() + 1,
                                total,
                            })
                            .ok();
                        entries.push(entry);
                    }
                    Some(Err(e)) => return Err(e),
                    None => break,
                },
            }
        }
        Ok(entries)
    }

    async fn fetch_file(
        &self,
        name: &str,
        url: String,
        referer: Option<&str>,
        concurrency: usize,
    ) -> Result<ArchiveEntry> {
        let mut request = Request::get(&url);
        if let Some(referer) = referer {
            request = request.with_referer(referer);
        }

        let response = match self.fetcher.fetch_response(&request).await {
            Ok(response) => response,
            Err(Error::Exhausted {
                last_status: Some(status),
                ..
            }) => return Err(Error::ServerOverloaded { status, concurrency }),
            Err(e) => return Err(e),
        };

        match response.status {
            200 | 206 => {
                tracing::debug!(name, bytes = response.body.len(), "File downloaded");
                Ok(ArchiveEntry {
                    name: name.to_string(),
                    data: response.body,
                })
            }
            403 | 404 => Err(Error::StaleObfuscation {
                status: response.status,
                url,
            }),
            status if status >= 500 => Err(Error::ServerOverloaded {
                status,
                concurrency,
            }),
            status => Err(Error::RequestFailed { url, status }),
        }
    }
}

/// Run `work` unless `cancel` fires first
async fn until_cancelled<T>(
    cancel: &CancellationToken,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = work => result,
    }
}

//! In-memory transport and fixture builders shared by unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::btree::{B, IndexNode};
use crate::config::{EndpointConfig, RetryConfig};
use crate::error::Result;
use crate::fetch::{RangedFetcher, Request, Response, Transport};

/// Index host used by [`test_endpoints`]; its URLs are keyed by path alone.
pub(crate) const TEST_INDEX_DOMAIN: &str = "index.test";
/// CDN base domain used by [`test_endpoints`].
pub(crate) const TEST_CDN_DOMAIN: &str = "cdn.test";

pub(crate) fn test_endpoints() -> EndpointConfig {
    EndpointConfig {
        index_domain: TEST_INDEX_DOMAIN.to_string(),
        cdn_domain: TEST_CDN_DOMAIN.to_string(),
        referer_base: "https://site.test".to_string(),
        scheme: "https".to_string(),
    }
}

pub(crate) fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        backoff_multiplier: 1.5,
        jitter: false,
    }
}

pub(crate) fn test_fetcher(transport: Arc<MemoryTransport>) -> RangedFetcher {
    RangedFetcher::new(transport, fast_retry())
}

/// Serves registered bodies by URL, with byte-range slicing.
///
/// Keys are the URL without scheme and query string; URLs on
/// [`TEST_INDEX_DOMAIN`] are keyed by path alone. Unknown keys answer 404.
#[derive(Default)]
pub(crate) struct MemoryTransport {
    files: Mutex<HashMap<String, Vec<u8>>>,
    statuses: Mutex<HashMap<String, u16>>,
    log: Mutex<Vec<String>>,
    delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    completed: AtomicUsize,
}

impl MemoryTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, key: &str, body: Vec<u8>) {
        self.files.lock().unwrap().insert(key.to_string(), body);
    }

    /// Answer every request for `key` with `status` and an empty body
    pub(crate) fn fail_with(&self, key: &str, status: u16) {
        self.statuses
            .lock()
            .unwrap()
            .insert(key.to_string(), status);
    }

    /// Fail every request whose key starts with `prefix`
    pub(crate) fn fail_prefix_with(&self, prefix: &str, status: u16) {
        self.statuses
            .lock()
            .unwrap()
            .insert(format!("{prefix}*"), status);
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub(crate) fn request_count(&self) -> usize {
        self.log.lock().unwrap().len()
    }

    pub(crate) fn requested(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub(crate) fn key_for(url: &str) -> String {
        let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
        let without_query = without_scheme
            .split_once('?')
            .map_or(without_scheme, |(path, _)| path);
        without_query
            .strip_prefix(&format!("{TEST_INDEX_DOMAIN}/"))
            .unwrap_or(without_query)
            .to_string()
    }

    fn status_for(&self, key: &str) -> Option<u16> {
        let statuses = self.statuses.lock().unwrap();
        if let Some(status) = statuses.get(key) {
            return Some(*status);
        }
        statuses.iter().find_map(|(pattern, status)| {
            pattern
                .strip_suffix('*')
                .filter(|prefix| key.starts_with(prefix))
                .map(|_| *status)
        })
    }

    fn respond(&self, request: &Request<'_>) -> Response {
        let key = Self::key_for(request.url);
        if let Some(status) = self.status_for(&key) {
            return Response {
                status,
                body: Vec::new(),
            };
        }
        let files = self.files.lock().unwrap();
        let Some(body) = files.get(&key) else {
            return Response {
                status: 404,
                body: Vec::new(),
            };
        };
        match request.range {
            Some(range) => {
                let start = (range.start as usize).min(body.len());
                let end = ((range.end as usize).saturating_add(1)).min(body.len());
                Response {
                    status: 206,
                    body: body[start..end].to_vec(),
                }
            }
            None => Response {
                status: 200,
                body: body.clone(),
            },
        }
    }
}

struct InFlightGuard<'a>(&'a MemoryTransport);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn get(&self, request: &Request<'_>) -> Result<Response> {
        self.log.lock().unwrap().push(request.url.to_string());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlightGuard(self);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let response = self.respond(request);
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(response)
    }
}

/// Encode a node in the on-disk layout read by [`IndexNode::decode`].
pub(crate) fn encode_node(keys: &[&[u8]], entries: &[(u64, u32)], children: &[u64]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(keys.len() as u32).to_be_bytes());
    for key in keys {
        out.extend_from_slice(&(key.len() as u32).to_be_bytes());
        out.extend_from_slice(key);
    }
    out.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    for (offset, length) in entries {
        out.extend_from_slice(&offset.to_be_bytes());
        out.extend_from_slice(&length.to_be_bytes());
    }
    for i in 0..=B {
        out.extend_from_slice(&children.get(i).copied().unwrap_or(0).to_be_bytes());
    }
    out
}

/// Lay out nodes at the given addresses in one index file.
pub(crate) fn index_file(nodes: &[(u64, Vec<u8>)]) -> Vec<u8> {
    let mut file = Vec::new();
    for (address, bytes) in nodes {
        let address = *address as usize;
        if file.len() < address + bytes.len() {
            file.resize(address + bytes.len(), 0);
        }
        file[address..address + bytes.len()].copy_from_slice(bytes);
    }
    file
}

/// Encode a data-blob record: count followed by the identifiers.
pub(crate) fn encode_ids_record(ids: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + ids.len() * 4);
    out.extend_from_slice(&(ids.len() as u32).to_be_bytes());
    for id in ids {
        out.extend_from_slice(&id.to_be_bytes());
    }
    out
}

/// Encode a sorted-ID-list file: identifiers with no header.
pub(crate) fn encode_nozomi(ids: &[u32]) -> Vec<u8> {
    ids.iter().flat_map(|id| id.to_be_bytes()).collect()
}

/// Sanity check that a fixture node decodes as intended.
pub(crate) fn decoded(bytes: &[u8]) -> IndexNode {
    IndexNode::decode(bytes).unwrap()
}

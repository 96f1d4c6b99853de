//! Remote B-tree reader
//!
//! The index host publishes each field as a disk-backed B-tree (`.index`) and a
//! companion blob (`.data`). There is no query API: the client fetches one node
//! at a time with a fixed-size range request and walks down the tree itself.
//!
//! Node layout (all integers big-endian):
//!
//! ```text
//! u32 key_count
//! key_count x (u32 key_size, key_size bytes)      1 <= key_size <= 32
//! u32 entry_count
//! entry_count x (u64 offset, u32 length)
//! (B + 1) x u64 child address                      0 = absent
//! ```

use std::cmp::Ordering;
use std::sync::Arc;

use crate::config::EndpointConfig;
use crate::error::{Error, Result};
use crate::fetch::{ByteRange, RangedFetcher};
use crate::versions::{IndexKind, IndexVersions, index_file_path};

/// Branching factor: a node has at most `B` keys and exactly `B + 1` children.
pub const B: usize = 16;

/// Size of the range fetched for every node.
pub const MAX_NODE_SIZE: u64 = 464;

/// Longest key a node may hold.
pub const MAX_KEY_SIZE: usize = 32;

/// Upper bound on tree height; deeper walks mean the addresses loop.
const MAX_DEPTH: usize = 64;

/// Largest data-blob record a lookup will fetch.
pub const MAX_DATA_LENGTH: u32 = 100_000_000;

/// Location of a record in the companion `.data` file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataPointer {
    /// Byte offset into the data file
    pub offset: u64,
    /// Record length in bytes
    pub length: u32,
}

/// One decoded B-tree node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexNode {
    /// Keys in ascending unsigned byte order
    pub keys: Vec<Vec<u8>>,
    /// One data pointer per key
    pub entries: Vec<DataPointer>,
    /// Child node addresses, 0 meaning absent
    pub children: [u64; B + 1],
}

/// Bounds-checked big-endian reader over a node buffer.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                Error::CorruptIndex(format!(
                    "node truncated: need {} bytes at offset {}, have {}",
                    n,
                    self.pos,
                    self.buf.len()
                ))
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(raw))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(raw))
    }
}

impl IndexNode {
    /// Decode a node from the bytes of one node-sized range
    ///
    /// Trailing bytes past the child addresses belong to the next node and are
    /// ignored. Any structural violation is [`Error::CorruptIndex`].
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader { buf: data, pos: 0 };

        let key_count = reader.u32()? as usize;
        if key_count > B {
            return Err(Error::CorruptIndex(format!(
                "node declares {key_count} keys, at most {B} allowed"
            )));
        }
        let mut keys = Vec::with_capacity(key_count);
        for _ in 0..key_count {
            let key_size = reader.u32()? as usize;
            if key_size == 0 || key_size > MAX_KEY_SIZE {
                return Err(Error::CorruptIndex(format!(
                    "invalid key size {key_size}"
                )));
            }
            keys.push(reader.take(key_size)?.to_vec());
        }

        let entry_count = reader.u32()? as usize;
        if entry_count != key_count {
            return Err(Error::CorruptIndex(format!(
                "node has {key_count} keys but {entry_count} entries"
            )));
        }
        let mut entries = Vec::with_capacity(entry_count);
        for _ in 0..entry_count {
            let offset = reader.u64()?;
            let length = reader.u32()?;
            entries.push(DataPointer { offset, length });
        }

        let mut children = [0u64; B + 1];
        for child in children.iter_mut() {
            *child = reader.u64()?;
        }

        Ok(Self {
            keys,
            entries,
            children,
        })
    }

    /// A node is a leaf when every child address is 0
    pub fn is_leaf(&self) -> bool {
        self.children.iter().all(|&addr| addr == 0)
    }

    /// Position of the first key `>= key`, and whether it is an exact match
    ///
    /// When every key is smaller the position is `keys.len()`, selecting the
    /// rightmost child.
    pub fn locate(&self, key: &[u8]) -> (bool, usize) {
        for (i, node_key) in self.keys.iter().enumerate() {
            match compare_keys(key, node_key) {
                Ordering::Less => return (false, i),
                Ordering::Equal => return (true, i),
                Ordering::Greater => {}
            }
        }
        (false, self.keys.len())
    }
}

/// Unsigned lexicographic byte comparison
pub fn compare_keys(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// Client for the remote B-tree indexes
#[derive(Clone)]
pub struct IndexClient {
    fetcher: RangedFetcher,
    endpoints: EndpointConfig,
    versions: Arc<IndexVersions>,
}

impl IndexClient {
    /// Create a client sharing `versions` with the rest of the session
    pub fn new(
        fetcher: RangedFetcher,
        endpoints: EndpointConfig,
        versions: Arc<IndexVersions>,
    ) -> Self {
        Self {
            fetcher,
            endpoints,
            versions,
        }
    }

    /// Version cache used by this client
    pub fn versions(&self) -> &Arc<IndexVersions> {
        &self.versions
    }

    /// Fetch and decode the node at `address` using the current version
    ///
    /// Returns `None` when the index file is missing or the range is empty.
    pub async fn get_node(&self, field: &str, address: u64) -> Result<Option<IndexNode>> {
        let version = self.versions.get(IndexKind::for_field(field)).await?;
        self.get_node_at(field, &version, address).await
    }

    async fn get_node_at(
        &self,
        field: &str,
        version: &str,
        address: u64,
    ) -> Result<Option<IndexNode>> {
        let url = self
            .endpoints
            .index_url(&index_file_path(field, version, "index"));
        let range = ByteRange::with_len(address, MAX_NODE_SIZE).ok_or_else(|| {
            Error::CorruptIndex(format!("node address {address} out of range"))
        })?;

        let bytes = match self.fetcher.fetch_range(&url, range).await {
            Ok(bytes) => bytes,
            Err(Error::RequestFailed { status: 404, .. }) => {
                tracing::debug!(field, version, "Index file not found");
                return Ok(None);
            }
            Err(Error::RequestFailed { status: 416, .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        if bytes.is_empty() {
            return Ok(None);
        }
        IndexNode::decode(&bytes).map(Some)
    }

    /// Find the data pointer for `key`, walking down from `root`
    ///
    /// A miss is first treated as a possibly stale version: the version token
    /// is refreshed once and the walk repeated. A second miss is a genuine
    /// absence and returns `Ok(None)`.
    pub async fn search(&self, field: &str, key: &[u8], root: u64) -> Result<Option<DataPointer>> {
        Ok(self.locate(field, key, root).await?.map(|(pointer, _)| pointer))
    }

    /// Find `key` in `field` and fetch its data-blob record
    ///
    /// The record is read with the same version token the walk succeeded with.
    pub async fn lookup_data(&self, field: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some((pointer, version)) = self.locate(field, key, 0).await? else {
            return Ok(None);
        };
        if pointer.length == 0 || pointer.length > MAX_DATA_LENGTH {
            tracing::warn!(
                field,
                length = pointer.length,
                "Data pointer length out of bounds, ignoring"
            );
            return Ok(None);
        }
        let url = self
            .endpoints
            .index_url(&index_file_path(field, &version, "data"));
        let range = ByteRange::with_len(pointer.offset, u64::from(pointer.length))
            .ok_or_else(|| Error::CorruptIndex("data pointer overflows".to_string()))?;
        self.fetcher.fetch_range(&url, range).await.map(Some)
    }

    async fn locate(
        &self,
        field: &str,
        key: &[u8],
        root: u64,
    ) -> Result<Option<(DataPointer, String)>> {
        let kind = IndexKind::for_field(field);
        let version = self.versions.get(kind).await?;

        match self.walk(field, &version, key, root).await {
            Ok(found) => return Ok(found.map(|pointer| (pointer, version))),
            Err(Error::StaleIndex { .. }) => {}
            Err(e) => return Err(e),
        }

        tracing::warn!(field, version = %version, "Index miss, refreshing version");
        let refreshed = self.versions.refresh_if_unchanged(kind, &version).await?;
        match self.walk(field, &refreshed, key, root).await {
            Ok(found) => Ok(found.map(|pointer| (pointer, refreshed))),
            Err(Error::StaleIndex { .. }) => {
                tracing::debug!(field, "Key not present after version refresh");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// One walk from `root`
    ///
    /// `Ok(None)` is a definitive absence (zero child address). A miss that a
    /// newer version token might resolve is [`Error::StaleIndex`].
    async fn walk(
        &self,
        field: &str,
        version: &str,
        key: &[u8],
        root: u64,
    ) -> Result<Option<DataPointer>> {
        let stale = || Error::StaleIndex {
            field: field.to_string(),
        };
        let mut address = root;
        for depth in 0..MAX_DEPTH {
            let Some(node) = self.get_node_at(field, version, address).await? else {
                return Err(stale());
            };
            if node.keys.is_empty() {
                return Err(stale());
            }

            let (found, index) = node.locate(key);
            if found {
                tracing::debug!(field, depth, address, "Key found");
                return Ok(Some(node.entries[index]));
            }
            if node.is_leaf() {
                return Err(stale());
            }

            let child = node.children[index];
            if child == 0 {
                return Ok(None);
            }
            tracing::debug!(field, depth, address, child, "Descending");
            address = child;
        }
        Err(Error::CorruptIndex(format!(
            "walk of {field} exceeded depth {MAX_DEPTH}"
        )))
    }
}

//! Sorted ID lists and data-blob records
//!
//! Two binary formats carry item identifiers, both big-endian `u32`:
//!
//! - data-blob records, reached through a B-tree entry: a count followed by
//!   that many identifiers
//! - `.nozomi` files, fetched whole: a flat list of identifiers, no header

use serde::{Deserialize, Serialize};

use crate::config::EndpointConfig;
use crate::error::{Error, Result};
use crate::fetch::{RangedFetcher, Request};
use crate::types::{ItemId, ResultSet};

/// File extension of sorted ID lists
pub const NOZOMI_EXTENSION: &str = ".nozomi";

/// Largest identifier count a data-blob record may declare
pub const MAX_RECORD_IDS: u32 = 10_000_000;

/// Decode a data-blob record
///
/// The declared count must be in `1..=MAX_RECORD_IDS` and the buffer exactly
/// `4 + 4 * count` bytes long; anything else is [`Error::InvalidInput`].
pub fn decode_ids_record(bytes: &[u8]) -> Result<ResultSet> {
    let Some(header) = bytes.get(..4) else {
        return Err(Error::InvalidInput(format!(
            "record of {} bytes has no count",
            bytes.len()
        )));
    };
    let count = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    if count == 0 || count > MAX_RECORD_IDS {
        return Err(Error::InvalidInput(format!(
            "record declares {count} identifiers"
        )));
    }
    let expected = 4 + 4 * count as usize;
    if bytes.len() != expected {
        return Err(Error::InvalidInput(format!(
            "record is {} bytes, expected {expected}",
            bytes.len()
        )));
    }
    Ok(ids(&bytes[4..]).collect())
}

/// Decode a `.nozomi` file, keeping file order; a trailing partial word is ignored
pub fn decode_nozomi(bytes: &[u8]) -> Vec<ItemId> {
    ids(bytes).collect()
}

fn ids(bytes: &[u8]) -> impl Iterator<Item = ItemId> + '_ {
    bytes
        .chunks_exact(4)
        .map(|word| u32::from_be_bytes([word[0], word[1], word[2], word[3]]))
}

/// Selects one pre-sorted list on the index host
///
/// The defaults select the whole catalog ordered by date added.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NozomiState {
    /// `all`, or a namespace directory such as `tag` or `type`
    #[serde(default = "default_area")]
    pub area: String,
    /// Tag within the area (`index` for the full catalog)
    #[serde(default = "default_tag")]
    pub tag: String,
    /// Language filter (`all` for every language)
    #[serde(default = "default_language")]
    pub language: String,
    /// Ordering family (`date`, `popular`)
    #[serde(default = "default_orderby")]
    pub orderby: String,
    /// Ordering key (`added`, `published`, `today`, `week`, ...)
    #[serde(default = "default_orderbykey")]
    pub orderbykey: String,
}

impl Default for NozomiState {
    fn default() -> Self {
        Self {
            area: default_area(),
            tag: default_tag(),
            language: default_language(),
            orderby: default_orderby(),
            orderbykey: default_orderbykey(),
        }
    }
}

impl NozomiState {
    /// Path of the list on the index host
    pub fn address(&self) -> String {
        let Self {
            area,
            tag,
            language,
            orderby,
            orderbykey,
        } = self;
        if orderby != "date" || orderbykey == "published" {
            if area == "all" {
                format!("{orderby}/{orderbykey}-{language}{NOZOMI_EXTENSION}")
            } else {
                format!("{area}/{orderby}/{orderbykey}/{tag}-{language}{NOZOMI_EXTENSION}")
            }
        } else if area == "all" {
            format!("{tag}-{language}{NOZOMI_EXTENSION}")
        } else {
            format!("{area}/{tag}-{language}{NOZOMI_EXTENSION}")
        }
    }
}

fn default_area() -> String {
    "all".to_string()
}

fn default_tag() -> String {
    "index".to_string()
}

fn default_language() -> String {
    "all".to_string()
}

fn default_orderby() -> String {
    "date".to_string()
}

fn default_orderbykey() -> String {
    "added".to_string()
}

/// Reads whole `.nozomi` files from the index host
#[derive(Clone)]
pub struct NozomiReader {
    fetcher: RangedFetcher,
    endpoints: EndpointConfig,
}

impl NozomiReader {
    /// Create a reader
    pub fn new(fetcher: RangedFetcher, endpoints: EndpointConfig) -> Self {
        Self { fetcher, endpoints }
    }

    /// Fetch the list at `path`; a missing list is empty
    pub async fn fetch_list(&self, path: &str) -> Result<Vec<ItemId>> {
        let url = self.endpoints.index_url(path);
        let response = self.fetcher.fetch_response(&Request::get(&url)).await?;
        if !response.is_success() {
            tracing::debug!(url = %url, status = response.status, "Sorted list unavailable");
            return Ok(Vec::new());
        }
        let ids = decode_nozomi(&response.body);
        tracing::debug!(url = %url, count = ids.len(), "Sorted list fetched");
        Ok(ids)
    }

    /// Fetch the list selected by `state`
    pub async fn fetch_state(&self, state: &NozomiState) -> Result<Vec<ItemId>> {
        self.fetch_list(&state.address()).await
    }
}

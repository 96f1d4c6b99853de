//! Item records
//!
//! `galleries/{id}.js` on the index host is a script assigning one JSON object
//! (`var galleryinfo = {...}`). The object carries the file manifest and the
//! page URL used to build the referer for resource downloads.

use serde::{Deserialize, Deserializer, Serialize};

use crate::config::EndpointConfig;
use crate::error::{Error, Result};
use crate::fetch::{RangedFetcher, Request};
use crate::types::{FileManifestEntry, ItemId};

/// Marker the record script must contain
const RECORD_MARKER: &str = "galleryinfo";

/// One file of an item
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GalleryFile {
    /// Original file name
    pub name: String,
    /// Hex content hash
    pub hash: String,
    /// Non-zero when an AVIF rendition exists
    #[serde(default)]
    pub hasavif: u8,
    /// Width in pixels
    #[serde(default)]
    pub width: u32,
    /// Height in pixels
    #[serde(default)]
    pub height: u32,
}

/// A named reference with its listing URL (artist, group, parody, character)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    /// Display name; the JSON key varies per list
    #[serde(alias = "artist", alias = "group", alias = "parody", alias = "character")]
    pub name: String,
    /// Listing URL on the site
    #[serde(default)]
    pub url: String,
}

/// A content tag
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    /// Tag text
    pub tag: String,
    /// Listing URL on the site
    #[serde(default)]
    pub url: String,
    /// Set for `male:` tags; sent as `1` or `""`
    #[serde(default, deserialize_with = "flag")]
    pub male: bool,
    /// Set for `female:` tags; sent as `1` or `""`
    #[serde(default, deserialize_with = "flag")]
    pub female: bool,
}

/// Typed item record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gallery {
    /// Identifier; sent as either a string or a number
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub id: ItemId,
    /// Title
    pub title: String,
    /// Japanese title, when present
    #[serde(default)]
    pub japanese_title: Option<String>,
    /// Item type (`manga`, `doujinshi`, ...)
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Language name
    #[serde(default)]
    pub language: Option<String>,
    /// Upload date as published
    #[serde(default)]
    pub date: Option<String>,
    /// Page URL on the site, used for the referer
    #[serde(default)]
    pub galleryurl: String,
    /// File manifest
    #[serde(default)]
    pub files: Vec<GalleryFile>,
    /// Tags
    #[serde(default, deserialize_with = "null_as_empty")]
    pub tags: Vec<Tag>,
    /// Artists
    #[serde(default, deserialize_with = "null_as_empty")]
    pub artists: Vec<Reference>,
    /// Circles
    #[serde(default, deserialize_with = "null_as_empty")]
    pub groups: Vec<Reference>,
    /// Characters
    #[serde(default, deserialize_with = "null_as_empty")]
    pub characters: Vec<Reference>,
    /// Source series
    #[serde(default, deserialize_with = "null_as_empty")]
    pub parodys: Vec<Reference>,
    /// Related item identifiers
    #[serde(default, deserialize_with = "null_as_empty")]
    pub related: Vec<ItemId>,
}

impl Gallery {
    /// Parse the record script body
    pub fn parse_record(text: &str) -> Result<Self> {
        if !text.contains(RECORD_MARKER) {
            return Err(Error::InvalidRecord(format!("missing {RECORD_MARKER}")));
        }
        let start = text
            .find('{')
            .ok_or_else(|| Error::InvalidRecord("no JSON object".to_string()))?;
        let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Gallery>();
        match stream.next() {
            Some(record) => Ok(record?),
            None => Err(Error::InvalidRecord("empty JSON object".to_string())),
        }
    }

    /// Files as archive entries, renamed to `extension`
    pub fn manifest(&self, extension: &str) -> Vec<FileManifestEntry> {
        self.files
            .iter()
            .map(|file| FileManifestEntry::new(logical_name(&file.name, extension), &file.hash))
            .collect()
    }

    /// Referer header for resource downloads: `referer_base` plus the encoded page path
    pub fn referer(&self, referer_base: &str) -> Result<String> {
        let path: Vec<String> = self
            .galleryurl
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        let referer = format!("{}{}", referer_base.trim_end_matches('/'), path.join("/"));
        url::Url::parse(&referer)?;
        Ok(referer)
    }
}

/// Replace the file extension of `name` with `extension`
pub fn logical_name(name: &str, extension: &str) -> String {
    let stem = match name.rfind('.') {
        Some(dot) if dot > 0 && !name[dot + 1..].is_empty() => &name[..dot],
        _ => name,
    };
    format!("{stem}.{extension}")
}

fn id_from_string_or_number<'de, D>(deserializer: D) -> std::result::Result<ItemId, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(ItemId),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(id) => Ok(id),
        Raw::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

fn flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Bool(b) => b,
        serde_json::Value::Number(n) => n.as_u64().is_some_and(|n| n != 0),
        serde_json::Value::String(s) => !s.is_empty() && s != "0",
        _ => false,
    })
}

fn null_as_empty<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Fetches item records from the index host
#[derive(Clone)]
pub struct GalleryClient {
    fetcher: RangedFetcher,
    endpoints: EndpointConfig,
}

impl GalleryClient {
    /// Create a client
    pub fn new(fetcher: RangedFetcher, endpoints: EndpointConfig) -> Self {
        Self { fetcher, endpoints }
    }

    /// Fetch the record of `id`; `None` when the item does not exist
    pub async fn fetch(&self, id: ItemId) -> Result<Option<Gallery>> {
        let url = self.endpoints.index_url(&format!("galleries/{id}.js"));
        let response = self.fetcher.fetch_response(&Request::get(&url)).await?;
        match response.status {
            404 => {
                tracing::debug!(id, "Item not found");
                Ok(None)
            }
            status if !response.is_success() => Err(Error::RequestFailed { url, status }),
            _ => {
                let gallery = Gallery::parse_record(&String::from_utf8_lossy(&response.body))?;
                tracing::debug!(id, files = gallery.files.len(), "Item record fetched");
                Ok(Some(gallery))
            }
        }
    }
}

//! Resource URL derivation
//!
//! Resource hosts are not published. A small script on the index host
//! (`gg.js`) holds a routing table from hash buckets to subdomain numbers plus
//! a path prefix; both rotate periodically. The table is parsed out of the
//! script text and cached until it expires or a derived URL is rejected.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Instant;

use regex::Regex;
use tokio::sync::RwLock;

use crate::config::{EndpointConfig, ObfuscationConfig};
use crate::error::{Error, Result};
use crate::fetch::RangedFetcher;

/// Path of the routing script on the index host
pub const SCRIPT_PATH: &str = "gg.js";

// Literal patterns; compilation cannot fail
#[allow(clippy::expect_used)]
static CASE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"case\s+(\d+):(?:\s*o\s*=\s*(\d+))?").expect("valid regex"));
#[allow(clippy::expect_used)]
static IF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"if\s+\(g\s*===?\s*(\d+)\)[\s{]*o\s*=\s*(\d+)").expect("valid regex")
});
#[allow(clippy::expect_used)]
static DEFAULT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:var\s|default:)\s*o\s*=\s*(\d+)").expect("valid regex"));
#[allow(clippy::expect_used)]
static BASE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"b:\s*["'](.+)["']"#).expect("valid regex"));

/// Routing table parsed from the obfuscation script
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObfuscationTable {
    /// Bucket to route number
    pub routes: HashMap<u32, u32>,
    /// Route number for buckets not in `routes`
    pub default: u32,
    /// Shared path prefix, without surrounding slashes
    pub base: String,
}

impl ObfuscationTable {
    /// Parse the script text
    ///
    /// `case` labels without an assignment take the value of the next
    /// assignment that follows them. `if (g === N) o = V` lines map directly.
    /// A missing default is 0; a missing `b:` path is an error.
    pub fn parse(script: &str) -> Result<Self> {
        let mut routes = HashMap::new();

        let mut pending = Vec::new();
        for caps in CASE_RE.captures_iter(script) {
            pending.push(parse_number(&caps[1])?);
            if let Some(value) = caps.get(2) {
                let value = parse_number(value.as_str())?;
                for bucket in pending.drain(..) {
                    routes.insert(bucket, value);
                }
            }
        }

        for caps in IF_RE.captures_iter(script) {
            routes.insert(parse_number(&caps[1])?, parse_number(&caps[2])?);
        }

        let default = match DEFAULT_RE.captures(script) {
            Some(caps) => parse_number(&caps[1])?,
            None => 0,
        };

        let base = BASE_RE
            .captures(script)
            .map(|caps| caps[1].trim_matches('/').to_string())
            .ok_or_else(|| Error::ObfuscationParse("no base path (b:) found".to_string()))?;

        Ok(Self {
            routes,
            default,
            base,
        })
    }

    /// Route number for `bucket`
    pub fn route(&self, bucket: u32) -> u32 {
        self.routes.get(&bucket).copied().unwrap_or(self.default)
    }

    /// Download URL of a resource
    ///
    /// `https://{ext[0]}{route + 1}.{cdn}/{base}/{bucket}/{hash}.{ext}`
    pub fn resource_url(&self, hash: &str, extension: &str, cdn_domain: &str) -> Result<String> {
        let bucket = bucket(hash)?;
        let Some(prefix) = extension.chars().next() else {
            return Err(Error::InvalidInput("empty resource extension".to_string()));
        };
        Ok(format!(
            "https://{prefix}{}.{cdn_domain}/{}/{bucket}/{hash}.{extension}",
            self.route(bucket) + 1,
            self.base,
        ))
    }
}

/// Hash bucket: last hex digit followed by the two before it, read as base 16
///
/// For `...a3c` the bucket is `0xca3`.
pub fn bucket(hash: &str) -> Result<u32> {
    let bytes = hash.as_bytes();
    if bytes.len() < 3 || !bytes[bytes.len() - 3..].iter().all(u8::is_ascii_hexdigit) {
        return Err(Error::InvalidInput(format!("invalid content hash {hash:?}")));
    }
    let n = bytes.len();
    let digits = [bytes[n - 1], bytes[n - 3], bytes[n - 2]];
    let text = std::str::from_utf8(&digits)
        .map_err(|_| Error::InvalidInput(format!("invalid content hash {hash:?}")))?;
    u32::from_str_radix(text, 16)
        .map_err(|_| Error::InvalidInput(format!("invalid content hash {hash:?}")))
}

fn parse_number(text: &str) -> Result<u32> {
    text.parse()
        .map_err(|_| Error::ObfuscationParse(format!("number out of range: {text}")))
}

struct Cached {
    table: Arc<ObfuscationTable>,
    fetched_at: Instant,
}

/// Shared, refreshable routing table
///
/// Readers get an `Arc` snapshot; a refresh parses the new table outside the
/// lock and swaps it in, so a refresh in flight never blocks derivation.
pub struct ObfuscationResolver {
    fetcher: RangedFetcher,
    endpoints: EndpointConfig,
    config: ObfuscationConfig,
    cached: RwLock<Option<Cached>>,
}

impl ObfuscationResolver {
    /// Create a resolver; the script is fetched on first use
    pub fn new(fetcher: RangedFetcher, endpoints: EndpointConfig, config: ObfuscationConfig) -> Self {
        Self {
            fetcher,
            endpoints,
            config,
            cached: RwLock::new(None),
        }
    }

    /// Current table, refetched once it is older than the configured max age
    pub async fn resolve(&self) -> Result<Arc<ObfuscationTable>> {
        if let Some(cached) = self.cached.read().await.as_ref()
            && cached.fetched_at.elapsed() < self.config.max_age
        {
            return Ok(cached.table.clone());
        }
        self.refresh().await
    }

    /// Fetch and parse the script now
    pub async fn refresh(&self) -> Result<Arc<ObfuscationTable>> {
        let url = if self.config.cache_bust {
            self.endpoints.index_url(&format!(
                "{SCRIPT_PATH}?_={}",
                chrono::Utc::now().timestamp_millis()
            ))
        } else {
            self.endpoints.index_url(SCRIPT_PATH)
        };
        let body = self.fetcher.fetch(&url).await?;
        let table = Arc::new(ObfuscationTable::parse(&String::from_utf8_lossy(&body))?);

        *self.cached.write().await = Some(Cached {
            table: table.clone(),
            fetched_at: Instant::now(),
        });
        tracing::info!(
            routes = table.routes.len(),
            default = table.default,
            base = %table.base,
            "Obfuscation table refreshed"
        );
        Ok(table)
    }

    /// Refresh unless another task already replaced `seen`
    pub async fn refresh_if_unchanged(
        &self,
        seen: &Arc<ObfuscationTable>,
    ) -> Result<Arc<ObfuscationTable>> {
        if let Some(cached) = self.cached.read().await.as_ref()
            && !Arc::ptr_eq(&cached.table, seen)
        {
            return Ok(cached.table.clone());
        }
        self.refresh().await
    }

    /// Install a table directly, bypassing the network
    pub async fn set(&self, table: ObfuscationTable) {
        *self.cached.write().await = Some(Cached {
            table: Arc::new(table),
            fetched_at: Instant::now(),
        });
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{MemoryTransport, test_endpoints, test_fetcher};
    use std::time::Duration;

    const SCRIPT: &str = r#"
gg = {
m: function(g) {
    var o = 0;
    switch (g) {
    case 3:
    case 4:
    o = 1; break;
    case 5:
    o = 0; break;
    }
    return o;
},
s: function(h) { var m = /(..)(.)$/.exec(h); return parseInt(m[2]+m[1], 16).toString(10); },
b: '1717142402/'
};
"#;

    #[test]
    fn case_runs_share_the_next_value() {
        let table = ObfuscationTable::parse(SCRIPT).unwrap();
        assert_eq!(table.routes, HashMap::from([(3, 1), (4, 1), (5, 0)]));
        assert_eq!(table.default, 0);
        assert_eq!(table.base, "1717142402");
    }

    #[test]
    fn inline_case_assignment_is_parsed() {
        let script = "switch (g) { case 7: o = 2; break; case 8:\ncase 9: o = 3; break; default: o = 1; } b: '99/'";
        let table = ObfuscationTable::parse(script).unwrap();
        assert_eq!(table.routes, HashMap::from([(7, 2), (8, 3), (9, 3)]));
        assert_eq!(table.default, 1);
    }

    #[test]
    fn if_conditionals_map_directly() {
        let script = "var o = 1;\nif (g === 12) o = 0;\nif (g == 13) { o = 2; }\nb: \"/base/\"";
        let table = ObfuscationTable::parse(script).unwrap();
        assert_eq!(table.routes, HashMap::from([(12, 0), (13, 2)]));
        assert_eq!(table.default, 1);
        assert_eq!(table.base, "base");
    }

    #[test]
    fn missing_base_is_a_parse_error() {
        assert!(matches!(
            ObfuscationTable::parse("case 1: o = 1;"),
            Err(Error::ObfuscationParse(_))
        ));
    }

    #[test]
    fn bucket_reorders_last_three_digits() {
        assert_eq!(bucket("abcdef0123a3c").unwrap(), 0xca3);
        assert_eq!(bucket("fff").unwrap(), 0xfff);
        assert!(bucket("ab").is_err());
        assert!(bucket("12xz").is_err());
    }

    #[test]
    fn resource_url_uses_route_plus_one() {
        let mut table = ObfuscationTable::parse(SCRIPT).unwrap();
        table.routes.insert(0xca3, 1);
        let url = table
            .resource_url("0123456789a3c", "webp", "example.net")
            .unwrap();
        assert_eq!(url, "https://w2.example.net/1717142402/3235/0123456789a3c.webp");

        let fallback = table
            .resource_url("0123456789000", "avif", "example.net")
            .unwrap();
        assert_eq!(fallback, "https://a1.example.net/1717142402/0/0123456789000.avif");
    }

    #[test]
    fn resource_url_is_deterministic() {
        let table = ObfuscationTable::parse(SCRIPT).unwrap();
        let a = table.resource_url("deadbeef", "webp", "cdn.test").unwrap();
        let b = table.resource_url("deadbeef", "webp", "cdn.test").unwrap();
        assert_eq!(a, b);
    }

    fn resolver(transport: Arc<MemoryTransport>, config: ObfuscationConfig) -> ObfuscationResolver {
        ObfuscationResolver::new(test_fetcher(transport), test_endpoints(), config)
    }

    #[tokio::test]
    async fn resolve_caches_until_max_age() {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert("gg.js", SCRIPT.as_bytes().to_vec());
        let resolver = resolver(transport.clone(), ObfuscationConfig::default());

        let first = resolver.resolve().await.unwrap();
        let second = resolver.resolve().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn expired_table_is_refetched() {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert("gg.js", SCRIPT.as_bytes().to_vec());
        let config = ObfuscationConfig {
            max_age: Duration::ZERO,
            cache_bust: true,
        };
        let resolver = resolver(transport.clone(), config);

        resolver.resolve().await.unwrap();
        resolver.resolve().await.unwrap();
        assert_eq!(transport.request_count(), 2);
        assert!(transport.requested()[0].contains("gg.js?_="));
    }

    #[tokio::test]
    async fn refresh_if_unchanged_skips_when_already_replaced() {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert("gg.js", SCRIPT.as_bytes().to_vec());
        let resolver = resolver(transport.clone(), ObfuscationConfig::default());

        let stale = resolver.resolve().await.unwrap();
        let fresh = resolver.refresh_if_unchanged(&stale).await.unwrap();
        assert!(!Arc::ptr_eq(&stale, &fresh));
        assert_eq!(transport.request_count(), 2);

        let again = resolver.refresh_if_unchanged(&stale).await.unwrap();
        assert!(Arc::ptr_eq(&fresh, &again));
        assert_eq!(transport.request_count(), 2);
    }
}

//! Query evaluation
//!
//! Every distinct term of a query is looked up concurrently; the per-term sets
//! are then combined with plain set algebra. Lookups never share a mutable
//! collection: each returns its own set and only the combine step merges them.

use std::collections::HashMap;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};

use crate::btree::IndexClient;
use crate::error::{Error, Result};
use crate::nozomi::{NozomiReader, NozomiState, decode_ids_record};
use crate::query::{Clause, Query, Term, term_key};
use crate::types::{ItemId, ResultOrder, ResultSet};

/// B-tree field holding the full-text item index
pub const ITEMS_FIELD: &str = "galleries";

/// Options applied after the boolean combination
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SearchOptions {
    /// Keep only items that also appear in this sorted list
    #[serde(default)]
    pub filter: Option<NozomiState>,
    /// Ordering of [`Searcher::evaluate_sorted`] output
    #[serde(default)]
    pub order: ResultOrder,
}

/// Evaluates parsed queries against the remote indexes
#[derive(Clone)]
pub struct Searcher {
    index: IndexClient,
    lists: NozomiReader,
}

impl Searcher {
    /// Create a searcher over an index client and a sorted-list reader
    pub fn new(index: IndexClient, lists: NozomiReader) -> Self {
        Self { index, lists }
    }

    /// Evaluate a raw query string
    ///
    /// No results is an empty set, never an error.
    pub async fn evaluate(&self, query: &str) -> Result<ResultSet> {
        self.evaluate_with(query, &SearchOptions::default()).await
    }

    /// Evaluate with an optional preference filter
    pub async fn evaluate_with(&self, query: &str, options: &SearchOptions) -> Result<ResultSet> {
        let parsed = Query::parse(query);
        let mut result = self.evaluate_query(&parsed).await?;

        if let Some(filter) = &options.filter
            && !result.is_empty()
        {
            let allowed: ResultSet = self.lists.fetch_state(filter).await?.into_iter().collect();
            result.retain(|id| allowed.contains(id));
            tracing::debug!(
                filter = %filter.address(),
                remaining = result.len(),
                "Preference filter applied"
            );
        }

        tracing::info!(query, results = result.len(), "Query evaluated");
        Ok(result)
    }

    /// Evaluate and return identifiers in the requested order
    ///
    /// [`ResultOrder::Unordered`] still returns a stable ascending list.
    pub async fn evaluate_sorted(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<ItemId>> {
        let result = self.evaluate_with(query, options).await?;
        let mut ids: Vec<ItemId> = result.into_iter().collect();
        match options.order {
            ResultOrder::NewestFirst => ids.sort_unstable_by(|a, b| b.cmp(a)),
            ResultOrder::Unordered => ids.sort_unstable(),
        }
        Ok(ids)
    }

    /// Evaluate an already parsed query
    pub async fn evaluate_query(&self, query: &Query) -> Result<ResultSet> {
        if !query.has_positive() {
            if !query.is_empty() {
                tracing::debug!("Query has only excluded terms, nothing to filter");
            }
            return Ok(ResultSet::new());
        }

        let terms = query.terms();
        let sets = try_join_all(terms.iter().map(|term| self.lookup(term))).await?;
        let found: HashMap<&Term, ResultSet> = terms.into_iter().zip(sets).collect();

        Ok(combine(&query.clauses, &found))
    }

    /// Identifiers matching a single term
    ///
    /// Malformed data-blob records are logged and treated as no match.
    pub async fn lookup(&self, term: &Term) -> Result<ResultSet> {
        let result = match term {
            Term::Plain(text) => self.lookup_plain(text).await,
            Term::Namespaced { .. } => match term.nozomi_path() {
                Some(path) => Ok(self.lists.fetch_list(&path).await?.into_iter().collect()),
                None => Ok(ResultSet::new()),
            },
        };

        match result {
            Err(Error::InvalidInput(reason)) => {
                tracing::warn!(term = ?term, reason = %reason, "Ignoring malformed lookup result");
                Ok(ResultSet::new())
            }
            other => other,
        }
    }

    async fn lookup_plain(&self, text: &str) -> Result<ResultSet> {
        let key = term_key(text);
        match self.index.lookup_data(ITEMS_FIELD, &key).await? {
            Some(record) => decode_ids_record(&record),
            None => {
                tracing::debug!(term = text, "Term not in index");
                Ok(ResultSet::new())
            }
        }
    }
}

/// Combine per-term sets: groups are unions, clauses intersect, exclusions
/// subtract once a non-empty base exists
fn combine(clauses: &[Clause], found: &HashMap<&Term, ResultSet>) -> ResultSet {
    let set_of = |term: &Term| found.get(term).cloned().unwrap_or_default();

    let mut base: Option<ResultSet> = None;
    for clause in clauses {
        let set = match clause {
            Clause::Required(term) => set_of(term),
            Clause::AnyOf(members) => members.iter().flat_map(set_of).collect(),
            Clause::Excluded(_) => continue,
        };
        base = Some(match base {
            None => set,
            Some(acc) => acc.intersection(&set).copied().collect(),
        });
    }

    let mut result = base.unwrap_or_default();
    if result.is_empty() {
        return result;
    }
    for clause in clauses {
        if let Clause::Excluded(term) = clause
            && let Some(excluded) = found.get(term)
        {
            result.retain(|id| !excluded.contains(id));
        }
    }
    result
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::B;
    use crate::test_helpers::{
        MemoryTransport, encode_ids_record, encode_node, encode_nozomi, index_file,
        test_endpoints, test_fetcher,
    };
    use crate::versions::{IndexKind, IndexVersions};
    use std::sync::Arc;

    /// Build a single-node items index mapping each term to its identifiers.
    fn install_items(transport: &MemoryTransport, terms: &[(&str, &[u32])]) {
        assert!(terms.len() <= B);
        let mut entries: Vec<([u8; 4], Vec<u8>)> = terms
            .iter()
            .map(|(term, ids)| (term_key(term), encode_ids_record(ids)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut data = Vec::new();
        let mut pointers = Vec::new();
        for (_, record) in &entries {
            pointers.push((data.len() as u64, record.len() as u32));
            data.extend_from_slice(record);
        }
        let keys: Vec<&[u8]> = entries.iter().map(|(k, _)| k.as_slice()).collect();
        let root = encode_node(&keys, &pointers, &[]);

        transport.insert("galleriesindex/galleries.1.index", index_file(&[(0, root)]));
        transport.insert("galleriesindex/galleries.1.data", data);
        transport.insert("galleriesindex/version", b"1".to_vec());
    }

    async fn searcher(transport: Arc<MemoryTransport>) -> Searcher {
        let fetcher = test_fetcher(transport);
        let versions = Arc::new(IndexVersions::new(fetcher.clone(), test_endpoints()));
        versions.set(IndexKind::Galleries, "1").await;
        Searcher::new(
            IndexClient::new(fetcher.clone(), test_endpoints(), versions),
            NozomiReader::new(fetcher, test_endpoints()),
        )
    }

    async fn fixture() -> (Arc<MemoryTransport>, Searcher) {
        let transport = Arc::new(MemoryTransport::new());
        install_items(
            &transport,
            &[
                ("x", &[1, 2, 3, 4]),
                ("y", &[3, 4, 5]),
                ("z", &[10, 11]),
                ("long hair", &[2, 4, 6]),
            ],
        );
        transport.insert("tag/female-glasses-all.nozomi", encode_nozomi(&[4, 6, 1]));
        let searcher = searcher(transport.clone()).await;
        (transport, searcher)
    }

    fn set(ids: &[u32]) -> ResultSet {
        ids.iter().copied().collect()
    }

    #[tokio::test]
    async fn single_term_returns_its_record() {
        let (_, searcher) = fixture().await;
        assert_eq!(searcher.evaluate("x").await.unwrap(), set(&[1, 2, 3, 4]));
    }

    #[tokio::test]
    async fn empty_query_is_empty() {
        let (transport, searcher) = fixture().await;
        assert!(searcher.evaluate("").await.unwrap().is_empty());
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn absent_term_empties_the_intersection() {
        let (_, searcher) = fixture().await;
        assert!(!searcher.evaluate("x").await.unwrap().is_empty());
        assert!(searcher.evaluate("x missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn plain_terms_intersect() {
        let (_, searcher) = fixture().await;
        assert_eq!(searcher.evaluate("x y").await.unwrap(), set(&[3, 4]));
    }

    #[tokio::test]
    async fn or_is_union_of_members() {
        let (_, searcher) = fixture().await;
        let x = searcher.evaluate("x").await.unwrap();
        let z = searcher.evaluate("z").await.unwrap();
        let union: ResultSet = x.union(&z).copied().collect();
        assert_eq!(searcher.evaluate("x or z").await.unwrap(), union);
    }

    #[tokio::test]
    async fn or_group_intersects_with_other_clauses() {
        let (_, searcher) = fixture().await;
        assert_eq!(
            searcher.evaluate("y or z x").await.unwrap(),
            set(&[3, 4])
        );
    }

    #[tokio::test]
    async fn negation_is_set_difference() {
        let (_, searcher) = fixture().await;
        let x = searcher.evaluate("x").await.unwrap();
        let y = searcher.evaluate("y").await.unwrap();
        let difference: ResultSet = x.difference(&y).copied().collect();
        assert_eq!(searcher.evaluate("x -y").await.unwrap(), difference);
    }

    #[tokio::test]
    async fn pure_negative_query_is_empty() {
        let (transport, searcher) = fixture().await;
        assert!(searcher.evaluate("-x").await.unwrap().is_empty());
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn repeated_terms_are_idempotent() {
        let (_, searcher) = fixture().await;
        assert_eq!(
            searcher.evaluate("x x x").await.unwrap(),
            searcher.evaluate("x").await.unwrap()
        );
    }

    #[tokio::test]
    async fn underscore_term_hashes_with_space() {
        let (_, searcher) = fixture().await;
        assert_eq!(
            searcher.evaluate("long_hair").await.unwrap(),
            set(&[2, 4, 6])
        );
    }

    #[tokio::test]
    async fn namespaced_term_reads_sorted_list() {
        let (_, searcher) = fixture().await;
        assert_eq!(
            searcher.evaluate("x female:glasses").await.unwrap(),
            set(&[1, 4])
        );
        assert!(
            searcher
                .evaluate("artist:nobody")
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn preference_filter_intersects_result() {
        let (transport, searcher) = fixture().await;
        transport.insert("index-english.nozomi", encode_nozomi(&[2, 3, 99]));
        let options = SearchOptions {
            filter: Some(NozomiState {
                language: "english".into(),
                ..Default::default()
            }),
            order: ResultOrder::Unordered,
        };
        assert_eq!(
            searcher.evaluate_with("x", &options).await.unwrap(),
            set(&[2, 3])
        );
    }

    #[tokio::test]
    async fn newest_first_sorts_descending() {
        let (_, searcher) = fixture().await;
        let options = SearchOptions {
            filter: None,
            order: ResultOrder::NewestFirst,
        };
        assert_eq!(
            searcher.evaluate_sorted("x or z", &options).await.unwrap(),
            vec![11, 10, 4, 3, 2, 1]
        );
    }

    #[tokio::test]
    async fn malformed_record_is_an_empty_lookup() {
        let transport = Arc::new(MemoryTransport::new());
        let key = term_key("bad");
        let root = encode_node(&[key.as_slice()], &[(0, 8)], &[]);
        transport.insert("galleriesindex/galleries.1.index", index_file(&[(0, root)]));
        // count says 5 identifiers, only one follows
        let mut record = 5u32.to_be_bytes().to_vec();
        record.extend_from_slice(&7u32.to_be_bytes());
        transport.insert("galleriesindex/galleries.1.data", record);
        let searcher = searcher(transport).await;

        assert!(searcher.evaluate("bad").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn exhausted_lookup_is_a_hard_failure() {
        let (transport, searcher) = fixture().await;
        transport.fail_with("galleriesindex/galleries.1.data", 503);
        assert!(matches!(
            searcher.evaluate("x").await,
            Err(Error::Exhausted { .. })
        ));
    }

    #[tokio::test]
    async fn lookups_run_concurrently() {
        let (transport, searcher) = fixture().await;
        transport.set_delay(std::time::Duration::from_millis(20));
        searcher.evaluate("x y z").await.unwrap();
        assert!(transport.max_in_flight() >= 2);
    }

    #[test]
    fn combine_skips_exclusions_without_base() {
        let a = Term::Plain("a".into());
        let found = HashMap::from([(&a, set(&[1]))]);
        let clauses = vec![Clause::Excluded(a.clone())];
        assert!(combine(&clauses, &found).is_empty());
    }
}

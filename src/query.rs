//! Query parsing
//!
//! A query is a whitespace-separated list of tokens:
//!
//! - `term` must match
//! - `-term` must not match
//! - `a or b` matches either side; any run of tokens joined by `or` forms one group
//! - `ns:value` looks the value up in a namespace list instead of the full-text index
//!
//! The query is percent-decoded and lowercased before splitting. Within a term,
//! `_` stands for a space.

use sha2::{Digest, Sha256};

use crate::nozomi::NOZOMI_EXTENSION;

/// Keyword joining two tokens into one alternative group
const OR_KEYWORD: &str = "or";

/// A single lookup
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Term {
    /// Full-text term resolved through the item B-tree
    Plain(String),
    /// Namespaced term resolved through a sorted ID list
    Namespaced {
        /// Namespace the value lives in
        namespace: Namespace,
        /// Value within the namespace, spaces restored
        value: String,
    },
}

/// Namespaces with their own sorted ID lists
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// `male:` tags
    Male,
    /// `female:` tags
    Female,
    /// Untagged `tag:` entries
    Tag,
    /// `language:`
    Language,
    /// `artist:`
    Artist,
    /// `character:`
    Character,
    /// `series:`
    Series,
    /// `group:`
    Group,
    /// `type:`
    Type,
}

impl Namespace {
    /// Recognize a namespace prefix
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "male" => Namespace::Male,
            "female" => Namespace::Female,
            "tag" => Namespace::Tag,
            "language" => Namespace::Language,
            "artist" => Namespace::Artist,
            "character" => Namespace::Character,
            "series" => Namespace::Series,
            "group" => Namespace::Group,
            "type" => Namespace::Type,
            _ => return None,
        })
    }

    /// Prefix as written in queries
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Male => "male",
            Namespace::Female => "female",
            Namespace::Tag => "tag",
            Namespace::Language => "language",
            Namespace::Artist => "artist",
            Namespace::Character => "character",
            Namespace::Series => "series",
            Namespace::Group => "group",
            Namespace::Type => "type",
        }
    }

    /// Path of the sorted ID list for `value`, without extension
    pub fn route(&self, value: &str) -> String {
        match self {
            Namespace::Male | Namespace::Female => format!("tag/{}-{value}-all", self.as_str()),
            Namespace::Tag => format!("tag/{value}-all"),
            Namespace::Language => format!("index-{value}-all"),
            Namespace::Artist | Namespace::Character | Namespace::Series | Namespace::Group => {
                format!("{ns}/{ns}-{value}-all", ns = self.as_str())
            }
            Namespace::Type => format!("type/{value}-all"),
        }
    }
}

impl Term {
    /// Classify one token body (no leading `-`)
    ///
    /// An unknown namespace prefix is kept as part of a plain term.
    pub fn parse(token: &str) -> Self {
        if let Some((ns, value)) = token.split_once(':')
            && !value.is_empty()
            && let Some(namespace) = Namespace::parse(ns)
        {
            return Term::Namespaced {
                namespace,
                value: value.replace('_', " "),
            };
        }
        Term::Plain(token.replace('_', " "))
    }

    /// Path of the sorted ID list for a namespaced term
    pub fn nozomi_path(&self) -> Option<String> {
        match self {
            Term::Plain(_) => None,
            Term::Namespaced { namespace, value } => {
                Some(format!("{}{NOZOMI_EXTENSION}", namespace.route(value)))
            }
        }
    }
}

/// B-tree key of a full-text term: the first four bytes of its SHA-256
pub fn term_key(term: &str) -> [u8; 4] {
    let digest = Sha256::digest(term.replace('_', " ").as_bytes());
    [digest[0], digest[1], digest[2], digest[3]]
}

/// One conjunct of a query
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Clause {
    /// Must match
    Required(Term),
    /// At least one member must match
    AnyOf(Vec<Term>),
    /// Must not match
    Excluded(Term),
}

/// Parsed query
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Query {
    /// Clauses in query order
    pub clauses: Vec<Clause>,
}

impl Query {
    /// Parse a raw, possibly percent-encoded, query string
    pub fn parse(raw: &str) -> Self {
        let decoded = urlencoding::decode(raw)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| raw.to_string());
        let lowered = decoded.to_lowercase();

        let mut clauses = Vec::new();
        let mut group: Vec<Term> = Vec::new();
        let mut pending_or = false;

        for token in lowered.split_whitespace() {
            if token == OR_KEYWORD {
                pending_or = !group.is_empty();
                continue;
            }

            let (negated, body) = match token.strip_prefix('-') {
                Some(rest) => (true, rest),
                None => (false, token),
            };
            if body.is_empty() {
                continue;
            }
            let term = Term::parse(body);

            if negated {
                flush_group(&mut group, &mut clauses);
                pending_or = false;
                clauses.push(Clause::Excluded(term));
            } else if pending_or {
                group.push(term);
                pending_or = false;
            } else {
                flush_group(&mut group, &mut clauses);
                group.push(term);
            }
        }
        flush_group(&mut group, &mut clauses);

        Self { clauses }
    }

    /// True when there is nothing to look up
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// True when at least one clause contributes matches
    pub fn has_positive(&self) -> bool {
        self.clauses
            .iter()
            .any(|c| !matches!(c, Clause::Excluded(_)))
    }

    /// Every distinct term, in first-seen order
    pub fn terms(&self) -> Vec<&Term> {
        let mut terms: Vec<&Term> = Vec::new();
        for clause in &self.clauses {
            let members: &[Term] = match clause {
                Clause::Required(term) | Clause::Excluded(term) => std::slice::from_ref(term),
                Clause::AnyOf(members) => members,
            };
            for term in members {
                if !terms.contains(&term) {
                    terms.push(term);
                }
            }
        }
        terms
    }
}

fn flush_group(group: &mut Vec<Term>, clauses: &mut Vec<Clause>) {
    match group.len() {
        0 => {}
        1 => clauses.push(Clause::Required(group.remove(0))),
        _ => clauses.push(Clause::AnyOf(std::mem::take(group))),
    }
}

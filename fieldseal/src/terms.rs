//! Search term generation for searchable encryption.
//!
//! Two index families are supported:
//! - **Unique**: `HMAC(k_unique, encoded value)[..16]`, matched by equality.
//! - **Match**: the value is lowercased and split into n-grams; each n-gram is
//!   tagged with `HMAC(k_match, ngram)` and mapped to bloom filter positions. A
//!   stored filter matches a query filter if it contains every query position.
//!
//! The keyed tagging happens in the [`CryptoProvider`]; this module decides
//! which bytes are tagged and how tags become terms. Write-time indexes and
//! query-time terms go through the same derivation, which is what makes
//! equality search work against randomized ciphertexts.

use crate::context::{IndexContext, IndexKind};
use crate::dispatch::{CallError, CallGuard};
use crate::error::Error;
use crate::payload::CiphertextPayload;
use crate::policy::{Capability, ColumnPolicy, MatchOptions};
use crate::provider::{CryptoProvider, TermRequest};
use crate::value::PlaintextValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::debug;
use zeroize::Zeroizing;

/// Unique index output size (16 bytes).
pub const BLIND_INDEX_SIZE: usize = 16;

/// Minimum tag length a provider must return.
const MIN_TAG_SIZE: usize = 32;

/// Characters treated as `ilike` wildcards in query patterns.
const WILDCARDS: [char; 2] = ['%', '_'];

/// Set bits of a match-index bloom filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BloomFilter {
    positions: BTreeSet<u16>,
}

impl BloomFilter {
    /// Creates an empty filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a filter from set positions.
    pub fn from_positions(positions: impl IntoIterator<Item = u16>) -> Self {
        Self { positions: positions.into_iter().collect() }
    }

    /// Sets the positions selected by one n-gram tag.
    fn insert_tag(&mut self, tag: &[u8], options: &MatchOptions) {
        for pair in tag.chunks_exact(2).take(options.hash_count) {
            let h = u16::from_be_bytes([pair[0], pair[1]]);
            self.positions.insert(h % options.filter_bits);
        }
    }

    /// Returns `true` if every position of `query` is set in this filter.
    #[must_use]
    pub fn contains_all(&self, query: &Self) -> bool {
        query.positions.is_subset(&self.positions)
    }

    /// Iterates set positions in ascending order.
    pub fn positions(&self) -> impl Iterator<Item = u16> + '_ {
        self.positions.iter().copied()
    }

    /// Returns `true` if no bit is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

/// Encoding a search term is derived for.
///
/// `Exact` terms feed equality predicates, `Pattern` terms feed `ilike`-style
/// predicates. They come from different keys and are never interchangeable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnForm {
    /// Exact composite literal (unique index)
    Exact,
    /// Pattern-matchable form (match index)
    Pattern,
}

impl ReturnForm {
    const fn capability(self) -> Capability {
        match self {
            Self::Exact => Capability::Equality,
            Self::Pattern => Capability::FreeTextSearch,
        }
    }
}

/// Derived value of a search term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TermValue {
    /// Unique index bytes
    Unique(#[serde(with = "hex::serde")] Vec<u8>),
    /// Match filter positions
    Match(BloomFilter),
}

/// Encrypted token for one query fragment on one column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchTerm {
    table: String,
    column: String,
    value: TermValue,
}

impl SearchTerm {
    /// Returns the table the term was derived for.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Returns the column the term was derived for.
    #[must_use]
    pub fn column(&self) -> &str {
        &self.column
    }

    /// Returns the derived value.
    #[must_use]
    pub const fn value(&self) -> &TermValue {
        &self.value
    }

    /// Returns the form the term was derived in.
    #[must_use]
    pub const fn form(&self) -> ReturnForm {
        match self.value {
            TermValue::Unique(_) => ReturnForm::Exact,
            TermValue::Match(_) => ReturnForm::Pattern,
        }
    }

    /// Checks the term against a payload's stored indexes.
    ///
    /// Unique indexes are compared in constant time.
    #[must_use]
    pub fn matches(&self, payload: &CiphertextPayload) -> bool {
        if payload.table() != self.table || payload.column() != self.column {
            return false;
        }
        match &self.value {
            TermValue::Unique(term) => {
                payload.unique_index().is_some_and(|stored| bool::from(stored.ct_eq(term)))
            }
            TermValue::Match(query) => {
                payload.match_index().is_some_and(|stored| stored.contains_all(query))
            }
        }
    }
}

/// One derivation in a batched [`TermGenerator::derive_terms`] call.
#[derive(Debug, Clone, Copy)]
pub struct TermQuery<'a> {
    /// Plaintext fragment
    pub value: &'a PlaintextValue,
    /// Column the term targets
    pub policy: &'a ColumnPolicy,
    /// Desired return form
    pub form: ReturnForm,
}

/// Indexes issued for a value at write time.
#[derive(Debug, Default)]
pub(crate) struct WriteIndexes {
    pub(crate) unique: Option<Vec<u8>>,
    pub(crate) matching: Option<BloomFilter>,
}

/// Tags requested for one term, before assembly.
struct Planned<'a> {
    form: ReturnForm,
    policy: &'a ColumnPolicy,
    tags: usize,
}

/// Derives search terms and write-time indexes through a provider.
pub struct TermGenerator<P: CryptoProvider> {
    provider: Arc<P>,
    guard: CallGuard,
}

impl<P: CryptoProvider> TermGenerator<P> {
    pub(crate) const fn new(provider: Arc<P>, guard: CallGuard) -> Self {
        Self { provider, guard }
    }

    /// Derives one search term.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnsupportedSearchMode` if the column does not enable the
    /// capability behind `form`, `Error::IndexGeneration` if the provider
    /// fails, and `Error::Cancelled` if the call was cancelled.
    pub async fn derive_term(
        &self,
        value: &PlaintextValue,
        policy: &ColumnPolicy,
        form: ReturnForm,
    ) -> Result<SearchTerm, Error> {
        self.derive_terms(&[TermQuery { value, policy, form }])
            .await?
            .pop()
            .ok_or_else(|| Error::IndexGeneration("provider returned no term".to_string()))
    }

    /// Derives several terms with a single provider call, in input order.
    ///
    /// Each request is tagged under its own column and index kind, so batching
    /// links nothing that separate calls would not.
    ///
    /// # Errors
    ///
    /// Fails as a whole if any query is unsupported or the provider fails.
    pub async fn derive_terms(&self, queries: &[TermQuery<'_>]) -> Result<Vec<SearchTerm>, Error> {
        let mut requests = Vec::new();
        let mut plan = Vec::with_capacity(queries.len());

        for query in queries {
            let capability = query.form.capability();
            if !query.policy.supports(capability) {
                return Err(Error::UnsupportedSearchMode {
                    column: format!("{}.{}", query.policy.table(), query.policy.column()),
                    capability: capability.to_string(),
                });
            }
            if query.form == ReturnForm::Pattern {
                query.policy.match_options().validate()?;
            }
            let tags = push_requests(&mut requests, query.value, query.policy, query.form, true);
            plan.push(Planned { form: query.form, policy: query.policy, tags });
        }

        let tags = self.tag(requests).await?;
        let mut offset = 0;
        let terms = plan
            .into_iter()
            .map(|p| {
                let value = assemble(p.form, p.policy, &tags[offset..offset + p.tags])?;
                offset += p.tags;
                Ok(SearchTerm {
                    table: p.policy.table().to_string(),
                    column: p.policy.column().to_string(),
                    value,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        debug!(terms = terms.len(), "derived search terms");
        Ok(terms)
    }

    /// Derives the indexes stored with a freshly encrypted value.
    pub(crate) async fn write_indexes(
        &self,
        value: &PlaintextValue,
        policy: &ColumnPolicy,
    ) -> Result<WriteIndexes, Error> {
        let mut requests = Vec::new();
        let mut plan = Vec::with_capacity(2);

        for form in [ReturnForm::Exact, ReturnForm::Pattern] {
            if policy.supports(form.capability()) {
                if form == ReturnForm::Pattern {
                    policy.match_options().validate()?;
                }
                let tags = push_requests(&mut requests, value, policy, form, false);
                plan.push(Planned { form, policy, tags });
            }
        }
        if plan.is_empty() {
            return Ok(WriteIndexes::default());
        }

        let tags = self.tag(requests).await?;
        let mut indexes = WriteIndexes::default();
        let mut offset = 0;
        for p in plan {
            match assemble(p.form, policy, &tags[offset..offset + p.tags])? {
                TermValue::Unique(bytes) => indexes.unique = Some(bytes),
                TermValue::Match(filter) => indexes.matching = Some(filter),
            }
            offset += p.tags;
        }
        Ok(indexes)
    }

    async fn tag(&self, requests: Vec<TermRequest>) -> Result<Vec<Vec<u8>>, Error> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let expected = requests.len();
        let tags = self
            .guard
            .run("derive_terms", || self.provider.derive_terms(&requests))
            .await
            .map_err(|e| match e {
                CallError::Cancelled => Error::Cancelled,
                CallError::Provider(err) => Error::IndexGeneration(err.to_string()),
            })?;

        if tags.len() != expected {
            return Err(Error::IndexGeneration(format!(
                "provider returned {} tags for {expected} requests",
                tags.len()
            )));
        }
        if let Some(short) = tags.iter().find(|t| t.len() < MIN_TAG_SIZE) {
            return Err(Error::IndexGeneration(format!(
                "provider tag too short: {} bytes (min: {MIN_TAG_SIZE})",
                short.len()
            )));
        }
        Ok(tags)
    }
}

impl<P: CryptoProvider> Clone for TermGenerator<P> {
    fn clone(&self) -> Self {
        Self { provider: Arc::clone(&self.provider), guard: self.guard.clone() }
    }
}

/// Appends the provider requests for one term, returning how many were added.
fn push_requests(
    requests: &mut Vec<TermRequest>,
    value: &PlaintextValue,
    policy: &ColumnPolicy,
    form: ReturnForm,
    query: bool,
) -> usize {
    match form {
        ReturnForm::Exact => {
            requests.push(TermRequest {
                context: IndexContext::new(policy.table(), policy.column(), IndexKind::Unique),
                input: value.to_bytes(),
            });
            1
        }
        ReturnForm::Pattern => {
            let tokens = tokenize(&value.search_text(), policy.match_options().ngram, query);
            let count = tokens.len();
            requests.extend(tokens.into_iter().map(|token| TermRequest {
                context: IndexContext::new(policy.table(), policy.column(), IndexKind::Match),
                input: Zeroizing::new(token.into_bytes()),
            }));
            count
        }
    }
}

fn assemble(form: ReturnForm, policy: &ColumnPolicy, tags: &[Vec<u8>]) -> Result<TermValue, Error> {
    match form {
        ReturnForm::Exact => {
            let tag = tags
                .first()
                .ok_or_else(|| Error::IndexGeneration("missing unique tag".to_string()))?;
            Ok(TermValue::Unique(tag[..BLIND_INDEX_SIZE].to_vec()))
        }
        ReturnForm::Pattern => {
            let mut filter = BloomFilter::new();
            for tag in tags {
                filter.insert_tag(tag, policy.match_options());
            }
            Ok(TermValue::Match(filter))
        }
    }
}

/// Splits text into the n-grams fed to the match index.
///
/// Text is lowercased. A stored value shorter than `ngram` is a single token.
/// Query patterns are split on `ilike` wildcards and fragments shorter than
/// `ngram` are dropped: they add no constraint, so `A%` yields an empty filter
/// that every stored filter contains.
pub(crate) fn tokenize(text: &str, ngram: usize, query: bool) -> BTreeSet<String> {
    let lowered = text.to_lowercase();
    let fragments: Vec<&str> =
        if query { lowered.split(WILDCARDS).collect() } else { vec![lowered.as_str()] };

    let mut tokens = BTreeSet::new();
    for fragment in fragments {
        let chars: Vec<char> = fragment.chars().collect();
        if chars.is_empty() || (query && chars.len() < ngram) {
            continue;
        }
        if chars.len() <= ngram {
            tokens.insert(fragment.to_string());
        } else {
            for window in chars.windows(ngram) {
                tokens.insert(window.iter().collect());
            }
        }
    }
    tokens
}

/// Case-insensitive `ilike` match of a whole string.
///
/// `%` matches any run of characters, `_` exactly one. There is no escape
/// character.
#[must_use]
pub fn ilike(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.to_lowercase().chars().collect();
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let (mut t, mut p) = (0, 0);
    // Last `%` seen and the text position it currently absorbs up to
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some('%') => {
                star = Some((p, t));
                p += 1;
            }
            Some(&c) if c == '_' || c == text[t] => {
                t += 1;
                p += 1;
            }
            _ => match star {
                Some((sp, st)) => {
                    star = Some((sp, st + 1));
                    p = sp + 1;
                    t = st + 1;
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == '%')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Limits;
    use crate::testing::MockProvider;

    fn generator(provider: MockProvider) -> TermGenerator<MockProvider> {
        TermGenerator::new(Arc::new(provider), CallGuard::new(Limits::default()))
    }

    fn email() -> ColumnPolicy {
        ColumnPolicy::new("users", "email").equality().free_text_search()
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    fn match_filter(term: &SearchTerm) -> &BloomFilter {
        match term.value() {
            TermValue::Match(filter) => filter,
            TermValue::Unique(_) => panic!("expected match term"),
        }
    }

    #[test]
    fn test_tokenize_ngrams() {
        assert_eq!(tokenize("Alice", 3, false), set(&["ali", "lic", "ice"]));
        assert_eq!(tokenize("Al", 3, false), set(&["al"]));
        assert!(tokenize("", 3, false).is_empty());
    }

    #[test]
    fn test_tokenize_query_wildcards() {
        assert_eq!(tokenize("%ALI%ce", 3, true), set(&["ali"]));
        assert_eq!(tokenize("a@x.com", 3, true), set(&["a@x", "@x.", "x.c", ".co", "com"]));
        assert!(tokenize("%", 3, true).is_empty());
        assert!(tokenize("A%", 3, true).is_empty());
        assert!(tokenize("%al%", 3, true).is_empty());
    }

    #[test]
    fn test_ilike() {
        assert!(ilike("Alice", "A%"));
        assert!(ilike("Alice", "%al%"));
        assert!(ilike("Alice", "%LIC%"));
        assert!(ilike("Alice", "al_ce"));
        assert!(ilike("a@x.com", "a@x.com"));
        assert!(ilike("maria@x.com", "%a@x.com"));
        assert!(ilike("", "%"));
        assert!(ilike("abcabc", "%abc"));
        assert!(!ilike("maria@x.com", "a@x.com"));
        assert!(!ilike("Alice", "B%"));
        assert!(!ilike("Alice", "Alic"));
        assert!(!ilike("Alice", "Alice_"));
        assert!(!ilike("", "_"));
    }

    #[test]
    fn test_tokenize_multibyte() {
        let tokens = tokenize("Ünïcode", 6, false);
        assert!(tokens.contains("ünïcod"));
        assert!(tokens.contains("nïcode"));
    }

    #[test]
    fn test_bloom_containment() {
        let stored = BloomFilter::from_positions([1, 5, 9, 200]);
        assert!(stored.contains_all(&BloomFilter::from_positions([5, 200])));
        assert!(!stored.contains_all(&BloomFilter::from_positions([5, 6])));
        assert!(stored.contains_all(&BloomFilter::new()));
    }

    #[tokio::test]
    async fn test_exact_term_deterministic() {
        let terms = generator(MockProvider::new());
        let value = PlaintextValue::from("alice@example.com");

        let t1 = terms.derive_term(&value, &email(), ReturnForm::Exact).await.unwrap();
        let t2 = terms.derive_term(&value, &email(), ReturnForm::Exact).await.unwrap();

        assert_eq!(t1, t2);
        assert_eq!(t1.form(), ReturnForm::Exact);
        match t1.value() {
            TermValue::Unique(bytes) => assert_eq!(bytes.len(), BLIND_INDEX_SIZE),
            TermValue::Match(_) => panic!("expected unique term"),
        }
    }

    #[tokio::test]
    async fn test_different_values_different_terms() {
        let terms = generator(MockProvider::new());
        let a = PlaintextValue::from("alice@example.com");
        let b = PlaintextValue::from("bob@example.com");
        let a = terms.derive_term(&a, &email(), ReturnForm::Exact).await.unwrap();
        let b = terms.derive_term(&b, &email(), ReturnForm::Exact).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_different_columns_different_terms() {
        let terms = generator(MockProvider::new());
        let value = PlaintextValue::from("alice");
        let name = ColumnPolicy::new("users", "name").equality();

        let a = terms.derive_term(&value, &email(), ReturnForm::Exact).await.unwrap();
        let b = terms.derive_term(&value, &name, ReturnForm::Exact).await.unwrap();
        assert_ne!(a.value(), b.value());
    }

    #[tokio::test]
    async fn test_unsupported_search_mode() {
        let terms = generator(MockProvider::new());
        let equality_only = ColumnPolicy::new("users", "email").equality();

        let result = terms
            .derive_term(&"alice".into(), &equality_only, ReturnForm::Pattern)
            .await;
        assert!(matches!(result, Err(Error::UnsupportedSearchMode { .. })));

        let text_only = ColumnPolicy::new("users", "name").free_text_search();
        let result = terms.derive_term(&"alice".into(), &text_only, ReturnForm::Exact).await;
        assert!(matches!(result, Err(Error::UnsupportedSearchMode { .. })));
    }

    #[tokio::test]
    async fn test_batch_matches_single_derivation() {
        let provider = MockProvider::new();
        let terms = generator(provider.clone());
        let name = ColumnPolicy::new("users", "name").free_text_search();
        let a = PlaintextValue::from("a@x.com");
        let b = PlaintextValue::from("Alice");

        let batch = terms
            .derive_terms(&[
                TermQuery { value: &a, policy: &email(), form: ReturnForm::Exact },
                TermQuery { value: &b, policy: &name, form: ReturnForm::Pattern },
            ])
            .await
            .unwrap();
        assert_eq!(provider.term_calls(), 1);

        let single_a = terms.derive_term(&a, &email(), ReturnForm::Exact).await.unwrap();
        let single_b = terms.derive_term(&b, &name, ReturnForm::Pattern).await.unwrap();
        assert_eq!(batch, vec![single_a, single_b]);
    }

    #[tokio::test]
    async fn test_pattern_query_matches_write_index() {
        let terms = generator(MockProvider::new());
        let policy = email();
        let value = PlaintextValue::from("Alice@Example.com");

        let indexes = terms.write_indexes(&value, &policy).await.unwrap();
        let stored = indexes.matching.expect("match index issued");
        assert!(indexes.unique.is_some());

        for pattern in ["alice", "%EXAMPLE%", "ice@ex", "alice@example.com"] {
            let value = PlaintextValue::from(pattern);
            let term = terms.derive_term(&value, &policy, ReturnForm::Pattern).await.unwrap();
            assert!(stored.contains_all(match_filter(&term)), "{pattern} should match");
        }
    }

    #[tokio::test]
    async fn test_prefix_and_short_substring_patterns_match() {
        let terms = generator(MockProvider::new());
        let policy = ColumnPolicy::new("users", "name").free_text_search();
        let indexes = terms.write_indexes(&"Alice".into(), &policy).await.unwrap();
        let stored = indexes.matching.expect("match index issued");

        for pattern in ["A%", "%al%", "%lic%", "ali%", "%ce"] {
            let value = PlaintextValue::from(pattern);
            let term = terms.derive_term(&value, &policy, ReturnForm::Pattern).await.unwrap();
            assert!(stored.contains_all(match_filter(&term)), "{pattern} should match");
        }

        let miss = terms.derive_term(&"%bob%".into(), &policy, ReturnForm::Pattern).await.unwrap();
        assert!(!match_filter(&miss).is_empty());
    }

    #[tokio::test]
    async fn test_invalid_match_options_rejected() {
        let provider = MockProvider::new();
        let terms = generator(provider.clone());
        let options = MatchOptions { filter_bits: 0, ..MatchOptions::default() };
        let policy =
            ColumnPolicy::new("users", "name").free_text_search().with_match_options(options);

        let written = terms.write_indexes(&"Alice".into(), &policy).await;
        assert!(matches!(written, Err(Error::Config(_))));
        let queried = terms.derive_term(&"ali%".into(), &policy, ReturnForm::Pattern).await;
        assert!(matches!(queried, Err(Error::Config(_))));
        assert_eq!(provider.term_calls(), 0);
    }

    #[tokio::test]
    async fn test_no_indexes_without_capabilities() {
        let provider = MockProvider::new();
        let terms = generator(provider.clone());
        let plain = ColumnPolicy::new("users", "notes");

        let indexes = terms.write_indexes(&"secret".into(), &plain).await.unwrap();
        assert!(indexes.unique.is_none());
        assert!(indexes.matching.is_none());
        assert_eq!(provider.term_calls(), 0);
    }
}

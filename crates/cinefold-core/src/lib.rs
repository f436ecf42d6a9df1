//! Core domain model, crawl cursors and output document types for Cinefold.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cinefold-core";

/// Upstream metadata sources. `ALL` is ordered by descending merge priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceId {
    Tmdb,
    Tvmaze,
    Wikidata,
}

impl SourceId {
    pub const ALL: [SourceId; 3] = [SourceId::Tmdb, SourceId::Tvmaze, SourceId::Wikidata];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceId::Tmdb => "tmdb",
            SourceId::Tvmaze => "tvmaze",
            SourceId::Wikidata => "wikidata",
        }
    }

    /// Scalar conflict priority: catalog API > secondary API > graph source.
    pub fn priority(&self) -> u8 {
        match self {
            SourceId::Tmdb => 3,
            SourceId::Tvmaze => 2,
            SourceId::Wikidata => 1,
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseKeyError(pub String);

impl fmt::Display for ParseKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid crawl key or source: {}", self.0)
    }
}

impl std::error::Error for ParseKeyError {}

impl FromStr for SourceId {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tmdb" => Ok(SourceId::Tmdb),
            "tvmaze" => Ok(SourceId::Tvmaze),
            "wikidata" => Ok(SourceId::Wikidata),
            other => Err(ParseKeyError(other.to_string())),
        }
    }
}

/// A `(source, category)` pair; rendered as `"{source}:{category}"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct CrawlKey {
    pub source: SourceId,
    pub category: String,
}

impl CrawlKey {
    pub fn new(source: SourceId, category: impl Into<String>) -> Self {
        Self {
            source,
            category: category.into(),
        }
    }
}

impl fmt::Display for CrawlKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.category)
    }
}

impl FromStr for CrawlKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (source, category) = s.split_once(':').ok_or_else(|| ParseKeyError(s.to_string()))?;
        if category.trim().is_empty() {
            return Err(ParseKeyError(s.to_string()));
        }
        Ok(Self::new(source.parse()?, category.trim()))
    }
}

impl From<CrawlKey> for String {
    fn from(key: CrawlKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for CrawlKey {
    type Error = ParseKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Opaque pagination marker. `Start` is the zero value; adapters map it to their first page.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cursor {
    #[default]
    Start,
    Page(u32),
    Token(String),
}

impl Cursor {
    pub fn page_number(&self, first_page: u32) -> Option<u32> {
        match self {
            Cursor::Start => Some(first_page),
            Cursor::Page(n) => Some(*n),
            Cursor::Token(_) => None,
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cursor::Start => f.write_str("start"),
            Cursor::Page(n) => write!(f, "page={n}"),
            Cursor::Token(t) => write!(f, "token={t}"),
        }
    }
}

/// Resumption state for one `(source, category)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CrawlCursor {
    #[serde(default)]
    pub next_cursor: Cursor,
    #[serde(default)]
    pub exhausted: bool,
    #[serde(default)]
    pub last_success_timestamp: Option<DateTime<Utc>>,
}

/// Persisted cursor map keyed by `CrawlKey` strings.
///
/// Keys are kept as strings so cursors for categories that were later removed
/// from the registry still round-trip untouched.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointState {
    cursors: BTreeMap<String, CrawlCursor>,
}

impl CheckpointState {
    pub fn get(&self, key: &CrawlKey) -> CrawlCursor {
        self.cursors.get(&key.to_string()).cloned().unwrap_or_default()
    }

    pub fn record_success(
        &mut self,
        key: &CrawlKey,
        next_cursor: Cursor,
        exhausted: bool,
        at: DateTime<Utc>,
    ) {
        let entry = self.cursors.entry(key.to_string()).or_default();
        entry.next_cursor = next_cursor;
        entry.exhausted = exhausted;
        entry.last_success_timestamp = Some(at);
    }

    /// Reopens exhausted cursors whose last success is older than `after`.
    /// `reset_to` picks where each reopened key resumes (usually `Cursor::Start`).
    pub fn apply_rollover<F>(&mut self, now: DateTime<Utc>, after: Duration, reset_to: F) -> Vec<String>
    where
        F: Fn(&str, &Cursor) -> Cursor,
    {
        let mut reset = Vec::new();
        for (key, cursor) in self.cursors.iter_mut() {
            if !cursor.exhausted {
                continue;
            }
            let stale = cursor
                .last_success_timestamp
                .map(|ts| now - ts >= after)
                .unwrap_or(true);
            if stale {
                cursor.next_cursor = reset_to(key, &cursor.next_cursor);
                cursor.exhausted = false;
                reset.push(key.clone());
            }
        }
        reset
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &CrawlCursor)> {
        self.cursors.iter()
    }
}

/// Identifier a source assigns to a title, e.g. `imdb:tt0133093` or `tvmaze:82`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExternalId {
    pub namespace: String,
    pub value: String,
}

impl ExternalId {
    pub const IMDB: &'static str = "imdb";

    pub fn new(namespace: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            value: value.into(),
        }
    }

    pub fn imdb(value: impl Into<String>) -> Self {
        Self::new(Self::IMDB, value)
    }

    pub fn is_imdb(&self) -> bool {
        self.namespace == Self::IMDB
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.namespace, self.value)
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trailer {
    pub url: String,
    pub source: SourceId,
    pub is_official: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Flatrate,
    Rent,
    Buy,
    Free,
    Ads,
}

/// OTT availability entry for one region.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Provider {
    pub provider_name: String,
    pub region: String,
    #[serde(rename = "type")]
    pub kind: ProviderKind,
}

/// Normalized candidate emitted by an adapter, before deduplication.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordDraft {
    pub source: SourceId,
    pub crawl_key: CrawlKey,
    pub fetched_at: DateTime<Utc>,
    pub external_ids: Vec<ExternalId>,
    pub title: String,
    pub year: Option<i32>,
    pub overview: Option<String>,
    pub poster_url: Option<String>,
    pub rating: Option<f64>,
    /// US dollars; TMDb reports 0 when unknown, mapped to `None`.
    pub budget: Option<u64>,
    pub revenue: Option<u64>,
    pub genres: BTreeSet<String>,
    pub cast: BTreeSet<String>,
    pub directors: BTreeSet<String>,
    pub writers: BTreeSet<String>,
    pub trailers: Vec<Trailer>,
    pub providers: BTreeSet<Provider>,
}

impl RecordDraft {
    pub fn new(crawl_key: CrawlKey, fetched_at: DateTime<Utc>, title: impl Into<String>) -> Self {
        Self {
            source: crawl_key.source,
            crawl_key,
            fetched_at,
            external_ids: Vec::new(),
            title: title.into(),
            year: None,
            overview: None,
            poster_url: None,
            rating: None,
            budget: None,
            revenue: None,
            genres: BTreeSet::new(),
            cast: BTreeSet::new(),
            directors: BTreeSet::new(),
            writers: BTreeSet::new(),
            trailers: Vec::new(),
            providers: BTreeSet::new(),
        }
    }

    pub fn imdb_id(&self) -> Option<&ExternalId> {
        self.external_ids.iter().find(|id| id.is_imdb())
    }
}

/// Which source last supplied each scalar field.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FieldSources {
    pub title: Option<SourceId>,
    pub year: Option<SourceId>,
    pub overview: Option<SourceId>,
    pub poster: Option<SourceId>,
    #[serde(default)]
    pub budget: Option<SourceId>,
    #[serde(default)]
    pub revenue: Option<SourceId>,
}

/// Deduplicated title as written to the output document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub id: Uuid,
    pub identity_key: String,
    pub title: String,
    pub year: Option<i32>,
    pub overview: Option<String>,
    pub poster: Option<String>,
    pub rating: Option<f64>,
    #[serde(default)]
    pub ratings: BTreeMap<SourceId, f64>,
    #[serde(default)]
    pub budget: Option<u64>,
    #[serde(default)]
    pub revenue: Option<u64>,
    #[serde(default)]
    pub genres: BTreeSet<String>,
    #[serde(default)]
    pub cast: BTreeSet<String>,
    #[serde(default)]
    pub directors: BTreeSet<String>,
    #[serde(default)]
    pub writers: BTreeSet<String>,
    #[serde(default)]
    pub trailers: Vec<Trailer>,
    #[serde(default)]
    pub providers: BTreeSet<Provider>,
    #[serde(default)]
    pub category: BTreeSet<String>,
    #[serde(default)]
    pub sources: BTreeSet<SourceId>,
    #[serde(default)]
    pub field_sources: FieldSources,
    #[serde(default)]
    pub match_keys: BTreeSet<String>,
}

pub fn record_id_for_key(identity_key: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("cinefold:{identity_key}").as_bytes())
}

/// The snapshot document handed to the packaging step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoviesDocument {
    #[serde(default)]
    pub developer: serde_json::Value,
    pub last_updated: DateTime<Utc>,
    pub total_entries: usize,
    #[serde(default)]
    pub breakdown: BTreeMap<String, usize>,
    #[serde(default)]
    pub tmdb_categories: BTreeMap<String, usize>,
    #[serde(default)]
    pub tmdb_tv_categories: BTreeMap<String, usize>,
    #[serde(default)]
    pub movies: Vec<CanonicalRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 1, hour, 0, 0).single().unwrap()
    }

    #[test]
    fn crawl_key_round_trips_through_string_form() {
        let key: CrawlKey = "tmdb:tv/airing_today".parse().unwrap();
        assert_eq!(key, CrawlKey::new(SourceId::Tmdb, "tv/airing_today"));
        assert_eq!(key.to_string(), "tmdb:tv/airing_today");
        assert!("netflix:popular".parse::<CrawlKey>().is_err());
        assert!("tmdb:".parse::<CrawlKey>().is_err());
    }

    #[test]
    fn absent_cursor_is_zero_value() {
        let state = CheckpointState::default();
        let cursor = state.get(&CrawlKey::new(SourceId::Tvmaze, "shows"));
        assert_eq!(cursor.next_cursor, Cursor::Start);
        assert!(!cursor.exhausted);
        assert!(cursor.last_success_timestamp.is_none());
    }

    #[test]
    fn cursor_json_forms() {
        let parsed: CrawlCursor =
            serde_json::from_str(r#"{"next_cursor":3,"exhausted":false,"last_success_timestamp":null}"#)
                .unwrap();
        assert_eq!(parsed.next_cursor, Cursor::Page(3));
        let parsed: CrawlCursor = serde_json::from_str(r#"{"next_cursor":null}"#).unwrap();
        assert_eq!(parsed.next_cursor, Cursor::Start);
        let parsed: CrawlCursor = serde_json::from_str(r#"{"next_cursor":"abc"}"#).unwrap();
        assert_eq!(parsed.next_cursor, Cursor::Token("abc".into()));
    }

    #[test]
    fn rollover_resets_only_stale_exhausted_cursors() {
        let mut state = CheckpointState::default();
        let stale = CrawlKey::new(SourceId::Wikidata, "films");
        let fresh = CrawlKey::new(SourceId::Tmdb, "movie/trending");
        let open = CrawlKey::new(SourceId::Tvmaze, "shows");
        state.record_success(&stale, Cursor::Page(2), true, ts(0));
        state.record_success(&fresh, Cursor::Page(9), true, ts(20));
        state.record_success(&open, Cursor::Page(4), false, ts(0));

        let reset = state.apply_rollover(ts(23), Duration::hours(12), |_, _| Cursor::Start);

        assert_eq!(reset, vec![stale.to_string()]);
        assert!(!state.get(&stale).exhausted);
        assert_eq!(state.get(&stale).next_cursor, Cursor::Start);
        assert!(state.get(&fresh).exhausted);
        assert_eq!(state.get(&open).next_cursor, Cursor::Page(4));
    }
}

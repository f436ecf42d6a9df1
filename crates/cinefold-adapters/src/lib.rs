//! Source adapter contracts plus the TMDb, TVMaze and Wikidata adapters.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cinefold_core::{CrawlKey, Cursor, RecordDraft, SourceId};
use cinefold_storage::{FetchError, FetchErrorKind, HttpFetcher};
use scraper::Html;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

mod tmdb;
mod tvmaze;
mod wikidata;

pub use tmdb::{
    draft_from_list_item, tmdb_genre_name, MediaKind, TmdbAdapter, TmdbListItem, TMDB_API_BASE,
    TMDB_CATEGORIES, TMDB_IMAGE_BASE,
};
pub use tvmaze::{draft_from_show, TvmazeAdapter, TvmazeShow, TVMAZE_API_BASE, TVMAZE_CATEGORIES};
pub use wikidata::{
    drafts_from_bindings, films_query, FilmBinding, SparqlTerm, WikidataAdapter, WIKIDATA_CATEGORIES,
    WIKIDATA_SPARQL_ENDPOINT,
};

pub const CRATE_NAME: &str = "cinefold-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Network-level trouble; skip the category for this run.
    Transient,
    /// Credentials or configuration are wrong; abort the run.
    Fatal,
    /// The response did not have the expected shape.
    Data,
}

#[derive(Debug, Error)]
#[error("{source_id}:{category} ({kind:?}): {message}")]
pub struct AdapterError {
    pub source_id: SourceId,
    pub category: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl AdapterError {
    pub fn new(key: &CrawlKey, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            source_id: key.source,
            category: key.category.clone(),
            kind,
            message: message.into(),
        }
    }

    pub fn data(key: &CrawlKey, message: impl Into<String>) -> Self {
        Self::new(key, ErrorKind::Data, message)
    }

    pub fn from_fetch(key: &CrawlKey, err: FetchError) -> Self {
        let kind = match err.kind() {
            FetchErrorKind::Fatal => ErrorKind::Fatal,
            FetchErrorKind::Transient => ErrorKind::Transient,
        };
        Self::new(key, kind, err.to_string())
    }

    pub fn crawl_key(&self) -> CrawlKey {
        CrawlKey::new(self.source_id, self.category.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

/// One fetched page, already mapped to candidates.
#[derive(Debug, Clone, PartialEq)]
pub struct ListPage {
    pub drafts: Vec<RecordDraft>,
    pub next_cursor: Cursor,
    pub has_more: bool,
    /// Items that failed to parse, with the reason.
    pub dropped: Vec<String>,
}

impl ListPage {
    pub fn end(cursor: Cursor) -> Self {
        Self {
            drafts: Vec::new(),
            next_cursor: cursor,
            has_more: false,
            dropped: Vec::new(),
        }
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> SourceId;

    fn categories(&self) -> &'static [&'static str];

    fn supports(&self, category: &str) -> bool {
        self.categories().contains(&category)
    }

    /// Where an exhausted cursor resumes once its rollover window has passed.
    fn rollover_cursor(&self, _exhausted_at: &Cursor) -> Cursor {
        Cursor::Start
    }

    async fn list_page(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        category: &str,
        cursor: &Cursor,
    ) -> Result<ListPage, AdapterError>;
}

/// Credentials and knobs the adapters need; credentials are opaque strings.
#[derive(Clone)]
pub struct AdapterSettings {
    pub tmdb_api_key: String,
    pub tmdb_access_token: String,
    pub watch_regions: Vec<String>,
    pub wikidata_limit: u32,
}

impl fmt::Debug for AdapterSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterSettings")
            .field("tmdb_api_key", &"<redacted>")
            .field("tmdb_access_token", &"<redacted>")
            .field("watch_regions", &self.watch_regions)
            .field("wikidata_limit", &self.wikidata_limit)
            .finish()
    }
}

pub fn adapter_for_source(source: SourceId, settings: &AdapterSettings) -> Box<dyn SourceAdapter> {
    match source {
        SourceId::Tmdb => Box::new(
            TmdbAdapter::new(&settings.tmdb_api_key, &settings.tmdb_access_token)
                .with_watch_regions(settings.watch_regions.clone()),
        ),
        SourceId::Tvmaze => Box::new(TvmazeAdapter::new()),
        SourceId::Wikidata => Box::new(WikidataAdapter::new(settings.wikidata_limit)),
    }
}

pub(crate) fn parse_json<T: DeserializeOwned>(key: &CrawlKey, bytes: &[u8]) -> Result<T, AdapterError> {
    serde_json::from_slice(bytes)
        .map_err(|e| AdapterError::data(key, format!("unexpected response shape: {e}")))
}

/// Parses each raw item on its own so one bad item only drops itself.
pub(crate) fn parse_items<T: DeserializeOwned>(
    key: &CrawlKey,
    raw: Vec<JsonValue>,
    dropped: &mut Vec<String>,
) -> Vec<T> {
    let mut items = Vec::with_capacity(raw.len());
    for (index, value) in raw.into_iter().enumerate() {
        match serde_json::from_value::<T>(value) {
            Ok(item) => items.push(item),
            Err(err) => {
                warn!(crawl_key = %key, index, error = %err, "dropping unparseable item");
                dropped.push(format!("item {index}: {err}"));
            }
        }
    }
    items
}

pub(crate) fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Year from an ISO-ish date (`1999-03-31`, `1999-03-31T00:00:00Z`, `1999`).
pub fn year_from_date(value: &str) -> Option<i32> {
    let value = value.trim().trim_start_matches('+');
    let digits = value.get(..4)?;
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Rescales a rating to 0-10 with one decimal place.
pub fn normalize_rating(value: f64, scale_max: f64) -> Option<f64> {
    if !value.is_finite() || value < 0.0 || scale_max <= 0.0 {
        return None;
    }
    let scaled = (value / scale_max * 10.0).clamp(0.0, 10.0);
    Some((scaled * 10.0).round() / 10.0)
}

/// Drops markup from an HTML fragment and collapses whitespace.
pub fn strip_html(fragment: &str) -> String {
    let parsed = Html::parse_fragment(fragment);
    let text = parsed.root_element().text().collect::<Vec<_>>().join(" ");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

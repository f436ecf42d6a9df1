use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cinefold_core::{CrawlKey, Cursor, ExternalId, RecordDraft, SourceId};
use cinefold_storage::{FetchError, FetchRequest, HttpFetcher};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{
    normalize_rating, parse_items, parse_json, strip_html, text_or_none, year_from_date,
    AdapterContext, AdapterError, ErrorKind, ListPage, SourceAdapter,
};

pub const TVMAZE_API_BASE: &str = "https://api.tvmaze.com";
pub const TVMAZE_CATEGORIES: &[&str] = &["shows"];

#[derive(Debug, Clone, Deserialize)]
pub struct TvmazeShow {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub premiered: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub rating: Option<TvmazeRating>,
    #[serde(default)]
    pub image: Option<TvmazeImage>,
    #[serde(default)]
    pub externals: Option<TvmazeExternals>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TvmazeRating {
    #[serde(default)]
    pub average: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TvmazeImage {
    #[serde(default)]
    pub medium: Option<String>,
    #[serde(default)]
    pub original: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TvmazeExternals {
    #[serde(default)]
    pub imdb: Option<String>,
}

pub fn draft_from_show(
    key: &CrawlKey,
    show: &TvmazeShow,
    fetched_at: DateTime<Utc>,
) -> Option<RecordDraft> {
    let title = text_or_none(&show.name)?;
    let mut draft = RecordDraft::new(key.clone(), fetched_at, title);
    draft
        .external_ids
        .push(ExternalId::new("tvmaze", show.id.to_string()));
    if let Some(imdb) = show
        .externals
        .as_ref()
        .and_then(|e| e.imdb.as_deref())
        .and_then(text_or_none)
    {
        draft.external_ids.push(ExternalId::imdb(imdb));
    }
    draft.year = show.premiered.as_deref().and_then(year_from_date);
    draft.overview = show
        .summary
        .as_deref()
        .map(strip_html)
        .and_then(|s| text_or_none(&s));
    draft.poster_url = show
        .image
        .as_ref()
        .and_then(|img| img.original.as_deref().or(img.medium.as_deref()))
        .and_then(text_or_none);
    draft.rating = show
        .rating
        .as_ref()
        .and_then(|r| r.average)
        .and_then(|avg| normalize_rating(avg, 10.0));
    draft.genres = show.genres.iter().filter_map(|g| text_or_none(g)).collect();
    Some(draft)
}

/// The public show index. Pages start at 0 and a 404 marks the end.
#[derive(Debug, Clone)]
pub struct TvmazeAdapter {
    base_url: String,
}

impl Default for TvmazeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl TvmazeAdapter {
    pub fn new() -> Self {
        Self {
            base_url: TVMAZE_API_BASE.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

/// The page before an empty or missing one; the tail page keeps filling up.
fn last_filled_page(empty_page: u32) -> Cursor {
    Cursor::Page(empty_page.saturating_sub(1))
}

#[async_trait]
impl SourceAdapter for TvmazeAdapter {
    fn source_id(&self) -> SourceId {
        SourceId::Tvmaze
    }

    fn categories(&self) -> &'static [&'static str] {
        TVMAZE_CATEGORIES
    }

    /// The index only grows at the tail. An exhausted crawl is saved at the
    /// last page that held shows, so resuming there picks up shows added to it.
    fn rollover_cursor(&self, exhausted_at: &Cursor) -> Cursor {
        exhausted_at.clone()
    }

    async fn list_page(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        category: &str,
        cursor: &Cursor,
    ) -> Result<ListPage, AdapterError> {
        let key = CrawlKey::new(SourceId::Tvmaze, category);
        if !self.supports(category) {
            return Err(AdapterError::new(&key, ErrorKind::Fatal, "unknown tvmaze category"));
        }
        let Some(page) = cursor.page_number(0) else {
            return Err(AdapterError::new(
                &key,
                ErrorKind::Fatal,
                format!("tvmaze cursors are page numbers, got {cursor}"),
            ));
        };

        let request = FetchRequest::get(format!("{}/shows", self.base_url))
            .query("page", page)
            .header("Accept", "application/json");
        let response = match http
            .fetch_bytes(ctx.run_id, SourceId::Tvmaze.as_str(), &request)
            .await
        {
            Ok(response) => response,
            Err(FetchError::HttpStatus { status: 404, .. }) => {
                debug!(crawl_key = %key, page, "past the last tvmaze page");
                return Ok(ListPage::end(last_filled_page(page)));
            }
            Err(err) => return Err(AdapterError::from_fetch(&key, err)),
        };

        let raw: Vec<JsonValue> = parse_json(&key, &response.body)?;
        let has_more = !raw.is_empty();
        let mut dropped = Vec::new();
        let shows: Vec<TvmazeShow> = parse_items(&key, raw, &mut dropped);
        let mut drafts = Vec::with_capacity(shows.len());
        for show in &shows {
            match draft_from_show(&key, show, ctx.fetched_at) {
                Some(draft) => drafts.push(draft),
                None => dropped.push(format!("tvmaze id {}: empty name", show.id)),
            }
        }

        Ok(ListPage {
            drafts,
            next_cursor: if has_more {
                Cursor::Page(page + 1)
            } else {
                last_filled_page(page)
            },
            has_more,
            dropped,
        })
    }
}

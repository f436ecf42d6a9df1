//! TMDb catalog adapter: paginated list endpoints plus per-title lookups.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cinefold_core::{
    CrawlKey, Cursor, ExternalId, Provider, ProviderKind, RecordDraft, SourceId, Trailer,
};
use cinefold_storage::{FetchRequest, HttpFetcher};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::{
    normalize_rating, parse_items, parse_json, text_or_none, year_from_date, AdapterContext,
    AdapterError, ErrorKind, ListPage, SourceAdapter,
};

pub const TMDB_API_BASE: &str = "https://api.themoviedb.org/3";
pub const TMDB_IMAGE_BASE: &str = "https://image.tmdb.org/t/p/w500";

/// TMDb refuses pages past 500 regardless of `total_pages`.
const TMDB_MAX_PAGE: u32 = 500;
const CAST_LIMIT: usize = 10;

pub const TMDB_CATEGORIES: &[&str] = &[
    "movie/trending",
    "movie/popular",
    "movie/top_rated",
    "movie/now_playing",
    "movie/upcoming",
    "tv/trending",
    "tv/popular",
    "tv/top_rated",
    "tv/on_the_air",
    "tv/airing_today",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Movie,
    Tv,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Movie => "movie",
            MediaKind::Tv => "tv",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn endpoint_for(category: &str) -> Option<(MediaKind, String)> {
    if !TMDB_CATEGORIES.contains(&category) {
        return None;
    }
    let (media, list) = category.split_once('/')?;
    let media = match media {
        "movie" => MediaKind::Movie,
        "tv" => MediaKind::Tv,
        _ => return None,
    };
    let path = if list == "trending" {
        format!("/trending/{media}/week")
    } else {
        format!("/{media}/{list}")
    };
    Some((media, path))
}

/// Static TMDb genre table, used when the details lookup is unavailable.
pub fn tmdb_genre_name(id: u32) -> Option<&'static str> {
    let name = match id {
        28 => "Action",
        12 => "Adventure",
        16 => "Animation",
        35 => "Comedy",
        80 => "Crime",
        99 => "Documentary",
        18 => "Drama",
        10751 => "Family",
        14 => "Fantasy",
        36 => "History",
        27 => "Horror",
        10402 => "Music",
        9648 => "Mystery",
        10749 => "Romance",
        878 => "Science Fiction",
        10770 => "TV Movie",
        53 => "Thriller",
        10752 => "War",
        37 => "Western",
        10759 => "Action & Adventure",
        10762 => "Kids",
        10763 => "News",
        10764 => "Reality",
        10765 => "Sci-Fi & Fantasy",
        10766 => "Soap",
        10767 => "Talk",
        10768 => "War & Politics",
        _ => return None,
    };
    Some(name)
}

#[derive(Debug, Deserialize)]
struct TmdbListEnvelope {
    page: u32,
    #[serde(default)]
    results: Vec<JsonValue>,
    #[serde(default)]
    total_pages: u32,
}

/// One entry of a movie or tv list response.
#[derive(Debug, Clone, Deserialize)]
pub struct TmdbListItem {
    pub id: u64,
    #[serde(alias = "name")]
    pub title: String,
    #[serde(default, alias = "first_air_date")]
    pub release_date: Option<String>,
    #[serde(default)]
    pub overview: Option<String>,
    #[serde(default)]
    pub poster_path: Option<String>,
    #[serde(default)]
    pub vote_average: Option<f64>,
    #[serde(default)]
    pub vote_count: Option<u64>,
    #[serde(default)]
    pub genre_ids: Vec<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct TmdbDetails {
    #[serde(default)]
    genres: Vec<TmdbGenre>,
    #[serde(default)]
    imdb_id: Option<String>,
    #[serde(default)]
    external_ids: Option<TmdbExternalIds>,
    #[serde(default)]
    credits: Option<TmdbCredits>,
    #[serde(default)]
    videos: Option<TmdbVideos>,
    #[serde(default)]
    budget: Option<u64>,
    #[serde(default)]
    revenue: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TmdbGenre {
    name: String,
}

#[derive(Debug, Deserialize)]
struct TmdbExternalIds {
    #[serde(default)]
    imdb_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TmdbCredits {
    #[serde(default)]
    cast: Vec<TmdbCastMember>,
    #[serde(default)]
    crew: Vec<TmdbCrewMember>,
}

#[derive(Debug, Deserialize)]
struct TmdbCastMember {
    name: String,
    #[serde(default)]
    order: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct TmdbCrewMember {
    name: String,
    #[serde(default)]
    job: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TmdbVideos {
    #[serde(default)]
    results: Vec<TmdbVideo>,
}

#[derive(Debug, Deserialize)]
struct TmdbVideo {
    key: String,
    site: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    official: bool,
}

#[derive(Debug, Deserialize)]
struct TmdbWatchProviders {
    #[serde(default)]
    results: BTreeMap<String, TmdbRegionProviders>,
}

#[derive(Debug, Default, Deserialize)]
struct TmdbRegionProviders {
    #[serde(default)]
    flatrate: Vec<TmdbProvider>,
    #[serde(default)]
    rent: Vec<TmdbProvider>,
    #[serde(default)]
    buy: Vec<TmdbProvider>,
    #[serde(default)]
    free: Vec<TmdbProvider>,
    #[serde(default)]
    ads: Vec<TmdbProvider>,
}

#[derive(Debug, Deserialize)]
struct TmdbProvider {
    provider_name: String,
}

/// Maps a list item to a candidate; `None` when the item has no usable title.
pub fn draft_from_list_item(
    key: &CrawlKey,
    media: MediaKind,
    item: &TmdbListItem,
    fetched_at: DateTime<Utc>,
    image_base: &str,
) -> Option<RecordDraft> {
    let title = text_or_none(&item.title)?;
    let mut draft = RecordDraft::new(key.clone(), fetched_at, title);
    draft
        .external_ids
        .push(ExternalId::new(format!("tmdb:{media}"), item.id.to_string()));
    draft.year = item.release_date.as_deref().and_then(year_from_date);
    draft.overview = item.overview.as_deref().and_then(text_or_none);
    draft.poster_url = item
        .poster_path
        .as_deref()
        .and_then(text_or_none)
        .map(|path| format!("{image_base}{path}"));
    draft.rating = match (item.vote_average, item.vote_count) {
        (_, Some(0)) => None,
        (Some(avg), _) => normalize_rating(avg, 10.0),
        _ => None,
    };
    draft.genres = item
        .genre_ids
        .iter()
        .filter_map(|id| tmdb_genre_name(*id))
        .map(ToString::to_string)
        .collect();
    Some(draft)
}

fn apply_details(draft: &mut RecordDraft, details: TmdbDetails) {
    if !details.genres.is_empty() {
        draft.genres = details
            .genres
            .into_iter()
            .filter_map(|g| text_or_none(&g.name))
            .collect();
    }

    let imdb = details
        .imdb_id
        .or_else(|| details.external_ids.and_then(|ids| ids.imdb_id))
        .and_then(|id| text_or_none(&id));
    if let Some(imdb) = imdb {
        if draft.imdb_id().is_none() {
            draft.external_ids.push(ExternalId::imdb(imdb));
        }
    }

    if let Some(mut credits) = details.credits {
        credits.cast.sort_by_key(|c| c.order.unwrap_or(u32::MAX));
        draft.cast = credits
            .cast
            .iter()
            .filter_map(|c| text_or_none(&c.name))
            .take(CAST_LIMIT)
            .collect();
        for member in &credits.crew {
            let Some(name) = text_or_none(&member.name) else {
                continue;
            };
            match member.job.as_deref() {
                Some("Director") => {
                    draft.directors.insert(name);
                }
                Some("Writer" | "Screenplay" | "Story") => {
                    draft.writers.insert(name);
                }
                _ => {}
            }
        }
    }

    draft.budget = details.budget.filter(|v| *v > 0);
    draft.revenue = details.revenue.filter(|v| *v > 0);

    if let Some(videos) = details.videos {
        draft.trailers = videos
            .results
            .into_iter()
            .filter(|v| v.site.eq_ignore_ascii_case("youtube"))
            .filter(|v| matches!(v.kind.as_deref(), Some("Trailer" | "Teaser")))
            .filter_map(|v| {
                text_or_none(&v.key).map(|key| Trailer {
                    url: format!("https://www.youtube.com/watch?v={key}"),
                    source: SourceId::Tmdb,
                    is_official: v.official,
                })
            })
            .collect();
    }
}

fn apply_providers(draft: &mut RecordDraft, providers: TmdbWatchProviders, regions: &[String]) {
    for region in regions {
        let Some(listing) = providers.results.get(region) else {
            continue;
        };
        let groups = [
            (ProviderKind::Flatrate, &listing.flatrate),
            (ProviderKind::Rent, &listing.rent),
            (ProviderKind::Buy, &listing.buy),
            (ProviderKind::Free, &listing.free),
            (ProviderKind::Ads, &listing.ads),
        ];
        for (kind, entries) in groups {
            for entry in entries {
                if let Some(provider_name) = text_or_none(&entry.provider_name) {
                    draft.providers.insert(Provider {
                        provider_name,
                        region: region.clone(),
                        kind,
                    });
                }
            }
        }
    }
}

pub struct TmdbAdapter {
    api_key: String,
    access_token: String,
    base_url: String,
    image_base: String,
    watch_regions: Vec<String>,
}

impl fmt::Debug for TmdbAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TmdbAdapter")
            .field("base_url", &self.base_url)
            .field("watch_regions", &self.watch_regions)
            .finish_non_exhaustive()
    }
}

impl TmdbAdapter {
    pub fn new(api_key: &str, access_token: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            access_token: access_token.to_string(),
            base_url: TMDB_API_BASE.to_string(),
            image_base: TMDB_IMAGE_BASE.to_string(),
            watch_regions: vec!["US".to_string()],
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_watch_regions(mut self, regions: Vec<String>) -> Self {
        self.watch_regions = regions;
        self
    }

    async fn lookup<T: DeserializeOwned>(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        key: &CrawlKey,
        request: FetchRequest,
    ) -> Result<T, AdapterError> {
        let response = http
            .fetch_bytes(ctx.run_id, SourceId::Tmdb.as_str(), &request)
            .await
            .map_err(|e| AdapterError::from_fetch(key, e))?;
        parse_json(key, &response.body)
    }

    /// Per-title details and watch providers. Credential rejection
    /// propagates; any other failure leaves the draft as the list saw it.
    async fn enrich(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        key: &CrawlKey,
        media: MediaKind,
        tmdb_id: u64,
        draft: &mut RecordDraft,
    ) -> Result<(), AdapterError> {
        let details_request = FetchRequest::get(format!("{}/{media}/{tmdb_id}", self.base_url))
            .query("append_to_response", "videos,credits,external_ids")
            .query("language", "en-US")
            .header("Accept", "application/json")
            .bearer_auth(&self.access_token);
        match self
            .lookup::<TmdbDetails>(http, ctx, key, details_request)
            .await
        {
            Ok(details) => apply_details(draft, details),
            Err(err) if err.kind == ErrorKind::Fatal => return Err(err),
            Err(err) => {
                warn!(crawl_key = %key, tmdb_id, error = %err, "details lookup failed; keeping list data");
            }
        }

        let providers_request =
            FetchRequest::get(format!("{}/{media}/{tmdb_id}/watch/providers", self.base_url))
                .header("Accept", "application/json")
                .bearer_auth(&self.access_token);
        match self
            .lookup::<TmdbWatchProviders>(http, ctx, key, providers_request)
            .await
        {
            Ok(providers) => apply_providers(draft, providers, &self.watch_regions),
            Err(err) if err.kind == ErrorKind::Fatal => return Err(err),
            Err(err) => {
                warn!(crawl_key = %key, tmdb_id, error = %err, "watch provider lookup failed");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SourceAdapter for TmdbAdapter {
    fn source_id(&self) -> SourceId {
        SourceId::Tmdb
    }

    fn categories(&self) -> &'static [&'static str] {
        TMDB_CATEGORIES
    }

    async fn list_page(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        category: &str,
        cursor: &Cursor,
    ) -> Result<ListPage, AdapterError> {
        let key = CrawlKey::new(SourceId::Tmdb, category);
        let Some((media, path)) = endpoint_for(category) else {
            return Err(AdapterError::new(&key, ErrorKind::Fatal, "unknown tmdb category"));
        };
        let Some(page) = cursor.page_number(1) else {
            return Err(AdapterError::new(
                &key,
                ErrorKind::Fatal,
                format!("tmdb cursors are page numbers, got {cursor}"),
            ));
        };
        if page > TMDB_MAX_PAGE {
            return Ok(ListPage::end(cursor.clone()));
        }

        let request = FetchRequest::get(format!("{}{path}", self.base_url))
            .query("api_key", &self.api_key)
            .query("language", "en-US")
            .query("page", page)
            .header("Accept", "application/json");
        let envelope: TmdbListEnvelope = self.lookup(http, ctx, &key, request).await?;
        if envelope.page != page {
            debug!(crawl_key = %key, requested = page, served = envelope.page, "tmdb served a different page");
        }

        let raw_count = envelope.results.len();
        let mut dropped = Vec::new();
        let items: Vec<TmdbListItem> = parse_items(&key, envelope.results, &mut dropped);

        let mut drafts = Vec::with_capacity(items.len());
        for item in &items {
            let Some(mut draft) =
                draft_from_list_item(&key, media, item, ctx.fetched_at, &self.image_base)
            else {
                dropped.push(format!("tmdb id {}: empty title", item.id));
                continue;
            };
            self.enrich(http, ctx, &key, media, item.id, &mut draft).await?;
            drafts.push(draft);
        }

        let last_page = envelope.total_pages.min(TMDB_MAX_PAGE);
        Ok(ListPage {
            drafts,
            next_cursor: Cursor::Page(page + 1),
            has_more: raw_count > 0 && page < last_page,
            dropped,
        })
    }
}

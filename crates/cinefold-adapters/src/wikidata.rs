use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cinefold_core::{CrawlKey, Cursor, ExternalId, RecordDraft, SourceId};
use cinefold_storage::{FetchRequest, HttpFetcher};
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::{
    parse_items, parse_json, text_or_none, year_from_date, AdapterContext, AdapterError, ErrorKind,
    ListPage, SourceAdapter,
};

pub const WIKIDATA_SPARQL_ENDPOINT: &str = "https://query.wikidata.org/sparql";
pub const WIKIDATA_CATEGORIES: &[&str] = &["films"];

const QUERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Films (Q11424) with English label, image, publication date and IMDb id.
pub fn films_query(limit: u32) -> String {
    format!(
        "SELECT ?movie ?movieLabel ?poster ?date ?imdb WHERE {{\n\
         \x20 ?movie wdt:P31 wd:Q11424.\n\
         \x20 OPTIONAL {{ ?movie wdt:P18 ?poster. }}\n\
         \x20 OPTIONAL {{ ?movie wdt:P577 ?date. }}\n\
         \x20 OPTIONAL {{ ?movie wdt:P345 ?imdb. }}\n\
         \x20 SERVICE wikibase:label {{ bd:serviceParam wikibase:language \"en\". }}\n\
         }} LIMIT {limit}"
    )
}

#[derive(Debug, Deserialize)]
struct SparqlResponse {
    results: SparqlResults,
}

#[derive(Debug, Deserialize)]
struct SparqlResults {
    #[serde(default)]
    bindings: Vec<JsonValue>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SparqlTerm {
    pub value: String,
}

/// One result row; a film with several dates or images spans several rows.
#[derive(Debug, Clone, Deserialize)]
pub struct FilmBinding {
    pub movie: SparqlTerm,
    #[serde(rename = "movieLabel", default)]
    pub movie_label: Option<SparqlTerm>,
    #[serde(default)]
    pub poster: Option<SparqlTerm>,
    #[serde(default)]
    pub date: Option<SparqlTerm>,
    #[serde(default)]
    pub imdb: Option<SparqlTerm>,
}

fn entity_id(uri: &str) -> &str {
    uri.rsplit('/').next().unwrap_or(uri)
}

fn is_bare_qid(label: &str) -> bool {
    label
        .strip_prefix('Q')
        .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
}

#[derive(Debug, Default)]
struct FilmRows {
    label: Option<String>,
    year: Option<i32>,
    poster: Option<String>,
    imdb: Option<String>,
}

/// Folds rows per entity in first-seen order. Films whose label never
/// resolved past the bare Q-id are reported in `dropped`.
pub fn drafts_from_bindings(
    key: &CrawlKey,
    bindings: &[FilmBinding],
    fetched_at: DateTime<Utc>,
    dropped: &mut Vec<String>,
) -> Vec<RecordDraft> {
    let mut order: Vec<String> = Vec::new();
    let mut films: HashMap<String, FilmRows> = HashMap::new();

    for row in bindings {
        let qid = entity_id(&row.movie.value).to_string();
        let film = films.entry(qid.clone()).or_insert_with(|| {
            order.push(qid);
            FilmRows::default()
        });
        if film.label.is_none() {
            film.label = row.movie_label.as_ref().and_then(|t| text_or_none(&t.value));
        }
        if let Some(year) = row.date.as_ref().and_then(|t| year_from_date(&t.value)) {
            film.year = Some(film.year.map_or(year, |y| y.min(year)));
        }
        if film.poster.is_none() {
            film.poster = row.poster.as_ref().and_then(|t| text_or_none(&t.value));
        }
        if film.imdb.is_none() {
            film.imdb = row
                .imdb
                .as_ref()
                .and_then(|t| text_or_none(&t.value))
                .filter(|id| id.starts_with("tt"));
        }
    }

    let mut drafts = Vec::with_capacity(order.len());
    for qid in order {
        let Some(film) = films.remove(&qid) else {
            continue;
        };
        let Some(label) = film.label.filter(|l| !is_bare_qid(l)) else {
            dropped.push(format!("{qid}: label unresolved"));
            continue;
        };
        let mut draft = RecordDraft::new(key.clone(), fetched_at, label);
        draft.external_ids.push(ExternalId::new("wikidata", qid));
        if let Some(imdb) = film.imdb {
            draft.external_ids.push(ExternalId::imdb(imdb));
        }
        draft.year = film.year;
        draft.poster_url = film.poster;
        drafts.push(draft);
    }
    drafts
}

/// A single bulk SPARQL query; there is no pagination to resume.
#[derive(Debug, Clone)]
pub struct WikidataAdapter {
    endpoint: String,
    limit: u32,
}

impl WikidataAdapter {
    pub fn new(limit: u32) -> Self {
        Self {
            endpoint: WIKIDATA_SPARQL_ENDPOINT.to_string(),
            limit,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl SourceAdapter for WikidataAdapter {
    fn source_id(&self) -> SourceId {
        SourceId::Wikidata
    }

    fn categories(&self) -> &'static [&'static str] {
        WIKIDATA_CATEGORIES
    }

    async fn list_page(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        category: &str,
        cursor: &Cursor,
    ) -> Result<ListPage, AdapterError> {
        let key = CrawlKey::new(SourceId::Wikidata, category);
        if !self.supports(category) {
            return Err(AdapterError::new(&key, ErrorKind::Fatal, "unknown wikidata category"));
        }

        let request = FetchRequest::get(&self.endpoint)
            .query("query", films_query(self.limit))
            .query("format", "json")
            .header("Accept", "application/sparql-results+json")
            .timeout(QUERY_TIMEOUT);
        let response = http
            .fetch_bytes(ctx.run_id, SourceId::Wikidata.as_str(), &request)
            .await
            .map_err(|e| AdapterError::from_fetch(&key, e))?;

        let envelope: SparqlResponse = parse_json(&key, &response.body)?;
        let mut dropped = Vec::new();
        let rows: Vec<FilmBinding> = parse_items(&key, envelope.results.bindings, &mut dropped);
        let drafts = drafts_from_bindings(&key, &rows, ctx.fetched_at, &mut dropped);

        Ok(ListPage {
            drafts,
            next_cursor: cursor.clone(),
            has_more: false,
            dropped,
        })
    }
}

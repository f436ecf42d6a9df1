use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use cinefold_core::{CanonicalRecord, CrawlKey, MoviesDocument, SourceId};
use cinefold_storage::{read_json_if_exists, write_json_atomic, StoredFile};
use serde_json::Value as JsonValue;

/// Builds the snapshot with per-source and per-TMDb-category counts.
pub fn assemble_document(
    developer: &JsonValue,
    records: Vec<CanonicalRecord>,
    completed_at: DateTime<Utc>,
) -> MoviesDocument {
    let mut breakdown: BTreeMap<String, usize> = BTreeMap::new();
    let mut tmdb_categories: BTreeMap<String, usize> = BTreeMap::new();
    let mut tmdb_tv_categories: BTreeMap<String, usize> = BTreeMap::new();

    for record in &records {
        for source in &record.sources {
            *breakdown.entry(source.as_str().to_string()).or_default() += 1;
        }
        for category in &record.category {
            let Ok(key) = category.parse::<CrawlKey>() else {
                continue;
            };
            if key.source != SourceId::Tmdb {
                continue;
            }
            if let Some(list) = key.category.strip_prefix("movie/") {
                *tmdb_categories.entry(list.to_string()).or_default() += 1;
            } else if let Some(list) = key.category.strip_prefix("tv/") {
                *tmdb_tv_categories.entry(list.to_string()).or_default() += 1;
            }
        }
    }

    MoviesDocument {
        developer: developer.clone(),
        last_updated: completed_at,
        total_entries: records.len(),
        breakdown,
        tmdb_categories,
        tmdb_tv_categories,
        movies: records,
    }
}

/// The published `movies.json`, reloaded at the start of every run.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    path: PathBuf,
}

impl DocumentStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> anyhow::Result<Option<MoviesDocument>> {
        read_json_if_exists(&self.path)
            .await
            .with_context(|| format!("loading previous document {}", self.path.display()))
    }

    pub async fn save(&self, document: &MoviesDocument) -> anyhow::Result<StoredFile> {
        write_json_atomic(&self.path, document).await
    }
}

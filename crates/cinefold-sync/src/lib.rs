//! Run orchestration: configuration, source registry and the crawl-and-merge pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use cinefold_adapters::{
    adapter_for_source, AdapterContext, AdapterError, AdapterSettings, ErrorKind, ListPage,
    SourceAdapter,
};
use cinefold_core::{CrawlKey, Cursor, SourceId};
use cinefold_storage::{BackoffPolicy, CheckpointStore, HttpClientConfig, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod document;
pub mod merge;

pub use document::{assemble_document, DocumentStore};
pub use merge::{
    identity_key, normalize_title, reduce_categories, reduce_rating, reduce_scalar, reduce_set,
    reduce_trailers, title_key, MergeOutcome, RecordSet, MAX_TRAILERS,
};

pub const CRATE_NAME: &str = "cinefold-sync";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required credential {0} is missing or empty")]
    MissingCredential(&'static str),
    #[error("{name} must be {expected}, got {value:?}")]
    Invalid {
        name: &'static str,
        value: String,
        expected: &'static str,
    },
    #[error("reading source registry {path}: {message}")]
    Registry { path: String, message: String },
    #[error("source {source_id} has no category {category:?}")]
    UnknownCategory { source_id: SourceId, category: String },
}

#[derive(Clone)]
pub struct SyncConfig {
    pub tmdb_api_key: String,
    pub tmdb_access_token: String,
    pub pages_per_category: u32,
    pub sleep_ms: u64,
    pub category_workers: usize,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub run_deadline: Option<Duration>,
    pub cursor_rollover: chrono::Duration,
    pub watch_regions: Vec<String>,
    pub wikidata_limit: u32,
    pub user_agent: String,
    pub output_path: PathBuf,
    pub checkpoint_path: PathBuf,
    pub registry_path: PathBuf,
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("tmdb_api_key", &"<redacted>")
            .field("tmdb_access_token", &"<redacted>")
            .field("pages_per_category", &self.pages_per_category)
            .field("sleep_ms", &self.sleep_ms)
            .field("category_workers", &self.category_workers)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("http_max_retries", &self.http_max_retries)
            .field("run_deadline", &self.run_deadline)
            .field("cursor_rollover", &self.cursor_rollover)
            .field("watch_regions", &self.watch_regions)
            .field("wikidata_limit", &self.wikidata_limit)
            .field("user_agent", &self.user_agent)
            .field("output_path", &self.output_path)
            .field("checkpoint_path", &self.checkpoint_path)
            .field("registry_path", &self.registry_path)
            .finish()
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
    expected: &'static str,
) -> Result<T, ConfigError> {
    match lookup(name) {
        None => Ok(default),
        Some(value) if value.trim().is_empty() => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            name,
            value,
            expected,
        }),
    }
}

fn credential(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::MissingCredential(name))
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let path = |name: &str, default: &str| {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(default))
        };

        let category_workers: usize =
            parse_var(&lookup, "CATEGORY_WORKERS", 2, "a positive integer")?;
        if category_workers == 0 {
            return Err(ConfigError::Invalid {
                name: "CATEGORY_WORKERS",
                value: "0".to_string(),
                expected: "a positive integer",
            });
        }
        let run_deadline = match lookup("RUN_DEADLINE_SECS").filter(|v| !v.trim().is_empty()) {
            None => None,
            Some(value) => Some(Duration::from_secs(value.trim().parse().map_err(|_| {
                ConfigError::Invalid {
                    name: "RUN_DEADLINE_SECS",
                    value,
                    expected: "a number of seconds",
                }
            })?)),
        };
        let rollover_hours: i64 = parse_var(&lookup, "CURSOR_ROLLOVER_HOURS", 24, "hours")?;
        let cursor_rollover = chrono::Duration::try_hours(rollover_hours)
            .filter(|_| rollover_hours >= 0)
            .ok_or_else(|| ConfigError::Invalid {
                name: "CURSOR_ROLLOVER_HOURS",
                value: rollover_hours.to_string(),
                expected: "a non-negative number of hours",
            })?;
        let watch_regions: Vec<String> = lookup("WATCH_REGIONS")
            .unwrap_or_else(|| "US".to_string())
            .split(',')
            .map(|r| r.trim().to_ascii_uppercase())
            .filter(|r| !r.is_empty())
            .collect();

        Ok(Self {
            tmdb_api_key: credential(&lookup, "TMDB_API_KEY")?,
            tmdb_access_token: credential(&lookup, "TMDB_ACCESS_TOKEN")?,
            pages_per_category: parse_var(&lookup, "PAGES_PER_CATEGORY", 10, "a page count")?,
            sleep_ms: parse_var(&lookup, "SLEEP_MS", 200, "milliseconds")?,
            category_workers,
            http_timeout_secs: parse_var(&lookup, "HTTP_TIMEOUT_SECS", 30, "seconds")?,
            http_max_retries: parse_var(&lookup, "HTTP_MAX_RETRIES", 3, "a retry count")?,
            run_deadline,
            cursor_rollover,
            watch_regions: if watch_regions.is_empty() {
                vec!["US".to_string()]
            } else {
                watch_regions
            },
            wikidata_limit: parse_var(&lookup, "WIKIDATA_LIMIT", 20, "a row limit")?,
            user_agent: lookup("CINEFOLD_USER_AGENT")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| format!("cinefold/{}", env!("CARGO_PKG_VERSION"))),
            output_path: path("OUTPUT_PATH", "movies.json"),
            checkpoint_path: path("CHECKPOINT_PATH", "crawl_state.json"),
            registry_path: path("REGISTRY_PATH", "sources.yaml"),
        })
    }

    pub fn adapter_settings(&self) -> AdapterSettings {
        AdapterSettings {
            tmdb_api_key: self.tmdb_api_key.clone(),
            tmdb_access_token: self.tmdb_access_token.clone(),
            watch_regions: self.watch_regions.clone(),
            wikidata_limit: self.wikidata_limit,
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            min_request_interval: Duration::from_millis(self.sleep_ms),
            backoff: BackoffPolicy {
                max_retries: self.http_max_retries,
                ..BackoffPolicy::default()
            },
            ..HttpClientConfig::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    #[serde(default)]
    pub developer: JsonValue,
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: SourceId,
    #[serde(default)]
    pub display_name: Option<String>,
    pub enabled: bool,
    #[serde(default)]
    pub categories: Vec<String>,
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let registry_error = |message: String| ConfigError::Registry {
            path: path.display().to_string(),
            message,
        };
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| registry_error(e.to_string()))?;
        Self::from_yaml_str(&text).map_err(|e| registry_error(e.to_string()))
    }

    /// Enabled crawl keys grouped by source, in merge order: source priority
    /// first, then the registry's category order.
    pub fn plan(
        &self,
        adapters: &BTreeMap<SourceId, Arc<dyn SourceAdapter>>,
    ) -> Result<Vec<(SourceId, Vec<CrawlKey>)>, ConfigError> {
        let mut plan = Vec::new();
        for source_id in SourceId::ALL {
            let Some(adapter) = adapters.get(&source_id) else {
                continue;
            };
            let mut keys: Vec<CrawlKey> = Vec::new();
            for source in self.sources.iter().filter(|s| s.enabled && s.source_id == source_id) {
                for category in &source.categories {
                    if !adapter.supports(category) {
                        return Err(ConfigError::UnknownCategory {
                            source_id,
                            category: category.clone(),
                        });
                    }
                    let key = CrawlKey::new(source_id, category.clone());
                    if !keys.contains(&key) {
                        keys.push(key);
                    }
                }
            }
            if !keys.is_empty() {
                plan.push((source_id, keys));
            }
        }
        Ok(plan)
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("run aborted: {0}")]
    Fatal(#[from] AdapterError),
    #[error("every attempted category failed ({})", .incomplete.join(", "))]
    AllSourcesUnavailable { incomplete: Vec<String> },
    #[error("{0:#}")]
    Storage(anyhow::Error),
}

impl From<anyhow::Error> for RunError {
    fn from(err: anyhow::Error) -> Self {
        RunError::Storage(err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CategoryOutcome {
    /// The source reported its last page.
    Exhausted,
    BudgetSpent,
    /// Already exhausted at run start; nothing fetched.
    Skipped,
    DeadlineReached,
    Failed { kind: String, message: String },
}

impl CategoryOutcome {
    pub fn is_incomplete(&self) -> bool {
        matches!(self, CategoryOutcome::DeadlineReached | CategoryOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryReport {
    pub crawl_key: String,
    pub start_cursor: Cursor,
    pub end_cursor: Cursor,
    pub pages: u32,
    pub items: usize,
    pub inserted: usize,
    pub merged: usize,
    pub changed: usize,
    pub dropped: usize,
    pub outcome: CategoryOutcome,
}

impl CategoryReport {
    fn new(key: &CrawlKey, start: Cursor, outcome: CategoryOutcome) -> Self {
        Self {
            crawl_key: key.to_string(),
            start_cursor: start.clone(),
            end_cursor: start,
            pages: 0,
            items: 0,
            inserted: 0,
            merged: 0,
            changed: 0,
            dropped: 0,
            outcome,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub categories: Vec<CategoryReport>,
    pub rolled_over: Vec<String>,
    pub incomplete: Vec<String>,
    pub total_before: usize,
    pub total_after: usize,
    pub document_path: String,
    pub document_sha256: String,
}

/// Shared stop signals for category workers: the run deadline and the abort flag.
#[derive(Debug, Default)]
pub struct RunControl {
    deadline: Option<Instant>,
    aborted: AtomicBool,
    fatal: Mutex<Option<AdapterError>>,
}

impl RunControl {
    pub fn new(deadline: Option<Instant>) -> Self {
        Self {
            deadline,
            ..Self::default()
        }
    }

    pub fn past_deadline(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Keeps the first fatal error; later ones are dropped.
    pub fn abort(&self, err: AdapterError) {
        let mut slot = self.fatal.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_none() {
            *slot = Some(err);
        }
        self.aborted.store(true, Ordering::SeqCst);
    }

    fn take_fatal(&self) -> Option<AdapterError> {
        self.fatal.lock().unwrap_or_else(|p| p.into_inner()).take()
    }
}

enum LaneEvent {
    Page(ListPage),
    Done(CategoryOutcome),
    Failed(AdapterError),
}

struct Lane {
    key: CrawlKey,
    rx: mpsc::UnboundedReceiver<LaneEvent>,
    report: CategoryReport,
}

struct CategoryJob {
    adapter: Arc<dyn SourceAdapter>,
    http: Arc<HttpFetcher>,
    ctx: AdapterContext,
    control: Arc<RunControl>,
    workers: Arc<Semaphore>,
    key: CrawlKey,
    cursor: Cursor,
    budget: u32,
    tx: mpsc::UnboundedSender<LaneEvent>,
}

impl CategoryJob {
    /// Fetches up to `budget` pages and hands each to the merge loop.
    async fn run(self) {
        let Ok(_permit) = self.workers.clone().acquire_owned().await else {
            return;
        };
        let mut cursor = self.cursor.clone();
        let mut fetched = 0u32;
        let outcome = loop {
            if self.control.is_aborted() {
                return;
            }
            if fetched >= self.budget {
                break CategoryOutcome::BudgetSpent;
            }
            if self.control.past_deadline() {
                break CategoryOutcome::DeadlineReached;
            }
            match self
                .adapter
                .list_page(&self.http, &self.ctx, &self.key.category, &cursor)
                .await
            {
                Ok(page) => {
                    fetched += 1;
                    let has_more = page.has_more;
                    cursor = page.next_cursor.clone();
                    debug!(crawl_key = %self.key, drafts = page.drafts.len(), has_more, "page fetched");
                    if self.tx.send(LaneEvent::Page(page)).is_err() {
                        return;
                    }
                    if !has_more {
                        break CategoryOutcome::Exhausted;
                    }
                }
                Err(err) => {
                    if err.kind == ErrorKind::Fatal {
                        self.control.abort(AdapterError::new(&self.key, err.kind, err.message.clone()));
                    }
                    let _ = self.tx.send(LaneEvent::Failed(err));
                    return;
                }
            }
        };
        let _ = self.tx.send(LaneEvent::Done(outcome));
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    registry: SourceRegistry,
    http: Arc<HttpFetcher>,
    adapters: BTreeMap<SourceId, Arc<dyn SourceAdapter>>,
    checkpoints: CheckpointStore,
    documents: DocumentStore,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, registry: SourceRegistry) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(config.http_config()).context("building http client")?;
        let settings = config.adapter_settings();
        let adapters: BTreeMap<SourceId, Arc<dyn SourceAdapter>> = SourceId::ALL
            .into_iter()
            .map(|source| (source, Arc::from(adapter_for_source(source, &settings))))
            .collect();
        Ok(Self {
            checkpoints: CheckpointStore::new(config.checkpoint_path.clone()),
            documents: DocumentStore::new(config.output_path.clone()),
            config,
            registry,
            http: Arc::new(http),
            adapters,
        })
    }

    pub fn with_http(mut self, http: HttpFetcher) -> Self {
        self.http = Arc::new(http);
        self
    }

    /// Replaces the adapter registered for the adapter's source.
    pub fn with_adapter(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.adapters.insert(adapter.source_id(), adapter);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<RunSummary, RunError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<RunSummary, RunError> {
        let started_at = Utc::now();
        let plan = self.registry.plan(&self.adapters)?;

        let mut checkpoint = self.checkpoints.load().await?;
        let previous = self.documents.load().await?;
        let mut records = RecordSet::from_records(previous.map(|d| d.movies).unwrap_or_default());
        let total_before = records.len();

        let rolled_over = checkpoint.apply_rollover(
            started_at,
            self.config.cursor_rollover,
            |key, exhausted_at| {
                key.parse::<CrawlKey>()
                    .ok()
                    .and_then(|k| self.adapters.get(&k.source))
                    .map_or(Cursor::Start, |a| a.rollover_cursor(exhausted_at))
            },
        );
        for key in &rolled_over {
            info!(crawl_key = %key, "exhausted cursor rolled over");
        }

        let control = Arc::new(RunControl::new(
            self.config.run_deadline.map(|d| Instant::now() + d),
        ));
        let ctx = AdapterContext {
            run_id,
            fetched_at: started_at,
        };

        let mut tasks = JoinSet::new();
        let mut lanes: Vec<Lane> = Vec::new();
        let mut skipped: Vec<CategoryReport> = Vec::new();
        for (source_id, keys) in &plan {
            let Some(adapter) = self.adapters.get(source_id) else {
                continue;
            };
            let workers = Arc::new(Semaphore::new(self.config.category_workers));
            for key in keys {
                let cursor = checkpoint.get(key);
                if cursor.exhausted {
                    skipped.push(CategoryReport::new(key, cursor.next_cursor, CategoryOutcome::Skipped));
                    continue;
                }
                let (tx, rx) = mpsc::unbounded_channel();
                let job = CategoryJob {
                    adapter: adapter.clone(),
                    http: self.http.clone(),
                    ctx: ctx.clone(),
                    control: control.clone(),
                    workers: workers.clone(),
                    key: key.clone(),
                    cursor: cursor.next_cursor.clone(),
                    budget: self.config.pages_per_category,
                    tx,
                };
                tasks.spawn(job.run().instrument(info_span!("category", crawl_key = %key)));
                lanes.push(Lane {
                    key: key.clone(),
                    rx,
                    report: CategoryReport::new(
                        key,
                        cursor.next_cursor,
                        CategoryOutcome::Failed {
                            kind: "Transient".to_string(),
                            message: "category worker stopped unexpectedly".to_string(),
                        },
                    ),
                });
            }
        }

        let mut reports = Vec::with_capacity(lanes.len() + skipped.len());
        let mut pages_merged = 0u32;
        for mut lane in lanes {
            while let Some(event) = lane.rx.recv().await {
                if control.is_aborted() {
                    break;
                }
                match event {
                    LaneEvent::Page(page) => {
                        merge_page(&mut records, &mut lane.report, &page);
                        checkpoint.record_success(&lane.key, page.next_cursor.clone(), !page.has_more, Utc::now());
                        lane.report.end_cursor = page.next_cursor;
                        pages_merged += 1;
                    }
                    LaneEvent::Done(outcome) => lane.report.outcome = outcome,
                    LaneEvent::Failed(err) => {
                        warn!(crawl_key = %lane.key, kind = ?err.kind, error = %err, "category incomplete");
                        lane.report.outcome = CategoryOutcome::Failed {
                            kind: format!("{:?}", err.kind),
                            message: err.message,
                        };
                    }
                }
            }
            if control.is_aborted() {
                tasks.abort_all();
                let err = control.take_fatal().unwrap_or_else(|| {
                    AdapterError::new(&lane.key, ErrorKind::Fatal, "run aborted")
                });
                warn!(error = %err, "fatal source error; leaving document and checkpoint untouched");
                return Err(RunError::Fatal(err));
            }
            reports.push(lane.report);
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "category worker did not finish cleanly");
            }
        }

        let attempted: Vec<&CategoryReport> = reports
            .iter()
            .filter(|r| r.outcome != CategoryOutcome::DeadlineReached || r.pages > 0)
            .collect();
        let all_failed = !attempted.is_empty()
            && attempted
                .iter()
                .all(|r| matches!(r.outcome, CategoryOutcome::Failed { .. }));
        if all_failed && pages_merged == 0 {
            return Err(RunError::AllSourcesUnavailable {
                incomplete: attempted.iter().map(|r| r.crawl_key.clone()).collect(),
            });
        }

        reports.extend(skipped);
        let incomplete: Vec<String> = reports
            .iter()
            .filter(|r| r.outcome.is_incomplete())
            .map(|r| r.crawl_key.clone())
            .collect();

        let finished_at = Utc::now();
        let document = assemble_document(&self.registry.developer, records.into_records(), finished_at);
        let total_after = document.total_entries;
        let stored = self.documents.save(&document).await?;
        self.checkpoints.save(&checkpoint).await?;

        info!(
            total_before,
            total_after,
            pages_merged,
            incomplete = incomplete.len(),
            "run complete"
        );
        Ok(RunSummary {
            run_id,
            started_at,
            finished_at,
            categories: reports,
            rolled_over,
            incomplete,
            total_before,
            total_after,
            document_path: stored.path.display().to_string(),
            document_sha256: stored.sha256,
        })
    }
}

fn merge_page(records: &mut RecordSet, report: &mut CategoryReport, page: &ListPage) {
    report.pages += 1;
    report.items += page.drafts.len();
    report.dropped += page.dropped.len();
    for draft in &page.drafts {
        match records.merge(draft) {
            MergeOutcome::Inserted => report.inserted += 1,
            MergeOutcome::Merged { changed } => {
                report.merged += 1;
                if changed {
                    report.changed += 1;
                }
            }
        }
    }
}

pub async fn run_sync_once_from_env() -> anyhow::Result<RunSummary> {
    let config = SyncConfig::from_env()?;
    let registry = SourceRegistry::load(&config.registry_path).await?;
    let pipeline = SyncPipeline::new(config, registry)?;
    Ok(pipeline.run_once().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    const CREDS: [(&str, &str); 2] = [("TMDB_API_KEY", "k"), ("TMDB_ACCESS_TOKEN", "t")];

    #[test]
    fn config_defaults_apply() {
        let config = SyncConfig::from_lookup(lookup(&CREDS)).unwrap();
        assert_eq!(config.pages_per_category, 10);
        assert_eq!(config.sleep_ms, 200);
        assert_eq!(config.category_workers, 2);
        assert_eq!(config.run_deadline, None);
        assert_eq!(config.cursor_rollover, chrono::Duration::hours(24));
        assert_eq!(config.watch_regions, vec!["US".to_string()]);
        assert_eq!(config.output_path, PathBuf::from("movies.json"));
        assert_eq!(config.checkpoint_path, PathBuf::from("crawl_state.json"));
    }

    #[test]
    fn missing_credentials_are_rejected() {
        let err = SyncConfig::from_lookup(lookup(&[("TMDB_API_KEY", "k")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingCredential("TMDB_ACCESS_TOKEN")));
        let err = SyncConfig::from_lookup(lookup(&[("TMDB_API_KEY", " "), ("TMDB_ACCESS_TOKEN", "t")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingCredential("TMDB_API_KEY")));
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let mut pairs = CREDS.to_vec();
        pairs.push(("PAGES_PER_CATEGORY", "ten"));
        let err = SyncConfig::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "PAGES_PER_CATEGORY", .. }));

        let mut pairs = CREDS.to_vec();
        pairs.push(("CATEGORY_WORKERS", "0"));
        assert!(SyncConfig::from_lookup(lookup(&pairs)).is_err());

        for hours in ["9223372036854775807", "-1"] {
            let mut pairs = CREDS.to_vec();
            pairs.push(("CURSOR_ROLLOVER_HOURS", hours));
            let err = SyncConfig::from_lookup(lookup(&pairs)).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid { name: "CURSOR_ROLLOVER_HOURS", .. }));
        }
    }

    #[test]
    fn overrides_are_parsed() {
        let mut pairs = CREDS.to_vec();
        pairs.extend([
            ("PAGES_PER_CATEGORY", "1"),
            ("RUN_DEADLINE_SECS", "900"),
            ("WATCH_REGIONS", "us, gb"),
            ("OUTPUT_PATH", "/tmp/out/movies.json"),
        ]);
        let config = SyncConfig::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(config.pages_per_category, 1);
        assert_eq!(config.run_deadline, Some(Duration::from_secs(900)));
        assert_eq!(config.watch_regions, vec!["US".to_string(), "GB".to_string()]);
        assert_eq!(config.output_path, PathBuf::from("/tmp/out/movies.json"));
    }

    #[test]
    fn debug_never_prints_credentials() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("TMDB_API_KEY", "super-secret-key"),
            ("TMDB_ACCESS_TOKEN", "super-secret-token"),
        ]))
        .unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("super-secret"));
    }

    #[test]
    fn registry_plan_orders_by_source_priority() {
        let registry = SourceRegistry::from_yaml_str(
            r#"
developer:
  name: Cinefold
sources:
  - source_id: wikidata
    enabled: true
    categories: [films]
  - source_id: tvmaze
    enabled: false
    categories: [shows]
  - source_id: tmdb
    enabled: true
    categories: [tv/popular, movie/trending]
"#,
        )
        .unwrap();
        let settings = AdapterSettings {
            tmdb_api_key: "k".into(),
            tmdb_access_token: "t".into(),
            watch_regions: vec!["US".into()],
            wikidata_limit: 20,
        };
        let adapters: BTreeMap<SourceId, Arc<dyn SourceAdapter>> = SourceId::ALL
            .into_iter()
            .map(|s| (s, Arc::from(adapter_for_source(s, &settings))))
            .collect();

        let plan = registry.plan(&adapters).unwrap();
        let flat: Vec<String> = plan
            .iter()
            .flat_map(|(_, keys)| keys.iter().map(ToString::to_string))
            .collect();
        assert_eq!(flat, vec!["tmdb:tv/popular", "tmdb:movie/trending", "wikidata:films"]);
        assert_eq!(registry.developer["name"], "Cinefold");
    }

    #[test]
    fn registry_rejects_unknown_categories() {
        let registry = SourceRegistry::from_yaml_str(
            "sources:\n  - source_id: tmdb\n    enabled: true\n    categories: [movie/airing_today]\n",
        )
        .unwrap();
        let settings = AdapterSettings {
            tmdb_api_key: "k".into(),
            tmdb_access_token: "t".into(),
            watch_regions: vec![],
            wikidata_limit: 1,
        };
        let adapters: BTreeMap<SourceId, Arc<dyn SourceAdapter>> =
            BTreeMap::from([(SourceId::Tmdb, Arc::from(adapter_for_source(SourceId::Tmdb, &settings)))]);
        assert!(matches!(
            registry.plan(&adapters),
            Err(ConfigError::UnknownCategory { .. })
        ));
    }
}

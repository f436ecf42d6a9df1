//! Rate-limited HTTP fetching, atomic JSON files and the crawl checkpoint store.

use std::collections::HashMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use cinefold_core::CheckpointState;
use rand::Rng;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cinefold-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct StoredFile {
    pub path: PathBuf,
    pub sha256: String,
    pub byte_size: usize,
}

/// Replace `path` with `bytes` via a temp file in the same directory and a rename,
/// so readers see either the previous file or the complete new one.
pub async fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<StoredFile> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("writing temp file {}", temp_path.display()));
    }

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }

    Ok(StoredFile {
        path: path.to_path_buf(),
        sha256: sha256_hex(bytes),
        byte_size: bytes.len(),
    })
}

pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<StoredFile> {
    let mut bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing {}", path.display()))?;
    bytes.push(b'\n');
    write_bytes_atomic(path, &bytes).await
}

/// `Ok(None)` when the file does not exist; parse failures are errors.
pub async fn read_json_if_exists<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    };
    let value = serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(value))
}

/// Durable `"{source}:{category}"` -> cursor map, read once and written once per run.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> anyhow::Result<CheckpointState> {
        Ok(read_json_if_exists(&self.path).await?.unwrap_or_default())
    }

    pub async fn save(&self, state: &CheckpointState) -> anyhow::Result<StoredFile> {
        write_json_atomic(&self.path, state).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random jitter added to each wait.
    pub jitter: Duration,
    /// Total time a single request may spend waiting between attempts.
    pub max_elapsed: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter: Duration::from_millis(250),
            max_elapsed: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    Retry(Duration),
    GiveUp,
}

/// `Attempt -> Wait(backoff) -> Attempt -> ... -> GiveUp`, with no clock of its own.
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: BackoffPolicy,
    failures: usize,
    waited: Duration,
}

impl RetryState {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failures: 0,
            waited: Duration::ZERO,
        }
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn waited(&self) -> Duration {
        self.waited
    }

    pub fn on_failure(
        &mut self,
        disposition: RetryDisposition,
        retry_after: Option<Duration>,
        jitter: Duration,
    ) -> RetryStep {
        self.failures += 1;
        if disposition == RetryDisposition::NonRetryable || self.failures > self.policy.max_retries {
            return RetryStep::GiveUp;
        }

        let mut delay = self.policy.delay_for_attempt(self.failures - 1);
        if let Some(hint) = retry_after {
            delay = delay.max(hint.min(self.policy.max_delay));
        }
        let delay = delay + jitter;
        if self.waited + delay > self.policy.max_elapsed {
            return RetryStep::GiveUp;
        }
        self.waited += delay;
        RetryStep::Retry(delay)
    }
}

/// Injected time source for throttling and backoff waits.
#[async_trait]
pub trait Sleeper: Send + Sync + Debug {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Returns immediately and remembers every requested wait.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: std::sync::Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn slept(&self) -> Vec<Duration> {
        self.slept
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(duration);
    }
}

/// Minimum spacing between requests to one source, shared by all its callers.
#[derive(Debug)]
pub struct RequestGate {
    min_interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RequestGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(None),
        }
    }

    /// Reserves the next slot and waits for it. Returns the wait applied.
    pub async fn wait_turn(&self, sleeper: &dyn Sleeper) -> Duration {
        let wait = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(slot) if slot > now => slot,
                _ => now,
            };
            *next = Some(slot + self.min_interval);
            slot - now
        };
        if !wait.is_zero() {
            sleeper.sleep(wait).await;
        }
        wait
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub min_request_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 8,
            min_request_interval: Duration::from_millis(200),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// A GET request. Query values are never echoed into errors or logs.
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub bearer: Option<String>,
    pub timeout: Option<Duration>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn bearer_auth(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// Caller may skip this page and continue.
    Transient,
    /// Credentials rejected; the whole run must stop.
    Fatal,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request { url: String, source: reqwest::Error },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("http client is shutting down")]
    Closed,
}

impl FetchError {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            FetchError::HttpStatus { status: 401 | 403, .. } => FetchErrorKind::Fatal,
            _ => FetchErrorKind::Transient,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

struct AttemptFailure {
    error: FetchError,
    disposition: RetryDisposition,
    retry_after: Option<Duration>,
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    min_request_interval: Duration,
    gates: Mutex<HashMap<String, Arc<RequestGate>>>,
    backoff: BackoffPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            min_request_interval: config.min_request_interval,
            gates: Mutex::new(HashMap::new()),
            backoff: config.backoff,
            sleeper: Arc::new(TokioSleeper),
        })
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    async fn gate_for(&self, source_id: &str) -> Arc<RequestGate> {
        let mut gates = self.gates.lock().await;
        gates
            .entry(source_id.to_string())
            .or_insert_with(|| Arc::new(RequestGate::new(self.min_request_interval)))
            .clone()
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.backoff.jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        request: &FetchRequest,
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let gate = self.gate_for(source_id).await;

        let span = info_span!("http_fetch", %run_id, source_id, url = %request.url);
        async {
            let mut retry = RetryState::new(self.backoff);
            loop {
                gate.wait_turn(self.sleeper.as_ref()).await;
                let failure = match self.send_once(request).await {
                    Ok(response) => return Ok(response),
                    Err(failure) => failure,
                };
                match retry.on_failure(failure.disposition, failure.retry_after, self.jitter()) {
                    RetryStep::Retry(delay) => {
                        warn!(
                            attempt = retry.failures(),
                            delay_ms = delay.as_millis() as u64,
                            error = %failure.error,
                            "transient fetch failure; backing off"
                        );
                        self.sleeper.sleep(delay).await;
                    }
                    RetryStep::GiveUp => return Err(failure.error),
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn send_once(&self, request: &FetchRequest) -> Result<FetchedResponse, AttemptFailure> {
        let mut builder = self.client.get(&request.url).query(&request.query);
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let request_failure = |err: reqwest::Error| AttemptFailure {
            disposition: classify_reqwest_error(&err),
            retry_after: None,
            error: FetchError::Request {
                url: request.url.clone(),
                source: err.without_url(),
            },
        };

        let resp = builder.send().await.map_err(request_failure)?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if status.is_success() {
            let body = resp.bytes().await.map_err(|err| AttemptFailure {
                disposition: RetryDisposition::Retryable,
                retry_after: None,
                error: FetchError::Request {
                    url: request.url.clone(),
                    source: err.without_url(),
                },
            })?;
            return Ok(FetchedResponse {
                status,
                final_url,
                body: body.to_vec(),
            });
        }

        Err(AttemptFailure {
            disposition: classify_status(status),
            retry_after: parse_retry_after(resp.headers()),
            error: FetchError::HttpStatus {
                status: status.as_u16(),
                url: request.url.clone(),
            },
        })
    }
}

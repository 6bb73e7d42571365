//! Polling HTTP downloader + raw payload archive for dayfeed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use dayfeed_core::TargetWindow;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dayfeed-storage";

pub const DEFAULT_USER_AGENT: &str = "dayfeed/0.1 (daily CSV collector)";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 18;
pub const DEFAULT_MIN_BODY_BYTES: usize = 100;

#[derive(Debug, Clone)]
pub struct StoredPayload {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed archive of downloaded payloads.
#[derive(Debug, Clone)]
pub struct PayloadArchive {
    root: PathBuf,
}

impl PayloadArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn payload_relative_path(&self, feed: &str, window: &TargetWindow, content_hash: &str) -> PathBuf {
        PathBuf::from(feed)
            .join(window.compact())
            .join(format!("{content_hash}.csv"))
    }

    /// Write `bytes` under `<feed>/<YYYYMMDD>/<sha256>.csv` via temp file + rename.
    /// Identical payloads for the same date are stored once.
    pub async fn store_bytes(
        &self,
        feed: &str,
        window: &TargetWindow,
        bytes: &[u8],
    ) -> anyhow::Result<StoredPayload> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.payload_relative_path(feed, window, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let dir = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        let stored = |deduplicated| StoredPayload {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let exists = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking {}", absolute_path.display()))?;
        if exists {
            debug!(path = %absolute_path.display(), "payload already archived");
            return Ok(stored(true));
        }

        let temp_path = dir.join(format!(".{}.partial", Uuid::new_v4()));
        let write = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            fs::rename(&temp_path, &absolute_path).await
        };
        if let Err(err) = write.await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| format!("archiving payload to {}", absolute_path.display()));
        }
        Ok(stored(false))
    }
}

/// One step of the retry lookup: failed attempts up to and including
/// `through_attempt` wait `delay` before the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryTier {
    pub through_attempt: u32,
    pub delay: Duration,
}

/// Fixed lookup from attempt number to the delay before the next attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySchedule {
    pub max_attempts: u32,
    pub tiers: Vec<RetryTier>,
    pub final_delay: Duration,
}

const fn minutes(m: u64) -> Duration {
    Duration::from_secs(m * 60)
}

impl Default for RetrySchedule {
    fn default() -> Self {
        // The upstream file lands between 13:15 and 14:30 local time.
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            tiers: vec![
                RetryTier { through_attempt: 3, delay: minutes(5) },
                RetryTier { through_attempt: 6, delay: minutes(10) },
                RetryTier { through_attempt: 9, delay: minutes(15) },
                RetryTier { through_attempt: 12, delay: minutes(20) },
            ],
            final_delay: minutes(30),
        }
    }
}

impl RetrySchedule {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Delay after the failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.tiers
            .iter()
            .find(|tier| attempt <= tier.through_attempt)
            .map(|tier| tier.delay)
            .unwrap_or(self.final_delay)
    }

    /// Upper bound of time spent waiting when every attempt fails.
    pub fn total_wait(&self) -> Duration {
        (1..self.max_attempts.max(1)).map(|a| self.delay_after(a)).sum()
    }
}

/// Downloader progress. Transitions are pure so the schedule and termination
/// can be exercised without real time passing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Attempting(u32),
    Waiting { after_attempt: u32, delay: Duration },
    Succeeded { attempts: u32 },
    Exhausted { attempts: u32 },
}

impl DownloadState {
    pub fn initial() -> Self {
        DownloadState::Attempting(1)
    }

    pub fn on_attempt(self, succeeded: bool, schedule: &RetrySchedule) -> Self {
        match self {
            DownloadState::Attempting(n) if succeeded => DownloadState::Succeeded { attempts: n },
            DownloadState::Attempting(n) if n >= schedule.max_attempts.max(1) => {
                DownloadState::Exhausted { attempts: n }
            }
            DownloadState::Attempting(n) => DownloadState::Waiting {
                after_attempt: n,
                delay: schedule.delay_after(n),
            },
            other => other,
        }
    }

    pub fn on_wait_elapsed(self) -> Self {
        match self {
            DownloadState::Waiting { after_attempt, .. } => DownloadState::Attempting(after_attempt + 1),
            other => other,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadState::Succeeded { .. } | DownloadState::Exhausted { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection error: {0}")]
    Connect(String),
    #[error("request error: {0}")]
    Request(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Request(err.to_string())
        }
    }
}

/// A single GET against the upstream server.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str) -> Result<HttpReply, TransportError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .connect_timeout(config.timeout)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, url: &str) -> Result<HttpReply, TransportError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let body = resp.bytes().await?.to_vec();
        Ok(HttpReply {
            status,
            content_type,
            body,
        })
    }
}

/// Suspension between attempts.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Why one attempt did not produce a usable payload. All variants are retryable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttemptError {
    #[error("not yet published (404)")]
    NotYetPublished,
    #[error("unexpected http status {status}")]
    HttpStatus { status: u16 },
    #[error("body too small: {bytes} bytes (minimum {min})")]
    Undersized { bytes: usize, min: usize },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    MaxRetriesExceeded,
    Cancelled,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::MaxRetriesExceeded => write!(f, "max retries exceeded"),
            FailureReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("download failed ({reason}) after {attempts} attempt(s) in {elapsed:?}")]
pub struct TerminalFailure {
    pub reason: FailureReason,
    pub attempts: u32,
    pub elapsed: Duration,
    pub last_error: Option<AttemptError>,
}

/// A validated response body.
#[derive(Debug, Clone)]
pub struct Payload {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    pub attempts: u32,
    pub elapsed: Duration,
    pub fetched_at: DateTime<Utc>,
}

impl Payload {
    pub fn line_count(&self) -> usize {
        let trimmed = self
            .bytes
            .iter()
            .rposition(|b| !b.is_ascii_whitespace())
            .map(|end| &self.bytes[..=end])
            .unwrap_or(&[]);
        if trimmed.is_empty() {
            0
        } else {
            trimmed.iter().filter(|b| **b == b'\n').count() + 1
        }
    }
}

/// Retrieves a payload that appears at an unknown time inside a bounded
/// publication window. One request in flight at a time.
pub struct PollingDownloader {
    transport: Arc<dyn Transport>,
    sleeper: Arc<dyn Sleeper>,
    schedule: RetrySchedule,
    min_body_bytes: usize,
}

impl PollingDownloader {
    pub fn new(transport: Arc<dyn Transport>, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            transport,
            sleeper,
            schedule: RetrySchedule::default(),
            min_body_bytes: DEFAULT_MIN_BODY_BYTES,
        }
    }

    pub fn from_http_config(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::new(config)?;
        Ok(Self::new(Arc::new(transport), Arc::new(TokioSleeper)))
    }

    pub fn with_schedule(mut self, schedule: RetrySchedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_min_body_bytes(mut self, min_body_bytes: usize) -> Self {
        self.min_body_bytes = min_body_bytes;
        self
    }

    pub fn schedule(&self) -> &RetrySchedule {
        &self.schedule
    }

    /// Validate one reply: 200 with a plausible body is a payload, everything
    /// else is a retryable attempt error.
    pub fn validate(&self, reply: HttpReply) -> Result<HttpReply, AttemptError> {
        match reply.status {
            200 => {}
            404 => return Err(AttemptError::NotYetPublished),
            status => return Err(AttemptError::HttpStatus { status }),
        }

        let content_type = reply.content_type.as_deref().unwrap_or("").to_ascii_lowercase();
        if !content_type.contains("csv") && !content_type.contains("text") {
            warn!(content_type = %content_type, "unexpected content-type");
        }

        if reply.body.len() < self.min_body_bytes {
            return Err(AttemptError::Undersized {
                bytes: reply.body.len(),
                min: self.min_body_bytes,
            });
        }
        Ok(reply)
    }

    /// One GET + validation, no retry.
    pub async fn fetch_once(&self, url: &str) -> Result<Payload, AttemptError> {
        let started = Instant::now();
        let reply = self.transport.get(url).await?;
        let reply = self.validate(reply)?;
        Ok(Payload {
            bytes: reply.body,
            content_type: reply.content_type,
            attempts: 1,
            elapsed: started.elapsed(),
            fetched_at: Utc::now(),
        })
    }

    pub async fn download(&self, url: &str, cancel: &CancellationToken) -> Result<Payload, TerminalFailure> {
        let started = Instant::now();
        let max_attempts = self.schedule.max_attempts.max(1);
        info!(url, max_attempts, "starting download");

        let mut state = DownloadState::initial();
        let mut last_error: Option<AttemptError> = None;

        loop {
            match state {
                DownloadState::Attempting(attempt) => {
                    let span = info_span!("http_attempt", attempt, url);
                    let result = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            return Err(self.failure(FailureReason::Cancelled, attempt - 1, started, last_error));
                        }
                        result = self.transport.get(url).instrument(span) => result,
                    };

                    match result.map_err(AttemptError::from).and_then(|r| self.validate(r)) {
                        Ok(reply) => return Ok(self.accept(reply, attempt, started)),
                        Err(err) => {
                            match &err {
                                AttemptError::NotYetPublished => {
                                    info!(attempt, max_attempts, "file not yet published (404)")
                                }
                                other => warn!(attempt, max_attempts, error = %other, "attempt failed"),
                            }
                            last_error = Some(err);
                            state = state.on_attempt(false, &self.schedule);
                        }
                    }
                }
                DownloadState::Waiting { after_attempt, delay } => {
                    let next_at = Local::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                    info!(
                        after_attempt,
                        delay_minutes = delay.as_secs_f64() / 60.0,
                        next_attempt_at = %next_at.format("%H:%M:%S"),
                        "waiting before next attempt"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            return Err(self.failure(FailureReason::Cancelled, after_attempt, started, last_error));
                        }
                        _ = self.sleeper.sleep(delay) => {}
                    }
                    state = state.on_wait_elapsed();
                }
                DownloadState::Succeeded { .. } => {
                    unreachable!("accepted replies return from the attempt that fetched them")
                }
                DownloadState::Exhausted { attempts } => {
                    let failure = self.failure(FailureReason::MaxRetriesExceeded, attempts, started, last_error);
                    warn!(
                        attempts,
                        elapsed_hours = failure.elapsed.as_secs_f64() / 3600.0,
                        "giving up; the file may still be published later"
                    );
                    return Err(failure);
                }
            }
        }
    }

    fn accept(&self, reply: HttpReply, attempts: u32, started: Instant) -> Payload {
        let payload = Payload {
            bytes: reply.body,
            content_type: reply.content_type,
            attempts,
            elapsed: started.elapsed(),
            fetched_at: Utc::now(),
        };
        info!(
            bytes = payload.bytes.len(),
            lines = payload.line_count(),
            attempts,
            elapsed_minutes = payload.elapsed.as_secs_f64() / 60.0,
            "download complete"
        );
        payload
    }

    fn failure(
        &self,
        reason: FailureReason,
        attempts: u32,
        started: Instant,
        last_error: Option<AttemptError>,
    ) -> TerminalFailure {
        TerminalFailure {
            reason,
            attempts,
            elapsed: started.elapsed(),
            last_error,
        }
    }
}

/// Replays a fixed list of replies; 404 once the script runs out.
#[cfg(any(test, feature = "testing"))]
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    replies: std::sync::Mutex<std::collections::VecDeque<Result<HttpReply, TransportError>>>,
    calls: std::sync::atomic::AtomicU32,
}

#[cfg(any(test, feature = "testing"))]
impl ScriptedTransport {
    pub fn new(replies: impl IntoIterator<Item = Result<HttpReply, TransportError>>) -> Self {
        Self {
            replies: std::sync::Mutex::new(replies.into_iter().collect()),
            calls: std::sync::atomic::AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(any(test, feature = "testing"))]
#[async_trait]
impl Transport for ScriptedTransport {
    async fn get(&self, _url: &str) -> Result<HttpReply, TransportError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let next = self
            .replies
            .lock()
            .map(|mut q| q.pop_front())
            .unwrap_or(None);
        next.unwrap_or(Ok(HttpReply {
            status: 404,
            content_type: None,
            body: Vec::new(),
        }))
    }
}

/// Records requested delays without waiting.
#[cfg(any(test, feature = "testing"))]
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: std::sync::Mutex<Vec<Duration>>,
}

#[cfg(any(test, feature = "testing"))]
impl RecordingSleeper {
    pub fn slept(&self) -> Vec<Duration> {
        self.slept.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

#[cfg(any(test, feature = "testing"))]
#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut slept) = self.slept.lock() {
            slept.push(duration);
        }
    }
}

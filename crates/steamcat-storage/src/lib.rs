//! CSV checkpoint storage, request pacing + HTTP fetch utilities for steamcat.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use steamcat_core::CheckpointRecord;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "steamcat-storage";

/// Persisted record set that a batch run resumes from and flushes into.
#[async_trait]
pub trait CheckpointStore<R: CheckpointRecord>: Send + Sync {
    /// `Ok(None)` when no checkpoint exists yet, or the file holds no header.
    async fn load(&self) -> anyhow::Result<Option<Vec<R>>>;

    /// Replace the stored set with `records`.
    async fn save(&self, records: &[R]) -> anyhow::Result<()>;

    fn location(&self) -> String;
}

#[derive(Debug, Error)]
#[error("checkpoint {path} has columns [{found}], expected [{expected}]")]
pub struct SchemaMismatch {
    pub path: String,
    pub expected: String,
    pub found: String,
}

/// Tabular checkpoint: one header row with the record's columns, one row per record.
#[derive(Debug, Clone)]
pub struct CsvCheckpoint {
    path: PathBuf,
}

impl CsvCheckpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> anyhow::Result<PathBuf> {
        let file_name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("checkpoint path {} has no file name", self.path.display()))?;
        let parent = self.path.parent().unwrap_or_else(|| Path::new(""));
        Ok(parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4())))
    }

    fn encode_rows<R: CheckpointRecord>(&self, records: &[R]) -> anyhow::Result<Vec<u8>> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        // Written by hand so that an empty set still carries its schema.
        writer
            .write_record(R::COLUMNS)
            .with_context(|| format!("encoding header for {}", self.path.display()))?;
        for record in records {
            writer
                .serialize(record)
                .with_context(|| format!("encoding row {} for {}", record.key(), self.path.display()))?;
        }
        writer
            .into_inner()
            .map_err(|err| err.into_error())
            .with_context(|| format!("flushing encoded rows for {}", self.path.display()))
    }

    fn decode_rows<R: CheckpointRecord>(&self, bytes: &[u8]) -> anyhow::Result<Option<Vec<R>>> {
        let mut reader = csv::Reader::from_reader(bytes);
        let headers = reader
            .headers()
            .with_context(|| format!("reading header of {}", self.path.display()))?
            .clone();

        if headers.is_empty() {
            return Ok(None);
        }
        if !headers.iter().eq(R::COLUMNS.iter().copied()) {
            return Err(SchemaMismatch {
                path: self.path.display().to_string(),
                expected: R::COLUMNS.join(", "),
                found: headers.iter().collect::<Vec<_>>().join(", "),
            }
            .into());
        }

        let mut records = Vec::new();
        for (index, row) in reader.deserialize::<R>().enumerate() {
            let record =
                row.with_context(|| format!("parsing row {} of {}", index + 1, self.path.display()))?;
            records.push(record);
        }
        Ok(Some(records))
    }
}

#[async_trait]
impl<R: CheckpointRecord> CheckpointStore<R> for CsvCheckpoint {
    async fn load(&self) -> anyhow::Result<Option<Vec<R>>> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading checkpoint {}", self.path.display()))
            }
        };
        self.decode_rows(&bytes)
    }

    /// Full rewrite through a temp file + rename so a crash never leaves a torn checkpoint.
    async fn save(&self, records: &[R]) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating checkpoint directory {}", parent.display()))?;
        }

        let bytes = self.encode_rows(records)?;
        let temp_path = self.temp_path()?;
        if let Err(err) = write_new_file(&temp_path, &bytes).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }

        match fs::rename(&temp_path, &self.path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp checkpoint {} -> {}",
                        temp_path.display(),
                        self.path.display()
                    )
                })
            }
        }
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

async fn write_new_file(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("opening temp checkpoint file {}", path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp checkpoint file {}", path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp checkpoint file {}", path.display()))?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Client-side pause applied after a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PacingPolicy {
    #[default]
    None,
    FixedDelay(Duration),
    TokenBucket(TokenBucketConfig),
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// A zero `refill_every` never blocks.
    pub async fn take(&self) {
        if self.refill_every.is_zero() {
            return;
        }
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every {
                let refills = elapsed.as_nanos() / self.refill_every.as_nanos();
                let refills = u32::try_from(refills).unwrap_or(u32::MAX);
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = if state.tokens == self.capacity {
                    Instant::now()
                } else {
                    state.last_refill + self.refill_every.saturating_mul(refills)
                };
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self
                .refill_every
                .saturating_sub(state.last_refill.elapsed())
                .max(Duration::from_micros(100));
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

/// Shared, cloneable executor for a [`PacingPolicy`]; clones share one bucket.
#[derive(Debug, Clone, Default)]
pub struct Pacer {
    policy: PacingPolicy,
    bucket: Option<Arc<SimpleTokenBucket>>,
}

impl Pacer {
    pub fn new(policy: PacingPolicy) -> Self {
        let bucket = match policy {
            PacingPolicy::TokenBucket(c) => {
                Some(Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)))
            }
            _ => None,
        };
        Self { policy, bucket }
    }

    pub fn policy(&self) -> PacingPolicy {
        self.policy
    }

    pub async fn pace(&self) {
        match self.policy {
            PacingPolicy::None => {}
            PacingPolicy::FixedDelay(delay) => tokio::time::sleep(delay).await,
            PacingPolicy::TokenBucket(_) => {
                if let Some(bucket) = &self.bucket {
                    bucket.take().await;
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed json from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
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
        Ok(Self { client })
    }

    /// GET `url` with `query` and decode a JSON body. Non-2xx statuses are errors.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let resp = self.client.get(url).query(query).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?;
            serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
                url: final_url,
                source,
            })
        }
        .instrument(span)
        .await
    }
}

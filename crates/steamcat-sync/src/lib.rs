//! Resumable batched fetch-and-checkpoint runs over a bounded worker pool.

use std::collections::HashSet;
use std::future::Future;
use std::hash::Hash;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use steamcat_adapters::{Lookup, SteamClient, SteamEndpoints, DEFAULT_STORE_BASE_URL};
use steamcat_core::CheckpointRecord;
use steamcat_storage::{CheckpointStore, CsvCheckpoint, HttpClientConfig, PacingPolicy};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "steamcat-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub store_base_url: String,
    pub language: String,
    pub country: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub detail_delay_ms: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            store_base_url: var("STEAMCAT_STORE_BASE_URL")
                .unwrap_or_else(|| DEFAULT_STORE_BASE_URL.to_string()),
            language: var("STEAMCAT_LANGUAGE").unwrap_or_else(|| "spanish".to_string()),
            country: var("STEAMCAT_COUNTRY").unwrap_or_else(|| "CL".to_string()),
            user_agent: var("STEAMCAT_USER_AGENT").unwrap_or_else(|| "steamcat/0.1".to_string()),
            http_timeout_secs: var("STEAMCAT_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            detail_delay_ms: var("STEAMCAT_DETAIL_DELAY_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1000),
        }
    }

    pub fn endpoints(&self) -> SteamEndpoints {
        SteamEndpoints {
            store_base_url: self.store_base_url.clone(),
            language: self.language.clone(),
            country: self.country.clone(),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    /// Pause after each details (or combined) lookup.
    pub fn detail_pacing(&self) -> PacingPolicy {
        if self.detail_delay_ms == 0 {
            PacingPolicy::None
        } else {
            PacingPolicy::FixedDelay(Duration::from_millis(self.detail_delay_ms))
        }
    }

    pub fn steam_client(&self) -> Result<Arc<SteamClient>> {
        Ok(Arc::new(SteamClient::new(
            self.endpoints(),
            self.http_client_config(),
        )?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Completions between checkpoint flushes.
    pub batch_size: usize,
    /// Maximum lookups in flight.
    pub workers: usize,
}

impl BatchConfig {
    pub const APP_IDS: Self = Self {
        batch_size: 50,
        workers: 10,
    };
    pub const REVIEWS: Self = Self {
        batch_size: 100,
        workers: 10,
    };
    pub const DETAILS: Self = Self {
        batch_size: 100,
        workers: 2,
    };
    pub const FULL: Self = Self {
        batch_size: 100,
        workers: 2,
    };
}

/// Runs a task over a stream of items with at most `size` in flight; outputs
/// arrive in completion order.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self { size: size.max(1) }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// `task` is only called once a slot is free.
    pub fn completions<I, F, Fut>(&self, items: I, task: F) -> impl Stream<Item = Fut::Output>
    where
        I: IntoIterator,
        F: FnMut(I::Item) -> Fut,
        Fut: Future,
    {
        stream::iter(items).map(task).buffer_unordered(self.size)
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("no fetch function supplied to the batch runner")]
    MissingFetcher,
    #[error("no checkpoint output supplied to the batch runner")]
    MissingOutput,
    #[error("batch size must be at least 1")]
    ZeroBatchSize,
    #[error("worker count must be at least 1")]
    ZeroWorkers,
    #[error("lookup task failed: {0}")]
    LookupTask(#[from] tokio::task::JoinError),
    #[error("checkpoint {location}: {error:#}")]
    Checkpoint {
        location: String,
        error: anyhow::Error,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub lookup: String,
    pub checkpoint: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub existing_rows: usize,
    pub pending: usize,
    pub fetched: usize,
    pub flushes: usize,
    pub total_rows: usize,
}

#[derive(Debug, Clone)]
pub struct RunOutcome<R> {
    pub summary: RunSummary,
    pub records: Vec<R>,
}

type Key<L> = <<L as Lookup>::Record as CheckpointRecord>::Key;

pub struct RunnerBuilder<L: Lookup> {
    fetcher: Option<Arc<L>>,
    store: Option<Box<dyn CheckpointStore<L::Record>>>,
    config: BatchConfig,
}

impl<L: Lookup> RunnerBuilder<L> {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            fetcher: None,
            store: None,
            config,
        }
    }

    pub fn fetcher(mut self, fetcher: Arc<L>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Checkpoint to a CSV file at `path`.
    pub fn output(self, path: impl Into<PathBuf>) -> Self {
        self.store(Box::new(CsvCheckpoint::new(path)))
    }

    pub fn store(mut self, store: Box<dyn CheckpointStore<L::Record>>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<ResumableRunner<L>, RunnerError> {
        let fetcher = self.fetcher.ok_or(RunnerError::MissingFetcher)?;
        let store = self.store.ok_or(RunnerError::MissingOutput)?;
        if self.config.batch_size == 0 {
            return Err(RunnerError::ZeroBatchSize);
        }
        if self.config.workers == 0 {
            return Err(RunnerError::ZeroWorkers);
        }
        Ok(ResumableRunner {
            fetcher,
            store,
            config: self.config,
        })
    }
}

/// Fetches every id not yet in the checkpoint, flushing the full accumulated
/// set every `batch_size` completions and once more after the last one.
pub struct ResumableRunner<L: Lookup> {
    fetcher: Arc<L>,
    store: Box<dyn CheckpointStore<L::Record>>,
    config: BatchConfig,
}

impl<L: Lookup + 'static> ResumableRunner<L> {
    pub fn builder(config: BatchConfig) -> RunnerBuilder<L> {
        RunnerBuilder::new(config)
    }

    pub fn config(&self) -> BatchConfig {
        self.config
    }

    fn checkpoint_error(&self, error: anyhow::Error) -> RunnerError {
        RunnerError::Checkpoint {
            location: self.store.location(),
            error,
        }
    }

    pub async fn run(
        &self,
        ids: impl IntoIterator<Item = Key<L>>,
    ) -> Result<RunOutcome<L::Record>, RunnerError> {
        let run_id = Uuid::new_v4();
        let location = self.store.location();
        let span = info_span!(
            "batch_run",
            %run_id,
            lookup = self.fetcher.name(),
            checkpoint = %location
        );
        self.run_inner(run_id, ids).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        ids: impl IntoIterator<Item = Key<L>>,
    ) -> Result<RunOutcome<L::Record>, RunnerError> {
        let started_at = Utc::now();
        let loaded = self
            .store
            .load()
            .await
            .map_err(|e| self.checkpoint_error(e))?;
        let file_existed = loaded.is_some();
        let mut accumulated = dedup_by_key(loaded.unwrap_or_default());
        let existing_rows = accumulated.len();
        if file_existed {
            info!(existing_rows, "resuming from checkpoint");
        }

        let processed: HashSet<Key<L>> = accumulated.iter().map(|r| r.key()).collect();
        let pending = pending_ids(ids, &processed);
        let total = pending.len();
        info!(pending = total, "ids remaining");

        if total == 0 && !file_existed {
            // Header-only file so the output always carries the schema.
            self.store
                .save(&accumulated)
                .await
                .map_err(|e| self.checkpoint_error(e))?;
        }

        let batch_size = self.config.batch_size;
        let mut buffer: Vec<L::Record> = Vec::with_capacity(batch_size.min(total));
        let mut completed = 0usize;
        let mut flushes = 0usize;

        // Spawned so in-flight lookups keep running while a flush is written.
        let completions = WorkerPool::new(self.config.workers).completions(pending, |id| {
            let fetcher = Arc::clone(&self.fetcher);
            tokio::spawn(async move { fetcher.fetch(id).await })
        });
        let mut completions = std::pin::pin!(completions);

        while let Some(joined) = completions.next().await {
            let record = joined?;
            completed += 1;
            info!(id = %record.key(), completed, total, "fetched");
            buffer.push(record);
            if completed % batch_size == 0 || completed == total {
                accumulated.append(&mut buffer);
                self.store
                    .save(&accumulated)
                    .await
                    .map_err(|e| self.checkpoint_error(e))?;
                flushes += 1;
                info!(rows = accumulated.len(), completed, total, "checkpoint flushed");
            }
        }

        let summary = RunSummary {
            run_id,
            lookup: self.fetcher.name().to_string(),
            checkpoint: self.store.location(),
            started_at,
            finished_at: Utc::now(),
            existing_rows,
            pending: total,
            fetched: completed,
            flushes,
            total_rows: accumulated.len(),
        };
        info!(
            fetched = summary.fetched,
            flushes = summary.flushes,
            total_rows = summary.total_rows,
            "run complete"
        );

        Ok(RunOutcome {
            summary,
            records: accumulated,
        })
    }
}

/// One-call form: resumable run of `fetcher` over `ids` checkpointed to a CSV at `output`.
pub async fn run_resumable<L: Lookup + 'static>(
    ids: impl IntoIterator<Item = Key<L>>,
    output: impl Into<PathBuf>,
    config: BatchConfig,
    fetcher: Option<Arc<L>>,
) -> Result<Vec<L::Record>, RunnerError> {
    let mut builder = RunnerBuilder::new(config).output(output);
    if let Some(fetcher) = fetcher {
        builder = builder.fetcher(fetcher);
    }
    let outcome = builder.build()?.run(ids).await?;
    Ok(outcome.records)
}

/// Input ids minus `processed`, input order kept, repeats collapsed to the first.
pub fn pending_ids<K>(ids: impl IntoIterator<Item = K>, processed: &HashSet<K>) -> Vec<K>
where
    K: Eq + Hash + Clone,
{
    let mut seen = HashSet::new();
    ids.into_iter()
        .filter(|id| !processed.contains(id) && seen.insert(id.clone()))
        .collect()
}

fn dedup_by_key<R: CheckpointRecord>(records: Vec<R>) -> Vec<R> {
    let before = records.len();
    let mut seen = HashSet::new();
    let kept: Vec<R> = records
        .into_iter()
        .filter(|r| seen.insert(r.key()))
        .collect();
    if kept.len() != before {
        warn!(
            dropped = before - kept.len(),
            "checkpoint held duplicate keys; kept first occurrence"
        );
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use steamcat_adapters::LookupError;
    use steamcat_core::{AppIdRecord, ReviewRecord};
    use tempfile::tempdir;

    /// Resolves a title to its length; titles in `failing` error out.
    #[derive(Default)]
    struct FakeAppIds {
        failing: HashSet<String>,
        delays_ms: HashMap<String, u64>,
        calls: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        events: Option<Arc<Mutex<Vec<String>>>>,
    }

    impl FakeAppIds {
        fn failing_on(titles: &[&str]) -> Self {
            Self {
                failing: titles.iter().map(|t| t.to_string()).collect(),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            let mut calls = self.calls.lock().unwrap().clone();
            calls.sort();
            calls
        }
    }

    #[async_trait]
    impl Lookup for FakeAppIds {
        type Record = AppIdRecord;

        fn name(&self) -> &'static str {
            "fake-appid"
        }

        async fn lookup(&self, title: &String) -> Result<AppIdRecord, LookupError> {
            self.calls.lock().unwrap().push(title.clone());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let delay = self.delays_ms.get(title).copied().unwrap_or(5);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if let Some(events) = &self.events {
                events.lock().unwrap().push(format!("done {title}"));
            }

            if self.failing.contains(title) {
                return Err(LookupError::Unsuccessful {
                    endpoint: "storesearch",
                    id: title.clone(),
                });
            }
            Ok(AppIdRecord {
                name: title.clone(),
                appid: Some(title.len() as u64),
            })
        }
    }

    /// CSV checkpoint that remembers the row count of every save.
    struct CountingStore {
        inner: CsvCheckpoint,
        saves: Arc<Mutex<Vec<usize>>>,
    }

    impl CountingStore {
        fn new(path: &Path) -> (Self, Arc<Mutex<Vec<usize>>>) {
            let saves = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    inner: CsvCheckpoint::new(path),
                    saves: saves.clone(),
                },
                saves,
            )
        }
    }

    #[async_trait]
    impl<R: CheckpointRecord> CheckpointStore<R> for CountingStore {
        async fn load(&self) -> Result<Option<Vec<R>>> {
            self.inner.load().await
        }

        async fn save(&self, records: &[R]) -> Result<()> {
            self.saves.lock().unwrap().push(records.len());
            self.inner.save(records).await
        }

        fn location(&self) -> String {
            CheckpointStore::<R>::location(&self.inner)
        }
    }

    /// Checkpoint whose saves take `delay` and are logged into `events`.
    struct SlowStore {
        inner: CsvCheckpoint,
        delay: Duration,
        events: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl<R: CheckpointRecord> CheckpointStore<R> for SlowStore {
        async fn load(&self) -> Result<Option<Vec<R>>> {
            self.inner.load().await
        }

        async fn save(&self, records: &[R]) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push(format!("save start {}", records.len()));
            tokio::time::sleep(self.delay).await;
            self.inner.save(records).await?;
            self.events
                .lock()
                .unwrap()
                .push(format!("save end {}", records.len()));
            Ok(())
        }

        fn location(&self) -> String {
            CheckpointStore::<R>::location(&self.inner)
        }
    }

    fn titles(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn runner(
        fake: &Arc<FakeAppIds>,
        path: &Path,
        batch_size: usize,
        workers: usize,
    ) -> (ResumableRunner<FakeAppIds>, Arc<Mutex<Vec<usize>>>) {
        let (store, saves) = CountingStore::new(path);
        let runner = ResumableRunner::builder(BatchConfig {
            batch_size,
            workers,
        })
        .fetcher(fake.clone())
        .store(Box::new(store))
        .build()
        .expect("valid runner");
        (runner, saves)
    }

    fn sorted_names(records: &[AppIdRecord]) -> Vec<String> {
        let mut names: Vec<String> = records.iter().map(|r| r.name.clone()).collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn three_ids_batch_of_two_flush_after_second_and_third() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("appids.csv");
        let fake = Arc::new(FakeAppIds::default());
        let (runner, saves) = runner(&fake, &path, 2, 2);

        let outcome = runner.run(titles(&["A", "B", "C"])).await.unwrap();

        assert_eq!(*saves.lock().unwrap(), vec![2, 3]);
        assert_eq!(outcome.summary.flushes, 2);
        assert_eq!(sorted_names(&outcome.records), titles(&["A", "B", "C"]));
        let on_disk: Vec<AppIdRecord> = CsvCheckpoint::new(&path).load().await.unwrap().unwrap();
        assert_eq!(on_disk.len(), 3);
    }

    #[tokio::test]
    async fn flushes_ceil_n_over_b_times_with_existing_rows_included() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("appids.csv");
        CsvCheckpoint::new(&path)
            .save(&[AppIdRecord::null_filled("old".to_string())])
            .await
            .unwrap();

        let fake = Arc::new(FakeAppIds::default());
        let (runner, saves) = runner(&fake, &path, 3, 4);
        let ids = titles(&["a", "b", "c", "d", "e", "f", "g", "old"]);
        let outcome = runner.run(ids).await.unwrap();

        // 7 new ids, batch 3 -> ceil(7/3) = 3 writes
        assert_eq!(*saves.lock().unwrap(), vec![4, 7, 8]);
        assert_eq!(outcome.summary.existing_rows, 1);
        assert_eq!(outcome.summary.pending, 7);
        assert_eq!(outcome.summary.total_rows, 8);
    }

    #[tokio::test]
    async fn second_run_is_a_no_op() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("appids.csv");
        let fake = Arc::new(FakeAppIds::default());
        let ids = titles(&["Hades", "Celeste", "Tunic"]);

        let (first_runner, _) = runner(&fake, &path, 2, 3);
        let first = first_runner.run(ids.clone()).await.unwrap();
        let (second_runner, second_saves) = runner(&fake, &path, 2, 3);
        let second = second_runner.run(ids).await.unwrap();

        assert_eq!(second.summary.pending, 0);
        assert_eq!(second.summary.flushes, 0);
        assert!(second_saves.lock().unwrap().is_empty());
        assert_eq!(fake.calls().len(), 3);
        assert_eq!(sorted_names(&first.records), sorted_names(&second.records));
    }

    #[tokio::test]
    async fn resume_fetches_only_the_missing_ids() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("appids.csv");
        let saved = vec![
            AppIdRecord {
                name: "Hades".to_string(),
                appid: Some(1145360),
            },
            AppIdRecord::null_filled("Tunic".to_string()),
        ];
        CsvCheckpoint::new(&path).save(&saved).await.unwrap();

        let fake = Arc::new(FakeAppIds::default());
        let (runner, _) = runner(&fake, &path, 10, 2);
        let outcome = runner
            .run(titles(&["Hades", "Celeste", "Tunic", "Hollow Knight"]))
            .await
            .unwrap();

        assert_eq!(fake.calls(), titles(&["Celeste", "Hollow Knight"]));
        assert_eq!(
            sorted_names(&outcome.records),
            titles(&["Celeste", "Hades", "Hollow Knight", "Tunic"])
        );
        let hades = outcome.records.iter().find(|r| r.name == "Hades").unwrap();
        assert_eq!(hades.appid, Some(1145360));
    }

    #[tokio::test]
    async fn failed_lookups_land_as_null_rows() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("appids.csv");
        let fake = Arc::new(FakeAppIds::failing_on(&["broken"]));
        let (runner, _) = runner(&fake, &path, 5, 2);

        let outcome = runner.run(titles(&["ok", "broken"])).await.unwrap();

        let broken = outcome.records.iter().find(|r| r.name == "broken").unwrap();
        assert_eq!(*broken, AppIdRecord::null_filled("broken".to_string()));
        let ok = outcome.records.iter().find(|r| r.name == "ok").unwrap();
        assert_eq!(ok.appid, Some(2));
    }

    #[tokio::test]
    async fn duplicates_collapse_in_input_and_checkpoint() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("appids.csv");
        let dupes = vec![
            AppIdRecord::null_filled("x".to_string()),
            AppIdRecord::null_filled("x".to_string()),
        ];
        CsvCheckpoint::new(&path).save(&dupes).await.unwrap();

        let fake = Arc::new(FakeAppIds::default());
        let (runner, _) = runner(&fake, &path, 2, 2);
        let outcome = runner.run(titles(&["y", "x", "y", "z"])).await.unwrap();

        assert_eq!(fake.calls(), titles(&["y", "z"]));
        assert_eq!(sorted_names(&outcome.records), titles(&["x", "y", "z"]));
        let on_disk: Vec<AppIdRecord> = CsvCheckpoint::new(&path).load().await.unwrap().unwrap();
        assert_eq!(sorted_names(&on_disk), titles(&["x", "y", "z"]));
    }

    #[tokio::test]
    async fn empty_input_without_checkpoint_writes_header_only_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out").join("reviews.csv");
        let fake = Arc::new(FakeAppIds::default());
        let (runner, _) = runner(&fake, &path, 2, 2);

        let outcome = runner.run(Vec::new()).await.unwrap();

        assert!(outcome.records.is_empty());
        assert_eq!(outcome.summary.flushes, 0);
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.trim_end(), "name,appid");
    }

    #[tokio::test]
    async fn in_flight_lookups_never_exceed_worker_count() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("appids.csv");
        let ids: Vec<String> = (0..12).map(|i| format!("game-{i}")).collect();
        let fake = Arc::new(FakeAppIds {
            delays_ms: ids.iter().map(|id| (id.clone(), 20)).collect(),
            ..FakeAppIds::default()
        });
        let (runner, _) = runner(&fake, &path, 5, 3);

        let outcome = runner.run(ids).await.unwrap();

        assert_eq!(outcome.records.len(), 12);
        let peak = fake.max_in_flight.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak in-flight {peak}");
        assert!(peak >= 2, "expected concurrent lookups, peak {peak}");
    }

    #[tokio::test]
    async fn lookups_keep_running_while_a_flush_is_written() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("appids.csv");
        let events = Arc::new(Mutex::new(Vec::new()));
        let fake = Arc::new(FakeAppIds {
            delays_ms: [("fast".to_string(), 5), ("slow".to_string(), 60)]
                .into_iter()
                .collect(),
            events: Some(events.clone()),
            ..FakeAppIds::default()
        });
        let store = SlowStore {
            inner: CsvCheckpoint::new(&path),
            delay: Duration::from_millis(200),
            events: events.clone(),
        };
        let runner = ResumableRunner::builder(BatchConfig {
            batch_size: 1,
            workers: 2,
        })
        .fetcher(fake.clone())
        .store(Box::new(store))
        .build()
        .expect("valid runner");

        let outcome = runner.run(titles(&["fast", "slow"])).await.unwrap();

        assert_eq!(outcome.records.len(), 2);
        let events = events.lock().unwrap().clone();
        let at = |event: &str| events.iter().position(|e| e == event).expect(event);
        assert!(
            at("done slow") < at("save end 1"),
            "slow lookup stalled behind the first flush: {events:?}"
        );
        assert!(at("save end 1") < at("save start 2"));
    }

    #[tokio::test]
    async fn headerless_checkpoint_gets_its_header_back() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("appids.csv");
        std::fs::write(&path, "").unwrap();
        let fake = Arc::new(FakeAppIds::default());
        let (runner, _) = runner(&fake, &path, 2, 2);

        let outcome = runner.run(Vec::new()).await.unwrap();

        assert!(outcome.records.is_empty());
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.trim_end(), "name,appid");
    }

    #[tokio::test]
    async fn summary_serializes_for_reporting() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("appids.csv");
        let fake = Arc::new(FakeAppIds::default());
        let (runner, _) = runner(&fake, &path, 2, 2);

        let outcome = runner.run(titles(&["A", "B", "C"])).await.unwrap();
        let json = serde_json::to_value(&outcome.summary).unwrap();

        assert_eq!(json["lookup"], "fake-appid");
        assert_eq!(json["pending"], 3);
        assert_eq!(json["flushes"], 2);
        assert_eq!(json["run_id"], outcome.summary.run_id.to_string());
        assert!(json["started_at"].is_string());
    }

    #[tokio::test]
    async fn results_are_consumed_in_completion_order() {
        let pool = WorkerPool::new(3);
        let seen: Vec<u64> = pool
            .completions(vec![60u64, 5, 30], |ms| async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                ms
            })
            .collect()
            .await;

        assert_eq!(seen, vec![5, 30, 60]);
    }

    #[tokio::test]
    async fn schema_mismatch_fails_before_any_fetch() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("appids.csv");
        CsvCheckpoint::new(&path)
            .save(&[ReviewRecord::null_filled(10)])
            .await
            .unwrap();

        let fake = Arc::new(FakeAppIds::default());
        let (runner, saves) = runner(&fake, &path, 2, 2);
        let err = runner.run(titles(&["A"])).await.unwrap_err();

        assert!(matches!(err, RunnerError::Checkpoint { .. }));
        assert!(fake.calls().is_empty());
        assert!(saves.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_configuration_is_rejected_up_front() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("appids.csv");

        let missing = run_resumable::<FakeAppIds>(titles(&["A"]), &path, BatchConfig::APP_IDS, None).await;
        assert!(matches!(missing, Err(RunnerError::MissingFetcher)));

        let fake = Arc::new(FakeAppIds::default());
        let zero_batch = ResumableRunner::builder(BatchConfig {
            batch_size: 0,
            workers: 1,
        })
        .fetcher(fake.clone())
        .output(&path)
        .build();
        assert!(matches!(zero_batch, Err(RunnerError::ZeroBatchSize)));

        let zero_workers = ResumableRunner::builder(BatchConfig {
            batch_size: 1,
            workers: 0,
        })
        .fetcher(fake.clone())
        .output(&path)
        .build();
        assert!(matches!(zero_workers, Err(RunnerError::ZeroWorkers)));

        let no_output = ResumableRunner::builder(BatchConfig::APP_IDS)
            .fetcher(fake.clone())
            .build();
        assert!(matches!(no_output, Err(RunnerError::MissingOutput)));

        assert!(!path.exists());
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn one_call_form_returns_accumulated_set() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("appids.csv");
        let fake = Arc::new(FakeAppIds::default());

        let records = run_resumable(titles(&["A", "B"]), &path, BatchConfig::APP_IDS, Some(fake))
            .await
            .unwrap();
        assert_eq!(sorted_names(&records), titles(&["A", "B"]));
    }

    #[test]
    fn pending_keeps_input_order() {
        let processed: HashSet<u64> = [2, 4].into_iter().collect();
        assert_eq!(pending_ids(vec![5, 4, 3, 2, 1, 5], &processed), vec![5, 3, 1]);
    }

    #[test]
    fn config_reads_overrides_and_defaults() {
        let vars: HashMap<&str, &str> = [
            ("STEAMCAT_COUNTRY", "US"),
            ("STEAMCAT_DETAIL_DELAY_MS", "0"),
            ("STEAMCAT_HTTP_TIMEOUT_SECS", "not-a-number"),
        ]
        .into_iter()
        .collect();
        let config = SyncConfig::from_vars(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.country, "US");
        assert_eq!(config.language, "spanish");
        assert_eq!(config.store_base_url, DEFAULT_STORE_BASE_URL);
        assert_eq!(config.http_timeout_secs, 5);
        assert_eq!(config.detail_pacing(), PacingPolicy::None);
        assert_eq!(
            SyncConfig::from_vars(|_| None).detail_pacing(),
            PacingPolicy::FixedDelay(Duration::from_secs(1))
        );
    }
}

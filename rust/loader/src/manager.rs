// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background loading jobs.
//!
//! [`BackgroundLoader`] owns the job table and the concurrency ceiling. Each
//! accepted job runs its pipeline on a dedicated control thread:
//!
//! 1. analyze the file
//! 2. plan chunks (`Chunking`)
//! 3. check the memory estimate against the ceiling
//! 4. parse chunks on the worker pool (`Parsing`)
//! 5. build the merged model (`Aggregating`)
//!
//! Callbacks run on the control thread, never while the job table is locked
//! and never once the job has been cancelled.

use crate::analysis::{analyze_file, detect_file_format};
use crate::cancellation::{panic_message, CancellationToken};
use crate::chunk::MB;
use crate::chunker::{AdaptiveChunker, ChunkPlan};
use crate::config::LoaderConfig;
use crate::coordinator::ChunkCoordinator;
use crate::error::{LoadError, Result};
use crate::memory::{MemoryMonitor, SystemMemoryMonitor};
use crate::model::{LoadedModel, LOADED_BYTES_PER_TRIANGLE};
use crate::record::{ChunkParser, StlChunkParser, WireTriangle};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Parser type used by the loader.
pub type TriangleParser = dyn ChunkParser<Record = WireTriangle>;

type ProgressFn = Box<dyn Fn(u8, &str) + Send>;
type CompletionFn = Box<dyn FnOnce(JobId, Option<Arc<LoadedModel>>, Option<LoadError>) + Send>;

/// Identifier of a loading job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct JobId(u64);

impl JobId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Lifecycle state of a job. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum JobState {
    Idle,
    Initializing,
    Chunking,
    Parsing,
    Aggregating,
    Cancelling,
    Completed,
    Cancelled,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Cancelled | JobState::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            JobState::Idle => 0,
            JobState::Initializing => 1,
            JobState::Chunking => 2,
            JobState::Parsing => 3,
            JobState::Aggregating => 4,
            JobState::Cancelling => 5,
            JobState::Completed | JobState::Cancelled | JobState::Failed => 6,
        }
    }

    /// Whether `next` may follow `self`.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (current, _) if current.is_terminal() => false,
            (Cancelling, Cancelled) => true,
            (Cancelling, _) => false,
            (_, Cancelling | Cancelled | Failed) => true,
            (Aggregating, Completed) => true,
            (_, Completed) => false,
            _ => next.rank() > self.rank(),
        }
    }
}

/// Point-in-time view of a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub id: JobId,
    pub path: PathBuf,
    pub state: JobState,
    /// 0 to 100
    pub progress: u8,
    pub message: String,
    pub elapsed: Duration,
    pub is_cancelled: bool,
    /// Machine-readable code of the failure, if any
    pub error_code: Option<&'static str>,
}

/// Lets callbacks run until the job is cancelled, and not after.
///
/// No lock is held while a callback runs, so a callback may cancel its own
/// job. `close` never waits: a callback that already started finishes, but
/// none starts once `close` has returned.
#[derive(Debug, Default)]
struct CallbackGate {
    closed: AtomicBool,
    running: AtomicUsize,
}

impl CallbackGate {
    fn new() -> Self {
        Self::default()
    }

    fn invoke(&self, job_id: JobId, f: impl FnOnce()) {
        self.running.fetch_add(1, Ordering::SeqCst);
        if !self.closed.load(Ordering::SeqCst) {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
                tracing::warn!(%job_id, panic = %panic_message(&*payload), "Job callback panicked");
            }
        }
        self.running.fetch_sub(1, Ordering::SeqCst);
    }

    /// Close the gate. Returns how many callbacks were still running.
    fn close(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        self.running.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// A job record in the job table.
#[derive(Debug)]
pub struct LoadingJob {
    pub id: JobId,
    pub path: PathBuf,
    pub state: JobState,
    pub progress: u8,
    pub message: String,
    pub started: Instant,
    pub finished: Option<Instant>,
    token: CancellationToken,
    gate: Arc<CallbackGate>,
    result: Option<Arc<LoadedModel>>,
    error_code: Option<&'static str>,
}

impl LoadingJob {
    fn new(id: JobId, path: PathBuf) -> Self {
        Self {
            id,
            path,
            state: JobState::Initializing,
            progress: 0,
            message: "Queued".to_string(),
            started: Instant::now(),
            finished: None,
            token: CancellationToken::new(),
            gate: Arc::new(CallbackGate::new()),
            result: None,
            error_code: None,
        }
    }

    fn status(&self) -> JobStatus {
        JobStatus {
            id: self.id,
            path: self.path.clone(),
            state: self.state,
            progress: self.progress,
            message: self.message.clone(),
            elapsed: self.finished.unwrap_or_else(Instant::now) - self.started,
            is_cancelled: self.token.is_cancelled(),
            error_code: self.error_code,
        }
    }
}

struct LoaderInner {
    config: LoaderConfig,
    chunker: AdaptiveChunker,
    parser: Arc<TriangleParser>,
    jobs: Mutex<FxHashMap<JobId, LoadingJob>>,
    next_id: AtomicU64,
}

/// Runs loading jobs in the background.
///
/// Cheap to clone; clones share one job table.
#[derive(Clone)]
pub struct BackgroundLoader {
    inner: Arc<LoaderInner>,
}

impl fmt::Debug for BackgroundLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundLoader")
            .field("config", &self.inner.config)
            .field("jobs", &self.inner.lock_jobs().len())
            .finish()
    }
}

impl BackgroundLoader {
    /// Loader with the STL parser and system memory probing.
    pub fn new(config: LoaderConfig) -> Self {
        Self::with_parts(config, Arc::new(StlChunkParser), Arc::new(SystemMemoryMonitor::new()))
    }

    pub fn with_parts(
        config: LoaderConfig,
        parser: Arc<TriangleParser>,
        memory: Arc<dyn MemoryMonitor>,
    ) -> Self {
        let chunker = AdaptiveChunker::new(&config, memory);
        Self::with_chunker(config, parser, chunker)
    }

    /// Loader with a preconfigured chunker (extra boundary seekers, limits).
    pub fn with_chunker(config: LoaderConfig, parser: Arc<TriangleParser>, chunker: AdaptiveChunker) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                config,
                chunker,
                parser,
                jobs: Mutex::new(FxHashMap::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.inner.config
    }

    /// Start loading `path` in the background.
    ///
    /// Fails with [`LoadError::CapacityExceeded`] and creates nothing when
    /// the ceiling of unfinished jobs is reached. `on_complete` is not called
    /// for cancelled jobs.
    pub fn submit<F, C>(&self, path: impl Into<PathBuf>, on_progress: F, on_complete: C) -> Result<JobId>
    where
        F: Fn(u8, &str) + Send + 'static,
        C: FnOnce(JobId, Option<Arc<LoadedModel>>, Option<LoadError>) + Send + 'static,
    {
        let path = path.into();
        let limit = self.inner.config.max_concurrent_jobs;

        let id = {
            let mut jobs = self.inner.lock_jobs();
            let active = jobs.values().filter(|j| !j.state.is_terminal()).count();
            if active >= limit {
                tracing::warn!(active, limit, path = %path.display(), "Rejecting load: too many jobs");
                return Err(LoadError::CapacityExceeded { limit });
            }
            let id = JobId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
            jobs.insert(id, LoadingJob::new(id, path.clone()));
            id
        };

        let inner = Arc::clone(&self.inner);
        let job_path = path.clone();
        let spawned = thread::Builder::new()
            .name(format!("load-job-{}", id.0))
            .spawn(move || inner.run_job(id, &job_path, Box::new(on_progress), Box::new(on_complete)));

        if let Err(e) = spawned {
            self.inner.lock_jobs().remove(&id);
            return Err(LoadError::WorkerPool(format!("could not start job thread: {}", e)));
        }

        tracing::info!(%id, path = %path.display(), "Load job submitted");
        Ok(id)
    }

    /// Cancel a running job. Returns false for unknown or finished jobs.
    ///
    /// Returns without waiting for in-flight chunks; the job is `Cancelled`
    /// as soon as this returns.
    pub fn cancel(&self, id: JobId) -> bool {
        let started = Instant::now();

        let (token, gate) = {
            let mut jobs = self.inner.lock_jobs();
            let Some(job) = jobs.get_mut(&id) else {
                return false;
            };
            if !job.state.can_transition_to(JobState::Cancelling) {
                return false;
            }
            job.state = JobState::Cancelling;
            job.message = "Cancelling".to_string();
            (job.token.clone(), Arc::clone(&job.gate))
        };

        let running = gate.close();
        if running > 0 {
            tracing::debug!(%id, running, "Cancelled while a job callback was running");
        }
        token.cancel();

        if let Some(job) = self.inner.lock_jobs().get_mut(&id) {
            if job.state.can_transition_to(JobState::Cancelled) {
                job.state = JobState::Cancelled;
                job.message = "Cancelled by user".to_string();
                job.finished = Some(Instant::now());
            }
        }

        let elapsed = started.elapsed();
        if elapsed > self.inner.config.cancel_budget {
            tracing::warn!(
                %id,
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = self.inner.config.cancel_budget.as_millis() as u64,
                "Cancellation exceeded its time budget"
            );
        }
        tracing::info!(%id, "Load job cancelled");
        true
    }

    pub fn status(&self, id: JobId) -> Option<JobStatus> {
        self.inner.lock_jobs().get(&id).map(LoadingJob::status)
    }

    /// Model of a completed job.
    pub fn result(&self, id: JobId) -> Option<Arc<LoadedModel>> {
        self.inner
            .lock_jobs()
            .get(&id)
            .filter(|job| job.state == JobState::Completed)
            .and_then(|job| job.result.clone())
    }

    /// Remove finished jobs older than `max_age`. Returns how many were removed.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let mut jobs = self.inner.lock_jobs();
        let before = jobs.len();
        jobs.retain(|_, job| match job.finished {
            Some(finished) if job.state.is_terminal() => finished.elapsed() < max_age,
            _ => true,
        });
        let purged = before - jobs.len();
        if purged > 0 {
            tracing::debug!(purged, remaining = jobs.len(), "Purged finished jobs");
        }
        purged
    }

    /// [`cleanup`](Self::cleanup) with the configured retention window.
    pub fn cleanup_expired(&self) -> usize {
        self.cleanup(self.inner.config.job_retention)
    }

    /// Jobs that have not reached a terminal state.
    pub fn active_job_count(&self) -> usize {
        self.inner
            .lock_jobs()
            .values()
            .filter(|job| !job.state.is_terminal())
            .count()
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.inner.lock_jobs().keys().copied().collect();
        ids.sort();
        ids
    }
}

impl LoaderInner {
    fn lock_jobs(&self) -> MutexGuard<'_, FxHashMap<JobId, LoadingJob>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record progress. Returns the callback gate, or `None` once the job can
    /// no longer move to `state`.
    fn report(&self, id: JobId, state: JobState, progress: u8, message: &str) -> Option<Arc<CallbackGate>> {
        let mut jobs = self.lock_jobs();
        let job = jobs.get_mut(&id)?;
        if job.state != state && !job.state.can_transition_to(state) {
            return None;
        }
        job.state = state;
        job.progress = progress.max(job.progress).min(100);
        job.message = message.to_string();
        Some(Arc::clone(&job.gate))
    }

    fn run_job(&self, id: JobId, path: &Path, on_progress: ProgressFn, on_complete: CompletionFn) {
        let Some(token) = self.lock_jobs().get(&id).map(|job| job.token.clone()) else {
            return;
        };

        let progress = |state: JobState, percent: u8, message: &str| -> Result<()> {
            let gate = self.report(id, state, percent, message).ok_or(LoadError::Cancelled)?;
            gate.invoke(id, || on_progress(percent, message));
            if gate.is_closed() {
                return Err(LoadError::Cancelled);
            }
            Ok(())
        };

        let outcome = self.execute(id, path, &token, &progress);

        let (state, result, error) = match outcome {
            Ok(model) => (JobState::Completed, Some(model), None),
            Err(e) if e.is_cancelled() => {
                tracing::info!(%id, "Load job stopped after cancellation");
                return;
            }
            Err(e) => (JobState::Failed, None, Some(e)),
        };

        let gate = {
            let mut jobs = self.lock_jobs();
            let Some(job) = jobs.get_mut(&id) else {
                return;
            };
            if !job.state.can_transition_to(state) {
                return;
            }
            job.state = state;
            job.finished = Some(Instant::now());
            match &error {
                None => {
                    job.progress = 100;
                    job.message = "Completed".to_string();
                    job.result = result.clone();
                }
                Some(e) => {
                    job.message = e.to_string();
                    job.error_code = Some(e.code());
                }
            }
            Arc::clone(&job.gate)
        };

        match &error {
            None => tracing::info!(%id, path = %path.display(), "Load job completed"),
            Some(e) => tracing::error!(%id, path = %path.display(), code = e.code(), error = %e, "Load job failed"),
        }
        gate.invoke(id, || on_complete(id, result, error));
    }

    fn execute(
        &self,
        id: JobId,
        path: &Path,
        token: &CancellationToken,
        progress: &dyn Fn(JobState, u8, &str) -> Result<()>,
    ) -> Result<Arc<LoadedModel>> {
        let started = Instant::now();

        progress(JobState::Chunking, 2, "Analyzing file")?;
        let format = detect_file_format(path)?;
        if !self.parser.supports(format) {
            return Err(LoadError::UnsupportedFormat(format!(
                "{} files are not handled by the configured parser",
                format.name()
            )));
        }
        let analysis = analyze_file(path, token)?;

        let plan = self.chunker.plan(&analysis, token)?;
        progress(
            JobState::Chunking,
            10,
            &format!("Split into {} chunks ({})", plan.chunks.len(), plan.parameters.strategy),
        )?;
        self.check_memory(id, &plan)?;
        let chunking_time = started.elapsed();

        let parse_started = Instant::now();
        let total = plan.chunks.len();
        progress(JobState::Parsing, 15, &format!("Parsing {} chunks", total))?;

        let coordinator = ChunkCoordinator::new(
            Some(plan.parameters.max_concurrent_chunks),
            self.config.chunk_timeout,
        );
        let mut cancelled = false;
        let triangles = coordinator.coordinate_parsing(
            &plan.chunks,
            Arc::clone(&self.parser),
            token,
            |done, total| {
                if cancelled {
                    return;
                }
                let percent = 15 + (done * 75 / total.max(1)) as u8;
                let message = format!("Parsed {}/{} chunks", done, total);
                cancelled = progress(JobState::Parsing, percent, &message).is_err();
            },
        )?;
        if cancelled {
            return Err(LoadError::Cancelled);
        }
        let parse_time = parse_started.elapsed();

        let aggregate_started = Instant::now();
        progress(JobState::Aggregating, 90, "Building model")?;
        let mut model = LoadedModel::from_triangles(&triangles);
        drop(triangles);

        model.stats.chunk_count = total;
        model.stats.strategy = Some(plan.parameters.strategy);
        model.stats.file_size = analysis.file_size;
        model.stats.chunking_time_ms = chunking_time.as_millis() as u64;
        model.stats.parse_time_ms = parse_time.as_millis() as u64;
        model.stats.aggregate_time_ms = aggregate_started.elapsed().as_millis() as u64;
        model.stats.total_time_ms = started.elapsed().as_millis() as u64;

        tracing::debug!(
            %id,
            triangles = model.stats.total_triangles,
            chunks = total,
            total_ms = model.stats.total_time_ms,
            "Model built"
        );

        Ok(Arc::new(model))
    }

    /// Fail before parsing if the load would not fit in memory.
    fn check_memory(&self, id: JobId, plan: &ChunkPlan) -> Result<()> {
        let limit = match self.config.memory_limit {
            Some(limit) => limit,
            None if plan.memory.total_bytes == 0 => {
                tracing::warn!(%id, "System memory unknown, skipping memory check");
                return Ok(());
            }
            None => plan.memory.available_bytes / 4 * 3,
        };

        let in_flight = plan.max_chunk_bytes() * plan.parameters.max_concurrent_chunks as u64;
        let required = plan
            .total_records()
            .saturating_mul(LOADED_BYTES_PER_TRIANGLE)
            .saturating_add(in_flight);

        tracing::debug!(%id, required_mb = required / MB, limit_mb = limit / MB, "Memory estimate");
        if required > limit {
            return Err(LoadError::MemoryLimitExceeded {
                required_mb: required.div_ceil(MB),
                limit_mb: limit / MB,
            });
        }
        Ok(())
    }
}

//! The pipeline controller: jobs, key-scoped mutual exclusion, content-keyed
//! caching, bounded retry, and cooperative cancellation.
//!
//! Every mutating path runs as a [`Job`] owning the mutex for its
//! `(book, chapter, language, operation-class)` key for its whole lifetime.
//! Within a key, operations serialize in submission order; across keys they
//! run in parallel under a global concurrency cap. Expensive stages are
//! fingerprinted; a hit short-circuits to a single `done` event. Transient
//! backend failures retry with bounded exponential backoff.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Semaphore, watch};
use tracing::{info, warn};
use uuid::Uuid;

use crate::book::TokenTable;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::progress::{ProgressChannel, ProgressEvent};
use crate::util::{CancelFlag, sha1_hex_parts};

// ============================================================================
// Keys and job shapes
// ============================================================================

/// Operation class of a key-scoped mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpClass {
    Source,
    Align,
    Edit,
    Export,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Ingest,
    Tts,
    Align,
    TranslateChapter,
    Export,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Canceled
        )
    }
}

/// The mutex key a job owns: book, optionally chapter and language, and the
/// operation class. Book-level operations (ingest, export) leave chapter and
/// language empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetKey {
    pub book: String,
    pub chapter: Option<usize>,
    pub lang: Option<String>,
    pub class: OpClass,
}

impl TargetKey {
    pub fn book_level(book: impl Into<String>, class: OpClass) -> Self {
        Self {
            book: book.into(),
            chapter: None,
            lang: None,
            class,
        }
    }

    pub fn chapter_level(
        book: impl Into<String>,
        chapter: usize,
        lang: impl Into<String>,
        class: OpClass,
    ) -> Self {
        Self {
            book: book.into(),
            chapter: Some(chapter),
            lang: Some(lang.into()),
            class,
        }
    }
}

impl std::fmt::Display for TargetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.book)?;
        if let Some(chapter) = self.chapter {
            write!(f, "/{chapter}")?;
        }
        if let Some(lang) = &self.lang {
            write!(f, "/{lang}")?;
        }
        write!(f, "/{:?}", self.class)
    }
}

/// A registered mutation.
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub key: TargetKey,
    pub progress: ProgressChannel,
    pub cancel: CancelFlag,
    state: watch::Sender<JobState>,
    error: Mutex<Option<String>>,
}

/// Serializable job view for the HTTP surface.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub kind: JobKind,
    pub target_key: String,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Job {
    fn new(kind: JobKind, key: TargetKey) -> Self {
        let (state, _) = watch::channel(JobState::Pending);
        Self {
            id: Uuid::new_v4(),
            kind,
            key,
            progress: ProgressChannel::new(),
            cancel: CancelFlag::new(),
            state,
            error: Mutex::new(None),
        }
    }

    pub fn state(&self) -> JobState {
        *self.state.borrow()
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn record(&self) -> JobRecord {
        JobRecord {
            id: self.id,
            kind: self.kind,
            target_key: self.key.to_string(),
            state: self.state(),
            error: self.error(),
        }
    }

    /// Wait until the job reaches a terminal state.
    pub async fn wait(&self) -> JobState {
        let mut rx = self.state.subscribe();
        loop {
            let state = *rx.borrow();
            if state.is_terminal() {
                return state;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }

    fn set_state(&self, state: JobState) {
        let _ = self.state.send(state);
    }

    fn set_error(&self, message: String) {
        *self.error.lock().unwrap_or_else(|e| e.into_inner()) = Some(message);
    }
}

// ============================================================================
// Controller
// ============================================================================

/// Bounded index of fingerprints whose artifacts are already materialized.
struct CacheIndex {
    entries: HashMap<String, ()>,
    order: VecDeque<String>,
    capacity: usize,
}

impl CacheIndex {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn contains(&self, fingerprint: &str) -> bool {
        self.entries.contains_key(fingerprint)
    }

    fn insert(&mut self, fingerprint: String) {
        if self.entries.insert(fingerprint.clone(), ()).is_none() {
            self.order.push_back(fingerprint);
            while self.order.len() > self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.entries.remove(&evicted);
                }
            }
        }
    }
}

pub struct Controller {
    config: Config,
    jobs: Mutex<HashMap<Uuid, Arc<Job>>>,
    locks: Mutex<HashMap<TargetKey, Arc<tokio::sync::Mutex<()>>>>,
    /// fingerprint -> job currently building it, for request coalescing
    inflight: Mutex<HashMap<String, Arc<Job>>>,
    cache: Mutex<CacheIndex>,
    semaphore: Arc<Semaphore>,
}

impl Controller {
    pub fn new(config: Config) -> Arc<Self> {
        let permits = config.max_concurrent_jobs.max(1);
        Arc::new(Self {
            config,
            jobs: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            cache: Mutex::new(CacheIndex::new(1024)),
            semaphore: Arc::new(Semaphore::new(permits)),
        })
    }

    pub fn job(&self, id: Uuid) -> Option<Arc<Job>> {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    /// Request cooperative cancellation. The worker unwinds to the last
    /// committed state at its next checkpoint.
    pub fn cancel(&self, id: Uuid) -> bool {
        match self.job(id) {
            Some(job) if !job.state().is_terminal() => {
                job.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// The mutex guarding a key, for synchronous mutations (edits) that are
    /// not full jobs.
    pub fn key_lock(&self, key: &TargetKey) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Register and start a job.
    ///
    /// With a fingerprint: an identical in-flight request coalesces onto the
    /// running job, and a cache hit completes immediately with a single
    /// `done` event.
    pub fn submit<F>(
        self: &Arc<Self>,
        kind: JobKind,
        key: TargetKey,
        fingerprint: Option<String>,
        step: &'static str,
        work: F,
    ) -> Arc<Job>
    where
        F: Fn(&Job) -> Result<()> + Send + Sync + 'static,
    {
        if let Some(fp) = &fingerprint {
            let inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(running) = inflight.get(fp)
                && !running.state().is_terminal()
            {
                info!(job = %running.id, fingerprint = %fp, "coalescing onto running job");
                return Arc::clone(running);
            }
            drop(inflight);

            if self
                .cache
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains(fp)
            {
                let job = Arc::new(Job::new(kind, key));
                job.set_state(JobState::Succeeded);
                job.progress
                    .emit(ProgressEvent::done(step, "cached result reused"));
                self.jobs
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(job.id, Arc::clone(&job));
                info!(job = %job.id, fingerprint = %fp, "cache hit");
                return job;
            }
        }

        let job = Arc::new(Job::new(kind, key));
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job.id, Arc::clone(&job));
        if let Some(fp) = &fingerprint {
            self.inflight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(fp.clone(), Arc::clone(&job));
        }

        let controller = Arc::clone(self);
        let job_handle = Arc::clone(&job);
        tokio::spawn(async move {
            controller
                .run_job(job_handle, fingerprint, step, Arc::new(work))
                .await;
        });
        job
    }

    async fn run_job<F>(
        self: Arc<Self>,
        job: Arc<Job>,
        fingerprint: Option<String>,
        step: &'static str,
        work: Arc<F>,
    ) where
        F: Fn(&Job) -> Result<()> + Send + Sync + 'static,
    {
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore closed");
        let lock = self.key_lock(&job.key);
        let _guard = lock.lock().await;

        job.set_state(JobState::Running);
        let result = self.run_with_retry(&job, &work).await;

        match result {
            Ok(()) => {
                if let Some(fp) = &fingerprint {
                    self.cache
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(fp.clone());
                }
                if !job
                    .progress
                    .snapshot()
                    .map(|e| e.is_terminal())
                    .unwrap_or(false)
                {
                    job.progress.emit(ProgressEvent::done(step, "completed"));
                }
                job.set_state(JobState::Succeeded);
                info!(job = %job.id, key = %job.key, "job succeeded");
            }
            Err(Error::Canceled) => {
                job.set_error("canceled".into());
                job.progress
                    .emit(ProgressEvent::error(step, "operation canceled", "canceled"));
                job.set_state(JobState::Canceled);
                info!(job = %job.id, key = %job.key, "job canceled");
            }
            Err(e) => {
                job.set_error(e.to_string());
                job.progress
                    .emit(ProgressEvent::error(step, e.to_string(), e.reason()));
                job.set_state(JobState::Failed);
                warn!(job = %job.id, key = %job.key, error = %e, "job failed");
            }
        }

        if let Some(fp) = &fingerprint {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            if inflight.get(fp).map(|j| j.id) == Some(job.id) {
                inflight.remove(fp);
            }
        }
    }

    async fn run_with_retry<F>(&self, job: &Arc<Job>, work: &Arc<F>) -> Result<()>
    where
        F: Fn(&Job) -> Result<()> + Send + Sync + 'static,
    {
        let attempts = self.config.retry_attempts.max(1);
        let mut delay = Duration::from_millis(self.config.retry_base_delay_ms);

        for attempt in 1..=attempts {
            job.cancel.checkpoint()?;

            let job_ref = Arc::clone(job);
            let work_ref = Arc::clone(work);
            let result = tokio::task::spawn_blocking(move || (*work_ref)(&job_ref))
                .await
                .map_err(|e| Error::Invariant(format!("worker panicked: {e}")))?;

            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(
                        job = %job.id,
                        attempt,
                        error = %e,
                        backoff_ms = delay.as_millis() as u64,
                        "transient failure; retrying"
                    );
                    job.progress.emit(ProgressEvent::progress(
                        "retry",
                        format!("attempt {attempt} failed ({e}); retrying"),
                    ));
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("retry loop always returns")
    }
}

// ============================================================================
// Fingerprints
// ============================================================================

/// Content hash of a token table (surfaces only; ids are positional).
pub fn token_table_hash(tokens: &TokenTable) -> String {
    sha1_hex_parts(tokens.iter().map(|t| t.surface.as_bytes()))
}

pub fn fingerprint_tts(book: &str, chapter: usize, voice: &str, text_hash: &str) -> String {
    sha1_hex_parts(["tts", book, &chapter.to_string(), voice, text_hash])
}

pub fn fingerprint_translation(
    book: &str,
    chapter: usize,
    target_lang: &str,
    token_hash: &str,
) -> String {
    sha1_hex_parts(["translate", book, &chapter.to_string(), target_lang, token_hash])
}

pub fn fingerprint_alignment(audio_hash: &str, token_hash: &str, backend: &str) -> String {
    sha1_hex_parts(["align", audio_hash, token_hash, backend])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config() -> Config {
        Config {
            retry_base_delay_ms: 1,
            ..Config::default()
        }
    }

    fn key(book: &str) -> TargetKey {
        TargetKey::chapter_level(book, 0, "en", OpClass::Source)
    }

    #[tokio::test]
    async fn test_job_runs_and_succeeds() {
        let controller = Controller::new(test_config());
        let job = controller.submit(JobKind::Tts, key("b1"), None, "tts", |job| {
            job.progress.emit(ProgressEvent::progress("tts", "working"));
            Ok(())
        });
        assert_eq!(job.wait().await, JobState::Succeeded);
        // a terminal done event was appended
        assert!(job.progress.snapshot().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_failure_emits_error_event() {
        let controller = Controller::new(test_config());
        let job = controller.submit(JobKind::Align, key("b1"), None, "align", |_| {
            Err(Error::AlignmentDiverged {
                timed: 1,
                total: 10,
                minimum: 0.8,
            })
        });
        assert_eq!(job.wait().await, JobState::Failed);
        match job.progress.snapshot().unwrap() {
            ProgressEvent::Error { reason, .. } => assert_eq!(reason, "alignment_diverged"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_transient_errors_retry() {
        let controller = Controller::new(test_config());
        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&attempts);
        let job = controller.submit(JobKind::Tts, key("b1"), None, "tts", move |_| {
            if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::BackendTimeout {
                    backend: "tts".into(),
                    seconds: 1,
                })
            } else {
                Ok(())
            }
        });
        assert_eq!(job.wait().await, JobState::Succeeded);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_does_not_retry() {
        let controller = Controller::new(test_config());
        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&attempts);
        let job = controller.submit(JobKind::Tts, key("b1"), None, "tts", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Err(Error::NotFound("x".into()))
        });
        assert_eq!(job.wait().await, JobState::Failed);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_hit_short_circuits() {
        let controller = Controller::new(test_config());
        let runs = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&runs);
        let first = controller.submit(
            JobKind::Tts,
            key("b1"),
            Some("fp1".into()),
            "tts",
            move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );
        assert_eq!(first.wait().await, JobState::Succeeded);

        let seen = Arc::clone(&runs);
        let second = controller.submit(
            JobKind::Tts,
            key("b1"),
            Some("fp1".into()),
            "tts",
            move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );
        assert_eq!(second.wait().await, JobState::Succeeded);
        assert_eq!(runs.load(Ordering::SeqCst), 1, "second run must be cached");
        assert!(matches!(
            second.progress.snapshot().unwrap(),
            ProgressEvent::Done { .. }
        ));
    }

    #[tokio::test]
    async fn test_identical_requests_coalesce() {
        let controller = Controller::new(test_config());
        let gate = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let hold = Arc::clone(&gate);
        let first = controller.submit(
            JobKind::Tts,
            key("b1"),
            Some("fp2".into()),
            "tts",
            move |_| {
                while !hold.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Ok(())
            },
        );
        // give the first job time to register
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second =
            controller.submit(JobKind::Tts, key("b1"), Some("fp2".into()), "tts", |_| Ok(()));
        assert_eq!(second.id, first.id);

        gate.store(true, Ordering::SeqCst);
        assert_eq!(first.wait().await, JobState::Succeeded);
    }

    #[tokio::test]
    async fn test_same_key_serializes() {
        let controller = Controller::new(test_config());
        let running = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let mut jobs = Vec::new();
        for _ in 0..3 {
            let running = Arc::clone(&running);
            let overlap = Arc::clone(&overlap);
            jobs.push(controller.submit(JobKind::Tts, key("b1"), None, "tts", move |_| {
                if running.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlap.store(true, Ordering::SeqCst);
                }
                std::thread::sleep(Duration::from_millis(20));
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        for job in jobs {
            assert_eq!(job.wait().await, JobState::Succeeded);
        }
        assert!(!overlap.load(Ordering::SeqCst), "same-key jobs overlapped");
    }

    #[tokio::test]
    async fn test_cancel_surfaces_reason() {
        let controller = Controller::new(test_config());
        let job = controller.submit(JobKind::Align, key("b1"), None, "align", |job| {
            for _ in 0..200 {
                job.cancel.checkpoint()?;
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(controller.cancel(job.id));
        assert_eq!(job.wait().await, JobState::Canceled);
        match job.progress.snapshot().unwrap() {
            ProgressEvent::Error { reason, .. } => assert_eq!(reason, "canceled"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_fingerprints_differ_by_inputs() {
        assert_ne!(
            fingerprint_tts("b", 0, "en", "h1"),
            fingerprint_tts("b", 0, "en", "h2")
        );
        assert_ne!(
            fingerprint_alignment("a", "t", "dtw"),
            fingerprint_alignment("a", "t", "asr")
        );
    }
}

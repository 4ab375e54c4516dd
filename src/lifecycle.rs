//! Classifier lifecycle: lazy load, bounded wait, rate-limited retry.
//!
//! State machine (single writer, one mutex):
//!
//! ```text
//! Uninitialized --load--> Initializing --ok--> Ready
//!                              |
//!                              +--error/timeout--> DegradedPermanent
//! DegradedPermanent --backoff elapsed on acquire--> Initializing
//! Ready | DegradedPermanent | Uninitialized --force_reset--> Uninitialized --> Initializing
//! ```
//!
//! Loads run on a detached tokio task under `load_timeout`; request paths only
//! ever wait `acquire_wait` (default zero) and otherwise fall back to rules.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::classifier::{ClassifierHandle, DynLoader};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    Uninitialized,
    Initializing,
    Ready,
    DegradedPermanent,
}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModelState::Uninitialized => "uninitialized",
            ModelState::Initializing => "initializing",
            ModelState::Ready => "ready",
            ModelState::DegradedPermanent => "degraded_permanent",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecyclePolicy {
    pub load_timeout: Duration,
    pub retry_backoff: Duration,
    pub acquire_wait: Duration,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            load_timeout: Duration::from_secs(120),
            retry_backoff: Duration::from_secs(300),
            acquire_wait: Duration::ZERO,
        }
    }
}

/// Result of [`ModelLifecycleManager::acquire`].
#[derive(Clone)]
pub struct Acquired {
    pub handle: Option<ClassifierHandle>,
    pub ready: bool,
}

impl Acquired {
    fn unavailable() -> Self {
        Self {
            handle: None,
            ready: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelStatus {
    pub state: ModelState,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub load_attempts: u64,
    pub last_error: Option<String>,
    pub provider: &'static str,
}

struct Inner {
    state: ModelState,
    handle: Option<ClassifierHandle>,
    generation: u64,
    last_attempt: Option<Instant>,
    last_attempt_at: Option<DateTime<Utc>>,
    load_attempts: u64,
    last_error: Option<String>,
}

pub struct ModelLifecycleManager {
    loader: DynLoader,
    policy: LifecyclePolicy,
    inner: Mutex<Inner>,
    /// Set while a load task is in flight; at most one at a time.
    loading: AtomicBool,
    /// Bumped whenever a load settles.
    settled: watch::Sender<u64>,
}

impl ModelLifecycleManager {
    pub fn new(loader: DynLoader, policy: LifecyclePolicy) -> Arc<Self> {
        let (settled, _) = watch::channel(0);
        Arc::new(Self {
            loader,
            policy,
            inner: Mutex::new(Inner {
                state: ModelState::Uninitialized,
                handle: None,
                generation: 0,
                last_attempt: None,
                last_attempt_at: None,
                load_attempts: 0,
                last_error: None,
            }),
            loading: AtomicBool::new(false),
            settled,
        })
    }

    pub fn policy(&self) -> &LifecyclePolicy {
        &self.policy
    }

    pub fn state(&self) -> ModelState {
        self.inner.lock().state
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::Acquire)
    }

    pub fn status(&self) -> ModelStatus {
        let g = self.inner.lock();
        ModelStatus {
            state: g.state,
            last_attempt_at: g.last_attempt_at,
            load_attempts: g.load_attempts,
            last_error: g.last_error.clone(),
            provider: self.loader.name(),
        }
    }

    /// Returns the classifier if it is ready. Otherwise kicks off a load when
    /// one is due and waits at most `acquire_wait` for it.
    pub async fn acquire(self: &Arc<Self>) -> Acquired {
        if let Some(ready) = self.ready_handle() {
            return ready;
        }
        if let Some(generation) = self.try_begin_load() {
            self.spawn_load(generation);
        }
        if self.policy.acquire_wait.is_zero() {
            return Acquired::unavailable();
        }
        self.wait_settled(self.policy.acquire_wait).await;
        self.ready_handle().unwrap_or_else(Acquired::unavailable)
    }

    /// Clears a degraded state and the backoff clock, then starts a fresh
    /// load. A reset during `Initializing` joins the in-flight attempt.
    pub fn force_reset(self: &Arc<Self>) -> ModelState {
        {
            let mut g = self.inner.lock();
            if g.state == ModelState::Initializing {
                debug!(target: "model", "reset coalesced into in-flight load");
                return ModelState::Initializing;
            }
            info!(target: "model", from = %g.state, "classifier reset requested");
            g.state = ModelState::Uninitialized;
            g.handle = None;
            g.last_attempt = None;
            g.last_attempt_at = None;
            g.last_error = None;
        }
        if let Some(generation) = self.try_begin_load() {
            self.spawn_load(generation);
        }
        self.state()
    }

    /// Waits until the state leaves `Initializing` or `timeout` passes.
    pub async fn wait_settled(&self, timeout: Duration) -> ModelState {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut rx = self.settled.subscribe();
        loop {
            let state = self.state();
            if state != ModelState::Initializing {
                return state;
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                _ => return self.state(),
            }
        }
    }

    fn ready_handle(&self) -> Option<Acquired> {
        let g = self.inner.lock();
        match (&g.state, &g.handle) {
            (ModelState::Ready, Some(h)) => Some(Acquired {
                handle: Some(h.clone()),
                ready: true,
            }),
            _ => None,
        }
    }

    /// Moves to `Initializing` if a load is due. Returns the new generation.
    fn try_begin_load(&self) -> Option<u64> {
        let mut g = self.inner.lock();
        let due = match g.state {
            ModelState::Uninitialized => true,
            ModelState::DegradedPermanent => g
                .last_attempt
                .map_or(true, |t| t.elapsed() >= self.policy.retry_backoff),
            ModelState::Initializing | ModelState::Ready => false,
        };
        if !due || self.loading.swap(true, Ordering::AcqRel) {
            return None;
        }
        g.generation += 1;
        g.state = ModelState::Initializing;
        g.handle = None;
        g.last_attempt = Some(Instant::now());
        g.last_attempt_at = Some(Utc::now());
        g.load_attempts += 1;
        Some(g.generation)
    }

    fn spawn_load(self: &Arc<Self>, generation: u64) {
        let this = Arc::clone(self);
        counter!("model_load_attempts_total").increment(1);
        info!(target: "model", generation, provider = this.loader.name(), "classifier load started");

        tokio::spawn(async move {
            let started = Instant::now();
            let loader = this.loader.clone();
            // Inner task so a panicking loader surfaces as a JoinError.
            let mut task = tokio::spawn(async move { loader.load().await });
            let outcome = match tokio::time::timeout(this.policy.load_timeout, &mut task).await {
                Ok(Ok(Ok(handle))) => Ok(handle),
                Ok(Ok(Err(e))) => Err(format!("{e:#}")),
                Ok(Err(join)) => Err(format!("loader task failed: {join}")),
                Err(_) => {
                    task.abort();
                    Err(format!(
                        "load timed out after {} ms",
                        this.policy.load_timeout.as_millis()
                    ))
                }
            };
            this.finish_load(generation, outcome, started.elapsed());
        });
    }

    fn finish_load(
        &self,
        generation: u64,
        outcome: Result<ClassifierHandle, String>,
        elapsed: Duration,
    ) {
        {
            let mut g = self.inner.lock();
            if g.generation != generation {
                debug!(target: "model", generation, current = g.generation, "stale load completion ignored");
                return;
            }
            match outcome {
                Ok(handle) => {
                    g.state = ModelState::Ready;
                    g.handle = Some(handle);
                    g.last_error = None;
                    info!(target: "model", generation, elapsed_ms = elapsed.as_millis() as u64, "classifier ready");
                }
                Err(e) => {
                    counter!("model_load_failures_total").increment(1);
                    warn!(
                        target: "model",
                        generation,
                        error = %e,
                        retry_in_secs = self.policy.retry_backoff.as_secs(),
                        "classifier load failed, using rule fallback"
                    );
                    g.state = ModelState::DegradedPermanent;
                    g.handle = None;
                    g.last_error = Some(e);
                }
            }
            self.loading.store(false, Ordering::Release);
        }
        self.settled.send_modify(|n| *n = n.wrapping_add(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{ClassifierLoader, MockClassifier};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct TestLoader {
        delay: Duration,
        fail: bool,
        loads: AtomicUsize,
    }

    impl TestLoader {
        fn new(delay_ms: u64, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                delay: Duration::from_millis(delay_ms),
                fail,
                loads: AtomicUsize::new(0),
            })
        }
        fn loads(&self) -> usize {
            self.loads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ClassifierLoader for TestLoader {
        async fn load(&self) -> anyhow::Result<ClassifierHandle> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                anyhow::bail!("weights missing");
            }
            Ok(Arc::new(MockClassifier::new(0.9, 0.9)))
        }
        fn name(&self) -> &'static str {
            "test"
        }
    }

    fn policy(timeout_ms: u64, backoff_ms: u64) -> LifecyclePolicy {
        LifecyclePolicy {
            load_timeout: Duration::from_millis(timeout_ms),
            retry_backoff: Duration::from_millis(backoff_ms),
            acquire_wait: Duration::ZERO,
        }
    }

    const SETTLE: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn concurrent_acquires_share_one_load() {
        let loader = TestLoader::new(100, false);
        let m = ModelLifecycleManager::new(loader.clone(), policy(1_000, 60_000));

        let (a, b) = tokio::join!(m.acquire(), m.acquire());
        assert!(!a.ready && !b.ready);
        assert!(m.is_loading());

        assert_eq!(m.wait_settled(SETTLE).await, ModelState::Ready);
        assert_eq!(loader.loads(), 1);
        assert!(m.acquire().await.ready);
        assert_eq!(loader.loads(), 1);
        assert_eq!(m.status().load_attempts, 1);
    }

    #[tokio::test]
    async fn failure_is_not_retried_inside_backoff_window() {
        let loader = TestLoader::new(0, true);
        let m = ModelLifecycleManager::new(loader.clone(), policy(1_000, 300));

        assert!(!m.acquire().await.ready);
        assert_eq!(m.wait_settled(SETTLE).await, ModelState::DegradedPermanent);
        let st = m.status();
        assert!(st.last_error.unwrap().contains("weights missing"));
        assert!(st.last_attempt_at.is_some());

        assert!(!m.acquire().await.ready);
        assert_eq!(m.state(), ModelState::DegradedPermanent);
        assert_eq!(loader.loads(), 1);

        tokio::time::sleep(Duration::from_millis(350)).await;
        m.acquire().await;
        m.wait_settled(SETTLE).await;
        assert_eq!(loader.loads(), 2);
    }

    #[tokio::test]
    async fn slow_load_times_out_into_degraded() {
        let loader = TestLoader::new(5_000, false);
        let m = ModelLifecycleManager::new(loader, policy(50, 60_000));
        m.acquire().await;
        assert_eq!(m.wait_settled(SETTLE).await, ModelState::DegradedPermanent);
        assert!(m.status().last_error.unwrap().contains("timed out"));
        assert!(!m.is_loading());
    }

    #[tokio::test]
    async fn force_reset_retries_immediately_from_degraded() {
        let loader = TestLoader::new(0, true);
        let m = ModelLifecycleManager::new(loader.clone(), policy(1_000, 60_000));
        m.acquire().await;
        m.wait_settled(SETTLE).await;
        assert_eq!(loader.loads(), 1);

        assert_eq!(m.force_reset(), ModelState::Initializing);
        m.wait_settled(SETTLE).await;
        assert_eq!(loader.loads(), 2);
    }

    #[tokio::test]
    async fn force_reset_while_initializing_is_coalesced() {
        let loader = TestLoader::new(150, false);
        let m = ModelLifecycleManager::new(loader.clone(), policy(1_000, 60_000));
        m.acquire().await;
        assert_eq!(m.force_reset(), ModelState::Initializing);
        assert_eq!(m.wait_settled(SETTLE).await, ModelState::Ready);
        assert_eq!(loader.loads(), 1);
    }

    #[tokio::test]
    async fn force_reset_from_ready_reloads() {
        let loader = TestLoader::new(0, false);
        let m = ModelLifecycleManager::new(loader.clone(), policy(1_000, 60_000));
        m.acquire().await;
        assert_eq!(m.wait_settled(SETTLE).await, ModelState::Ready);
        m.force_reset();
        assert_eq!(m.wait_settled(SETTLE).await, ModelState::Ready);
        assert_eq!(loader.loads(), 2);
    }

    #[tokio::test]
    async fn acquire_wait_lets_fast_loads_serve_the_first_call() {
        let loader = TestLoader::new(20, false);
        let m = ModelLifecycleManager::new(
            loader,
            LifecyclePolicy {
                acquire_wait: Duration::from_millis(1_000),
                ..policy(1_000, 60_000)
            },
        );
        let got = m.acquire().await;
        assert!(got.ready);
        assert!(got.handle.is_some());
    }

    #[tokio::test]
    async fn stale_completion_cannot_overwrite_newer_state() {
        let loader = TestLoader::new(0, false);
        let m = ModelLifecycleManager::new(loader, policy(1_000, 60_000));
        m.acquire().await;
        assert_eq!(m.wait_settled(SETTLE).await, ModelState::Ready);

        m.finish_load(0, Err("old attempt".into()), Duration::ZERO);
        assert_eq!(m.state(), ModelState::Ready);
        assert!(m.status().last_error.is_none());
    }
}

//! Periodic attribute sampling into a round-robin store
//!
//! Each [`AttributeSampler`] owns one background task that moves through
//! `Created -> Probing -> Active -> Stopped`, or ends in `Failed` when the
//! attribute never yields a number within the probe timeout. The store file
//! is only created once probing succeeds.

pub mod attribute;
pub mod tracker;

pub use attribute::{AttributeReader, AttributeRef, AttributeValue};
pub use tracker::{ResourceSnapshot, ResourceTracker, TaskGuard};

use crate::config::SamplerConfig;
use crate::error::{MetricsError, Result};
use crate::storage::{RoundRobinStore, SeriesKey, SeriesSpec, SharedStore};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, OnceCell, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of a sampler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SamplerState {
    Created,
    Probing,
    Active,
    Stopped,
    Failed,
}

impl SamplerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SamplerState::Stopped | SamplerState::Failed)
    }
}

/// Invoked once when a sampler gives up
pub type FailureCallback = Arc<dyn Fn(&SeriesKey, &MetricsError) + Send + Sync>;

/// Sample counters of one sampler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SamplerStats {
    /// Samples appended to the store
    pub written: u64,
    /// Samples dropped by the minimum update interval
    pub skipped: u64,
    /// Reads that failed or returned a non-numeric value
    pub failed_reads: u64,
    /// Samples the store refused
    pub rejected: u64,
}

#[derive(Debug, Default)]
struct Counters {
    written: AtomicU64,
    skipped: AtomicU64,
    failed_reads: AtomicU64,
    rejected: AtomicU64,
}

/// Unix seconds derived from a monotonic clock anchored at activation
#[derive(Debug, Clone, Copy)]
struct SampleClock {
    base_secs: u64,
    origin: Instant,
}

impl SampleClock {
    fn start() -> Self {
        Self {
            base_secs: chrono::Utc::now().timestamp().max(0) as u64,
            origin: Instant::now(),
        }
    }

    fn now_secs(&self) -> u64 {
        self.base_secs + self.origin.elapsed().as_secs()
    }
}

enum ProbeOutcome {
    Ready,
    Cancelled,
    Failed(MetricsError),
}

struct SamplerShared {
    key: SeriesKey,
    attribute: AttributeRef,
    base_dir: PathBuf,
    spec: SeriesSpec,
    config: SamplerConfig,
    state: watch::Sender<SamplerState>,
    store: OnceCell<SharedStore>,
    counters: Counters,
    tracker: Arc<ResourceTracker>,
    on_failure: Option<FailureCallback>,
    cancel: CancellationToken,
}

/// Polls one attribute and appends it to one store
pub struct AttributeSampler {
    shared: Arc<SamplerShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AttributeSampler {
    pub fn new(
        key: SeriesKey,
        attribute: AttributeRef,
        base_dir: impl Into<PathBuf>,
        spec: SeriesSpec,
        config: SamplerConfig,
        tracker: Arc<ResourceTracker>,
    ) -> Self {
        let (state, _) = watch::channel(SamplerState::Created);
        Self {
            shared: Arc::new(SamplerShared {
                key,
                attribute,
                base_dir: base_dir.into(),
                spec,
                config,
                state,
                store: OnceCell::new(),
                counters: Counters::default(),
                tracker,
                on_failure: None,
                cancel: CancellationToken::new(),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Report probing or activation failure through `callback`. Must be set
    /// before `start`.
    pub fn with_failure_callback(mut self, callback: FailureCallback) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.on_failure = Some(callback);
        }
        self
    }

    /// Spawn the sampling task
    pub fn start(&self) -> Result<()> {
        let mut handle = self.handle.lock();
        if handle.is_some() || self.state() != SamplerState::Created {
            return Err(MetricsError::InternalError {
                message: format!("sampler for {} was already started", self.shared.key),
                component: Some("sampler".to_string()),
                source: None,
            });
        }

        let guard = self.shared.tracker.task_started();
        let shared = Arc::clone(&self.shared);
        *handle = Some(tokio::spawn(async move {
            let _guard = guard;
            shared.run().await;
        }));
        Ok(())
    }

    /// Cancel the task and wait for it to finish. No append happens after
    /// this returns. Safe to call in any state and more than once.
    pub async fn stop(&self) {
        self.shared.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Sampler task for {} failed: {}", self.shared.key, e);
            }
        }
        let changed = self.shared.state.send_if_modified(|state| {
            if *state == SamplerState::Failed || *state == SamplerState::Stopped {
                false
            } else {
                *state = SamplerState::Stopped;
                true
            }
        });
        if changed {
            debug!("Sampler for {} stopped", self.shared.key);
        }
    }

    /// Close the store after the sampler has been stopped
    pub async fn close_store(&self) -> Result<()> {
        if let Some(store) = self.shared.store.get() {
            let mut store = store.write().await;
            if !store.is_closed() {
                store.close().await?;
                self.shared.tracker.store_closed();
            }
        }
        Ok(())
    }

    pub fn key(&self) -> &SeriesKey {
        &self.shared.key
    }

    pub fn state(&self) -> SamplerState {
        *self.shared.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<SamplerState> {
        self.shared.state.subscribe()
    }

    /// The backing store, once the sampler has activated
    pub fn store(&self) -> Option<SharedStore> {
        self.shared.store.get().cloned()
    }

    pub fn stats(&self) -> SamplerStats {
        let counters = &self.shared.counters;
        SamplerStats {
            written: counters.written.load(Ordering::Relaxed),
            skipped: counters.skipped.load(Ordering::Relaxed),
            failed_reads: counters.failed_reads.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for AttributeSampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeSampler")
            .field("key", &self.shared.key)
            .field("attribute", &self.shared.attribute.name)
            .field("state", &self.state())
            .finish()
    }
}

impl SamplerShared {
    async fn run(&self) {
        self.set_state(SamplerState::Probing);

        match self.probe().await {
            ProbeOutcome::Ready => {}
            ProbeOutcome::Cancelled => return,
            ProbeOutcome::Failed(err) => {
                self.fail(err);
                return;
            }
        }
        if self.cancel.is_cancelled() {
            return;
        }

        let store = match RoundRobinStore::open_or_create(&self.base_dir, &self.key, self.spec.clone()).await {
            Ok(store) => store,
            Err(err) => {
                self.fail(err);
                return;
            }
        };
        let store = Arc::new(RwLock::new(store));
        if self.store.set(Arc::clone(&store)).is_err() {
            error!("Sampler for {} activated twice", self.key);
            return;
        }
        self.tracker.store_opened();

        self.set_state(SamplerState::Active);
        info!("Sampling {} from attribute {}", self.key, self.attribute.name);
        self.sample_loop(store).await;
    }

    fn set_state(&self, next: SamplerState) {
        self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
    }

    fn fail(&self, err: MetricsError) {
        error!("Sampler for {} failed: {}", self.key, err);
        self.set_state(SamplerState::Failed);
        if let Some(callback) = &self.on_failure {
            callback(&self.key, &err);
        }
    }

    async fn probe(&self) -> ProbeOutcome {
        let probe_timeout = self.config.probe_timeout();
        let deadline = Instant::now() + probe_timeout;
        let mut attempts = 0u32;
        let mut last_error = None;

        loop {
            attempts += 1;
            let attempt = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return ProbeOutcome::Cancelled,
                result = timeout_at(deadline, self.attribute.read()) => result,
            };

            match attempt {
                Ok(Ok(value)) => match value.as_f64(&self.attribute.name) {
                    Ok(_) => {
                        debug!(
                            "Attribute {} of {} ready after {} attempt(s)",
                            self.attribute.name, self.key, attempts
                        );
                        return ProbeOutcome::Ready;
                    }
                    Err(e) => last_error = Some(e),
                },
                Ok(Err(e)) => last_error = Some(e),
                Err(_) => break,
            }

            if Instant::now() + self.config.probe_interval() > deadline {
                break;
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return ProbeOutcome::Cancelled,
                _ = sleep(self.config.probe_interval()) => {}
            }
        }

        let cause = last_error.map(|e| format!(": {e}")).unwrap_or_default();
        ProbeOutcome::Failed(MetricsError::AttributeUnavailable {
            attribute: self.attribute.name.clone(),
            message: format!(
                "no numeric value after {} attempt(s) in {:?}{}",
                attempts, probe_timeout, cause
            ),
        })
    }

    async fn sample_loop(&self, store: SharedStore) {
        let clock = SampleClock::start();
        let mut last_appended = store.read().await.last_update();
        let mut ticker = interval(self.config.period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = timeout(self.config.period(), self.attribute.read()) => result,
            };
            let value = match read {
                Ok(result) => result.and_then(|v| v.as_f64(&self.attribute.name)),
                Err(_) => Err(MetricsError::AttributeUnavailable {
                    attribute: self.attribute.name.clone(),
                    message: "read timed out".to_string(),
                }),
            };

            let now = clock.now_secs();
            self.record(&store, now, value, &mut last_appended).await;
        }

        debug!("Sampling loop for {} exited", self.key);
    }

    async fn record(
        &self,
        store: &SharedStore,
        now: u64,
        value: Result<f64>,
        last_appended: &mut Option<u64>,
    ) {
        let value = match value {
            Ok(value) => value,
            Err(e) => {
                self.counters.failed_reads.fetch_add(1, Ordering::Relaxed);
                warn!("Skipping sample of {}: {}", self.key, e);
                return;
            }
        };

        if let Some(last) = *last_appended {
            if now.saturating_sub(last) < self.config.min_update_interval_secs {
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                debug!("Throttled sample of {} at {}", self.key, now);
                return;
            }
        }

        let appended = store.write().await.append(now, value).await;
        match appended {
            Ok(()) => {
                self.counters.written.fetch_add(1, Ordering::Relaxed);
                *last_appended = Some(now);
            }
            Err(e) if e.is_sample_local() => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!("Dropped sample of {}: {}", self.key, e);
            }
            Err(e) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                error!("Failed to record sample of {}: {}", self.key, e);
            }
        }
    }
}

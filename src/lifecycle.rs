//! Entity lifecycle events to registry operations
//!
//! Entities are tracked by a stable [`EntityHandle`] together with the
//! external identifier last seen for them. A changed identifier is a rename.
//! Metric creation runs on a bounded worker pool so registration never waits
//! on store I/O.

use crate::error::{MetricsError, Result};
use crate::metrics::{MetricRegistry, StandardMetric};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Stable identity of an entity instance, independent of its external id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityHandle(Uuid);

impl EntityHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EntityHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One entity's part in a completed query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceOutcome {
    pub entity_id: String,
    pub exception: bool,
    pub result_count: u64,
}

/// Outcome of creating an entity's standard metrics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CreationReport {
    pub entity_id: String,
    pub created: Vec<String>,
    /// `(metric, error)` for each metric that could not be created
    pub failed: Vec<(String, String)>,
}

impl CreationReport {
    /// Some metrics are missing; the entity itself is still registered
    pub fn is_degraded(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Metric creation still running in the background
#[derive(Debug, Clone)]
pub struct PendingCreation {
    entity_id: String,
    done: watch::Receiver<Option<CreationReport>>,
}

impl PendingCreation {
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn is_finished(&self) -> bool {
        self.done.borrow().is_some()
    }

    /// Wait for every creation to finish
    pub async fn wait(mut self) -> CreationReport {
        match self.done.wait_for(Option::is_some).await {
            Ok(report) => report.clone().unwrap_or_default(),
            Err(_) => CreationReport {
                entity_id: self.entity_id.clone(),
                created: Vec::new(),
                failed: vec![("*".to_string(), "creation task aborted".to_string())],
            },
        }
    }
}

/// Per-entity slot. Holding its lock serializes every event for one handle.
#[derive(Debug, Default)]
struct EntityState {
    /// `None` once the entity is removed, or before its first creation ran
    entity_id: Option<String>,
}

type EntitySlot = Arc<Mutex<EntityState>>;

/// Translates entity events into registry calls
pub struct EntityLifecycleBridge {
    registry: Arc<MetricRegistry>,
    entities: DashMap<EntityHandle, EntitySlot>,
    identities: Arc<DashMap<EntityHandle, String>>,
    pending: DashMap<EntityHandle, PendingCreation>,
    workers: Arc<Semaphore>,
}

impl EntityLifecycleBridge {
    pub fn new(registry: Arc<MetricRegistry>, worker_pool_size: usize) -> Self {
        Self {
            registry,
            entities: DashMap::new(),
            identities: Arc::new(DashMap::new()),
            pending: DashMap::new(),
            workers: Arc::new(Semaphore::new(worker_pool_size.max(1))),
        }
    }

    pub fn registry(&self) -> &Arc<MetricRegistry> {
        &self.registry
    }

    /// Current external id of a tracked entity
    pub fn entity_id(&self, handle: EntityHandle) -> Option<String> {
        self.identities.get(&handle).map(|id| id.clone())
    }

    pub fn tracked_entities(&self) -> usize {
        self.identities.len()
    }

    fn slot(&self, handle: EntityHandle) -> EntitySlot {
        Arc::clone(self.entities.entry(handle).or_default().value())
    }

    /// Wait for the creation started by the latest `on_entity_added`
    async fn settle(&self, handle: EntityHandle) {
        let pending = self.pending.get(&handle).map(|p| p.clone());
        if let Some(pending) = pending {
            pending.wait().await;
        }
    }

    /// Start creating the standard metrics of a new entity. Returns
    /// immediately; the result can be awaited through the returned handle.
    /// Re-adding a tracked handle under another id moves its series first.
    pub fn on_entity_added(&self, handle: EntityHandle, entity_id: &str) -> PendingCreation {
        let slot = self.slot(handle);
        let (tx, rx) = watch::channel(None);
        let pending = PendingCreation {
            entity_id: entity_id.to_string(),
            done: rx,
        };
        self.pending.insert(handle, pending.clone());

        let registry = Arc::clone(&self.registry);
        let workers = Arc::clone(&self.workers);
        let identities = Arc::clone(&self.identities);
        let id = entity_id.to_string();
        tokio::spawn(async move {
            let mut state = slot.lock().await;
            let mut report = CreationReport {
                entity_id: id.clone(),
                ..CreationReport::default()
            };

            if let Some(previous) = state.entity_id.as_deref().filter(|p| *p != id) {
                debug!("Entity {} re-added as {} (was {})", handle, id, previous);
                if let Err(e) = registry.rename_entity(previous, &id).await {
                    warn!("Failed to move series of {} to {}: {}", previous, id, e);
                    report.failed.push(("*".to_string(), e.to_string()));
                }
            }

            let tasks: Vec<_> = StandardMetric::ALL
                .into_iter()
                .map(|metric| {
                    let registry = Arc::clone(&registry);
                    let workers = Arc::clone(&workers);
                    let entity_id = id.clone();
                    tokio::spawn(async move {
                        let created = match workers.acquire_owned().await {
                            Ok(_permit) => {
                                let (min, max) = metric.bounds();
                                let (name, kind) = (metric.name(), metric.kind());
                                registry
                                    .ensure_metric(&entity_id, name, kind, min, max)
                                    .await
                                    .map(|_| ())
                            }
                            Err(e) => Err(MetricsError::InternalError {
                                message: format!("worker pool closed: {e}"),
                                component: Some("lifecycle".to_string()),
                                source: None,
                            }),
                        };
                        (metric, created)
                    })
                })
                .collect();

            for task in tasks {
                match task.await {
                    Ok((metric, Ok(()))) => report.created.push(metric.name().to_string()),
                    Ok((metric, Err(e))) => {
                        warn!(
                            "Could not create {} for entity {}: {}",
                            metric, report.entity_id, e
                        );
                        report.failed.push((metric.name().to_string(), e.to_string()));
                    }
                    Err(e) => report.failed.push(("*".to_string(), e.to_string())),
                }
            }

            state.entity_id = Some(id.clone());
            identities.insert(handle, id);
            if report.is_degraded() {
                warn!("Entity {} registered with degraded metrics", report.entity_id);
            } else {
                debug!("Metrics for entity {} created", report.entity_id);
            }
            tx.send_replace(Some(report));
        });

        pending
    }

    /// Delete the entity's metrics once any creation still running for it
    /// has finished. Unknown handles are ignored.
    pub async fn on_entity_removed(&self, handle: EntityHandle) -> Result<()> {
        self.settle(handle).await;
        let Some(slot) = self.entities.get(&handle).map(|s| Arc::clone(s.value())) else {
            debug!("Removal of untracked entity {}", handle);
            return Ok(());
        };

        let mut state = slot.lock().await;
        let removed = state.entity_id.take();
        self.identities.remove(&handle);
        self.pending.remove_if(&handle, |_, p| p.is_finished());

        let mut first_error = None;
        if let Some(entity_id) = &removed {
            for metric in StandardMetric::ALL {
                if let Err(e) = self.registry.delete(entity_id, metric.name()).await {
                    warn!("Failed to delete {} of entity {}: {}", metric, entity_id, e);
                    first_error.get_or_insert(e);
                }
            }
            info!("Entity {} ({}) removed", entity_id, handle);
        } else {
            debug!("Entity {} already removed", handle);
        }
        drop(state);

        // map plus the local clone: nobody else is waiting on this slot
        self.entities.remove_if(&handle, |_, s| Arc::strong_count(s) <= 2);
        first_error.map_or(Ok(()), Err)
    }

    /// Compare the entity's current external id with the one last seen; on
    /// a change, move its series to the new id. Returns whether a rename
    /// happened. Untracked or removed handles are ignored.
    pub async fn on_entity_observed(&self, handle: EntityHandle, current_id: &str) -> Result<bool> {
        self.settle(handle).await;
        let Some(slot) = self.entities.get(&handle).map(|s| Arc::clone(s.value())) else {
            debug!("Observation of untracked entity {}", handle);
            return Ok(false);
        };

        let mut state = slot.lock().await;
        let previous = match state.entity_id.as_deref() {
            Some(id) if id == current_id => return Ok(false),
            Some(id) => id.to_string(),
            None => {
                debug!("Observation of removed entity {}", handle);
                return Ok(false);
            }
        };

        for metric in StandardMetric::ALL {
            self.registry
                .rename(metric.name(), &previous, current_id)
                .await?;
        }
        // series defined beyond the standard set
        let moved = StandardMetric::ALL.len()
            + self.registry.rename_entity(&previous, current_id).await?;
        state.entity_id = Some(current_id.to_string());
        self.identities.insert(handle, current_id.to_string());
        info!(
            "Entity {} renamed from {} to {} ({} series)",
            handle, previous, current_id, moved
        );
        Ok(true)
    }

    /// Record one completed query for every participating entity
    pub async fn on_query_completed(&self, outcomes: &[SourceOutcome]) -> Result<()> {
        let mut first_error = None;
        for outcome in outcomes {
            let id = outcome.entity_id.as_str();
            let mut updates = vec![(StandardMetric::Queries, 1)];
            if outcome.exception {
                updates.push((StandardMetric::Exceptions, 1));
            } else {
                let count = i64::try_from(outcome.result_count).unwrap_or(i64::MAX);
                updates.push((StandardMetric::TotalResults, count));
            }

            for (metric, delta) in updates {
                if let Err(e) = self.registry.update(id, metric.name(), delta).await {
                    warn!("Failed to record {} for entity {}: {}", metric, id, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

//! Load, resolve, plan and persist one tracking hit.
//!
//! The store's conditional upsert is the only concurrency guard: when another
//! request for the same visitor wins the race, the whole sequence restarts
//! from a fresh load, up to `max_attempts` times.

use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info_span, instrument, warn, Instrument};

use crate::clock::{Clock, SystemClock};
use crate::error::{Result, StoreError, TrackerError};
use crate::planner::{MutationPlan, MutationPlanner, PlanMode};
use crate::resolver::{VisitOutcome, VisitResolver};
use crate::settings::Settings;
use crate::signature::{TrackingHit, VisitSignature};
use crate::store::{StoreResult, VisitStore};

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub max_attempts: u32,
    /// Applies to each store call, not to in-process work.
    pub store_timeout: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            store_timeout: Duration::from_secs(2),
        }
    }
}

/// What happened to a persisted hit.
#[derive(Debug, Clone, Serialize)]
pub struct TrackOutcome {
    pub visitor_key: String,
    pub visit_id: Option<String>,
    pub outcome: VisitOutcome,
    pub plan: MutationPlan,
    /// Row version after the write.
    pub version: u64,
    pub attempts: u32,
}

/// Counters since the tracker was built
#[derive(Debug, Default)]
struct TrackerCounters {
    hits: AtomicU64,
    new_visits: AtomicU64,
    continued_visits: AtomicU64,
    conflicts: AtomicU64,
    dropped_hits: AtomicU64,
    store_failures: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrackerStats {
    pub hits: u64,
    pub new_visits: u64,
    pub continued_visits: u64,
    pub conflicts: u64,
    pub dropped_hits: u64,
    pub store_failures: u64,
}

#[derive(Debug)]
pub struct Tracker {
    store: Arc<dyn VisitStore>,
    resolver: VisitResolver,
    clock: Arc<dyn Clock>,
    config: TrackerConfig,
    counters: TrackerCounters,
}

impl Tracker {
    pub fn new(store: Arc<dyn VisitStore>, resolver: VisitResolver) -> Self {
        Self {
            store,
            resolver,
            clock: Arc::new(SystemClock),
            config: TrackerConfig::default(),
            counters: TrackerCounters::default(),
        }
    }

    pub fn from_settings(settings: &Settings, store: Arc<dyn VisitStore>) -> anyhow::Result<Self> {
        let resolver = VisitResolver::new(settings.schema(), settings.resolver_config()?);
        Ok(Self::new(store, resolver).with_config(settings.tracker_config()))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: TrackerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &Arc<dyn VisitStore> {
        &self.store
    }

    /// Tracks a raw hit; the tracker clock stands in for a missing timestamp.
    pub async fn track(&self, hit: &TrackingHit) -> Result<TrackOutcome> {
        let signature = VisitSignature::from_hit(hit, self.clock.as_ref())?;
        self.track_signature(&signature).await
    }

    #[instrument(skip(self, signature), fields(visitor = signature.visitor_key()))]
    pub async fn track_signature(&self, signature: &VisitSignature) -> Result<TrackOutcome> {
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let span = info_span!("attempt", attempt);
            match self.attempt(signature, attempt).instrument(span).await {
                Ok(outcome) => {
                    let counter = if outcome.outcome.is_new() {
                        &self.counters.new_visits
                    } else {
                        &self.counters.continued_visits
                    };
                    counter.fetch_add(1, Ordering::Relaxed);
                    return Ok(outcome);
                }
                Err(AttemptError::Conflict(err)) => {
                    self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
                    warn!("Visit row changed underneath us ({}), attempt {}/{}", err, attempt, max_attempts);
                }
                Err(AttemptError::Fatal(err)) => {
                    if matches!(err, TrackerError::StoreUnavailable(_)) {
                        self.counters.store_failures.fetch_add(1, Ordering::Relaxed);
                    }
                    return Err(err);
                }
            }
        }

        self.counters.dropped_hits.fetch_add(1, Ordering::Relaxed);
        error!("Dropping hit after {} conflicting attempts", max_attempts);
        Err(TrackerError::ConcurrentModification {
            attempts: max_attempts,
        })
    }

    async fn attempt(&self, signature: &VisitSignature, attempt: u32) -> std::result::Result<TrackOutcome, AttemptError> {
        let visitor_key = signature.visitor_key();

        let last_visit = self
            .with_timeout("load_last_visit", self.store.load_last_visit(visitor_key))
            .await?;
        let resolved = self.resolver.resolve(signature, last_visit)?;
        let plan = MutationPlanner::plan_for(&resolved);

        let version = if plan.mode == PlanMode::Update && plan.is_empty() {
            debug!("Nothing to persist");
            resolved.expected_version.unwrap_or_default()
        } else {
            self.with_timeout(
                "upsert_visit",
                self.store.upsert_visit(visitor_key, &plan, resolved.expected_version),
            )
            .await?
        };

        debug!(outcome = %resolved.outcome, changes = plan.len(), version, "Hit persisted");

        Ok(TrackOutcome {
            visitor_key: visitor_key.to_string(),
            visit_id: plan.visit_id.clone(),
            outcome: resolved.outcome,
            plan,
            version,
            attempts: attempt,
        })
    }

    /// A timed-out upsert is reported as `StoreUnavailable` even though the
    /// write may still land; see [`VisitStore::upsert_visit`].
    async fn with_timeout<T>(
        &self,
        operation: &str,
        call: impl Future<Output = StoreResult<T>>,
    ) -> StoreResult<T> {
        match tokio::time::timeout(self.config.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Unavailable(format!(
                "{} timed out after {:?}",
                operation, self.config.store_timeout
            ))),
        }
    }

    pub fn stats(&self) -> TrackerStats {
        let c = &self.counters;
        TrackerStats {
            hits: c.hits.load(Ordering::Relaxed),
            new_visits: c.new_visits.load(Ordering::Relaxed),
            continued_visits: c.continued_visits.load(Ordering::Relaxed),
            conflicts: c.conflicts.load(Ordering::Relaxed),
            dropped_hits: c.dropped_hits.load(Ordering::Relaxed),
            store_failures: c.store_failures.load(Ordering::Relaxed),
        }
    }
}

/// Separates retryable conflicts from everything that ends the hit.
enum AttemptError {
    Conflict(StoreError),
    Fatal(TrackerError),
}

impl From<StoreError> for AttemptError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConcurrentModification { .. } => AttemptError::Conflict(err),
            StoreError::Unavailable(_) => AttemptError::Fatal(err.into()),
        }
    }
}

impl From<TrackerError> for AttemptError {
    fn from(err: TrackerError) -> Self {
        AttemptError::Fatal(err)
    }
}

/*!
Visit-row stores with optimistic concurrency:

* **InMemoryVisitStore** – sharded in-process map (tests, single process).
* **SledVisitStore** – embedded persistent tree (CLI, single node).

Each visitor owns one row: the columns of their most recent visit plus a
version number. Every successful write bumps the version; a write whose
expected version does not match the stored one fails with
[`StoreError::ConcurrentModification`] and leaves the row untouched.
*/
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::error::StoreError;
use crate::planner::{MutationPlan, PlanMode};
use crate::properties::Properties;
use crate::settings::{StoreBackend, StoreSettings};

pub mod memory;
pub mod sled_store;

pub use memory::InMemoryVisitStore;
pub use sled_store::SledVisitStore;

/// Last known visit of a visitor, as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitRow {
    pub visit_id: String,
    pub version: u64,
    pub columns: Properties,
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait VisitStore: Send + Sync + std::fmt::Debug {
    /// The visitor's last visit, or `None` for an unknown visitor.
    async fn load_last_visit(&self, visitor_key: &str) -> StoreResult<Option<VisitRow>>;

    /// Applies `plan` to the visitor's row if its version still equals
    /// `expected_version` (`None`: the visitor must have no row yet).
    /// Returns the row's new version.
    ///
    /// A caller that abandons this future (for example on a timeout) learns
    /// nothing about the write: it may still commit, since blocking backends
    /// keep running once started. Re-sending the same hit after such a
    /// failure can count its action twice.
    async fn upsert_visit(
        &self,
        visitor_key: &str,
        plan: &MutationPlan,
        expected_version: Option<u64>,
    ) -> StoreResult<u64>;
}

/// Opens the store selected by `settings`.
pub fn open(settings: &StoreSettings) -> StoreResult<Arc<dyn VisitStore>> {
    match settings.backend {
        StoreBackend::Memory => {
            info!("Using in-memory visit store");
            Ok(Arc::new(InMemoryVisitStore::new()))
        }
        StoreBackend::Sled => {
            let store = SledVisitStore::open(&settings.path)?.with_flush_on_write(settings.flush_on_write);
            Ok(Arc::new(store))
        }
    }
}

/// Computes the row that results from applying `plan` to `current`.
///
/// Shared by the store implementations so that version checks and merge rules
/// are identical; callers are responsible for making the read-check-write
/// sequence atomic.
pub(crate) fn next_row(
    current: Option<&VisitRow>,
    plan: &MutationPlan,
    expected_version: Option<u64>,
) -> StoreResult<Option<VisitRow>> {
    let actual = current.map(|row| row.version);
    if actual != expected_version {
        return Err(StoreError::ConcurrentModification {
            expected: expected_version,
            actual,
        });
    }

    match (plan.mode, current) {
        (PlanMode::Update, None) => Err(StoreError::ConcurrentModification {
            expected: expected_version,
            actual: None,
        }),
        (PlanMode::Update, Some(row)) => {
            if plan.visit_id.as_deref().is_some_and(|id| id != row.visit_id) {
                return Err(StoreError::ConcurrentModification {
                    expected: expected_version,
                    actual,
                });
            }
            if plan.is_empty() {
                return Ok(None);
            }
            let mut columns = row.columns.clone();
            plan.apply_to(&mut columns);
            Ok(Some(VisitRow {
                visit_id: row.visit_id.clone(),
                version: row.version + 1,
                columns,
            }))
        }
        (PlanMode::Insert, _) => {
            let visit_id = plan.visit_id.clone().ok_or_else(|| {
                StoreError::Unavailable("insert plan without a visit id".to_string())
            })?;
            let mut columns = Properties::new();
            plan.apply_to(&mut columns);
            Ok(Some(VisitRow {
                visit_id,
                // Versions keep counting across visits so a stale writer from
                // the previous visit can never match again.
                version: actual.map_or(1, |v| v + 1),
                columns,
            }))
        }
    }
}

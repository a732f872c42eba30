use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, instrument};

use super::{next_row, StoreResult, VisitRow, VisitStore};
use crate::planner::MutationPlan;

/// Visit rows kept in a sharded map. The entry lock of a visitor's shard
/// makes the version check and the write one atomic step.
#[derive(Debug, Default)]
pub struct InMemoryVisitStore {
    rows: DashMap<String, VisitRow>,
}

impl InMemoryVisitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of known visitors.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Stores `row` unconditionally; test and import helper.
    pub fn put(&self, visitor_key: &str, row: VisitRow) {
        self.rows.insert(visitor_key.to_string(), row);
    }
}

#[async_trait]
impl VisitStore for InMemoryVisitStore {
    async fn load_last_visit(&self, visitor_key: &str) -> StoreResult<Option<VisitRow>> {
        Ok(self.rows.get(visitor_key).map(|row| row.value().clone()))
    }

    #[instrument(skip(self, plan), fields(mode = ?plan.mode, changes = plan.len()))]
    async fn upsert_visit(
        &self,
        visitor_key: &str,
        plan: &MutationPlan,
        expected_version: Option<u64>,
    ) -> StoreResult<u64> {
        match self.rows.entry(visitor_key.to_string()) {
            Entry::Occupied(mut occupied) => {
                match next_row(Some(occupied.get()), plan, expected_version)? {
                    Some(row) => {
                        let version = row.version;
                        occupied.insert(row);
                        debug!("Visitor row updated to version {}", version);
                        Ok(version)
                    }
                    None => Ok(occupied.get().version),
                }
            }
            Entry::Vacant(vacant) => match next_row(None, plan, expected_version)? {
                Some(row) => {
                    let version = row.version;
                    vacant.insert(row);
                    debug!("Visitor row created");
                    Ok(version)
                }
                // next_row never yields a no-op without an existing row.
                None => Ok(0),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::planner::PlanMode;
    use crate::value::AttributeValue;

    fn plan(mode: PlanMode, visit_id: &str, actions: i64) -> MutationPlan {
        MutationPlan {
            visit_id: Some(visit_id.to_string()),
            mode,
            changes: vec![("visit_total_actions".to_string(), AttributeValue::Integer(actions))],
        }
    }

    #[tokio::test]
    async fn test_unknown_visitor_loads_none() {
        let store = InMemoryVisitStore::new();
        assert_eq!(store.load_last_visit("nobody").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_insert_then_update() {
        let store = InMemoryVisitStore::new();
        let v1 = store.upsert_visit("k", &plan(PlanMode::Insert, "a", 1), None).await.unwrap();
        let v2 = store.upsert_visit("k", &plan(PlanMode::Update, "a", 2), Some(v1)).await.unwrap();
        assert_eq!((v1, v2), (1, 2));

        let row = store.load_last_visit("k").await.unwrap().unwrap();
        assert_eq!(row.columns.get("visit_total_actions"), Some(&AttributeValue::Integer(2)));
    }

    #[tokio::test]
    async fn test_stale_version_rejected_and_row_untouched() {
        let store = InMemoryVisitStore::new();
        store.upsert_visit("k", &plan(PlanMode::Insert, "a", 1), None).await.unwrap();
        store.upsert_visit("k", &plan(PlanMode::Update, "a", 2), Some(1)).await.unwrap();

        let err = store
            .upsert_visit("k", &plan(PlanMode::Update, "a", 7), Some(1))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::ConcurrentModification { expected: Some(1), actual: Some(2) }
        );
        let row = store.load_last_visit("k").await.unwrap().unwrap();
        assert_eq!(row.columns.get("visit_total_actions"), Some(&AttributeValue::Integer(2)));
    }
}

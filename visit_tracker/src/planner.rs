//! Turns a [`PropertyStore`] into the column writes that persist it.

use serde::{Deserialize, Serialize};

use crate::properties::{Properties, PropertyStore};
use crate::resolver::ResolvedVisit;
use crate::schema::{columns, VisitSchema};
use crate::value::AttributeValue;

/// Whether the plan creates the visit row or patches the existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanMode {
    /// Replace the visitor's row with a new visit.
    Insert,
    /// Patch the listed columns of the visitor's current visit.
    Update,
}

/// Ordered column writes for one visit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationPlan {
    pub visit_id: Option<String>,
    pub mode: PlanMode,
    pub changes: Vec<(String, AttributeValue)>,
}

impl MutationPlan {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn get(&self, field: &str) -> Option<&AttributeValue> {
        self.changes
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.changes.iter().map(|(name, _)| name.as_str())
    }

    /// Writes the plan's changes over `row`. Insert plans start from empty.
    pub fn apply_to(&self, row: &mut Properties) {
        if self.mode == PlanMode::Insert {
            row.clear();
        }
        for (name, value) in &self.changes {
            row.insert(name.clone(), value.clone());
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MutationPlanner;

impl MutationPlanner {
    /// Columns of `current` that differ from `original`, in schema priority
    /// order. A column missing from `original` always counts as changed.
    pub fn plan(store: &PropertyStore) -> MutationPlan {
        let original = store.original();
        let changes = store
            .current()
            .iter()
            .filter(|(name, value)| original.get(name.as_str()) != Some(*value))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        build(store, PlanMode::Update, changes)
    }

    /// Every column of `current`, in schema priority order.
    pub fn plan_insert(store: &PropertyStore) -> MutationPlan {
        let changes = store
            .current()
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        build(store, PlanMode::Insert, changes)
    }

    /// Insert plan for a new visit, diff plan for a continued one.
    pub fn plan_for(resolved: &ResolvedVisit) -> MutationPlan {
        if resolved.outcome.is_new() {
            Self::plan_insert(&resolved.properties)
        } else {
            Self::plan(&resolved.properties)
        }
    }
}

fn build(store: &PropertyStore, mode: PlanMode, mut changes: Vec<(String, AttributeValue)>) -> MutationPlan {
    sort_by_priority(store.schema(), &mut changes);
    let visit_id = store
        .get(columns::IDVISIT, false)
        .and_then(|v| v.as_str())
        .map(str::to_string);

    MutationPlan {
        visit_id,
        mode,
        changes,
    }
}

fn sort_by_priority(schema: &VisitSchema, changes: &mut [(String, AttributeValue)]) {
    // Ties only happen for unknown names, which the store never admits.
    changes.sort_by(|(a, _), (b, _)| schema.priority(a).cmp(&schema.priority(b)).then_with(|| a.cmp(b)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn loaded() -> PropertyStore {
        let mut row = Properties::new();
        row.insert(columns::IDVISIT.to_string(), "v1".into());
        row.insert(columns::TOTAL_ACTIONS.to_string(), AttributeValue::Integer(2));
        row.insert(columns::EXIT_URL.to_string(), "/a".into());
        PropertyStore::with_properties(Arc::new(VisitSchema::default()), row).unwrap()
    }

    #[test]
    fn test_unmodified_store_plans_nothing() {
        let store = loaded();
        let plan = MutationPlanner::plan(&store);
        assert!(plan.is_empty());
        assert_eq!(plan.mode, PlanMode::Update);
        assert_eq!(plan.visit_id.as_deref(), Some("v1"));
        assert_eq!(MutationPlanner::plan(&store), plan);
    }

    #[test]
    fn test_plan_orders_by_schema_priority() {
        let mut store = loaded();
        store.set("custom_dimension_1", "gold".into(), false).unwrap();
        store.set(columns::EXIT_URL, "/b".into(), false).unwrap();
        store.set(columns::TOTAL_ACTIONS, AttributeValue::Integer(3), false).unwrap();

        let plan = MutationPlanner::plan(&store);
        let fields: Vec<&str> = plan.fields().collect();
        assert_eq!(fields, vec![columns::TOTAL_ACTIONS, columns::EXIT_URL, "custom_dimension_1"]);
    }

    #[test]
    fn test_rewriting_same_value_is_not_a_change() {
        let mut store = loaded();
        store.set(columns::EXIT_URL, "/a".into(), false).unwrap();
        assert!(MutationPlanner::plan(&store).is_empty());
    }

    #[test]
    fn test_insert_plan_contains_everything() {
        let store = loaded();
        let plan = MutationPlanner::plan_insert(&store);
        assert_eq!(plan.mode, PlanMode::Insert);
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.fields().next(), Some(columns::IDVISIT));
    }

    #[test]
    fn test_apply_update_and_insert() {
        let mut store = loaded();
        store.set(columns::TOTAL_ACTIONS, AttributeValue::Integer(9), false).unwrap();
        let mut row = store.snapshot(true);

        MutationPlanner::plan(&store).apply_to(&mut row);
        assert_eq!(row.get(columns::TOTAL_ACTIONS), Some(&AttributeValue::Integer(9)));
        assert_eq!(row.len(), 3);

        let mut fresh = PropertyStore::new(store.schema().clone());
        fresh.set(columns::IDVISIT, "v2".into(), true).unwrap();
        MutationPlanner::plan_insert(&fresh).apply_to(&mut row);
        assert_eq!(row.len(), 1);
    }
}

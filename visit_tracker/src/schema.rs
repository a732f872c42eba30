//! The fixed set of columns a visit row may carry.
//!
//! Column order in the schema is the priority order used when a mutation plan
//! is built, so plans are reproducible regardless of write order.

use std::collections::HashMap;

use crate::error::{Result, TrackerError};
use crate::value::{AttributeValue, ValueKind};

/// Column names of the built-in visit columns.
pub mod columns {
    pub const IDVISIT: &str = "idvisit";
    pub const IDVISITOR: &str = "idvisitor";
    pub const IDSITE: &str = "idsite";
    pub const FIRST_ACTION_TIME: &str = "visit_first_action_time";
    pub const LAST_ACTION_TIME: &str = "visit_last_action_time";
    pub const TOTAL_ACTIONS: &str = "visit_total_actions";
    pub const TOTAL_EVENTS: &str = "visit_total_events";
    pub const TOTAL_TIME: &str = "visit_total_time";
    pub const VISITOR_RETURNING: &str = "visitor_returning";
    pub const VISITOR_COUNT_VISITS: &str = "visitor_count_visits";
    pub const SECONDS_SINCE_LAST: &str = "visitor_seconds_since_last";
    pub const ENTRY_URL: &str = "visit_entry_url";
    pub const EXIT_URL: &str = "visit_exit_url";

    pub const CUSTOM_DIMENSION_PREFIX: &str = "custom_dimension_";
}

const BUILTIN_COLUMNS: &[(&str, ValueKind)] = &[
    (columns::IDVISIT, ValueKind::String),
    (columns::IDVISITOR, ValueKind::String),
    (columns::IDSITE, ValueKind::Integer),
    (columns::FIRST_ACTION_TIME, ValueKind::Timestamp),
    (columns::LAST_ACTION_TIME, ValueKind::Timestamp),
    (columns::TOTAL_ACTIONS, ValueKind::Integer),
    (columns::TOTAL_EVENTS, ValueKind::Integer),
    (columns::TOTAL_TIME, ValueKind::Integer),
    (columns::VISITOR_RETURNING, ValueKind::Boolean),
    (columns::VISITOR_COUNT_VISITS, ValueKind::Integer),
    (columns::SECONDS_SINCE_LAST, ValueKind::Integer),
    (columns::ENTRY_URL, ValueKind::String),
    (columns::EXIT_URL, ValueKind::String),
];

pub const DEFAULT_CUSTOM_DIMENSIONS: usize = 5;

/// A recognised column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub kind: ValueKind,
    pub priority: usize,
}

/// Schema of a visit row: built-in columns followed by custom dimensions.
#[derive(Debug, Clone)]
pub struct VisitSchema {
    columns: Vec<ColumnDef>,
    by_name: HashMap<String, usize>,
}

impl VisitSchema {
    pub fn new(custom_dimensions: usize) -> Self {
        let dimensions = (1..=custom_dimensions)
            .map(|i| (custom_dimension_column(i), ValueKind::String));

        let columns: Vec<ColumnDef> = BUILTIN_COLUMNS
            .iter()
            .map(|(name, kind)| (name.to_string(), *kind))
            .chain(dimensions)
            .enumerate()
            .map(|(priority, (name, kind))| ColumnDef { name, kind, priority })
            .collect();

        let by_name = columns
            .iter()
            .map(|c| (c.name.clone(), c.priority))
            .collect();

        Self { columns, by_name }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.by_name.get(name).map(|&i| &self.columns[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Plan priority of a column; unknown names sort last.
    pub fn priority(&self, name: &str) -> usize {
        self.by_name.get(name).copied().unwrap_or(usize::MAX)
    }

    pub fn columns(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns.iter()
    }

    pub fn custom_dimension_count(&self) -> usize {
        self.columns.len() - BUILTIN_COLUMNS.len()
    }

    /// Checks `name` and converts `value` into the column's kind.
    pub fn validate(&self, name: &str, value: AttributeValue) -> Result<AttributeValue> {
        let column = self
            .column(name)
            .ok_or_else(|| TrackerError::unknown_attribute(name))?;

        value
            .coerce(column.kind)
            .map_err(|reason| TrackerError::InvalidAttribute {
                name: name.to_string(),
                reason,
            })
    }
}

impl Default for VisitSchema {
    fn default() -> Self {
        Self::new(DEFAULT_CUSTOM_DIMENSIONS)
    }
}

/// Column name of the 1-based custom dimension `index`.
pub fn custom_dimension_column(index: usize) -> String {
    format!("{}{}", columns::CUSTOM_DIMENSION_PREFIX, index)
}

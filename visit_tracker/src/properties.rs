//! Per-request visit attributes.
//!
//! A [`PropertyStore`] holds two views of one visit: `current`, which request
//! processing mutates freely, and `original`, the state loaded from the store
//! (or chosen for a fresh visit). `original` only changes through the explicit
//! original-setting paths, so diffing the two yields what must be persisted.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::Result;
use crate::schema::VisitSchema;
use crate::value::AttributeValue;

pub type Properties = BTreeMap<String, AttributeValue>;

#[derive(Debug, Clone)]
pub struct PropertyStore {
    schema: Arc<VisitSchema>,
    current: Properties,
    original: Properties,
}

impl PropertyStore {
    /// An empty store for a visitor with no known visit.
    pub fn new(schema: Arc<VisitSchema>) -> Self {
        Self {
            schema,
            current: Properties::new(),
            original: Properties::new(),
        }
    }

    /// Seeds both `current` and `original` with `properties`.
    ///
    /// Every entry is validated, so a loaded row with unexpected columns is
    /// rejected instead of being carried silently into a plan.
    pub fn with_properties(schema: Arc<VisitSchema>, properties: Properties) -> Result<Self> {
        let validated = validate_all(&schema, properties)?;
        Ok(Self {
            schema,
            current: validated.clone(),
            original: validated,
        })
    }

    pub fn schema(&self) -> &Arc<VisitSchema> {
        &self.schema
    }

    /// Returns the current value of `name`, or the original one when
    /// `use_original` is set. Absent attributes yield `None`.
    pub fn get(&self, name: &str, use_original: bool) -> Option<&AttributeValue> {
        if use_original {
            self.original.get(name)
        } else {
            self.current.get(name)
        }
    }

    pub fn set(&mut self, name: &str, value: AttributeValue, also_set_original: bool) -> Result<()> {
        let value = self.schema.validate(name, value)?;
        if also_set_original {
            self.original.insert(name.to_string(), value.clone());
        }
        self.current.insert(name.to_string(), value);
        Ok(())
    }

    /// Writes `name` into `original` only.
    pub fn set_original(&mut self, name: &str, value: AttributeValue) -> Result<()> {
        let value = self.schema.validate(name, value)?;
        self.original.insert(name.to_string(), value);
        Ok(())
    }

    /// Empties `current`; `original` is untouched.
    pub fn clear(&mut self) {
        self.current.clear();
    }

    /// Replaces `current` wholesale. On a validation failure `current` is left
    /// as it was.
    pub fn replace_all(&mut self, properties: Properties) -> Result<()> {
        self.current = validate_all(&self.schema, properties)?;
        Ok(())
    }

    /// An owned copy of `current` (or `original`).
    pub fn snapshot(&self, use_original: bool) -> Properties {
        if use_original {
            self.original.clone()
        } else {
            self.current.clone()
        }
    }

    /// Whether `current` differs from `original` for `name`.
    pub fn is_changed(&self, name: &str) -> bool {
        self.current.get(name) != self.original.get(name)
    }

    pub(crate) fn current(&self) -> &Properties {
        &self.current
    }

    pub(crate) fn original(&self) -> &Properties {
        &self.original
    }
}

fn validate_all(schema: &VisitSchema, properties: Properties) -> Result<Properties> {
    properties
        .into_iter()
        .map(|(name, value)| {
            let value = schema.validate(&name, value)?;
            Ok((name, value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TrackerError;
    use crate::schema::columns;

    fn store() -> PropertyStore {
        PropertyStore::new(Arc::new(VisitSchema::default()))
    }

    #[test]
    fn test_get_absent_is_none() {
        let store = store();
        assert_eq!(store.get(columns::IDVISIT, false), None);
        assert_eq!(store.get(columns::IDVISIT, true), None);
    }

    #[test]
    fn test_set_only_touches_current_by_default() {
        let mut store = store();
        store.set(columns::TOTAL_ACTIONS, AttributeValue::Integer(3), false).unwrap();
        assert_eq!(store.get(columns::TOTAL_ACTIONS, false), Some(&AttributeValue::Integer(3)));
        assert_eq!(store.get(columns::TOTAL_ACTIONS, true), None);
        assert!(store.is_changed(columns::TOTAL_ACTIONS));

        store.set(columns::TOTAL_EVENTS, AttributeValue::Integer(1), true).unwrap();
        assert_eq!(store.get(columns::TOTAL_EVENTS, true), Some(&AttributeValue::Integer(1)));
        assert!(!store.is_changed(columns::TOTAL_EVENTS));
    }

    #[test]
    fn test_set_rejects_unknown_attribute() {
        let mut store = store();
        let err = store.set("favourite_colour", "blue".into(), false).unwrap_err();
        assert!(matches!(err, TrackerError::InvalidAttribute { .. }));
        assert!(store.snapshot(false).is_empty());
    }

    #[test]
    fn test_clear_keeps_original() {
        let mut props = Properties::new();
        props.insert(columns::IDVISIT.to_string(), "abc".into());
        let mut store = PropertyStore::with_properties(Arc::new(VisitSchema::default()), props).unwrap();

        store.clear();
        assert!(store.snapshot(false).is_empty());
        assert_eq!(store.get(columns::IDVISIT, true), Some(&AttributeValue::from("abc")));
    }

    #[test]
    fn test_replace_all_is_atomic_on_failure() {
        let mut store = store();
        store.set(columns::IDSITE, AttributeValue::Integer(1), false).unwrap();

        let mut bad = Properties::new();
        bad.insert(columns::IDSITE.to_string(), AttributeValue::Integer(2));
        bad.insert("bogus".to_string(), AttributeValue::Integer(3));
        assert!(store.replace_all(bad).is_err());
        assert_eq!(store.get(columns::IDSITE, false), Some(&AttributeValue::Integer(1)));
    }

    #[test]
    fn test_snapshot_is_detached() {
        let mut store = store();
        store.set(columns::TOTAL_ACTIONS, AttributeValue::Integer(1), true).unwrap();
        let snap = store.snapshot(false);
        store.set(columns::TOTAL_ACTIONS, AttributeValue::Integer(2), false).unwrap();
        assert_eq!(snap.get(columns::TOTAL_ACTIONS), Some(&AttributeValue::Integer(1)));
    }
}

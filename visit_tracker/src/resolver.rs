//! Continue-or-start decision for a tracking request.
//!
//! The resolver is a pure function of the request signature and the visitor's
//! last stored visit: it never talks to the store itself, so a failed load can
//! never be mistaken for "no previous visit".

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, TrackerError};
use crate::properties::PropertyStore;
use crate::schema::{columns, custom_dimension_column, VisitSchema};
use crate::signature::VisitSignature;
use crate::store::VisitRow;
use crate::value::AttributeValue;

pub const DEFAULT_VISIT_TIMEOUT_SECS: i64 = 30 * 60;

/// Why a request opened a new visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NewVisitReason {
    FirstVisit,
    Timeout,
    Forced,
    SiteChanged,
    DayBoundary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisitOutcome {
    New(NewVisitReason),
    Continued,
}

impl VisitOutcome {
    pub fn is_new(&self) -> bool {
        matches!(self, VisitOutcome::New(_))
    }
}

impl fmt::Display for VisitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VisitOutcome::New(reason) => write!(f, "new visit ({:?})", reason),
            VisitOutcome::Continued => write!(f, "continued visit"),
        }
    }
}

/// Result of resolving one request.
#[derive(Debug, Clone)]
pub struct ResolvedVisit {
    pub properties: PropertyStore,
    pub outcome: VisitOutcome,
    /// Row version observed at load time; the persist step must match it.
    pub expected_version: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub visit_timeout: Duration,
    /// Also end visits when the UTC day changes between two actions.
    pub split_visits_at_midnight: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            visit_timeout: Duration::seconds(DEFAULT_VISIT_TIMEOUT_SECS),
            split_visits_at_midnight: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VisitResolver {
    schema: Arc<VisitSchema>,
    config: ResolverConfig,
}

impl VisitResolver {
    pub fn new(schema: Arc<VisitSchema>, config: ResolverConfig) -> Self {
        Self { schema, config }
    }

    pub fn schema(&self) -> &Arc<VisitSchema> {
        &self.schema
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Builds the request's [`PropertyStore`] from the visitor's last visit.
    pub fn resolve(&self, signature: &VisitSignature, last_visit: Option<VisitRow>) -> Result<ResolvedVisit> {
        let Some(row) = last_visit else {
            return self.start_visit(signature, None, NewVisitReason::FirstVisit, None);
        };

        let expected_version = Some(row.version);
        let previous = PropertyStore::with_properties(self.schema.clone(), row.columns)?;
        let last_action = last_action_time(&previous)?;

        match self.new_visit_reason(signature, &previous, last_action)? {
            Some(reason) => self.start_visit(signature, Some((&previous, last_action)), reason, expected_version),
            None => self.continue_visit(signature, previous, last_action, expected_version),
        }
    }

    fn new_visit_reason(
        &self,
        signature: &VisitSignature,
        previous: &PropertyStore,
        last_action: DateTime<Utc>,
    ) -> Result<Option<NewVisitReason>> {
        let now = signature.timestamp();

        if signature.action().force_new_visit {
            return Ok(Some(NewVisitReason::Forced));
        }
        let previous_site = previous.get(columns::IDSITE, true).and_then(AttributeValue::as_integer);
        if previous_site.is_some_and(|site| site != signature.site_id()) {
            return Ok(Some(NewVisitReason::SiteChanged));
        }
        let visit_end = last_action
            .checked_add_signed(self.config.visit_timeout)
            .ok_or_else(|| out_of_range(columns::LAST_ACTION_TIME, "visit timeout overflows the stored time"))?;
        // Inclusive boundary: exactly `timeout` after the last action still
        // belongs to the visit.
        if now > visit_end {
            return Ok(Some(NewVisitReason::Timeout));
        }
        if self.config.split_visits_at_midnight && now.date_naive() > last_action.date_naive() {
            return Ok(Some(NewVisitReason::DayBoundary));
        }
        Ok(None)
    }

    /// Fresh visit: every column is written as both current and original.
    fn start_visit(
        &self,
        signature: &VisitSignature,
        previous: Option<(&PropertyStore, DateTime<Utc>)>,
        reason: NewVisitReason,
        expected_version: Option<u64>,
    ) -> Result<ResolvedVisit> {
        let now = signature.timestamp();
        let action = signature.action();
        let visit_id = Uuid::new_v4().to_string();

        let previous_visits = previous
            .and_then(|(p, _)| p.get(columns::VISITOR_COUNT_VISITS, true))
            .and_then(AttributeValue::as_integer)
            .unwrap_or(0);
        let seconds_since_last = previous
            .map(|(_, last)| (now - last).num_seconds().max(0))
            .unwrap_or(0);
        let is_event = action.kind.is_event();

        let mut properties = PropertyStore::new(self.schema.clone());
        let mut init = |name: &str, value: AttributeValue| properties.set(name, value, true);

        init(columns::IDVISIT, visit_id.clone().into())?;
        init(columns::IDVISITOR, signature.visitor_key().into())?;
        init(columns::IDSITE, signature.site_id().into())?;
        init(columns::FIRST_ACTION_TIME, now.into())?;
        init(columns::LAST_ACTION_TIME, now.into())?;
        init(columns::TOTAL_ACTIONS, i64::from(!is_event).into())?;
        init(columns::TOTAL_EVENTS, i64::from(is_event).into())?;
        init(columns::TOTAL_TIME, 0i64.into())?;
        init(columns::VISITOR_RETURNING, previous.is_some().into())?;
        init(columns::VISITOR_COUNT_VISITS, increment(columns::VISITOR_COUNT_VISITS, previous_visits)?.into())?;
        init(columns::SECONDS_SINCE_LAST, seconds_since_last.into())?;
        if let Some(url) = &action.url {
            init(columns::ENTRY_URL, url.as_str().into())?;
            init(columns::EXIT_URL, url.as_str().into())?;
        }
        for (index, value) in &action.dimensions {
            init(&custom_dimension_column(*index), value.as_str().into())?;
        }

        debug!(
            visitor = signature.visitor_key(),
            visit_id = %visit_id,
            ?reason,
            "Starting new visit"
        );

        Ok(ResolvedVisit {
            properties,
            outcome: VisitOutcome::New(reason),
            expected_version,
        })
    }

    /// Continued visit: `original` stays the loaded row, `current` advances.
    fn continue_visit(
        &self,
        signature: &VisitSignature,
        mut properties: PropertyStore,
        last_action: DateTime<Utc>,
        expected_version: Option<u64>,
    ) -> Result<ResolvedVisit> {
        let now = signature.timestamp();
        let action = signature.action();

        // Out-of-order hits never move the last action time backwards.
        let latest = now.max(last_action);
        if latest != last_action {
            properties.set(columns::LAST_ACTION_TIME, latest.into(), false)?;
        }

        let counter = if action.kind.is_event() {
            columns::TOTAL_EVENTS
        } else {
            columns::TOTAL_ACTIONS
        };
        let count = properties
            .get(counter, false)
            .and_then(AttributeValue::as_integer)
            .unwrap_or(0);
        properties.set(counter, increment(counter, count)?.into(), false)?;

        if let Some(first) = properties.get(columns::FIRST_ACTION_TIME, false).and_then(AttributeValue::as_timestamp) {
            let total = (latest - first).num_seconds().max(0);
            properties.set(columns::TOTAL_TIME, total.into(), false)?;
        }

        if let Some(url) = &action.url {
            properties.set(columns::EXIT_URL, url.as_str().into(), false)?;
        }
        for (index, value) in &action.dimensions {
            properties.set(&custom_dimension_column(*index), value.as_str().into(), false)?;
        }

        debug!(visitor = signature.visitor_key(), "Continuing visit");

        Ok(ResolvedVisit {
            properties,
            outcome: VisitOutcome::Continued,
            expected_version,
        })
    }
}

fn increment(name: &str, count: i64) -> Result<i64> {
    count
        .checked_add(1)
        .ok_or_else(|| out_of_range(name, "counter overflow"))
}

fn out_of_range(name: &str, reason: &str) -> TrackerError {
    TrackerError::InvalidAttribute {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

fn last_action_time(previous: &PropertyStore) -> Result<DateTime<Utc>> {
    previous
        .get(columns::LAST_ACTION_TIME, true)
        .and_then(AttributeValue::as_timestamp)
        .ok_or_else(|| TrackerError::InvalidAttribute {
            name: columns::LAST_ACTION_TIME.to_string(),
            reason: "missing from stored visit row".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::Properties;
    use crate::signature::{ActionContext, ActionKind};
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn signature(secs: i64) -> VisitSignature {
        VisitSignature::new(
            "abcdef0123456789",
            1,
            at(secs),
            ActionContext {
                kind: ActionKind::Pageview,
                url: Some("/next".to_string()),
                force_new_visit: false,
                dimensions: Default::default(),
            },
        )
    }

    fn resolver() -> VisitResolver {
        VisitResolver::new(Arc::new(VisitSchema::default()), ResolverConfig::default())
    }

    fn row(last_action: i64) -> VisitRow {
        let mut cols = Properties::new();
        cols.insert(columns::IDVISIT.to_string(), "old-visit".into());
        cols.insert(columns::IDVISITOR.to_string(), "abcdef0123456789".into());
        cols.insert(columns::IDSITE.to_string(), AttributeValue::Integer(1));
        cols.insert(columns::FIRST_ACTION_TIME.to_string(), at(400).into());
        cols.insert(columns::LAST_ACTION_TIME.to_string(), at(last_action).into());
        cols.insert(columns::TOTAL_ACTIONS.to_string(), AttributeValue::Integer(4));
        cols.insert(columns::VISITOR_COUNT_VISITS.to_string(), AttributeValue::Integer(2));
        VisitRow {
            visit_id: "old-visit".to_string(),
            version: 7,
            columns: cols,
        }
    }

    #[test]
    fn test_first_visit_sets_both_views() {
        let resolved = resolver().resolve(&signature(1_000), None).unwrap();
        assert_eq!(resolved.outcome, VisitOutcome::New(NewVisitReason::FirstVisit));
        assert_eq!(resolved.expected_version, None);

        let current = resolved.properties.snapshot(false);
        assert!(!current.is_empty());
        assert_eq!(current, resolved.properties.snapshot(true));
        assert_eq!(current.get(columns::VISITOR_RETURNING), Some(&AttributeValue::Boolean(false)));
        assert_eq!(current.get(columns::ENTRY_URL), Some(&AttributeValue::from("/next")));
    }

    #[test]
    fn test_continue_advances_current_only() {
        let resolved = resolver().resolve(&signature(2_799), Some(row(1_000))).unwrap();
        assert_eq!(resolved.outcome, VisitOutcome::Continued);
        assert_eq!(resolved.expected_version, Some(7));

        let props = &resolved.properties;
        assert_eq!(props.get(columns::TOTAL_ACTIONS, false), Some(&AttributeValue::Integer(5)));
        assert_eq!(props.get(columns::TOTAL_ACTIONS, true), Some(&AttributeValue::Integer(4)));
        assert_eq!(props.get(columns::LAST_ACTION_TIME, false), Some(&AttributeValue::Timestamp(at(2_799))));
        assert_eq!(props.get(columns::TOTAL_TIME, false), Some(&AttributeValue::Integer(2_399)));
        assert_eq!(props.snapshot(true), row(1_000).columns);
    }

    #[test]
    fn test_boundary_is_inclusive() {
        let resolved = resolver().resolve(&signature(2_800), Some(row(1_000))).unwrap();
        assert_eq!(resolved.outcome, VisitOutcome::Continued);

        let resolved = resolver().resolve(&signature(2_801), Some(row(1_000))).unwrap();
        assert_eq!(resolved.outcome, VisitOutcome::New(NewVisitReason::Timeout));
    }

    #[test]
    fn test_new_visit_after_timeout_counts_previous_visits() {
        let resolved = resolver().resolve(&signature(5_000), Some(row(1_000))).unwrap();
        let props = &resolved.properties;
        assert_eq!(resolved.expected_version, Some(7));
        assert_ne!(props.get(columns::IDVISIT, false), Some(&AttributeValue::from("old-visit")));
        assert_eq!(props.get(columns::VISITOR_RETURNING, false), Some(&AttributeValue::Boolean(true)));
        assert_eq!(props.get(columns::VISITOR_COUNT_VISITS, false), Some(&AttributeValue::Integer(3)));
        assert_eq!(props.get(columns::SECONDS_SINCE_LAST, false), Some(&AttributeValue::Integer(4_000)));
        assert_eq!(props.get(columns::TOTAL_ACTIONS, false), Some(&AttributeValue::Integer(1)));
    }

    #[test]
    fn test_out_of_order_hit_keeps_last_action() {
        let resolved = resolver().resolve(&signature(900), Some(row(1_000))).unwrap();
        assert_eq!(resolved.outcome, VisitOutcome::Continued);
        assert!(!resolved.properties.is_changed(columns::LAST_ACTION_TIME));
    }

    #[test]
    fn test_site_change_starts_new_visit() {
        let sig = VisitSignature::new("abcdef0123456789", 2, at(1_100), signature(1_100).action().clone());
        let resolved = resolver().resolve(&sig, Some(row(1_000))).unwrap();
        assert_eq!(resolved.outcome, VisitOutcome::New(NewVisitReason::SiteChanged));
    }

    #[test]
    fn test_midnight_split_when_enabled() {
        let config = ResolverConfig {
            split_visits_at_midnight: true,
            ..ResolverConfig::default()
        };
        let resolver = VisitResolver::new(Arc::new(VisitSchema::default()), config);
        // 86_390 is ten seconds before the first UTC midnight.
        let resolved = resolver.resolve(&signature(86_410), Some(row(86_390))).unwrap();
        assert_eq!(resolved.outcome, VisitOutcome::New(NewVisitReason::DayBoundary));
    }

    #[test]
    fn test_row_without_last_action_is_rejected() {
        let mut broken = row(1_000);
        broken.columns.remove(columns::LAST_ACTION_TIME);
        let err = resolver().resolve(&signature(1_100), Some(broken)).unwrap_err();
        assert!(matches!(err, TrackerError::InvalidAttribute { .. }));
    }

    #[test]
    fn test_unknown_dimension_is_invalid() {
        let mut sig_action = signature(1_000).action().clone();
        sig_action.dimensions.insert(99, "x".to_string());
        let sig = VisitSignature::new("abcdef0123456789", 1, at(1_000), sig_action);
        assert!(resolver().resolve(&sig, None).is_err());
    }

    #[test]
    fn test_last_action_at_end_of_time_is_invalid() {
        let mut broken = row(1_000);
        broken.columns.insert(
            columns::LAST_ACTION_TIME.to_string(),
            AttributeValue::Integer(DateTime::<Utc>::MAX_UTC.timestamp()),
        );
        let err = resolver().resolve(&signature(1_000), Some(broken)).unwrap_err();
        assert_eq!(
            err,
            TrackerError::InvalidAttribute {
                name: columns::LAST_ACTION_TIME.to_string(),
                reason: "visit timeout overflows the stored time".to_string(),
            }
        );
    }

    #[test]
    fn test_saturated_counters_are_invalid() {
        let mut broken = row(1_000);
        broken
            .columns
            .insert(columns::TOTAL_ACTIONS.to_string(), AttributeValue::Integer(i64::MAX));
        let err = resolver().resolve(&signature(1_100), Some(broken)).unwrap_err();
        assert!(matches!(err, TrackerError::InvalidAttribute { ref name, .. } if name == columns::TOTAL_ACTIONS));

        let mut broken = row(1_000);
        broken
            .columns
            .insert(columns::VISITOR_COUNT_VISITS.to_string(), AttributeValue::Integer(i64::MAX));
        let err = resolver().resolve(&signature(9_000), Some(broken)).unwrap_err();
        assert!(matches!(err, TrackerError::InvalidAttribute { ref name, .. } if name == columns::VISITOR_COUNT_VISITS));
    }
}

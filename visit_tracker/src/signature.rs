//! Incoming tracking hits and the visitor signature derived from them.

use blake3::Hasher;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::clock::Clock;
use crate::error::{Result, TrackerError};

/// Length of the hex-encoded visitor key.
const VISITOR_KEY_LEN: usize = 16;

/// What the tracked action was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    #[default]
    Pageview,
    Event,
    Download,
    Outlink,
}

impl ActionKind {
    /// Events are counted separately from page-like actions.
    pub fn is_event(&self) -> bool {
        matches!(self, ActionKind::Event)
    }
}

/// A raw tracking request, as accepted by the replay tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingHit {
    /// Cookie or device identifier as sent by the client.
    pub visitor_id: String,
    pub site_id: i64,
    /// Unix seconds; the tracker clock is used when missing.
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub action: ActionKind,
    #[serde(default)]
    pub url: Option<String>,
    /// Client asked for a new visit regardless of timing.
    #[serde(default)]
    pub new_visit: bool,
    /// Custom dimension values keyed by 1-based dimension index.
    #[serde(default)]
    pub dimensions: BTreeMap<usize, String>,
}

impl TrackingHit {
    pub fn new(visitor_id: impl Into<String>, site_id: i64) -> Self {
        Self {
            visitor_id: visitor_id.into(),
            site_id,
            timestamp: None,
            action: ActionKind::Pageview,
            url: None,
            new_visit: false,
            dimensions: BTreeMap::new(),
        }
    }

    pub fn at(mut self, unix_secs: i64) -> Self {
        self.timestamp = Some(unix_secs);
        self
    }

    pub fn with_action(mut self, action: ActionKind) -> Self {
        self.action = action;
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn forcing_new_visit(mut self) -> Self {
        self.new_visit = true;
        self
    }

    pub fn with_dimension(mut self, index: usize, value: impl Into<String>) -> Self {
        self.dimensions.insert(index, value.into());
        self
    }
}

/// Per-action details the resolver needs besides identity and time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionContext {
    pub kind: ActionKind,
    pub url: Option<String>,
    pub force_new_visit: bool,
    pub dimensions: BTreeMap<usize, String>,
}

/// Identity, time and action of one request. Built once per hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisitSignature {
    visitor_key: String,
    site_id: i64,
    timestamp: DateTime<Utc>,
    action: ActionContext,
}

impl VisitSignature {
    pub fn new(
        visitor_key: impl Into<String>,
        site_id: i64,
        timestamp: DateTime<Utc>,
        action: ActionContext,
    ) -> Self {
        Self {
            visitor_key: visitor_key.into(),
            site_id,
            timestamp,
            action,
        }
    }

    /// Derives the signature of `hit`. Only a missing timestamp falls back to
    /// `clock`; one outside the representable range is rejected.
    pub fn from_hit(hit: &TrackingHit, clock: &dyn Clock) -> Result<Self> {
        let timestamp = match hit.timestamp {
            None => clock.now(),
            Some(secs) => Utc.timestamp_opt(secs, 0).single().ok_or_else(|| {
                TrackerError::InvalidAttribute {
                    name: "timestamp".to_string(),
                    reason: format!("{} is not a representable unix time", secs),
                }
            })?,
        };

        Ok(Self {
            visitor_key: visitor_key(&hit.visitor_id),
            site_id: hit.site_id,
            timestamp,
            action: ActionContext {
                kind: hit.action,
                url: hit.url.clone(),
                force_new_visit: hit.new_visit,
                dimensions: hit.dimensions.clone(),
            },
        })
    }

    pub fn visitor_key(&self) -> &str {
        &self.visitor_key
    }

    pub fn site_id(&self) -> i64 {
        self.site_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn action(&self) -> &ActionContext {
        &self.action
    }
}

/// Hashes a raw visitor identifier into the stored visitor key.
pub fn visitor_key(raw_id: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.update(raw_id.as_bytes());
    let hex = hasher.finalize().to_hex();
    hex.as_str()[..VISITOR_KEY_LEN].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_visitor_key_is_stable_and_short() {
        let a = visitor_key("cookie-123");
        assert_eq!(a, visitor_key("cookie-123"));
        assert_ne!(a, visitor_key("cookie-124"));
        assert_eq!(a.len(), VISITOR_KEY_LEN);
    }

    #[test]
    fn test_signature_falls_back_to_clock() {
        let clock = ManualClock::at_unix(5_000);
        let sig = VisitSignature::from_hit(&TrackingHit::new("v", 1), &clock).unwrap();
        assert_eq!(sig.timestamp().timestamp(), 5_000);

        let sig = VisitSignature::from_hit(&TrackingHit::new("v", 1).at(42), &clock).unwrap();
        assert_eq!(sig.timestamp().timestamp(), 42);
    }

    #[test]
    fn test_unrepresentable_timestamp_is_rejected() {
        let clock = ManualClock::at_unix(5_000);
        let err = VisitSignature::from_hit(&TrackingHit::new("v", 1).at(i64::MAX), &clock).unwrap_err();
        assert!(matches!(err, TrackerError::InvalidAttribute { ref name, .. } if name == "timestamp"));
    }

    #[test]
    fn test_hit_deserializes_with_defaults() {
        let hit: TrackingHit =
            serde_json::from_str(r#"{"visitor_id":"abc","site_id":3}"#).unwrap();
        assert_eq!(hit.action, ActionKind::Pageview);
        assert!(!hit.new_visit);
        assert!(hit.dimensions.is_empty());
    }
}

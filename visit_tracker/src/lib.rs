//! Visit Tracker - Core Library
//!
//! Request-scoped visit resolution for web-analytics tracking hits: decide
//! whether a hit continues the visitor's last visit or starts a new one, and
//! persist the minimal set of column changes under optimistic concurrency.

pub mod cli;
pub mod clock;
pub mod error;
pub mod planner;
pub mod properties;
pub mod replay;
pub mod resolver;
pub mod schema;
pub mod settings;
pub mod signature;
pub mod store;
pub mod telemetry;
pub mod tracker;
pub mod value;

pub use error::{StoreError, TrackerError};
pub use planner::{MutationPlan, MutationPlanner, PlanMode};
pub use properties::PropertyStore;
pub use resolver::{ResolvedVisit, VisitOutcome, VisitResolver};
pub use signature::{TrackingHit, VisitSignature};
pub use tracker::Tracker;
pub use value::AttributeValue;

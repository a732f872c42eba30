//! Typed errors for visit resolution and persistence.

use thiserror::Error;

/// Errors surfaced by the tracking core.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TrackerError {
    /// A write used a column the schema does not know, or a value that cannot
    /// be stored in that column.
    #[error("invalid visit attribute '{name}': {reason}")]
    InvalidAttribute { name: String, reason: String },

    /// The visit store could not be reached or timed out.
    #[error("visit store unavailable: {0}")]
    StoreUnavailable(String),

    /// Every attempt lost the optimistic-concurrency race on the visitor row.
    #[error("visit row modified concurrently; gave up after {attempts} attempts")]
    ConcurrentModification { attempts: u32 },
}

impl TrackerError {
    pub(crate) fn unknown_attribute(name: &str) -> Self {
        Self::InvalidAttribute {
            name: name.to_string(),
            reason: "not a recognised visit column".to_string(),
        }
    }

    /// Whether retrying the same hit later may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::InvalidAttribute { .. })
    }
}

/// Errors reported by [`crate::store::VisitStore`] implementations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("expected row version {expected:?}, found {actual:?}")]
    ConcurrentModification {
        expected: Option<u64>,
        actual: Option<u64>,
    },

    #[error("{0}")]
    Unavailable(String),
}

impl From<StoreError> for TrackerError {
    fn from(err: StoreError) -> Self {
        match err {
            // A single conflict seen outside the retry loop.
            StoreError::ConcurrentModification { .. } => {
                TrackerError::ConcurrentModification { attempts: 1 }
            }
            StoreError::Unavailable(reason) => TrackerError::StoreUnavailable(reason),
        }
    }
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Unavailable(format!("sled: {}", err))
    }
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Unavailable(format!("corrupt visit row: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, TrackerError>;

use async_trait::async_trait;
use std::path::Path;
use tracing::{debug, info, instrument};

use super::{next_row, StoreResult, VisitRow, VisitStore};
use crate::error::StoreError;
use crate::planner::MutationPlan;

const VISITS_TREE: &str = "visits";

/// Visit rows persisted in a sled tree, bincode-encoded and keyed by visitor.
///
/// Writes go through `compare_and_swap` against the exact bytes that were
/// read, so a concurrent writer between read and write is detected even
/// across processes sharing the tree.
#[derive(Debug, Clone)]
pub struct SledVisitStore {
    db: sled::Db,
    visits: sled::Tree,
    flush_on_write: bool,
}

impl SledVisitStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let db = sled::open(path).map_err(|e| {
            StoreError::Unavailable(format!("failed to open visit database at {:?}: {}", path, e))
        })?;
        info!("Visit database opened at {:?}", path);
        Self::from_db(db)
    }

    /// A throwaway store that lives only as long as the process.
    pub fn temporary() -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> StoreResult<Self> {
        let visits = db.open_tree(VISITS_TREE)?;
        Ok(Self {
            db,
            visits,
            flush_on_write: false,
        })
    }

    /// Flush to disk after every successful write.
    pub fn with_flush_on_write(mut self, flush: bool) -> Self {
        self.flush_on_write = flush;
        self
    }

    pub fn len(&self) -> usize {
        self.visits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visits.is_empty()
    }

    pub async fn flush(&self) -> StoreResult<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn load_blocking(visits: &sled::Tree, visitor_key: &str) -> StoreResult<Option<VisitRow>> {
        match visits.get(visitor_key.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn upsert_blocking(
        visits: &sled::Tree,
        visitor_key: &str,
        plan: &MutationPlan,
        expected_version: Option<u64>,
    ) -> StoreResult<u64> {
        let key = visitor_key.as_bytes();
        let old_bytes = visits.get(key)?;
        let current: Option<VisitRow> = match &old_bytes {
            Some(bytes) => Some(bincode::deserialize(bytes)?),
            None => None,
        };

        let Some(row) = next_row(current.as_ref(), plan, expected_version)? else {
            return Ok(current.map_or(0, |row| row.version));
        };

        let new_bytes = bincode::serialize(&row)?;
        match visits.compare_and_swap(key, old_bytes, Some(new_bytes))? {
            Ok(()) => Ok(row.version),
            Err(cas) => {
                let actual = match cas.current {
                    Some(bytes) => Some(bincode::deserialize::<VisitRow>(&bytes)?.version),
                    None => None,
                };
                debug!("Lost compare-and-swap on visitor row");
                Err(StoreError::ConcurrentModification {
                    expected: expected_version,
                    actual,
                })
            }
        }
    }
}

#[async_trait]
impl VisitStore for SledVisitStore {
    async fn load_last_visit(&self, visitor_key: &str) -> StoreResult<Option<VisitRow>> {
        let visits = self.visits.clone();
        let key = visitor_key.to_string();
        tokio::task::spawn_blocking(move || Self::load_blocking(&visits, &key))
            .await
            .map_err(|e| StoreError::Unavailable(format!("visit load task failed: {}", e)))?
    }

    #[instrument(skip(self, plan), fields(mode = ?plan.mode, changes = plan.len()))]
    async fn upsert_visit(
        &self,
        visitor_key: &str,
        plan: &MutationPlan,
        expected_version: Option<u64>,
    ) -> StoreResult<u64> {
        let visits = self.visits.clone();
        let key = visitor_key.to_string();
        let plan = plan.clone();
        let version = tokio::task::spawn_blocking(move || {
            Self::upsert_blocking(&visits, &key, &plan, expected_version)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("visit upsert task failed: {}", e)))??;

        if self.flush_on_write {
            self.flush().await?;
        }
        Ok(version)
    }
}

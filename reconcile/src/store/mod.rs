use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

use crate::identity::{Identity, IdentityKey};
use crate::transaction::{EngagementEvent, Transaction};

pub mod postgres;

pub use postgres::PostgresStore;

/// Enumeration of errors for operations against a transaction store.
/// Errors can originate from sqlx and are wrapped by us to provide
/// additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("transaction row for {0} disappeared between insert and lock")]
    RowVanished(String),
}

/// The one shared mutable resource of the engine.
///
/// `apply` is get-or-create followed by a read-modify-write, atomic per
/// event: either every field change from the event lands or none do. Two
/// events racing to create the same row must both end up applied to a
/// single row; the store resolves the duplicate-creation race internally
/// and never surfaces it.
#[async_trait]
pub trait TransactionStore {
    /// Folds one event into the row addressed by `identity`, creating the
    /// row if it does not exist yet. Returns the row after the event and
    /// whether the event changed anything (false means the event was a
    /// no-op against already-recorded progress).
    async fn apply(
        &self,
        identity: &Identity,
        event: &EngagementEvent,
    ) -> Result<(Transaction, bool), StoreError>;

    async fn get(&self, identity: &Identity) -> Result<Option<Transaction>, StoreError>;

    /// One representative row per (doctor, collateral) within a campaign:
    /// the row with the greatest `updated_at`, not the greatest
    /// transaction date. Reporting must go through this to avoid counting
    /// a doctor once per engagement day.
    async fn latest_rows(
        &self,
        brand_campaign_id: &str,
        collateral_id: Option<i64>,
    ) -> Result<Vec<Transaction>, StoreError>;
}

/// In-memory store used by tests and local runs.
#[derive(Default)]
pub struct MemoryStore {
    rows: RwLock<HashMap<IdentityKey, Transaction>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    pub fn len(&self) -> usize {
        self.rows.read().expect("poisoned MemoryStore lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every row, unfiltered. Handy for asserting whole-store state.
    pub fn snapshot(&self) -> Vec<Transaction> {
        let mut rows: Vec<Transaction> = self
            .rows
            .read()
            .expect("poisoned MemoryStore lock")
            .values()
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.transaction_id().cmp(&b.transaction_id()));
        rows
    }
}

#[async_trait]
impl TransactionStore for MemoryStore {
    async fn apply(
        &self,
        identity: &Identity,
        event: &EngagementEvent,
    ) -> Result<(Transaction, bool), StoreError> {
        let mut rows = self.rows.write().expect("poisoned MemoryStore lock");
        let row = rows
            .entry(identity.key())
            .or_insert_with(|| Transaction::fresh(identity, Utc::now()));
        let changed = row.apply(event);
        Ok((row.clone(), changed))
    }

    async fn get(&self, identity: &Identity) -> Result<Option<Transaction>, StoreError> {
        let rows = self.rows.read().expect("poisoned MemoryStore lock");
        Ok(rows.get(&identity.key()).cloned())
    }

    async fn latest_rows(
        &self,
        brand_campaign_id: &str,
        collateral_id: Option<i64>,
    ) -> Result<Vec<Transaction>, StoreError> {
        let rows = self.rows.read().expect("poisoned MemoryStore lock");

        let mut latest: HashMap<(String, i64), Transaction> = HashMap::new();
        for row in rows.values() {
            if row.brand_campaign_id != brand_campaign_id {
                continue;
            }
            if let Some(wanted) = collateral_id {
                if row.collateral_id != wanted {
                    continue;
                }
            }

            let key = (row.doctor_number.clone(), row.collateral_id);
            match latest.get(&key) {
                Some(existing) if existing.updated_at >= row.updated_at => {}
                _ => {
                    latest.insert(key, row.clone());
                }
            }
        }

        let mut result: Vec<Transaction> = latest.into_values().collect();
        result.sort_by(|a, b| {
            (&a.doctor_number, a.collateral_id).cmp(&(&b.doctor_number, b.collateral_id))
        });
        Ok(result)
    }
}

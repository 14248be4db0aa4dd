use async_trait::async_trait;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::identity::Identity;
use crate::store::{StoreError, TransactionStore};
use crate::transaction::{EngagementEvent, Transaction};

/// Embedded schema migrations, run by the operator binaries on startup.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const INSERT_IDENTITY: &str = r#"
INSERT INTO collateral_transactions
    (brand_campaign_id, field_rep_id, doctor_number, doctor_display, collateral_id, transaction_date)
VALUES
    ($1, $2, $3, $4, $5, $6)
ON CONFLICT (field_rep_id, doctor_number, collateral_id, transaction_date) DO NOTHING
"#;

const SELECT_FOR_UPDATE: &str = r#"
SELECT *
FROM collateral_transactions
WHERE
    field_rep_id = $1
    AND doctor_number = $2
    AND collateral_id = $3
    AND transaction_date = $4
FOR UPDATE
"#;

const SELECT_ONE: &str = r#"
SELECT *
FROM collateral_transactions
WHERE
    field_rep_id = $1
    AND doctor_number = $2
    AND collateral_id = $3
    AND transaction_date = $4
"#;

const UPDATE_ROW: &str = r#"
UPDATE collateral_transactions
SET
    brand_campaign_id = $5,
    doctor_display = $6,
    sent_at = $7,
    share_channel = $8,
    field_rep_email = $9,
    doctor_name = $10,
    has_viewed = $11,
    viewed_at = $12,
    has_downloaded_pdf = $13,
    downloaded_pdf_at = $14,
    last_page_scrolled = $15,
    pdf_total_pages = $16,
    has_viewed_last_page = $17,
    viewed_last_page_at = $18,
    video_view_lt_50 = $19,
    video_view_lt_50_at = $20,
    video_view_gt_50 = $21,
    video_view_gt_50_at = $22,
    video_view_100 = $23,
    video_view_100_at = $24,
    last_video_percentage = $25,
    total_video_events = $26,
    updated_at = $27
WHERE
    field_rep_id = $1
    AND doctor_number = $2
    AND collateral_id = $3
    AND transaction_date = $4
"#;

const SELECT_LATEST: &str = r#"
SELECT DISTINCT ON (doctor_number, collateral_id) *
FROM collateral_transactions
WHERE
    brand_campaign_id = $1
    AND ($2::BIGINT IS NULL OR collateral_id = $2)
ORDER BY doctor_number, collateral_id, updated_at DESC
"#;

/// Store backed by the `collateral_transactions` table.
///
/// The uniqueness constraint over (field_rep_id, doctor_number,
/// collateral_id, transaction_date) is what makes `apply` race-safe: both
/// sides of a duplicate-creation race fall through the `ON CONFLICT DO
/// NOTHING` insert, then queue on the row lock and merge their event into
/// the single surviving row.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(database_url: &str) -> Result<PostgresStore, StoreError> {
        let pool = PgPoolOptions::new()
            .connect_lazy(database_url)
            .map_err(|error| StoreError::ConnectionError { error })?;

        Ok(PostgresStore { pool })
    }

    pub fn from_pool(pool: PgPool) -> PostgresStore {
        PostgresStore { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TransactionStore for PostgresStore {
    async fn apply(
        &self,
        identity: &Identity,
        event: &EngagementEvent,
    ) -> Result<(Transaction, bool), StoreError> {
        let mut db_tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StoreError::QueryError {
                command: "BEGIN".to_owned(),
                error,
            })?;

        sqlx::query(INSERT_IDENTITY)
            .bind(&identity.brand_campaign_id)
            .bind(identity.field_rep_id)
            .bind(identity.doctor.canonical())
            .bind(identity.doctor.display())
            .bind(identity.collateral_id)
            .bind(identity.transaction_date)
            .execute(&mut *db_tx)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        let mut row: Transaction = sqlx::query_as(SELECT_FOR_UPDATE)
            .bind(identity.field_rep_id)
            .bind(identity.doctor.canonical())
            .bind(identity.collateral_id)
            .bind(identity.transaction_date)
            .fetch_optional(&mut *db_tx)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?
            .ok_or_else(|| StoreError::RowVanished(identity.transaction_id()))?;

        let changed = row.apply(event);

        if changed {
            sqlx::query(UPDATE_ROW)
                .bind(identity.field_rep_id)
                .bind(identity.doctor.canonical())
                .bind(identity.collateral_id)
                .bind(identity.transaction_date)
                .bind(&row.brand_campaign_id)
                .bind(&row.doctor_display)
                .bind(row.sent_at)
                .bind(&row.share_channel)
                .bind(&row.field_rep_email)
                .bind(&row.doctor_name)
                .bind(row.has_viewed)
                .bind(row.viewed_at)
                .bind(row.has_downloaded_pdf)
                .bind(row.downloaded_pdf_at)
                .bind(row.last_page_scrolled)
                .bind(row.pdf_total_pages)
                .bind(row.has_viewed_last_page)
                .bind(row.viewed_last_page_at)
                .bind(row.video_view_lt_50)
                .bind(row.video_view_lt_50_at)
                .bind(row.video_view_gt_50)
                .bind(row.video_view_gt_50_at)
                .bind(row.video_view_100)
                .bind(row.video_view_100_at)
                .bind(row.last_video_percentage)
                .bind(row.total_video_events)
                .bind(row.updated_at)
                .execute(&mut *db_tx)
                .await
                .map_err(|error| StoreError::QueryError {
                    command: "UPDATE".to_owned(),
                    error,
                })?;
        }

        db_tx
            .commit()
            .await
            .map_err(|error| StoreError::QueryError {
                command: "COMMIT".to_owned(),
                error,
            })?;

        Ok((row, changed))
    }

    async fn get(&self, identity: &Identity) -> Result<Option<Transaction>, StoreError> {
        sqlx::query_as(SELECT_ONE)
            .bind(identity.field_rep_id)
            .bind(identity.doctor.canonical())
            .bind(identity.collateral_id)
            .bind(identity.transaction_date)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })
    }

    async fn latest_rows(
        &self,
        brand_campaign_id: &str,
        collateral_id: Option<i64>,
    ) -> Result<Vec<Transaction>, StoreError> {
        sqlx::query_as(SELECT_LATEST)
            .bind(brand_campaign_id)
            .bind(collateral_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};

use reconcile::backfill::{
    BackfillError, BackfillScope, BackfillSource, EngagementKind, EngagementRecord, ShareRecord,
};

const SELECT_SHARES: &str = r#"
SELECT
    field_rep_id,
    field_rep_email,
    doctor_identifier,
    collateral_id,
    brand_campaign_id,
    share_channel,
    share_timestamp
FROM sharing_management_sharelog
WHERE brand_campaign_id = $1 OR COALESCE(brand_campaign_id, '') = ''
"#;

const SELECT_ENGAGEMENTS: &str = r#"
SELECT
    sl.field_rep_id,
    sl.doctor_identifier,
    sl.collateral_id,
    sl.brand_campaign_id,
    de.last_page_scrolled,
    de.pdf_completed,
    de.video_watch_percentage,
    de.view_timestamp
FROM doctor_viewer_doctorengagement de
JOIN sharing_management_sharelog sl ON sl.short_link_id = de.short_link_id
WHERE sl.brand_campaign_id = $1 OR COALESCE(sl.brand_campaign_id, '') = ''
"#;

const SELECT_VIDEO_LOGS: &str = r#"
SELECT
    sl.field_rep_id,
    sl.doctor_identifier,
    sl.collateral_id,
    sl.brand_campaign_id,
    vtl.video_percentage,
    vtl.created_at
FROM sharing_management_videotrackinglog vtl
JOIN sharing_management_sharelog sl ON sl.id = vtl.share_log_id
WHERE sl.brand_campaign_id = $1 OR COALESCE(sl.brand_campaign_id, '') = ''
"#;

type ShareRow = (
    Option<i64>,    // field_rep_id
    Option<String>, // field_rep_email
    String,         // doctor_identifier
    Option<i64>,    // collateral_id
    Option<String>, // brand_campaign_id
    Option<String>, // share_channel
    DateTime<Utc>,  // share_timestamp
);

type EngagementRow = (
    Option<i64>,    // field_rep_id
    String,         // doctor_identifier
    Option<i64>,    // collateral_id
    Option<String>, // brand_campaign_id
    i32,            // last_page_scrolled
    bool,           // pdf_completed
    i32,            // video_watch_percentage
    DateTime<Utc>,  // view_timestamp
);

type VideoLogRow = (
    Option<i64>,    // field_rep_id
    String,         // doctor_identifier
    Option<i64>,    // collateral_id
    Option<String>, // brand_campaign_id
    String,         // video_percentage, free text in the legacy schema
    DateTime<Utc>,  // created_at
);

/// Reads the legacy share and engagement tables left behind by the old
/// system. One engagement visit row fans out into an open event plus
/// whatever PDF/video progress it recorded.
pub struct PgBackfillSource {
    pool: PgPool,
}

impl PgBackfillSource {
    pub fn new(database_url: &str) -> Result<PgBackfillSource, sqlx::Error> {
        let pool = PgPoolOptions::new().connect_lazy(database_url)?;
        Ok(PgBackfillSource { pool })
    }
}

#[async_trait]
impl BackfillSource for PgBackfillSource {
    async fn share_records(
        &self,
        scope: &BackfillScope,
    ) -> Result<Vec<ShareRecord>, BackfillError> {
        let rows: Vec<ShareRow> = sqlx::query_as(SELECT_SHARES)
            .bind(&scope.brand_campaign_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| BackfillError::SourceError { error })?;

        Ok(rows
            .into_iter()
            .map(
                |(rep, email, doctor, collateral, brand, channel, shared_at)| ShareRecord {
                    field_rep_id: rep,
                    field_rep_email: email,
                    doctor_identifier: doctor,
                    doctor_name: None,
                    collateral_id: collateral,
                    brand_campaign_id: brand,
                    share_channel: channel,
                    shared_at,
                },
            )
            .collect())
    }

    async fn engagement_records(
        &self,
        scope: &BackfillScope,
    ) -> Result<Vec<EngagementRecord>, BackfillError> {
        let mut records = Vec::new();

        let visits: Vec<EngagementRow> = sqlx::query_as(SELECT_ENGAGEMENTS)
            .bind(&scope.brand_campaign_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| BackfillError::SourceError { error })?;

        for (rep, doctor, collateral, brand, last_page, completed, video_pct, at) in visits {
            let base = EngagementRecord {
                field_rep_id: rep,
                doctor_identifier: doctor,
                collateral_id: collateral,
                brand_campaign_id: brand,
                kind: EngagementKind::Opened,
                at,
            };

            if last_page > 0 || completed {
                records.push(EngagementRecord {
                    kind: EngagementKind::PdfProgress {
                        last_page: i64::from(last_page),
                        total_pages: None,
                        completed,
                    },
                    ..base.clone()
                });
            }
            if video_pct > 0 {
                records.push(EngagementRecord {
                    kind: EngagementKind::VideoProgress {
                        percentage: i64::from(video_pct),
                    },
                    ..base.clone()
                });
            }
            records.push(base);
        }

        let video_logs: Vec<VideoLogRow> = sqlx::query_as(SELECT_VIDEO_LOGS)
            .bind(&scope.brand_campaign_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| BackfillError::SourceError { error })?;

        for (rep, doctor, collateral, brand, raw_pct, at) in video_logs {
            // The legacy column is free text; anything unparseable is kept
            // as an out-of-range value so the replay rejects and reports it
            // instead of dropping it silently here.
            let percentage = raw_pct.trim().parse::<i64>().unwrap_or(-1);

            records.push(EngagementRecord {
                field_rep_id: rep,
                doctor_identifier: doctor,
                collateral_id: collateral,
                brand_campaign_id: brand,
                kind: EngagementKind::VideoProgress { percentage },
                at,
            });
        }

        Ok(records)
    }
}

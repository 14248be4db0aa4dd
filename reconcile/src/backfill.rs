use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use metrics::counter;
use thiserror::Error;
use tracing::{info, warn};

use crate::identity::{Identity, IdentityError, IdentityKey, NormalizedPhone};
use crate::ingest::{IngestError, Recorder, ShareContext};
use crate::store::TransactionStore;

/// Enumeration of errors that abort a backfill run outright. Individual
/// records failing to replay do not abort; they end up in the report.
#[derive(Error, Debug)]
pub enum BackfillError {
    #[error("reading historical rows failed with: {error}")]
    SourceError { error: sqlx::Error },
}

/// Which campaign's history to replay.
#[derive(Debug, Clone)]
pub struct BackfillScope {
    pub brand_campaign_id: String,
}

/// A historical share row, as raw as the legacy table holds it. The doctor
/// identifier is unnormalized on purpose; normalization (and its failures)
/// belong to the replay, not the source.
#[derive(Debug, Clone)]
pub struct ShareRecord {
    pub field_rep_id: Option<i64>,
    pub field_rep_email: Option<String>,
    pub doctor_identifier: String,
    pub doctor_name: Option<String>,
    pub collateral_id: Option<i64>,
    pub brand_campaign_id: Option<String>,
    pub share_channel: Option<String>,
    pub shared_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum EngagementKind {
    Opened,
    PdfProgress {
        last_page: i64,
        total_pages: Option<i64>,
        completed: bool,
    },
    PdfDownloaded,
    VideoProgress {
        percentage: i64,
    },
}

/// A historical engagement row joined back to its share for identity.
#[derive(Debug, Clone)]
pub struct EngagementRecord {
    pub field_rep_id: Option<i64>,
    pub doctor_identifier: String,
    pub collateral_id: Option<i64>,
    pub brand_campaign_id: Option<String>,
    pub kind: EngagementKind,
    pub at: DateTime<Utc>,
}

/// Where historical rows come from. The production implementation reads the
/// legacy share/engagement tables; tests feed vectors.
#[async_trait]
pub trait BackfillSource {
    async fn share_records(&self, scope: &BackfillScope)
        -> Result<Vec<ShareRecord>, BackfillError>;
    async fn engagement_records(
        &self,
        scope: &BackfillScope,
    ) -> Result<Vec<EngagementRecord>, BackfillError>;
}

/// One record that failed to replay, with enough context for an operator to
/// chase the legacy row down.
#[derive(Debug)]
pub struct BackfillFailure {
    pub record: String,
    pub reason: String,
}

/// Outcome of one run. Failures are partial; everything counted as replayed
/// has been committed and stays committed.
#[derive(Debug, Default)]
pub struct BackfillReport {
    pub shares_replayed: usize,
    pub engagements_replayed: usize,
    pub failures: Vec<BackfillFailure>,
}

impl BackfillReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record_failure(&mut self, record: String, reason: String) {
        warn!(record = %record, reason = %reason, "skipping unreplayable history row");
        counter!("reconcile_backfill_failures_total").increment(1);
        self.failures.push(BackfillFailure { record, reason });
    }
}

/// Replays a campaign's historical share and engagement rows through the
/// ingestion functions, in event-time order.
///
/// Safe to re-run: row creation is get-or-create under the uniqueness
/// constraint, every transition is monotonic, and first-write-wins
/// timestamps are protected by the event-time sort. A malformed legacy row
/// is logged, counted and skipped; the run carries on.
pub struct BackfillJob<'a, S, Src> {
    recorder: &'a Recorder<S>,
    source: &'a Src,
    business_offset: FixedOffset,
}

impl<'a, S, Src> BackfillJob<'a, S, Src>
where
    S: TransactionStore,
    Src: BackfillSource,
{
    pub fn new(
        recorder: &'a Recorder<S>,
        source: &'a Src,
        business_offset: FixedOffset,
    ) -> BackfillJob<'a, S, Src> {
        BackfillJob {
            recorder,
            source,
            business_offset,
        }
    }

    pub async fn run(&self, scope: &BackfillScope) -> Result<BackfillReport, BackfillError> {
        let mut report = BackfillReport::default();

        let mut shares = self.source.share_records(scope).await?;
        // Event-time order, not discovery order: first-write-wins
        // timestamps must see the earliest event first.
        shares.sort_by_key(|share| share.shared_at);

        for share in &shares {
            match self.replay_share(scope, share).await {
                Ok(()) => {
                    report.shares_replayed += 1;
                    counter!("reconcile_backfill_replayed_total", "record" => "share")
                        .increment(1);
                }
                Err(reason) => report.record_failure(describe_share(share), reason),
            }
        }

        let mut engagements = self.source.engagement_records(scope).await?;
        engagements.sort_by_key(|engagement| engagement.at);

        // Video ticks are reconciled as a per-identity watermark after the
        // pass, so a re-run converges instead of double counting.
        let mut video_ticks: HashMap<IdentityKey, (Identity, i32)> = HashMap::new();

        for engagement in &engagements {
            match self.replay_engagement(scope, engagement, &mut video_ticks).await {
                Ok(()) => {
                    report.engagements_replayed += 1;
                    counter!("reconcile_backfill_replayed_total", "record" => "engagement")
                        .increment(1);
                }
                Err(reason) => report.record_failure(describe_engagement(engagement), reason),
            }
        }

        for (identity, ticks) in video_ticks.into_values() {
            if let Err(error) = self.recorder.reconcile_video_ticks(&identity, ticks).await {
                report.record_failure(identity.transaction_id(), error.to_string());
            }
        }

        info!(
            brand_campaign_id = %scope.brand_campaign_id,
            shares = report.shares_replayed,
            engagements = report.engagements_replayed,
            failures = report.failures.len(),
            "backfill run finished"
        );

        Ok(report)
    }

    async fn replay_share(&self, scope: &BackfillScope, share: &ShareRecord) -> Result<(), String> {
        let identity = self
            .identity_for(
                scope,
                share.field_rep_id,
                &share.doctor_identifier,
                share.collateral_id,
                share.brand_campaign_id.as_deref(),
                share.shared_at,
            )
            .map_err(|error| error.to_string())?;

        let context = ShareContext {
            channel: share.share_channel.clone(),
            field_rep_email: share.field_rep_email.clone(),
            doctor_name: share.doctor_name.clone(),
        };

        self.recorder
            .record_sent(&identity, context, share.shared_at)
            .await
            .map(|_| ())
            .map_err(|error| error.to_string())
    }

    async fn replay_engagement(
        &self,
        scope: &BackfillScope,
        engagement: &EngagementRecord,
        video_ticks: &mut HashMap<IdentityKey, (Identity, i32)>,
    ) -> Result<(), String> {
        let identity = self
            .identity_for(
                scope,
                engagement.field_rep_id,
                &engagement.doctor_identifier,
                engagement.collateral_id,
                engagement.brand_campaign_id.as_deref(),
                engagement.at,
            )
            .map_err(|error| error.to_string())?;

        let result: Result<_, IngestError> = match &engagement.kind {
            EngagementKind::Opened => self.recorder.mark_viewed(&identity, engagement.at).await,
            EngagementKind::PdfProgress {
                last_page,
                total_pages,
                completed,
            } => {
                self.recorder
                    .mark_pdf_progress(
                        &identity,
                        *last_page,
                        *total_pages,
                        *completed,
                        engagement.at,
                    )
                    .await
            }
            EngagementKind::PdfDownloaded => {
                self.recorder
                    .mark_downloaded_pdf(&identity, engagement.at)
                    .await
            }
            EngagementKind::VideoProgress { percentage } => {
                let replayed = self
                    .recorder
                    .replay_video_progress(&identity, *percentage, engagement.at)
                    .await;
                if replayed.is_ok() {
                    video_ticks
                        .entry(identity.key())
                        .or_insert_with(|| (identity.clone(), 0))
                        .1 += 1;
                }
                replayed
            }
        };

        result.map(|_| ()).map_err(|error| error.to_string())
    }

    fn identity_for(
        &self,
        scope: &BackfillScope,
        field_rep_id: Option<i64>,
        doctor_identifier: &str,
        collateral_id: Option<i64>,
        brand_campaign_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Identity, IdentityError> {
        let field_rep_id = field_rep_id.ok_or(IdentityError::RepNotFound {
            id: None,
            email: None,
        })?;
        let collateral_id = collateral_id.ok_or(IdentityError::MissingCollateral)?;
        let doctor = NormalizedPhone::parse(doctor_identifier)?;
        let brand = match brand_campaign_id {
            Some(brand) if !brand.is_empty() => brand,
            _ => scope.brand_campaign_id.as_str(),
        };

        Ok(Identity::new(
            brand,
            field_rep_id,
            doctor,
            collateral_id,
            at,
            self.business_offset,
        ))
    }
}

fn describe_share(share: &ShareRecord) -> String {
    format!(
        "share[rep={:?} doctor={} collateral={:?} at={}]",
        share.field_rep_id, share.doctor_identifier, share.collateral_id, share.shared_at
    )
}

fn describe_engagement(engagement: &EngagementRecord) -> String {
    format!(
        "engagement[rep={:?} doctor={} collateral={:?} at={}]",
        engagement.field_rep_id,
        engagement.doctor_identifier,
        engagement.collateral_id,
        engagement.at
    )
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::identity::business_offset;
    use crate::store::MemoryStore;

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, hour, minute, 0).unwrap()
    }

    fn share(doctor: &str, collateral: Option<i64>, when: DateTime<Utc>) -> ShareRecord {
        ShareRecord {
            field_rep_id: Some(1),
            field_rep_email: Some("rep@example.com".to_owned()),
            doctor_identifier: doctor.to_owned(),
            doctor_name: None,
            collateral_id: collateral,
            brand_campaign_id: None,
            share_channel: Some("whatsapp".to_owned()),
            shared_at: when,
        }
    }

    fn engagement(doctor: &str, kind: EngagementKind, when: DateTime<Utc>) -> EngagementRecord {
        EngagementRecord {
            field_rep_id: Some(1),
            doctor_identifier: doctor.to_owned(),
            collateral_id: Some(42),
            brand_campaign_id: None,
            kind,
            at: when,
        }
    }

    struct VecSource {
        shares: Vec<ShareRecord>,
        engagements: Vec<EngagementRecord>,
    }

    #[async_trait]
    impl BackfillSource for VecSource {
        async fn share_records(
            &self,
            _scope: &BackfillScope,
        ) -> Result<Vec<ShareRecord>, BackfillError> {
            Ok(self.shares.clone())
        }

        async fn engagement_records(
            &self,
            _scope: &BackfillScope,
        ) -> Result<Vec<EngagementRecord>, BackfillError> {
            Ok(self.engagements.clone())
        }
    }

    fn scope() -> BackfillScope {
        BackfillScope {
            brand_campaign_id: "BC1".to_owned(),
        }
    }

    #[tokio::test]
    async fn replays_history_into_transactions() {
        let recorder = Recorder::new(MemoryStore::new());
        let source = VecSource {
            shares: vec![share("9876543210", Some(42), at(1, 9, 0))],
            engagements: vec![
                engagement("9876543210", EngagementKind::Opened, at(1, 9, 5)),
                engagement(
                    "9876543210",
                    EngagementKind::PdfProgress {
                        last_page: 7,
                        total_pages: Some(10),
                        completed: false,
                    },
                    at(1, 9, 7),
                ),
                engagement(
                    "9876543210",
                    EngagementKind::VideoProgress { percentage: 60 },
                    at(1, 9, 10),
                ),
            ],
        };

        let job = BackfillJob::new(&recorder, &source, business_offset(0));
        let report = job.run(&scope()).await.unwrap();

        assert!(report.is_clean());
        assert_eq!(report.shares_replayed, 1);
        assert_eq!(report.engagements_replayed, 3);

        let rows = recorder.store().snapshot();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.sent_at, Some(at(1, 9, 0)));
        assert_eq!(row.viewed_at, Some(at(1, 9, 5)));
        assert_eq!(row.last_page_scrolled, 7);
        assert_eq!(row.last_video_percentage, 60);
        assert!(row.video_view_gt_50);
        assert_eq!(row.total_video_events, 1);
        assert_eq!(row.share_channel, "whatsapp");
        assert_eq!(row.brand_campaign_id, "BC1");
    }

    #[tokio::test]
    async fn running_twice_changes_nothing() {
        let recorder = Recorder::new(MemoryStore::new());
        let source = VecSource {
            shares: vec![
                share("9876543210", Some(42), at(1, 9, 0)),
                share("9999999999", Some(43), at(1, 10, 0)),
            ],
            engagements: vec![
                engagement("9876543210", EngagementKind::Opened, at(1, 9, 5)),
                engagement(
                    "9876543210",
                    EngagementKind::VideoProgress { percentage: 40 },
                    at(1, 9, 6),
                ),
                engagement(
                    "9876543210",
                    EngagementKind::VideoProgress { percentage: 80 },
                    at(1, 9, 8),
                ),
            ],
        };

        let job = BackfillJob::new(&recorder, &source, business_offset(0));
        job.run(&scope()).await.unwrap();
        let first = recorder.store().snapshot();

        job.run(&scope()).await.unwrap();
        let second = recorder.store().snapshot();

        assert_eq!(first, second);
        assert_eq!(first[0].total_video_events, 2);
    }

    #[tokio::test]
    async fn replay_is_sorted_by_event_time_not_discovery_order() {
        let recorder = Recorder::new(MemoryStore::new());
        // The later share is discovered first; the earlier one must still
        // own sent_at.
        let source = VecSource {
            shares: vec![
                share("9876543210", Some(42), at(1, 11, 0)),
                share("9876543210", Some(42), at(1, 9, 0)),
            ],
            engagements: vec![],
        };

        let job = BackfillJob::new(&recorder, &source, business_offset(0));
        job.run(&scope()).await.unwrap();

        let rows = recorder.store().snapshot();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sent_at, Some(at(1, 9, 0)));
    }

    #[tokio::test]
    async fn malformed_rows_are_reported_not_fatal() {
        let recorder = Recorder::new(MemoryStore::new());
        let source = VecSource {
            shares: vec![
                share("123", Some(42), at(1, 9, 0)),    // phone too short
                share("9876543210", None, at(1, 9, 1)), // no collateral
                share("9876543210", Some(42), at(1, 9, 2)),
            ],
            engagements: vec![
                engagement(
                    "9876543210",
                    EngagementKind::VideoProgress { percentage: 250 },
                    at(1, 9, 5),
                ),
                engagement("9876543210", EngagementKind::Opened, at(1, 9, 6)),
            ],
        };

        let job = BackfillJob::new(&recorder, &source, business_offset(0));
        let report = job.run(&scope()).await.unwrap();

        assert_eq!(report.shares_replayed, 1);
        assert_eq!(report.engagements_replayed, 1);
        assert_eq!(report.failures.len(), 3);

        let rows = recorder.store().snapshot();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].has_viewed);
        // The bogus percentage never landed.
        assert_eq!(rows[0].total_video_events, 0);
    }

    #[tokio::test]
    async fn record_brand_wins_over_scope_fallback() {
        let recorder = Recorder::new(MemoryStore::new());
        let mut branded = share("9876543210", Some(42), at(1, 9, 0));
        branded.brand_campaign_id = Some("BC9".to_owned());
        let source = VecSource {
            shares: vec![branded, share("9999999999", Some(42), at(1, 9, 1))],
            engagements: vec![],
        };

        let job = BackfillJob::new(&recorder, &source, business_offset(0));
        job.run(&scope()).await.unwrap();

        let rows = recorder.store().snapshot();
        let brands: Vec<&str> = rows
            .iter()
            .map(|row| row.brand_campaign_id.as_str())
            .collect();
        assert!(brands.contains(&"BC9"));
        assert!(brands.contains(&"BC1"));
    }
}

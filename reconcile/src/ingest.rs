use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Deserialize;
use thiserror::Error;
use tracing::instrument;

use crate::identity::Identity;
use crate::store::{StoreError, TransactionStore};
use crate::transaction::{EngagementEvent, Transaction};

/// Enumeration of errors raised when an engagement payload cannot be
/// ingested. Bad values are rejected rather than coerced to zero; a zeroed
/// value would read as "reset the watermark", which a client bug must never
/// be able to express.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("{0} is not a valid page number")]
    InvalidPage(i64),
    #[error("{0} is not a valid page count")]
    InvalidPageCount(i64),
    #[error("{0} is not a valid watch percentage")]
    InvalidPercentage(i64),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Descriptive columns carried along with a share event.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShareContext {
    pub channel: Option<String>,
    pub field_rep_email: Option<String>,
    pub doctor_name: Option<String>,
}

/// The small JSON body the content viewer posts back while a doctor reads
/// or watches. Fields the client has nothing to say about are omitted, not
/// zeroed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProgressPayload {
    pub last_page: Option<i64>,
    #[serde(default)]
    pub pdf_completed: bool,
    pub pdf_total_pages: Option<i64>,
    pub video_pct: Option<i64>,
}

impl ProgressPayload {
    pub fn is_empty(&self) -> bool {
        self.last_page.is_none() && !self.pdf_completed && self.video_pct.is_none()
    }
}

/// Front door for all engagement writes. Every operation is
/// get-or-create-then-merge against the store, so events arriving before
/// their originating share (or twice, or out of order) still fold into the
/// single correct row.
///
/// Callers in request flows are expected to log-and-swallow the returned
/// errors: losing one progress ping must never fail the page serving it.
pub struct Recorder<S> {
    store: S,
}

impl<S: TransactionStore> Recorder<S> {
    pub fn new(store: S) -> Recorder<S> {
        Recorder { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Records that a rep shared this collateral with this doctor. First
    /// share of the day owns `sent_at`.
    #[instrument(skip_all, fields(transaction_id = %identity.transaction_id()))]
    pub async fn record_sent(
        &self,
        identity: &Identity,
        context: ShareContext,
        at: DateTime<Utc>,
    ) -> Result<Transaction, IngestError> {
        self.apply(
            identity,
            EngagementEvent::Sent {
                at,
                channel: context.channel,
                field_rep_email: context.field_rep_email,
                doctor_name: context.doctor_name,
            },
        )
        .await
    }

    /// Records that the doctor opened the shared link.
    #[instrument(skip_all, fields(transaction_id = %identity.transaction_id()))]
    pub async fn mark_viewed(
        &self,
        identity: &Identity,
        at: DateTime<Utc>,
    ) -> Result<Transaction, IngestError> {
        self.apply(identity, EngagementEvent::Viewed { at }).await
    }

    /// Records a PDF scroll position. The stored page is a watermark; a
    /// stale retry reporting an earlier page is a silent no-op.
    #[instrument(skip_all, fields(transaction_id = %identity.transaction_id(), last_page))]
    pub async fn mark_pdf_progress(
        &self,
        identity: &Identity,
        last_page: i64,
        total_pages: Option<i64>,
        completed: bool,
        at: DateTime<Utc>,
    ) -> Result<Transaction, IngestError> {
        if !(0..=i64::from(i32::MAX)).contains(&last_page) {
            return Err(IngestError::InvalidPage(last_page));
        }
        if let Some(total) = total_pages {
            if !(1..=i64::from(i32::MAX)).contains(&total) {
                return Err(IngestError::InvalidPageCount(total));
            }
        }

        self.apply(
            identity,
            EngagementEvent::PdfProgress {
                last_page: last_page as i32,
                total_pages: total_pages.map(|total| total as i32),
                completed,
                at,
            },
        )
        .await
    }

    /// Records that the doctor was granted (and took) the PDF download.
    #[instrument(skip_all, fields(transaction_id = %identity.transaction_id()))]
    pub async fn mark_downloaded_pdf(
        &self,
        identity: &Identity,
        at: DateTime<Utc>,
    ) -> Result<Transaction, IngestError> {
        self.apply(identity, EngagementEvent::PdfDownloaded { at })
            .await
    }

    /// Records one video progress tick. Every tick bumps the raw counter;
    /// the percentage watermark and the tier flags only move forward.
    #[instrument(skip_all, fields(transaction_id = %identity.transaction_id(), percentage))]
    pub async fn mark_video_progress(
        &self,
        identity: &Identity,
        percentage: i64,
        at: DateTime<Utc>,
    ) -> Result<Transaction, IngestError> {
        if !(0..=100).contains(&percentage) {
            return Err(IngestError::InvalidPercentage(percentage));
        }

        self.apply(
            identity,
            EngagementEvent::VideoProgress {
                percentage: percentage as i32,
                at,
            },
        )
        .await
    }

    /// Replay path for historical video ticks: watermark and tiers only,
    /// the raw tick counter is reconciled once per backfill run via
    /// `reconcile_video_ticks`.
    pub(crate) async fn replay_video_progress(
        &self,
        identity: &Identity,
        percentage: i64,
        at: DateTime<Utc>,
    ) -> Result<Transaction, IngestError> {
        if !(0..=100).contains(&percentage) {
            return Err(IngestError::InvalidPercentage(percentage));
        }

        self.apply(
            identity,
            EngagementEvent::VideoProgressReplay {
                percentage: percentage as i32,
                at,
            },
        )
        .await
    }

    /// Lifts the tick counter to the historical tick count, if higher.
    pub(crate) async fn reconcile_video_ticks(
        &self,
        identity: &Identity,
        count: i32,
    ) -> Result<Transaction, IngestError> {
        self.apply(identity, EngagementEvent::VideoTicksObserved { count })
            .await
    }

    /// Dispatches a client progress payload to the matching operations.
    /// Returns the row after the last applied event, or None for an empty
    /// payload.
    pub async fn apply_progress(
        &self,
        identity: &Identity,
        payload: &ProgressPayload,
        at: DateTime<Utc>,
    ) -> Result<Option<Transaction>, IngestError> {
        let mut latest = None;

        if payload.last_page.is_some() || payload.pdf_completed {
            let last_page = payload.last_page.unwrap_or(0);
            latest = Some(
                self.mark_pdf_progress(
                    identity,
                    last_page,
                    payload.pdf_total_pages,
                    payload.pdf_completed,
                    at,
                )
                .await?,
            );
        }

        if let Some(pct) = payload.video_pct {
            latest = Some(self.mark_video_progress(identity, pct, at).await?);
        }

        Ok(latest)
    }

    async fn apply(
        &self,
        identity: &Identity,
        event: EngagementEvent,
    ) -> Result<Transaction, IngestError> {
        let kind = event.kind();
        let (row, changed) = self.store.apply(identity, &event).await?;

        if changed {
            counter!("reconcile_events_ingested_total", "event" => kind).increment(1);
        } else {
            counter!("reconcile_events_noop_total", "event" => kind).increment(1);
            tracing::debug!(
                transaction_id = %row.transaction_id(),
                event = kind,
                "event did not advance any field"
            );
        }

        Ok(row)
    }
}

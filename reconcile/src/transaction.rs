use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::identity::Identity;

/// A single engagement signal after identity resolution. Every mutation of a
/// transaction row goes through one of these; callers never poke fields
/// directly, so the one-way flag and watermark rules live in exactly one
/// place.
#[derive(Debug, Clone, PartialEq)]
pub enum EngagementEvent {
    Sent {
        at: DateTime<Utc>,
        channel: Option<String>,
        field_rep_email: Option<String>,
        doctor_name: Option<String>,
    },
    Viewed {
        at: DateTime<Utc>,
    },
    PdfProgress {
        last_page: i32,
        total_pages: Option<i32>,
        completed: bool,
        at: DateTime<Utc>,
    },
    PdfDownloaded {
        at: DateTime<Utc>,
    },
    VideoProgress {
        percentage: i32,
        at: DateTime<Utc>,
    },
    /// Replay-only flavor of `VideoProgress`: advances the watermark and the
    /// tier flags but leaves the raw tick counter alone, so re-running the
    /// backfill cannot inflate it.
    VideoProgressReplay {
        percentage: i32,
        at: DateTime<Utc>,
    },
    /// Replay-only: lifts the tick counter to the number of historical
    /// ticks observed for this identity. A watermark, so replays converge
    /// instead of accumulating.
    VideoTicksObserved {
        count: i32,
    },
}

impl EngagementEvent {
    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            EngagementEvent::Sent { .. } => "sent",
            EngagementEvent::Viewed { .. } => "viewed",
            EngagementEvent::PdfProgress { .. } => "pdf_progress",
            EngagementEvent::PdfDownloaded { .. } => "pdf_downloaded",
            EngagementEvent::VideoProgress { .. } => "video_progress",
            EngagementEvent::VideoProgressReplay { .. } => "video_progress_replay",
            EngagementEvent::VideoTicksObserved { .. } => "video_ticks_observed",
        }
    }
}

/// The aggregate root: cumulative engagement state for one rep, doctor,
/// collateral and calendar day.
///
/// Progress only ever moves forward. Booleans flip false to true once,
/// watermarks only rise, and first-crossing timestamps are never
/// overwritten. `updated_at` moves on every accepted mutation and is the
/// "latest snapshot" marker reporting keys on.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Transaction {
    pub brand_campaign_id: String,
    pub field_rep_id: i64,
    pub doctor_number: String,
    pub doctor_display: String,
    pub collateral_id: i64,
    pub transaction_date: NaiveDate,

    pub sent_at: Option<DateTime<Utc>>,
    pub share_channel: String,
    pub field_rep_email: String,
    pub doctor_name: String,

    pub has_viewed: bool,
    pub viewed_at: Option<DateTime<Utc>>,
    pub has_downloaded_pdf: bool,
    pub downloaded_pdf_at: Option<DateTime<Utc>>,

    pub last_page_scrolled: i32,
    pub pdf_total_pages: i32,
    pub has_viewed_last_page: bool,
    pub viewed_last_page_at: Option<DateTime<Utc>>,

    pub video_view_lt_50: bool,
    pub video_view_lt_50_at: Option<DateTime<Utc>>,
    pub video_view_gt_50: bool,
    pub video_view_gt_50_at: Option<DateTime<Utc>>,
    pub video_view_100: bool,
    pub video_view_100_at: Option<DateTime<Utc>>,
    pub last_video_percentage: i32,
    pub total_video_events: i32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// A brand new row for this identity with all flags down and all
    /// watermarks at zero.
    pub fn fresh(identity: &Identity, now: DateTime<Utc>) -> Transaction {
        Transaction {
            brand_campaign_id: identity.brand_campaign_id.clone(),
            field_rep_id: identity.field_rep_id,
            doctor_number: identity.doctor.canonical().to_owned(),
            doctor_display: identity.doctor.display().to_owned(),
            collateral_id: identity.collateral_id,
            transaction_date: identity.transaction_date,

            sent_at: None,
            share_channel: String::new(),
            field_rep_email: String::new(),
            doctor_name: String::new(),

            has_viewed: false,
            viewed_at: None,
            has_downloaded_pdf: false,
            downloaded_pdf_at: None,

            last_page_scrolled: 0,
            pdf_total_pages: 0,
            has_viewed_last_page: false,
            viewed_last_page_at: None,

            video_view_lt_50: false,
            video_view_lt_50_at: None,
            video_view_gt_50: false,
            video_view_gt_50_at: None,
            video_view_100: false,
            video_view_100_at: None,
            last_video_percentage: 0,
            total_video_events: 0,

            created_at: now,
            updated_at: now,
        }
    }

    /// The human-auditable composite id.
    pub fn transaction_id(&self) -> String {
        format!(
            "{}*{}*{}",
            self.field_rep_id, self.doctor_number, self.collateral_id
        )
    }

    /// Folds one event into this row. Returns whether anything changed so
    /// the stores can skip the write (and the metrics can count no-ops).
    pub fn apply(&mut self, event: &EngagementEvent) -> bool {
        let changed = match event {
            EngagementEvent::Sent {
                at,
                channel,
                field_rep_email,
                doctor_name,
            } => self.apply_sent(*at, channel, field_rep_email, doctor_name),
            EngagementEvent::Viewed { at } => self.apply_viewed(*at),
            EngagementEvent::PdfProgress {
                last_page,
                total_pages,
                completed,
                at,
            } => self.apply_pdf_progress(*last_page, *total_pages, *completed, *at),
            EngagementEvent::PdfDownloaded { at } => self.apply_pdf_downloaded(*at),
            EngagementEvent::VideoProgress { percentage, at } => {
                self.apply_video_progress(*percentage, *at)
            }
            EngagementEvent::VideoProgressReplay { percentage, at } => {
                self.apply_video_watermarks(*percentage, *at)
            }
            EngagementEvent::VideoTicksObserved { count } => {
                raise_watermark(&mut self.total_video_events, *count)
            }
        };

        if changed {
            self.updated_at = Utc::now();
        }

        changed
    }

    fn apply_sent(
        &mut self,
        at: DateTime<Utc>,
        channel: &Option<String>,
        field_rep_email: &Option<String>,
        doctor_name: &Option<String>,
    ) -> bool {
        let mut changed = false;

        if self.sent_at.is_none() {
            self.sent_at = Some(at);
            changed = true;
        }

        changed |= sync_metadata(&mut self.share_channel, channel);
        changed |= sync_metadata(&mut self.field_rep_email, field_rep_email);
        changed |= sync_metadata(&mut self.doctor_name, doctor_name);

        changed
    }

    fn apply_viewed(&mut self, at: DateTime<Utc>) -> bool {
        raise_flag(&mut self.has_viewed, &mut self.viewed_at, at)
    }

    fn apply_pdf_progress(
        &mut self,
        last_page: i32,
        total_pages: Option<i32>,
        completed: bool,
        at: DateTime<Utc>,
    ) -> bool {
        let mut changed = raise_watermark(&mut self.last_page_scrolled, last_page);

        if let Some(total) = total_pages {
            if total > 0 && total != self.pdf_total_pages {
                self.pdf_total_pages = total;
                changed = true;
            }
        }

        if completed {
            changed |= raise_flag(
                &mut self.has_viewed_last_page,
                &mut self.viewed_last_page_at,
                at,
            );
        }

        // Scrolling the document is proof the doctor opened it.
        changed |= raise_flag(&mut self.has_viewed, &mut self.viewed_at, at);

        changed
    }

    fn apply_pdf_downloaded(&mut self, at: DateTime<Utc>) -> bool {
        let mut changed = raise_flag(
            &mut self.has_downloaded_pdf,
            &mut self.downloaded_pdf_at,
            at,
        );
        changed |= raise_flag(&mut self.has_viewed, &mut self.viewed_at, at);
        changed
    }

    fn apply_video_progress(&mut self, percentage: i32, at: DateTime<Utc>) -> bool {
        // Raw tick counter, counts every ping regardless of the watermark.
        self.total_video_events += 1;
        self.apply_video_watermarks(percentage, at);
        true
    }

    fn apply_video_watermarks(&mut self, percentage: i32, at: DateTime<Utc>) -> bool {
        let mut changed = raise_watermark(&mut self.last_video_percentage, percentage);

        // Tiers are cumulative: a jump straight to 100% backfills the lower
        // crossings with the same timestamp.
        if percentage >= 100 {
            changed |= raise_flag(&mut self.video_view_lt_50, &mut self.video_view_lt_50_at, at);
            changed |= raise_flag(&mut self.video_view_gt_50, &mut self.video_view_gt_50_at, at);
            changed |= raise_flag(&mut self.video_view_100, &mut self.video_view_100_at, at);
        } else if percentage >= 50 {
            changed |= raise_flag(&mut self.video_view_lt_50, &mut self.video_view_lt_50_at, at);
            changed |= raise_flag(&mut self.video_view_gt_50, &mut self.video_view_gt_50_at, at);
        } else if percentage > 0 {
            changed |= raise_flag(&mut self.video_view_lt_50, &mut self.video_view_lt_50_at, at);
        }

        changed |= raise_flag(&mut self.has_viewed, &mut self.viewed_at, at);

        changed
    }
}

/// false -> true only, and the first-crossing timestamp is written once.
fn raise_flag(flag: &mut bool, stamp: &mut Option<DateTime<Utc>>, at: DateTime<Utc>) -> bool {
    let mut changed = false;

    if !*flag {
        *flag = true;
        changed = true;
    }
    if stamp.is_none() {
        *stamp = Some(at);
        changed = true;
    }

    changed
}

/// Watermarks only rise; a lower candidate is a silent no-op.
fn raise_watermark(current: &mut i32, candidate: i32) -> bool {
    if candidate > *current {
        *current = candidate;
        true
    } else {
        false
    }
}

/// Best-effort sync of descriptive columns carried along with the share.
fn sync_metadata(current: &mut String, candidate: &Option<String>) -> bool {
    match candidate {
        Some(value) if !value.is_empty() && value != current => {
            *current = value.clone();
            true
        }
        _ => false,
    }
}

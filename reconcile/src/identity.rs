use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Anything shorter than this is not a dialable number, reject it outright
/// rather than letting a truncated identifier fan out into its own row.
const MIN_PHONE_DIGITS: usize = 8;

/// Numbers are compared on their last 10 digits so that `+91 98765 43210`,
/// `919876543210` and `9876543210` all address the same doctor.
const MATCH_DIGITS: usize = 10;

/// Default business timezone offset for day bucketing (IST), in minutes.
pub const DEFAULT_BUSINESS_UTC_OFFSET_MINUTES: i32 = 330;

/// Enumeration of errors raised while resolving raw identifiers into a
/// transaction identity.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum IdentityError {
    #[error("doctor identifier {0:?} has too few digits to be a phone number")]
    PhoneTooShort(String),
    #[error("field rep could not be resolved (id={id:?}, email={email:?})")]
    RepNotFound {
        id: Option<i64>,
        email: Option<String>,
    },
    #[error("record does not reference a collateral")]
    MissingCollateral,
    #[error("rep directory lookup failed with: {0}")]
    DirectoryError(String),
}

/// A doctor phone number reduced to a stable matching key.
///
/// The canonical form is what uniqueness (and therefore row identity) is
/// keyed on; the full digit string is kept around for display so we never
/// lose the country code the rep originally typed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NormalizedPhone {
    canonical: String,
    display: String,
}

impl NormalizedPhone {
    pub fn parse(raw: &str) -> Result<NormalizedPhone, IdentityError> {
        let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();

        if digits.len() < MIN_PHONE_DIGITS {
            return Err(IdentityError::PhoneTooShort(raw.to_owned()));
        }

        let canonical = if digits.len() > MATCH_DIGITS {
            digits[digits.len() - MATCH_DIGITS..].to_owned()
        } else {
            digits.clone()
        };

        Ok(NormalizedPhone {
            canonical,
            display: digits,
        })
    }

    /// The last-10-digits matching key. Row identity is keyed on this.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    /// The fullest digit string we saw, country code included.
    pub fn display(&self) -> &str {
        &self.display
    }

    pub fn matches(&self, other: &NormalizedPhone) -> bool {
        self.canonical == other.canonical
    }
}

/// The business key addressing exactly one transaction row: one engagement
/// episode per rep, doctor, collateral and calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub brand_campaign_id: String,
    pub field_rep_id: i64,
    pub doctor: NormalizedPhone,
    pub collateral_id: i64,
    pub transaction_date: NaiveDate,
}

/// Lookup key shared by the stores: the four columns under the uniqueness
/// constraint.
pub type IdentityKey = (i64, String, i64, NaiveDate);

impl Identity {
    /// Buckets `at` into a calendar day using the business timezone. A new
    /// day for the same (rep, doctor, collateral) triple is a new row, not
    /// an update to yesterday's.
    pub fn new(
        brand_campaign_id: impl Into<String>,
        field_rep_id: i64,
        doctor: NormalizedPhone,
        collateral_id: i64,
        at: DateTime<Utc>,
        business_offset: FixedOffset,
    ) -> Identity {
        Identity {
            brand_campaign_id: brand_campaign_id.into(),
            field_rep_id,
            doctor,
            collateral_id,
            transaction_date: at.with_timezone(&business_offset).date_naive(),
        }
    }

    pub fn key(&self) -> IdentityKey {
        (
            self.field_rep_id,
            self.doctor.canonical().to_owned(),
            self.collateral_id,
            self.transaction_date,
        )
    }

    /// Human-auditable composite id, day implicit via the uniqueness
    /// constraint.
    pub fn transaction_id(&self) -> String {
        format!(
            "{}*{}*{}",
            self.field_rep_id,
            self.doctor.canonical(),
            self.collateral_id
        )
    }
}

/// Builds the business timezone offset from a minutes-east-of-UTC setting.
pub fn business_offset(minutes_east: i32) -> FixedOffset {
    FixedOffset::east_opt(minutes_east * 60)
        .unwrap_or_else(|| FixedOffset::east_opt(DEFAULT_BUSINESS_UTC_OFFSET_MINUTES * 60).unwrap())
}

/// A raw field rep reference as it arrives from legacy rows: sometimes an
/// id, sometimes only an email.
#[derive(Debug, Clone, Default)]
pub struct RepRef {
    pub id: Option<i64>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepRecord {
    pub id: i64,
    pub email: String,
}

/// What to do when no directory strategy matched. The legacy system silently
/// fabricated placeholder reps; here that is an explicit, logged opt-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingRepPolicy {
    Reject,
    CreatePlaceholder,
}

/// Lookup surface for field reps, implemented against whatever master table
/// the deployment has.
#[async_trait]
pub trait RepDirectory {
    async fn by_id(&self, id: i64) -> Result<Option<RepRecord>, IdentityError>;
    async fn by_email(&self, email: &str) -> Result<Option<RepRecord>, IdentityError>;
    async fn create_placeholder(&self, email: &str) -> Result<RepRecord, IdentityError>;
}

/// Ranked resolution of a rep reference: by id first, then by email, then
/// the terminal not-found case. Placeholder creation only happens under the
/// opt-in policy and is always logged.
pub async fn resolve_rep<D: RepDirectory + ?Sized>(
    directory: &D,
    rep: &RepRef,
    policy: MissingRepPolicy,
) -> Result<RepRecord, IdentityError> {
    if let Some(id) = rep.id {
        if let Some(found) = directory.by_id(id).await? {
            return Ok(found);
        }
    }

    if let Some(email) = rep.email.as_deref() {
        if let Some(found) = directory.by_email(email).await? {
            return Ok(found);
        }

        if policy == MissingRepPolicy::CreatePlaceholder {
            warn!(email, "field rep not found in directory, creating placeholder");
            return directory.create_placeholder(email).await;
        }
    }

    Err(IdentityError::RepNotFound {
        id: rep.id,
        email: rep.email.clone(),
    })
}

//! Per-profile quota decision.

use chrono::{DateTime, Utc};

use crate::types::{QuotaIncrement, UserQuotaRecord};

/// What to write back for one candidate in a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Daily limit already reached: turn the auto-scraper off, leave the counters alone.
    Disable { today_count: u32, daily_limit: u32 },
    /// Count one more application.
    Increment(QuotaIncrement),
}

impl Decision {
    pub fn is_disable(&self) -> bool {
        matches!(self, Decision::Disable { .. })
    }

    pub fn as_increment(&self) -> Option<&QuotaIncrement> {
        match self {
            Decision::Increment(increment) => Some(increment),
            Decision::Disable { .. } => None,
        }
    }
}

/// Decide the write for `record` at `now`.
///
/// The daily counter rolls over when the UTC calendar date of the last counted application
/// differs from that of `now` (or there is none). The rolled-over value is only used for
/// the limit check and the new count; it is persisted as part of the increment, never as a
/// separate reset. A stored count at or above the limit on the same day disables the
/// profile instead of incrementing it.
pub fn decide(record: &UserQuotaRecord, now: DateTime<Utc>) -> Decision {
    let daily_limit = record.subscription_tier.daily_limit();
    let today = now.date_naive();
    let is_new_day = record.last_application_date.map(|ts| ts.date_naive()) != Some(today);

    let today_count = if is_new_day { 0 } else { record.today_applications_count };

    if today_count >= daily_limit {
        return Decision::Disable {
            today_count,
            daily_limit,
        };
    }

    Decision::Increment(QuotaIncrement {
        today_applications_count: today_count + 1,
        application_count: record.application_count.saturating_add(1),
        last_application_date: now,
    })
}

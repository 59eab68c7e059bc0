//! Row types shared by the store clients and the reconciler.
//!
//! Rows come from a PostgREST projection of the `profiles` table, so decoding is lenient
//! where the table is: counters may be `null`, the tier is free text, and the last
//! application timestamp may have been written as a full timestamp or as a bare date.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, de};
use std::fmt;

/// Columns projected when fetching candidates, in PostgREST `select` syntax.
pub const CANDIDATE_COLUMNS: &str =
    "id,email,subscription_tier,today_applications_count,last_application_date,application_count";

/// Opaque profile identifier, as stored in the `id` column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Subscription tier of a profile. Determines the daily application limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    #[default]
    Free,
    Pro,
    Premium,
}

impl SubscriptionTier {
    /// Maximum number of counted applications per UTC calendar day.
    pub const fn daily_limit(self) -> u32 {
        match self {
            SubscriptionTier::Free => 5,
            SubscriptionTier::Pro => 25,
            SubscriptionTier::Premium => 50,
        }
    }

    /// Parse a tier name as stored in the table. Unrecognised names fall back to `Free`,
    /// the most restrictive tier.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "pro" => SubscriptionTier::Pro,
            "premium" => SubscriptionTier::Premium,
            _ => SubscriptionTier::Free,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            SubscriptionTier::Free => "free",
            SubscriptionTier::Pro => "pro",
            SubscriptionTier::Premium => "premium",
        }
    }
}

impl fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SubscriptionTier {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let name: Option<String> = Option::deserialize(deserializer)?;
        Ok(name.as_deref().map(SubscriptionTier::from_name).unwrap_or_default())
    }
}

/// Snapshot of one candidate profile, as read at the start of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserQuotaRecord {
    pub id: UserId,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub subscription_tier: SubscriptionTier,
    #[serde(default, deserialize_with = "deserialize_counter")]
    pub today_applications_count: u32,
    #[serde(default, deserialize_with = "deserialize_store_timestamp")]
    pub last_application_date: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "deserialize_counter")]
    pub application_count: u64,
}

impl UserQuotaRecord {
    /// Human-readable label for diagnostics: the email when present, the id otherwise.
    pub fn label(&self) -> &str {
        self.email.as_deref().unwrap_or(self.id.as_str())
    }
}

/// Counter update written back when an application is counted. Serialises directly as the
/// PATCH body for the profile row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaIncrement {
    pub today_applications_count: u32,
    pub application_count: u64,
    pub last_application_date: DateTime<Utc>,
}

/// Counters are non-negative in the table, but the columns are nullable and unconstrained:
/// `null` and negative values read as zero.
fn deserialize_counter<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<i64> + Default,
{
    let value: Option<i64> = Option::deserialize(deserializer)?;
    match value {
        None => Ok(T::default()),
        Some(v) => T::try_from(v.max(0)).map_err(|_| de::Error::custom(format!("counter value {v} out of range"))),
    }
}

fn deserialize_store_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => parse_store_timestamp(s)
            .map(Some)
            .ok_or_else(|| de::Error::custom(format!("unrecognised timestamp '{s}'"))),
    }
}

/// Parse a timestamp as PostgREST renders it. Accepts RFC 3339, Postgres' space-separated
/// form with a short offset, offset-less timestamps (taken as UTC) and bare dates
/// (midnight UTC).
pub fn parse_store_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .map(|date| date.and_time(NaiveTime::MIN).and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_daily_limits() {
        assert_eq!(SubscriptionTier::Free.daily_limit(), 5);
        assert_eq!(SubscriptionTier::Pro.daily_limit(), 25);
        assert_eq!(SubscriptionTier::Premium.daily_limit(), 50);
    }

    #[test]
    fn test_unknown_tier_is_free() {
        assert_eq!(SubscriptionTier::from_name("enterprise"), SubscriptionTier::Free);
        assert_eq!(SubscriptionTier::from_name(""), SubscriptionTier::Free);
        assert_eq!(SubscriptionTier::from_name(" Premium "), SubscriptionTier::Premium);
        assert_eq!(SubscriptionTier::from_name("PRO"), SubscriptionTier::Pro);
        assert_eq!(SubscriptionTier::from_name("enterprise").daily_limit(), 5);
    }

    #[test]
    fn test_decode_full_row() {
        let record: UserQuotaRecord = serde_json::from_value(json!({
            "id": "6b1f0c1e-8a43-4c1b-9a53-1f1c2b0d9e11",
            "email": "ada@example.com",
            "subscription_tier": "pro",
            "today_applications_count": 7,
            "last_application_date": "2025-03-01T10:15:00.123456+00:00",
            "application_count": 120
        }))
        .unwrap();

        assert_eq!(record.id.as_str(), "6b1f0c1e-8a43-4c1b-9a53-1f1c2b0d9e11");
        assert_eq!(record.label(), "ada@example.com");
        assert_eq!(record.subscription_tier, SubscriptionTier::Pro);
        assert_eq!(record.today_applications_count, 7);
        assert_eq!(record.application_count, 120);
        assert_eq!(
            record.last_application_date.unwrap().date_naive(),
            NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()
        );
    }

    #[test]
    fn test_decode_nulls_and_unknown_tier() {
        let record: UserQuotaRecord = serde_json::from_value(json!({
            "id": "u-1",
            "email": null,
            "subscription_tier": null,
            "today_applications_count": null,
            "last_application_date": null,
            "application_count": null
        }))
        .unwrap();

        assert_eq!(record.subscription_tier, SubscriptionTier::Free);
        assert_eq!(record.today_applications_count, 0);
        assert_eq!(record.application_count, 0);
        assert!(record.last_application_date.is_none());
        assert_eq!(record.label(), "u-1");

        let record: UserQuotaRecord =
            serde_json::from_value(json!({ "id": "u-2", "subscription_tier": "gold", "today_applications_count": -3 })).unwrap();
        assert_eq!(record.subscription_tier, SubscriptionTier::Free);
        assert_eq!(record.today_applications_count, 0);
    }

    #[test]
    fn test_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2025, 3, 1, 23, 30, 0).unwrap();
        assert_eq!(parse_store_timestamp("2025-03-01T23:30:00Z"), Some(expected));
        assert_eq!(parse_store_timestamp("2025-03-02T01:30:00+02:00"), Some(expected));
        assert_eq!(parse_store_timestamp("2025-03-01 23:30:00+00"), Some(expected));
        assert_eq!(parse_store_timestamp("2025-03-01T23:30:00"), Some(expected));
        assert_eq!(parse_store_timestamp("2025-03-01 23:30:00.000"), Some(expected));
        assert_eq!(
            parse_store_timestamp("2025-03-01"),
            Some(Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_store_timestamp("yesterday"), None);
    }

    #[test]
    fn test_bad_timestamp_fails_row() {
        let result: Result<UserQuotaRecord, _> =
            serde_json::from_value(json!({ "id": "u-3", "last_application_date": "not a date" }));
        assert!(result.is_err());
    }

    #[test]
    fn test_increment_serializes_as_patch_body() {
        let increment = QuotaIncrement {
            today_applications_count: 3,
            application_count: 41,
            last_application_date: Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
        };
        let body = serde_json::to_value(&increment).unwrap();
        assert_eq!(body["today_applications_count"], 3);
        assert_eq!(body["application_count"], 41);
        assert_eq!(body["last_application_date"], "2025-03-01T12:00:00Z");
        assert_eq!(body.as_object().unwrap().len(), 3);
    }
}

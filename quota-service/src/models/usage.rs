//! Metered usage model.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metered resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    AiGenerations,
    Exports,
    Projects,
    ApiCalls,
}

impl Metric {
    pub const ALL: [Metric; 4] = [
        Metric::AiGenerations,
        Metric::Exports,
        Metric::Projects,
        Metric::ApiCalls,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::AiGenerations => "ai_generations",
            Metric::Exports => "exports",
            Metric::Projects => "projects",
            Metric::ApiCalls => "api_calls",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|metric| metric.as_str() == s)
    }

    /// Conservative limit used when no plan can be resolved.
    pub fn fallback_limit(&self) -> i64 {
        match self {
            Metric::AiGenerations => 10,
            Metric::Exports => 5,
            Metric::Projects => 3,
            Metric::ApiCalls => 100,
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_string(s).ok_or_else(|| format!("unknown metric '{}'", s))
    }
}

/// First day of the calendar month containing `at`.
pub fn period_start(at: DateTime<Utc>) -> NaiveDate {
    // Day 1 of an existing month is always valid.
    NaiveDate::from_ymd_opt(at.year(), at.month(), 1).unwrap_or_else(|| at.date_naive())
}

/// Midnight UTC of the period's first day.
pub fn period_start_utc(period: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&period.and_hms_opt(0, 0, 0).unwrap_or_default())
}

/// Usage counter for one (user, metric, month).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsagePeriodRecord {
    pub user_id: Uuid,
    pub metric: Metric,
    pub period_start: NaiveDate,
    pub current_usage: i64,
    pub updated_utc: DateTime<Utc>,
}

/// Usage read model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageView {
    pub user_id: Uuid,
    pub metric: Metric,
    pub period_start: NaiveDate,
    pub current_usage: i64,
    pub limit: i64,
    pub remaining: i64,
    pub plan_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_start_is_first_of_month() {
        let at = Utc.with_ymd_and_hms(2026, 2, 28, 23, 59, 59).unwrap();
        assert_eq!(period_start(at), NaiveDate::from_ymd_opt(2026, 2, 1).unwrap());
        assert_eq!(
            period_start_utc(period_start(at)),
            Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn metric_names_round_trip() {
        for metric in Metric::ALL {
            assert_eq!(Metric::from_string(metric.as_str()), Some(metric));
        }
        assert!("storage".parse::<Metric>().is_err());
    }
}

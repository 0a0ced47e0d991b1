use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// A calendar month, the unit monthly resources and notification flags reset on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub year: i32,
    /// 1-based month
    pub month: u32,
}

impl BillingPeriod {
    pub fn containing(instant: DateTime<Utc>) -> Self {
        Self {
            year: instant.year(),
            month: instant.month(),
        }
    }

    /// Key used to detect rollover, formatted `YYYY-M` (month not zero-padded)
    pub fn key(&self) -> String {
        format!("{}-{}", self.year, self.month)
    }

    pub fn next(&self) -> Self {
        if self.month >= 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// First instant of the month
    pub fn start(&self) -> DateTime<Utc> {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|naive| Utc.from_utc_datetime(&naive))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// First instant of the following month (exclusive upper bound)
    pub fn end(&self) -> DateTime<Utc> {
        self.next().start()
    }
}

impl std::fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Source of "now". Injected so tests can move across month boundaries.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn current_period(&self) -> BillingPeriod {
        BillingPeriod::containing(self.now())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn month(year: i32, month: u32) -> BillingPeriod {
        BillingPeriod { year, month }
    }

    #[test]
    fn test_period_key_is_not_zero_padded() {
        let last_second = Utc.with_ymd_and_hms(2025, 1, 31, 23, 59, 59).unwrap();
        assert_eq!(BillingPeriod::containing(last_second).key(), "2025-1");
        assert_eq!(month(2025, 11).key(), "2025-11");
    }

    #[test]
    fn test_period_bounds() {
        let period = month(2024, 12);
        let start = Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(period.start(), start);
        assert_eq!(period.end(), end);
        assert_eq!(period.next(), month(2025, 1));
    }
}

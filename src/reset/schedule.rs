//! Cadence arithmetic and billing-anchor alignment.

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, Utc};

use crate::types::{Cadence, CadenceUnit};

/// The next reset timestamp and how many periods it skips past.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NextReset {
    pub at: DateTime<Utc>,
    /// Cycles between the previous anchor and `at`; at least 1.
    pub periods: u32,
}

/// Moves `at` forward by `cycles` cadence steps.
pub fn advance(at: DateTime<Utc>, cadence: Cadence, cycles: u32) -> Option<DateTime<Utc>> {
    let steps = cadence.count.checked_mul(cycles)?;
    match cadence.unit {
        CadenceUnit::Minute => at.checked_add_signed(Duration::minutes(steps.into())),
        CadenceUnit::Hour => at.checked_add_signed(Duration::hours(steps.into())),
        CadenceUnit::Day => at.checked_add_signed(Duration::days(steps.into())),
        CadenceUnit::Month => at.checked_add_months(Months::new(steps)),
        CadenceUnit::Year => at.checked_add_months(Months::new(steps.checked_mul(12)?)),
    }
}

/// Smallest whole number of cycles after `previous` that lands after `now`.
///
/// The cadence is anchored on `previous`, never on `now`, so late resets keep
/// the billing schedule.
pub fn next_after(previous: DateTime<Utc>, cadence: Cadence, now: DateTime<Utc>) -> Option<NextReset> {
    let mut periods = match fixed_step(cadence) {
        Some(step) if now > previous => {
            let elapsed = (now - previous).num_milliseconds();
            let step = step.num_milliseconds().max(1);
            u32::try_from(elapsed / step).ok()?.max(1)
        }
        _ => 1,
    };

    loop {
        let at = advance(previous, cadence, periods)?;
        if at > now {
            return Some(NextReset { at, periods });
        }
        periods = periods.checked_add(1)?;
    }
}

fn fixed_step(cadence: Cadence) -> Option<Duration> {
    let count = i64::from(cadence.count);
    match cadence.unit {
        CadenceUnit::Minute => Some(Duration::minutes(count)),
        CadenceUnit::Hour => Some(Duration::hours(count)),
        CadenceUnit::Day => Some(Duration::days(count)),
        CadenceUnit::Month | CadenceUnit::Year => None,
    }
}

/// Whether a computed reset date may need correcting against the billing
/// anchor: month/year cadences landing on day 28 or later.
pub fn needs_anchor_check(at: DateTime<Utc>, cadence: Cadence) -> bool {
    !cadence.is_short() && at.day() >= 28
}

/// Shifts `at` to the anchor day when the anchor falls later in the month,
/// clamped to the month's length.
pub fn align_to_anchor(at: DateTime<Utc>, anchor_day: u32) -> DateTime<Utc> {
    let day = at.day();
    if anchor_day <= day {
        return at;
    }
    let target = anchor_day.min(days_in_month(at.year(), at.month()));
    if target == day {
        return at;
    }
    at.with_day(target).unwrap_or(at)
}

pub fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_next_after_keeps_anchor_when_late() {
        let monthly = Cadence::new(CadenceUnit::Month, 1);
        let next = next_after(at(2025, 1, 15), monthly, at(2025, 3, 20)).unwrap();
        assert_eq!(next.at, at(2025, 4, 15));
        assert_eq!(next.periods, 3);
    }

    #[test]
    fn test_next_after_on_time() {
        let daily = Cadence::new(CadenceUnit::Day, 1);
        let next = next_after(at(2025, 1, 15), daily, at(2025, 1, 15)).unwrap();
        assert_eq!(next.at, at(2025, 1, 16));
        assert_eq!(next.periods, 1);
    }

    #[test]
    fn test_short_cadence_skips_many_periods_directly() {
        let minutely = Cadence::new(CadenceUnit::Minute, 5);
        let previous = at(2025, 1, 1);
        let now = previous + Duration::days(30) + Duration::seconds(1);
        let next = next_after(previous, minutely, now).unwrap();
        assert!(next.at > now);
        assert!(next.at - now <= Duration::minutes(5));
        assert_eq!(next.periods, 30 * 24 * 12 + 1);
    }

    #[test]
    fn test_month_end_clamps() {
        let monthly = Cadence::new(CadenceUnit::Month, 1);
        assert_eq!(advance(at(2025, 1, 31), monthly, 1), Some(at(2025, 2, 28)));
        assert_eq!(advance(at(2024, 1, 31), monthly, 1), Some(at(2024, 2, 29)));
    }

    #[test]
    fn test_anchor_alignment() {
        let monthly = Cadence::new(CadenceUnit::Month, 1);
        // Feb 28 computed from Jan 31 drifted to Mar 28; anchor says 31.
        let drifted = at(2025, 3, 28);
        assert!(needs_anchor_check(drifted, monthly));
        assert_eq!(align_to_anchor(drifted, 31), at(2025, 3, 31));
        assert_eq!(align_to_anchor(at(2025, 4, 28), 31), at(2025, 4, 30));
        assert_eq!(align_to_anchor(at(2025, 3, 30), 15), at(2025, 3, 30));

        assert!(!needs_anchor_check(at(2025, 3, 15), monthly));
        assert!(!needs_anchor_check(drifted, Cadence::new(CadenceUnit::Day, 1)));
    }

    #[test]
    fn test_days_in_month() {
        assert_eq!(days_in_month(2025, 2), 28);
        assert_eq!(days_in_month(2024, 2), 29);
        assert_eq!(days_in_month(2025, 12), 31);
    }
}

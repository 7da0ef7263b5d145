//! Sync window computation (`spec.md` §4.8 step 5): the `[now −
//! prev_months, now + next_months]` range a quick sync's `calendar-query`
//! time-range filter is bounded to.

use chrono::{DateTime, Months, Utc};

const DEFAULT_PREV_MONTHS: u32 = 6;
const DEFAULT_NEXT_MONTHS: u32 = 12;
const MAX_MONTHS: u32 = 120;

/// Clamps a configured month count to `spec.md`'s ≤120-month ceiling.
fn clamp_months(months: u32) -> u32 {
    months.min(MAX_MONTHS)
}

/// Computes `[now − prev_months, now + next_months]`, each clamped to
/// ≤120 months. `prev_months`/`next_months` default to 6/12 when `None`.
pub fn compute(
    now: DateTime<Utc>,
    prev_months: Option<u32>,
    next_months: Option<u32>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let prev = clamp_months(prev_months.unwrap_or(DEFAULT_PREV_MONTHS));
    let next = clamp_months(next_months.unwrap_or(DEFAULT_NEXT_MONTHS));

    let start = now.checked_sub_months(Months::new(prev)).unwrap_or(now);
    let end = now.checked_add_months(Months::new(next)).unwrap_or(now);
    (start, end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn defaults_are_six_and_twelve_months() {
        let now = Utc.with_ymd_and_hms(2026, 7, 15, 12, 0, 0).unwrap();
        let (start, end) = compute(now, None, None);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2027, 7, 15, 12, 0, 0).unwrap());
    }

    #[test]
    fn configured_months_are_honored() {
        let now = Utc.with_ymd_and_hms(2026, 7, 15, 0, 0, 0).unwrap();
        let (start, end) = compute(now, Some(1), Some(2));
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 6, 15, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 9, 15, 0, 0, 0).unwrap());
    }

    #[test]
    fn month_counts_beyond_120_are_clamped() {
        let now = Utc.with_ymd_and_hms(2026, 7, 15, 0, 0, 0).unwrap();
        let (start, _) = compute(now, Some(1000), None);
        let clamped_start = compute(now, Some(120), None).0;
        assert_eq!(start, clamped_start);
    }
}

//! Gap detection over per-day payload counts.
//!
//! A relay that normally returns thousands of payloads a day and suddenly
//! reports a few hundred most likely dropped pages during collection. Days
//! are flagged against the relay's own history and consolidated into slot
//! ranges for targeted repair.

use chrono::NaiveDate;
use mevscope_common::chain::{date_to_slot_range, SLOTS_PER_DAY};

/// A span of slots a relay is expected to have payloads for but does not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapRange {
    pub relay: String,
    pub from_slot: u64,
    pub to_slot: u64,
    /// Outlier days folded into this range.
    pub dates: Vec<NaiveDate>,
}

impl GapRange {
    pub fn estimated_missing_slots(&self) -> u64 {
        self.to_slot.saturating_sub(self.from_slot) + 1
    }
}

pub fn mean_stddev(counts: &[i64]) -> (f64, f64) {
    if counts.is_empty() {
        return (0.0, 0.0);
    }
    let n = counts.len() as f64;
    let mean = counts.iter().sum::<i64>() as f64 / n;
    let variance = counts.iter().map(|c| (*c as f64 - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

/// A day is an outlier when its count is under half the relay's mean, or
/// more than two standard deviations below it.
pub fn is_outlier(count: i64, mean: f64, stddev: f64) -> bool {
    let count = count as f64;
    if count < mean * 0.5 {
        return true;
    }
    stddev > 0.0 && count < mean - 2.0 * stddev
}

/// Flags outlier days for one relay and consolidates adjacent ones (up to
/// `max_gap_slots` apart, default one day) into repairable slot ranges.
pub fn detect_gaps(relay: &str, daily_counts: &[(NaiveDate, i64)]) -> Vec<GapRange> {
    detect_gaps_with_max_distance(relay, daily_counts, SLOTS_PER_DAY)
}

pub fn detect_gaps_with_max_distance(
    relay: &str,
    daily_counts: &[(NaiveDate, i64)],
    max_gap_slots: u64,
) -> Vec<GapRange> {
    let counts: Vec<i64> = daily_counts.iter().map(|(_, c)| *c).collect();
    let (mean, stddev) = mean_stddev(&counts);

    let mut outliers: Vec<GapRange> = daily_counts
        .iter()
        .filter(|(_, count)| is_outlier(*count, mean, stddev))
        .map(|(date, _)| {
            let (from_slot, to_slot) = date_to_slot_range(*date);
            GapRange { relay: relay.to_string(), from_slot, to_slot, dates: vec![*date] }
        })
        .collect();

    outliers.sort_by_key(|gap| gap.from_slot);
    consolidate(outliers, max_gap_slots)
}

fn consolidate(gaps: Vec<GapRange>, max_gap_slots: u64) -> Vec<GapRange> {
    let mut consolidated: Vec<GapRange> = Vec::with_capacity(gaps.len());
    for gap in gaps {
        match consolidated.last_mut() {
            Some(current) if gap.from_slot.saturating_sub(current.to_slot) <= max_gap_slots => {
                current.to_slot = current.to_slot.max(gap.to_slot);
                current.dates.extend(gap.dates);
            }
            _ => consolidated.push(gap),
        }
    }
    consolidated
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn outlier_rule() {
        // under half the mean
        assert!(is_outlier(10, 100.0, 20.0));
        // within normal range
        assert!(!is_outlier(80, 100.0, 20.0));
        // more than two stddevs below the mean
        assert!(is_outlier(50, 100.0, 20.0));
        // zero stddev disables the second rule
        assert!(!is_outlier(60, 100.0, 0.0));
    }

    #[test]
    fn mean_and_stddev() {
        let (mean, stddev) = mean_stddev(&[2, 4, 4, 4, 5, 5, 7, 9]);
        assert_eq!(mean, 5.0);
        assert_eq!(stddev, 2.0);
    }

    #[test]
    fn low_days_become_gaps() {
        let daily = vec![
            (date("2023-09-01"), 6_000),
            (date("2023-09-02"), 6_100),
            (date("2023-09-03"), 90),
            (date("2023-09-04"), 5_900),
            (date("2023-09-05"), 6_050),
        ];

        let gaps = detect_gaps("titanrelay.xyz", &daily);
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].dates, vec![date("2023-09-03")]);
        let (from, to) = date_to_slot_range(date("2023-09-03"));
        assert_eq!((gaps[0].from_slot, gaps[0].to_slot), (from, to));
    }

    #[test]
    fn adjacent_outlier_days_consolidate() {
        let daily = vec![
            (date("2023-09-01"), 6_000),
            (date("2023-09-02"), 50),
            (date("2023-09-03"), 40),
            (date("2023-09-04"), 6_000),
            (date("2023-09-10"), 30),
            (date("2023-09-11"), 6_000),
            (date("2023-09-12"), 6_000),
            (date("2023-09-13"), 6_000),
        ];

        let gaps = detect_gaps("aestus.live", &daily);
        assert_eq!(gaps.len(), 2);
        assert_eq!(gaps[0].dates, vec![date("2023-09-02"), date("2023-09-03")]);
        assert_eq!(gaps[0].to_slot, date_to_slot_range(date("2023-09-03")).1);
        assert_eq!(gaps[1].dates, vec![date("2023-09-10")]);
    }

    #[test]
    fn healthy_history_has_no_gaps() {
        let daily: Vec<_> =
            (1..=20).map(|d| (date(&format!("2023-09-{d:02}")), 6_000 + d as i64)).collect();
        assert!(detect_gaps("agnostic-relay.net", &daily).is_empty());
    }
}

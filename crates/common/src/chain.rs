//! Beacon-chain timing constants and slot math.
//!
//! `block_number` and `slot` differ by missed slots, so conversions between
//! wall-clock time and slots are always approximate from the block side but
//! exact from the slot side.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};

/// Mainnet beacon genesis: 2020-12-01 12:00:23 UTC.
pub const BEACON_GENESIS_TIMESTAMP: u64 = 1_606_824_023;

pub const SECONDS_PER_SLOT: u64 = 12;

/// (24 * 60 * 60) / 12
pub const SLOTS_PER_DAY: u64 = 7_200;

/// Approximate slot for a unix timestamp. Clamps to 0 before genesis.
pub fn timestamp_to_slot(timestamp: u64) -> u64 {
    timestamp.saturating_sub(BEACON_GENESIS_TIMESTAMP) / SECONDS_PER_SLOT
}

/// Unix timestamp of the start of a slot.
pub fn slot_to_timestamp(slot: u64) -> u64 {
    BEACON_GENESIS_TIMESTAMP + slot * SECONDS_PER_SLOT
}

/// UTC date a slot falls on.
pub fn slot_to_date(slot: u64) -> NaiveDate {
    Utc.timestamp_opt(slot_to_timestamp(slot) as i64, 0)
        .single()
        .expect("slot timestamp in range")
        .date_naive()
}

/// Inclusive `(start_slot, end_slot)` range covering a UTC day.
pub fn date_to_slot_range(date: NaiveDate) -> (u64, u64) {
    let start_of_day = date.and_hms_opt(0, 0, 0).expect("valid midnight").and_utc().timestamp();
    let end_of_day = start_of_day + 24 * 60 * 60 - 1;
    (timestamp_to_slot(start_of_day.max(0) as u64), timestamp_to_slot(end_of_day.max(0) as u64))
}

/// Datetime of the start of a slot.
pub fn slot_start(slot: u64) -> DateTime<Utc> {
    Utc.timestamp_opt(slot_to_timestamp(slot) as i64, 0).single().expect("slot timestamp in range")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_slot_is_zero() {
        assert_eq!(timestamp_to_slot(BEACON_GENESIS_TIMESTAMP), 0);
        assert_eq!(slot_to_timestamp(0), BEACON_GENESIS_TIMESTAMP);
    }

    #[test]
    fn one_day_is_7200_slots() {
        assert_eq!(timestamp_to_slot(BEACON_GENESIS_TIMESTAMP + 24 * 60 * 60), SLOTS_PER_DAY);
    }

    #[test]
    fn pre_genesis_clamps_to_zero() {
        assert_eq!(timestamp_to_slot(0), 0);
    }

    #[test]
    fn slot_round_trips_through_date() {
        let date = slot_to_date(SLOTS_PER_DAY);
        assert_eq!(date, NaiveDate::from_ymd_opt(2020, 12, 2).unwrap());

        let (start, end) = date_to_slot_range(date);
        assert!(start <= SLOTS_PER_DAY && SLOTS_PER_DAY <= end);
        assert_eq!(end - start, SLOTS_PER_DAY);
    }
}

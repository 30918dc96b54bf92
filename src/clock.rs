//! Timestamp formatting shared by the task ledger, state store, and
//! reservoir — each of which takes its timestamp as a caller-supplied
//! string rather than generating it internally, so there's exactly one
//! place that decides the wire format.

use time::{OffsetDateTime, macros::format_description};

const COMPACT: &[time::format_description::FormatItem] = format_description!("[year][month][day][hour][minute][second]");
const COMPACT_MICROS: &[time::format_description::FormatItem] =
    format_description!("[year][month][day][hour][minute][second][subsecond digits:6]");

/// `yyyymmddHHMMSS`, used for historical state snapshots and the task
/// ledger's `last_run_ts`.
pub fn compact() -> String {
    OffsetDateTime::now_utc().format(COMPACT).expect("static timestamp format is always valid")
}

/// `yyyymmddHHMMSSµµµµµµ`, used for reservoir partition filenames — a single
/// run can write several partitions within the same second.
pub fn compact_micros() -> String {
    OffsetDateTime::now_utc().format(COMPACT_MICROS).expect("static timestamp format is always valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_is_14_digits() {
        let ts = compact();
        assert_eq!(ts.len(), 14);
        assert!(ts.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn compact_micros_is_20_digits() {
        let ts = compact_micros();
        assert_eq!(ts.len(), 20);
        assert!(ts.chars().all(|c| c.is_ascii_digit()));
    }
}

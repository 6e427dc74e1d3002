//! Spool file naming: `{prefix}_{YYYYMMDD}_{HHMMSS}` plus any suffix.
//!
//! The embedded UTC timestamp orders candidates and becomes the cursor
//! value once the file is fully committed.

use chrono::NaiveDateTime;

const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const STAMP_LEN: usize = 15;

/// Timestamp embedded in a spool object key, epoch microseconds.
///
/// Only the final path segment is considered. Returns `None` for keys
/// that do not follow the naming convention for `prefix`.
pub fn parse_spool_timestamp(key: &str, prefix: &str) -> Option<i64> {
    let name = key.rsplit('/').next().unwrap_or(key);
    let rest = name.strip_prefix(prefix)?.strip_prefix('_')?;
    let stamp = rest.get(..STAMP_LEN)?;
    // Reject `..._HHMMSS7.db`: the stamp must end at a boundary.
    if rest[STAMP_LEN..].starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT)
        .ok()
        .map(|t| t.and_utc().timestamp_micros())
}

/// Name a spool file for `time_us`; the inverse of [`parse_spool_timestamp`]
pub fn spool_file_name(prefix: &str, time_us: i64, suffix: &str) -> Option<String> {
    let stamp = chrono::DateTime::from_timestamp_micros(time_us)?
        .naive_utc()
        .format(STAMP_FORMAT);
    Some(format!("{}_{}{}", prefix, stamp, suffix))
}

#[cfg(test)]
mod tests {
    use super::*;

    const JAN_1_2025_US: i64 = 1_735_689_600_000_000;

    #[test]
    fn test_parses_utc_timestamp() {
        assert_eq!(
            parse_spool_timestamp("a_20250101_000000", "a"),
            Some(JAN_1_2025_US)
        );
        assert_eq!(
            parse_spool_timestamp("spool/a_20250101_010000.db.zst", "a"),
            Some(JAN_1_2025_US + 3_600_000_000)
        );
    }

    #[test]
    fn test_rejects_foreign_names() {
        for key in [
            "b_20250101_000000.db",
            "a20250101_000000.db",
            "a_2025010_000000.db",
            "a_20251301_000000.db",
            "a_20250101_0000001.db",
            "a_",
            "notes.txt",
        ] {
            assert_eq!(parse_spool_timestamp(key, "a"), None, "{}", key);
        }
    }

    #[test]
    fn test_file_name_round_trips() {
        let name = spool_file_name("posts", JAN_1_2025_US + 61_000_000, ".db").unwrap();
        assert_eq!(name, "posts_20250101_000101.db");
        assert_eq!(
            parse_spool_timestamp(&name, "posts"),
            Some(JAN_1_2025_US + 61_000_000)
        );
    }
}

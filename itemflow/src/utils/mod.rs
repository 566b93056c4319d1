//! Run identifiers and timing helpers.

use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

/// Generates a new run id.
///
/// Ids start with the UTC start time so directory listings sort
/// chronologically; the UUID v7 suffix keeps concurrent starts distinct.
#[must_use]
pub fn generate_run_id() -> String {
    run_id_at(Utc::now(), Uuid::now_v7())
}

fn run_id_at(at: DateTime<Utc>, id: Uuid) -> String {
    let simple = id.simple().to_string();
    format!("{}-{}", at.format("%Y%m%dT%H%M%SZ"), &simple[simple.len() - 8..])
}

/// Converts a duration to whole milliseconds, saturating.
#[must_use]
pub fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_run_id_format() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let id = Uuid::parse_str("018e2a3b-0000-7000-8000-00000000abcd").unwrap();

        assert_eq!(run_id_at(at, id), "20240309T140507Z-0000abcd");
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(generate_run_id(), generate_run_id());
    }

    #[test]
    fn test_duration_ms() {
        assert_eq!(duration_ms(Duration::from_micros(2_500)), 2);
    }
}

//! Shard planner: slices a `[min, max]` interval over the split column into
//! disjoint range predicates. Predicates are half-open except the last, which
//! closes on the observed max so the final row is not lost.

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate, NaiveDateTime};

use crate::config::TimeSplitUnit;

pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Build key-mode shard predicates over an integer split column.
///
/// Steps from `min` in `batch_size` increments; each step emits
/// `col >= s and col < s + batch_size` until the step would pass `max`,
/// where the range closes: `col >= s and col <= max`.
pub fn split_key_ranges(column: &str, min: i64, max: i64, batch_size: u64) -> Vec<String> {
    let mut ranges = Vec::new();
    if max < min || batch_size == 0 {
        return ranges;
    }

    let batch = batch_size as i64;
    let mut start = min;
    loop {
        match start.checked_add(batch) {
            Some(end) if end <= max => {
                ranges.push(format!("({column} >= {start} and {column} < {end})"));
                start = end;
            }
            _ => {
                ranges.push(format!("({column} >= {start} and {column} <= {max})"));
                break;
            }
        }
    }
    ranges
}

/// Build time-mode shard predicates over a timestamp split column.
///
/// Whole buckets of one `unit` are half-open; the final (possibly partial)
/// bucket closes on the actual `max`. Endpoints render as
/// `YYYY-MM-DD HH:MM:SS`.
pub fn split_time_ranges(
    column: &str,
    min: &str,
    max: &str,
    unit: TimeSplitUnit,
) -> Result<Vec<String>> {
    let min = parse_timestamp(min)?;
    let max = parse_timestamp(max)?;

    let mut ranges = Vec::new();
    if max < min {
        return Ok(ranges);
    }
    if min == max {
        ranges.push(closed_time_range(column, min, max));
        return Ok(ranges);
    }

    let step = Duration::seconds(unit.as_secs());
    let mut start = min;
    while start < max {
        let end = start + step;
        if end >= max {
            ranges.push(closed_time_range(column, start, max));
            break;
        }
        ranges.push(format!(
            "({column} >= '{}' and {column} < '{}')",
            start.format(TIME_FORMAT),
            end.format(TIME_FORMAT)
        ));
        start = end;
    }
    Ok(ranges)
}

fn closed_time_range(column: &str, start: NaiveDateTime, end: NaiveDateTime) -> String {
    format!(
        "({column} >= '{}' and {column} <= '{}')",
        start.format(TIME_FORMAT),
        end.format(TIME_FORMAT)
    )
}

/// Accepts `YYYY-MM-DD HH:MM:SS` or a bare date (interpreted as midnight);
/// operators write date-only bounds in WHERE conditions.
fn parse_timestamp(raw: &str) -> Result<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(ts) = NaiveDateTime::parse_from_str(raw, TIME_FORMAT) {
        return Ok(ts);
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(|d| d.and_time(chrono::NaiveTime::MIN))
        .with_context(|| format!("invalid timestamp '{raw}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ranges_even_split() {
        let ranges = split_key_ranges("row_num", 1, 20, 10);
        assert_eq!(
            ranges,
            vec![
                "(row_num >= 1 and row_num < 11)",
                "(row_num >= 11 and row_num <= 20)",
            ]
        );
    }

    #[test]
    fn test_key_ranges_with_partial_tail() {
        let ranges = split_key_ranges("id", 1, 10000, 4000);
        assert_eq!(
            ranges,
            vec![
                "(id >= 1 and id < 4001)",
                "(id >= 4001 and id < 8001)",
                "(id >= 8001 and id <= 10000)",
            ]
        );
    }

    #[test]
    fn test_key_ranges_exact_boundary_emits_single_row_tail() {
        // max sits exactly on a step boundary, so the boundary row gets its
        // own closed range
        let ranges = split_key_ranges("id", 1, 21, 10);
        assert_eq!(
            ranges,
            vec![
                "(id >= 1 and id < 11)",
                "(id >= 11 and id < 21)",
                "(id >= 21 and id <= 21)",
            ]
        );
    }

    #[test]
    fn test_key_ranges_single_batch() {
        let ranges = split_key_ranges("id", 5, 7, 100);
        assert_eq!(ranges, vec!["(id >= 5 and id <= 7)"]);
    }

    #[test]
    fn test_key_ranges_empty_interval() {
        assert!(split_key_ranges("id", 10, 5, 100).is_empty());
    }

    #[test]
    fn test_key_ranges_are_disjoint_and_covering() {
        let min = 1;
        let max = 1_000;
        let batch = 37;
        let ranges = split_key_ranges("k", min, max, batch);

        // Re-parse the bounds out of the predicate strings and walk them.
        let mut expected_start = min;
        for (i, range) in ranges.iter().enumerate() {
            let nums: Vec<i64> = range
                .split(|c: char| !c.is_ascii_digit() && c != '-')
                .filter(|s| !s.is_empty())
                .filter_map(|s| s.parse().ok())
                .collect();
            let (start, end) = (nums[0], nums[1]);
            assert_eq!(start, expected_start, "gap before range {i}");
            if i + 1 == ranges.len() {
                assert!(range.contains("<="));
                assert_eq!(end, max);
            } else {
                expected_start = end;
            }
        }
        let expected_count = (max - min) as u64 / batch + 1;
        assert_eq!(ranges.len() as u64, expected_count);
    }

    #[test]
    fn test_time_ranges_hourly_with_partial_tail() {
        let ranges = split_time_ranges(
            "t",
            "2024-06-01 00:00:00",
            "2024-06-01 02:30:00",
            TimeSplitUnit::Hour,
        )
        .unwrap();
        assert_eq!(
            ranges,
            vec![
                "(t >= '2024-06-01 00:00:00' and t < '2024-06-01 01:00:00')",
                "(t >= '2024-06-01 01:00:00' and t < '2024-06-01 02:00:00')",
                "(t >= '2024-06-01 02:00:00' and t <= '2024-06-01 02:30:00')",
            ]
        );
    }

    #[test]
    fn test_time_ranges_accept_bare_dates() {
        let ranges =
            split_time_ranges("t", "2024-06-01", "2024-06-02", TimeSplitUnit::Day).unwrap();
        assert_eq!(
            ranges,
            vec!["(t >= '2024-06-01 00:00:00' and t <= '2024-06-02 00:00:00')"]
        );
    }

    #[test]
    fn test_time_ranges_quarter_unit() {
        let ranges = split_time_ranges(
            "ts",
            "2024-06-01 10:00:00",
            "2024-06-01 10:40:00",
            TimeSplitUnit::Quarter,
        )
        .unwrap();
        assert_eq!(ranges.len(), 3);
        assert!(ranges[2].contains("<= '2024-06-01 10:40:00'"));
    }

    #[test]
    fn test_time_ranges_equal_endpoints() {
        let ranges = split_time_ranges(
            "t",
            "2024-06-01 00:00:00",
            "2024-06-01 00:00:00",
            TimeSplitUnit::Minute,
        )
        .unwrap();
        assert_eq!(
            ranges,
            vec!["(t >= '2024-06-01 00:00:00' and t <= '2024-06-01 00:00:00')"]
        );
    }

    #[test]
    fn test_time_ranges_reject_garbage() {
        assert!(split_time_ranges("t", "not a time", "2024-06-01", TimeSplitUnit::Hour).is_err());
    }
}

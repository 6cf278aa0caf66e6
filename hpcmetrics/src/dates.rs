use anyhow::{bail, Result};
use chrono::{Duration, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};

/// Returns the dates inclusive between d1 and d2, ascending.  Empty if d1 > d2.

pub fn date_range(d1: NaiveDate, d2: NaiveDate) -> Vec<NaiveDate> {
    let mut date_range = Vec::new();
    let mut current_date = d1;
    while current_date <= d2 {
        date_range.push(current_date);
        match current_date.succ_opt() {
            Some(d) => current_date = d,
            None => break,
        }
    }
    date_range
}

/// Parse YYYY-MM-DD or YYYYMMDD.

pub fn parse_date(s: &str) -> Result<NaiveDate> {
    let fmt = if s.contains('-') { "%Y-%m-%d" } else { "%Y%m%d" };
    match NaiveDate::parse_from_str(s, fmt) {
        Ok(d) => Ok(d),
        Err(_) => bail!("Invalid date {s}, expected YYYY-MM-DD or YYYYMMDD"),
    }
}

/// Yesterday in local time; the default reporting day for all collectors.

pub fn yesterday() -> NaiveDate {
    Local::now().date_naive() - Duration::days(1)
}

/// The reporting bucket for an epoch timestamp: the middle of the hour it falls in.  All samples
/// finishing in the same hour share this value, which is what makes them mergeable.

pub fn hour_bucket(epoch_secs: i64) -> i64 {
    epoch_secs - epoch_secs.rem_euclid(3600) + 1800
}

/// Noon on the given date, as a local-time epoch.  Daily aggregates are stamped at noon.

pub fn midday(d: NaiveDate) -> i64 {
    local_epoch(d.and_time(NaiveTime::from_hms_opt(12, 0, 0).unwrap_or_default()))
}

/// Seconds since the epoch for a naive local time.  Ambiguous times (DST fold) take the earlier
/// instant; nonexistent times (DST gap) are treated as UTC.

pub fn local_epoch(t: NaiveDateTime) -> i64 {
    match Local.from_local_datetime(&t).earliest() {
        Some(lt) => lt.timestamp(),
        None => t.and_utc().timestamp(),
    }
}

#[test]
fn test_date_range() {
    let from = NaiveDate::from_ymd_opt(2023, 05, 30).unwrap();
    let to = NaiveDate::from_ymd_opt(2023, 06, 04).unwrap();
    let r = date_range(from, to)
        .iter()
        .map(|d| d.format("%Y-%m-%d").to_string())
        .collect::<Vec<String>>();
    assert!(r.eq(&vec![
        "2023-05-30",
        "2023-05-31",
        "2023-06-01",
        "2023-06-02",
        "2023-06-03",
        "2023-06-04"
    ]));
    assert!(date_range(to, from).is_empty());

    // The last representable date ends the range
    let last = NaiveDate::MAX;
    let r = date_range(last.pred_opt().unwrap(), last);
    assert!(r == vec![last.pred_opt().unwrap(), last]);
}

#[test]
fn test_parse_date() {
    let d = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
    assert!(parse_date("2024-01-15").unwrap() == d);
    assert!(parse_date("20240115").unwrap() == d);
    assert!(parse_date("2024-13-01").is_err());
    assert!(parse_date("yesterday").is_err());
}

#[test]
fn test_hour_bucket() {
    // 2024-01-15T10:00:00Z and 10:59:59Z land in the same bucket, 11:00:00Z does not.
    assert!(hour_bucket(1705312800) == 1705314600);
    assert!(hour_bucket(1705316399) == 1705314600);
    assert!(hour_bucket(1705316400) == 1705318200);
}

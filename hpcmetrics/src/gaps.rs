// Derive unused ("free") lab time from the bookings of a day.
//
// For every (date, lab) bucket we walk the bookings in begin order between two zero-length
// sentinels: one that ends at the start of the operating window and one that begins at its end.
// Whenever the end of everything seen so far is strictly before the begin of the next booking
// there is a gap, which is reported with its begin time and its length in whole minutes.
//
// Only bookings that claim the slot take part (see BookingStatus::claims_slot), and bookings whose
// source id starts with an excluded prefix are ignored.  The set of buckets is every combination
// of the dates and labs of the qualifying bookings, so a lab that is booked on one day of the
// report and not on another shows up as entirely free on the other day.
//
// Labs are labelized before bucketing: calendar names that differ only in spelling ("MR 7T (new)"
// and "MR 7T(new)") are the same lab and share one bucket.

use crate::bookings::{BookingEvent, BookingRow};
use crate::dates::local_epoch;
use crate::labels::labelize;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use itertools::Itertools;
use std::collections::{BTreeMap, BTreeSet};
use std::iter;
use tracing::{debug, warn};

/// The daily operating window of the labs, in local time.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperatingWindow {
    pub begin: NaiveTime,
    pub end: NaiveTime,
}

impl Default for OperatingWindow {
    fn default() -> OperatingWindow {
        OperatingWindow {
            begin: NaiveTime::from_hms_opt(8, 30, 0).unwrap_or_default(),
            end: NaiveTime::from_hms_opt(18, 0, 0).unwrap_or_default(),
        }
    }
}

impl OperatingWindow {
    pub fn day_start(&self, d: NaiveDate) -> NaiveDateTime {
        d.and_time(self.begin)
    }

    pub fn day_end(&self, d: NaiveDate) -> NaiveDateTime {
        d.and_time(self.end)
    }
}

/// A maximal unbooked part of the operating window of one lab on one day.  `lab` is labelized.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapInterval {
    pub lab: String,
    pub date: NaiveDate,
    pub begin: NaiveDateTime,
    pub duration_minutes: i64,
}

impl GapInterval {
    /// Local-time epoch of the gap's begin, the timestamp of the datapoint.
    pub fn timestamp(&self) -> i64 {
        local_epoch(self.begin)
    }
}

/// True iff the booking takes part in gap resolution.

pub fn qualifies(row: &BookingRow, excluded_sources: &[String]) -> bool {
    row.status().claims_slot() && !excluded_sources.iter().any(|p| row.source.starts_with(p.as_str()))
}

/// Resolve the free intervals for every (date, lab) bucket of the qualifying `rows`.  The result
/// maps each date to its gaps, ordered by lab name and then by time.
///
/// Rows whose booking time cannot be resolved are logged and skipped; their bucket still exists
/// and, if nothing else in it resolves, is free for the whole window.

pub fn resolve_gaps(
    rows: &[BookingRow],
    window: &OperatingWindow,
    excluded_sources: &[String],
) -> BTreeMap<NaiveDate, Vec<GapInterval>> {
    let qualifying = rows
        .iter()
        .filter(|r| qualifies(r, excluded_sources))
        .collect::<Vec<&BookingRow>>();

    let dates = qualifying
        .iter()
        .filter_map(|r| r.date())
        .collect::<BTreeSet<NaiveDate>>();
    let labs = qualifying
        .iter()
        .map(|r| labelize(&r.calendar))
        .collect::<BTreeSet<String>>();

    let events = qualifying
        .iter()
        .filter_map(|r| match BookingEvent::from_row(r) {
            Ok(e) => Some(BookingEvent {
                lab: labelize(&e.lab),
                ..e
            }),
            Err(e) => {
                warn!("skipping booking {} on {}: {e}", r.source, r.calendar);
                None
            }
        })
        .collect::<Vec<BookingEvent>>();

    debug!(
        "{} rows, {} qualifying, {} resolved, {} dates x {} labs",
        rows.len(),
        qualifying.len(),
        events.len(),
        dates.len(),
        labs.len()
    );

    let mut gaps = BTreeMap::new();
    for d in dates {
        let day = gaps.entry(d).or_insert_with(Vec::new);
        for lab in &labs {
            let bucket = events
                .iter()
                .filter(|e| e.lab == *lab && e.begin.date() == d)
                .collect::<Vec<&BookingEvent>>();
            day.extend(resolve_bucket(d, lab, bucket, window));
        }
    }
    gaps
}

/// The gaps of one (date, lab) bucket.  `lab` is already labelized.

fn resolve_bucket(
    date: NaiveDate,
    lab: &str,
    events: Vec<&BookingEvent>,
    window: &OperatingWindow,
) -> Vec<GapInterval> {
    let day_end = window.day_end(date);

    // `sorted_by_key` is stable, equal begin times keep their report order.
    let claims = events
        .into_iter()
        .sorted_by_key(|e| e.begin)
        .map(|e| (e.begin, e.end))
        .chain(iter::once((day_end, day_end)));

    let mut gaps = vec![];
    let mut covered_until = window.day_start(date);
    for (begin, end) in claims {
        let next = begin.min(day_end);
        if covered_until < next {
            gaps.push(GapInterval {
                lab: lab.to_string(),
                date,
                begin: covered_until,
                duration_minutes: (next - covered_until).num_minutes(),
            });
        }
        // Everything up to `next` is now either booked or reported free.
        covered_until = covered_until.max(next).max(end);
    }
    gaps
}

/// The whole operating window as a single gap, for a day without any booking data.  `lab` defaults
/// to "all".

pub fn whole_window_gap(date: NaiveDate, lab: Option<&str>, window: &OperatingWindow) -> GapInterval {
    let begin = window.day_start(date);
    GapInterval {
        lab: labelize(lab.unwrap_or("all")),
        date,
        begin,
        duration_minutes: (window.day_end(date) - begin).num_minutes(),
    }
}

#[cfg(test)]
use crate::bookings::row;

#[cfg(test)]
fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

#[cfg(test)]
fn jan15() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
}

#[cfg(test)]
fn no_exclusions() -> Vec<String> {
    vec![]
}

#[test]
fn test_empty_bucket_is_whole_window() {
    // The only booking is malformed, so the Prisma bucket exists but has no resolvable events.
    let rows = vec![row("Prisma", "3010", "CONFIRMED", "2024-01-15 (9:00-10:00)")];
    let gaps = resolve_gaps(&rows, &OperatingWindow::default(), &no_exclusions());
    let day = &gaps[&jan15()];
    assert!(day.len() == 1);
    assert!(day[0].duration_minutes == 570);
    assert!(day[0].begin == jan15().and_time(hm(8, 30)));
    assert!(day[0].lab == "Prisma");
}

#[test]
fn test_overlap_produces_no_gap() {
    let window = OperatingWindow { begin: hm(8, 0), end: hm(12, 0) };
    let rows = vec![
        row("Prisma", "3010", "CONFIRMED", "2024-01-15 (09:00-10:00)"),
        row("Prisma", "3011", "TENTATIVE", "2024-01-15 (09:30-11:00)"),
    ];
    let gaps = resolve_gaps(&rows, &window, &no_exclusions());
    let day = &gaps[&jan15()];
    assert!(day.len() == 2);
    assert!(day[0].begin == jan15().and_time(hm(8, 0)) && day[0].duration_minutes == 60);
    assert!(day[1].begin == jan15().and_time(hm(11, 0)) && day[1].duration_minutes == 60);
}

#[test]
fn test_touching_bookings_produce_no_gap() {
    let window = OperatingWindow { begin: hm(9, 0), end: hm(11, 0) };
    let rows = vec![
        row("EEG 1", "3010", "CONFIRMED", "2024-01-15 (10:00-11:00)"),
        row("EEG 1", "3011", "CANCELLEDNIT", "2024-01-15 (09:00-10:00)"),
    ];
    let gaps = resolve_gaps(&rows, &window, &no_exclusions());
    assert!(gaps[&jan15()].is_empty());
}

#[test]
fn test_nested_booking_does_not_open_gap() {
    let window = OperatingWindow { begin: hm(8, 0), end: hm(12, 0) };
    let rows = vec![
        row("Prisma", "3010", "CONFIRMED", "2024-01-15 (08:00-11:00)"),
        row("Prisma", "3011", "CONFIRMED", "2024-01-15 (09:00-09:30)"),
    ];
    let day = &resolve_gaps(&rows, &window, &no_exclusions())[&jan15()];
    assert!(day.len() == 1);
    assert!(day[0].begin == jan15().and_time(hm(11, 0)) && day[0].duration_minutes == 60);
}

#[test]
fn test_bookings_outside_window_are_clipped() {
    let window = OperatingWindow { begin: hm(8, 30), end: hm(18, 0) };
    let rows = vec![
        row("Prisma", "3010", "CONFIRMED", "2024-01-15 (07:00-09:00)"),
        row("Prisma", "3011", "CONFIRMED", "2024-01-15 (19:00-20:00)"),
    ];
    let day = &resolve_gaps(&rows, &window, &no_exclusions())[&jan15()];
    assert!(day.len() == 1);
    assert!(day[0].begin == jan15().and_time(hm(9, 0)));
    assert!(day[0].duration_minutes == 9 * 60);
}

#[test]
fn test_filtering_and_buckets() {
    let window = OperatingWindow::default();
    let excluded = vec!["3055".to_string(), "30100".to_string()];
    let rows = vec![
        row("MR 7T (new)", "3010", "CONFIRMED", "2024-01-15 (08:30-18:00)"),
        // Excluded source, does not claim the slot and does not create a bucket
        row("Skyra", "3055123", "CONFIRMED", "2024-01-15 (08:30-18:00)"),
        // Cancelled in time, does not claim the slot
        row("Prisma", "3010", "CANCELLED", "2024-01-15 (08:30-18:00)"),
        row("Prisma", "3010", "CONFIRMED", "2024-01-16 (10:00-12:00)"),
    ];
    let gaps = resolve_gaps(&rows, &window, &excluded);
    assert!(gaps.keys().copied().collect::<Vec<_>>() == vec![jan15(), jan15().succ_opt().unwrap()]);

    // 2024-01-15: MR 7T fully booked, Prisma bucket exists and is fully free.
    let d1 = &gaps[&jan15()];
    assert!(d1.len() == 1);
    assert!(d1[0].lab == "Prisma" && d1[0].duration_minutes == 570);

    // 2024-01-16: MR 7T free all day, Prisma free before and after.
    let d2 = &gaps[&jan15().succ_opt().unwrap()];
    assert!(d2.len() == 3);
    assert!(d2[0].lab == "MR_7T/new/" && d2[0].duration_minutes == 570);
    assert!(d2[1].lab == "Prisma" && d2[1].duration_minutes == 90);
    assert!(d2[2].lab == "Prisma" && d2[2].duration_minutes == 360);
    assert!(gaps.values().flatten().all(|g| g.lab != "Skyra"));
}

#[test]
fn test_reversed_booking_is_skipped() {
    let rows = vec![row("Prisma", "3010", "CONFIRMED", "2024-01-15 (11:00-10:00)")];
    let day = &resolve_gaps(&rows, &OperatingWindow::default(), &no_exclusions())[&jan15()];
    assert!(day.len() == 1);
    assert!(day[0].begin == jan15().and_time(hm(8, 30)) && day[0].duration_minutes == 570);
}

#[test]
fn test_reversed_event_does_not_overlap_gaps() {
    // Events built by hand bypass the check in BookingEvent::from_row.
    let mut e = BookingEvent::from_row(&row("Prisma", "3010", "CONFIRMED", "2024-01-15 (10:00-11:00)")).unwrap();
    std::mem::swap(&mut e.begin, &mut e.end);
    let gaps = resolve_bucket(jan15(), "Prisma", vec![&e], &OperatingWindow::default());
    assert!(gaps.len() == 2);
    assert!(gaps[0].begin == jan15().and_time(hm(8, 30)) && gaps[0].duration_minutes == 150);
    assert!(gaps[1].begin == jan15().and_time(hm(11, 0)) && gaps[1].duration_minutes == 420);
}

#[test]
fn test_labs_are_bucketed_by_label() {
    let rows = vec![
        row("MR 7T (new)", "3010", "CONFIRMED", "2024-01-15 (09:00-12:00)"),
        row("MR 7T(new)", "3011", "CONFIRMED", "2024-01-15 (13:00-18:00)"),
    ];
    let day = &resolve_gaps(&rows, &OperatingWindow::default(), &no_exclusions())[&jan15()];
    assert!(day.len() == 2);
    assert!(day.iter().all(|g| g.lab == "MR_7T/new/"));
    assert!(day[0].begin == jan15().and_time(hm(8, 30)) && day[0].duration_minutes == 30);
    assert!(day[1].begin == jan15().and_time(hm(12, 0)) && day[1].duration_minutes == 60);
}

/// The first minute of the window that is not covered by exactly one of: some event, or one gap.

#[cfg(test)]
fn first_untiled_minute(
    date: NaiveDate,
    events: &[BookingEvent],
    gaps: &[GapInterval],
    window: &OperatingWindow,
) -> Option<NaiveDateTime> {
    let mut t = window.day_start(date);
    while t < window.day_end(date) {
        let booked = events.iter().any(|e| e.begin <= t && t < e.end);
        let free = gaps
            .iter()
            .filter(|g| g.begin <= t && t < g.begin + chrono::Duration::minutes(g.duration_minutes))
            .count();
        if free > 1 || booked == (free == 1) {
            return Some(t);
        }
        t += chrono::Duration::minutes(1);
    }
    None
}

#[test]
fn test_gaps_and_bookings_tile_the_window() {
    let window = OperatingWindow::default();
    let spans = [
        ("07:45", "08:45"),
        ("09:00", "09:10"),
        ("09:05", "09:20"),
        ("11:00", "13:00"),
        ("11:30", "12:00"),
        ("12:59", "13:30"),
        ("17:00", "18:30"),
    ];
    let rows = spans
        .iter()
        .map(|(b, e)| row("Prisma", "3010", "CONFIRMED", &format!("2024-01-15 ({b}-{e})")))
        .collect::<Vec<BookingRow>>();
    let events = rows.iter().map(|r| BookingEvent::from_row(r).unwrap()).collect::<Vec<_>>();
    let gaps = &resolve_gaps(&rows, &window, &no_exclusions())[&jan15()];
    assert!(first_untiled_minute(jan15(), &events, gaps, &window).is_none());
}

#[test]
fn test_whole_window_gap() {
    let g = whole_window_gap(jan15(), None, &OperatingWindow::default());
    assert!(g.lab == "all");
    assert!(g.duration_minutes == 570);
    assert!(g.begin == jan15().and_time(hm(8, 30)));

    let window = OperatingWindow { begin: hm(8, 0), end: hm(17, 0) };
    let g = whole_window_gap(jan15(), Some("MEG lab"), &window);
    assert!(g.lab == "MEG_lab" && g.duration_minutes == 540);
}

#[cfg(test)]
mod props {
    use super::*;
    use proptest::prelude::*;

    // Begin and end anywhere in the day, in minutes; about half the spans end before they begin.
    fn spans() -> impl Strategy<Value = Vec<(u32, u32)>> {
        prop::collection::vec((0u32..1440, 0u32..1440), 0..12)
    }

    proptest! {
        #[test]
        fn gaps_and_bookings_tile_the_window(spans in spans()) {
            let window = OperatingWindow::default();
            let rows = spans
                .iter()
                .map(|(b, e)| {
                    let text = format!("2024-01-15 ({:02}:{:02}-{:02}:{:02})", b / 60, b % 60, e / 60, e % 60);
                    row("Prisma", "3010", "CONFIRMED", &text)
                })
                .collect::<Vec<BookingRow>>();
            let events = rows
                .iter()
                .filter_map(|r| BookingEvent::from_row(r).ok())
                .collect::<Vec<BookingEvent>>();
            let gaps = resolve_gaps(&rows, &window, &no_exclusions());
            let day = gaps.get(&jan15()).cloned().unwrap_or_default();
            prop_assert_eq!(first_untiled_minute(jan15(), &events, &day, &window), None);
            prop_assert!(day.iter().all(|g| g.duration_minutes > 0));
        }
    }
}

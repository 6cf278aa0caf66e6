// Lab booking report: an HTML table with one header row of <th> cells and one <tr> of <td> cells
// per booking.  The columns we care about:
//
//  Column            Required?  Content
//  ----------------  ---------  -----------------------------------------------------------
//  Source            Yes        Source id of the booking; some id prefixes are synthetic
//  Calendar          Yes        Lab / resource name, free text
//  Status            Yes        CONFIRMED, TENTATIVE, CANCELLEDNIT, CANCELLED, ...
//  Duration (hours)  Yes        Positive float; rows with zero or negative duration are dropped
//  Bookings          No         "YYYY-MM-DD (HH:MM-HH:MM)", local time
//  Project number    No         Project id, default ""
//  Billing           No         Billing code, default ""
//
// Other columns are ignored.  The report is produced by an intranet application and the markup
// is simple; cell contents have any inner tags stripped and a handful of entities decoded.

use crate::Error;

use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::OnceLock;

/// Booking status as reported.  Only some statuses claim the slot for utilization accounting, see
/// `claims_slot`.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingStatus {
    Confirmed,
    Tentative,
    /// Cancelled, but not in time: the slot was still blocked.
    CancelledNit,
    Cancelled,
    Other(String),
}

impl BookingStatus {
    pub fn claims_slot(&self) -> bool {
        matches!(
            self,
            BookingStatus::Confirmed | BookingStatus::Tentative | BookingStatus::CancelledNit
        )
    }
}

impl FromStr for BookingStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<BookingStatus, Self::Err> {
        Ok(match s.trim() {
            "CONFIRMED" => BookingStatus::Confirmed,
            "TENTATIVE" => BookingStatus::Tentative,
            "CANCELLEDNIT" => BookingStatus::CancelledNit,
            "CANCELLED" => BookingStatus::Cancelled,
            other => BookingStatus::Other(other.to_string()),
        })
    }
}

/// One row of the report, after the required-columns check.  Strings are raw (not labelized).

#[derive(Debug, Clone, PartialEq)]
pub struct BookingRow {
    pub source: String,
    pub calendar: String,
    pub project: String,
    pub status: String,
    pub bookings: String,
    pub duration_hours: f64,
    pub billing: String,
}

impl BookingRow {
    /// Build a row from a header -> cell map.  Fails if a required column is missing or the
    /// duration is not a positive number.

    pub fn from_cells(cells: &HashMap<String, String>) -> Result<BookingRow, Error> {
        let required = |k: &str| match cells.get(k) {
            Some(v) => Ok(v.clone()),
            None => Err(Error::malformed(format!("booking row without '{k}'"))),
        };
        let optional = |k: &str| cells.get(k).cloned().unwrap_or_default();

        let source = required("Source")?;
        let calendar = required("Calendar")?;
        let status = required("Status")?;
        let duration = required("Duration (hours)")?;
        let duration_hours = match f64::from_str(duration.trim()) {
            Ok(v) if v > 0.0 => v,
            Ok(_) => return Err(Error::malformed(format!("booking {source} has no duration"))),
            Err(_) => return Err(Error::malformed(format!("bad duration {duration:?}"))),
        };
        Ok(BookingRow {
            source,
            calendar,
            project: optional("Project number"),
            status,
            bookings: optional("Bookings"),
            duration_hours,
            billing: optional("Billing"),
        })
    }

    pub fn status(&self) -> BookingStatus {
        // Infallible
        BookingStatus::from_str(&self.status).unwrap_or(BookingStatus::Cancelled)
    }

    /// The date from the leading `YYYY-MM-DD` of the booking time text, if it has one.  This is
    /// available even when the time part of the text is malformed.

    pub fn date(&self) -> Option<NaiveDate> {
        let first = self.bookings.split_whitespace().next()?;
        NaiveDate::parse_from_str(first, "%Y-%m-%d").ok()
    }
}

/// A booking with resolved begin and end times.

#[derive(Debug, Clone, PartialEq)]
pub struct BookingEvent {
    pub lab: String,
    pub source: String,
    pub project: String,
    pub status: BookingStatus,
    pub begin: NaiveDateTime,
    pub end: NaiveDateTime,
}

fn booking_time_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([0-9]{4}-[0-9]{2}-[0-9]{2})\s\(([0-9]{2}:[0-9]{2})-([0-9]{2}:[0-9]{2})\)")
            .expect("static regex")
    })
}

impl BookingEvent {
    /// Resolve the booking time text of `row`.  Fails if the text does not match
    /// `YYYY-MM-DD (HH:MM-HH:MM)`, names an impossible date or time, or ends before it begins.

    pub fn from_row(row: &BookingRow) -> Result<BookingEvent, Error> {
        let malformed = || Error::malformed(format!("booking time {:?}", row.bookings));
        let caps = booking_time_re().captures(&row.bookings).ok_or_else(malformed)?;
        let at = |hm: &str| {
            NaiveDateTime::parse_from_str(&format!("{} {}:00", &caps[1], hm), "%Y-%m-%d %H:%M:%S")
                .map_err(|_| malformed())
        };
        let begin = at(&caps[2])?;
        let end = at(&caps[3])?;
        if end < begin {
            return Err(malformed());
        }
        Ok(BookingEvent {
            lab: row.calendar.clone(),
            source: row.source.clone(),
            project: row.project.clone(),
            status: row.status(),
            begin,
            end,
        })
    }
}

/// Parse the report into header -> cell maps, one per data row.  Rows without any <td> cells
/// (the header row, separators) are not returned.  Cells beyond the last header are ignored.

pub fn parse_report(html: &str) -> Vec<HashMap<String, String>> {
    static TH: OnceLock<Regex> = OnceLock::new();
    static TR: OnceLock<Regex> = OnceLock::new();
    static TD: OnceLock<Regex> = OnceLock::new();
    let th = TH.get_or_init(|| Regex::new(r"(?is)<th\b[^>]*>(.*?)</th\s*>").expect("static regex"));
    let tr = TR.get_or_init(|| Regex::new(r"(?is)<tr\b[^>]*>(.*?)</tr\s*>").expect("static regex"));
    let td = TD.get_or_init(|| Regex::new(r"(?is)<td\b[^>]*>(.*?)</td\s*>").expect("static regex"));

    let headers = th
        .captures_iter(html)
        .map(|c| cell_text(&c[1]))
        .collect::<Vec<String>>();

    let mut rows = vec![];
    for row in tr.captures_iter(html) {
        let cells = td
            .captures_iter(&row[1])
            .map(|c| cell_text(&c[1]))
            .collect::<Vec<String>>();
        if cells.is_empty() {
            continue;
        }
        rows.push(
            headers
                .iter()
                .cloned()
                .zip(cells)
                .collect::<HashMap<String, String>>(),
        );
    }
    rows
}

fn cell_text(inner: &str) -> String {
    static TAG: OnceLock<Regex> = OnceLock::new();
    let tag = TAG.get_or_init(|| Regex::new(r"<[^>]*>").expect("static regex"));
    let text = tag.replace_all(inner, "");
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
        .split_whitespace()
        .collect::<Vec<&str>>()
        .join(" ")
}

#[cfg(test)]
pub(crate) fn row(calendar: &str, source: &str, status: &str, bookings: &str) -> BookingRow {
    BookingRow {
        source: source.to_string(),
        calendar: calendar.to_string(),
        project: "3010000.01".to_string(),
        status: status.to_string(),
        bookings: bookings.to_string(),
        duration_hours: 1.0,
        billing: "".to_string(),
    }
}

#[test]
fn test_parse_report() {
    let html = "<html><body><table>\n\
        <tr><th>Source</th><th>Calendar</th><th>Project number</th><th>Status</th>\
        <th>Bookings</th><th>Duration (hours)</th><th>Billing</th></tr>\n\
        <tr><td>3010</td><td>MR 7T (new)</td><td>3010000.01</td><td>CONFIRMED</td>\
        <td>2024-01-15 (09:00-10:30)</td><td>1.5</td><td><b>R&amp;D</b></td></tr>\n\
        <TR><TD>3011</TD><TD>Prisma</TD><TD></TD><TD>TENTATIVE</TD>\
        <TD>2024-01-15 (13:00-14:00)</TD><TD>1</TD><TD></TD></TR>\n\
        </table></body></html>";
    let rows = parse_report(html);
    assert!(rows.len() == 2);
    assert!(rows[0]["Calendar"] == "MR 7T (new)");
    assert!(rows[0]["Billing"] == "R&D");
    assert!(rows[1]["Status"] == "TENTATIVE");
    assert!(rows[1]["Project number"] == "");

    let r = BookingRow::from_cells(&rows[0]).unwrap();
    assert!(r.duration_hours == 1.5);
    assert!(r.date() == NaiveDate::from_ymd_opt(2024, 1, 15));
}

#[test]
fn test_row_requires_columns_and_duration() {
    let mut cells = HashMap::new();
    cells.insert("Source".to_string(), "3010".to_string());
    cells.insert("Calendar".to_string(), "Prisma".to_string());
    cells.insert("Status".to_string(), "CONFIRMED".to_string());
    assert!(BookingRow::from_cells(&cells).is_err());
    cells.insert("Duration (hours)".to_string(), "0".to_string());
    assert!(BookingRow::from_cells(&cells).is_err());
    cells.insert("Duration (hours)".to_string(), "x".to_string());
    assert!(BookingRow::from_cells(&cells).is_err());
    cells.insert("Duration (hours)".to_string(), "2".to_string());
    let r = BookingRow::from_cells(&cells).unwrap();
    assert!(r.project == "" && r.bookings == "");
}

#[test]
fn test_event_from_row() {
    let e = BookingEvent::from_row(&row("Prisma", "3010", "CONFIRMED", "2024-01-15 (09:00-10:30)"))
        .unwrap();
    assert!(e.begin.format("%H:%M").to_string() == "09:00");
    assert!(e.end.format("%H:%M").to_string() == "10:30");
    assert!(e.status == BookingStatus::Confirmed);

    assert!(BookingEvent::from_row(&row("Prisma", "3010", "CONFIRMED", "2024-01-15 9-10")).is_err());
    assert!(BookingEvent::from_row(&row("Prisma", "3010", "CONFIRMED", "2024-01-15 (25:00-26:00)"))
        .is_err());

    // Ends before it begins
    let err = BookingEvent::from_row(&row("Prisma", "3010", "CONFIRMED", "2024-01-15 (11:00-10:00)"))
        .unwrap_err();
    assert!(matches!(err, Error::MalformedRecord(_)));

    // Zero length is fine
    let e = BookingEvent::from_row(&row("Prisma", "3010", "CONFIRMED", "2024-01-15 (10:00-10:00)"))
        .unwrap();
    assert!(e.begin == e.end);
}

#[test]
fn test_status() {
    assert!(BookingStatus::from_str("CANCELLEDNIT").unwrap().claims_slot());
    assert!(BookingStatus::from_str("TENTATIVE").unwrap().claims_slot());
    assert!(!BookingStatus::from_str("CANCELLED").unwrap().claims_slot());
    assert!(BookingStatus::from_str("WAITLIST").unwrap() == BookingStatus::Other("WAITLIST".to_string()));
}

// Lab usage from the booking report, one day at a time.
//
// Used time: the booked hours of every valid report row, summed per
// {source, project, group, status, lab, bill} and stamped at noon of the day.  The group is the
// owning group of the row's project; a row whose project has no known group is logged and
// skipped.  Group, lab and bill are labelized.
//
// Free time: the gaps between the bookings in the operating window, one datapoint per gap with
// tag lab, value in minutes, stamped at the begin of the gap.  A day for which the report has no
// valid rows is reported as one gap over the whole window for lab "all".

use crate::transport;

use hpcmetrics::bookings::{self, BookingRow};
use hpcmetrics::dates::{date_range, midday};
use hpcmetrics::store::{MetadataStore, ProjectGroup};
use hpcmetrics::{labelize, resolve_gaps, whole_window_gap, MetricRegistry, OperatingWindow, TagSet};

use anyhow::Result;
use chrono::NaiveDate;
use reqwest::blocking::Client;
use std::collections::HashMap;
use tracing::{debug, error, info, info_span, warn};

pub trait BookingSource {
    /// The report rows for one day, as header -> cell maps.
    fn report(&self, date: NaiveDate) -> Result<Vec<HashMap<String, String>>>;
}

pub struct HttpBookingSource<'a> {
    pub client: &'a Client,
    pub report_url: String,
}

impl<'a> BookingSource for HttpBookingSource<'a> {
    fn report(&self, date: NaiveDate) -> Result<Vec<HashMap<String, String>>> {
        let d = date.format("%Y-%m-%d");
        let url = format!("{}/{d}/{d}", self.report_url.trim_end_matches('/'));
        Ok(bookings::parse_report(&transport::fetch_text(self.client, &url)?))
    }
}

pub struct LabUsageOptions<'a> {
    pub used_metric: &'a str,
    pub free_metric: &'a str,
    pub window: OperatingWindow,
    pub excluded_sources: &'a [String],
}

pub fn collect(
    source: &dyn BookingSource,
    store: &dyn MetadataStore,
    from: NaiveDate,
    to: NaiveDate,
    options: &LabUsageOptions,
) -> MetricRegistry {
    let groups = match store.project_groups() {
        Ok(g) => g,
        Err(e) => {
            error!("project groups: {e}");
            HashMap::new()
        }
    };
    let mut registry = MetricRegistry::with_metrics(&[options.used_metric, options.free_metric]);
    for date in date_range(from, to) {
        let _span = info_span!("day", date = %date).entered();
        info!("creating metrics");
        match source.report(date) {
            Ok(cells) => collect_day(&mut registry, date, &cells, &groups, options),
            Err(e) => error!("{e}"),
        }
    }
    registry
}

pub fn collect_day(
    registry: &mut MetricRegistry,
    date: NaiveDate,
    cells: &[HashMap<String, String>],
    groups: &HashMap<String, ProjectGroup>,
    options: &LabUsageOptions,
) {
    let rows = cells
        .iter()
        .filter_map(|c| match BookingRow::from_cells(c) {
            Ok(row) => Some(row),
            Err(e) => {
                warn!("{e}");
                None
            }
        })
        .collect::<Vec<BookingRow>>();

    let timestamp = midday(date);
    let before = registry.samples(options.used_metric).len();
    for row in &rows {
        let Some(group) = groups.get(&row.project) else {
            warn!("no group for project {:?}, booking {} skipped", row.project, row.source);
            continue;
        };
        let tags = TagSet::new()
            .with("source", &row.source)
            .with("project", &row.project)
            .with("group", labelize(&group.name))
            .with("status", &row.status)
            .with("lab", labelize(&row.calendar))
            .with("bill", labelize(&row.billing))
            .with("timestamp", timestamp);
        registry.accumulate(options.used_metric, tags, row.duration_hours);
    }
    debug!(
        "{} rows --> {} data points",
        rows.len(),
        registry.samples(options.used_metric).len() - before
    );

    let gaps = if rows.is_empty() {
        vec![whole_window_gap(date, None, &options.window)]
    } else {
        resolve_gaps(&rows, &options.window, options.excluded_sources)
            .into_values()
            .flatten()
            .collect()
    };
    for g in gaps {
        let tags = TagSet::new().with("lab", &g.lab).with("timestamp", g.timestamp());
        registry.set(options.free_metric, tags, g.duration_minutes as f64);
    }
}

#[cfg(test)]
struct FixedReport(HashMap<NaiveDate, Vec<HashMap<String, String>>>);

#[cfg(test)]
impl BookingSource for FixedReport {
    fn report(&self, date: NaiveDate) -> Result<Vec<HashMap<String, String>>> {
        match self.0.get(&date) {
            Some(rows) => Ok(rows.clone()),
            None => Err(hpcmetrics::Error::unavailable("report", "no such day").into()),
        }
    }
}

#[cfg(test)]
struct FixedGroups;

#[cfg(test)]
impl MetadataStore for FixedGroups {
    fn project_groups(&self) -> Result<HashMap<String, ProjectGroup>> {
        let mut m = HashMap::new();
        m.insert(
            "3010000.01".to_string(),
            ProjectGroup {
                id: "12".to_string(),
                name: "Language & Genetics".to_string(),
            },
        );
        Ok(m)
    }

    fn filer_usage(&self, _from: NaiveDate, _to: NaiveDate) -> Result<Vec<hpcmetrics::store::FilerUsageRow>> {
        Ok(vec![])
    }
}

#[cfg(test)]
fn cells(source: &str, calendar: &str, project: &str, status: &str, bookings: &str, hours: &str) -> HashMap<String, String> {
    [
        ("Source", source),
        ("Calendar", calendar),
        ("Project number", project),
        ("Status", status),
        ("Bookings", bookings),
        ("Duration (hours)", hours),
        ("Billing", "Internal (MEG)"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

#[cfg(test)]
fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
}

#[test]
fn test_lab_usage_day() {
    let mut report = HashMap::new();
    report.insert(
        day(15),
        vec![
            cells("1001", "MR 7T (new)", "3010000.01", "CONFIRMED", "2024-01-15 (08:30-12:00)", "3.5"),
            cells("1002", "MR 7T (new)", "3010000.01", "CONFIRMED", "2024-01-15 (13:00-15:00)", "2"),
            cells("1002", "MR 7T (new)", "3010000.01", "CONFIRMED", "2024-01-15 (15:00-16:00)", "1"),
            // Unknown project: no usage, but the booking still counts for free time
            cells("1003", "MR 7T (new)", "3099999.01", "TENTATIVE", "2024-01-15 (16:00-17:00)", "1"),
            // No duration
            cells("1004", "Prisma", "3010000.01", "CONFIRMED", "2024-01-15 (09:00-10:00)", "0"),
        ],
    );
    report.insert(day(16), vec![]);
    let options = LabUsageOptions {
        used_metric: "lab.usage",
        free_metric: "lab.free",
        window: OperatingWindow::default(),
        excluded_sources: &["3055".to_string(), "30100".to_string()],
    };
    let r = collect(&FixedReport(report), &FixedGroups, day(15), day(17), &options);

    let used = r.samples("lab.usage");
    assert!(used.len() == 2);
    assert!(used[0].tags.get("group") == Some("Language_and_Genetics"));
    assert!(used[0].tags.get("lab") == Some("MR_7T/new/"));
    assert!(used[0].tags.get("bill") == Some("Internal/MEG/"));
    assert!(used[0].tags.get("timestamp") == Some(midday(day(15)).to_string().as_str()));
    assert!(used[0].value == 3.5);
    assert!(used[1].tags.get("source") == Some("1002") && used[1].value == 3.0);

    let free_15 = r.query("lab.free", &TagSet::new().with("lab", "MR_7T/new/"));
    assert!(free_15.iter().map(|s| s.value).collect::<Vec<f64>>() == vec![60.0, 60.0]);

    // The 16th has an empty report, the 17th has none at all
    let all = r.query("lab.free", &TagSet::new().with("lab", "all"));
    assert!(all.len() == 1 && all[0].value == 570.0);
    let begin = day(16).and_hms_opt(8, 30, 0).unwrap();
    assert!(all[0].tags.get("timestamp") == Some(hpcmetrics::dates::local_epoch(begin).to_string().as_str()));
}

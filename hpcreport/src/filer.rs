// File server usage: used, available and total size per day, stamped at noon.
//
// The statistics table can hold several rows for one day.  Only the first row of each day, in the
// order the store returns them, is reported.

use hpcmetrics::dates::midday;
use hpcmetrics::store::{FilerUsageRow, MetadataStore};
use hpcmetrics::{MetricRegistry, TagSet};

use anyhow::Result;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use tracing::debug;

pub fn collect(store: &dyn MetadataStore, from: NaiveDate, to: NaiveDate, metric: &str) -> Result<MetricRegistry> {
    let rows = store.filer_usage(from, to)?;
    let mut registry = MetricRegistry::with_metrics(&[metric]);
    for (date, row) in first_row_per_day(&rows) {
        let ts = midday(date);
        for (kind, value) in [("used", row.used), ("avail", row.avail), ("total", row.total)] {
            registry.set(metric, TagSet::new().with("type", kind).with("timestamp", ts), value as f64);
        }
    }
    Ok(registry)
}

fn first_row_per_day(rows: &[FilerUsageRow]) -> BTreeMap<NaiveDate, &FilerUsageRow> {
    let mut days = BTreeMap::new();
    for row in rows {
        match days.entry(row.created.date()) {
            Entry::Vacant(e) => {
                e.insert(row);
            }
            Entry::Occupied(_) => debug!("ignoring later filer row at {}", row.created),
        }
    }
    days
}

#[cfg(test)]
use hpcmetrics::store::CsvStore;

#[test]
fn test_filer_days() {
    let dir = tempfile::tempdir().unwrap();
    let filer_stats = dir.path().join("filer_stats.csv");
    std::fs::write(
        &filer_stats,
        "created,used,avail,total\n\
         2024-01-15 00:10:00,10,20,30\n\
         2024-01-15 12:00:00,11,19,30\n\
         2024-01-16 00:00:00,12,18,30\n",
    )
    .unwrap();
    let store = CsvStore {
        projects: dir.path().join("projects.csv"),
        filer_stats,
    };
    let from = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
    let to = NaiveDate::from_ymd_opt(2024, 1, 16).unwrap();
    let r = collect(&store, from, to, "storage.filer.size").unwrap();
    assert!(r.len() == 6);
    let used_15 = TagSet::new().with("type", "used").with("timestamp", midday(from));
    assert!(r.get("storage.filer.size", &used_15).unwrap().value == 10.0);
    let total = r.query("storage.filer.size", &TagSet::new().with("type", "total"));
    assert!(total.len() == 2 && total.iter().all(|s| s.value == 30.0));
}

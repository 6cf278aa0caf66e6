// The project database: who owns a project, and what the file servers reported.
//
// Collectors need two queries from it:
//
//  - project -> owning group (id and description), for tagging lab usage by group
//  - file server aggregate usage rows (created, used, avail, total) for a date range, sizes summed
//    over aggregates and already scaled by the query
//
// The shipped implementation reads CSV exports of those two queries, with a header row:
//
//   projects.csv:     project,group_id,group_name
//   filer_stats.csv:  created,used,avail,total        created is "YYYY-MM-DD HH:MM:SS"
//
// `created` is kept as the naive time the database stored; a row belongs to the date of that
// naive time, with no timezone conversion, which is what DATE(created) does in the database.

use anyhow::Result;
use chrono::{NaiveDate, NaiveDateTime};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectGroup {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilerUsageRow {
    pub created: NaiveDateTime,
    pub used: u64,
    pub avail: u64,
    pub total: u64,
}

pub trait MetadataStore {
    /// Map from project number to its owning group.
    fn project_groups(&self) -> Result<HashMap<String, ProjectGroup>>;

    /// Filer rows whose created date is within [from, to], in the order the store returns them.
    fn filer_usage(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<FilerUsageRow>>;
}

#[derive(Debug, Clone)]
pub struct CsvStore {
    pub projects: PathBuf,
    pub filer_stats: PathBuf,
}

impl MetadataStore for CsvStore {
    fn project_groups(&self) -> Result<HashMap<String, ProjectGroup>> {
        #[derive(Debug, Deserialize)]
        struct Row {
            project: String,
            group_id: String,
            group_name: String,
        }

        let mut reader = csv::Reader::from_path(&self.projects)?;
        let mut groups = HashMap::new();
        for row in reader.deserialize::<Row>() {
            match row {
                Err(e) => {
                    if e.is_io_error() {
                        return Err(e.into());
                    }
                    warn!("{}: skipping project row: {e}", self.projects.display());
                }
                Ok(r) => {
                    groups.insert(
                        r.project,
                        ProjectGroup {
                            id: r.group_id,
                            name: r.group_name,
                        },
                    );
                }
            }
        }
        Ok(groups)
    }

    fn filer_usage(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<FilerUsageRow>> {
        #[derive(Debug, Deserialize)]
        struct Row {
            created: String,
            used: u64,
            avail: u64,
            total: u64,
        }

        let mut reader = csv::Reader::from_path(&self.filer_stats)?;
        let mut rows = vec![];
        for row in reader.deserialize::<Row>() {
            let r = match row {
                Err(e) => {
                    if e.is_io_error() {
                        return Err(e.into());
                    }
                    warn!("{}: skipping filer row: {e}", self.filer_stats.display());
                    continue;
                }
                Ok(r) => r,
            };
            let created = match NaiveDateTime::parse_from_str(&r.created, "%Y-%m-%d %H:%M:%S") {
                Ok(t) => t,
                Err(_) => {
                    warn!("{}: bad created time {:?}", self.filer_stats.display(), r.created);
                    continue;
                }
            };
            if created.date() < from || created.date() > to {
                continue;
            }
            rows.push(FilerUsageRow {
                created,
                used: r.used,
                avail: r.avail,
                total: r.total,
            });
        }
        Ok(rows)
    }
}

#[cfg(test)]
fn write_file(dir: &std::path::Path, name: &str, contents: &str) -> PathBuf {
    let p = dir.join(name);
    std::fs::write(&p, contents).unwrap();
    p
}

#[test]
fn test_project_groups() {
    let dir = tempfile::tempdir().unwrap();
    let store = CsvStore {
        projects: write_file(
            dir.path(),
            "projects.csv",
            "project,group_id,group_name\n\
             3010000.01,12,Language & Genetics\n\
             3010000.02,13\n\
             3055000.01,14,MEG (core)\n",
        ),
        filer_stats: dir.path().join("none.csv"),
    };
    let groups = store.project_groups().unwrap();
    assert!(groups.len() == 2);
    assert!(groups["3010000.01"].name == "Language & Genetics");
    assert!(groups["3055000.01"].id == "14");
    assert!(store.filer_usage(NaiveDate::MIN, NaiveDate::MAX).is_err());
}

#[test]
fn test_filer_usage_range() {
    let dir = tempfile::tempdir().unwrap();
    let store = CsvStore {
        projects: dir.path().join("none.csv"),
        filer_stats: write_file(
            dir.path(),
            "filer_stats.csv",
            "created,used,avail,total\n\
             2024-01-14 23:59:00,1,2,3\n\
             2024-01-15 00:10:00,10,20,30\n\
             2024-01-15 12:00:00,11,19,30\n\
             yesterday,1,1,1\n\
             2024-01-16 00:00:00,12,18,30\n\
             2024-01-17 00:00:00,13,17,30\n",
        ),
    };
    let from = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
    let to = NaiveDate::from_ymd_opt(2024, 1, 16).unwrap();
    let rows = store.filer_usage(from, to).unwrap();
    assert!(rows.iter().map(|r| r.used).collect::<Vec<_>>() == vec![10, 11, 12]);
    assert!(store.project_groups().is_err());
}

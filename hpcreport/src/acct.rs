// Job accounting: fold the jobs that completed on a day into per-hour sums.
//
// Every completed job with nonzero walltime, memory and cpu time use contributes to six metrics
// under the tag set {gid, uid, jstat, jqueue, timestamp}, where jstat is the exit class and the
// timestamp is the middle of the hour the job finished in.  Jobs with equal tag sets are summed.

use hpcmetrics::dates::hour_bucket;
use hpcmetrics::joblog::{self, JobRecord};
use hpcmetrics::{MetricRegistry, TagSet};

use anyhow::Result;
use chrono::NaiveDate;
use std::path::Path;
use tracing::{debug, info};

pub const METRICS: [&str; 6] = [
    "hpc_acct_wtime_asked",
    "hpc_acct_wtime_used",
    "hpc_acct_mem_asked",
    "hpc_acct_mem_used",
    "hpc_acct_ctime_used",
    "hpc_acct_job_count",
];

pub fn collect(log_dir: &Path, date: NaiveDate) -> Result<MetricRegistry> {
    info!("collecting data of jobs completed on {}", date.format("%Y%m%d"));
    let jobs = joblog::read_complete_jobs(log_dir, date)?;
    Ok(accumulate_jobs(&jobs))
}

pub fn accumulate_jobs(jobs: &[JobRecord]) -> MetricRegistry {
    let mut registry = MetricRegistry::with_metrics(&METRICS);
    let mut used = 0;
    for j in jobs {
        if j.wtime_used == 0 || j.mem_used == 0 || j.ctime_used == 0 {
            debug!("job {} has no resource use, skipped", j.id);
            continue;
        }
        used += 1;
        let tags = TagSet::new()
            .with("gid", &j.group)
            .with("uid", &j.user)
            .with("jstat", j.exit_class().as_str())
            .with("jqueue", &j.queue)
            .with("timestamp", hour_bucket(j.finish));
        let values = [
            j.wtime_asked as f64,
            j.wtime_used as f64,
            j.mem_asked as f64,
            j.mem_used as f64,
            j.ctime_used as f64,
            1.0,
        ];
        for (metric, value) in METRICS.iter().zip(values) {
            registry.accumulate(metric, tags.clone(), value);
        }
    }
    debug!("{} jobs, {used} accounted --> {} samples", jobs.len(), registry.len());
    registry
}

#[cfg(test)]
fn end_line(id: &str, user: &str, end: i64, status: i32, wtime: &str) -> String {
    format!(
        "01/15/2024 10:11:12;E;{id};user={user} group=tg queue=short end={end} Exit_status={status} \
         exec_host=dccn-c001/0 Resource_List.mem=4gb Resource_List.walltime=01:00:00 \
         resources_used.cput=00:00:50 resources_used.mem=2048kb resources_used.walltime={wtime}\n"
    )
}

#[test]
fn test_two_jobs_in_one_hour_merge() {
    let dir = tempfile::tempdir().unwrap();
    let log = [
        end_line("101.torque", "alice", 1705313000, 0, "00:02:00"),
        end_line("102.torque", "alice", 1705315000, 0, "00:01:30"),
        // Different exit class
        end_line("103.torque", "alice", 1705315000, 1, "00:01:00"),
        // No walltime used
        end_line("104.torque", "alice", 1705315000, 0, "00:00:00"),
    ]
    .concat();
    std::fs::write(dir.path().join("20240115"), log).unwrap();

    let r = collect(dir.path(), NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()).unwrap();
    let completed = TagSet::new()
        .with("gid", "tg")
        .with("uid", "alice")
        .with("jstat", "completed")
        .with("jqueue", "short")
        .with("timestamp", 1705314600);
    let wtime = r.samples("hpc_acct_wtime_used");
    assert!(wtime.len() == 2);
    assert!(wtime[0].tags == completed);
    assert!(wtime[0].value == 210.0);
    assert!(r.get("hpc_acct_job_count", &completed).unwrap().value == 2.0);
    assert!(r.get("hpc_acct_wtime_asked", &completed).unwrap().value == 7200.0);
    assert!(r.get("hpc_acct_mem_used", &completed).unwrap().value == 2.0 * 2048.0 * 1024.0);
    assert!(r.query("hpc_acct_ctime_used", &TagSet::new().with("jstat", "failed"))[0].value == 50.0);
    assert!(r.len() == 12);
}

#[test]
fn test_missing_log() {
    let dir = tempfile::tempdir().unwrap();
    assert!(collect(dir.path(), NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()).is_err());
}

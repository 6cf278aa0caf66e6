// Reader for Torque accounting logs.
//
// There is one file per day, named YYYYMMDD, in the accounting log directory.  Each line is
//
//   MM/DD/YYYY HH:MM:SS;<record type>;<job id>;<attributes>
//
// where the attributes are whitespace-separated key=value pairs.  Only records of type E (job
// ended) describe completed jobs; the others (Q, S, D, A, ...) are skipped.  These are the
// attributes we read:
//
//  Name                     Required?  Format
//  -----------------------  ---------  --------------------------------------------------
//  user                     Yes        Unix user name
//  group                    Yes        Unix group name
//  queue                    Yes        Queue name
//  end                      Yes        Epoch seconds
//  Exit_status              Yes        Integer, see ExitClass
//  exec_host                No         host/cpu[+host/cpu...], default empty
//  Resource_List.walltime   No         HH:MM:SS or seconds, default 0
//  Resource_List.mem        No         <n>[b|kb|mb|gb|tb], default 0
//  resources_used.walltime  No         HH:MM:SS or seconds, default 0
//  resources_used.mem       No         <n>[b|kb|mb|gb|tb], default 0
//  resources_used.cput      No         HH:MM:SS or seconds, default 0
//
// Unknown attributes are ignored.  A record with a missing required attribute, a duplicated
// attribute we read, or an unparseable value is dropped; I/O errors are propagated.
//
// Memory units are binary (1kb = 1024b), as in Torque.

use crate::Error;

use anyhow::Result;
use chrono::NaiveDate;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

/// How a job ended, from Torque's Exit_status.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    /// Exit_status 0
    Completed,
    /// 1..=255: the job script exited with an error
    Failed,
    /// > 255: killed by signal Exit_status-256 (eg walltime or memory limit)
    Killed,
    /// < 0: the scheduler could not run the job
    Aborted,
}

impl ExitClass {
    pub fn from_status(status: i32) -> ExitClass {
        match status {
            0 => ExitClass::Completed,
            1..=255 => ExitClass::Failed,
            s if s > 255 => ExitClass::Killed,
            _ => ExitClass::Aborted,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExitClass::Completed => "completed",
            ExitClass::Failed => "failed",
            ExitClass::Killed => "killed",
            ExitClass::Aborted => "aborted",
        }
    }
}

/// A completed job.  Times are seconds, memory is bytes.

#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub id: String,
    pub user: String,
    pub group: String,
    pub queue: String,
    pub exit_status: i32,

    /// Epoch seconds.
    pub finish: i64,

    /// Hosts in exec_host order, duplicates removed.  May be empty.
    pub hosts: Vec<String>,

    pub wtime_asked: u64,
    pub wtime_used: u64,
    pub mem_asked: u64,
    pub mem_used: u64,
    pub ctime_used: u64,
}

impl JobRecord {
    pub fn exit_class(&self) -> ExitClass {
        ExitClass::from_status(self.exit_status)
    }
}

/// Read the completed jobs from the accounting log for `date` in `log_dir`.
///
/// This returns an error if the file cannot be opened or read, but silently drops records with
/// parse errors.

pub fn read_complete_jobs(log_dir: &Path, date: NaiveDate) -> Result<Vec<JobRecord>> {
    let file_name = log_dir.join(date.format("%Y%m%d").to_string());
    parse_joblog(&file_name)
}

/// Parse one accounting log file, see above.

pub fn parse_joblog(file_name: &Path) -> Result<Vec<JobRecord>> {
    let mut results = vec![];
    let mut dropped = 0usize;

    // An error here is going to be an I/O error so always propagate it.
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(false)
        .flexible(true)
        .quoting(false)
        .from_path(file_name)?;

    for record in reader.records() {
        match record {
            Err(e) => {
                if e.is_io_error() {
                    return Err(e.into());
                }
                // Otherwise drop the record
                dropped += 1;
            }
            Ok(record) => {
                if record.len() < 4 || &record[1] != "E" {
                    continue;
                }
                match parse_end_record(&record[2], &record[3]) {
                    Ok(job) => results.push(job),
                    Err(e) => {
                        debug!("{}: {e}", file_name.display());
                        dropped += 1;
                    }
                }
            }
        }
    }
    if dropped > 0 {
        debug!("{}: dropped {dropped} malformed records", file_name.display());
    }
    Ok(results)
}

fn parse_end_record(id: &str, attributes: &str) -> Result<JobRecord, Error> {
    let mut user: Option<String> = None;
    let mut group: Option<String> = None;
    let mut queue: Option<String> = None;
    let mut finish: Option<i64> = None;
    let mut exit_status: Option<i32> = None;
    let mut hosts: Option<Vec<String>> = None;
    let mut wtime_asked: Option<u64> = None;
    let mut wtime_used: Option<u64> = None;
    let mut mem_asked: Option<u64> = None;
    let mut mem_used: Option<u64> = None;
    let mut ctime_used: Option<u64> = None;

    let bad = |what: &str| Error::malformed(format!("job {id}: {what}"));

    fn once<T>(slot: &mut Option<T>, v: T, bad: Error) -> Result<(), Error> {
        if slot.is_some() {
            return Err(bad);
        }
        *slot = Some(v);
        Ok(())
    }

    for field in attributes.split_whitespace() {
        let Some((key, value)) = field.split_once('=') else {
            continue;
        };
        match key {
            "user" => once(&mut user, value.to_string(), bad("duplicate user"))?,
            "group" => once(&mut group, value.to_string(), bad("duplicate group"))?,
            "queue" => once(&mut queue, value.to_string(), bad("duplicate queue"))?,
            "end" => {
                let v = i64::from_str(value).map_err(|_| bad("end"))?;
                once(&mut finish, v, bad("duplicate end"))?
            }
            "Exit_status" => {
                let v = i32::from_str(value).map_err(|_| bad("Exit_status"))?;
                once(&mut exit_status, v, bad("duplicate Exit_status"))?
            }
            "exec_host" => once(&mut hosts, parse_exec_host(value), bad("duplicate exec_host"))?,
            "Resource_List.walltime" => {
                let v = parse_duration(value).ok_or_else(|| bad("Resource_List.walltime"))?;
                once(&mut wtime_asked, v, bad("duplicate Resource_List.walltime"))?
            }
            "resources_used.walltime" => {
                let v = parse_duration(value).ok_or_else(|| bad("resources_used.walltime"))?;
                once(&mut wtime_used, v, bad("duplicate resources_used.walltime"))?
            }
            "resources_used.cput" => {
                let v = parse_duration(value).ok_or_else(|| bad("resources_used.cput"))?;
                once(&mut ctime_used, v, bad("duplicate resources_used.cput"))?
            }
            "Resource_List.mem" => {
                let v = parse_memory(value).ok_or_else(|| bad("Resource_List.mem"))?;
                once(&mut mem_asked, v, bad("duplicate Resource_List.mem"))?
            }
            "resources_used.mem" => {
                let v = parse_memory(value).ok_or_else(|| bad("resources_used.mem"))?;
                once(&mut mem_used, v, bad("duplicate resources_used.mem"))?
            }
            _ => {
                // Unknown field, ignore it silently, this is benign.
            }
        }
    }

    // Check that mandatory fields are present, fill in defaults for the others.

    Ok(JobRecord {
        id: id.to_string(),
        user: user.ok_or_else(|| bad("no user"))?,
        group: group.ok_or_else(|| bad("no group"))?,
        queue: queue.ok_or_else(|| bad("no queue"))?,
        exit_status: exit_status.ok_or_else(|| bad("no Exit_status"))?,
        finish: finish.ok_or_else(|| bad("no end"))?,
        hosts: hosts.unwrap_or_default(),
        wtime_asked: wtime_asked.unwrap_or(0),
        wtime_used: wtime_used.unwrap_or(0),
        mem_asked: mem_asked.unwrap_or(0),
        mem_used: mem_used.unwrap_or(0),
        ctime_used: ctime_used.unwrap_or(0),
    })
}

/// "dccn-c001/0+dccn-c001/1+dccn-c002/0" -> ["dccn-c001", "dccn-c002"]

fn parse_exec_host(s: &str) -> Vec<String> {
    let mut hosts: Vec<String> = vec![];
    for slot in s.split('+') {
        let host = slot.split('/').next().unwrap_or("");
        if !host.is_empty() && !hosts.iter().any(|h| h == host) {
            hosts.push(host.to_string());
        }
    }
    hosts
}

/// "[[HH:]MM:]SS" -> seconds.

pub fn parse_duration(s: &str) -> Option<u64> {
    let mut secs = 0u64;
    let mut parts = 0;
    for p in s.split(':') {
        secs = secs.checked_mul(60)?.checked_add(u64::from_str(p).ok()?)?;
        parts += 1;
    }
    if parts > 3 {
        return None;
    }
    Some(secs)
}

/// "<n>[b|kb|mb|gb|tb]" (any case) -> bytes.  A bare number is bytes.

pub fn parse_memory(s: &str) -> Option<u64> {
    let lower = s.to_ascii_lowercase();
    let digits = lower.trim_end_matches(|c: char| c.is_ascii_alphabetic());
    let unit = &lower[digits.len()..];
    let n = u64::from_str(digits).ok()?;
    let scale: u64 = match unit {
        "" | "b" => 1,
        "kb" => 1 << 10,
        "mb" => 1 << 20,
        "gb" => 1 << 30,
        "tb" => 1 << 40,
        _ => return None,
    };
    n.checked_mul(scale)
}

#[cfg(test)]
use std::io::Write;

#[cfg(test)]
pub(crate) fn end_line(id: &str, user: &str, queue: &str, end: i64, status: i32, wtime: &str) -> String {
    format!(
        "01/15/2024 10:11:12;E;{id};user={user} group=tg queue={queue} ctime=1705300000 \
         start=1705305000 end={end} Exit_status={status} exec_host=dccn-c001/0+dccn-c001/1+dccn-c002/0 \
         Resource_List.mem=4gb Resource_List.walltime=01:00:00 resources_used.cput=00:00:50 \
         resources_used.mem=2048kb resources_used.vmem=4096kb resources_used.walltime={wtime}\n"
    )
}

#[test]
fn test_parse_joblog() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("20240115");
    let mut f = std::fs::File::create(&path).unwrap();
    write!(f, "01/15/2024 09:00:00;Q;1.torque;queue=batch\n").unwrap();
    write!(f, "{}", end_line("2.torque", "alice", "short", 1705313000, 0, "00:02:00")).unwrap();
    // Malformed: bad end time
    write!(f, "{}", end_line("3.torque", "bob", "short", 0, 0, "00:02:00").replace("end=0", "end=x")).unwrap();
    // Malformed: no user
    write!(f, "{}", end_line("4.torque", "carol", "long", 1705313000, 0, "00:02:00").replace("user=carol ", "")).unwrap();
    write!(f, "garbage without separators\n").unwrap();
    write!(f, "{}", end_line("5.torque", "dave", "long", 1705313000, 271, "120")).unwrap();
    drop(f);

    let jobs = read_complete_jobs(dir.path(), NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()).unwrap();
    assert!(jobs.len() == 2);

    let j = &jobs[0];
    assert!(j.id == "2.torque" && j.user == "alice" && j.group == "tg" && j.queue == "short");
    assert!(j.finish == 1705313000);
    assert!(j.hosts == vec!["dccn-c001".to_string(), "dccn-c002".to_string()]);
    assert!(j.wtime_asked == 3600 && j.wtime_used == 120 && j.ctime_used == 50);
    assert!(j.mem_asked == 4 << 30 && j.mem_used == 2048 << 10);
    assert!(j.exit_class() == ExitClass::Completed);

    assert!(jobs[1].user == "dave");
    assert!(jobs[1].wtime_used == 120);
    assert!(jobs[1].exit_class() == ExitClass::Killed);
}

#[test]
fn test_missing_log_is_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(read_complete_jobs(dir.path(), NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()).is_err());
}

#[test]
fn test_parse_duration_and_memory() {
    assert!(parse_duration("01:02:03") == Some(3723));
    assert!(parse_duration("02:03") == Some(123));
    assert!(parse_duration("45") == Some(45));
    assert!(parse_duration("1:2:3:4").is_none());
    assert!(parse_duration("aa:00").is_none());

    assert!(parse_memory("512") == Some(512));
    assert!(parse_memory("3kb") == Some(3072));
    assert!(parse_memory("2GB") == Some(2 << 30));
    assert!(parse_memory("7w").is_none());
    assert!(parse_memory("gb").is_none());
}

#[test]
fn test_exit_class() {
    assert!(ExitClass::from_status(0).as_str() == "completed");
    assert!(ExitClass::from_status(1).as_str() == "failed");
    assert!(ExitClass::from_status(255).as_str() == "failed");
    assert!(ExitClass::from_status(271).as_str() == "killed");
    assert!(ExitClass::from_status(-3).as_str() == "aborted");
}

// Current cluster state: node properties, jobs known to the scheduler, license seats.
//
// The data come from site-specific helper commands (wrappers around pbsnodes, qstat and the
// license manager status tool) that print a JSON array on stdout.  The commands are configured;
// this module runs them and decodes their output.  Collectors see the data only through the
// ClusterSource and LicenseSource traits, so tests can substitute fixed data.
//
// Node record:
//
//   host         string   FQDN or short name
//   ncores       integer  number of cores
//   mem_gb       number   memory capacity in GB (decimal)
//   net          string   network class, eg "network10GigE"
//   ngpus        integer  number of GPUs, default 0
//   status       string   down, offline, job-exclusive, free, or anything else
//   matlab, batch, vgl, interactive
//                boolean  whether the node serves that queue category, default false
//
// Job record:
//
//   id      string            job id
//   queue   string            queue name
//   state   string            qstat state letter: C E H Q R T W S
//   mem_gb  number            requested memory in GB, default 0
//   nodes   array of string   assigned hosts, first is the leading host, default []
//
// License seat record:
//
//   package  string  licensed package (toolbox) name
//   host     string  host holding the seat

use crate::Error;

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::process::Command;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Down,
    Offline,
    JobExclusive,
    Free,
    Other,
}

impl NodeStatus {
    pub fn from_scheduler(s: &str) -> NodeStatus {
        match s {
            "down" => NodeStatus::Down,
            "offline" => NodeStatus::Offline,
            "job-exclusive" => NodeStatus::JobExclusive,
            "free" => NodeStatus::Free,
            _ => NodeStatus::Other,
        }
    }

    /// The value of the node status gauge: -1 down, 0 offline, 1 job-exclusive, 2 free, 3 other.
    pub fn code(&self) -> f64 {
        match self {
            NodeStatus::Down => -1.0,
            NodeStatus::Offline => 0.0,
            NodeStatus::JobExclusive => 1.0,
            NodeStatus::Free => 2.0,
            NodeStatus::Other => 3.0,
        }
    }
}

/// Queue categories used as the `queue` tag of the statistics metrics.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueCategory {
    Matlab,
    Batch,
    Vgl,
    Interact,
    Other,
}

impl QueueCategory {
    pub const ALL: [QueueCategory; 5] = [
        QueueCategory::Matlab,
        QueueCategory::Batch,
        QueueCategory::Vgl,
        QueueCategory::Interact,
        QueueCategory::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueCategory::Matlab => "matlab",
            QueueCategory::Batch => "batch",
            QueueCategory::Vgl => "vgl",
            QueueCategory::Interact => "interact",
            QueueCategory::Other => "other",
        }
    }

    /// The category of a queue: any of the configured batch queues is "batch", a queue named like
    /// a category is that category, anything else is "other".

    pub fn of_queue(queue: &str, batch_queues: &[String]) -> QueueCategory {
        if batch_queues.iter().any(|q| q == queue) {
            return QueueCategory::Batch;
        }
        QueueCategory::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == queue)
            .unwrap_or(QueueCategory::Other)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NodeRecord {
    pub host: String,
    pub ncores: u32,
    pub mem_gb: f64,
    pub net: String,
    #[serde(default)]
    pub ngpus: u32,
    pub status: String,
    #[serde(default)]
    pub matlab: bool,
    #[serde(default)]
    pub batch: bool,
    #[serde(default)]
    pub vgl: bool,
    #[serde(default)]
    pub interactive: bool,
}

impl NodeRecord {
    pub fn node_status(&self) -> NodeStatus {
        NodeStatus::from_scheduler(&self.status)
    }

    /// "network10GigE" -> 10.  None if the class does not have that shape.

    pub fn network_gbit(&self) -> Option<u32> {
        self.net
            .strip_prefix("network")?
            .strip_suffix("GigE")?
            .parse::<u32>()
            .ok()
    }

    /// Whether jobs of the category can run on this node.  Every node takes "other".

    pub fn serves(&self, category: QueueCategory) -> bool {
        match category {
            QueueCategory::Matlab => self.matlab,
            QueueCategory::Batch => self.batch,
            QueueCategory::Vgl => self.vgl,
            QueueCategory::Interact => self.interactive,
            QueueCategory::Other => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Held,
    Running,
    Other,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QueueJob {
    pub id: String,
    pub queue: String,
    pub state: String,
    #[serde(default)]
    pub mem_gb: f64,
    #[serde(default)]
    pub nodes: Vec<String>,
}

impl QueueJob {
    // Q queued, S suspended, H held, R running, E exiting after having run.  C (completed),
    // T (being moved) and W (waiting for its start time) are not counted.
    pub fn job_state(&self) -> JobState {
        match self.state.as_str() {
            "Q" | "S" => JobState::Queued,
            "H" => JobState::Held,
            "R" | "E" => JobState::Running,
            _ => JobState::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LicenseSeat {
    pub package: String,
    pub host: String,
}

pub trait ClusterSource {
    fn nodes(&self) -> Result<Vec<NodeRecord>>;
    fn jobs(&self) -> Result<Vec<QueueJob>>;
}

pub trait LicenseSource {
    fn seats(&self) -> Result<Vec<LicenseSeat>>;
}

/// Cluster and license data from the configured helper commands.

#[derive(Debug, Clone)]
pub struct CommandSource {
    pub nodes_cmd: String,
    pub qstat_cmd: String,
    pub license_cmd: String,
}

impl ClusterSource for CommandSource {
    fn nodes(&self) -> Result<Vec<NodeRecord>> {
        run_json_command(&self.nodes_cmd)
    }

    fn jobs(&self) -> Result<Vec<QueueJob>> {
        run_json_command(&self.qstat_cmd)
    }
}

impl LicenseSource for CommandSource {
    fn seats(&self) -> Result<Vec<LicenseSeat>> {
        run_json_command(&self.license_cmd)
    }
}

/// Run `cmd` through the shell and decode its stdout as a JSON array of T.  A nonzero exit or
/// undecodable output makes the source unavailable.

pub fn run_json_command<T: DeserializeOwned>(cmd: &str) -> Result<Vec<T>> {
    debug!("running {cmd}");
    let output = Command::new("sh").arg("-c").arg(cmd).output()?;
    if !output.status.success() {
        return Err(Error::unavailable(
            cmd,
            format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        )
        .into());
    }
    decode_json_array(&output.stdout).map_err(|e| Error::unavailable(cmd, e).into())
}

fn decode_json_array<T: DeserializeOwned>(bytes: &[u8]) -> Result<Vec<T>, serde_json::Error> {
    serde_json::from_slice::<Vec<T>>(bytes)
}

#[test]
fn test_decode_nodes() {
    let json = br#"[
        {"host": "dccn-c001", "ncores": 32, "mem_gb": 256, "net": "network10GigE", "ngpus": 0,
         "status": "free", "batch": true, "interactive": true},
        {"host": "dccn-c002", "ncores": 16, "mem_gb": 128.5, "net": "infiniband",
         "status": "down,offline"}
    ]"#;
    let nodes = decode_json_array::<NodeRecord>(json).unwrap();
    assert!(nodes.len() == 2);
    assert!(nodes[0].network_gbit() == Some(10));
    assert!(nodes[0].node_status() == NodeStatus::Free);
    assert!(nodes[0].serves(QueueCategory::Batch) && !nodes[0].serves(QueueCategory::Matlab));
    assert!(nodes[0].serves(QueueCategory::Interact) && nodes[0].serves(QueueCategory::Other));
    assert!(nodes[1].network_gbit().is_none());
    assert!(nodes[1].node_status() == NodeStatus::Other);
    assert!(nodes[1].ngpus == 0);
}

#[test]
fn test_decode_jobs_and_seats() {
    let jobs = decode_json_array::<QueueJob>(
        br#"[{"id": "1.torque", "queue": "short", "state": "R", "mem_gb": 4, "nodes": ["c1", "c2"]},
             {"id": "2.torque", "queue": "matlab", "state": "Q"}]"#,
    )
    .unwrap();
    assert!(jobs[0].job_state() == JobState::Running);
    assert!(jobs[1].job_state() == JobState::Queued && jobs[1].nodes.is_empty());

    let seats = decode_json_array::<LicenseSeat>(br#"[{"package": "MATLAB", "host": "c1"}]"#).unwrap();
    assert!(seats[0].package == "MATLAB");

    assert!(decode_json_array::<LicenseSeat>(b"not json").is_err());
}

#[test]
fn test_queue_category() {
    let batch = vec!["short".to_string(), "medium".to_string(), "long".to_string()];
    assert!(QueueCategory::of_queue("long", &batch) == QueueCategory::Batch);
    assert!(QueueCategory::of_queue("matlab", &batch) == QueueCategory::Matlab);
    assert!(QueueCategory::of_queue("interact", &batch) == QueueCategory::Interact);
    assert!(QueueCategory::of_queue("gpu", &batch) == QueueCategory::Other);
}

#[test]
fn test_run_json_command() {
    let seats = run_json_command::<LicenseSeat>(r#"echo '[{"package":"Simulink","host":"c3"}]'"#).unwrap();
    assert!(seats.len() == 1 && seats[0].host == "c3");
    assert!(run_json_command::<LicenseSeat>("exit 3").is_err());
}

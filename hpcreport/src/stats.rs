// Cluster statistics: a snapshot of node capacity and of the scheduler's queues.
//
// Per node (tag host):
//
//   hpc_stat_core_total     cores
//   hpc_stat_mem_total      memory, bytes
//   hpc_stat_network_total  network bandwidth, Gbit
//   hpc_stat_gpu_total      GPUs
//   hpc_stat_node_status    -1 down, 0 offline, 1 job-exclusive, 2 free, 3 other
//
// Per node and queue category (tags host, queue):
//
//   hpc_stat_core_usage     cores used by running jobs
//   hpc_stat_mem_usage      bytes requested by running jobs, split evenly over the job's nodes
//
// Per queue category, job state and host (tags queue, status, host):
//
//   hpc_stat_job_count      queued and held jobs are counted under host "na", running jobs under
//                           the job's leading host
//
// Every usage and count series that can occur is first set to zero, so a series that drops to
// zero is reported as zero and not as absent.  Running counts are only initialized on the nodes
// that serve the category.

use hpcmetrics::cluster::{ClusterSource, JobState, NodeStatus, QueueCategory};
use hpcmetrics::{MetricRegistry, TagSet};

use anyhow::Result;
use tracing::{debug, warn};

pub const NODE_STATUS: &str = "hpc_stat_node_status";

const METRICS: [&str; 8] = [
    "hpc_stat_core_usage",
    "hpc_stat_mem_usage",
    NODE_STATUS,
    "hpc_stat_core_total",
    "hpc_stat_mem_total",
    "hpc_stat_network_total",
    "hpc_stat_gpu_total",
    "hpc_stat_job_count",
];

pub struct ClusterStatistics {
    pub registry: MetricRegistry,

    /// Hosts that are down in this snapshot, in node order.
    pub nodes_down: Vec<String>,
}

pub fn collect(source: &dyn ClusterSource, batch_queues: &[String]) -> Result<ClusterStatistics> {
    let nodes = source.nodes()?;
    let jobs = source.jobs()?;
    debug!("{} nodes, {} jobs", nodes.len(), jobs.len());

    let mut r = MetricRegistry::with_metrics(&METRICS);
    let mut nodes_down = vec![];

    for n in &nodes {
        let host = TagSet::new().with("host", &n.host);
        r.set("hpc_stat_core_total", host.clone(), n.ncores as f64);
        r.set("hpc_stat_mem_total", host.clone(), n.mem_gb * 1e9);
        match n.network_gbit() {
            Some(gbit) => r.set("hpc_stat_network_total", host.clone(), gbit as f64),
            None => warn!("{}: unknown network class {:?}", n.host, n.net),
        }
        r.set("hpc_stat_gpu_total", host.clone(), n.ngpus as f64);

        let status = n.node_status();
        r.set(NODE_STATUS, host.clone(), status.code());
        if status == NodeStatus::Down {
            nodes_down.push(n.host.clone());
        }

        for cat in QueueCategory::ALL {
            let tags = host.clone().with("queue", cat.as_str());
            r.set("hpc_stat_core_usage", tags.clone(), 0.0);
            r.set("hpc_stat_mem_usage", tags, 0.0);
        }
    }

    let job_count = |queue: QueueCategory, status: &str, host: &str| {
        TagSet::new()
            .with("queue", queue.as_str())
            .with("status", status)
            .with("host", host)
    };

    for cat in QueueCategory::ALL {
        r.set("hpc_stat_job_count", job_count(cat, "queued", "na"), 0.0);
        r.set("hpc_stat_job_count", job_count(cat, "held", "na"), 0.0);
        for n in nodes.iter().filter(|n| n.serves(cat)) {
            r.set("hpc_stat_job_count", job_count(cat, "running", n.host.as_str()), 0.0);
        }
    }

    for j in &jobs {
        let cat = QueueCategory::of_queue(&j.queue, batch_queues);
        match j.job_state() {
            JobState::Queued => r.accumulate("hpc_stat_job_count", job_count(cat, "queued", "na"), 1.0),
            JobState::Held => r.accumulate("hpc_stat_job_count", job_count(cat, "held", "na"), 1.0),
            JobState::Running => {
                let Some(leader) = j.nodes.first() else {
                    warn!("running job {} has no nodes, skipped", j.id);
                    continue;
                };
                r.accumulate("hpc_stat_job_count", job_count(cat, "running", leader.as_str()), 1.0);
                let mem_share = j.mem_gb * 1e9 / j.nodes.len() as f64;
                for host in &j.nodes {
                    let tags = TagSet::new().with("host", host).with("queue", cat.as_str());
                    r.accumulate("hpc_stat_core_usage", tags.clone(), 1.0);
                    r.accumulate("hpc_stat_mem_usage", tags, mem_share);
                }
            }
            JobState::Other => {}
        }
    }

    Ok(ClusterStatistics {
        registry: r,
        nodes_down,
    })
}

/// The hosts that are down now but were not down in the `previous` snapshot.  A host that is not
/// in the previous snapshot at all is not reported.

pub fn newly_down(previous: &MetricRegistry, nodes_down: &[String]) -> Vec<String> {
    nodes_down
        .iter()
        .filter(|host| {
            previous
                .query(NODE_STATUS, &TagSet::new().with("host", host))
                .iter()
                .any(|s| s.value != -1.0)
        })
        .cloned()
        .collect()
}

#[cfg(test)]
use hpcmetrics::cluster::{NodeRecord, QueueJob};

#[cfg(test)]
struct FixedCluster {
    nodes: Vec<NodeRecord>,
    jobs: Vec<QueueJob>,
}

#[cfg(test)]
impl ClusterSource for FixedCluster {
    fn nodes(&self) -> Result<Vec<NodeRecord>> {
        Ok(self.nodes.clone())
    }

    fn jobs(&self) -> Result<Vec<QueueJob>> {
        Ok(self.jobs.clone())
    }
}

#[cfg(test)]
fn node(host: &str, status: &str, batch: bool, matlab: bool) -> NodeRecord {
    NodeRecord {
        host: host.to_string(),
        ncores: 16,
        mem_gb: 128.0,
        net: "network10GigE".to_string(),
        ngpus: 0,
        status: status.to_string(),
        matlab,
        batch,
        vgl: false,
        interactive: false,
    }
}

#[cfg(test)]
fn job(id: &str, queue: &str, state: &str, mem_gb: f64, nodes: &[&str]) -> QueueJob {
    QueueJob {
        id: id.to_string(),
        queue: queue.to_string(),
        state: state.to_string(),
        mem_gb,
        nodes: nodes.iter().map(|n| n.to_string()).collect(),
    }
}

#[cfg(test)]
fn fixed_cluster() -> FixedCluster {
    FixedCluster {
        nodes: vec![
            node("dccn-c001", "job-exclusive", true, false),
            node("dccn-c002", "free", true, true),
            node("dccn-c003", "down", false, false),
        ],
        jobs: vec![
            job("1", "short", "R", 8.0, &["dccn-c001", "dccn-c002"]),
            job("2", "long", "R", 4.0, &["dccn-c001"]),
            job("3", "matlab", "Q", 1.0, &[]),
            job("4", "interact", "H", 1.0, &[]),
            job("5", "gpu", "Q", 1.0, &[]),
            job("6", "short", "C", 1.0, &["dccn-c002"]),
            job("7", "short", "R", 1.0, &[]),
        ],
    }
}

#[test]
fn test_node_totals() {
    let stats = collect(&fixed_cluster(), &["short".to_string(), "long".to_string()]).unwrap();
    let r = &stats.registry;
    let host = |h: &str| TagSet::new().with("host", h);
    assert!(r.get("hpc_stat_core_total", &host("dccn-c001")).unwrap().value == 16.0);
    assert!(r.get("hpc_stat_mem_total", &host("dccn-c002")).unwrap().value == 128e9);
    assert!(r.get("hpc_stat_network_total", &host("dccn-c003")).unwrap().value == 10.0);
    assert!(r.get(NODE_STATUS, &host("dccn-c001")).unwrap().value == 1.0);
    assert!(r.get(NODE_STATUS, &host("dccn-c003")).unwrap().value == -1.0);
    assert!(stats.nodes_down == vec!["dccn-c003".to_string()]);
}

#[test]
fn test_usage_and_job_counts() {
    let stats = collect(&fixed_cluster(), &["short".to_string(), "long".to_string()]).unwrap();
    let r = &stats.registry;
    let usage = |h: &str, q: &str| TagSet::new().with("host", h).with("queue", q);
    let count = |q: &str, s: &str, h: &str| TagSet::new().with("queue", q).with("status", s).with("host", h);

    // Zeroes for every node and category
    assert!(r.samples("hpc_stat_core_usage").len() == 15);
    assert!(r.get("hpc_stat_core_usage", &usage("dccn-c001", "batch")).unwrap().value == 2.0);
    assert!(r.get("hpc_stat_core_usage", &usage("dccn-c002", "batch")).unwrap().value == 1.0);
    assert!(r.get("hpc_stat_core_usage", &usage("dccn-c003", "vgl")).unwrap().value == 0.0);
    assert!(r.get("hpc_stat_mem_usage", &usage("dccn-c001", "batch")).unwrap().value == 8e9);
    assert!(r.get("hpc_stat_mem_usage", &usage("dccn-c002", "batch")).unwrap().value == 4e9);

    assert!(r.get("hpc_stat_job_count", &count("batch", "running", "dccn-c001")).unwrap().value == 2.0);
    assert!(r.get("hpc_stat_job_count", &count("batch", "running", "dccn-c002")).unwrap().value == 0.0);
    assert!(r.get("hpc_stat_job_count", &count("matlab", "running", "dccn-c002")).unwrap().value == 0.0);
    assert!(r.get("hpc_stat_job_count", &count("matlab", "running", "dccn-c001")).is_none());
    assert!(r.get("hpc_stat_job_count", &count("matlab", "queued", "na")).unwrap().value == 1.0);
    assert!(r.get("hpc_stat_job_count", &count("interact", "held", "na")).unwrap().value == 1.0);
    assert!(r.get("hpc_stat_job_count", &count("other", "queued", "na")).unwrap().value == 1.0);
    assert!(r.get("hpc_stat_job_count", &count("vgl", "held", "na")).unwrap().value == 0.0);
    // "other" is served by every node
    assert!(r.query("hpc_stat_job_count", &TagSet::new().with("queue", "other").with("status", "running")).len() == 3);
}

#[test]
fn test_newly_down() {
    let mut previous = MetricRegistry::new();
    previous.set(NODE_STATUS, TagSet::new().with("host", "dccn-c003").with("job", "hpc_metrics"), 2.0);
    previous.set(NODE_STATUS, TagSet::new().with("host", "dccn-c004").with("job", "hpc_metrics"), -1.0);
    let down = vec!["dccn-c003".to_string(), "dccn-c004".to_string(), "dccn-c009".to_string()];
    assert!(newly_down(&previous, &down) == vec!["dccn-c003".to_string()]);
    assert!(newly_down(&MetricRegistry::new(), &down).is_empty());
}

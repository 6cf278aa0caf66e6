// An in-memory registry of tagged samples with at-most-one-sample-per-tag-set semantics.
//
// Collectors feed raw, possibly repeated records into the registry through `accumulate`; a
// record whose (metric, tags) identity is already present is folded into the existing sample by
// summing values.  Overlapping log windows and sub-minute license snapshots would otherwise be
// counted twice.
//
// Samples are kept per metric in insertion order, and metrics are kept in first-seen order, so
// that export and test output is deterministic.  Lookup goes through a hash index keyed on the
// canonical tag set.

use crate::{TagSet, TaggedSample};

use std::collections::HashMap;

#[derive(Debug, Default)]
struct Bucket {
    name: String,
    samples: Vec<TaggedSample>,
    index: HashMap<TagSet, usize>,
}

impl Bucket {
    fn new(name: &str) -> Bucket {
        Bucket {
            name: name.to_string(),
            samples: vec![],
            index: HashMap::new(),
        }
    }

    fn find_mut(&mut self, tags: &TagSet) -> Option<&mut TaggedSample> {
        match self.index.get(tags) {
            Some(&ix) => Some(&mut self.samples[ix]),
            None => None,
        }
    }

    fn push(&mut self, tags: TagSet, value: f64) {
        self.index.insert(tags.clone(), self.samples.len());
        self.samples.push(TaggedSample {
            metric: self.name.clone(),
            tags,
            value,
        });
    }
}

/// A map from metric name to the samples for that metric.  One registry lives for one collection
/// run and is owned by the collector that fills it.

#[derive(Debug, Default)]
pub struct MetricRegistry {
    buckets: Vec<Bucket>,
    by_name: HashMap<String, usize>,
}

impl MetricRegistry {
    pub fn new() -> MetricRegistry {
        Default::default()
    }

    /// Create a registry with the given metrics declared up front, so that they are exported (in
    /// this order) even if no sample is ever added for them.

    pub fn with_metrics(names: &[&str]) -> MetricRegistry {
        let mut r = MetricRegistry::new();
        for name in names {
            r.bucket_mut(name);
        }
        r
    }

    fn bucket_mut(&mut self, metric: &str) -> &mut Bucket {
        let ix = match self.by_name.get(metric) {
            Some(&ix) => ix,
            None => {
                self.buckets.push(Bucket::new(metric));
                self.by_name.insert(metric.to_string(), self.buckets.len() - 1);
                self.buckets.len() - 1
            }
        };
        &mut self.buckets[ix]
    }

    fn bucket(&self, metric: &str) -> Option<&Bucket> {
        self.by_name.get(metric).map(|&ix| &self.buckets[ix])
    }

    /// Add `value` to the sample of `metric` whose tags equal `tags`, or append a new sample if
    /// there is no such sample.

    pub fn accumulate(&mut self, metric: &str, tags: TagSet, value: f64) {
        let bucket = self.bucket_mut(metric);
        if let Some(sample) = bucket.find_mut(&tags) {
            sample.value += value;
        } else {
            bucket.push(tags, value);
        }
    }

    /// Replace the value of the sample of `metric` whose tags equal `tags`, or append a new sample.
    /// This is gauge semantics; a subsequent `accumulate` increments the set value.

    pub fn set(&mut self, metric: &str, tags: TagSet, value: f64) {
        let bucket = self.bucket_mut(metric);
        if let Some(sample) = bucket.find_mut(&tags) {
            sample.value = value;
        } else {
            bucket.push(tags, value);
        }
    }

    /// The sample of `metric` with exactly the tags `tags`, if any.

    pub fn get(&self, metric: &str, tags: &TagSet) -> Option<&TaggedSample> {
        let bucket = self.bucket(metric)?;
        bucket.index.get(tags).map(|&ix| &bucket.samples[ix])
    }

    /// All samples of `metric` whose tags include every tag in `filter`, in insertion order.  An
    /// unknown metric or no match yields an empty vector.

    pub fn query(&self, metric: &str, filter: &TagSet) -> Vec<&TaggedSample> {
        match self.bucket(metric) {
            Some(bucket) => bucket
                .samples
                .iter()
                .filter(|s| s.tags.contains_all(filter))
                .collect(),
            None => vec![],
        }
    }

    /// The samples of `metric` in insertion order; empty for an unknown metric.

    pub fn samples(&self, metric: &str) -> &[TaggedSample] {
        match self.bucket(metric) {
            Some(bucket) => &bucket.samples,
            None => &[],
        }
    }

    /// Metric names in first-seen order, including declared-but-empty metrics.

    pub fn metrics(&self) -> impl Iterator<Item = &str> {
        self.buckets.iter().map(|b| b.name.as_str())
    }

    /// All samples, grouped by metric in first-seen order.

    pub fn iter(&self) -> impl Iterator<Item = &TaggedSample> {
        self.buckets.iter().flat_map(|b| b.samples.iter())
    }

    /// Total number of samples across all metrics.

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.samples.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
use std::collections::{BTreeMap, HashSet};

#[test]
fn test_accumulate_sums_values() {
    let mut r = MetricRegistry::new();
    r.accumulate("m", TagSet::new().with("a", 1), 5.0);
    r.accumulate("m", TagSet::new().with("a", 1), 3.0);
    assert!(r.samples("m").len() == 1);
    assert!(r.samples("m")[0].value == 8.0);
}

#[test]
fn test_accumulate_distinct_tags() {
    let mut r = MetricRegistry::new();
    r.accumulate("m", TagSet::new().with("a", 1), 5.0);
    r.accumulate("m", TagSet::new().with("a", 2), 3.0);
    r.accumulate("m", TagSet::new().with("a", 1).with("b", 1), 1.0);
    r.accumulate("n", TagSet::new().with("a", 1), 7.0);
    assert!(r.samples("m").len() == 3);
    assert!(r.samples("n").len() == 1);
    assert!(r.len() == 4);
    assert!(r.metrics().collect::<Vec<_>>() == vec!["m", "n"]);
}

#[test]
fn test_no_duplicate_tag_sets() {
    let mut r = MetricRegistry::new();
    for i in 0..100 {
        r.accumulate("m", TagSet::new().with("k", i % 7).with("j", i % 3), 1.0);
    }
    let seen = r.samples("m").iter().map(|s| s.tags.clone()).collect::<HashSet<_>>();
    assert!(seen.len() == r.samples("m").len());
    assert!(r.samples("m").len() == 21);
    assert!(r.samples("m").iter().map(|s| s.value).sum::<f64>() == 100.0);
}

#[test]
fn test_set_then_accumulate() {
    let mut r = MetricRegistry::new();
    let t = TagSet::new().with("host", "dccn-c001").with("queue", "batch");
    r.set("hpc_stat_core_usage", t.clone(), 0.0);
    r.accumulate("hpc_stat_core_usage", t.clone(), 1.0);
    r.accumulate("hpc_stat_core_usage", t.clone(), 1.0);
    assert!(r.get("hpc_stat_core_usage", &t).unwrap().value == 2.0);
    r.set("hpc_stat_core_usage", t.clone(), 0.0);
    assert!(r.get("hpc_stat_core_usage", &t).unwrap().value == 0.0);
    assert!(r.samples("hpc_stat_core_usage").len() == 1);
}

#[test]
fn test_query_partial_tags() {
    let mut r = MetricRegistry::new();
    r.set("hpc_stat_node_status", TagSet::new().with("host", "c001"), -1.0);
    r.set("hpc_stat_node_status", TagSet::new().with("host", "c002"), 2.0);
    r.set("hpc_stat_job_count", TagSet::new().with("host", "c001").with("queue", "batch"), 4.0);
    r.set("hpc_stat_job_count", TagSet::new().with("host", "c001").with("queue", "vgl"), 1.0);

    assert!(r.query("hpc_stat_node_status", &TagSet::new()).len() == 2);
    let hits = r.query("hpc_stat_job_count", &TagSet::new().with("host", "c001"));
    assert!(hits.len() == 2);
    assert!(hits[0].tags.get("queue") == Some("batch"));
    assert!(hits[1].tags.get("queue") == Some("vgl"));
    assert!(r.query("hpc_stat_job_count", &TagSet::new().with("host", "c009")).is_empty());
    assert!(r.query("no_such_metric", &TagSet::new()).is_empty());
}

#[test]
fn test_get_absent() {
    let mut r = MetricRegistry::with_metrics(&["m"]);
    assert!(r.get("m", &TagSet::new()).is_none());
    assert!(r.get("x", &TagSet::new()).is_none());
    r.accumulate("m", TagSet::new(), 2.0);
    assert!(r.get("m", &TagSet::new()).is_some());
}

#[test]
fn test_declared_metrics_are_listed() {
    let r = MetricRegistry::with_metrics(&["b", "a"]);
    assert!(r.metrics().collect::<Vec<_>>() == vec!["b", "a"]);
    assert!(r.is_empty());
}

#[cfg(test)]
fn contents(r: &MetricRegistry, metric: &str) -> BTreeMap<TagSet, f64> {
    r.samples(metric).iter().map(|s| (s.tags.clone(), s.value)).collect()
}

#[cfg(test)]
mod props {
    use super::*;
    use proptest::prelude::*;

    fn ops() -> impl Strategy<Value = (Vec<(u8, u8, u32)>, Vec<(u8, u8, u32)>)> {
        prop::collection::vec((0u8..4, 0u8..3, 0u32..1000), 0..60).prop_flat_map(|v| {
            let orig = v.clone();
            Just(v).prop_shuffle().prop_map(move |s| (orig.clone(), s))
        })
    }

    fn fill(ops: &[(u8, u8, u32)]) -> MetricRegistry {
        let mut r = MetricRegistry::new();
        for (gid, queue, value) in ops {
            let tags = TagSet::new().with("gid", gid).with("jqueue", queue);
            r.accumulate("m", tags, *value as f64);
        }
        r
    }

    proptest! {
        #[test]
        fn accumulation_is_order_independent((ops, shuffled) in ops()) {
            let a = fill(&ops);
            let b = fill(&shuffled);
            prop_assert_eq!(contents(&a, "m"), contents(&b, "m"));
            prop_assert_eq!(a.samples("m").len(), contents(&a, "m").len());
        }
    }
}

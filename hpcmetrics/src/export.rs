// Serializations of a registry.
//
// OpenTSDB datapoints: the "timestamp" tag, when present, is the datapoint's time and is removed
// from the tags (collectors carry the reporting bucket as a tag because it is part of the sample's
// identity).  Samples without it get the caller's default timestamp.
//
// Prometheus text exposition: every metric is a gauge.  `parse_text` reads the format back, which
// is how the previous push to the gateway is inspected.
//
// Listing: one "metric {tags} value" line per sample, for --export of accounting registries.

use crate::{MetricRegistry, TagSet};

use itertools::Itertools;
use serde::Serialize;
use std::io;
use std::str::FromStr;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Datapoint {
    pub metric: String,
    pub timestamp: i64,
    pub value: f64,
    pub tags: TagSet,
}

/// The registry as datapoints, in registry order.

pub fn datapoints(registry: &MetricRegistry, default_timestamp: i64) -> Vec<Datapoint> {
    registry
        .iter()
        .map(|s| {
            let mut tags = s.tags.clone();
            let timestamp = match tags.remove("timestamp") {
                Some(t) => i64::from_str(&t).unwrap_or(default_timestamp),
                None => default_timestamp,
            };
            Datapoint {
                metric: s.metric.clone(),
                timestamp,
                value: s.value,
                tags,
            }
        })
        .collect()
}

fn escape_label_value(v: &str) -> String {
    v.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

fn format_value(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "+Inf" } else { "-Inf" }.to_string()
    } else {
        v.to_string()
    }
}

/// Write the registry in Prometheus text format.  Declared metrics without samples get their TYPE
/// line only.

pub fn render_text(registry: &MetricRegistry, out: &mut dyn io::Write) -> io::Result<()> {
    for metric in registry.metrics() {
        writeln!(out, "# TYPE {metric} gauge")?;
        for s in registry.samples(metric) {
            if s.tags.is_empty() {
                writeln!(out, "{metric} {}", format_value(s.value))?;
            } else {
                let labels = s
                    .tags
                    .iter()
                    .map(|(k, v)| format!("{k}=\"{}\"", escape_label_value(v)))
                    .join(",");
                writeln!(out, "{metric}{{{labels}}} {}", format_value(s.value))?;
            }
        }
    }
    Ok(())
}

/// Read Prometheus text format into a registry.  Comment lines are skipped, as are lines that do
/// not parse; a sample's own timestamp, if present, is ignored.

pub fn parse_text(text: &str) -> MetricRegistry {
    let mut registry = MetricRegistry::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_sample_line(line) {
            Some((name, tags, value)) => registry.set(&name, tags, value),
            None => debug!("skipping exposition line {line:?}"),
        }
    }
    registry
}

fn parse_sample_line(line: &str) -> Option<(String, TagSet, f64)> {
    let name_end = line.find(|c: char| c == '{' || c.is_whitespace())?;
    let name = &line[..name_end];
    if name.is_empty() {
        return None;
    }
    let mut rest = &line[name_end..];
    let mut tags = TagSet::new();
    if rest.starts_with('{') {
        let (parsed, after) = parse_labels(&rest[1..])?;
        tags = parsed;
        rest = after;
    }
    let value = match rest.split_whitespace().next()? {
        "NaN" => f64::NAN,
        "+Inf" => f64::INFINITY,
        "-Inf" => f64::NEG_INFINITY,
        v => f64::from_str(v).ok()?,
    };
    Some((name.to_string(), tags, value))
}

// Parses `k="v",k2="v2"}` and returns the tags and the text after the closing brace.
fn parse_labels(s: &str) -> Option<(TagSet, &str)> {
    let mut tags = TagSet::new();
    let mut chars = s.char_indices().peekable();
    loop {
        while let Some((_, c)) = chars.peek() {
            if c.is_whitespace() || *c == ',' {
                chars.next();
            } else {
                break;
            }
        }
        let (start, c) = chars.next()?;
        if c == '}' {
            return Some((tags, &s[start + 1..]));
        }
        let mut key_end = start + c.len_utf8();
        loop {
            let (i, c) = chars.next()?;
            if c == '=' {
                break;
            }
            key_end = i + c.len_utf8();
        }
        let key = s[start..key_end].trim();
        if chars.next()?.1 != '"' {
            return None;
        }
        let mut value = String::new();
        loop {
            match chars.next()?.1 {
                '"' => break,
                '\\' => match chars.next()?.1 {
                    'n' => value.push('\n'),
                    other => value.push(other),
                },
                c => value.push(c),
            }
        }
        tags.insert(key, value);
    }
}

/// Write "metric {tags} value" lines.

pub fn write_listing(registry: &MetricRegistry, out: &mut dyn io::Write) -> io::Result<()> {
    for s in registry.iter() {
        writeln!(out, "{} {} {}", s.metric, s.tags, s.value)?;
    }
    Ok(())
}

#[test]
fn test_datapoints_take_timestamp_tag() {
    let mut r = MetricRegistry::new();
    r.accumulate("hpc_acct_job_count", TagSet::new().with("uid", "alice").with("timestamp", 1705314600), 2.0);
    r.accumulate("lab.usage", TagSet::new().with("lab", "Prisma"), 1.5);
    let dps = datapoints(&r, 99);
    assert!(dps.len() == 2);
    assert!(dps[0].timestamp == 1705314600);
    assert!(dps[0].tags.get("timestamp").is_none());
    assert!(dps[0].tags.get("uid") == Some("alice"));
    assert!(dps[1].timestamp == 99);

    let json = serde_json::to_string(&dps[1]).unwrap();
    assert!(json == r#"{"metric":"lab.usage","timestamp":99,"value":1.5,"tags":{"lab":"Prisma"}}"#);
}

#[test]
fn test_render_and_parse_text() {
    let mut r = MetricRegistry::with_metrics(&["hpc_stat_node_status", "hpc_energy_usage"]);
    r.set("hpc_stat_node_status", TagSet::new().with("host", "dccn-c001"), -1.0);
    r.set("hpc_stat_node_status", TagSet::new().with("host", "dccn-c002"), 2.0);
    r.set("hpc_stat_job_count", TagSet::new().with("queue", "batch").with("status", "queued").with("host", "na"), 3.0);
    r.set("weird", TagSet::new().with("note", "a \"quoted\" \\ value"), 0.5);

    let mut out = Vec::new();
    render_text(&r, &mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.starts_with("# TYPE hpc_stat_node_status gauge\n"));
    assert!(text.contains("hpc_stat_node_status{host=\"dccn-c001\"} -1\n"));
    assert!(text.contains("# TYPE hpc_energy_usage gauge\n# TYPE hpc_stat_job_count gauge\n"));
    assert!(text.contains("hpc_stat_job_count{host=\"na\",queue=\"batch\",status=\"queued\"} 3\n"));

    let back = parse_text(&text);
    assert!(back.len() == 4);
    let down = back.query("hpc_stat_node_status", &TagSet::new().with("host", "dccn-c001"));
    assert!(down.len() == 1 && down[0].value == -1.0);
    assert!(back.samples("weird")[0].tags.get("note") == Some("a \"quoted\" \\ value"));
}

#[test]
fn test_parse_gateway_output() {
    let text = "# HELP hpc_stat_node_status node status\n\
                # TYPE hpc_stat_node_status gauge\n\
                hpc_stat_node_status{host=\"c1\",instance=\"\",job=\"hpc_metrics\"} 2\n\
                hpc_stat_node_status{host=\"c2\",instance=\"\",job=\"hpc_metrics\"} -1 1705314600000\n\
                push_time_seconds{instance=\"\",job=\"hpc_metrics\"} 1.7053146e+09\n\
                broken{host=\"c3\" 1\n\
                up 1\n";
    let r = parse_text(text);
    assert!(r.samples("hpc_stat_node_status").len() == 2);
    assert!(r.query("hpc_stat_node_status", &TagSet::new().with("host", "c2"))[0].value == -1.0);
    assert!(r.samples("broken").is_empty());
    assert!(r.samples("up")[0].value == 1.0);
    assert!(r.samples("push_time_seconds")[0].value == 1.7053146e9);
}

#[test]
fn test_write_listing() {
    let mut r = MetricRegistry::new();
    r.accumulate("hpc_acct_wtime_used", TagSet::new().with("uid", "alice").with("gid", "tg"), 210.0);
    let mut out = Vec::new();
    write_listing(&r, &mut out).unwrap();
    assert!(String::from_utf8(out).unwrap() == "hpc_acct_wtime_used {gid=tg,uid=alice} 210\n");
}

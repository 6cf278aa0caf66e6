// Read the reporter configuration from a JSON file.
//
// The file is an object with one optional object per concern.  A collector that needs a section
// fails before it starts if the section is absent; the fields of a present section are checked
// when the file is read.  Field names and value types:
//
//   torque
//     log_dir           string, required, directory of the daily accounting logs
//     nodes_cmd         string, required, command printing the node records as JSON
//     qstat_cmd         string, required, command printing the job records as JSON
//     license_cmd       string, required, command printing the license seats as JSON
//     batch_queues      array of string, default ["short", "medium", "long"]
//
//   push
//     opentsdb_url      string, default "http://opentsdb:9042/api/put"
//     gateway_url       string, default "http://gw-prometheus:9091"
//
//   energy
//     xymonq            string, default "xymonq", the xymonq binary
//     xymonq_cfg        string, required, the xymonq configuration file
//     pdus              array of string, required, the PDUs to read
//
//   lab
//     report_url        string, required, base URL of the booking report
//     excluded_sources  array of string, default ["3055", "30100"], booking source id prefixes
//                       that are ignored when computing free time
//     day_begin         string HH:MM, default "08:30"
//     day_end           string HH:MM, default "18:00"
//
//   store
//     projects          string, required, path of the project -> group CSV export
//     filer_stats       string, required, path of the filer statistics CSV export
//
// See ../config.example.json for an example.

use hpcmetrics::{Error, OperatingWindow};

use anyhow::{bail, Result};
use chrono::NaiveTime;
use serde_json::{Map, Value};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq)]
pub struct TorqueConfig {
    pub log_dir: PathBuf,
    pub nodes_cmd: String,
    pub qstat_cmd: String,
    pub license_cmd: String,
    pub batch_queues: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PushConfig {
    pub opentsdb_url: String,
    pub gateway_url: String,
}

impl Default for PushConfig {
    fn default() -> PushConfig {
        PushConfig {
            opentsdb_url: "http://opentsdb:9042/api/put".to_string(),
            gateway_url: "http://gw-prometheus:9091".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnergyConfig {
    pub xymonq: String,
    pub xymonq_cfg: String,
    pub pdus: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabConfig {
    pub report_url: String,
    pub excluded_sources: Vec<String>,
    pub window: OperatingWindow,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    pub projects: PathBuf,
    pub filer_stats: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    torque: Option<TorqueConfig>,
    pub push: PushConfig,
    energy: Option<EnergyConfig>,
    lab: Option<LabConfig>,
    store: Option<StoreConfig>,
}

fn missing_section(name: &str) -> anyhow::Error {
    Error::Config(format!("Section '{name}' must be present in the configuration")).into()
}

impl Config {
    pub fn torque(&self) -> Result<&TorqueConfig> {
        self.torque.as_ref().ok_or_else(|| missing_section("torque"))
    }

    pub fn energy(&self) -> Result<&EnergyConfig> {
        self.energy.as_ref().ok_or_else(|| missing_section("energy"))
    }

    pub fn lab(&self) -> Result<&LabConfig> {
        self.lab.as_ref().ok_or_else(|| missing_section("lab"))
    }

    pub fn store(&self) -> Result<&StoreConfig> {
        self.store.as_ref().ok_or_else(|| missing_section("store"))
    }
}

// Since the file is human-edited and most fields are optional, it is read with the generic JSON
// parser followed by explicit decoding of the fields, rather than with a derived parser.

pub fn read_from_json(filename: &Path) -> Result<Config> {
    let file = match File::open(filename) {
        Ok(f) => f,
        Err(e) => return Err(Error::Config(format!("{}: {e}", filename.display())).into()),
    };
    let v: Value = match serde_json::from_reader(BufReader::new(file)) {
        Ok(v) => v,
        Err(e) => return Err(Error::Config(format!("{}: {e}", filename.display())).into()),
    };
    match decode(&v) {
        Ok(c) => Ok(c),
        Err(e) => Err(Error::Config(format!("{}: {e}", filename.display())).into()),
    }
}

fn decode(v: &Value) -> Result<Config> {
    let Value::Object(top) = v else {
        bail!("Expected an object value")
    };
    let mut config: Config = Default::default();

    if let Some(fields) = grab_section(top, "torque")? {
        config.torque = Some(TorqueConfig {
            log_dir: PathBuf::from(grab_string(fields, "log_dir")?),
            nodes_cmd: grab_string(fields, "nodes_cmd")?,
            qstat_cmd: grab_string(fields, "qstat_cmd")?,
            license_cmd: grab_string(fields, "license_cmd")?,
            batch_queues: grab_strings_or(fields, "batch_queues", &["short", "medium", "long"])?,
        });
    }

    if let Some(fields) = grab_section(top, "push")? {
        let defaults = PushConfig::default();
        config.push = PushConfig {
            opentsdb_url: grab_string_or(fields, "opentsdb_url", &defaults.opentsdb_url)?,
            gateway_url: grab_string_or(fields, "gateway_url", &defaults.gateway_url)?,
        };
    }

    if let Some(fields) = grab_section(top, "energy")? {
        let pdus = grab_strings(fields, "pdus")?;
        config.energy = Some(EnergyConfig {
            xymonq: grab_string_or(fields, "xymonq", "xymonq")?,
            xymonq_cfg: grab_string(fields, "xymonq_cfg")?,
            pdus,
        });
    }

    if let Some(fields) = grab_section(top, "lab")? {
        let window = OperatingWindow {
            begin: grab_time_or(fields, "day_begin", "08:30")?,
            end: grab_time_or(fields, "day_end", "18:00")?,
        };
        if window.begin >= window.end {
            bail!("Field 'day_begin' must be before 'day_end'");
        }
        config.lab = Some(LabConfig {
            report_url: grab_string(fields, "report_url")?,
            excluded_sources: grab_strings_or(fields, "excluded_sources", &["3055", "30100"])?,
            window,
        });
    }

    if let Some(fields) = grab_section(top, "store")? {
        config.store = Some(StoreConfig {
            projects: PathBuf::from(grab_string(fields, "projects")?),
            filer_stats: PathBuf::from(grab_string(fields, "filer_stats")?),
        });
    }

    Ok(config)
}

fn grab_section<'a>(top: &'a Map<String, Value>, name: &str) -> Result<Option<&'a Map<String, Value>>> {
    match top.get(name) {
        None => Ok(None),
        Some(Value::Object(fields)) => Ok(Some(fields)),
        Some(_) => bail!("Section '{name}' must have an object value"),
    }
}

fn grab_string(fields: &Map<String, Value>, name: &str) -> Result<String> {
    if let Some(Value::String(s)) = fields.get(name) {
        Ok(s.clone())
    } else {
        bail!("Field '{name}' must be present and have a string value")
    }
}

fn grab_string_or(fields: &Map<String, Value>, name: &str, default: &str) -> Result<String> {
    match fields.get(name) {
        None => Ok(default.to_string()),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => bail!("Field '{name}' must have a string value"),
    }
}

fn grab_strings(fields: &Map<String, Value>, name: &str) -> Result<Vec<String>> {
    if let Some(Value::Array(xs)) = fields.get(name) {
        let mut result = vec![];
        for x in xs {
            if let Value::String(s) = x {
                result.push(s.clone());
            } else {
                bail!("Field '{name}' must have string elements")
            }
        }
        Ok(result)
    } else {
        bail!("Field '{name}' must be present and have an array value")
    }
}

fn grab_strings_or(fields: &Map<String, Value>, name: &str, default: &[&str]) -> Result<Vec<String>> {
    if fields.contains_key(name) {
        grab_strings(fields, name)
    } else {
        Ok(default.iter().map(|s| s.to_string()).collect())
    }
}

fn grab_time_or(fields: &Map<String, Value>, name: &str, default: &str) -> Result<NaiveTime> {
    let s = grab_string_or(fields, name, default)?;
    match NaiveTime::parse_from_str(&s, "%H:%M") {
        Ok(t) => Ok(t),
        Err(_) => bail!("Field '{name}' must have the form HH:MM"),
    }
}

#[cfg(test)]
fn write_config(text: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, text).unwrap();
    (dir, path)
}

#[test]
fn test_read_full_config() {
    let (_dir, path) = write_config(
        r#"{
            "torque": {"log_dir": "/var/spool/torque/server_priv/accounting",
                       "nodes_cmd": "cluster-nodes --json", "qstat_cmd": "cluster-qstat --json",
                       "license_cmd": "cluster-matlab --json", "batch_queues": ["batch"]},
            "push": {"gateway_url": "http://localhost:9091"},
            "energy": {"xymonq_cfg": "/etc/xymonq.cfg", "pdus": ["pdu-a1", "pdu-a2"]},
            "lab": {"report_url": "http://lab/report", "day_begin": "08:00"},
            "store": {"projects": "/srv/pdb/projects.csv", "filer_stats": "/srv/pdb/filer_stats.csv"}
        }"#,
    );
    let c = read_from_json(&path).unwrap();
    let t = c.torque().unwrap();
    assert!(t.log_dir == PathBuf::from("/var/spool/torque/server_priv/accounting"));
    assert!(t.batch_queues == vec!["batch".to_string()]);
    assert!(c.push.gateway_url == "http://localhost:9091");
    assert!(c.push.opentsdb_url == "http://opentsdb:9042/api/put");
    let e = c.energy().unwrap();
    assert!(e.xymonq == "xymonq" && e.pdus.len() == 2);
    let l = c.lab().unwrap();
    assert!(l.excluded_sources == vec!["3055".to_string(), "30100".to_string()]);
    assert!(l.window.begin == NaiveTime::from_hms_opt(8, 0, 0).unwrap());
    assert!(l.window.end == NaiveTime::from_hms_opt(18, 0, 0).unwrap());
    assert!(c.store().unwrap().projects == PathBuf::from("/srv/pdb/projects.csv"));
}

#[test]
fn test_sections_and_defaults() {
    let (_dir, path) = write_config(r#"{"store": {"projects": "p.csv", "filer_stats": "f.csv"}}"#);
    let c = read_from_json(&path).unwrap();
    assert!(c.push == PushConfig::default());
    assert!(c.store().is_ok());
    let err = c.torque().unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Config(_))));
    assert!(c.energy().is_err() && c.lab().is_err());
}

#[test]
fn test_config_errors() {
    let bad = [
        r#"[]"#,
        r#"{"torque": {"log_dir": "/x", "nodes_cmd": "a", "qstat_cmd": "b"}}"#,
        r#"{"torque": "nope"}"#,
        r#"{"energy": {"xymonq_cfg": "c", "pdus": "pdu-a1"}}"#,
        r#"{"lab": {"report_url": "u", "day_begin": "8.30"}}"#,
        r#"{"lab": {"report_url": "u", "day_begin": "19:00"}}"#,
        r#"{"push": {"opentsdb_url": 42}}"#,
        r#"not json"#,
    ];
    for text in bad {
        let (_dir, path) = write_config(text);
        let err = read_from_json(&path).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Config(_))), "{text}");
    }
    assert!(read_from_json(Path::new("/nonexistent/hpcreport.json")).is_err());
}

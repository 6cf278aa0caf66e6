// Energy consumption per PDU, as reported by the xymon monitoring system.
//
// For each PDU we run
//
//   xymonq -c <cfg> -q xymondlog -H <pdu> -T energy
//
// and take the last token of the line containing DeviceStatusEnergy as the reading, in watts per
// hour.  xymonq exits with 255 for some benign conditions, so 0 and 255 are both accepted as long
// as the output has a reading.  A PDU without a reading is logged and left out.

use hpcmetrics::{Error, MetricRegistry, TagSet};

use anyhow::Result;
use std::io::Read;
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const METRIC: &str = "hpc_energy_usage";

pub trait EnergySource {
    fn reading(&self, pdu: &str) -> Result<f64>;
}

pub struct XymonSource {
    pub xymonq: String,
    pub config: String,
    pub timeout: Duration,
}

impl XymonSource {
    pub fn new(xymonq: &str, config: &str) -> XymonSource {
        XymonSource {
            xymonq: xymonq.to_string(),
            config: config.to_string(),
            timeout: Duration::from_secs(300),
        }
    }
}

impl EnergySource for XymonSource {
    fn reading(&self, pdu: &str) -> Result<f64> {
        let mut cmd = Command::new(&self.xymonq);
        cmd.args(["-c", &self.config, "-q", "xymondlog", "-H", pdu, "-T", "energy"]);
        let (code, output) = run_with_timeout(cmd, self.timeout)?;
        if code != Some(0) && code != Some(255) {
            return Err(Error::unavailable(pdu, format!("xymonq exited with {code:?}")).into());
        }
        match parse_energy(&output) {
            Some(v) => Ok(v),
            None => Err(Error::unavailable(pdu, "no DeviceStatusEnergy reading").into()),
        }
    }
}

/// Run the command to completion or until the timeout, returning its exit code and stdout.  The
/// command is killed if it times out.

fn run_with_timeout(mut cmd: Command, timeout: Duration) -> Result<(Option<i32>, String)> {
    debug!("running {cmd:?}");
    let mut child = cmd.stdout(Stdio::piped()).stderr(Stdio::null()).spawn()?;
    let mut stdout = child.stdout.take();
    let reader = thread::spawn(move || {
        let mut buf = String::new();
        if let Some(ref mut out) = stdout {
            let _ = out.read_to_string(&mut buf);
        }
        buf
    });

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::unavailable(format!("{cmd:?}"), format!("timed out after {timeout:?}")).into());
        }
        thread::sleep(Duration::from_millis(50));
    };
    let output = reader.join().unwrap_or_default();
    Ok((status.code(), output))
}

/// The last token of the first DeviceStatusEnergy line.

pub fn parse_energy(output: &str) -> Option<f64> {
    let line = output.lines().find(|l| l.contains("DeviceStatusEnergy"))?;
    f64::from_str(line.split_whitespace().last()?).ok()
}

pub fn collect(source: &dyn EnergySource, pdus: &[String]) -> MetricRegistry {
    let mut registry = MetricRegistry::with_metrics(&[METRIC]);
    for pdu in pdus {
        match source.reading(pdu) {
            Ok(v) => registry.set(METRIC, TagSet::new().with("pdu", pdu), v),
            Err(e) => warn!("Cannot retrieve energy consumption for {pdu}: {e}"),
        }
    }
    registry
}

#[cfg(test)]
struct FixedReadings(Vec<(&'static str, f64)>);

#[cfg(test)]
impl EnergySource for FixedReadings {
    fn reading(&self, pdu: &str) -> Result<f64> {
        match self.0.iter().find(|(p, _)| *p == pdu) {
            Some((_, v)) => Ok(*v),
            None => Err(Error::unavailable(pdu, "no such pdu").into()),
        }
    }
}

#[test]
fn test_parse_energy() {
    let output = "green Mon Jan 15 10:00:00 2024\n\
                  DeviceStatusVoltage : 230\n\
                  DeviceStatusEnergy : 12345.5\n";
    assert!(parse_energy(output) == Some(12345.5));
    assert!(parse_energy("DeviceStatusEnergy : n/a\n").is_none());
    assert!(parse_energy("").is_none());
}

#[test]
fn test_collect_skips_failed_pdus() {
    let source = FixedReadings(vec![("pdu-a1", 812.0), ("pdu-a3", 640.5)]);
    let pdus = ["pdu-a1", "pdu-a2", "pdu-a3"].map(String::from);
    let r = collect(&source, &pdus);
    assert!(r.len() == 2);
    assert!(r.get(METRIC, &TagSet::new().with("pdu", "pdu-a3")).unwrap().value == 640.5);
    assert!(r.get(METRIC, &TagSet::new().with("pdu", "pdu-a2")).is_none());
}

#[test]
fn test_run_with_timeout() {
    let mut cmd = Command::new("sh");
    cmd.args(["-c", "echo 'DeviceStatusEnergy : 17'; exit 255"]);
    let (code, out) = run_with_timeout(cmd, Duration::from_secs(10)).unwrap();
    assert!(code == Some(255) && parse_energy(&out) == Some(17.0));

    let mut cmd = Command::new("sleep");
    cmd.arg("5");
    assert!(run_with_timeout(cmd, Duration::from_millis(100)).is_err());
}

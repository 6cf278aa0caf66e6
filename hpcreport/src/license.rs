// License seat usage: one count per (package, host) at the time of collection.

use hpcmetrics::cluster::LicenseSource;
use hpcmetrics::{MetricRegistry, TagSet};

use anyhow::Result;
use tracing::debug;

pub const METRIC: &str = "hpc_acct_matlab_license_usage";

pub fn collect(source: &dyn LicenseSource, now: i64) -> Result<MetricRegistry> {
    let seats = source.seats()?;
    debug!("{} license seats in use", seats.len());
    let mut registry = MetricRegistry::with_metrics(&[METRIC]);
    for seat in seats {
        let tags = TagSet::new()
            .with("package", &seat.package)
            .with("host", &seat.host)
            .with("timestamp", now);
        registry.accumulate(METRIC, tags, 1.0);
    }
    Ok(registry)
}

#[cfg(test)]
use hpcmetrics::cluster::LicenseSeat;

#[cfg(test)]
struct FixedSeats(Vec<(&'static str, &'static str)>);

#[cfg(test)]
impl LicenseSource for FixedSeats {
    fn seats(&self) -> Result<Vec<LicenseSeat>> {
        Ok(self
            .0
            .iter()
            .map(|(package, host)| LicenseSeat {
                package: package.to_string(),
                host: host.to_string(),
            })
            .collect())
    }
}

#[test]
fn test_seats_per_host() {
    let source = FixedSeats(vec![
        ("MATLAB", "dccn-c001"),
        ("Signal_Toolbox", "dccn-c001"),
        ("MATLAB", "dccn-c001"),
        ("MATLAB", "dccn-c005"),
    ]);
    let r = collect(&source, 1705314600).unwrap();
    assert!(r.len() == 3);
    let matlab = r.query(METRIC, &TagSet::new().with("package", "MATLAB"));
    assert!(matlab.len() == 2);
    assert!(matlab[0].tags.get("host") == Some("dccn-c001") && matlab[0].value == 2.0);
    assert!(matlab[0].tags.get("timestamp") == Some("1705314600"));
}

// HTTP plumbing: the OpenTSDB put endpoint, the Prometheus push gateway, and plain GETs of report
// pages.  All requests are blocking, with a 3s connect timeout and a 10s total timeout, and are
// never retried.

use hpcmetrics::export::{self, Datapoint};
use hpcmetrics::{Error, MetricRegistry};

use anyhow::Result;
use reqwest::blocking::Client;
use std::time::Duration;
use tracing::{debug, error, info};

/// OpenTSDB is sent at most this many datapoints per request.

pub const OPENTSDB_BATCH_SIZE: usize = 500;

pub fn http_client() -> Result<Client> {
    Ok(Client::builder()
        .connect_timeout(Duration::from_secs(3))
        .timeout(Duration::from_secs(10))
        .build()?)
}

/// POST the datapoints to OpenTSDB in batches.  A failed batch is logged and the remaining batches
/// are still sent; the error of the last failed batch is returned.

pub fn push_datapoints(client: &Client, url: &str, points: &[Datapoint]) -> Result<()> {
    let mut failure = None;
    for (i, batch) in points.chunks(OPENTSDB_BATCH_SIZE).enumerate() {
        match post_batch(client, url, batch) {
            Ok(()) => debug!("batch {i}: {} datapoints sent to {url}", batch.len()),
            Err(e) => {
                error!("batch {i}: {e}");
                failure = Some(e);
            }
        }
    }
    match failure {
        Some(e) => Err(e),
        None => {
            info!("{} datapoints sent to {url}", points.len());
            Ok(())
        }
    }
}

fn post_batch(client: &Client, url: &str, batch: &[Datapoint]) -> Result<()> {
    let response = client.post(url).json(batch).send()?;
    check_status(response)?;
    Ok(())
}

fn check_status(response: reqwest::blocking::Response) -> Result<reqwest::blocking::Response> {
    let status = response.status();
    if status.as_u16() >= 400 {
        let body = response.text().unwrap_or_default();
        return Err(Error::TransportFailure {
            status: status.as_u16(),
            body,
        }
        .into());
    }
    Ok(response)
}

/// The push gateway URL for a job's metric group.

pub fn job_url(gateway: &str, job: &str) -> String {
    format!("{}/metrics/job/{job}", gateway.trim_end_matches('/'))
}

/// Replace the job's metric group on the push gateway with the registry.

pub fn push_gateway(client: &Client, gateway: &str, job: &str, registry: &MetricRegistry) -> Result<()> {
    let mut body = Vec::new();
    export::render_text(registry, &mut body)?;
    let url = job_url(gateway, job);
    let response = client
        .put(&url)
        .header(reqwest::header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(body)
        .send()?;
    check_status(response)?;
    info!("{} samples pushed to {url}", registry.len());
    Ok(())
}

/// Everything the push gateway currently exposes.

pub fn fetch_gateway(client: &Client, gateway: &str) -> Result<MetricRegistry> {
    let url = format!("{}/metrics", gateway.trim_end_matches('/'));
    let text = fetch_text(client, &url)?;
    Ok(export::parse_text(&text))
}

pub fn fetch_text(client: &Client, url: &str) -> Result<String> {
    debug!("GET {url}");
    let response = match client.get(url).send() {
        Ok(r) => r,
        Err(e) => return Err(Error::unavailable(url, e).into()),
    };
    let status = response.status();
    if !status.is_success() {
        return Err(Error::unavailable(url, format!("HTTP {status}")).into());
    }
    Ok(response.text()?)
}

#[test]
fn test_job_url() {
    assert!(job_url("http://gw-prometheus:9091", "hpc_metrics") == "http://gw-prometheus:9091/metrics/job/hpc_metrics");
    assert!(job_url("http://gw:9091/", "hpc_energy") == "http://gw:9091/metrics/job/hpc_energy");
}

#[test]
fn test_unreachable_endpoints() {
    // Nothing listens on port 9 of the loopback interface.
    let client = http_client().unwrap();
    let err = fetch_text(&client, "http://127.0.0.1:9/report").unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::SourceUnavailable { .. })));
    assert!(push_datapoints(&client, "http://127.0.0.1:9/api/put", &[]).is_ok());
}

// A one-shot HTTP server on the loopback interface.  It answers one connection per scripted
// (status, body) response, in order, and returns the requests it saw.

#[cfg(test)]
struct Request {
    method: String,
    path: String,
    content_type: String,
    body: Vec<u8>,
}

#[cfg(test)]
fn serve(responses: Vec<(u16, &'static str)>) -> (String, std::thread::JoinHandle<Vec<Request>>) {
    use std::io::{BufRead, BufReader, Read, Write};

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let handle = std::thread::spawn(move || {
        let mut requests = vec![];
        for (status, text) in responses {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            let mut fields = line.split_whitespace();
            let method = fields.next().unwrap_or_default().to_string();
            let path = fields.next().unwrap_or_default().to_string();
            let mut content_length = 0;
            let mut content_type = String::new();
            loop {
                let mut header = String::new();
                reader.read_line(&mut header).unwrap();
                let header = header.trim_end();
                if header.is_empty() {
                    break;
                }
                if let Some((k, v)) = header.split_once(':') {
                    match k.trim().to_ascii_lowercase().as_str() {
                        "content-length" => content_length = v.trim().parse().unwrap(),
                        "content-type" => content_type = v.trim().to_string(),
                        _ => {}
                    }
                }
            }
            let mut body = vec![0; content_length];
            reader.read_exact(&mut body).unwrap();
            write!(
                stream,
                "HTTP/1.1 {status} Status\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{text}",
                text.len()
            )
            .unwrap();
            stream.flush().unwrap();
            requests.push(Request {
                method,
                path,
                content_type,
                body,
            });
        }
        requests
    });
    (base, handle)
}

#[cfg(test)]
fn points(n: usize) -> Vec<Datapoint> {
    (0..n)
        .map(|i| Datapoint {
            metric: "hpc_acct_job_count".to_string(),
            timestamp: 1705314600,
            value: 1.0,
            tags: hpcmetrics::TagSet::new().with("uid", i),
        })
        .collect()
}

#[cfg(test)]
fn batch_len(body: &[u8]) -> usize {
    let v = serde_json::from_slice::<serde_json::Value>(body).unwrap();
    v.as_array().unwrap().len()
}

#[test]
fn test_push_rejected() {
    let (base, server) = serve(vec![(400, "bad datapoint")]);
    let client = http_client().unwrap();
    let err = push_datapoints(&client, &format!("{base}/api/put"), &points(3)).unwrap_err();
    match err.downcast_ref::<Error>() {
        Some(Error::TransportFailure { status, body }) => {
            assert!(*status == 400);
            assert!(body == "bad datapoint");
        }
        _ => panic!("unexpected error {err}"),
    }
    let requests = server.join().unwrap();
    assert!(requests.len() == 1);
    assert!(requests[0].method == "POST" && requests[0].path == "/api/put");
    assert!(requests[0].content_type == "application/json");
    assert!(batch_len(&requests[0].body) == 3);
}

#[test]
fn test_push_in_batches() {
    // The first batch fails, the second is still sent, and the failure is reported.
    let (base, server) = serve(vec![(500, "overloaded"), (200, "")]);
    let client = http_client().unwrap();
    let err = push_datapoints(&client, &format!("{base}/api/put"), &points(OPENTSDB_BATCH_SIZE + 1))
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::TransportFailure { status: 500, .. })
    ));
    let requests = server.join().unwrap();
    assert!(requests.len() == 2);
    assert!(batch_len(&requests[0].body) == OPENTSDB_BATCH_SIZE);
    assert!(batch_len(&requests[1].body) == 1);
}

#[test]
fn test_push_and_fetch_gateway() {
    let exposed = "# TYPE hpc_stat_node_status gauge\nhpc_stat_node_status{host=\"dccn-c003\"} 2\n";
    let (base, server) = serve(vec![(200, ""), (400, "text format parsing error"), (200, exposed)]);
    let client = http_client().unwrap();

    let mut r = MetricRegistry::new();
    r.set("hpc_stat_node_status", hpcmetrics::TagSet::new().with("host", "dccn-c003"), 2.0);
    assert!(push_gateway(&client, &base, "hpc_metrics", &r).is_ok());

    let err = push_gateway(&client, &base, "hpc_metrics", &r).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::TransportFailure { status: 400, .. })
    ));

    let fetched = fetch_gateway(&client, &base).unwrap();
    let host = hpcmetrics::TagSet::new().with("host", "dccn-c003");
    assert!(fetched.get("hpc_stat_node_status", &host).unwrap().value == 2.0);

    let requests = server.join().unwrap();
    assert!(requests[0].method == "PUT" && requests[0].path == "/metrics/job/hpc_metrics");
    assert!(requests[0].content_type.starts_with("text/plain"));
    let body = String::from_utf8(requests[0].body.clone()).unwrap();
    assert!(body.contains("hpc_stat_node_status{host=\"dccn-c003\"} 2"));
    assert!(requests[2].method == "GET" && requests[2].path == "/metrics");
}

//! Integration tests for the Prometheus metrics endpoint.
//!
//! Each test drives real producer, consumer and monitor code against the in-memory
//! broker, then scrapes `GET /metrics` from an in-process server on an ephemeral port.
//!
//! All tests use `#[serial]` because the metrics recorder is process-global.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use serial_test::serial;
use streamfold::{
    CheckpointStore, ConsumerConfig, ConsumerGroupManager, Entry, MemoryBroker, ProducerConfig,
    StartId, StreamConsumer, StreamMonitor, StreamProducer, metrics,
};

/// Start a metrics server on an ephemeral port and return its address.
async fn start_metrics_server() -> SocketAddr {
    let handle = metrics::ensure_recorder();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind should succeed");
    let addr = listener.local_addr().expect("should have local addr");
    let _join = metrics::serve_metrics_on_listener(handle, listener);
    addr
}

/// Send a raw HTTP/1.1 GET for `/metrics` and return the full response.
async fn scrape_raw(addr: SocketAddr) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut stream = tokio::net::TcpStream::connect(addr)
        .await
        .expect("should connect to metrics endpoint");
    let request = format!("GET /metrics HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .expect("should write request");
    let mut buf = Vec::with_capacity(4096);
    stream
        .read_to_end(&mut buf)
        .await
        .expect("should read response");
    String::from_utf8(buf).expect("response should be valid UTF-8")
}

/// Scrape `GET /metrics` and return only the body.
async fn scrape_body(addr: SocketAddr) -> String {
    let raw = scrape_raw(addr).await;
    raw.split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default()
}

/// Numeric value of the first line starting with `prefix`.
fn parse_metric_value(rendered: &str, prefix: &str) -> Option<f64> {
    rendered.lines().find_map(|line| {
        line.strip_prefix(prefix)
            .and_then(|rest| rest.trim().parse::<f64>().ok())
    })
}

#[tokio::test]
#[serial]
async fn endpoint_serves_prometheus_text() {
    let addr = start_metrics_server().await;
    let raw = scrape_raw(addr).await;
    assert!(raw.starts_with("HTTP/1.1 200"), "unexpected response: {raw}");
    assert!(
        raw.to_ascii_lowercase()
            .contains("content-type: text/plain; version=0.0.4"),
        "missing prometheus content type: {raw}"
    );
}

#[tokio::test]
#[serial]
async fn publish_and_ack_are_counted_per_stream() {
    let addr = start_metrics_server().await;
    let broker = Arc::new(MemoryBroker::new());
    let producer = StreamProducer::new(broker.clone(), ProducerConfig::new("metrics-orders"))
        .await
        .unwrap();
    ConsumerGroupManager::new(broker.clone())
        .create_group("metrics-orders", "billing", StartId::Beginning)
        .await
        .unwrap();
    for i in 0..3 {
        producer
            .publish("order.created", &json!({ "i": i }), None)
            .await
            .unwrap();
    }

    let mut config = ConsumerConfig::new("metrics-orders", "billing", "c1");
    config.block = Duration::from_millis(20);
    config.reclaim_interval = None;
    let consumer = Arc::new(
        StreamConsumer::new(broker.clone(), CheckpointStore::new(broker.clone()), config).unwrap(),
    );
    let stopper = consumer.clone();
    let mut seen = 0;
    let handler = move |entry: &Entry| -> anyhow::Result<bool> {
        seen += 1;
        if seen == 3 {
            stopper.close();
        }
        if entry.payload["i"] == 1 {
            anyhow::bail!("poison entry");
        }
        Ok(true)
    };
    tokio::time::timeout(Duration::from_secs(5), consumer.subscribe(handler))
        .await
        .expect("subscription should stop in time")
        .unwrap();

    let body = scrape_body(addr).await;
    assert_eq!(
        parse_metric_value(&body, r#"streamfold_published_total{stream="metrics-orders"} "#),
        Some(3.0),
        "{body}"
    );
    let acked = body
        .lines()
        .find(|l| l.starts_with("streamfold_acked_total") && l.contains("metrics-orders"))
        .expect("acked counter should be present");
    assert!(acked.ends_with(" 2"), "got: {acked}");
    assert!(
        body.lines().any(|l| l.starts_with("streamfold_handler_errors_total")
            && l.contains("metrics-orders")
            && l.ends_with(" 1")),
        "{body}"
    );
}

#[tokio::test]
#[serial]
async fn monitor_updates_depth_gauges() {
    let addr = start_metrics_server().await;
    let broker = Arc::new(MemoryBroker::new());
    let producer = StreamProducer::new(broker.clone(), ProducerConfig::new("metrics-depth"))
        .await
        .unwrap();
    ConsumerGroupManager::new(broker.clone())
        .create_group("metrics-depth", "g", StartId::NewOnly)
        .await
        .unwrap();
    for _ in 0..4 {
        producer.publish("e", &json!({}), None).await.unwrap();
    }

    let metrics = StreamMonitor::new(broker.clone())
        .get_backpressure_metrics("metrics-depth", "g")
        .await;
    assert_eq!(metrics.stream_length, 4);
    assert_eq!(metrics.pending_count, 0);

    let body = scrape_body(addr).await;
    assert_eq!(
        parse_metric_value(&body, r#"streamfold_stream_length{stream="metrics-depth"} "#),
        Some(4.0),
        "{body}"
    );
    assert!(
        body.contains("streamfold_pending_entries"),
        "pending gauge missing: {body}"
    );
}

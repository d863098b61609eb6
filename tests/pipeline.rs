//! End-to-end pipeline tests over the in-process broker.
//!
//! emitter --(HTTP)--> receiver, both publishing onto the `log` topic, and a
//! monitor subscribed to that topic serving what it has seen.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use http::{Request, StatusCode};
use tokio::net::TcpListener;
use tower::ServiceExt;

use logbus::bus::{ChannelBroker, Publisher, Subscriber, SubscriberConfig};
use logbus::config::{BrokerConfig, EmitterConfig};
use logbus::emitter::{EmitLoop, HttpPeerClient};
use logbus::monitor::{ingest, rest, LogAggregator};
use logbus::receiver::{self, ReceiverState};

fn broker_config() -> BrokerConfig {
    BrokerConfig {
        url: "memory://local".to_string(),
        connect_retry_ms: 10,
        ..Default::default()
    }
}

/// Subscribe a monitor to `log` and start ingesting in the background.
async fn start_monitor(broker: &ChannelBroker) -> LogAggregator {
    let messages = Subscriber::connect(broker, &broker_config(), &SubscriberConfig::exclusive("log"))
        .await
        .unwrap()
        .into_stream()
        .await
        .unwrap();
    let aggregator = LogAggregator::new();
    tokio::spawn(ingest::run(messages, aggregator.clone()));
    aggregator
}

async fn wait_for_lines(aggregator: &LogAggregator, n: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while aggregator.line_count().await < n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("monitor did not receive all lines");
}

async fn read_monitor(aggregator: LogAggregator) -> String {
    let req = Request::builder().uri("/").body(Body::empty()).unwrap();
    let resp = rest::router(aggregator).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
        .await
        .unwrap();
    String::from_utf8(body.to_vec()).unwrap()
}

#[tokio::test]
async fn test_published_lines_served_verbatim() {
    let broker = ChannelBroker::new();
    let aggregator = start_monitor(&broker).await;

    let publisher = Publisher::connect(&broker, &broker_config()).await.unwrap();
    publisher
        .publish("SND 1 2024-01-01T00:00:00Z 10.0.0.1:8000")
        .await
        .unwrap();
    publisher.publish("SND STOP").await.unwrap();
    wait_for_lines(&aggregator, 2).await;

    assert_eq!(
        read_monitor(aggregator).await,
        "SND 1 2024-01-01T00:00:00Z 10.0.0.1:8000\nSND STOP\n"
    );
    publisher.close().await.unwrap();
}

#[tokio::test]
async fn test_monitor_waits_for_broker() {
    let broker = ChannelBroker::new();
    broker.refuse_connections(3);

    let aggregator = start_monitor(&broker).await;
    assert_eq!(broker.connect_attempts(), 4);

    let publisher = Publisher::connect(&broker, &broker_config()).await.unwrap();
    publisher.publish("SND STOP").await.unwrap();
    wait_for_lines(&aggregator, 1).await;

    assert_eq!(read_monitor(aggregator).await, "SND STOP\n");
}

#[tokio::test]
async fn test_lines_published_before_subscribing_are_missed() {
    let broker = ChannelBroker::new();
    let publisher = Publisher::connect(&broker, &broker_config()).await.unwrap();
    publisher.publish("SND 1 early").await.unwrap();

    let aggregator = start_monitor(&broker).await;
    publisher.publish("SND 2 late").await.unwrap();
    wait_for_lines(&aggregator, 1).await;

    assert_eq!(read_monitor(aggregator).await, "SND 2 late\n");
}

#[tokio::test]
async fn test_emitter_and_receiver_both_reach_monitor() {
    let dir = tempfile::tempdir().unwrap();
    let broker = ChannelBroker::new();
    let aggregator = start_monitor(&broker).await;

    let receiver_publisher = Publisher::connect(&broker, &broker_config()).await.unwrap();
    let state = ReceiverState::create(
        &dir.path().join("service2.log"),
        Some(Arc::new(receiver_publisher)),
    )
    .await
    .unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(receiver::serve(listener, state));

    let emitter_publisher = Publisher::connect(&broker, &broker_config()).await.unwrap();
    let config = EmitterConfig {
        peer: format!("127.0.0.1:{}", port),
        count: 3,
        interval_ms: 0,
        log_path: dir.path().join("service1.log"),
        publish: true,
    };
    let emitter = EmitLoop::new(
        config,
        HttpPeerClient::new(Duration::from_secs(5)).unwrap(),
        Some(emitter_publisher),
    )
    .await
    .unwrap();
    let (summary, publisher) = emitter.run().await.unwrap();
    publisher.unwrap().close().await.unwrap();

    assert_eq!(summary.sent, 3);
    assert_eq!(summary.post_failures, 0);
    wait_for_lines(&aggregator, 8).await;

    let text = read_monitor(aggregator).await;
    let lines: Vec<&str> = text.lines().collect();
    let sent: Vec<&&str> = lines.iter().filter(|l| l.starts_with("SND ")).collect();
    let received: Vec<&&str> = lines.iter().filter(|l| l.starts_with("RCV ")).collect();
    assert_eq!(sent.len(), 4);
    assert_eq!(received.len(), 4);
    assert_eq!(*sent[3], "SND STOP");
    assert!(received[3].starts_with("RCV STOP 127.0.0.1:"));
    for (i, line) in sent.iter().take(3).enumerate() {
        assert!(line.starts_with(&format!("SND {} ", i + 1)));
        assert!(line.ends_with(&format!(" 127.0.0.1:{}", port)));
    }

    let received_log = std::fs::read_to_string(dir.path().join("service2.log")).unwrap();
    assert_eq!(received_log.lines().count(), 4);
}

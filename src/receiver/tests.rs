use super::*;
use axum::body::Body;
use axum::extract::connect_info::MockConnectInfo;
use http::{header, Request};
use tower::ServiceExt;

fn peer() -> SocketAddr {
    "10.0.0.2:41000".parse().unwrap()
}

fn post_line(line: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/")
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from(line.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_post_appends_body_and_remote_addr() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("logs").join("service2.log");
    let state = ReceiverState::create(&path, None).await.unwrap();
    let app = router(state).layer(MockConnectInfo(peer()));

    let resp = app
        .clone()
        .oneshot(post_line("1 2024-01-01T00:00:00Z 10.0.0.1:8000"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let resp = app.oneshot(post_line("STOP")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let log = std::fs::read_to_string(&path).unwrap();
    assert_eq!(
        log,
        "1 2024-01-01T00:00:00Z 10.0.0.1:8000 10.0.0.2:41000\nSTOP 10.0.0.2:41000\n"
    );
}

#[tokio::test]
async fn test_create_fails_on_unusable_log_path() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("logs");
    std::fs::write(&blocker, "not a directory").unwrap();

    let result = ReceiverState::create(&blocker.join("service2.log"), None).await;

    assert!(result.is_err());
}

#[tokio::test]
async fn test_get_not_allowed() {
    let dir = tempfile::tempdir().unwrap();
    let state = ReceiverState::create(&dir.path().join("service2.log"), None)
        .await
        .unwrap();
    let req = Request::builder().uri("/").body(Body::empty()).unwrap();

    let resp = router(state)
        .layer(MockConnectInfo(peer()))
        .oneshot(req)
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[cfg(feature = "channel")]
#[tokio::test]
async fn test_received_lines_mirrored_with_prefix() {
    use crate::bus::{ChannelBroker, Subscriber, SubscriberConfig};
    use futures::StreamExt;

    let dir = tempfile::tempdir().unwrap();
    let broker = ChannelBroker::new();
    let conn = broker.connection();
    let mut subscriber = Subscriber::open(&conn, &SubscriberConfig::exclusive("log"))
        .await
        .unwrap();
    let mut messages = subscriber.messages().await.unwrap();
    let publisher = Arc::new(Publisher::open(&conn, "log").await.unwrap());

    let state = ReceiverState::create(&dir.path().join("service2.log"), None)
        .await
        .unwrap()
        .with_publisher(publisher);
    let resp = router(state)
        .layer(MockConnectInfo(peer()))
        .oneshot(post_line("STOP"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let message = messages.next().await.unwrap();
    assert_eq!(message.as_text(), "RCV STOP 10.0.0.2:41000");
}

#[cfg(feature = "channel")]
#[tokio::test]
async fn test_publish_failure_still_accepts_line() {
    use crate::bus::{BrokerConnection, ChannelBroker};

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("service2.log");
    let broker = ChannelBroker::new();
    let conn = broker.connection();
    let publisher = Arc::new(Publisher::open(&conn, "log").await.unwrap());
    conn.close().await.unwrap();

    let state = ReceiverState::create(&path, Some(publisher)).await.unwrap();
    let resp = router(state)
        .layer(MockConnectInfo(peer()))
        .oneshot(post_line("3 x"))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "3 x 10.0.0.2:41000\n");
}

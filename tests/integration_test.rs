//! End-to-end tests against the embedded receivers and the Transport,
//! wired together the same way `main.rs` wires them but driven directly
//! instead of through the Lambda lifecycle API. Run with
//! `cargo test --test integration_test`.

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::util::ServiceExt;

use lambda_telemetry_extension::logs::LogsReceiver;
use lambda_telemetry_extension::metadata::MetadataCache;
use lambda_telemetry_extension::receiver::AgentReceiver;
use lambda_telemetry_extension::transport::{Transport, TransportState};

/// Agent posts a payload, then posts `/flush`; the forwarder (here,
/// driven by hand instead of the Coordinator) drains the queue and
/// successfully reaches a mocked backend, ending Healthy.
#[tokio::test]
async fn test_agent_payload_round_trip_reaches_mock_backend() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/intake/v2/events")
        .with_status(202)
        .create_async()
        .await;

    let transport = Transport::new(
        server.url(),
        None,
        Duration::from_secs(2),
        16,
    )
    .unwrap();
    let metadata = MetadataCache::new();
    let receiver = AgentReceiver::new(transport.clone(), metadata.clone(), Duration::from_secs(15));
    let app = receiver.router();

    let body = br#"{"metadata":{"service":{"name":"checkout"}}}
{"transaction":{"name":"GET /"}}
"#;
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/intake/v2/events")
                .body(Body::from(body.to_vec()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/flush")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    assert_eq!(transport.queue_len().await, 1);
    assert!(metadata.get().await.is_some());

    let cancel = tokio_util::sync::CancellationToken::new();
    transport.flush(&cancel).await;

    assert_eq!(transport.queue_len().await, 0);
    assert_eq!(transport.state().await, TransportState::Healthy);
    mock.assert_async().await;
}

/// A `platform.report` log event, once metadata has been captured,
/// synthesizes and enqueues a metricset document ready for the forwarder.
#[tokio::test]
async fn test_platform_report_produces_forwardable_metricset() {
    let transport = Transport::new(
        "http://127.0.0.1:1".to_string(),
        None,
        Duration::from_millis(100),
        16,
    )
    .unwrap();
    let metadata = MetadataCache::new();
    let agent_receiver = AgentReceiver::new(transport.clone(), metadata.clone(), Duration::from_secs(15));
    let logs_receiver = LogsReceiver::new(transport.clone(), metadata.clone());

    let agent_app = agent_receiver.router();
    agent_app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/intake/v2/events")
                .body(Body::from(
                    br#"{"metadata":{"service":{"name":"checkout"}}}"#.to_vec(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert!(metadata.get().await.is_some());

    logs_receiver.begin_invocation("req-42".to_string(), 5000.0);

    let logs_app = logs_receiver.router();
    let batch = serde_json::json!([
        {
            "time": "2021-02-04T20:00:05.123Z",
            "type": "platform.report",
            "record": {
                "requestId": "req-42",
                "invokedFunctionArn": "arn:aws:lambda:us-east-2:1:function:f",
                "metrics": {
                    "durationMs": 12.3,
                    "billedDurationMs": 13.0,
                    "memorySizeMB": 128.0,
                    "maxMemoryUsedMB": 80.0,
                    "initDurationMs": 200.0
                }
            }
        }
    ]);
    let response = logs_app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/")
                .header("content-type", "application/json")
                .body(Body::from(batch.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    assert_eq!(transport.queue_len().await, 1);
}

/// Agent receiver's healthcheck route reports ok without touching any
/// shared state.
#[tokio::test]
async fn test_agent_receiver_healthcheck() {
    let transport = Transport::new(
        "http://127.0.0.1:1".to_string(),
        None,
        Duration::from_millis(100),
        4,
    )
    .unwrap();
    let receiver = AgentReceiver::new(transport, MetadataCache::new(), Duration::from_secs(15));
    let app = receiver.router();

    let response = app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/healthcheck")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"ok");
}

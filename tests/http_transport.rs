// HTTP transport against a mock peer.

use chrono::Utc;
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use fleet_supervisor::agents::{AgentId, LoadSnapshot};
use fleet_supervisor::comm::{CommunicationLayer, Envelope, HttpTransport, Payload, Reply, RetryPolicy, Transport};
use fleet_supervisor::errors::CommunicationError;
use std::sync::Arc;

fn heartbeat() -> Envelope {
    Envelope::new(
        "office",
        Payload::Heartbeat {
            agent_id: AgentId::from("office"),
            load: LoadSnapshot::new(0.2, 0.3, 0, Utc::now()),
        },
    )
}

fn transport() -> HttpTransport {
    HttpTransport::new(Duration::from_millis(250))
}

fn policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 2,
        base_delay: Duration::from_millis(10),
        timeout: Duration::from_secs(2),
        jitter: false,
        ..RetryPolicy::default()
    }
}

#[tokio::test]
async fn successful_reply_is_decoded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rpc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "type": "ack" })))
        .expect(1)
        .mount(&server)
        .await;

    let reply = transport().deliver(&server.uri(), &heartbeat()).await;
    assert_eq!(reply, Ok(Reply::Ack));
}

#[tokio::test]
async fn conflict_means_duplicate() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rpc"))
        .respond_with(ResponseTemplate::new(409))
        .mount(&server)
        .await;

    let envelope = heartbeat();
    let err = transport().deliver(&server.uri(), &envelope).await.unwrap_err();
    assert_eq!(
        err,
        CommunicationError::DuplicateSuppressed {
            request_id: envelope.request_id.clone()
        }
    );

    // The layer treats a duplicate as already delivered.
    let layer = CommunicationLayer::new("office", Arc::new(transport()), policy());
    assert_eq!(layer.send(&server.uri(), envelope, policy()).await, Ok(Reply::Ack));
}

#[tokio::test]
async fn client_errors_are_rejections_with_the_peer_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rpc"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({
            "code": "REJECTED",
            "message": "supervisor does not execute tasks"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let layer = CommunicationLayer::new("office", Arc::new(transport()), policy());
    match layer.send(&server.uri(), heartbeat(), policy()).await {
        Err(CommunicationError::Rejected { reason, .. }) => {
            assert_eq!(reason, "supervisor does not execute tasks")
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[tokio::test]
async fn server_errors_are_retried_with_the_same_request_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rpc"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rpc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "type": "ack" })))
        .mount(&server)
        .await;

    let layer = CommunicationLayer::new("office", Arc::new(transport()), policy());
    assert_eq!(layer.send(&server.uri(), heartbeat(), policy()).await, Ok(Reply::Ack));

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 2);
    let sent: Vec<Envelope> = received.iter().map(|r| r.body_json().unwrap()).collect();
    assert_eq!(sent[0].request_id, sent[1].request_id);
    assert_eq!((sent[0].attempt, sent[1].attempt), (0, 1));
}

#[tokio::test]
async fn persistent_failures_surface_unreachable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rpc"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let layer = CommunicationLayer::new("office", Arc::new(transport()), policy());
    let err = layer.send(&server.uri(), heartbeat(), policy()).await.unwrap_err();
    assert_eq!(
        err,
        CommunicationError::Unreachable {
            peer: server.uri(),
            attempts: 3
        }
    );
}

#[tokio::test]
async fn slow_peers_time_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rpc"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "type": "ack" }))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let err = transport().deliver(&server.uri(), &heartbeat()).await.unwrap_err();
    assert!(matches!(err, CommunicationError::Timeout { .. }), "{err:?}");
    assert!(err.is_transient());
}

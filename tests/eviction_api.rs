//! Eviction HTTP status mapping against a mocked API server.

use http::{Request, Response, StatusCode};
use kube::client::Body;
use kube::Client;
use tower_test::mock;

use karpenter::termination::eviction::{EvictOutcome, EvictionKey, PodEvictor};

fn key(name: &str) -> EvictionKey {
    EvictionKey {
        namespace: "default".into(),
        name: name.into(),
        uid: format!("uid-{name}"),
        provider_id: "fake://i-1".into(),
    }
}

fn status_body(code: u16, reason: &str, message: &str) -> Body {
    let status = serde_json::json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": message,
        "reason": reason,
        "code": code,
    });
    Body::from(serde_json::to_vec(&status).unwrap())
}

#[tokio::test]
async fn not_found_is_success() {
    let (mock_service, mut handle) = mock::pair::<Request<Body>, Response<Body>>();
    let client = Client::new(mock_service, "default");

    let responder = tokio::spawn(async move {
        let (request, send) = handle.next_request().await.expect("eviction request");
        assert_eq!(request.method(), http::Method::POST);
        assert!(
            request.uri().path().ends_with("/pods/web/eviction"),
            "unexpected path {}",
            request.uri().path()
        );
        send.send_response(
            Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(status_body(404, "NotFound", "pods \"web\" not found"))
                .unwrap(),
        );
    });

    let outcome = PodEvictor::Kube(client).evict(&key("web")).await;
    assert_eq!(outcome, EvictOutcome::Gone);
    responder.await.unwrap();
}

#[tokio::test]
async fn pdb_rejection_is_blocked_not_failed() {
    let (mock_service, mut handle) = mock::pair::<Request<Body>, Response<Body>>();
    let client = Client::new(mock_service, "default");

    let responder = tokio::spawn(async move {
        let (_request, send) = handle.next_request().await.expect("eviction request");
        send.send_response(
            Response::builder()
                .status(StatusCode::TOO_MANY_REQUESTS)
                .body(status_body(
                    429,
                    "TooManyRequests",
                    "Cannot evict pod as it would violate the pod's disruption budget.",
                ))
                .unwrap(),
        );
    });

    let outcome = PodEvictor::Kube(client).evict(&key("web")).await;
    let EvictOutcome::Blocked(message) = outcome else {
        panic!("expected Blocked, got {outcome:?}");
    };
    assert!(message.contains("disruption budget"));
    responder.await.unwrap();
}

#[tokio::test]
async fn conflict_means_the_pod_was_recreated() {
    let (mock_service, mut handle) = mock::pair::<Request<Body>, Response<Body>>();
    let client = Client::new(mock_service, "default");

    let responder = tokio::spawn(async move {
        let (_request, send) = handle.next_request().await.expect("eviction request");
        send.send_response(
            Response::builder()
                .status(StatusCode::CONFLICT)
                .body(status_body(409, "Conflict", "uid mismatch"))
                .unwrap(),
        );
    });

    let outcome = PodEvictor::Kube(client).evict(&key("web")).await;
    assert_eq!(outcome, EvictOutcome::Gone);
    responder.await.unwrap();
}

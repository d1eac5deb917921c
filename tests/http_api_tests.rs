//! Exercises the HTTP surface end to end: a real listener, `HttpTransport`
//! on the client side, and error classification across the wire.

use serde_json::json;
use std::sync::Arc;
use tempfile::tempdir;

use fieldsync::{
    Actor, CommandDispatcher, CommandEnvelope, CommandTransport, ExecutorPolicy, HandlerRegistry,
    HttpTransport, IdempotentExecutor, ServerState, StateLedger, StatusFlow, SyncError,
    build_router, register_workflow,
};

struct TestServer {
    base_url: String,
    _dir: tempfile::TempDir,
}

async fn serve() -> TestServer {
    let dir = tempdir().unwrap();
    let ledger = Arc::new(
        StateLedger::open(dir.path(), ExecutorPolicy::default())
            .await
            .unwrap(),
    );
    let executor = Arc::new(IdempotentExecutor::new(
        ledger.clone(),
        ExecutorPolicy::default(),
    ));
    let mut registry = HandlerRegistry::new();
    register_workflow(&mut registry, "rfi", StatusFlow::standard());
    let dispatcher = Arc::new(CommandDispatcher::new(registry, executor));

    let router = build_router(ServerState { dispatcher, ledger });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    TestServer {
        base_url: format!("http://{}", addr),
        _dir: dir,
    }
}

fn actor() -> Actor {
    Actor::new("user-1")
}

#[tokio::test]
async fn command_round_trip_over_http() {
    let server = serve().await;
    let transport = HttpTransport::with_timeout_ms(&server.base_url, 2_000).unwrap();

    let env = CommandEnvelope::new(
        "rfi",
        "create",
        json!({"entity_id": "E", "fields": {"title": "cracked slab"}}),
        actor(),
    );
    let response = transport.dispatch(&env.to_request()).await.unwrap();

    assert!(!response.replayed);
    assert_eq!(response.entities.len(), 1);
    assert_eq!(response.entities[0].status, "draft");
    assert_eq!(response.audit.len(), 1);
    assert_eq!(response.audit[0].event, "created");

    // A retransmission of the same request replays the recorded outcome.
    let replay = transport.dispatch(&env.to_request()).await.unwrap();
    assert!(replay.replayed);
    assert_eq!(replay.entities, response.entities);
}

#[tokio::test]
async fn error_classification_survives_the_wire() {
    let server = serve().await;
    let transport = HttpTransport::with_timeout_ms(&server.base_url, 2_000).unwrap();

    // Malformed payload: the handler rejects it as validation.
    let err = transport
        .dispatch(&CommandEnvelope::new("rfi", "create", json!({}), actor()).to_request())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));

    // Unknown module: unroutable, carrying the route that failed.
    let err = transport
        .dispatch(
            &CommandEnvelope::new("permits", "create", json!({"entity_id": "P"}), actor())
                .to_request(),
        )
        .await
        .unwrap_err();
    assert!(
        matches!(err, SyncError::UnroutableCommand { ref module, .. } if module == "permits")
    );

    // Illegal transition on an existing entity: conflict.
    transport
        .dispatch(
            &CommandEnvelope::new("rfi", "create", json!({"entity_id": "E"}), actor())
                .to_request(),
        )
        .await
        .unwrap();
    let err = transport
        .dispatch(
            &CommandEnvelope::new(
                "rfi",
                "transition",
                json!({"entity_id": "E", "status": "completed"}),
                actor(),
            )
            .to_request(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Conflict(_)));
}

#[tokio::test]
async fn read_endpoints_expose_entities_and_audit() {
    let server = serve().await;
    let transport = HttpTransport::with_timeout_ms(&server.base_url, 2_000).unwrap();
    let client = reqwest::Client::new();

    let health: serde_json::Value = client
        .get(format!("{}/health", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    for entity_id in ["A", "B"] {
        transport
            .dispatch(
                &CommandEnvelope::new(
                    "rfi",
                    "create",
                    json!({"entity_id": entity_id, "fields": {"title": entity_id}}),
                    actor(),
                )
                .to_request(),
            )
            .await
            .unwrap();
    }
    transport
        .dispatch(
            &CommandEnvelope::new(
                "rfi",
                "transition",
                json!({"entity_id": "A", "status": "submitted"}),
                actor(),
            )
            .to_request(),
        )
        .await
        .unwrap();

    let listed: Vec<serde_json::Value> = client
        .get(format!("{}/api/entities/rfi", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0]["entity_id"], "A");
    assert_eq!(listed[1]["entity_id"], "B");

    let one: serde_json::Value = client
        .get(format!("{}/api/entities/rfi/A", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(one["status"], "submitted");
    assert_eq!(one["version"], 2);

    let trail: Vec<serde_json::Value> = client
        .get(format!("{}/api/audit/A", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let events: Vec<&str> = trail.iter().map(|r| r["event"].as_str().unwrap()).collect();
    assert_eq!(events, vec!["created", "submitted"]);
}

#[tokio::test]
async fn missing_entity_maps_to_not_found() {
    let server = serve().await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/api/entities/rfi/nope", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn unreachable_server_is_a_transient_failure() {
    // Bind and immediately drop a listener so the port is closed.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let transport = HttpTransport::with_timeout_ms(format!("http://{}", addr), 500).unwrap();
    let err = transport
        .dispatch(&CommandEnvelope::new("rfi", "create", json!({"entity_id": "E"}), actor()).to_request())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Transient(_)));
}

//! End-to-end API flows against the in-process store
//!
//! Drives the assembled router the way a client would: login, CRUD over
//! clusters and jobs, JSON Patch, invite-gated registration and the
//! namespace cascade.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use skyshift_api::{bootstrap, build_router, AppState, AuthConfig, AuthHandle};
use skyshift_store::MemoryStore;

const ADMIN_PASSWORD: &str = "swordfish";

async fn test_app() -> Router {
    let auth = AuthHandle::new(AuthConfig::new(
        b"integration-test-key".to_vec(),
        Duration::from_secs(3600),
    ));
    let state = AppState::new(Arc::new(MemoryStore::new()), auth);
    bootstrap(&state, ADMIN_PASSWORD).await.unwrap();
    build_router(state)
}

async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let request = match body {
        Some(value) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(value.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn login(app: &Router, username: &str, password: &str) -> String {
    let (status, body) = send(
        app,
        Method::POST,
        "/token",
        None,
        Some(json!({"username": username, "password": password})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "login failed: {body}");
    body["token"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_login_and_rbac_soundness() {
    let app = test_app().await;

    // Wrong password is rejected.
    let (status, _) = send(
        &app,
        Method::POST,
        "/token",
        None,
        Some(json!({"username": "admin", "password": "wrong"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // No token: every non-public endpoint denies.
    let (status, _) = send(&app, Method::GET, "/clusters", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = send(&app, Method::GET, "/default/jobs", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // The bootstrap admin can do everything.
    let token = login(&app, "admin", ADMIN_PASSWORD).await;
    let (status, body) = send(&app, Method::GET, "/clusters", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["kind"], "ClusterList");
}

#[tokio::test]
async fn test_cluster_crud_and_patch() {
    let app = test_app().await;
    let token = login(&app, "admin", ADMIN_PASSWORD).await;

    let cluster = json!({
        "kind": "Cluster",
        "metadata": {"name": "c1"},
        "spec": {"manager": "k8"},
    });
    let (status, created) =
        send(&app, Method::POST, "/clusters", Some(&token), Some(cluster.clone())).await;
    assert_eq!(status, StatusCode::OK, "create failed: {created}");
    assert!(created["metadata"]["resource_version"].as_i64().unwrap() > 0);
    assert_eq!(created["status"]["status"], "INIT");

    // Duplicate create collides.
    let (status, body) = send(&app, Method::POST, "/clusters", Some(&token), Some(cluster)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "AlreadyExists");

    // JSON Patch drives the status subresource the way the original
    // tooling did.
    let patch = json!([{"op": "replace", "path": "/status/status", "value": "READY"}]);
    let (status, patched) =
        send(&app, Method::PATCH, "/clusters/c1", Some(&token), Some(patch)).await;
    assert_eq!(status, StatusCode::OK, "patch failed: {patched}");
    assert_eq!(patched["status"]["status"], "READY");

    let (status, fetched) = send(&app, Method::GET, "/clusters/c1", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["status"]["status"], "READY");

    let (status, _) = send(&app, Method::DELETE, "/clusters/c1", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, Method::GET, "/clusters/c1", Some(&token), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_job_validation_and_listing() {
    let app = test_app().await;
    let token = login(&app, "admin", ADMIN_PASSWORD).await;

    // Unknown fields are rejected, not ignored.
    let bad = json!({
        "kind": "Job",
        "metadata": {"name": "j1"},
        "spec": {"replicas": 1, "flavor": "large"},
    });
    let (status, body) = send(&app, Method::POST, "/default/jobs", Some(&token), Some(bad)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "InvalidObject");

    let job = json!({
        "kind": "Job",
        "metadata": {"name": "j1"},
        "spec": {"replicas": 2, "image": "ubuntu:22.04", "run": "hostname"},
    });
    let (status, created) =
        send(&app, Method::POST, "/default/jobs", Some(&token), Some(job)).await;
    assert_eq!(status, StatusCode::OK, "create failed: {created}");
    // The path namespace lands on the object.
    assert_eq!(created["metadata"]["namespace"], "default");

    let (status, list) = send(&app, Method::GET, "/default/jobs", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["objects"].as_array().unwrap().len(), 1);
    // Lists carry the revision a watch can resume from.
    assert!(list["resource_version"].as_i64().unwrap() > 0);

    // All-namespace listing sees it too.
    let (status, all) = send(&app, Method::GET, "/jobs", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(all["objects"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_optimistic_concurrency_through_the_api() {
    let app = test_app().await;
    let token = login(&app, "admin", ADMIN_PASSWORD).await;

    let job = json!({
        "kind": "Job",
        "metadata": {"name": "j1"},
        "spec": {"replicas": 1},
    });
    let (_, created) = send(&app, Method::POST, "/default/jobs", Some(&token), Some(job)).await;
    let version = created["metadata"]["resource_version"].as_i64().unwrap();

    // First writer at the observed version succeeds.
    let mut update = created.clone();
    update["spec"]["replicas"] = json!(3);
    let (status, _) =
        send(&app, Method::PUT, "/default/jobs", Some(&token), Some(update)).await;
    assert_eq!(status, StatusCode::OK);

    // Second writer presenting the same stale version conflicts.
    let mut stale = created.clone();
    stale["spec"]["replicas"] = json!(5);
    stale["metadata"]["resource_version"] = json!(version);
    let (status, body) =
        send(&app, Method::PUT, "/default/jobs", Some(&token), Some(stale)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "Conflict");
}

#[tokio::test]
async fn test_invite_gated_registration() {
    let app = test_app().await;
    let admin_token = login(&app, "admin", ADMIN_PASSWORD).await;

    // Registration without an invite is refused.
    let (status, _) = send(
        &app,
        Method::POST,
        "/register_user",
        None,
        Some(json!({"username": "alice", "password": "hunter22"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Admin issues an invite; alice registers with it and can log in.
    let (status, invite) = send(
        &app,
        Method::POST,
        "/invite",
        Some(&admin_token),
        Some(json!({"roles": []})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let invite_token = invite["token"].as_str().unwrap().to_string();

    let (status, _) = send(
        &app,
        Method::POST,
        "/register_user",
        None,
        Some(json!({
            "username": "alice",
            "password": "hunter22",
            "invite": invite_token,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let alice_token = login(&app, "alice", "hunter22").await;

    // Alice has no role binding: every endpoint denies (RBAC soundness).
    let (status, _) = send(&app, Method::GET, "/clusters", Some(&alice_token), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Invites are single-use.
    let (status, _) = send(
        &app,
        Method::POST,
        "/register_user",
        None,
        Some(json!({
            "username": "bob",
            "password": "hunter23",
            "invite": invite["token"],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // A revoked invite is dead even before use.
    let (_, second) = send(
        &app,
        Method::POST,
        "/invite",
        Some(&admin_token),
        Some(json!({"roles": []})),
    )
    .await;
    let (status, _) = send(
        &app,
        Method::POST,
        "/revoke_invite",
        Some(&admin_token),
        Some(json!({"token": second["token"]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(
        &app,
        Method::POST,
        "/register_user",
        None,
        Some(json!({
            "username": "carol",
            "password": "hunter24",
            "invite": second["token"],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_namespace_cascade_through_the_api() {
    let app = test_app().await;
    let token = login(&app, "admin", ADMIN_PASSWORD).await;

    let (status, _) = send(
        &app,
        Method::POST,
        "/namespaces",
        Some(&token),
        Some(json!({"kind": "Namespace", "metadata": {"name": "team-a"}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    for (ns, name) in [("team-a", "a"), ("team-a", "b"), ("default", "keep")] {
        let job = json!({"kind": "Job", "metadata": {"name": name}, "spec": {"replicas": 1}});
        let (status, _) =
            send(&app, Method::POST, &format!("/{ns}/jobs"), Some(&token), Some(job)).await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, _) = send(&app, Method::DELETE, "/namespaces/team-a", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);

    // No orphans observable via list.
    let (_, team_a) = send(&app, Method::GET, "/team-a/jobs", Some(&token), None).await;
    assert!(team_a["objects"].as_array().unwrap().is_empty());
    let (_, all) = send(&app, Method::GET, "/jobs", Some(&token), None).await;
    assert_eq!(all["objects"].as_array().unwrap().len(), 1);
    assert_eq!(all["objects"][0]["metadata"]["name"], "keep");
}

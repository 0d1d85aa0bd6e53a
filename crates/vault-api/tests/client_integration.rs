//! Client tests against an in-process mock of the Vault HTTP API.

use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vault_api::{Client, ClientError};
use vault_core::RootToken;

const ROOT_TOKEN: &str = "root-token-for-tests";

async fn serve(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

fn mock_vault(initialized: Arc<AtomicBool>) -> Router {
    let init = {
        let initialized = Arc::clone(&initialized);
        move || {
            let initialized = Arc::clone(&initialized);
            async move { Json(json!({ "initialized": initialized.load(Ordering::SeqCst) })) }
        }
    };
    let health = move || {
        let initialized = Arc::clone(&initialized);
        async move {
            if initialized.load(Ordering::SeqCst) {
                (
                    StatusCode::OK,
                    Json(json!({
                        "initialized": true,
                        "sealed": false,
                        "standby": false,
                        "version": "1.15.0",
                        "cluster_name": "vault-cluster-test"
                    })),
                )
            } else {
                (
                    StatusCode::NOT_IMPLEMENTED,
                    Json(json!({ "initialized": false, "sealed": true, "standby": false })),
                )
            }
        }
    };
    let lookup_self = |headers: HeaderMap| async move {
        match headers.get("x-vault-token").and_then(|v| v.to_str().ok()) {
            Some(ROOT_TOKEN) => (
                StatusCode::OK,
                Json(json!({
                    "data": {
                        "id": ROOT_TOKEN,
                        "accessor": "acc-1",
                        "display_name": "root",
                        "policies": ["root"],
                        "ttl": 0
                    }
                })),
            ),
            _ => (
                StatusCode::FORBIDDEN,
                Json(json!({ "errors": ["permission denied"] })),
            ),
        }
    };
    Router::new()
        .route("/v1/sys/init", get(init))
        .route("/v1/sys/health", get(health))
        .route("/v1/auth/token/lookup-self", get(lookup_self))
}

#[tokio::test]
async fn init_status_reflects_server_state() {
    let initialized = Arc::new(AtomicBool::new(false));
    let addr = serve(mock_vault(Arc::clone(&initialized))).await;
    let client = Client::new(&format!("http://{addr}")).unwrap();

    assert!(!client.sys().init_status().await.unwrap());
    initialized.store(true, Ordering::SeqCst);
    assert!(client.sys().init_status().await.unwrap());
}

#[tokio::test]
async fn health_accepts_vault_status_codes() {
    let initialized = Arc::new(AtomicBool::new(false));
    let addr = serve(mock_vault(Arc::clone(&initialized))).await;
    let client = Client::new(&format!("http://{addr}")).unwrap();

    let health = client.sys().health().await.unwrap();
    assert!(!health.initialized);
    assert!(health.sealed);

    initialized.store(true, Ordering::SeqCst);
    let health = client.sys().health().await.unwrap();
    assert!(health.initialized);
    assert!(!health.sealed);
    assert_eq!(health.version, "1.15.0");
    assert_eq!(health.cluster_name.as_deref(), Some("vault-cluster-test"));
}

#[tokio::test]
async fn lookup_self_requires_matching_token() {
    let addr = serve(mock_vault(Arc::new(AtomicBool::new(true)))).await;
    let base = format!("http://{addr}");

    let anonymous = Client::new(&base).unwrap();
    match anonymous.auth_token().lookup_self().await {
        Err(ClientError::Api { status, errors }) => {
            assert_eq!(status, 403);
            assert_eq!(errors, vec!["permission denied".to_string()]);
        }
        other => panic!("expected 403, got {other:?}"),
    }

    let root = Client::new(&base)
        .unwrap()
        .with_token(RootToken::from_string(ROOT_TOKEN));
    let info = root.auth_token().lookup_self().await.unwrap();
    assert_eq!(info.policies, vec!["root".to_string()]);
    assert_eq!(info.display_name, "root");
}

#[tokio::test]
async fn error_without_body_uses_status_reason() {
    let router = Router::new().route(
        "/v1/sys/init",
        get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "") }),
    );
    let addr = serve(router).await;
    let client = Client::new(&format!("http://{addr}")).unwrap();

    match client.sys().init_status().await {
        Err(ClientError::Api { status, errors }) => {
            assert_eq!(status, 503);
            assert_eq!(errors, vec!["Service Unavailable".to_string()]);
        }
        other => panic!("expected API error, got {other:?}"),
    }
}

#[tokio::test]
async fn malformed_body_is_invalid_response() {
    let router = Router::new().route("/v1/sys/init", get(|| async { Json(json!({ "nope": 1 })) }));
    let addr = serve(router).await;
    let client = Client::new(&format!("http://{addr}")).unwrap();

    let err = client.sys().init_status().await.unwrap_err();
    assert!(matches!(err, ClientError::InvalidResponse(_)), "got {err:?}");
}

#[tokio::test]
async fn connection_refused_is_connection_failed() {
    // Bind then drop to get a port nothing is listening on.
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let client = Client::with_timeout(&format!("http://{addr}"), Duration::from_secs(1)).unwrap();

    let err = client.sys().init_status().await.unwrap_err();
    assert!(matches!(err, ClientError::ConnectionFailed { .. }), "got {err:?}");
}

#[tokio::test]
async fn slow_server_hits_request_timeout() {
    let router = Router::new().route(
        "/v1/sys/init",
        get(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Json::<Value>(json!({ "initialized": true }))
        }),
    );
    let addr = serve(router).await;
    let client =
        Client::with_timeout(&format!("http://{addr}"), Duration::from_millis(100)).unwrap();

    let err = client.sys().init_status().await.unwrap_err();
    assert!(matches!(err, ClientError::Http(_)), "got {err:?}");
}

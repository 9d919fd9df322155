// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP surface tests against the full router.

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::TestContext;
use futures::{SinkExt, StreamExt};
use http_body_util::BodyExt;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tower::ServiceExt;
use trybox::router;
use trybox::runtime::{AddressFamily, InstanceAddress};

const CLIENT_IP: &str = "192.0.2.50";

/// One GET request against a fresh router instance.
async fn get(ctx: &TestContext, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = router(ctx.app_state())
        .oneshot(
            Request::builder()
                .uri(uri)
                .header("x-forwarded-for", CLIENT_IP)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec())
}

async fn get_json(ctx: &TestContext, uri: &str) -> (StatusCode, Value) {
    let (status, body) = get(ctx, uri).await;
    let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn status_reports_capacity_and_client() {
    let ctx = TestContext::new().await;
    let (status, body) = get_json(&ctx, "/1.0").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["client_address"], CLIENT_IP);
    assert_eq!(body["client_protocol"], "IPv4");
    assert_eq!(body["server_status"], 0);
    assert_eq!(body["containers_count"], 0);
    assert_eq!(body["containers_max"], 4);
    assert_eq!(body["containers_next"], 0);
    assert_eq!(body["feedback"], true);
}

#[tokio::test]
async fn status_reports_maintenance() {
    let ctx = TestContext::with_config(
        r#"
image: ubuntu/22.04
server_maintenance: true
server_terms: Be nice.
"#,
    )
    .await;

    let (status, body) = get_json(&ctx, "/1.0").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["server_status"], 1);
}

#[tokio::test]
async fn status_reports_next_expiry_when_full() {
    let ctx = TestContext::new().await;
    let now = chrono::Utc::now().timestamp();

    // Capacity is 4 in the default test config.
    for i in 0..4 {
        ctx.insert_session(&format!("tok-{i}"), &format!("trybox-{i}"), now + 100 + i)
            .await;
    }

    let (_, body) = get_json(&ctx, "/1.0").await;
    assert_eq!(body["containers_count"], 4);
    assert_eq!(body["containers_next"], now + 100);
}

#[tokio::test]
async fn terms_exposes_text_and_hash() {
    let ctx = TestContext::new().await;
    let (status, body) = get_json(&ctx, "/1.0/terms").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["hash"], ctx.terms_hash());
    assert_eq!(body["terms"], "Be nice to the demo server.");
}

#[tokio::test]
async fn start_requires_terms_parameter() {
    let ctx = TestContext::new().await;
    let (status, _) = get(&ctx, "/1.0/start").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn start_denial_is_http_ok_with_status_code() {
    let ctx = TestContext::new().await;
    let (status, body) = get_json(&ctx, "/1.0/start?terms=wrong-hash").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], 1);

    // The runtime was never touched.
    assert!(ctx.runtime.calls().is_empty());
}

#[tokio::test]
async fn start_provisions_session() {
    let ctx = TestContext::new().await;
    ctx.runtime.set_default_addresses(vec![InstanceAddress {
        interface: "eth0".to_string(),
        family: AddressFamily::Inet,
        scope: "global".to_string(),
        address: "10.0.3.88".to_string(),
    }]);

    let uri = format!("/1.0/start?terms={}", ctx.terms_hash());
    let (status, body) = get_json(&ctx, &uri).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], 0);
    assert_eq!(body["ip"], "10.0.3.88");
    assert!(body["id"].as_str().is_some());
    assert!(body["expiry"].as_i64().unwrap() > chrono::Utc::now().timestamp());
    let fqdn = body["fqdn"].as_str().unwrap();
    assert!(fqdn.starts_with("trybox-") && fqdn.ends_with(".lxd"));

    let token = body["id"].as_str().unwrap();
    assert!(ctx.db.get_by_token(token, true).await.unwrap().is_some());
}

#[tokio::test]
async fn start_failure_maps_to_unknown_error_status() {
    let ctx = TestContext::new().await;
    ctx.runtime.fail_create(true);

    let uri = format!("/1.0/start?terms={}", ctx.terms_hash());
    let (status, body) = get_json(&ctx, &uri).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], 5);
    assert_eq!(ctx.db.count_active().await.unwrap(), 0);
}

#[tokio::test]
async fn info_returns_active_session_details() {
    let ctx = TestContext::new().await;
    let expiry = chrono::Utc::now().timestamp() + 3600;
    let id = ctx.insert_session("tok-info", "trybox-info", expiry).await;

    let (status, body) = get_json(&ctx, "/1.0/info?id=tok-info").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], "tok-info");
    assert_eq!(body["ip"], "10.0.3.7");
    assert_eq!(body["username"], "testuser");
    assert_eq!(body["fqdn"], "trybox-info.lxd");
    assert_eq!(body["expiry"], expiry);

    // Expired sessions are not served.
    ctx.db.expire(id).await.unwrap();
    let (status, _) = get(&ctx, "/1.0/info?id=tok-info").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn info_requires_known_session() {
    let ctx = TestContext::new().await;

    let (status, _) = get(&ctx, "/1.0/info").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = get(&ctx, "/1.0/info?id=nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn feedback_roundtrip_within_window() {
    let ctx = TestContext::new().await;
    let expiry = chrono::Utc::now().timestamp() + 3600;
    ctx.insert_session("tok-fb", "trybox-fb", expiry).await;

    let response = router(ctx.app_state())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/1.0/feedback?id=tok-fb")
                .header("content-type", "application/json")
                .body(Body::from(
                    r#"{"rating": 5, "email": "a@example.com", "email_use": 1, "message": "great"}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let (status, body) = get_json(&ctx, "/1.0/feedback?id=tok-fb").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["rating"], 5);
    assert_eq!(body["feedback"], "great");
}

#[tokio::test]
async fn feedback_rejected_after_grace_window() {
    let ctx = TestContext::new().await;
    // feedback_timeout defaults to 5 minutes; this session expired an hour ago.
    let expiry = chrono::Utc::now().timestamp() - 3600;
    ctx.insert_session("tok-old", "trybox-old", expiry).await;

    let response = router(ctx.app_state())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/1.0/feedback?id=tok-old")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"rating": 1}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn feedback_disabled_by_configuration() {
    let ctx = TestContext::with_config(
        r#"
image: ubuntu/22.04
feedback: false
server_terms: Be nice.
"#,
    )
    .await;

    let (status, _) = get(&ctx, "/1.0/feedback?id=whatever").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn statistics_requires_key_and_valid_filters() {
    let ctx = TestContext::new().await;

    let (status, _) = get(&ctx, "/1.0/statistics").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = get(&ctx, "/1.0/statistics?key=wrong").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = get(&ctx, "/1.0/statistics?key=statskey&period=yesterday").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = get(&ctx, "/1.0/statistics?key=statskey&network=not-a-cidr").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn statistics_counts_sessions() {
    let ctx = TestContext::new().await;
    let expiry = chrono::Utc::now().timestamp() + 3600;
    ctx.insert_session("s1", "trybox-s1", expiry).await;
    ctx.insert_session("s2", "trybox-s2", expiry).await;

    let (status, body) = get(&ctx, "/1.0/statistics?key=statskey").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(String::from_utf8(body).unwrap(), "2\n");

    // insert_session always uses the same requester address.
    let (_, body) = get(&ctx, "/1.0/statistics?key=statskey&unique=1").await;
    assert_eq!(String::from_utf8(body).unwrap(), "1\n");

    let (_, body) = get(&ctx, "/1.0/statistics?key=statskey&period=current").await;
    assert_eq!(String::from_utf8(body).unwrap(), "2\n");
}

#[tokio::test]
async fn console_bridges_websocket_to_exec() {
    let ctx = TestContext::new().await;
    let expiry = chrono::Utc::now().timestamp() + 3600;
    ctx.insert_session("tok-con", "trybox-con", expiry).await;
    ctx.runtime.seed_instance("trybox-con");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(ctx.app_state());
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    let (mut ws, _) = tokio_tungstenite::connect_async(format!(
        "ws://{addr}/1.0/console?id=tok-con&width=100&height=30"
    ))
    .await
    .unwrap();

    // The exec starts during the upgrade; grab its far end.
    let mut handle = loop {
        if let Some(handle) = ctx.runtime.take_exec_handle("trybox-con") {
            break handle;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    // Requested geometry arrives over the control channel.
    loop {
        if handle.resizes().first() == Some(&(100, 30)) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Process output reaches the client as a text frame.
    handle.output.write_all(b"demo login: ").await.unwrap();
    let message = ws.next().await.unwrap().unwrap();
    assert_eq!(message.into_text().unwrap().as_str(), "demo login: ");

    // Client keystrokes reach the process.
    ws.send(tokio_tungstenite::tungstenite::Message::text("ls\n"))
        .await
        .unwrap();
    let mut buf = [0u8; 16];
    let n = handle.input.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"ls\n");

    // Process exit tears the bridge down.
    handle.done.send(()).unwrap();
    loop {
        match ws.next().await {
            None => break,
            Some(Err(_)) => break,
            Some(Ok(message)) if message.is_close() => break,
            Some(Ok(_)) => continue,
        }
    }
}

#[tokio::test]
async fn console_rejects_unknown_or_expired_sessions() {
    let ctx = TestContext::new().await;
    let expiry = chrono::Utc::now().timestamp() + 3600;
    ctx.insert_session("tok-bad", "trybox-bad", expiry).await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(ctx.app_state());
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    // The handshake fails with the handler's HTTP error.
    let handshake_status = |uri: String| async move {
        match tokio_tungstenite::connect_async(uri).await {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => response.status(),
            other => panic!("expected handshake rejection, got {other:?}"),
        }
    };

    let status = handshake_status(format!("ws://{addr}/1.0/console")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let status = handshake_status(format!("ws://{addr}/1.0/console?id=nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let status =
        handshake_status(format!("ws://{addr}/1.0/console?id=tok-bad&width=banana")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

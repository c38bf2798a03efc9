mod common;

use axum::http::{Method, StatusCode};
use chrono::{Duration, Utc};
use common::{comment, find_uri, TestApp, SITE, URL};
use domains::ErrorCode;
use serde_json::json;

#[tokio::test]
async fn delete_invalidates_cached_find() {
    let app = TestApp::new();
    let now = Utc::now();
    app.seed(comment("1", "alice", now - Duration::minutes(3))).await;
    app.seed(comment("2", "bob", now - Duration::minutes(2))).await;
    app.seed(comment("3", "alice", now - Duration::minutes(1))).await;

    let (status, before) = app.send(Method::GET, &find_uri(), None, false).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(before["info"]["count"], 3);
    let misses = app.cache.stats().misses;

    // served from the cache
    let (_, again) = app.send(Method::GET, &find_uri(), None, false).await;
    assert_eq!(again, before);
    assert_eq!(app.cache.stats().misses, misses);

    let (status, body) = app.send(Method::DELETE, &format!("/api/v1/admin/comment/2?site={SITE}&url={URL}"), None, true).await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let (_, after) = app.send(Method::GET, &find_uri(), None, false).await;
    assert_eq!(after["info"]["count"], 2);
}

#[tokio::test]
async fn admin_routes_need_an_admin() {
    let app = TestApp::new();
    let uri = format!("/api/v1/admin/blocked?site={SITE}");

    let (status, _) = app.send(Method::GET, &uri, None, false).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = app.send_as("alice", Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], ErrorCode::NoAccess.as_i32());

    let (status, body) = app.send(Method::GET, &uri, None, true).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn blocked_users_can_not_comment() {
    let app = TestApp::new();
    let (status, _) = app.send(Method::PUT, &format!("/api/v1/admin/user/bob?site={SITE}&block=1&ttl=1h"), None, true).await;
    assert_eq!(status, StatusCode::OK);

    let (_, blocked) = app.send(Method::GET, &format!("/api/v1/admin/blocked?site={SITE}"), None, true).await;
    assert_eq!(blocked.as_array().map(Vec::len), Some(1));
    assert_eq!(blocked[0]["id"], "bob");

    let body = json!({"text": "let me in", "locator": {"site": SITE, "url": URL}});
    let (status, body) = app.send_as("bob", Method::POST, "/api/v1/comment", Some(body)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], ErrorCode::UserBlocked.as_i32());

    let (status, _) = app.send(Method::PUT, &format!("/api/v1/admin/user/bob?site={SITE}&block=0"), None, true).await;
    assert_eq!(status, StatusCode::OK);
    let body = json!({"text": "thanks", "locator": {"site": SITE, "url": URL}});
    let (status, _) = app.send_as("bob", Method::POST, "/api/v1/comment", Some(body)).await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn pin_and_read_only() {
    let app = TestApp::new();
    app.seed(comment("c1", "alice", Utc::now())).await;

    let (status, _) = app.send(Method::PUT, &format!("/api/v1/admin/pin/c1?site={SITE}&url={URL}&pin=1"), None, true).await;
    assert_eq!(status, StatusCode::OK);
    let (_, got) = app.send(Method::GET, &format!("/api/v1/id/c1?site={SITE}&url={URL}"), None, false).await;
    assert_eq!(got["pin"], true);

    let (status, _) = app.send(Method::PUT, &format!("/api/v1/admin/readonly?site={SITE}&url={URL}&ro=1"), None, true).await;
    assert_eq!(status, StatusCode::OK);
    let body = json!({"text": "late", "locator": {"site": SITE, "url": URL}});
    let (status, body) = app.send_as("bob", Method::POST, "/api/v1/comment", Some(body)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], ErrorCode::ReadOnly.as_i32());
}

#[tokio::test]
async fn delete_me_flow() {
    let app = TestApp::new();
    let now = Utc::now();
    app.seed(comment("a1", "alice", now - Duration::minutes(2))).await;
    app.seed(comment("b1", "bob", now - Duration::minutes(1))).await;

    let (status, link) = app.send_as("alice", Method::POST, &format!("/api/v1/deleteme?site={SITE}"), None).await;
    assert_eq!(status, StatusCode::OK, "{link}");
    let token = link["token"].as_str().unwrap().to_string();
    assert!(link["link"].as_str().unwrap().ends_with(&token));

    // the link token is not a session
    let (status, _) = app
        .request_with_jwt(&token, Method::GET, &format!("/api/v1/user?site={SITE}"))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = app.send(Method::GET, &format!("/api/v1/admin/deleteme?token={token}"), None, true).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["user_id"], "alice");

    let (_, found) = app.send(Method::GET, &find_uri(), None, false).await;
    assert_eq!(found["info"]["count"], 1);
    assert_eq!(found["comments"][0]["comment"]["id"], "b1");
}

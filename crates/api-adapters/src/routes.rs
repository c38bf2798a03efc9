//! Assembly of the HTTP surface.
//!
//! ```text
//! /ping, /metrics             plain
//! /auth/...                   login flows of the auth service
//! /api/v1/...                 reads, `trace` resolves an optional user
//! /api/v1/...                 writes, `auth` requires a user
//! /api/v1/admin/...           moderation, `auth` then `admin_only`
//! ```

use auth_adapters::{admin_only, auth, trace};
use axum::extract::DefaultBodyLimit;
use axum::http::HeaderName;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{delete, get, post, put};
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::handlers::{admin, client_ip, feeds, media, private, public};
use crate::state::AppState;
use crate::{metrics, proxy};

/// Largest accepted request body.
pub const MAX_BODY: usize = 1024 * 1024;

const REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

fn public_routes(state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/find", get(public::find))
        .route("/id/{id}", get(public::comment_by_id))
        .route("/last/{limit}", get(public::last))
        .route("/comments", get(public::user_comments))
        .route("/info", get(public::info))
        .route("/count", get(public::count))
        .route("/counts", post(public::counts))
        .route("/list", get(public::list))
        .route("/config", get(public::config))
        .route("/preview", post(public::preview))
        .route("/search", get(public::search))
        .route("/feed/post", get(feeds::post))
        .route("/feed/site", get(feeds::site))
        .route("/feed/reply", get(feeds::reply))
        .route("/avatar/{name}", get(media::avatar))
        .route("/stream/info", get(media::stream_info))
        .route("/img", get(proxy::serve))
        .route_layer(from_fn_with_state(state.auth.clone(), trace))
}

fn private_routes(state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/comment", post(private::create_comment))
        .route("/comment/{id}", put(private::edit_comment))
        .route("/vote/{id}", put(private::vote))
        .route("/user", get(private::whoami))
        .route("/userdata", get(private::user_data))
        .route("/deleteme", post(private::delete_me))
        .route("/email/subscribe", post(private::email_subscribe))
        .route("/email/confirm", post(private::email_confirm))
        .route("/email", delete(private::email_unsubscribe))
        .route("/telegram/subscribe", get(private::telegram_subscribe))
        .route("/telegram", delete(private::telegram_unsubscribe))
        .route_layer(from_fn_with_state(state.auth.clone(), auth))
}

fn admin_routes(state: &AppState) -> Router<AppState> {
    // the last route_layer runs first
    Router::new()
        .route("/comment/{id}", delete(admin::delete_comment))
        .route("/user/{id}", delete(admin::delete_user).put(admin::block_user))
        .route("/blocked", get(admin::blocked))
        .route("/verify/{id}", put(admin::verify_user))
        .route("/pin/{id}", put(admin::pin))
        .route("/readonly", put(admin::read_only))
        .route("/title/{id}", put(admin::title))
        .route("/deleteme", get(admin::delete_me))
        .route("/reindex", post(admin::reindex))
        .route_layer(from_fn(admin_only))
        .route_layer(from_fn_with_state(state.auth.clone(), auth))
}

/// The complete application router, ready for `axum::serve`.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .merge(public_routes(&state))
        .merge(private_routes(&state))
        .nest("/admin", admin_routes(&state));

    Router::new()
        .route("/ping", get(public::ping))
        .route("/metrics", get(metrics::serve))
        .nest("/api/v1", api)
        .layer(from_fn_with_state(state.clone(), metrics::track))
        .with_state(state.clone())
        .merge(state.auth_service.clone().router())
        .layer(DefaultBodyLimit::max(MAX_BODY))
        .layer(from_fn(client_ip))
        .layer(CompressionLayer::new())
        .layer(CorsLayer::very_permissive().expose_headers([REQUEST_ID]))
        .layer(CatchPanicLayer::new())
        .layer(PropagateRequestIdLayer::new(REQUEST_ID))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(SetRequestIdLayer::new(REQUEST_ID, MakeRequestUuid))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use auth_adapters::{AuthContext, AuthService, SiteKeys, TokenParams, TokenService};
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use base64::Engine as _;
    use serde_json::{json, Value};
    use services::{DataService, DataServiceConfig};
    use storage_adapters::{CacheLimits, LoadingCache, MemoryEngine, StaticAdminStore};
    use tower::ServiceExt;

    use super::*;

    const DEV: &str = "dev-secret";

    fn app() -> Router {
        let engine = Arc::new(MemoryEngine::new(["site"]));
        let admins = Arc::new(StaticAdminStore::new(HashMap::new(), vec![], "admin@example.com"));
        let data = Arc::new(DataService::new(engine, admins, DataServiceConfig::default()));
        let keys = Arc::new(SiteKeys::new("secret", vec!["site".to_string()]));
        let tokens = Arc::new(TokenService::new(keys, TokenParams::default()));
        let auth_service = Arc::new(AuthService::new(AuthContext::new(tokens, data.clone(), "http://localhost:8080")));
        let cache = Arc::new(LoadingCache::new(CacheLimits::default()));
        router(AppState::new(data, cache, auth_service).with_dev_passwd(DEV))
    }

    fn dev_auth() -> String {
        format!("Basic {}", base64::engine::general_purpose::STANDARD.encode(format!("dev:{DEV}")))
    }

    async fn call(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    fn post_comment(text: &str) -> Request<Body> {
        let body = json!({"text": text, "locator": {"site": "site", "url": "https://blog.example/p1"}});
        Request::post("/api/v1/comment")
            .header(header::AUTHORIZATION, dev_auth())
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-real-ip", "203.0.113.9")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn ping_and_request_id() {
        let resp = app().oneshot(Request::get("/ping").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn writes_need_a_user() {
        let app = app();
        let req = Request::post("/api/v1/comment").body(Body::from("{}")).unwrap();
        let (status, _) = call(&app, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, created) = call(&app, post_comment("hello **world**")).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["text"], "<p>hello <strong>world</strong></p>\n");
        assert_eq!(created["user"]["id"], "dev");

        let req = Request::get("/api/v1/find?site=site&url=https://blog.example/p1&format=plain").body(Body::empty()).unwrap();
        let (status, found) = call(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(found["comments"].as_array().map(Vec::len), Some(1));
        assert_eq!(found["info"]["count"], 1);
    }

    #[tokio::test]
    async fn admin_routes_reject_anonymous_and_accept_dev() {
        let app = app();
        let req = Request::put("/api/v1/admin/readonly?site=site&url=https://blog.example/p1&ro=1").body(Body::empty()).unwrap();
        let (status, _) = call(&app, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        call(&app, post_comment("first")).await;
        let req = Request::put("/api/v1/admin/readonly?site=site&url=https://blog.example/p1&ro=1")
            .header(header::AUTHORIZATION, dev_auth())
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["read_only"], true);

        let (status, body) = call(&app, post_comment("second")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn missing_params_are_bad_requests() {
        let (status, _) = call(&app(), Request::get("/api/v1/find?site=site").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn metrics_count_matched_routes() {
        let app = app();
        call(&app, Request::get("/api/v1/info?site=site&url=x").body(Body::empty()).unwrap()).await;
        let resp = app.clone().oneshot(Request::get("/metrics").body(Body::empty()).unwrap()).await.unwrap();
        let text = String::from_utf8(to_bytes(resp.into_body(), usize::MAX).await.unwrap().to_vec()).unwrap();
        assert!(text.contains(r#"path="/api/v1/info""#), "{text}");
    }
}

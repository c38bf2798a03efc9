//! HTTP surface of the providers: `/auth/list`, `/auth/logout` and
//! `/auth/{provider}/{login,callback,logout}`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tracing::{debug, warn};

use crate::error::AuthError;
use crate::providers::{AuthContext, LoginRequest, Provider};

pub struct AuthService {
    ctx: AuthContext,
    providers: Vec<Arc<dyn Provider>>,
}

impl AuthService {
    pub fn new(ctx: AuthContext) -> Self {
        Self { ctx, providers: Vec::new() }
    }

    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn context(&self) -> &AuthContext {
        &self.ctx
    }

    /// Names of the configured providers, in registration order.
    pub fn providers(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    fn provider(&self, name: &str) -> Result<&Arc<dyn Provider>, AuthError> {
        self.providers
            .iter()
            .find(|p| p.name() == name)
            .ok_or_else(|| AuthError::UnknownProvider(name.to_string()))
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/auth/list", get(list))
            .route("/auth/logout", get(logout))
            .route("/auth/{provider}/login", get(login))
            .route("/auth/{provider}/callback", get(callback).post(callback))
            .route("/auth/{provider}/logout", get(provider_logout))
            .with_state(self)
    }
}

async fn list(State(svc): State<Arc<AuthService>>) -> Json<Vec<String>> {
    Json(svc.providers())
}

async fn logout(State(svc): State<Arc<AuthService>>) -> Response {
    svc.ctx.logout()
}

async fn provider_logout(State(svc): State<Arc<AuthService>>, Path(provider): Path<String>) -> Result<Response, AuthError> {
    svc.provider(&provider)?;
    Ok(svc.ctx.logout())
}

async fn login(
    State(svc): State<Arc<AuthService>>,
    Path(provider): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, AuthError> {
    let p = svc.provider(&provider)?;
    p.login(&svc.ctx, LoginRequest { params, headers }).await
}

/// Form-posted fields (Apple's `response_mode=form_post`) are merged over the query.
async fn callback(
    State(svc): State<Arc<AuthService>>,
    Path(provider): Path<String>,
    Query(mut params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let p = match svc.provider(&provider) {
        Ok(p) => p,
        Err(e) => return e.into_response(),
    };
    let is_form = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/x-www-form-urlencoded"));
    if is_form {
        params.extend(url::form_urlencoded::parse(&body).map(|(k, v)| (k.into_owned(), v.into_owned())));
    }

    match p.callback(&svc.ctx, LoginRequest { params, headers }).await {
        Ok(resp) => resp,
        Err(e) => {
            match &e {
                AuthError::Http(_) | AuthError::Internal(_) => warn!(provider, "login failed, {e}"),
                _ => debug!(provider, "login rejected, {e}"),
            }
            let mut resp = e.into_response();
            svc.ctx.tokens.reset(resp.headers_mut());
            resp
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::testutil::context;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::header::SET_COOKIE;
    use axum::http::{Request, StatusCode};
    use domains::User;
    use tower::ServiceExt;

    /// Logs in whoever the `name` field names.
    struct Echo;

    #[async_trait]
    impl Provider for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn login(&self, ctx: &AuthContext, req: LoginRequest) -> Result<Response, AuthError> {
            let handshake = ctx.handshake(&req)?;
            ctx.redirect_with_handshake("https://idp.example.com/", handshake)
        }

        async fn callback(&self, ctx: &AuthContext, req: LoginRequest) -> Result<Response, AuthError> {
            let handshake = ctx.read_handshake(&req)?;
            let name = req.require("name")?;
            ctx.finish_login(User { id: format!("echo_{name}"), name: name.into(), ..Default::default() }, &handshake, "echo")
                .await
        }
    }

    fn router() -> Router {
        Arc::new(AuthService::new(context("https://c.example.com")).with_provider(Arc::new(Echo))).router()
    }

    fn cookies(resp: &Response) -> Vec<String> {
        resp.headers().get_all(SET_COOKIE).iter().map(|v| v.to_str().unwrap().to_string()).collect()
    }

    #[tokio::test]
    async fn lists_providers_and_rejects_unknown() {
        let resp = router().oneshot(Request::get("/auth/list").body(Body::empty()).unwrap()).await.unwrap();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], br#"["echo"]"#);

        let resp = router().oneshot(Request::get("/auth/nope/login?site=site").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn form_post_callback() {
        let login = router()
            .oneshot(Request::get("/auth/echo/login?site=site&session=1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(login.status(), StatusCode::FOUND);
        let jar: Vec<String> = cookies(&login).iter().map(|c| c.split(';').next().unwrap().to_string()).collect();

        let req = Request::post("/auth/echo/callback")
            .header("cookie", jar.join("; "))
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from("name=ann"))
            .unwrap();
        let resp = router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let set = cookies(&resp);
        assert!(set[0].starts_with("JWT=") && !set[0].contains("Max-Age"));
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let user: User = serde_json::from_slice(&body).unwrap();
        assert_eq!(user.id, "echo_ann");
    }

    #[tokio::test]
    async fn failed_callback_and_logout_reset_cookies() {
        let resp = router().oneshot(Request::get("/auth/echo/callback?name=x").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(cookies(&resp).iter().all(|c| c.contains("Max-Age=0")));

        for uri in ["/auth/logout", "/auth/echo/logout"] {
            let resp = router().oneshot(Request::get(uri).body(Body::empty()).unwrap()).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(cookies(&resp).len(), 2);
        }
    }
}

//! Authorization-code OAuth2 with the provider specifics (endpoints, scopes, user mapping)
//! kept in [`OAuth2Params`].

use std::time::Duration;

use async_trait::async_trait;
use axum::response::Response;
use domains::User;
use serde::Deserialize;
use serde_json::Value;
use services::utils::provider_user_id;
use tracing::debug;
use url::Url;

use super::{random_id, AuthContext, LoginRequest, Provider};
use crate::error::AuthError;

/// Maps the provider's user-info JSON to a user with the raw provider id in `id`.
pub type MapUser = fn(&Value) -> User;

#[derive(Clone)]
pub struct OAuth2Params {
    pub name: String,
    pub client_id: String,
    pub client_secret: String,
    pub auth_url: String,
    pub token_url: String,
    pub info_url: String,
    pub scopes: Vec<String>,
    pub map_user: MapUser,
}

pub struct OAuth2Provider {
    params: OAuth2Params,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

fn str_field(v: &Value, name: &str) -> String {
    match v.get(name) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

impl OAuth2Provider {
    pub fn new(params: OAuth2Params, timeout: Duration) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { params, http })
    }

    fn auth_code_url(&self, redirect_uri: &str, state: &str) -> Result<String, AuthError> {
        let mut url = Url::parse(&self.params.auth_url).map_err(|e| AuthError::Internal(e.into()))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.params.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("scope", &self.params.scopes.join(" "))
            .append_pair("state", state);
        Ok(url.into())
    }

    async fn exchange(&self, code: &str, redirect_uri: &str) -> Result<String, AuthError> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", self.params.client_id.as_str()),
            ("client_secret", self.params.client_secret.as_str()),
        ];
        let token: TokenResponse = self
            .http
            .post(&self.params.token_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(token.access_token)
    }

    async fn user_info(&self, access_token: &str) -> Result<User, AuthError> {
        let info: Value = self
            .http
            .get(&self.params.info_url)
            .bearer_auth(access_token)
            .header(reqwest::header::USER_AGENT, "rusty-comments")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let mut user = (self.params.map_user)(&info);
        if user.id.is_empty() {
            return Err(AuthError::Handshake(format!("{} returned no user id", self.params.name)));
        }
        user.id = provider_user_id(&self.params.name, &user.id);
        Ok(user)
    }
}

#[async_trait]
impl Provider for OAuth2Provider {
    fn name(&self) -> &str {
        &self.params.name
    }

    async fn login(&self, ctx: &AuthContext, req: LoginRequest) -> Result<Response, AuthError> {
        let mut handshake = ctx.handshake(&req)?;
        handshake.state = random_id();
        let location = self.auth_code_url(&ctx.callback_url(&self.params.name), &handshake.state)?;
        ctx.redirect_with_handshake(&location, handshake)
    }

    async fn callback(&self, ctx: &AuthContext, req: LoginRequest) -> Result<Response, AuthError> {
        let handshake = ctx.read_handshake(&req)?;
        if req.param("state") != Some(handshake.state.as_str()) || handshake.state.is_empty() {
            return Err(AuthError::Handshake("state mismatch".into()));
        }
        let code = req.require("code")?;
        let access_token = self.exchange(code, &ctx.callback_url(&self.params.name)).await?;
        let user = self.user_info(&access_token).await?;
        debug!(provider = %self.params.name, user = %user.id, "oauth2 user resolved");
        ctx.finish_login(user, &handshake, &self.params.name).await
    }
}

fn github_user(v: &Value) -> User {
    let login = str_field(v, "login");
    let name = str_field(v, "name");
    User {
        id: str_field(v, "id"),
        name: if name.is_empty() { login } else { name },
        picture: str_field(v, "avatar_url"),
        ..Default::default()
    }
}

fn google_user(v: &Value) -> User {
    User { id: str_field(v, "sub"), name: str_field(v, "name"), picture: str_field(v, "picture"), ..Default::default() }
}

fn facebook_user(v: &Value) -> User {
    let picture = v.pointer("/picture/data/url").and_then(Value::as_str).unwrap_or_default().to_string();
    User { id: str_field(v, "id"), name: str_field(v, "name"), picture, ..Default::default() }
}

fn yandex_user(v: &Value) -> User {
    let mut name = str_field(v, "display_name");
    if name.is_empty() {
        name = str_field(v, "real_name");
    }
    let avatar = str_field(v, "default_avatar_id");
    let picture = if avatar.is_empty() || v.get("is_avatar_empty").and_then(Value::as_bool) == Some(true) {
        String::new()
    } else {
        format!("https://avatars.yandex.net/get-yapic/{avatar}/islands-200")
    };
    User { id: str_field(v, "id"), name, picture, ..Default::default() }
}

fn microsoft_user(v: &Value) -> User {
    User { id: str_field(v, "id"), name: str_field(v, "displayName"), ..Default::default() }
}

fn discord_user(v: &Value) -> User {
    let id = str_field(v, "id");
    let avatar = str_field(v, "avatar");
    let picture =
        if avatar.is_empty() { String::new() } else { format!("https://cdn.discordapp.com/avatars/{id}/{avatar}.png") };
    let mut name = str_field(v, "global_name");
    if name.is_empty() {
        name = str_field(v, "username");
    }
    User { id, name, picture, ..Default::default() }
}

/// Endpoints and user mapping of the built-in providers.
pub fn builtin(name: &str, client_id: &str, client_secret: &str) -> Option<OAuth2Params> {
    let (auth_url, token_url, info_url, scopes, map_user): (&str, &str, &str, &[&str], MapUser) = match name {
        "github" => (
            "https://github.com/login/oauth/authorize",
            "https://github.com/login/oauth/access_token",
            "https://api.github.com/user",
            &[],
            github_user,
        ),
        "google" => (
            "https://accounts.google.com/o/oauth2/auth",
            "https://oauth2.googleapis.com/token",
            "https://www.googleapis.com/oauth2/v3/userinfo",
            &["https://www.googleapis.com/auth/userinfo.profile"],
            google_user,
        ),
        "facebook" => (
            "https://www.facebook.com/v19.0/dialog/oauth",
            "https://graph.facebook.com/v19.0/oauth/access_token",
            "https://graph.facebook.com/me?fields=id,name,picture",
            &["public_profile"],
            facebook_user,
        ),
        "yandex" => (
            "https://oauth.yandex.com/authorize",
            "https://oauth.yandex.com/token",
            "https://login.yandex.ru/info?format=json",
            &[],
            yandex_user,
        ),
        "microsoft" => (
            "https://login.microsoftonline.com/common/oauth2/v2.0/authorize",
            "https://login.microsoftonline.com/common/oauth2/v2.0/token",
            "https://graph.microsoft.com/v1.0/me",
            &["User.Read"],
            microsoft_user,
        ),
        "discord" => (
            "https://discord.com/oauth2/authorize",
            "https://discord.com/api/oauth2/token",
            "https://discord.com/api/users/@me",
            &["identify"],
            discord_user,
        ),
        _ => return None,
    };
    Some(OAuth2Params {
        name: name.to_string(),
        client_id: client_id.to_string(),
        client_secret: client_secret.to_string(),
        auth_url: auth_url.to_string(),
        token_url: token_url.to_string(),
        info_url: info_url.to_string(),
        scopes: scopes.iter().map(|s| s.to_string()).collect(),
        map_user,
    })
}

//! Sign in with Apple. The client secret is an ES256 token signed with the developer key
//! and the returned id token is checked against Apple's published key set.

use std::time::Duration;

use async_trait::async_trait;
use axum::response::Response;
use chrono::Utc;
use domains::User;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use services::utils::provider_user_id;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use url::Url;

use super::{random_id, AuthContext, LoginRequest, Provider};
use crate::error::AuthError;

pub const APPLE_ISSUER: &str = "https://appleid.apple.com";
const SECRET_TTL_SECS: i64 = 24 * 3600;
const PROVIDER: &str = "apple";

#[derive(Clone)]
pub struct AppleParams {
    /// Services id, the audience of returned id tokens.
    pub client_id: String,
    pub team_id: String,
    pub key_id: String,
    /// PKCS8 PEM of the developer key.
    pub private_key: String,
    pub auth_url: String,
    pub token_url: String,
    pub keys_url: String,
}

impl AppleParams {
    pub fn new(client_id: &str, team_id: &str, key_id: &str, private_key: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            team_id: team_id.to_string(),
            key_id: key_id.to_string(),
            private_key: private_key.to_string(),
            auth_url: format!("{APPLE_ISSUER}/auth/authorize"),
            token_url: format!("{APPLE_ISSUER}/auth/token"),
            keys_url: format!("{APPLE_ISSUER}/auth/keys"),
        }
    }
}

#[derive(Debug, Serialize)]
struct SecretClaims<'a> {
    iss: &'a str,
    iat: i64,
    exp: i64,
    aud: &'a str,
    sub: &'a str,
}

#[derive(Debug, Deserialize)]
struct IdClaims {
    sub: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    id_token: String,
}

pub struct AppleProvider {
    params: AppleParams,
    key: EncodingKey,
    http: reqwest::Client,
    /// Client secret and its expiry.
    secret: Mutex<Option<(String, i64)>>,
    keys: RwLock<Option<JwkSet>>,
}

impl AppleProvider {
    pub fn new(params: AppleParams, timeout: Duration) -> Result<Self, AuthError> {
        let key = EncodingKey::from_ec_pem(params.private_key.as_bytes())?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { params, key, http, secret: Mutex::new(None), keys: RwLock::new(None) })
    }

    /// The cached client secret, re-signed a minute before it expires.
    async fn client_secret(&self) -> Result<String, AuthError> {
        let mut cached = self.secret.lock().await;
        let now = Utc::now().timestamp();
        if let Some((secret, exp)) = cached.as_ref() {
            if *exp - 60 > now {
                return Ok(secret.clone());
            }
        }
        let claims = SecretClaims {
            iss: &self.params.team_id,
            iat: now,
            exp: now + SECRET_TTL_SECS,
            aud: APPLE_ISSUER,
            sub: &self.params.client_id,
        };
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.params.key_id.clone());
        let secret = encode(&header, &claims, &self.key)?;
        *cached = Some((secret.clone(), claims.exp));
        Ok(secret)
    }

    async fn fetch_keys(&self) -> Result<JwkSet, AuthError> {
        let keys: JwkSet = self.http.get(&self.params.keys_url).send().await?.error_for_status()?.json().await?;
        *self.keys.write().await = Some(keys.clone());
        Ok(keys)
    }

    async fn decoding_key(&self, kid: &str) -> Result<DecodingKey, AuthError> {
        if let Some(jwk) = self.keys.read().await.as_ref().and_then(|keys| keys.find(kid)) {
            return Ok(DecodingKey::from_jwk(jwk)?);
        }
        // unknown kid, Apple may have rotated its keys
        let keys = self.fetch_keys().await?;
        let jwk = keys.find(kid).ok_or_else(|| AuthError::Malformed(format!("unknown apple key {kid}")))?;
        Ok(DecodingKey::from_jwk(jwk)?)
    }

    async fn verify_id_token(&self, id_token: &str) -> Result<IdClaims, AuthError> {
        let header = decode_header(id_token)?;
        let kid = header.kid.ok_or_else(|| AuthError::Malformed("id token without kid".into()))?;
        let key = self.decoding_key(&kid).await?;
        let mut validation = Validation::new(Algorithm::ES256);
        validation.set_audience(&[self.params.client_id.as_str()]);
        validation.set_issuer(&[APPLE_ISSUER]);
        Ok(decode::<IdClaims>(id_token, &key, &validation)?.claims)
    }

    async fn exchange(&self, code: &str, redirect_uri: &str) -> Result<String, AuthError> {
        let secret = self.client_secret().await?;
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", self.params.client_id.as_str()),
            ("client_secret", secret.as_str()),
        ];
        let resp: TokenResponse =
            self.http.post(&self.params.token_url).form(&form).send().await?.error_for_status()?.json().await?;
        Ok(resp.id_token)
    }
}

/// Name from the `user` form field Apple posts on the first login only.
fn user_name(raw: Option<&str>) -> String {
    let Some(v) = raw.and_then(|r| serde_json::from_str::<Value>(r).ok()) else {
        return String::new();
    };
    let part = |name: &str| v.pointer(&format!("/name/{name}")).and_then(Value::as_str).unwrap_or_default().to_string();
    format!("{} {}", part("firstName"), part("lastName")).trim().to_string()
}

#[async_trait]
impl Provider for AppleProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn login(&self, ctx: &AuthContext, req: LoginRequest) -> Result<Response, AuthError> {
        let mut handshake = ctx.handshake(&req)?;
        handshake.state = random_id();
        let mut url = Url::parse(&self.params.auth_url).map_err(|e| AuthError::Internal(e.into()))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("response_mode", "form_post")
            .append_pair("client_id", &self.params.client_id)
            .append_pair("redirect_uri", &ctx.callback_url(PROVIDER))
            .append_pair("scope", "name")
            .append_pair("state", &handshake.state);
        ctx.redirect_with_handshake(url.as_str(), handshake)
    }

    async fn callback(&self, ctx: &AuthContext, req: LoginRequest) -> Result<Response, AuthError> {
        let handshake = ctx.read_handshake(&req)?;
        if handshake.state.is_empty() || req.param("state") != Some(handshake.state.as_str()) {
            return Err(AuthError::Handshake("state mismatch".into()));
        }
        let id_token = self.exchange(req.require("code")?, &ctx.callback_url(PROVIDER)).await?;
        let claims = self.verify_id_token(&id_token).await?;

        let id = provider_user_id(PROVIDER, &claims.sub);
        let mut name = user_name(req.param("user"));
        if name.is_empty() {
            let short: String = id.trim_start_matches("apple_").chars().take(8).collect();
            name = format!("noname_{short}");
        }
        debug!(user = %id, "apple id token verified");
        ctx.finish_login(User { id, name, ..Default::default() }, &handshake, PROVIDER).await
    }
}

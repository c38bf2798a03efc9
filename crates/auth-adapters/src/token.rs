//! # Token service
//!
//! HS256 tokens carrying the user and the handshake state of a login. The signing key
//! depends on the site (the token audience), so the audience is read from the unverified
//! payload first and the token is then verified with that site's key.
//!
//! Browsers get two cookies: `JWT` (HTTP-only) and `XSRF-TOKEN` holding the token id.
//! A token taken from the cookie is only accepted when `X-XSRF-TOKEN` repeats that id.

use std::sync::Arc;

use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{Duration, Utc};
use domains::User;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::AuthError;

pub const JWT_COOKIE: &str = "JWT";
pub const JWT_HEADER: &str = "X-JWT";
pub const XSRF_COOKIE: &str = "XSRF-TOKEN";
pub const XSRF_HEADER: &str = "X-XSRF-TOKEN";

fn is_false(b: &bool) -> bool {
    !*b
}

/// One-shot markers; a flagged token can't be used as a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flags {
    #[serde(default, skip_serializing_if = "is_false")]
    pub login: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub delete_me: bool,
    /// Confirms a contact address for notifications.
    #[serde(default, skip_serializing_if = "is_false")]
    pub subscribe: bool,
}

impl Flags {
    pub fn is_empty(&self) -> bool {
        !self.login && !self.delete_me && !self.subscribe
    }
}

/// Request token pair of an OAuth1 login.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuth1Handshake {
    pub token: String,
    pub secret: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Site id.
    #[serde(rename = "aud")]
    pub audience: String,
    #[serde(rename = "iss", default)]
    pub issuer: String,
    #[serde(rename = "jti", default)]
    pub id: String,
    #[serde(rename = "exp")]
    pub expires_at: i64,
    #[serde(rename = "nbf", default)]
    pub not_before: i64,
    #[serde(rename = "iat", default)]
    pub issued_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub from: String,
    #[serde(rename = "sess_only", default, skip_serializing_if = "is_false")]
    pub session_only: bool,
    #[serde(default, skip_serializing_if = "Flags::is_empty")]
    pub flags: Flags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth1: Option<OAuth1Handshake>,
}

/// Signing key per site.
pub trait KeyStore: Send + Sync {
    fn key(&self, site_id: &str) -> Result<String, AuthError>;
}

/// One shared secret for a fixed set of sites. An empty site list accepts every site.
pub struct SiteKeys {
    secret: String,
    sites: Vec<String>,
}

impl SiteKeys {
    pub fn new(secret: impl Into<String>, sites: Vec<String>) -> Self {
        Self { secret: secret.into(), sites }
    }
}

impl KeyStore for SiteKeys {
    fn key(&self, site_id: &str) -> Result<String, AuthError> {
        if site_id.is_empty() || (!self.sites.is_empty() && !self.sites.iter().any(|s| s == site_id)) {
            return Err(AuthError::UnknownSite(site_id.to_string()));
        }
        Ok(self.secret.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SameSite {
    #[default]
    Unset,
    Lax,
    Strict,
    None,
}

#[derive(Debug, Clone)]
pub struct TokenParams {
    pub issuer: String,
    pub token_duration: Duration,
    pub cookie_duration: Duration,
    pub secure_cookies: bool,
    pub same_site: SameSite,
}

impl Default for TokenParams {
    fn default() -> Self {
        Self {
            issuer: "rusty-comments".to_string(),
            token_duration: Duration::minutes(5),
            cookie_duration: Duration::days(31),
            secure_cookies: false,
            same_site: SameSite::Unset,
        }
    }
}

/// Where [`TokenService::get`] found the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    Header,
    Cookie,
}

pub struct TokenService {
    keys: Arc<dyn KeyStore>,
    params: TokenParams,
}

#[derive(Deserialize)]
struct AudienceOnly {
    #[serde(default)]
    aud: String,
}

/// Audience of a token without checking its signature.
fn unverified_audience(token: &str) -> Result<String, AuthError> {
    let payload = token.split('.').nth(1).ok_or_else(|| AuthError::Malformed("missing payload".into()))?;
    let raw = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| AuthError::Malformed(e.to_string()))?;
    let aud: AudienceOnly = serde_json::from_slice(&raw).map_err(|e| AuthError::Malformed(e.to_string()))?;
    Ok(aud.aud)
}

fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v)
        .filter(|v| !v.is_empty())
}

impl TokenService {
    pub fn new(keys: Arc<dyn KeyStore>, params: TokenParams) -> Self {
        Self { keys, params }
    }

    pub fn params(&self) -> &TokenParams {
        &self.params
    }

    /// Signs the claims with the key of their audience.
    pub fn token(&self, claims: &Claims) -> Result<String, AuthError> {
        let key = self.keys.key(&claims.audience)?;
        Ok(encode(&Header::new(Algorithm::HS256), claims, &EncodingKey::from_secret(key.as_bytes()))?)
    }

    /// Verifies signature, audience and not-before. Expiry is left to [`Self::is_expired`]
    /// so expired sessions can still be refreshed.
    pub fn parse(&self, token: &str) -> Result<Claims, AuthError> {
        let audience = unverified_audience(token)?;
        let key = self.keys.key(&audience)?;
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_nbf = true;
        validation.leeway = 0;
        validation.set_audience(&[audience.as_str()]);
        validation.set_required_spec_claims(&["aud"]);
        Ok(decode::<Claims>(token, &DecodingKey::from_secret(key.as_bytes()), &validation)?.claims)
    }

    pub fn is_expired(&self, claims: &Claims) -> bool {
        claims.expires_at <= Utc::now().timestamp()
    }

    /// Reads the token from `X-JWT` or the `JWT` cookie.
    pub fn get(&self, headers: &HeaderMap) -> Result<(Claims, TokenSource), AuthError> {
        if let Some(token) = headers.get(JWT_HEADER).and_then(|v| v.to_str().ok()).filter(|v| !v.is_empty()) {
            return Ok((self.parse(token)?, TokenSource::Header));
        }
        let token = cookie_value(headers, JWT_COOKIE).ok_or(AuthError::NoToken)?;
        let claims = self.parse(token)?;
        if claims.flags.login {
            // handshake tokens come back through provider redirects, not XHR
            return Ok((claims, TokenSource::Cookie));
        }
        let xsrf = headers.get(XSRF_HEADER).and_then(|v| v.to_str().ok()).unwrap_or_default();
        if xsrf != claims.id {
            return Err(AuthError::XsrfMismatch);
        }
        Ok((claims, TokenSource::Cookie))
    }

    /// Stamps issuer and timestamps, signs, and appends both cookies.
    pub fn set(&self, headers: &mut HeaderMap, mut claims: Claims) -> Result<Claims, AuthError> {
        let now = Utc::now();
        claims.issuer = self.params.issuer.clone();
        claims.issued_at = now.timestamp();
        if claims.expires_at == 0 {
            claims.expires_at = (now + self.params.token_duration).timestamp();
        }
        if claims.id.is_empty() {
            claims.id = uuid::Uuid::new_v4().simple().to_string();
        }
        let token = self.token(&claims)?;
        let max_age = (!claims.session_only).then(|| self.params.cookie_duration.num_seconds());
        headers.append(SET_COOKIE, self.cookie(JWT_COOKIE, &token, max_age, true)?);
        headers.append(SET_COOKIE, self.cookie(XSRF_COOKIE, &claims.id, max_age, false)?);
        Ok(claims)
    }

    /// Expires both cookies.
    pub fn reset(&self, headers: &mut HeaderMap) {
        for (name, http_only) in [(JWT_COOKIE, true), (XSRF_COOKIE, false)] {
            if let Ok(v) = self.cookie(name, "", Some(0), http_only) {
                headers.append(SET_COOKIE, v);
            }
        }
    }

    fn cookie(&self, name: &str, value: &str, max_age: Option<i64>, http_only: bool) -> Result<HeaderValue, AuthError> {
        let mut cookie = format!("{name}={value}; Path=/");
        match max_age {
            Some(0) => cookie.push_str("; Max-Age=0; Expires=Thu, 01 Jan 1970 00:00:00 GMT"),
            Some(secs) => cookie.push_str(&format!("; Max-Age={secs}")),
            None => {}
        }
        if http_only {
            cookie.push_str("; HttpOnly");
        }
        if self.params.secure_cookies {
            cookie.push_str("; Secure");
        }
        match self.params.same_site {
            SameSite::Unset => {}
            SameSite::Lax => cookie.push_str("; SameSite=Lax"),
            SameSite::Strict => cookie.push_str("; SameSite=Strict"),
            SameSite::None => cookie.push_str("; SameSite=None"),
        }
        HeaderValue::from_str(&cookie).map_err(|e| AuthError::Internal(e.into()))
    }
}

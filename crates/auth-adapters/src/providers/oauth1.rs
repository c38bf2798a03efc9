//! Three-legged OAuth 1.0a with HMAC-SHA1 request signing. The request token pair lives
//! in the handshake token between `login` and `callback`.

use std::time::Duration;

use async_trait::async_trait;
use axum::response::Response;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::Value;
use services::utils::provider_user_id;
use sha1::Sha1;
use url::Url;

use super::oauth2::MapUser;
use super::{random_id, AuthContext, LoginRequest, Provider};
use crate::error::AuthError;
use crate::token::OAuth1Handshake;

type HmacSha1 = Hmac<Sha1>;

#[derive(Clone)]
pub struct OAuth1Params {
    pub name: String,
    pub consumer_key: String,
    pub consumer_secret: String,
    pub request_token_url: String,
    pub authorize_url: String,
    pub access_token_url: String,
    pub info_url: String,
    pub map_user: MapUser,
}

/// RFC 3986 percent-encoding: everything but unreserved characters.
pub fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Base64 HMAC-SHA1 signature of a request. `base_url` carries no query; its query
/// parameters belong in `params`.
pub fn signature(
    method: &str,
    base_url: &str,
    params: &[(String, String)],
    consumer_secret: &str,
    token_secret: &str,
) -> Result<String, AuthError> {
    let mut encoded: Vec<(String, String)> =
        params.iter().map(|(k, v)| (percent_encode(k), percent_encode(v))).collect();
    encoded.sort();
    let normalized = encoded.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join("&");
    let base = format!("{}&{}&{}", method.to_uppercase(), percent_encode(base_url), percent_encode(&normalized));
    let key = format!("{}&{}", percent_encode(consumer_secret), percent_encode(token_secret));
    let mut mac = HmacSha1::new_from_slice(key.as_bytes()).map_err(|e| AuthError::Internal(e.into()))?;
    mac.update(base.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

pub struct OAuth1Provider {
    params: OAuth1Params,
    http: reqwest::Client,
}

impl OAuth1Provider {
    pub fn new(params: OAuth1Params, timeout: Duration) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { params, http })
    }

    /// Sends a signed request. `extra` are protocol parameters such as `oauth_callback`,
    /// they go into the Authorization header with the rest of the `oauth_*` set.
    async fn signed(
        &self,
        method: reqwest::Method,
        url: &str,
        extra: &[(&str, &str)],
        token: Option<&OAuth1Handshake>,
    ) -> Result<String, AuthError> {
        let parsed = Url::parse(url).map_err(|e| AuthError::Internal(e.into()))?;
        let mut base = parsed.clone();
        base.set_query(None);

        let mut oauth: Vec<(String, String)> = vec![
            ("oauth_consumer_key".into(), self.params.consumer_key.clone()),
            ("oauth_nonce".into(), random_id()),
            ("oauth_signature_method".into(), "HMAC-SHA1".into()),
            ("oauth_timestamp".into(), Utc::now().timestamp().to_string()),
            ("oauth_version".into(), "1.0".into()),
        ];
        if let Some(t) = token {
            oauth.push(("oauth_token".into(), t.token.clone()));
        }
        oauth.extend(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));

        let mut all = oauth.clone();
        all.extend(parsed.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned())));
        let token_secret = token.map(|t| t.secret.as_str()).unwrap_or_default();
        let sig = signature(method.as_str(), base.as_str(), &all, &self.params.consumer_secret, token_secret)?;
        oauth.push(("oauth_signature".into(), sig));

        let header = oauth
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", percent_encode(k), percent_encode(v)))
            .collect::<Vec<_>>()
            .join(", ");
        let resp = self
            .http
            .request(method, url)
            .header(reqwest::header::AUTHORIZATION, format!("OAuth {header}"))
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.text().await?)
    }

    fn token_pair(body: &str) -> Result<OAuth1Handshake, AuthError> {
        let mut pair = OAuth1Handshake::default();
        for (k, v) in url::form_urlencoded::parse(body.as_bytes()) {
            match k.as_ref() {
                "oauth_token" => pair.token = v.into_owned(),
                "oauth_token_secret" => pair.secret = v.into_owned(),
                _ => {}
            }
        }
        if pair.token.is_empty() || pair.secret.is_empty() {
            return Err(AuthError::Handshake("provider returned no token pair".into()));
        }
        Ok(pair)
    }
}

#[async_trait]
impl Provider for OAuth1Provider {
    fn name(&self) -> &str {
        &self.params.name
    }

    async fn login(&self, ctx: &AuthContext, req: LoginRequest) -> Result<Response, AuthError> {
        let mut handshake = ctx.handshake(&req)?;
        let callback = ctx.callback_url(&self.params.name);
        let body = self
            .signed(reqwest::Method::POST, &self.params.request_token_url, &[("oauth_callback", callback.as_str())], None)
            .await?;
        let request_token = Self::token_pair(&body)?;

        let mut location = Url::parse(&self.params.authorize_url).map_err(|e| AuthError::Internal(e.into()))?;
        location.query_pairs_mut().append_pair("oauth_token", &request_token.token);
        handshake.oauth1 = Some(request_token);
        ctx.redirect_with_handshake(location.as_str(), handshake)
    }

    async fn callback(&self, ctx: &AuthContext, req: LoginRequest) -> Result<Response, AuthError> {
        let handshake = ctx.read_handshake(&req)?;
        let request_token = handshake.oauth1.clone().ok_or_else(|| AuthError::Handshake("no request token".into()))?;
        if req.param("oauth_token") != Some(request_token.token.as_str()) {
            return Err(AuthError::Handshake("request token mismatch".into()));
        }
        let verifier = req.require("oauth_verifier")?;
        let body = self
            .signed(
                reqwest::Method::POST,
                &self.params.access_token_url,
                &[("oauth_verifier", verifier)],
                Some(&request_token),
            )
            .await?;
        let access = Self::token_pair(&body)?;

        let info = self.signed(reqwest::Method::GET, &self.params.info_url, &[], Some(&access)).await?;
        let info: Value = serde_json::from_str(&info).map_err(|e| AuthError::Internal(e.into()))?;
        let mut user = (self.params.map_user)(&info);
        if user.id.is_empty() {
            return Err(AuthError::Handshake(format!("{} returned no user id", self.params.name)));
        }
        user.id = provider_user_id(&self.params.name, &user.id);
        ctx.finish_login(user, &handshake, &self.params.name).await
    }
}

fn twitter_user(v: &Value) -> domains::User {
    let text = |name: &str| v.get(name).and_then(Value::as_str).unwrap_or_default().to_string();
    let mut name = text("name");
    if name.is_empty() {
        name = text("screen_name");
    }
    domains::User { id: text("id_str"), name, picture: text("profile_image_url_https"), ..Default::default() }
}

pub fn twitter(consumer_key: &str, consumer_secret: &str) -> OAuth1Params {
    OAuth1Params {
        name: "twitter".to_string(),
        consumer_key: consumer_key.to_string(),
        consumer_secret: consumer_secret.to_string(),
        request_token_url: "https://api.twitter.com/oauth/request_token".to_string(),
        authorize_url: "https://api.twitter.com/oauth/authorize".to_string(),
        access_token_url: "https://api.twitter.com/oauth/access_token".to_string(),
        info_url: "https://api.twitter.com/1.1/account/verify_credentials.json".to_string(),
        map_user: twitter_user,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::testutil::{context, location, request, with_cookies};
    use serde_json::json;
    use wiremock::matchers::{header_regex, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn signs_reference_request() {
        let params: Vec<(String, String)> = [
            ("status", "Hello Ladies + Gentlemen, a signed OAuth request!"),
            ("include_entities", "true"),
            ("oauth_consumer_key", "xvz1evFS4wEEPTGEFPHBog"),
            ("oauth_nonce", "kYjzVBB8Y0ZFabxSWbWovY3uYSQ2pTgmZeNu2VS4cg"),
            ("oauth_signature_method", "HMAC-SHA1"),
            ("oauth_timestamp", "1318622958"),
            ("oauth_token", "370773112-GmHxMAgYyLbNEtIKZeRNFsMKPR9EyMZeS9weJAEb"),
            ("oauth_version", "1.0"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let sig = signature(
            "post",
            "https://api.twitter.com/1.1/statuses/update.json",
            &params,
            "kAcSOqF21Fu85e7zjz7ZN2U4ZRhfV3WpwPAoE3Z7kBw",
            "LswwdoUaIvS8ltyTt5jkRh4J50vUPVVHtR2YPi5kE",
        )
        .unwrap();
        assert_eq!(sig, "hCtSmYh+iHYCEqBWrE7C7hYmtUk=");
        assert_eq!(percent_encode("a b+c~/"), "a%20b%2Bc~%2F");
    }

    #[tokio::test]
    async fn login_and_callback() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/request_token"))
            .and(header_regex("authorization", "^OAuth .*oauth_signature="))
            .respond_with(ResponseTemplate::new(200).set_body_string("oauth_token=rt&oauth_token_secret=rs&oauth_callback_confirmed=true"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/access_token"))
            .and(header_regex("authorization", "oauth_verifier=\"v1\""))
            .respond_with(ResponseTemplate::new(200).set_body_string("oauth_token=at&oauth_token_secret=as&user_id=5"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/verify"))
            .and(header_regex("authorization", "oauth_token=\"at\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id_str": "5", "screen_name": "tw"})))
            .mount(&server)
            .await;

        let mut params = twitter("ck", "cs");
        params.request_token_url = format!("{}/request_token", server.uri());
        params.authorize_url = format!("{}/authorize", server.uri());
        params.access_token_url = format!("{}/access_token", server.uri());
        params.info_url = format!("{}/verify", server.uri());
        let p = OAuth1Provider::new(params, Duration::from_secs(5)).unwrap();
        let ctx = context("https://c.example.com");

        let login = p.login(&ctx, request(&[("site", "site")])).await.unwrap();
        assert_eq!(location(&login), format!("{}/authorize?oauth_token=rt", server.uri()));

        let bad = with_cookies(request(&[("oauth_token", "other"), ("oauth_verifier", "v1")]), &login);
        assert!(matches!(p.callback(&ctx, bad).await, Err(AuthError::Handshake(_))));

        let cb = with_cookies(request(&[("oauth_token", "rt"), ("oauth_verifier", "v1")]), &login);
        let resp = p.callback(&ctx, cb).await.unwrap();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let user: domains::User = serde_json::from_slice(&body).unwrap();
        assert_eq!(user.id, provider_user_id("twitter", "5"));
        assert_eq!(user.name, "tw");
    }
}

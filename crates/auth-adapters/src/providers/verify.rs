//! Login by a confirmation token delivered out of band (email, messenger). The first
//! request mails a handshake token, the second one presents it back.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use domains::{User, VerificationRequest, VerificationSender};
use serde_json::json;
use services::utils::provider_user_id;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::{AuthContext, LoginRequest, Provider};
use crate::error::AuthError;
use crate::token::Claims;

pub const DEFAULT_GRAVATAR_URL: &str = "https://www.gravatar.com/avatar";

const ID_SEPARATOR: &str = "::";

/// Which recipient field of the [`VerificationRequest`] carries the address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Email,
    Telegram,
}

pub struct VerifyProvider {
    name: String,
    channel: Channel,
    sender: Arc<dyn VerificationSender>,
    gravatar_url: Option<String>,
    http: reqwest::Client,
}

impl VerifyProvider {
    pub fn new(
        name: impl Into<String>,
        channel: Channel,
        sender: Arc<dyn VerificationSender>,
        timeout: Duration,
    ) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { name: name.into(), channel, sender, gravatar_url: None, http })
    }

    /// Looks avatars up on Gravatar (or a compatible service) by email hash.
    pub fn with_gravatar(mut self, base_url: impl Into<String>) -> Self {
        self.gravatar_url = Some(base_url.into().trim_end_matches('/').to_string());
        self
    }

    async fn send_token(&self, ctx: &AuthContext, req: &LoginRequest) -> Result<Response, AuthError> {
        let user = req.require("user")?.trim().to_string();
        let address = req.require("address")?.trim().to_string();
        if self.channel == Channel::Email && !address.contains('@') {
            return Err(AuthError::BadRequest(format!("{address:?} is not an email address")));
        }
        if user.contains(ID_SEPARATOR) {
            return Err(AuthError::BadRequest("user name can't contain \"::\"".into()));
        }

        let handshake = Claims { id: format!("{user}{ID_SEPARATOR}{address}"), ..ctx.handshake(req)? };
        let token = ctx.tokens.token(&handshake)?;
        let mut request =
            VerificationRequest { site_id: handshake.audience.clone(), user: user.clone(), token, ..Default::default() };
        match self.channel {
            Channel::Email => request.email = address.clone(),
            Channel::Telegram => request.telegram = address.clone(),
        }
        self.sender.send_verification(request).await?;
        debug!(provider = %self.name, user, "confirmation token sent");
        Ok(Json(json!({"user": user, "address": address})).into_response())
    }

    async fn gravatar(&self, email: &str) -> String {
        let Some(base) = &self.gravatar_url else {
            return String::new();
        };
        let hash = hex::encode(Sha256::digest(email.trim().to_lowercase().as_bytes()));
        let url = format!("{base}/{hash}");
        match self.http.head(format!("{url}?d=404")).send().await {
            Ok(resp) if resp.status().is_success() => url,
            _ => String::new(),
        }
    }
}

#[async_trait]
impl Provider for VerifyProvider {
    fn name(&self) -> &str {
        &self.name
    }

    /// `?user=&address=&site=` sends a token, `?token=` completes the login.
    async fn login(&self, ctx: &AuthContext, req: LoginRequest) -> Result<Response, AuthError> {
        if req.param("token").is_some() {
            return self.callback(ctx, req).await;
        }
        self.send_token(ctx, &req).await
    }

    async fn callback(&self, ctx: &AuthContext, req: LoginRequest) -> Result<Response, AuthError> {
        let handshake = ctx.tokens.parse(req.require("token")?)?;
        if !handshake.flags.login || handshake.user.is_some() {
            return Err(AuthError::Handshake("not a confirmation token".into()));
        }
        if handshake.expires_at <= Utc::now().timestamp() {
            return Err(AuthError::Handshake("confirmation token expired".into()));
        }
        let (name, address) = handshake
            .id
            .split_once(ID_SEPARATOR)
            .ok_or_else(|| AuthError::Handshake("malformed confirmation token".into()))?;

        let picture = match self.channel {
            Channel::Email => self.gravatar(address).await,
            Channel::Telegram => String::new(),
        };
        let user = User { id: provider_user_id(&self.name, address), name: name.to_string(), picture, ..Default::default() };
        info!(provider = %self.name, user = %user.id, "address confirmed");
        ctx.finish_login(user, &handshake, &self.name).await
    }
}

//! Login through the Telegram bot: the page gets a token, the user sends `/start <token>`
//! to the bot, and the page polls `login?token=` until the bot has seen it.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use dashmap::DashMap;
use domains::{UpdateReceiver, User};
use notify_adapters::telegram::{parse_updates, TelegramUser};
use notify_adapters::TelegramClient;
use serde_json::json;
use services::utils::provider_user_id;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use super::{random_id, AuthContext, LoginRequest, Provider};
use crate::error::AuthError;

const PROVIDER: &str = "telegram";
pub const DEFAULT_REQUEST_TTL: Duration = Duration::from_secs(10 * 60);

struct Pending {
    expires_at: i64,
    user: Option<User>,
}

pub struct TelegramLogin {
    client: TelegramClient,
    bot: OnceCell<String>,
    ttl: Duration,
    requests: DashMap<String, Pending>,
}

impl TelegramLogin {
    pub fn new(client: TelegramClient) -> Self {
        Self { client, bot: OnceCell::new(), ttl: DEFAULT_REQUEST_TTL, requests: DashMap::new() }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    async fn bot_name(&self) -> Result<String, AuthError> {
        let name = self.bot.get_or_try_init(|| async { self.client.get_me().await.map(|b| b.username) }).await?;
        Ok(name.clone())
    }

    fn purge_expired(&self) {
        let now = Utc::now().timestamp();
        self.requests.retain(|_, p| p.expires_at > now);
    }

    async fn confirm(&self, token: &str, from: &TelegramUser) -> anyhow::Result<bool> {
        if !self.requests.get(token).is_some_and(|p| p.user.is_none() && p.expires_at > Utc::now().timestamp()) {
            return Ok(false);
        }
        let picture = match self.client.profile_photo_url(from.id).await {
            Ok(url) => url.unwrap_or_default(),
            Err(e) => {
                warn!("can't get telegram photo of {}, {e:#}", from.id);
                String::new()
            }
        };
        let user = User {
            id: provider_user_id(PROVIDER, &from.id.to_string()),
            name: from.display_name(),
            picture,
            ..Default::default()
        };
        if let Some(mut pending) = self.requests.get_mut(token) {
            pending.user = Some(user);
        }
        Ok(true)
    }
}

#[async_trait]
impl Provider for TelegramLogin {
    fn name(&self) -> &str {
        PROVIDER
    }

    /// Without `token` starts a login and returns the bot link data; with `token`
    /// finishes it once the bot confirmed the request.
    async fn login(&self, ctx: &AuthContext, req: LoginRequest) -> Result<Response, AuthError> {
        if req.param("token").is_some() {
            return self.callback(ctx, req).await;
        }
        self.purge_expired();
        let handshake = ctx.handshake(&req)?;
        let bot = self.bot_name().await?;
        let token = random_id();
        let expires_at = Utc::now().timestamp() + self.ttl.as_secs() as i64;
        self.requests.insert(token.clone(), Pending { expires_at, user: None });

        let mut resp = Json(json!({"bot": bot, "token": token})).into_response();
        ctx.tokens.set(resp.headers_mut(), handshake)?;
        Ok(resp)
    }

    async fn callback(&self, ctx: &AuthContext, req: LoginRequest) -> Result<Response, AuthError> {
        let token = req.require("token")?;
        let handshake = ctx.read_handshake(&req)?;
        let user = {
            let Some(pending) = self.requests.get(token) else {
                return Err(AuthError::Handshake("unknown or expired request".into()));
            };
            if pending.expires_at <= Utc::now().timestamp() {
                return Err(AuthError::Handshake("unknown or expired request".into()));
            }
            pending.user.clone().ok_or_else(|| AuthError::Handshake("request is not confirmed yet".into()))?
        };
        self.requests.remove(token);
        ctx.finish_login(user, &handshake, PROVIDER).await
    }
}

#[async_trait]
impl UpdateReceiver for TelegramLogin {
    async fn process_update(&self, raw: &str) -> anyhow::Result<()> {
        let mut confirmed: HashMap<String, i64> = HashMap::new();
        for update in parse_updates(raw)? {
            let Some(message) = update.message else { continue };
            let (Some(text), Some(from)) = (message.text.as_deref(), message.from.as_ref()) else { continue };
            let Some(token) = text.strip_prefix("/start ").map(str::trim) else { continue };
            if self.confirm(token, from).await? {
                confirmed.insert(token.to_string(), message.chat.id);
            }
        }
        for (_, chat) in confirmed {
            self.client
                .send_message(&chat.to_string(), "You have successfully authenticated, check the browser!")
                .await?;
            info!(chat, "telegram login confirmed");
        }
        Ok(())
    }

    fn name(&self) -> String {
        "telegram login".to_string()
    }
}

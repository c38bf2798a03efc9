//! # Telegram
//!
//! Thin Bot API client plus the notification destination built on it. The destination
//! also receives long-poll updates so users can link their chat with `/start <token>`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use domains::{Comment, Destination, NotifyRequest, UpdateReceiver, VerificationRequest};
use html_escape::{encode_double_quoted_attribute, encode_text};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use services::formatter::snippet;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::SendErrors;

pub const DEFAULT_API_URL: &str = "https://api.telegram.org";
const PARENT_SNIPPET_LEN: i64 = 300;

#[derive(Error, Debug)]
pub enum TelegramError {
    #[error("telegram api {method} failed: {description}")]
    Api { method: String, description: String },
    #[error("telegram api {0} returned no result")]
    EmptyResult(String),
}

#[derive(Deserialize)]
struct Envelope<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct BotInfo {
    pub id: i64,
    pub username: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub chat: Chat,
    pub from: Option<TelegramUser>,
    pub text: Option<String>,
    #[serde(default)]
    pub date: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

impl TelegramUser {
    /// `@username`, falling back to the first and last names.
    pub fn display_name(&self) -> String {
        if let Some(username) = self.username.as_deref().filter(|u| !u.is_empty()) {
            return username.to_string();
        }
        let name = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        if name.is_empty() {
            self.id.to_string()
        } else {
            name
        }
    }
}

#[derive(Deserialize)]
struct ProfilePhotos {
    photos: Vec<Vec<PhotoSize>>,
}

#[derive(Deserialize)]
struct PhotoSize {
    file_id: String,
}

#[derive(Deserialize)]
struct File {
    file_path: Option<String>,
}

/// Parses the payload forwarded by the update dispatcher.
pub fn parse_updates(raw: &str) -> anyhow::Result<Vec<Update>> {
    Ok(serde_json::from_str(raw)?)
}

#[derive(Clone)]
pub struct TelegramClient {
    http: reqwest::Client,
    api_url: String,
    token: String,
}

impl TelegramClient {
    pub fn new(api_url: impl Into<String>, token: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let api_url = api_url.into().trim_end_matches('/').to_string();
        Ok(Self { http, api_url, token: token.into() })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_url, self.token)
    }

    /// Calls a Bot API method and unwraps the `{ok, result, description}` envelope.
    pub async fn request<T: DeserializeOwned>(&self, method: &str, query: &[(&str, String)]) -> anyhow::Result<T> {
        let envelope: Envelope<T> = self.http.get(self.method_url(method)).query(query).send().await?.json().await?;
        if !envelope.ok {
            return Err(TelegramError::Api {
                method: method.to_string(),
                description: envelope.description.unwrap_or_default(),
            }
            .into());
        }
        envelope.result.ok_or_else(|| TelegramError::EmptyResult(method.to_string()).into())
    }

    pub async fn send_message(&self, chat_id: &str, html: &str) -> anyhow::Result<()> {
        let query = [
            ("chat_id", chat_id.to_string()),
            ("text", html.to_string()),
            ("parse_mode", "HTML".to_string()),
            ("disable_web_page_preview", "true".to_string()),
        ];
        let _: serde_json::Value = self.request("sendMessage", &query).await?;
        Ok(())
    }

    /// Raw update objects after `offset`.
    pub async fn get_updates(&self, offset: i64) -> anyhow::Result<Vec<serde_json::Value>> {
        let query = [("allowed_updates", r#"["message"]"#.to_string()), ("offset", offset.to_string())];
        self.request("getUpdates", &query).await
    }

    pub async fn get_me(&self) -> anyhow::Result<BotInfo> {
        self.request("getMe", &[]).await
    }

    /// Download URL of the user's first profile photo, if they have one.
    pub async fn profile_photo_url(&self, user_id: i64) -> anyhow::Result<Option<String>> {
        let photos: ProfilePhotos = self.request("getUserProfilePhotos", &[("user_id", user_id.to_string())]).await?;
        let Some(file_id) = photos.photos.first().and_then(|sizes| sizes.last()).map(|p| p.file_id.clone()) else {
            return Ok(None);
        };
        let file: File = self.request("getFile", &[("file_id", file_id)]).await?;
        Ok(file.file_path.map(|path| format!("{}/file/bot{}/{path}", self.api_url, self.token)))
    }
}

fn telegram_policy() -> ammonia::Builder<'static> {
    let mut builder = ammonia::Builder::empty();
    builder
        .add_tags(["a", "b", "strong", "i", "em", "u", "ins", "s", "strike", "del", "code", "pre", "blockquote"])
        .add_tag_attributes("a", ["href"])
        .clean_content_tags(["script", "style"].into_iter().collect())
        .url_schemes(["http", "https", "mailto", "tg"].into_iter().collect())
        .link_rel(None);
    builder
}

/// Reduces rendered comment HTML to the subset Telegram accepts.
pub fn telegram_html(html: &str) -> String {
    let cleaned = telegram_policy().clean(html).to_string();
    cleaned.trim().to_string()
}

fn comment_url(comment: &Comment) -> String {
    format!("{}#comments__comment-{}", comment.locator.url, comment.id)
}

/// One HTML message per comment: author, reply marker, body, parent quote and post link.
pub fn comment_message(request: &NotifyRequest) -> String {
    let comment = &request.comment;
    let mut msg = format!(
        r#"<a href="{}">{}</a>"#,
        encode_double_quoted_attribute(&comment_url(comment)),
        encode_text(&comment.user.name)
    );
    if !comment.parent_id.is_empty() && !request.parent.id.is_empty() {
        msg.push_str(&format!(
            r#" <b>→</b> <a href="{}">{}</a>"#,
            encode_double_quoted_attribute(&comment_url(&request.parent)),
            encode_text(&request.parent.user.name)
        ));
    }
    msg.push_str("\n\n");
    msg.push_str(&telegram_html(&comment.text));

    if !request.parent.id.is_empty() {
        let quote = snippet(&request.parent.text, PARENT_SNIPPET_LEN);
        if !quote.is_empty() {
            msg.push_str(&format!("\n\n<i>{}</i>", encode_text(&quote)));
        }
    }
    if !comment.post_title.is_empty() {
        msg.push_str(&format!(
            r#"

↦ <a href="{}">{}</a>"#,
            encode_double_quoted_attribute(&comment.locator.url),
            encode_text(&comment.post_title)
        ));
    }
    msg
}

#[derive(Debug, Clone)]
pub struct TelegramParams {
    /// Chat id or `@channel` receiving every comment; empty disables.
    pub admin_channel: String,
    /// Send replies to users who linked their chat.
    pub user_notifications: bool,
}

/// Chat linked through `/start <token>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelegramSubscription {
    pub chat_id: String,
    pub name: String,
}

pub struct TelegramDestination {
    client: TelegramClient,
    params: TelegramParams,
    bot: OnceCell<BotInfo>,
    /// Tokens handed out by [`TelegramDestination::subscription_token`], not yet used.
    pending: DashMap<String, ()>,
    subscriptions: DashMap<String, TelegramSubscription>,
}

impl TelegramDestination {
    pub fn new(client: TelegramClient, params: TelegramParams) -> Self {
        Self { client, params, bot: OnceCell::new(), pending: DashMap::new(), subscriptions: DashMap::new() }
    }

    /// New token for the `/start <token>` link; only issued tokens are accepted.
    pub fn subscription_token(&self) -> String {
        let token = uuid::Uuid::new_v4().simple().to_string();
        self.pending.insert(token.clone(), ());
        token
    }

    /// Bot username, fetched once.
    pub async fn bot_name(&self) -> anyhow::Result<String> {
        let bot = self.bot.get_or_try_init(|| self.client.get_me()).await?;
        Ok(bot.username.clone())
    }

    /// Chat that sent `/start <token>`. Each token is handed out once.
    pub fn take_subscription(&self, token: &str) -> Option<TelegramSubscription> {
        self.subscriptions.remove(token).map(|(_, s)| s)
    }
}

#[async_trait]
impl Destination for TelegramDestination {
    async fn send(&self, request: &NotifyRequest) -> anyhow::Result<()> {
        let msg = comment_message(request);
        let mut chats: Vec<&str> = Vec::new();
        if !self.params.admin_channel.is_empty() {
            chats.push(&self.params.admin_channel);
        }
        if self.params.user_notifications {
            chats.extend(request.telegrams.iter().map(String::as_str).filter(|c| !c.is_empty()));
        }

        let mut errors = Vec::new();
        for chat in chats {
            match self.client.send_message(chat, &msg).await {
                Ok(()) => debug!(chat, id = %request.comment.id, "telegram notification sent"),
                Err(e) => errors.push(e.context(format!("chat {chat}"))),
            }
        }
        SendErrors::into_result(errors)
    }

    async fn send_verification(&self, request: &VerificationRequest) -> anyhow::Result<()> {
        if request.telegram.is_empty() {
            return Ok(());
        }
        let msg = format!(
            "Confirmation for <b>{}</b> on site <b>{}</b>\n\n<code>{}</code>",
            encode_text(&request.user),
            encode_text(&request.site_id),
            encode_text(&request.token)
        );
        self.client.send_message(&request.telegram, &msg).await
    }

    fn name(&self) -> String {
        format!("telegram: admin channel {:?}, user notifications {}", self.params.admin_channel, self.params.user_notifications)
    }
}

#[async_trait]
impl UpdateReceiver for TelegramDestination {
    async fn process_update(&self, raw: &str) -> anyhow::Result<()> {
        let mut linked: HashMap<String, TelegramSubscription> = HashMap::new();
        for update in parse_updates(raw)? {
            let Some(message) = update.message else { continue };
            let Some(token) = message.text.as_deref().and_then(|t| t.strip_prefix("/start ")).map(str::trim) else {
                continue;
            };
            if self.pending.remove(token).is_none() {
                continue;
            }
            let name = message.from.as_ref().map(TelegramUser::display_name).unwrap_or_default();
            linked.insert(token.to_string(), TelegramSubscription { chat_id: message.chat.id.to_string(), name });
        }

        for (token, sub) in linked {
            self.client
                .send_message(&sub.chat_id, "Notifications are linked, return to the comments page to finish.")
                .await?;
            info!(chat = %sub.chat_id, "telegram chat linked");
            self.subscriptions.insert(token, sub);
        }
        Ok(())
    }

    fn name(&self) -> String {
        "telegram notifications".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domains::{Locator, User};
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> TelegramClient {
        TelegramClient::new(server.uri(), "TOKEN", Duration::from_secs(5)).unwrap()
    }

    fn ok(result: serde_json::Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({"ok": true, "result": result}))
    }

    fn request() -> NotifyRequest {
        let parent = Comment {
            id: "p1".into(),
            text: "<p>parent text</p>".into(),
            user: User { name: "Alice".into(), ..Default::default() },
            locator: Locator::new("site", "https://example.com/post"),
            ..Default::default()
        };
        NotifyRequest {
            comment: Comment {
                id: "c1".into(),
                parent_id: "p1".into(),
                text: "<p>hello <strong>there</strong></p>\n<img src=\"x.png\">".into(),
                user: User { name: "Bob <b>".into(), ..Default::default() },
                locator: Locator::new("site", "https://example.com/post"),
                post_title: "Post".into(),
                ..Default::default()
            },
            parent,
            emails: vec![],
            telegrams: vec!["42".into()],
        }
    }

    #[test]
    fn message_layout() {
        let msg = comment_message(&request());
        assert!(msg.starts_with(r#"<a href="https://example.com/post#comments__comment-c1">Bob &lt;b&gt;</a> <b>→</b>"#));
        assert!(msg.contains("hello <strong>there</strong>"));
        assert!(!msg.contains("<p>"));
        assert!(!msg.contains("<img"));
        assert!(msg.contains("<i>parent text</i>"));
        assert!(msg.ends_with(r#"↦ <a href="https://example.com/post">Post</a>"#));
    }

    #[tokio::test]
    async fn send_to_channel_and_users() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/botTOKEN/sendMessage"))
            .and(query_param("parse_mode", "HTML"))
            .respond_with(ok(json!({"message_id": 1})))
            .expect(2)
            .mount(&server)
            .await;

        let dest = TelegramDestination::new(
            client(&server),
            TelegramParams { admin_channel: "@remarks".into(), user_notifications: true },
        );
        dest.send(&request()).await.unwrap();
    }

    #[tokio::test]
    async fn failures_are_collected() {
        let server = MockServer::start().await;
        Mock::given(path("/botTOKEN/sendMessage"))
            .and(query_param("chat_id", "42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": false, "description": "chat not found"})))
            .mount(&server)
            .await;
        Mock::given(path("/botTOKEN/sendMessage"))
            .respond_with(ok(json!({"message_id": 1})))
            .mount(&server)
            .await;

        let dest = TelegramDestination::new(
            client(&server),
            TelegramParams { admin_channel: "@remarks".into(), user_notifications: true },
        );
        let err = dest.send(&request()).await.unwrap_err();
        let errors = err.downcast_ref::<SendErrors>().unwrap();
        assert_eq!(errors.0.len(), 1);
        assert!(format!("{err}").contains("chat not found"));
    }

    #[tokio::test]
    async fn start_links_chat() {
        let server = MockServer::start().await;
        Mock::given(path("/botTOKEN/sendMessage"))
            .and(query_param("chat_id", "777"))
            .respond_with(ok(json!({"message_id": 1})))
            .expect(1)
            .mount(&server)
            .await;

        let dest = TelegramDestination::new(
            client(&server),
            TelegramParams { admin_channel: String::new(), user_notifications: true },
        );
        let token = dest.subscription_token();
        let raw = json!([
            {"update_id": 1, "message": {"chat": {"id": 777}, "from": {"id": 777, "username": "neo"}, "text": format!("/start {token}"), "date": 0}},
            {"update_id": 2, "message": {"chat": {"id": 778}, "text": "hello", "date": 0}},
            {"update_id": 3, "message": {"chat": {"id": 779}, "text": "/start someone-elses", "date": 0}}
        ])
        .to_string();
        dest.process_update(&raw).await.unwrap();

        assert_eq!(
            dest.take_subscription(&token),
            Some(TelegramSubscription { chat_id: "777".into(), name: "neo".into() })
        );
        assert_eq!(dest.take_subscription(&token), None);
        assert_eq!(dest.take_subscription("someone-elses"), None);
    }

    #[tokio::test]
    async fn profile_photo_lookup() {
        let server = MockServer::start().await;
        Mock::given(path("/botTOKEN/getUserProfilePhotos"))
            .and(query_param("user_id", "5"))
            .respond_with(ok(json!({"total_count": 1, "photos": [[{"file_id": "small"}, {"file_id": "big"}]]})))
            .mount(&server)
            .await;
        Mock::given(path("/botTOKEN/getFile"))
            .and(query_param("file_id", "big"))
            .respond_with(ok(json!({"file_id": "big", "file_path": "photos/1.jpg"})))
            .mount(&server)
            .await;
        Mock::given(path("/botTOKEN/getMe"))
            .respond_with(ok(json!({"id": 1, "username": "remark_bot", "is_bot": true})))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server);
        assert_eq!(
            client.profile_photo_url(5).await.unwrap(),
            Some(format!("{}/file/botTOKEN/photos/1.jpg", server.uri()))
        );
        let dest = TelegramDestination::new(client, TelegramParams { admin_channel: String::new(), user_notifications: false });
        assert_eq!(dest.bot_name().await.unwrap(), "remark_bot");
        assert_eq!(dest.bot_name().await.unwrap(), "remark_bot");
    }
}

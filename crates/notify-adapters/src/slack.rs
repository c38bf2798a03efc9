//! Slack `chat.postMessage` destination.

use std::time::Duration;

use async_trait::async_trait;
use domains::{Destination, NotifyRequest, VerificationRequest};
use serde::{Deserialize, Serialize};
use services::formatter::snippet;
use tracing::debug;

pub const DEFAULT_API_URL: &str = "https://slack.com/api";
const EXCERPT_LEN: i64 = 300;

#[derive(Serialize)]
struct PostMessage<'a> {
    channel: &'a str,
    text: String,
    attachments: Vec<Attachment>,
}

#[derive(Serialize)]
struct Attachment {
    author_name: String,
    title: String,
    title_link: String,
    text: String,
    mrkdwn_in: Vec<&'static str>,
}

#[derive(Deserialize)]
struct SlackResponse {
    ok: bool,
    #[serde(default)]
    error: String,
}

pub struct SlackDestination {
    http: reqwest::Client,
    api_url: String,
    token: String,
    channel: String,
}

impl SlackDestination {
    pub fn new(
        api_url: impl Into<String>,
        token: impl Into<String>,
        channel: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            channel: channel.into(),
        })
    }

    fn message(&self, request: &NotifyRequest) -> PostMessage<'_> {
        let comment = &request.comment;
        let mut text = format!("New comment from {}", comment.user.name);
        if !request.parent.id.is_empty() {
            text.push_str(&format!(" in reply to {}", request.parent.user.name));
        }
        let title = if comment.post_title.is_empty() { comment.locator.url.clone() } else { comment.post_title.clone() };
        PostMessage {
            channel: &self.channel,
            text,
            attachments: vec![Attachment {
                author_name: comment.user.name.clone(),
                title,
                title_link: format!("{}#comments__comment-{}", comment.locator.url, comment.id),
                text: snippet(&comment.text, EXCERPT_LEN),
                mrkdwn_in: vec!["text"],
            }],
        }
    }
}

#[async_trait]
impl Destination for SlackDestination {
    async fn send(&self, request: &NotifyRequest) -> anyhow::Result<()> {
        let resp: SlackResponse = self
            .http
            .post(format!("{}/chat.postMessage", self.api_url))
            .bearer_auth(&self.token)
            .json(&self.message(request))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if !resp.ok {
            anyhow::bail!("slack chat.postMessage to {} failed: {}", self.channel, resp.error);
        }
        debug!(channel = %self.channel, id = %request.comment.id, "slack notification sent");
        Ok(())
    }

    async fn send_verification(&self, _request: &VerificationRequest) -> anyhow::Result<()> {
        Ok(())
    }

    fn name(&self) -> String {
        format!("slack: {}", self.channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domains::{Comment, Locator, User};
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> NotifyRequest {
        NotifyRequest {
            comment: Comment {
                id: "c1".into(),
                text: "<p>some <em>text</em></p>".into(),
                user: User { name: "Bob".into(), ..Default::default() },
                locator: Locator::new("site", "https://example.com/p"),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn posts_attachment() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat.postMessage"))
            .and(header("authorization", "Bearer xoxb"))
            .and(body_partial_json(json!({
                "channel": "#comments",
                "attachments": [{"title": "https://example.com/p", "text": "some text", "author_name": "Bob"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let dest = SlackDestination::new(server.uri(), "xoxb", "#comments", Duration::from_secs(5)).unwrap();
        dest.send(&request()).await.unwrap();
        dest.send_verification(&VerificationRequest::default()).await.unwrap();
    }

    #[tokio::test]
    async fn api_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(path("/chat.postMessage"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": false, "error": "channel_not_found"})))
            .mount(&server)
            .await;

        let dest = SlackDestination::new(server.uri(), "xoxb", "#nope", Duration::from_secs(5)).unwrap();
        let err = dest.send(&request()).await.unwrap_err();
        assert!(err.to_string().contains("channel_not_found"));
    }
}

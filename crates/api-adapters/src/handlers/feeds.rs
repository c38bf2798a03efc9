//! Comment feeds as JSON item lists.

use axum::extract::State;
use axum::http::Uri;
use axum::response::Response;
use chrono::{DateTime, Utc};
use domains::{Comment, Sort, SortField, LAST_COMMENTS_SCOPE};
use serde::Serialize;
use services::formatter::snippet;

use super::Params;
use crate::cache::{cached_json, request_key};
use crate::error::ApiError;
use crate::state::AppState;

/// Items per feed.
pub const FEED_SIZE: usize = 20;
const SNIPPET_LEN: i64 = 300;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedItem {
    pub id: String,
    pub title: String,
    pub link: String,
    pub author: String,
    pub description: String,
    pub published: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Feed {
    pub title: String,
    pub link: String,
    pub updated: Option<DateTime<Utc>>,
    pub items: Vec<FeedItem>,
}

impl Feed {
    fn new(title: String, link: String, comments: &[Comment]) -> Self {
        let items: Vec<FeedItem> = comments.iter().filter(|c| !c.deleted).take(FEED_SIZE).map(FeedItem::from).collect();
        let updated = items.iter().map(|i| i.published).max();
        Self { title, link, updated, items }
    }
}

impl From<&Comment> for FeedItem {
    fn from(c: &Comment) -> Self {
        let title = if c.post_title.is_empty() { c.user.name.clone() } else { format!("{} > {}", c.user.name, c.post_title) };
        FeedItem {
            id: c.id.clone(),
            title,
            link: format!("{}#comment-{}", c.locator.url, c.id),
            author: c.user.name.clone(),
            description: snippet(&c.text, SNIPPET_LEN),
            published: c.timestamp,
        }
    }
}

/// `GET /feed/post?site=&url=`
pub async fn post(State(state): State<AppState>, params: Params, uri: Uri) -> Result<Response, ApiError> {
    let locator = params.locator()?;
    let key = request_key(&locator.site_id, &uri, None, [locator.site_id.clone(), locator.url.clone()]);
    let data = state.data.clone();
    cached_json(&state.cache, &key, || async move {
        let mut comments = data.find(&locator, Sort { field: SortField::Time, descending: true }).await?;
        data.prepare_for_viewer(&mut comments, None).await;
        Ok(Feed::new(format!("comments on {}", locator.url), locator.url.clone(), &comments))
    })
    .await
}

/// `GET /feed/site?site=`
pub async fn site(State(state): State<AppState>, params: Params, uri: Uri) -> Result<Response, ApiError> {
    let site = params.site()?.to_string();
    let key = request_key(&site, &uri, None, [site.clone(), LAST_COMMENTS_SCOPE.to_string()]);
    let data = state.data.clone();
    let link = state.settings.remark_url.clone();
    cached_json(&state.cache, &key, || async move {
        let mut comments = data.last(&site, FEED_SIZE, None, false).await?;
        data.prepare_for_viewer(&mut comments, None).await;
        Ok(Feed::new(format!("last comments on {site}"), link, &comments))
    })
    .await
}

/// `GET /feed/reply?site=&user=`, newest replies to the user's comments first.
pub async fn reply(State(state): State<AppState>, params: Params, uri: Uri) -> Result<Response, ApiError> {
    let site = params.site()?.to_string();
    let user = params.require("user")?.to_string();
    let key = request_key(&site, &uri, None, [site.clone(), LAST_COMMENTS_SCOPE.to_string(), user.clone()]);
    let data = state.data.clone();
    let link = state.settings.remark_url.clone();
    cached_json(&state.cache, &key, || async move {
        let mut comments = data.replies(&site, &user, FEED_SIZE, None).await?;
        data.prepare_for_viewer(&mut comments, None).await;
        Ok(Feed::new(format!("replies to {user}"), link, &comments))
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use domains::{Locator, User};

    fn comment(id: &str, text: &str, minute: u32) -> Comment {
        Comment {
            id: id.into(),
            text: text.into(),
            locator: Locator::new("site", "https://blog.example/post"),
            user: User { id: "u1".into(), name: "alice".into(), ..Default::default() },
            post_title: "Post".into(),
            timestamp: "2024-05-01T10:00:00Z".parse::<DateTime<Utc>>().unwrap() + chrono::Duration::minutes(minute.into()),
            ..Default::default()
        }
    }

    #[test]
    fn feed_items_skip_deleted_and_link_comments() {
        let mut gone = comment("c3", "", 3);
        gone.deleted = true;
        let comments = vec![comment("c2", "<p>second &amp; last</p>", 2), comment("c1", "<p>first</p>", 1), gone];
        let feed = Feed::new("t".into(), "https://blog.example".into(), &comments);

        assert_eq!(feed.items.len(), 2);
        assert_eq!(feed.items[0].description, "second & last");
        assert_eq!(feed.items[0].title, "alice > Post");
        assert_eq!(feed.items[1].link, "https://blog.example/post#comment-c1");
        assert_eq!(feed.updated, Some(comments[0].timestamp));
    }
}

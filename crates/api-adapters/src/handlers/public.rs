//! Anonymous-friendly reads. Signed-in callers get their own vote filled in.

use auth_adapters::MaybeUser;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use domains::{Comment, PostInfo, SearchQuery, SearchSort, LAST_COMMENTS_SCOPE};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use services::{SearchResults, Tree};

use super::{decode_json, prepare_tree, Params};
use crate::cache::{cached_json, request_key};
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Serialize)]
#[serde(untagged)]
enum FindResponse {
    Tree(Tree),
    Plain { comments: Vec<Comment>, info: PostInfo },
}

/// `GET /find?site=&url=&sort=&format=tree|plain`
pub async fn find(
    State(state): State<AppState>,
    MaybeUser(viewer): MaybeUser,
    params: Params,
    uri: Uri,
) -> Result<Response, ApiError> {
    let locator = params.locator()?;
    let sort = params.sort()?;
    let plain = params.get("format") == Some("plain");
    let key = request_key(&locator.site_id, &uri, viewer.as_ref(), [locator.site_id.clone(), locator.url.clone()]);
    let data = state.data.clone();
    cached_json(&state.cache, &key, || async move {
        if plain {
            let mut comments = data.find(&locator, sort).await?;
            data.prepare_for_viewer(&mut comments, viewer.as_ref()).await;
            let info = data.info(&locator).await?;
            return Ok(FindResponse::Plain { comments, info });
        }
        let mut tree = data.tree(&locator, sort).await?;
        prepare_tree(&data, &mut tree, viewer.as_ref()).await;
        Ok(FindResponse::Tree(tree))
    })
    .await
}

/// `GET /id/{id}?site=&url=`
pub async fn comment_by_id(
    State(state): State<AppState>,
    MaybeUser(viewer): MaybeUser,
    Path(id): Path<String>,
    params: Params,
) -> Result<Json<Comment>, ApiError> {
    let locator = params.locator()?;
    let mut comment = state.data.get(&locator, &id).await?;
    if comment.is_hard_deleted() {
        return Err(domains::AppError::CommentNotFound(id).into());
    }
    state.data.prepare_for_viewer(std::slice::from_mut(&mut comment), viewer.as_ref()).await;
    Ok(Json(comment))
}

/// `GET /last/{limit}?site=&since=`
pub async fn last(
    State(state): State<AppState>,
    MaybeUser(viewer): MaybeUser,
    Path(limit): Path<usize>,
    params: Params,
    uri: Uri,
) -> Result<Response, ApiError> {
    let site = params.site()?.to_string();
    let since = params.since()?;
    let limit = limit.min(state.settings.max_last).max(1);
    let key = request_key(&site, &uri, viewer.as_ref(), [site.clone(), LAST_COMMENTS_SCOPE.to_string()]);
    let data = state.data.clone();
    cached_json(&state.cache, &key, || async move {
        let admin = viewer.as_ref().is_some_and(|u| u.admin);
        let mut comments = data.last(&site, limit, since, admin).await?;
        data.prepare_for_viewer(&mut comments, viewer.as_ref()).await;
        Ok(comments)
    })
    .await
}

/// `GET /comments?site=&user=&limit=&skip=`
pub async fn user_comments(
    State(state): State<AppState>,
    MaybeUser(viewer): MaybeUser,
    params: Params,
    uri: Uri,
) -> Result<Response, ApiError> {
    let site = params.site()?.to_string();
    let user = params.require("user")?.to_string();
    let limit = params.number("limit", 0usize)?;
    let skip = params.number("skip", 0usize)?;
    let key = request_key(&site, &uri, viewer.as_ref(), [site.clone(), user.clone()]);
    let data = state.data.clone();
    cached_json(&state.cache, &key, || async move {
        let mut comments = data.user(&site, &user, limit, skip).await?;
        data.prepare_for_viewer(&mut comments, viewer.as_ref()).await;
        let count = data.user_count(&site, &user).await?;
        Ok(json!({"comments": comments, "info": {"count": count}}))
    })
    .await
}

/// `GET /info?site=&url=`
pub async fn info(State(state): State<AppState>, params: Params, uri: Uri) -> Result<Response, ApiError> {
    let locator = params.locator()?;
    let key = request_key(&locator.site_id, &uri, None, [locator.site_id.clone(), locator.url.clone()]);
    let data = state.data.clone();
    cached_json(&state.cache, &key, || async move { data.info(&locator).await }).await
}

/// `GET /count?site=&url=`
pub async fn count(State(state): State<AppState>, params: Params) -> Result<Json<Value>, ApiError> {
    let locator = params.locator()?;
    let info = state.data.info(&locator).await?;
    Ok(Json(json!({"url": locator.url, "count": info.count})))
}

/// `POST /counts?site=` with a JSON array of urls.
pub async fn counts(State(state): State<AppState>, params: Params, body: Bytes) -> Result<Json<Vec<PostInfo>>, ApiError> {
    let site = params.site()?;
    let urls: Vec<String> = decode_json(&body)?;
    Ok(Json(state.data.counts(site, &urls).await?))
}

/// `GET /list?site=&limit=&skip=`
pub async fn list(State(state): State<AppState>, params: Params, uri: Uri) -> Result<Response, ApiError> {
    let site = params.site()?.to_string();
    let limit = params.number("limit", 0usize)?;
    let skip = params.number("skip", 0usize)?;
    let key = request_key(&site, &uri, None, [site.clone()]);
    let data = state.data.clone();
    cached_json(&state.cache, &key, || async move { data.list(&site, limit, skip).await }).await
}

/// `GET /config?site=`
pub async fn config(State(state): State<AppState>, params: Params) -> Result<Json<Value>, ApiError> {
    let site = params.site()?;
    let cfg = state.data.config();
    let settings = &state.settings;
    Ok(Json(json!({
        "version": settings.version,
        "edit_duration": cfg.edit_duration.num_seconds(),
        "max_comment_size": cfg.max_comment_size,
        "admins": state.data.admins(site).await?,
        "admin_email": state.data.admin_email(site).await?,
        "auth_providers": state.auth_service.providers(),
        "low_score": settings.low_score,
        "critical_score": settings.critical_score,
        "positive_score": cfg.positive_score,
        "readonly_age": cfg.read_only_age.num_days(),
        "max_votes": cfg.max_votes,
        "telegram_notifications": state.telegram.is_some(),
    })))
}

#[derive(Debug, Default, Deserialize)]
struct PreviewRequest {
    #[serde(default)]
    text: String,
}

/// `POST /preview` renders a comment without storing it.
pub async fn preview(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let req: PreviewRequest = decode_json(&body)?;
    let html = state.data.preview(&req.text)?;
    Ok(([(CONTENT_TYPE, "text/html; charset=utf-8")], html).into_response())
}

/// `GET /search?site=&query=&sort=&skip=&limit=`
pub async fn search(
    State(state): State<AppState>,
    MaybeUser(viewer): MaybeUser,
    params: Params,
) -> Result<Json<SearchResults>, ApiError> {
    let Some(search) = &state.search else {
        return Err(ApiError::NotFound("search".into()));
    };
    let query = SearchQuery {
        site_id: params.site()?.to_string(),
        query: params.require("query")?.to_string(),
        sort: params.get("sort").map_or(Ok(SearchSort::default()), |s| s.parse().map_err(ApiError::BadRequest))?,
        skip: params.number("skip", 0usize)?,
        limit: params.number("limit", 20usize)?,
    };
    let mut results = search.search(query).await?;
    state.data.prepare_for_viewer(&mut results.comments, viewer.as_ref()).await;
    Ok(Json(results))
}

pub async fn ping() -> impl IntoResponse {
    (StatusCode::OK, "pong")
}

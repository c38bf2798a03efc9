//! Response caching for read endpoints. The request URI is the key id; admins and
//! signed-in users get their own entries since both see different renderings.

use std::future::Future;

use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use domains::{AppError, CacheKey, User};
use serde::Serialize;
use storage_adapters::LoadingCache;

use crate::error::ApiError;

pub fn request_key<I, S>(site_id: &str, uri: &Uri, viewer: Option<&User>, scopes: I) -> CacheKey
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let uri = uri.path_and_query().map(|p| p.as_str()).unwrap_or_else(|| uri.path());
    let id = match viewer {
        Some(user) if !user.admin => format!("{uri}!!{}", user.id),
        _ => uri.to_string(),
    };
    CacheKey::new(site_id).id(id).admin(viewer.is_some_and(|u| u.admin)).scopes(scopes)
}

pub fn json_response(data: Bytes) -> Response {
    ([(CONTENT_TYPE, HeaderValue::from_static("application/json; charset=utf-8"))], data).into_response()
}

/// Serves the JSON rendering of `load` through the cache.
pub async fn cached_json<T, F, Fut>(cache: &LoadingCache, key: &CacheKey, load: F) -> Result<Response, ApiError>
where
    T: Serialize,
    F: FnOnce() -> Fut,
    Fut: Future<Output = domains::Result<T>>,
{
    let data = cache
        .get(key, move || async move {
            let value = load().await?;
            serde_json::to_vec(&value).map(Bytes::from).map_err(|e| AppError::Internal(e.into()))
        })
        .await?;
    Ok(json_response(data))
}

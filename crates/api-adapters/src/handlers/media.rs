//! Avatars and the post info stream.

use std::convert::Infallible;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE, ETAG, IF_NONE_MATCH};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use tracing::debug;

use super::Params;
use crate::error::ApiError;
use crate::state::AppState;

/// `GET /avatar/{name}`
pub async fn avatar(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let Some(store) = &state.avatars else {
        return Err(ApiError::NotFound("avatars".into()));
    };
    if name.contains('/') || name.contains("..") {
        return Err(ApiError::BadRequest(format!("bad avatar name {name:?}")));
    }
    let fingerprint = store.id(&name).await.map_err(|_| ApiError::NotFound(name.clone()))?;
    let etag = format!("\"{fingerprint}\"");
    if headers.get(IF_NONE_MATCH).and_then(|v| v.to_str().ok()) == Some(etag.as_str()) {
        return Ok(StatusCode::NOT_MODIFIED.into_response());
    }
    let data = store.get(&name).await.map_err(|e| {
        debug!("avatar {name} unavailable, {e}");
        ApiError::NotFound(name.clone())
    })?;

    let mut resp = data.into_response();
    let out = resp.headers_mut();
    out.insert(CONTENT_TYPE, HeaderValue::from_static("image/png"));
    out.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=604800"));
    if let Ok(v) = HeaderValue::from_str(&etag) {
        out.insert(ETAG, v);
    }
    Ok(resp)
}

/// `GET /stream/info?site=&url=` sends newline-delimited `PostInfo` on every change.
pub async fn stream_info(State(state): State<AppState>, params: Params) -> Result<Response, ApiError> {
    let locator = params.locator()?;
    let slot = state.streamer.try_acquire().ok_or(ApiError::TooManyStreams)?;
    let data = state.data.clone();
    let updates = state.streamer.updates(slot, move || {
        let (data, locator) = (data.clone(), locator.clone());
        async move {
            match data.info(&locator).await {
                Ok(info) => Some(info),
                Err(e) => {
                    debug!("info stream for {locator} ends, {e}");
                    None
                }
            }
        }
    });
    let body = Body::from_stream(updates.filter_map(|info| async move {
        let mut line = serde_json::to_vec(&info).ok()?;
        line.push(b'\n');
        Some(Ok::<_, Infallible>(Bytes::from(line)))
    }));
    Ok(([(CONTENT_TYPE, "application/x-ndjson")], body).into_response())
}

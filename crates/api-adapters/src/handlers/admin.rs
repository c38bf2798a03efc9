//! Moderation endpoints under `/api/v1/admin`. Run behind `auth` and `admin_only`.

use auth_adapters::AuthUser;
use axum::extract::{Path, State};
use axum::Json;
use domains::{AppError, BlockedUser, DeleteMode};
use serde_json::{json, Value};
use tracing::info;

use super::Params;
use crate::error::ApiError;
use crate::state::AppState;

fn delete_mode(params: &Params, default: DeleteMode) -> Result<DeleteMode, ApiError> {
    params.get("mode").map_or(Ok(default), |m| m.parse().map_err(ApiError::BadRequest))
}

/// Block duration from `ttl`, in seconds or with an `m`/`h`/`d` suffix. Absent or zero is permanent.
fn parse_ttl(raw: Option<&str>) -> Result<Option<chrono::Duration>, ApiError> {
    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
        return Ok(None);
    };
    let (digits, unit) = match raw.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => (&raw[..i], c),
        _ => (raw, 's'),
    };
    let n: i64 = digits.parse().map_err(|_| ApiError::BadRequest(format!("bad ttl {raw:?}")))?;
    let ttl = match unit {
        's' => chrono::Duration::seconds(n),
        'm' => chrono::Duration::minutes(n),
        'h' => chrono::Duration::hours(n),
        'd' => chrono::Duration::days(n),
        _ => return Err(ApiError::BadRequest(format!("bad ttl unit in {raw:?}"))),
    };
    Ok((ttl > chrono::Duration::zero()).then_some(ttl))
}

/// `DELETE /admin/comment/{id}?site=&url=&mode=`
pub async fn delete_comment(
    State(state): State<AppState>,
    AuthUser(admin): AuthUser,
    Path(id): Path<String>,
    params: Params,
) -> Result<Json<Value>, ApiError> {
    let locator = params.locator()?;
    let mode = delete_mode(&params, DeleteMode::Soft)?;
    state.data.delete(&locator, &id, mode).await?;
    info!(admin = %admin.id, id, %locator, ?mode, "comment deleted by admin");
    Ok(Json(json!({"id": id, "locator": locator})))
}

/// `DELETE /admin/user/{user_id}?site=&mode=`
pub async fn delete_user(
    State(state): State<AppState>,
    AuthUser(admin): AuthUser,
    Path(user_id): Path<String>,
    params: Params,
) -> Result<Json<Value>, ApiError> {
    let site = params.site()?;
    let mode = delete_mode(&params, DeleteMode::Hard)?;
    state.data.delete_user(site, &user_id, mode).await?;
    info!(admin = %admin.id, user = user_id, site, ?mode, "user deleted by admin");
    Ok(Json(json!({"user_id": user_id, "site_id": site})))
}

/// `PUT /admin/user/{user_id}?site=&block=1&ttl=`
pub async fn block_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    params: Params,
) -> Result<Json<Value>, ApiError> {
    let site = params.site()?;
    let status = params.flag("block");
    let ttl = parse_ttl(params.get("ttl"))?;
    state.data.set_block(site, &user_id, status, ttl).await?;
    Ok(Json(json!({"user_id": user_id, "site_id": site, "block": status})))
}

/// `GET /admin/blocked?site=`
pub async fn blocked(State(state): State<AppState>, params: Params) -> Result<Json<Vec<BlockedUser>>, ApiError> {
    Ok(Json(state.data.blocked_users(params.site()?).await?))
}

/// `PUT /admin/verify/{user_id}?site=&verified=1`
pub async fn verify_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    params: Params,
) -> Result<Json<Value>, ApiError> {
    let site = params.site()?;
    let status = params.flag("verified");
    state.data.set_verified(site, &user_id, status).await?;
    Ok(Json(json!({"user": user_id, "verified": status})))
}

/// `PUT /admin/pin/{id}?site=&url=&pin=1`
pub async fn pin(State(state): State<AppState>, Path(id): Path<String>, params: Params) -> Result<Json<Value>, ApiError> {
    let locator = params.locator()?;
    let status = params.flag("pin");
    state.data.set_pin(&locator, &id, status).await?;
    Ok(Json(json!({"id": id, "pin": status})))
}

/// `PUT /admin/readonly?site=&url=&ro=1`
pub async fn read_only(State(state): State<AppState>, params: Params) -> Result<Json<Value>, ApiError> {
    let locator = params.locator()?;
    let status = params.flag("ro");
    state.data.set_read_only(&locator, status).await?;
    Ok(Json(json!({"locator": locator, "read_only": status})))
}

/// `PUT /admin/title/{id}?site=&url=` refreshes the post title from the page.
pub async fn title(State(state): State<AppState>, Path(id): Path<String>, params: Params) -> Result<Json<Value>, ApiError> {
    let locator = params.locator()?;
    // the id only has to exist, the title applies to the whole post
    state.data.get(&locator, &id).await?;
    let title = state.data.set_title(&locator).await?;
    Ok(Json(json!({"id": id, "title": title})))
}

/// `GET /admin/deleteme?token=` erases everything of the user who requested it.
pub async fn delete_me(
    State(state): State<AppState>,
    AuthUser(admin): AuthUser,
    params: Params,
) -> Result<Json<Value>, ApiError> {
    let claims = state.tokens().parse(params.require("token")?)?;
    let Some(user) = claims.user.as_ref().filter(|_| claims.flags.delete_me) else {
        return Err(AppError::ActionRejected("not a delete-me token".into()).into());
    };
    if state.tokens().is_expired(&claims) {
        return Err(AppError::ActionRejected("delete-me token expired".into()).into());
    }
    state.data.delete_user(&claims.audience, &user.id, DeleteMode::Hard).await?;
    if let Some(avatars) = &state.avatars {
        let avatar = storage_adapters::FsAvatarStore::avatar_name(&user.id);
        if let Err(e) = avatars.remove(&avatar).await {
            tracing::debug!("no avatar removed for {}, {e}", user.id);
        }
    }
    info!(admin = %admin.id, user = %user.id, site = claims.audience, "user data erased on request");
    Ok(Json(json!({"user_id": user.id, "site_id": claims.audience})))
}

/// `POST /admin/reindex?site=`
pub async fn reindex(State(state): State<AppState>, params: Params) -> Result<Json<Value>, ApiError> {
    let Some(search) = &state.search else {
        return Err(ApiError::NotFound("search".into()));
    };
    let site = params.site()?;
    let indexed = search.reindex(site).await?;
    Ok(Json(json!({"site": site, "indexed": indexed})))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_forms() {
        assert_eq!(parse_ttl(None).unwrap(), None);
        assert_eq!(parse_ttl(Some("0")).unwrap(), None);
        assert_eq!(parse_ttl(Some("90")).unwrap(), Some(chrono::Duration::seconds(90)));
        assert_eq!(parse_ttl(Some("15m")).unwrap(), Some(chrono::Duration::minutes(15)));
        assert_eq!(parse_ttl(Some("2d")).unwrap(), Some(chrono::Duration::days(2)));
        assert!(parse_ttl(Some("3w")).is_err());
        assert!(parse_ttl(Some("soon")).is_err());
    }
}

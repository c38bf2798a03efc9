//! Endpoints that need a signed-in user.

use auth_adapters::{AuthUser, Claims, Flags};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use domains::{AppError, Comment, UserDetail, VerificationRequest};
use serde::Deserialize;
use serde_json::{json, Value};
use services::utils::hash_ip;
use services::EditRequest;
use tracing::info;

use super::{decode_json, ClientIp, Params};
use crate::error::ApiError;
use crate::state::AppState;

/// `POST /comment`
pub async fn create_comment(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    ClientIp(ip): ClientIp,
    body: Bytes,
) -> Result<(StatusCode, Json<Comment>), ApiError> {
    let mut comment: Comment = decode_json(&body)?;
    comment.user = user.clone();
    comment.user.ip = hash_ip(&ip, &state.settings.secret);

    let mut created = state.data.create(comment).await?;
    state.notify.submit(created.clone()).await;
    state.data.prepare_for_viewer(std::slice::from_mut(&mut created), Some(&user)).await;
    Ok((StatusCode::CREATED, Json(created)))
}

#[derive(Debug, Default, Deserialize)]
struct EditBody {
    #[serde(default)]
    text: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    delete: bool,
}

/// `PUT /comment/{id}?site=&url=` edits or self-deletes within the edit window.
pub async fn edit_comment(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    params: Params,
    body: Bytes,
) -> Result<Json<Comment>, ApiError> {
    let locator = params.locator()?;
    let edit: EditBody = decode_json(&body)?;
    let req = EditRequest { orig: edit.text, summary: edit.summary, delete: edit.delete, admin: false };
    let mut comment = state.data.edit_comment(&locator, &id, &user.id, req).await?;
    state.data.prepare_for_viewer(std::slice::from_mut(&mut comment), Some(&user)).await;
    Ok(Json(comment))
}

/// `PUT /vote/{id}?site=&url=&vote=1|-1`
pub async fn vote(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    ClientIp(ip): ClientIp,
    Path(id): Path<String>,
    params: Params,
) -> Result<Json<Comment>, ApiError> {
    let locator = params.locator()?;
    let up = match params.require("vote")? {
        "1" | "+1" | " 1" => true,
        "-1" => false,
        other => return Err(ApiError::BadRequest(format!("bad vote {other:?}"))),
    };
    let ip_hash = hash_ip(&ip, &state.settings.secret);
    let mut comment = state.data.vote(&locator, &id, &user.id, &ip_hash, up).await?;
    state.data.prepare_for_viewer(std::slice::from_mut(&mut comment), Some(&user)).await;
    Ok(Json(comment))
}

/// `GET /user`
pub async fn whoami(AuthUser(user): AuthUser) -> Json<domains::User> {
    Json(user)
}

/// `GET /userdata?site=` returns everything stored about the caller.
pub async fn user_data(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    params: Params,
) -> Result<Json<Value>, ApiError> {
    let site = params.site()?;
    let comments = state.data.user(site, &user.id, 0, 0).await?;
    let email = state.data.user_detail(site, &user.id, UserDetail::Email).await.unwrap_or_default();
    let telegram = state.data.user_detail(site, &user.id, UserDetail::Telegram).await.unwrap_or_default();
    Ok(Json(json!({
        "user": user,
        "details": {"email": email, "telegram": telegram},
        "comments": comments,
    })))
}

/// `POST /deleteme?site=` issues a link an admin opens to erase the caller's data.
pub async fn delete_me(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    params: Params,
) -> Result<Json<Value>, ApiError> {
    let site = params.site()?;
    let claims = Claims {
        audience: site.to_string(),
        id: uuid::Uuid::new_v4().simple().to_string(),
        expires_at: (Utc::now() + state.settings.delete_me_ttl).timestamp(),
        user: Some(user.clone()),
        flags: Flags { delete_me: true, ..Default::default() },
        ..Default::default()
    };
    let token = state.tokens().token(&claims)?;
    let link = format!("{}/web/deleteme.html?token={token}", state.settings.remark_url);
    info!(user = %user.id, site, "delete-me requested");
    Ok(Json(json!({"site": site, "user_id": user.id, "token": token, "link": link})))
}

/// `POST /email/subscribe?site=&address=` sends a confirmation token to the address.
pub async fn email_subscribe(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    params: Params,
) -> Result<Json<Value>, ApiError> {
    let site = params.site()?;
    let address = params.require("address")?.trim();
    if !address.contains('@') || address.len() > 254 {
        return Err(ApiError::BadRequest(format!("bad email address {address:?}")));
    }
    let claims = Claims {
        audience: site.to_string(),
        id: address.to_string(),
        expires_at: (Utc::now() + state.settings.subscribe_ttl).timestamp(),
        user: Some(user.clone()),
        flags: Flags { subscribe: true, ..Default::default() },
        ..Default::default()
    };
    let token = state.tokens().token(&claims)?;
    state
        .notify
        .submit_verification(VerificationRequest {
            site_id: site.to_string(),
            user: user.name.clone(),
            email: address.to_string(),
            token,
            ..Default::default()
        })
        .await;
    Ok(Json(json!({"user": user.id, "address": address})))
}

/// `POST /email/confirm?site=&tkn=`
pub async fn email_confirm(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    params: Params,
) -> Result<Json<Value>, ApiError> {
    let site = params.site()?;
    let claims = state.tokens().parse(params.require("tkn")?)?;
    let owner = claims.user.as_ref().map(|u| u.id.as_str());
    if !claims.flags.subscribe || claims.audience != site || owner != Some(user.id.as_str()) {
        return Err(AppError::NoAccess("confirmation token doesn't belong to this user".into()).into());
    }
    if state.tokens().is_expired(&claims) {
        return Err(AppError::ActionRejected("confirmation token expired".into()).into());
    }
    state.data.set_user_detail(site, &user.id, UserDetail::Email, &claims.id).await?;
    info!(user = %user.id, site, "email subscription confirmed");
    Ok(Json(json!({"updated": true, "address": claims.id})))
}

/// `GET /telegram/subscribe?site=[&tkn=]` hands out a bot link, then links the chat
/// once the user sent `/start <token>` to the bot.
pub async fn telegram_subscribe(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    params: Params,
) -> Result<Json<Value>, ApiError> {
    let site = params.site()?;
    let Some(telegram) = &state.telegram else {
        return Err(ApiError::NotFound("telegram notifications".into()));
    };
    let Some(token) = params.get("tkn") else {
        let bot = telegram.bot_name().await?;
        let token = telegram.subscription_token();
        return Ok(Json(json!({"bot": bot, "token": token})));
    };
    let Some(sub) = telegram.take_subscription(token) else {
        return Err(AppError::ActionRejected("request is not confirmed yet".into()).into());
    };
    state.data.set_user_detail(site, &user.id, UserDetail::Telegram, &sub.chat_id).await?;
    info!(user = %user.id, site, "telegram subscription confirmed");
    Ok(Json(json!({"updated": true, "address": sub.name})))
}

/// `DELETE /email?site=`
pub async fn email_unsubscribe(state: State<AppState>, user: AuthUser, params: Params) -> Result<Json<Value>, ApiError> {
    unsubscribe(state, user, params, UserDetail::Email).await
}

/// `DELETE /telegram?site=`
pub async fn telegram_unsubscribe(state: State<AppState>, user: AuthUser, params: Params) -> Result<Json<Value>, ApiError> {
    unsubscribe(state, user, params, UserDetail::Telegram).await
}

async fn unsubscribe(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    params: Params,
    detail: UserDetail,
) -> Result<Json<Value>, ApiError> {
    let site = params.site()?;
    state.data.delete_user_detail(site, &user.id, detail).await?;
    Ok(Json(json!({"deleted": true})))
}

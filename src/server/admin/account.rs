use std::sync::Arc;

use axum::http::HeaderMap;
use axum::{Json, extract::State};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::Result;
use crate::server::{AppState, auth};

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<Value>> {
    let token = auth::login(&state, &req.username, &req.password).await?;
    tracing::info!("{} | 登录成功", req.username);
    Ok(Json(json!({
        "access_token": token,
        "token_type": "bearer",
    })))
}

pub async fn me(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    let user = auth::require_admin(&state, &headers).await?;
    Ok(Json(json!({
        "id": user.id,
        "username": user.username,
        "api_key": user.api_key,
        "is_admin": user.is_admin,
    })))
}

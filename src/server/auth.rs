use axum::http::HeaderMap;
use chrono::{Duration, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{GatewayError, Result};
use crate::store::types::User;
use crate::store::users::verify_password;

use super::AppState;

pub const SESSION_TTL_DAYS: i64 = 7;

/// 64 位十六进制随机令牌，用作 API Key / 会话令牌 / 签名密钥
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// 会话令牌入库前做带密钥的摘要，泄库不泄话
pub fn hash_session_token(secret_key: &str, token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret_key.as_bytes());
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

/// `/v1` 推理面鉴权：Bearer API Key 对应启用用户
pub async fn require_api_user(state: &AppState, headers: &HeaderMap) -> Result<User> {
    let Some(api_key) = bearer_token(headers) else {
        return Err(GatewayError::Unauthorized("缺少 API Key".into()));
    };
    match state.store.get_user_by_api_key(&api_key).await? {
        Some(user) => Ok(user),
        None => Err(GatewayError::Unauthorized("无效的 API Key".into())),
    }
}

/// `/api` 管理面鉴权：Bearer 会话令牌，要求管理员身份
pub async fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<User> {
    let Some(token) = bearer_token(headers) else {
        return Err(GatewayError::Unauthorized("缺少认证凭据".into()));
    };
    let token_hash = hash_session_token(&state.secret_key, &token);
    let Some(username) = state.store.get_admin_session(&token_hash).await? else {
        return Err(GatewayError::Unauthorized("无效的认证凭据".into()));
    };
    let Some(user) = state.store.get_user_by_username(&username).await? else {
        return Err(GatewayError::Unauthorized("用户不存在或已禁用".into()));
    };
    if !user.is_active {
        return Err(GatewayError::Unauthorized("用户不存在或已禁用".into()));
    }
    if !user.is_admin {
        return Err(GatewayError::Unauthorized("需要管理员权限".into()));
    }
    Ok(user)
}

/// 校验用户名密码并签发会话令牌
pub async fn login(state: &AppState, username: &str, password: &str) -> Result<String> {
    let Some(user) = state.store.get_user_by_username(username).await? else {
        return Err(GatewayError::Unauthorized("用户名或密码错误".into()));
    };
    if !user.is_active || !verify_password(password, &user.hashed_password) {
        return Err(GatewayError::Unauthorized("用户名或密码错误".into()));
    }

    let token = generate_token();
    let token_hash = hash_session_token(&state.secret_key, &token);
    state
        .store
        .create_admin_session(&token_hash, &user.username, Utc::now() + Duration::days(SESSION_TTL_DAYS))
        .await?;
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_are_unique_hex() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn session_hash_depends_on_secret() {
        let h1 = hash_session_token("secret-a", "token");
        let h2 = hash_session_token("secret-b", "token");
        assert_ne!(h1, h2);
        assert_eq!(h1, hash_session_token("secret-a", "token"));
    }

    #[test]
    fn bearer_token_strips_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer sk-abc".parse().unwrap(),
        );
        assert_eq!(bearer_token(&headers).as_deref(), Some("sk-abc"));

        let empty = HeaderMap::new();
        assert!(bearer_token(&empty).is_none());
    }
}

use chrono::{DateTime, Utc};
use rusqlite::Row;

use super::Store;
use super::time;
use super::types::User;
use crate::error::{GatewayError, Result};

pub(crate) fn hash_password(password: &str) -> Result<String> {
    use argon2::{
        Argon2, PasswordHasher,
        password_hash::{SaltString, rand_core::OsRng},
    };

    let salt = SaltString::generate(&mut OsRng);
    let hashed = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| GatewayError::Config(format!("password hash failed: {}", e)))?
        .to_string();
    Ok(hashed)
}

pub(crate) fn verify_password(password: &str, password_hash: &str) -> bool {
    use argon2::{Argon2, PasswordVerifier, password_hash::PasswordHash};

    let Ok(parsed) = PasswordHash::new(password_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    let is_admin: i64 = row.get(4)?;
    let is_active: i64 = row.get(5)?;
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        hashed_password: row.get(2)?,
        api_key: row.get(3)?,
        is_admin: is_admin == 1,
        is_active: is_active == 1,
    })
}

const USER_COLUMNS: &str = "id, username, hashed_password, api_key, is_admin, is_active";

impl Store {
    /// 启动引导：确保管理员存在；`force_password` 为真时用当前密码覆盖旧哈希
    pub async fn ensure_admin(
        &self,
        username: &str,
        password: &str,
        force_password: bool,
    ) -> Result<()> {
        let hashed_if_needed;
        {
            let conn = self.connection.lock().await;
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM users WHERE username = ?1",
                [username],
                |row| row.get(0),
            )?;
            hashed_if_needed = count == 0 || force_password;
        }
        if !hashed_if_needed {
            return Ok(());
        }

        // argon2 在连接锁外计算
        let hashed = hash_password(password)?;
        let api_key = crate::server::auth::generate_token();

        let conn = self.connection.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM users WHERE username = ?1",
            [username],
            |row| row.get(0),
        )?;
        if count == 0 {
            conn.execute(
                "INSERT INTO users (username, hashed_password, api_key, is_admin) VALUES (?1, ?2, ?3, 1)",
                (username, &hashed, &api_key),
            )?;
            tracing::info!(username, "Created admin user");
        } else if force_password {
            conn.execute(
                "UPDATE users SET hashed_password = ?1 WHERE username = ?2",
                (&hashed, username),
            )?;
            tracing::info!(username, "Updated admin password from environment");
        }
        Ok(())
    }

    /// API Key 鉴权查找，只返回启用用户
    pub async fn get_user_by_api_key(&self, api_key: &str) -> Result<Option<User>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM users WHERE api_key = ?1 AND is_active = 1",
            USER_COLUMNS
        ))?;
        let mut rows = stmt.query_map([api_key], user_from_row)?;
        match rows.next() {
            Some(u) => Ok(Some(u?)),
            None => Ok(None),
        }
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM users WHERE username = ?1",
            USER_COLUMNS
        ))?;
        let mut rows = stmt.query_map([username], user_from_row)?;
        match rows.next() {
            Some(u) => Ok(Some(u?)),
            None => Ok(None),
        }
    }

    pub async fn create_admin_session(
        &self,
        token_hash: &str,
        username: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.connection.lock().await;
        // 顺手清掉过期会话
        conn.execute(
            "DELETE FROM admin_sessions WHERE expires_at < ?1",
            [time::to_utc_string(&Utc::now())],
        )?;
        conn.execute(
            "INSERT OR REPLACE INTO admin_sessions (token_hash, username, expires_at) VALUES (?1, ?2, ?3)",
            (token_hash, username, time::to_utc_string(&expires_at)),
        )?;
        Ok(())
    }

    /// 会话有效则返回用户名
    pub async fn get_admin_session(&self, token_hash: &str) -> Result<Option<String>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "SELECT username, expires_at FROM admin_sessions WHERE token_hash = ?1",
        )?;
        let mut rows = stmt.query_map([token_hash], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let Some(pair) = rows.next() else {
            return Ok(None);
        };
        let (username, expires_at) = pair?;
        if time::parse_utc_string(&expires_at)? < Utc::now() {
            return Ok(None);
        }
        Ok(Some(username))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::open_temp;
    use chrono::Duration;

    #[tokio::test]
    async fn ensure_admin_is_idempotent() {
        let (_dir, store) = open_temp().await;
        store.ensure_admin("admin", "admin123", false).await.unwrap();
        store.ensure_admin("admin", "ignored", false).await.unwrap();

        let user = store.get_user_by_username("admin").await.unwrap().unwrap();
        assert!(user.is_admin);
        assert!(user.is_active);
        assert!(verify_password("admin123", &user.hashed_password));
        assert!(!verify_password("ignored", &user.hashed_password));
    }

    #[tokio::test]
    async fn ensure_admin_force_rehashes() {
        let (_dir, store) = open_temp().await;
        store.ensure_admin("admin", "admin123", false).await.unwrap();
        store.ensure_admin("admin", "s3cret", true).await.unwrap();

        let user = store.get_user_by_username("admin").await.unwrap().unwrap();
        assert!(verify_password("s3cret", &user.hashed_password));
    }

    #[tokio::test]
    async fn api_key_lookup_respects_active_flag() {
        let (_dir, store) = open_temp().await;
        store.ensure_admin("admin", "admin123", false).await.unwrap();
        let user = store.get_user_by_username("admin").await.unwrap().unwrap();

        let found = store.get_user_by_api_key(&user.api_key).await.unwrap();
        assert!(found.is_some());

        {
            let conn = store.connection.lock().await;
            conn.execute("UPDATE users SET is_active = 0 WHERE id = ?1", [user.id])
                .unwrap();
        }
        assert!(store.get_user_by_api_key(&user.api_key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn admin_sessions_expire() {
        let (_dir, store) = open_temp().await;
        store
            .create_admin_session("hash-live", "admin", Utc::now() + Duration::days(7))
            .await
            .unwrap();
        store
            .create_admin_session("hash-dead", "admin", Utc::now() - Duration::hours(1))
            .await
            .unwrap();

        assert_eq!(
            store.get_admin_session("hash-live").await.unwrap().as_deref(),
            Some("admin")
        );
        assert!(store.get_admin_session("hash-dead").await.unwrap().is_none());
    }
}

use std::env;

#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub database_path: String,
    /// 为空时启动阶段从数据库读取或生成
    pub secret_key: String,
    pub admin_username: String,
    pub admin_password: String,
}

impl Settings {
    pub fn load() -> Self {
        Self {
            host: get_env("HOST", "0.0.0.0"),
            port: get_env_parsed("PORT", 8050),
            database_path: get_env("DATABASE_PATH", "./data/gateway.db"),
            secret_key: get_env("SECRET_KEY", ""),
            admin_username: get_env("ADMIN_USERNAME", "admin"),
            admin_password: get_env("ADMIN_PASSWORD", "admin123"),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn get_env(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn get_env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_env_missing() {
        // 测试进程未设置这些变量时走默认值
        let settings = Settings::load();
        assert!(!settings.host.is_empty());
        assert!(settings.port > 0);
        assert!(!settings.database_path.is_empty());
    }

    #[test]
    fn addr_joins_host_and_port() {
        let settings = Settings {
            host: "127.0.0.1".into(),
            port: 9000,
            database_path: String::new(),
            secret_key: String::new(),
            admin_username: String::new(),
            admin_password: String::new(),
        };
        assert_eq!(settings.addr(), "127.0.0.1:9000");
    }
}

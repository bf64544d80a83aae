use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// 后端模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// In-process store, for local development.
    Memory,
    /// The hosted REST/auth/realtime backend.
    Hosted,
}

impl FromStr for BackendMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(BackendMode::Memory),
            "hosted" => Ok(BackendMode::Hosted),
            other => Err(anyhow::anyhow!("unknown BACKEND_MODE: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Server configuration
    pub server_host: String,
    pub server_port: u16,
    pub environment: String,
    pub log_level: String,

    // Backend configuration
    pub backend_mode: BackendMode,
    pub backend_url: String,
    pub backend_anon_key: String,
    pub bookmarks_table: String,
    pub request_timeout_secs: u64,

    // Realtime
    pub realtime_heartbeat_secs: u64,
    pub realtime_reconnect_secs: u64,

    // OAuth
    pub oauth_provider: String,
    pub oauth_redirect_url: String,

    // Frontend URLs
    pub dashboard_url: String,
    pub login_url: String,

    // Sync behaviour
    pub rollback_failed_deletes: bool,
    pub copy_feedback_ms: u64,

    // Memory backend identity
    pub local_user_id: String,
    pub local_user_email: String,

    // CORS configuration
    pub cors_allowed_origins: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server_host: "0.0.0.0".to_string(),
            server_port: 3000,
            environment: "development".to_string(),
            log_level: "info".to_string(),

            backend_mode: BackendMode::Memory,
            backend_url: String::new(),
            backend_anon_key: String::new(),
            bookmarks_table: "bookmarks".to_string(),
            request_timeout_secs: 30,

            realtime_heartbeat_secs: 30,
            realtime_reconnect_secs: 5,

            oauth_provider: "google".to_string(),
            oauth_redirect_url: "http://localhost:3000/api/vault/auth/callback".to_string(),

            dashboard_url: "http://localhost:3001/dashboard".to_string(),
            login_url: "http://localhost:3001/".to_string(),

            rollback_failed_deletes: false,
            copy_feedback_ms: 2000,

            local_user_id: "local-user".to_string(),
            local_user_email: "local@linkvault.dev".to_string(),

            cors_allowed_origins: "http://localhost:3001".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Config::default();

        let backend_mode: BackendMode = env::var("BACKEND_MODE")
            .unwrap_or_else(|_| "memory".to_string())
            .parse()?;

        let backend_url = env::var("BACKEND_URL").unwrap_or_default();
        let backend_anon_key = env::var("BACKEND_ANON_KEY").unwrap_or_default();

        let config = Config {
            server_host: env::var("SERVER_HOST").unwrap_or(defaults.server_host),
            server_port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()?,
            environment: env::var("ENVIRONMENT").unwrap_or(defaults.environment),
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),

            backend_mode,
            backend_url: backend_url.trim_end_matches('/').to_string(),
            backend_anon_key,
            bookmarks_table: env::var("BOOKMARKS_TABLE").unwrap_or(defaults.bookmarks_table),
            request_timeout_secs: env::var("REQUEST_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()?,

            realtime_heartbeat_secs: env::var("REALTIME_HEARTBEAT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()?,
            realtime_reconnect_secs: env::var("REALTIME_RECONNECT_SECS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()?,

            oauth_provider: env::var("OAUTH_PROVIDER").unwrap_or(defaults.oauth_provider),
            oauth_redirect_url: env::var("OAUTH_REDIRECT_URL").unwrap_or(defaults.oauth_redirect_url),

            dashboard_url: env::var("DASHBOARD_URL").unwrap_or(defaults.dashboard_url),
            login_url: env::var("LOGIN_URL").unwrap_or(defaults.login_url),

            rollback_failed_deletes: env::var("ROLLBACK_FAILED_DELETES")
                .unwrap_or_else(|_| "false".to_string())
                .parse()?,
            copy_feedback_ms: env::var("COPY_FEEDBACK_MS")
                .unwrap_or_else(|_| "2000".to_string())
                .parse()?,

            local_user_id: env::var("LOCAL_USER_ID").unwrap_or(defaults.local_user_id),
            local_user_email: env::var("LOCAL_USER_EMAIL").unwrap_or(defaults.local_user_email),

            cors_allowed_origins: env::var("CORS_ALLOWED_ORIGINS")
                .unwrap_or(defaults.cors_allowed_origins),
        };

        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the services cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.backend_mode == BackendMode::Hosted
            && (self.backend_url.is_empty() || self.backend_anon_key.is_empty())
        {
            anyhow::bail!("BACKEND_URL and BACKEND_ANON_KEY must be set when BACKEND_MODE=hosted");
        }
        if self.realtime_heartbeat_secs == 0 {
            anyhow::bail!("REALTIME_HEARTBEAT_SECS must be greater than 0");
        }
        Ok(())
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn copy_feedback(&self) -> Duration {
        Duration::from_millis(self.copy_feedback_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_memory_backed() {
        let config = Config::default();
        assert_eq!(config.backend_mode, BackendMode::Memory);
        assert_eq!(config.bookmarks_table, "bookmarks");
        assert!(!config.rollback_failed_deletes);
        assert_eq!(config.copy_feedback(), Duration::from_secs(2));
        assert!(!config.is_production());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_heartbeat_is_rejected() {
        let config = Config {
            realtime_heartbeat_secs: 0,
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("REALTIME_HEARTBEAT_SECS"));
    }

    #[test]
    fn test_hosted_mode_requires_credentials() {
        let config = Config {
            backend_mode: BackendMode::Hosted,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            backend_mode: BackendMode::Hosted,
            backend_url: "https://project.example.co".to_string(),
            backend_anon_key: "anon".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backend_mode_parse() {
        assert_eq!("HOSTED".parse::<BackendMode>().unwrap(), BackendMode::Hosted);
        assert_eq!("memory".parse::<BackendMode>().unwrap(), BackendMode::Memory);
        assert!("sqlite".parse::<BackendMode>().is_err());
    }
}

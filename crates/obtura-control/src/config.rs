use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

const REDACTED: &str = "[redacted]";

/// Application configuration loaded from environment variables.
#[derive(Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub database_url: String,
    pub github: GithubConfig,
    pub provider_timeout: Duration,
    pub broker: BrokerConfig,
}

/// Credentials and endpoints for the GitHub App.
#[derive(Clone)]
pub struct GithubConfig {
    pub app_id: String,
    pub app_slug: String,
    pub webhook_secret: String,
    pub private_key_pem: String,
    pub api_url: String,
    pub web_url: String,
}

#[derive(Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub heartbeat: Duration,
    pub prefetch: u16,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub operation_timeout: Duration,
}

impl BrokerConfig {
    pub fn url(&self) -> String {
        format!("nats://{}:{}", self.host, self.port)
    }

    /// JetStream domain for the configured vhost; `/` is the default domain.
    pub fn domain(&self) -> Option<&str> {
        let vhost = self.vhost.trim_matches('/');
        (!vhost.is_empty()).then_some(vhost)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    MissingVar(String),
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: String, reason: String },
    #[error("cannot read private key {path}: {source}")]
    PrivateKey {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let key_path = env.required("GITHUB_PRIVATE_KEY_PATH")?;
        let private_key_pem =
            std::fs::read_to_string(&key_path).map_err(|source| ConfigError::PrivateKey {
                path: key_path.clone(),
                source,
            })?;

        let github = GithubConfig {
            app_id: env.required("GITHUB_APP_ID")?,
            app_slug: env.required("GITHUB_APP_SLUG")?,
            webhook_secret: env.required("GITHUB_WEBHOOK_SECRET")?,
            private_key_pem,
            api_url: env.or("GITHUB_API_URL", "https://api.github.com"),
            web_url: env.or("GITHUB_WEB_URL", "https://github.com"),
        };

        let broker = BrokerConfig {
            host: env.required("BROKER_HOST")?,
            port: env.parsed("BROKER_PORT", 4222)?,
            user: env.required("BROKER_USER")?,
            password: env.required("BROKER_PASSWORD")?,
            vhost: env.or("BROKER_VHOST", "/"),
            heartbeat: Duration::from_secs(env.parsed("BROKER_HEARTBEAT_SECS", 30)?),
            prefetch: env.parsed("BROKER_PREFETCH", 10)?,
            max_reconnect_attempts: env.parsed("BROKER_MAX_RECONNECT_ATTEMPTS", 10)?,
            reconnect_delay: Duration::from_millis(env.parsed("BROKER_RECONNECT_DELAY_MS", 5000)?),
            operation_timeout: Duration::from_secs(env.parsed("BROKER_TIMEOUT_SECS", 10)?),
        };

        Ok(Self {
            listen_addr: env.parsed("LISTEN_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            database_url: env.required("DATABASE_URL")?,
            github,
            provider_timeout: Duration::from_secs(env.parsed("PROVIDER_TIMEOUT_SECS", 10)?),
            broker,
        })
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.get(key)
            .ok_or_else(|| ConfigError::MissingVar(key.to_string()))
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn parsed<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                var: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("listen_addr", &self.listen_addr)
            .field("database_url", &REDACTED)
            .field("github", &self.github)
            .field("provider_timeout", &self.provider_timeout)
            .field("broker", &self.broker)
            .finish()
    }
}

impl fmt::Debug for GithubConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GithubConfig")
            .field("app_id", &self.app_id)
            .field("app_slug", &self.app_slug)
            .field("webhook_secret", &REDACTED)
            .field("private_key_pem", &REDACTED)
            .field("api_url", &self.api_url)
            .field("web_url", &self.web_url)
            .finish()
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &REDACTED)
            .field("vhost", &self.vhost)
            .field("heartbeat", &self.heartbeat)
            .field("prefetch", &self.prefetch)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("operation_timeout", &self.operation_timeout)
            .finish()
    }
}

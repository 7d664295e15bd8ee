use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context};
use serde::Deserialize;

const DEFAULT_ENV: &str = "local";
const ENV_VAR_NAME: &str = "FOLIO_ENV";
const CONFIG_DIR_ENV: &str = "FOLIO_CONFIG_DIR";
const ENV_PREFIX: &str = "FOLIO";

/// Deployment environment the application is running in.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Local,
    Staging,
    Production,
}

impl Environment {
    fn parse(value: &str) -> anyhow::Result<Self> {
        match value {
            "local" => Ok(Environment::Local),
            "staging" => Ok(Environment::Staging),
            "production" => Ok(Environment::Production),
            other => Err(anyhow!(
                "unsupported environment '{}'; expected local/staging/production",
                other
            )),
        }
    }
}

/// Top-level configuration structure loaded from layered sources.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub broker: BrokerSettings,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub telemetry: TelemetrySettings,
    #[serde(default)]
    pub auth: AuthSettings,
}

impl Settings {
    /// Load configuration by layering `.env`, base file, and environment overlay.
    pub fn load() -> anyhow::Result<Self> {
        // Allow missing `.env` files without failing.
        let _ = dotenvy::dotenv();

        let environment = std::env::var(ENV_VAR_NAME).unwrap_or_else(|_| DEFAULT_ENV.to_string());
        let config_dir = match std::env::var(CONFIG_DIR_ENV) {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => std::env::current_dir()
                .context("unable to resolve current directory")?
                .join("config"),
        };

        Self::load_from(&config_dir, &environment)
    }

    /// Load configuration from an explicit directory and environment name.
    ///
    /// `base.toml` is read first, then `{environment}.toml`, then `FOLIO_*`
    /// environment variables (`__` separates nested keys). Missing files are
    /// skipped.
    pub fn load_from(config_dir: &Path, environment: &str) -> anyhow::Result<Self> {
        let parsed_environment = Environment::parse(environment)?;

        let base_path = config_dir.join("base.toml");
        let environment_path = config_dir.join(format!("{}.toml", environment));

        let builder = config::Config::builder()
            .add_source(config::File::from(base_path).required(false))
            .add_source(config::File::from(environment_path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("server.allowed_origins")
                    .try_parsing(true),
            );

        let cfg = builder
            .build()
            .with_context(|| "failed to build configuration")?;

        let mut settings: Settings = cfg
            .try_deserialize()
            .with_context(|| "failed to deserialize configuration")?;

        // The environment comes from FOLIO_ENV, never from the files.
        settings.environment = parsed_environment;

        settings.validate()?;
        Ok(settings)
    }

    /// Reject combinations that load fine but misbehave at runtime.
    pub fn validate(&self) -> anyhow::Result<()> {
        let queue = &self.queue;

        // An HTTP drain cut off by the request timeout is interrupted mid-window.
        if queue.drain_window_ms >= self.server.request_timeout_ms {
            bail!(
                "queue.drain_window_ms ({}) must be shorter than server.request_timeout_ms ({})",
                queue.drain_window_ms,
                self.server.request_timeout_ms
            );
        }

        // Entries a live drain still holds must not look abandoned.
        if queue.reclaim_after_ms <= queue.drain_window_ms {
            bail!(
                "queue.reclaim_after_ms ({}) must be longer than queue.drain_window_ms ({})",
                queue.reclaim_after_ms,
                queue.drain_window_ms
            );
        }

        if self.environment != Environment::Local && self.auth.uses_default_secret() {
            bail!(
                "auth.jwt_secret is the development default; set FOLIO_AUTH__JWT_SECRET for {:?}",
                self.environment
            );
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "ServerSettings::default_host")]
    pub host: String,
    #[serde(default = "ServerSettings::default_port")]
    pub port: u16,
    #[serde(default = "ServerSettings::default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Origins allowed to call the API with credentials. Empty means any
    /// origin, without credentials.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl ServerSettings {
    fn default_host() -> String {
        "0.0.0.0".to_string()
    }

    fn default_port() -> u16 {
        8080
    }

    fn default_request_timeout_ms() -> u64 {
        15000
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
            request_timeout_ms: Self::default_request_timeout_ms(),
            allowed_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    /// `mongodb://...` / `mongodb+srv://...`, or `memory://` for a process-local store.
    #[serde(default = "DatabaseSettings::default_uri")]
    pub uri: String,
    #[serde(default = "DatabaseSettings::default_name")]
    pub name: String,
    #[serde(default = "DatabaseSettings::default_server_selection_timeout_ms")]
    pub server_selection_timeout_ms: u64,
}

impl DatabaseSettings {
    fn default_uri() -> String {
        "mongodb://127.0.0.1:27017".to_string()
    }

    fn default_name() -> String {
        "folio".to_string()
    }

    fn default_server_selection_timeout_ms() -> u64 {
        5000
    }
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            uri: Self::default_uri(),
            name: Self::default_name(),
            server_selection_timeout_ms: Self::default_server_selection_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerSettings {
    /// `redis://` / `rediss://` URL, or `memory://` for an in-process channel.
    #[serde(default = "BrokerSettings::default_url")]
    pub url: String,
}

impl BrokerSettings {
    fn default_url() -> String {
        "redis://127.0.0.1:6379".to_string()
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            url: Self::default_url(),
        }
    }
}

/// What a drain does with a record whose entity/action pair it does not know.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum UnsupportedPolicy {
    /// Treat it as a failed apply: requeue, dead-letter after the cap.
    #[default]
    Reject,
    /// Acknowledge it and count it as applied.
    Skip,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueSettings {
    #[serde(default = "QueueSettings::default_name")]
    pub name: String,
    #[serde(default = "QueueSettings::default_drain_window_ms")]
    pub drain_window_ms: u64,
    #[serde(default = "QueueSettings::default_prefetch")]
    pub prefetch: usize,
    /// Failed deliveries tolerated before a record is dead-lettered.
    /// `None` (`"unbounded"` in config) requeues forever.
    #[serde(
        default = "QueueSettings::default_max_redeliveries",
        deserialize_with = "deserialize_redelivery_cap"
    )]
    pub max_redeliveries: Option<u32>,
    #[serde(default)]
    pub dead_letter_queue: Option<String>,
    /// Idle time after which an unsettled delivery is considered abandoned
    /// by a dead consumer and returned to the queue.
    #[serde(default = "QueueSettings::default_reclaim_after_ms")]
    pub reclaim_after_ms: u64,
    #[serde(default)]
    pub unsupported: UnsupportedPolicy,
}

impl QueueSettings {
    fn default_name() -> String {
        "catalog-updates".to_string()
    }

    fn default_drain_window_ms() -> u64 {
        2000
    }

    fn default_prefetch() -> usize {
        10
    }

    fn default_max_redeliveries() -> Option<u32> {
        Some(5)
    }

    fn default_reclaim_after_ms() -> u64 {
        60_000
    }

    /// Dead-letter queue name, `<name>.dead` unless configured.
    pub fn dead_letter_name(&self) -> String {
        self.dead_letter_queue
            .clone()
            .unwrap_or_else(|| format!("{}.dead", self.name))
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            name: Self::default_name(),
            drain_window_ms: Self::default_drain_window_ms(),
            prefetch: Self::default_prefetch(),
            max_redeliveries: Self::default_max_redeliveries(),
            dead_letter_queue: None,
            reclaim_after_ms: Self::default_reclaim_after_ms(),
            unsupported: UnsupportedPolicy::default(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RedeliveryCap {
    Count(u32),
    Keyword(String),
}

fn deserialize_redelivery_cap<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    match RedeliveryCap::deserialize(deserializer)? {
        RedeliveryCap::Count(count) => Ok(Some(count)),
        RedeliveryCap::Keyword(keyword) if keyword == "unbounded" => Ok(None),
        RedeliveryCap::Keyword(other) => other.parse().map(Some).map_err(|_| {
            D::Error::custom(format!(
                "max_redeliveries must be a count or \"unbounded\", got '{}'",
                other
            ))
        }),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetrySettings {
    #[serde(default)]
    pub log_format: LogFormat,
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    #[serde(default = "TelemetrySettings::default_filter")]
    pub filter: String,
}

impl TelemetrySettings {
    fn default_filter() -> String {
        "info".to_string()
    }
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Pretty,
            filter: Self::default_filter(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthSettings {
    #[serde(default = "AuthSettings::default_jwt_secret")]
    pub jwt_secret: String,
    #[serde(default = "AuthSettings::default_token_cookie_name")]
    pub token_cookie_name: String,
    #[serde(default = "AuthSettings::default_token_ttl_secs")]
    pub token_ttl_secs: u64,
}

impl AuthSettings {
    fn default_jwt_secret() -> String {
        "dev_jwt_secret".to_string()
    }

    fn default_token_cookie_name() -> String {
        "token".to_string()
    }

    fn default_token_ttl_secs() -> u64 {
        2 * 60 * 60
    }

    pub fn uses_default_secret(&self) -> bool {
        self.jwt_secret == Self::default_jwt_secret()
    }
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: Self::default_jwt_secret(),
            token_cookie_name: Self::default_token_cookie_name(),
            token_ttl_secs: Self::default_token_ttl_secs(),
        }
    }
}

use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

fn default_gateway_host() -> String {
    "127.0.0.1".to_string()
}

fn default_gateway_port() -> u16 {
    8930
}

fn default_webhook_rate_limit() -> u32 {
    120
}

fn default_rate_limit_max_keys() -> usize {
    10_000
}

fn default_replay_ttl_secs() -> u64 {
    300
}

fn default_replay_max_entries() -> usize {
    5_000
}

fn default_max_body_bytes() -> usize {
    1_048_576
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_pipeline_timeout_secs() -> u64 {
    120
}

fn default_media_dir() -> String {
    "~/.instagate/media".to_string()
}

fn default_media_max_bytes() -> u64 {
    8 * 1024 * 1024
}

/// HTTP gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Gateway host (default: 127.0.0.1)
    #[serde(default = "default_gateway_host")]
    pub host: String,
    /// Gateway port (default: 8930)
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Max webhook POST requests per minute per (path, client) key.
    #[serde(default = "default_webhook_rate_limit")]
    pub webhook_rate_limit_per_minute: u32,
    /// Maximum distinct client keys tracked by the rate limiter map.
    #[serde(default = "default_rate_limit_max_keys")]
    pub rate_limit_max_keys: usize,
    /// Replay window for message-id deduplication, in seconds.
    #[serde(default = "default_replay_ttl_secs")]
    pub replay_ttl_secs: u64,
    /// Maximum message ids retained in the replay cache.
    #[serde(default = "default_replay_max_entries")]
    pub replay_max_entries: usize,
    /// Hard ceiling on webhook request bodies, in bytes (default: 1 MiB).
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Request timeout, in seconds (default: 30).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Trust proxy-forwarded client IP headers (`X-Forwarded-For`, `X-Real-IP`).
    /// Disabled by default; enable only behind a trusted reverse proxy.
    #[serde(default)]
    pub trust_forwarded_headers: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
            webhook_rate_limit_per_minute: default_webhook_rate_limit(),
            rate_limit_max_keys: default_rate_limit_max_keys(),
            replay_ttl_secs: default_replay_ttl_secs(),
            replay_max_entries: default_replay_max_entries(),
            max_body_bytes: default_max_body_bytes(),
            request_timeout_secs: default_request_timeout_secs(),
            trust_forwarded_headers: false,
        }
    }
}

/// Reply pipeline binding. When `url` is set, every accepted inbound event is
/// POSTed there as JSON and the response is expected to be an array of reply
/// payloads. When unset, the gateway logs inbound events and replies nothing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Reply pipeline endpoint (e.g. `http://127.0.0.1:9000/reply`).
    #[serde(default)]
    pub url: Option<String>,
    /// Per-event pipeline call timeout, in seconds.
    #[serde(default = "default_pipeline_timeout_secs")]
    pub timeout_secs: u64,
}

/// Inbound media storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Directory where fetched attachments are stored.
    #[serde(default = "default_media_dir")]
    pub dir: String,
    /// Maximum size for a single fetched attachment, in bytes (default: 8 MiB).
    #[serde(default = "default_media_max_bytes")]
    pub max_bytes: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            dir: default_media_dir(),
            max_bytes: default_media_max_bytes(),
        }
    }
}

/// Who may DM this account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DmPolicy {
    /// Accept DMs from anyone.
    Open,
    /// Accept DMs only from `allow_from` sender ids ("*" or empty list = all).
    #[default]
    Allowlist,
    /// Drop all DMs.
    Disabled,
}

/// One Instagram account fronted by this gateway. Several accounts may share
/// a webhook path; each carries its own verify token and app secret.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Stable identifier used in routing, logs, and the default webhook path.
    pub account_id: String,
    /// Page access token from Meta Business Suite.
    #[serde(default)]
    pub access_token: Option<String>,
    /// Instagram professional account / page id (webhook `recipient.id`).
    #[serde(default)]
    pub page_id: Option<String>,
    /// Webhook verify token (you define this, Meta echoes it back on GET).
    #[serde(default)]
    pub verify_token: Option<String>,
    /// App secret for `X-Hub-Signature-256` verification. When unset,
    /// signature checks are skipped for this account.
    #[serde(default)]
    pub app_secret: Option<String>,
    /// DM access policy (default: allowlist).
    #[serde(default)]
    pub dm_policy: DmPolicy,
    /// Allowed sender ids ("*" for all; empty under allowlist also allows all).
    #[serde(default)]
    pub allow_from: Vec<String>,
    /// Webhook path override (default: `/webhook/instagram/{account_id}`).
    #[serde(default)]
    pub webhook_path: Option<String>,
    /// Graph API version override (default: v21.0).
    #[serde(default)]
    pub api_version: Option<String>,
}

/// Top-level configuration, loaded from `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,

    #[serde(skip)]
    pub config_path: PathBuf,
}

/// Resolve the config directory: `$INSTAGATE_CONFIG_DIR` wins, then
/// `~/.instagate`.
pub fn config_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("INSTAGATE_CONFIG_DIR") {
        let dir = dir.trim();
        if !dir.is_empty() {
            return Ok(PathBuf::from(shellexpand::tilde(dir).into_owned()));
        }
    }

    let user_dirs = UserDirs::new().context("could not determine home directory")?;
    Ok(user_dirs.home_dir().join(".instagate"))
}

impl Config {
    /// Load config from `config.toml` in the config dir, writing a default
    /// file on first run.
    pub async fn load_or_init() -> Result<Self> {
        let dir = config_dir()?;
        let config_path = dir.join("config.toml");

        if config_path.exists() {
            return Self::load_from(&config_path).await;
        }

        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create config dir {}", dir.display()))?;

        let mut config = Self::default();
        config.config_path = config_path.clone();
        config.save().await?;
        tracing::info!(path = %config_path.display(), "wrote default config");
        Ok(config)
    }

    /// Load config from an explicit path.
    pub async fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let mut config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.config_path = path.to_path_buf();
        Ok(config)
    }

    pub async fn save(&self) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;
        fs::write(&self.config_path, contents)
            .await
            .with_context(|| format!("failed to write config {}", self.config_path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(config.gateway.webhook_rate_limit_per_minute, 120);
        assert_eq!(config.gateway.max_body_bytes, 1_048_576);
        assert_eq!(config.gateway.request_timeout_secs, 30);
        assert_eq!(config.gateway.replay_ttl_secs, 300);
        assert_eq!(config.gateway.replay_max_entries, 5_000);
        assert!(config.accounts.is_empty());
        assert!(config.pipeline.url.is_none());
    }

    #[test]
    fn minimal_account_toml_parses() {
        let config: Config = toml::from_str(
            r#"
            [[accounts]]
            account_id = "main"
            access_token = "EAAB..."
            page_id = "17841400000000000"
            verify_token = "hunter2"
            app_secret = "s3cr3t"
            allow_from = ["*"]
            "#,
        )
        .unwrap();

        assert_eq!(config.accounts.len(), 1);
        let acct = &config.accounts[0];
        assert_eq!(acct.account_id, "main");
        assert_eq!(acct.dm_policy, DmPolicy::Allowlist);
        assert_eq!(acct.allow_from, vec!["*".to_string()]);
        assert!(acct.webhook_path.is_none());
    }

    #[test]
    fn dm_policy_parses_lowercase() {
        let config: Config = toml::from_str(
            r#"
            [[accounts]]
            account_id = "locked"
            dm_policy = "disabled"
            "#,
        )
        .unwrap();
        assert_eq!(config.accounts[0].dm_policy, DmPolicy::Disabled);
    }

    #[test]
    fn gateway_overrides_apply() {
        let config: Config = toml::from_str(
            r#"
            [gateway]
            port = 9999
            trust_forwarded_headers = true
            webhook_rate_limit_per_minute = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.gateway.port, 9999);
        assert!(config.gateway.trust_forwarded_headers);
        assert_eq!(config.gateway.webhook_rate_limit_per_minute, 10);
        // Untouched fields keep their defaults.
        assert_eq!(config.gateway.rate_limit_max_keys, 10_000);
    }
}

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub destination: DestinationConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_rate_limit_retries")]
    pub max_rate_limit_retries: u32,
    #[serde(default = "default_retry_after_secs")]
    pub default_retry_after_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            page_size: default_page_size(),
            request_delay_ms: default_request_delay_ms(),
            timeout_secs: default_timeout_secs(),
            max_rate_limit_retries: default_max_rate_limit_retries(),
            default_retry_after_secs: default_retry_after_secs(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.omi.me/v1/dev".to_string()
}
fn default_page_size() -> usize {
    25
}
fn default_request_delay_ms() -> u64 {
    150
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_rate_limit_retries() -> u32 {
    5
}
fn default_retry_after_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct DestinationConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            url: None,
            username: None,
            password: None,
            output_dir: default_output_dir(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_output_dir() -> String {
    "/conversations".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            state_path: default_state_path(),
            concurrency: default_concurrency(),
        }
    }
}

fn default_interval_secs() -> u64 {
    300
}
fn default_state_path() -> PathBuf {
    PathBuf::from("./state/sync_state.json")
}
fn default_concurrency() -> usize {
    4
}

impl SourceConfig {
    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn default_retry_after(&self) -> Duration {
        Duration::from_secs(self.default_retry_after_secs)
    }
}

impl DestinationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Environment variable lookup, injectable for tests.
pub trait Env {
    fn var(&self, key: &str) -> Option<String>;
}

/// The real process environment.
pub struct ProcessEnv;

impl Env for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.is_empty())
    }
}

/// Load the config file (if present), apply environment overrides, and
/// validate.
///
/// A missing file is not an error: every setting can come from the
/// environment alone, which is how container deployments run.
pub fn load_config(path: &Path) -> Result<Config> {
    let config = read_config(path)?;
    validate(&config)?;
    Ok(config)
}

/// Like [`load_config`] but without validation, for commands that only
/// touch local files and need no credentials.
pub fn read_config(path: &Path) -> Result<Config> {
    let config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| "Failed to parse config file")?
    } else {
        Config::default()
    };
    apply_env(config, &ProcessEnv)
}

/// Apply environment overrides and validate.
pub fn finish_config(config: Config, env: &dyn Env) -> Result<Config> {
    let config = apply_env(config, env)?;
    validate(&config)?;
    Ok(config)
}

/// Apply environment overrides.
pub fn apply_env(mut config: Config, env: &dyn Env) -> Result<Config> {
    if let Some(v) = env.var("OMI_API_KEY") {
        config.source.api_key = Some(v);
    }
    if let Some(v) = env.var("WEBDAV_URL") {
        config.destination.url = Some(v);
    }
    if let Some(v) = env.var("WEBDAV_USER") {
        config.destination.username = Some(v);
    }
    if let Some(v) = env.var("WEBDAV_PASS") {
        config.destination.password = Some(v);
    }
    if let Some(v) = env.var("OUTPUT_DIR") {
        config.destination.output_dir = v;
    }
    if let Some(v) = env.var("SYNC_INTERVAL_SECONDS") {
        config.sync.interval_secs = v
            .parse()
            .with_context(|| format!("SYNC_INTERVAL_SECONDS is not a number: '{}'", v))?;
    }
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    let mut missing = Vec::new();
    if config.source.api_key.is_none() {
        missing.push("source.api_key (OMI_API_KEY)");
    }
    if config.destination.url.is_none() {
        missing.push("destination.url (WEBDAV_URL)");
    }
    if config.destination.username.is_none() {
        missing.push("destination.username (WEBDAV_USER)");
    }
    if config.destination.password.is_none() {
        missing.push("destination.password (WEBDAV_PASS)");
    }
    if !missing.is_empty() {
        anyhow::bail!("Missing required settings: {}", missing.join(", "));
    }

    if config.source.page_size == 0 {
        anyhow::bail!("source.page_size must be > 0");
    }
    if config.sync.concurrency == 0 {
        anyhow::bail!("sync.concurrency must be > 0");
    }
    if config.sync.interval_secs == 0 {
        anyhow::bail!("sync.interval_secs must be > 0");
    }
    if !config.destination.output_dir.starts_with('/') {
        anyhow::bail!(
            "destination.output_dir must be an absolute path, got '{}'",
            config.destination.output_dir
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapEnv(HashMap<&'static str, &'static str>);

    impl Env for MapEnv {
        fn var(&self, key: &str) -> Option<String> {
            self.0.get(key).map(|v| v.to_string())
        }
    }

    fn full_env() -> MapEnv {
        MapEnv(HashMap::from([
            ("OMI_API_KEY", "omi_dev_123"),
            ("WEBDAV_URL", "https://dav.example.com/remote.php/dav/files/me"),
            ("WEBDAV_USER", "me"),
            ("WEBDAV_PASS", "secret"),
        ]))
    }

    #[test]
    fn test_defaults_from_env_only() {
        let cfg = finish_config(Config::default(), &full_env()).unwrap();
        assert_eq!(cfg.source.page_size, 25);
        assert_eq!(cfg.source.request_delay_ms, 150);
        assert_eq!(cfg.destination.output_dir, "/conversations");
        assert_eq!(cfg.sync.interval_secs, 300);
        assert_eq!(cfg.source.api_key.as_deref(), Some("omi_dev_123"));
    }

    #[test]
    fn test_toml_values_and_env_override() {
        let cfg: Config = toml::from_str(
            r#"
[source]
api_key = "from-file"
page_size = 10

[destination]
url = "https://file.example.com"
username = "u"
password = "p"
output_dir = "/notes/omi"

[sync]
interval_secs = 60
concurrency = 2
"#,
        )
        .unwrap();

        let env = MapEnv(HashMap::from([("OMI_API_KEY", "from-env"), ("OUTPUT_DIR", "/x")]));
        let cfg = finish_config(cfg, &env).unwrap();
        assert_eq!(cfg.source.api_key.as_deref(), Some("from-env"));
        assert_eq!(cfg.source.page_size, 10);
        assert_eq!(cfg.destination.output_dir, "/x");
        assert_eq!(cfg.sync.concurrency, 2);
    }

    #[test]
    fn test_missing_credentials_listed_together() {
        let err = finish_config(Config::default(), &MapEnv(HashMap::new()))
            .unwrap_err()
            .to_string();
        assert!(err.contains("OMI_API_KEY"));
        assert!(err.contains("WEBDAV_URL"));
        assert!(err.contains("WEBDAV_USER"));
        assert!(err.contains("WEBDAV_PASS"));
    }

    #[test]
    fn test_rejects_zero_page_size() {
        let mut cfg = Config::default();
        cfg.source.page_size = 0;
        assert!(finish_config(cfg, &full_env()).is_err());
    }

    #[test]
    fn test_rejects_bad_interval_env() {
        let mut env = full_env();
        env.0.insert("SYNC_INTERVAL_SECONDS", "soon");
        assert!(finish_config(Config::default(), &env).is_err());
    }

    #[test]
    fn test_example_config_parses() {
        let cfg: Config = toml::from_str(include_str!("../config/omi-sync.example.toml")).unwrap();
        assert_eq!(cfg.destination.output_dir, "/conversations");
        assert_eq!(cfg.sync.concurrency, 4);
        assert!(cfg.source.api_key.is_none());
    }

    #[test]
    fn test_env_overrides_without_credentials() {
        let env = MapEnv(HashMap::from([("SYNC_INTERVAL_SECONDS", "60")]));
        let cfg = apply_env(Config::default(), &env).unwrap();
        assert_eq!(cfg.sync.interval_secs, 60);
        assert_eq!(cfg.sync.state_path, PathBuf::from("./state/sync_state.json"));
        assert!(finish_config(Config::default(), &env).is_err());
    }
}

//! inboxd configuration loader.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboxConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub webhooks: WebhooksConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
    /// Bearer token for the operator API. Unset leaves the API open, which is
    /// only acceptable on a loopback bind.
    #[serde(default)]
    pub control_api_token: Option<String>,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    30
}

fn default_http_max_in_flight() -> usize {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
            control_api_token: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

fn default_database_path() -> String {
    "~/.inbox/data/inbox.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default)]
    pub anthropic_api_key: Option<String>,
    /// OpenAI-compatible gateway; ignored for Anthropic models.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_llm_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_llm_timeout_seconds() -> u64 {
    45
}

fn default_system_prompt() -> String {
    "You are the sales assistant of an online shop answering customers in a messaging inbox. \
     Reply briefly in the customer's language. When the customer wants to buy a product from \
     the catalog and has given their full name, phone number and delivery address, call \
     create_order. If any of those details is missing, ask for it instead of calling the tool."
        .to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            openai_api_key: None,
            anthropic_api_key: None,
            base_url: None,
            timeout_seconds: default_llm_timeout_seconds(),
            system_prompt: default_system_prompt(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Unreplied customer messages older than this are never answered.
    #[serde(default = "default_reply_lookback_seconds")]
    pub reply_lookback_seconds: i64,
    /// Quiet period after the newest customer message before a turn runs.
    #[serde(default = "default_settle_seconds")]
    pub settle_seconds: i64,
    #[serde(default = "default_lock_ttl_seconds")]
    pub lock_ttl_seconds: i64,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_max_concurrent_turns")]
    pub max_concurrent_turns: usize,
}

fn default_reply_lookback_seconds() -> i64 {
    300
}

fn default_settle_seconds() -> i64 {
    10
}

fn default_lock_ttl_seconds() -> i64 {
    120
}

fn default_history_limit() -> usize {
    15
}

fn default_max_concurrent_turns() -> usize {
    8
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            reply_lookback_seconds: default_reply_lookback_seconds(),
            settle_seconds: default_settle_seconds(),
            lock_ttl_seconds: default_lock_ttl_seconds(),
            history_limit: default_history_limit(),
            max_concurrent_turns: default_max_concurrent_turns(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchedulerConfig {
    /// Run sweeps in-process every N seconds. Unset relies on an external
    /// trigger (`POST /internal/sweep` or `inboxd sweep`).
    #[serde(default)]
    pub embedded_interval_seconds: Option<u64>,
    #[serde(default)]
    pub trigger_secret: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhooksConfig {
    #[serde(default)]
    pub meta_verify_token: String,
    #[serde(default)]
    pub meta_app_secret: Option<String>,
    #[serde(default)]
    pub telegram_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnrichmentConfig {
    #[serde(default = "default_profile_timeout_ms")]
    pub profile_timeout_ms: u64,
}

fn default_profile_timeout_ms() -> u64 {
    3000
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            profile_timeout_ms: default_profile_timeout_ms(),
        }
    }
}

impl InboxConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        Ok(Self::load_with_path(path).await?.0)
    }

    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;

        let mut cfg: InboxConfig = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok((cfg, path))
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_value("INBOX_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = env_value("OPENAI_API_KEY") {
            self.llm.openai_api_key = Some(v);
        }
        if let Some(v) = env_value("ANTHROPIC_API_KEY") {
            self.llm.anthropic_api_key = Some(v);
        }
        if let Some(v) = env_value("INBOX_DATABASE_PATH") {
            self.storage.database_path = v;
        }
        if let Some(v) = env_value("META_VERIFY_TOKEN") {
            self.webhooks.meta_verify_token = v;
        }
        if let Some(v) = env_value("META_APP_SECRET") {
            self.webhooks.meta_app_secret = Some(v);
        }
        if let Some(v) = env_value("TELEGRAM_WEBHOOK_SECRET") {
            self.webhooks.telegram_secret = Some(v);
        }
        if let Some(v) = env_value("INBOX_SWEEP_SECRET") {
            self.scheduler.trigger_secret = Some(v);
        }
        if let Some(v) = env_value("INBOX_CONTROL_API_TOKEN") {
            self.server.control_api_token = Some(v);
        }
    }

    pub(crate) fn validate(&self) -> anyhow::Result<()> {
        if self.llm.model.trim().is_empty() {
            return Err(anyhow::anyhow!("llm.model is required"));
        }
        if self.llm.timeout_seconds == 0 {
            return Err(anyhow::anyhow!("llm.timeout_seconds must be > 0"));
        }
        if self.server.http_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("server.http_timeout_seconds must be > 0"));
        }
        if self.server.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!("server.http_max_in_flight must be > 0"));
        }
        self.bind_addr()?;
        let pipeline = &self.pipeline;
        if pipeline.reply_lookback_seconds <= 0 {
            return Err(anyhow::anyhow!("pipeline.reply_lookback_seconds must be > 0"));
        }
        if pipeline.settle_seconds <= 0 {
            return Err(anyhow::anyhow!("pipeline.settle_seconds must be > 0"));
        }
        if pipeline.settle_seconds >= pipeline.reply_lookback_seconds {
            return Err(anyhow::anyhow!(
                "pipeline.settle_seconds ({}) must be smaller than pipeline.reply_lookback_seconds ({})",
                pipeline.settle_seconds,
                pipeline.reply_lookback_seconds
            ));
        }
        let llm_timeout = i64::try_from(self.llm.timeout_seconds).unwrap_or(i64::MAX);
        if pipeline.lock_ttl_seconds <= llm_timeout {
            return Err(anyhow::anyhow!(
                "pipeline.lock_ttl_seconds ({}) must exceed llm.timeout_seconds ({})",
                pipeline.lock_ttl_seconds,
                self.llm.timeout_seconds
            ));
        }
        if pipeline.history_limit == 0 {
            return Err(anyhow::anyhow!("pipeline.history_limit must be > 0"));
        }
        if pipeline.max_concurrent_turns == 0 {
            return Err(anyhow::anyhow!("pipeline.max_concurrent_turns must be > 0"));
        }
        if self.scheduler.embedded_interval_seconds == Some(0) {
            return Err(anyhow::anyhow!(
                "scheduler.embedded_interval_seconds must be > 0 when set"
            ));
        }
        if self.enrichment.profile_timeout_ms == 0 {
            return Err(anyhow::anyhow!("enrichment.profile_timeout_ms must be > 0"));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.server
            .bind_addr
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid server.bind_addr {:?}: {e}", self.server.bind_addr))
    }

    pub fn api_key_for_model(&self) -> Option<String> {
        let model = self.llm.model.to_ascii_lowercase();
        let key = if model.starts_with("claude-") {
            self.llm.anthropic_api_key.clone()
        } else {
            self.llm.openai_api_key.clone()
        };
        key.filter(|s| !s.trim().is_empty())
    }

    pub fn database_path(&self) -> anyhow::Result<PathBuf> {
        expand_home(&self.storage.database_path)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm.timeout_seconds)
    }

    pub fn profile_timeout(&self) -> Duration {
        Duration::from_millis(self.enrichment.profile_timeout_ms)
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

pub fn default_config_path() -> PathBuf {
    if let Some(path) = env_value("INBOX_CONFIG") {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".inbox").join("config.toml")
}

pub fn expand_home(path: &str) -> anyhow::Result<PathBuf> {
    let trimmed = path.trim().to_string();
    if !trimmed.starts_with("~/") {
        return Ok(PathBuf::from(trimmed));
    }
    let home = std::env::var("HOME").map_err(|_| anyhow::anyhow!("HOME is not set"))?;
    Ok(PathBuf::from(trimmed.replacen("~", &home, 1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(raw: &str) -> InboxConfig {
        toml::from_str(raw).expect("parse config")
    }

    #[test]
    fn empty_file_yields_pipeline_defaults() {
        let cfg = parse("");
        cfg.validate().expect("defaults validate");
        assert_eq!(cfg.pipeline.reply_lookback_seconds, 300);
        assert_eq!(cfg.pipeline.settle_seconds, 10);
        assert_eq!(cfg.pipeline.history_limit, 15);
        assert_eq!(cfg.enrichment.profile_timeout_ms, 3000);
        assert!(cfg.scheduler.embedded_interval_seconds.is_none());
    }

    #[test]
    fn settle_must_be_shorter_than_lookback() {
        let cfg = parse(
            r#"
            [pipeline]
            reply_lookback_seconds = 30
            settle_seconds = 30
            "#,
        );
        let err = cfg.validate().expect_err("settle >= lookback");
        assert!(err.to_string().contains("settle_seconds"));
    }

    #[test]
    fn lock_ttl_must_outlive_model_timeout() {
        let cfg = parse(
            r#"
            [llm]
            timeout_seconds = 60

            [pipeline]
            lock_ttl_seconds = 60
            "#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_durations_and_blank_model_are_rejected() {
        assert!(parse("[llm]\nmodel = \"  \"").validate().is_err());
        assert!(parse("[llm]\ntimeout_seconds = 0").validate().is_err());
        assert!(parse("[enrichment]\nprofile_timeout_ms = 0").validate().is_err());
        assert!(parse("[scheduler]\nembedded_interval_seconds = 0").validate().is_err());
        assert!(parse("[server]\nbind_addr = \"nope\"").validate().is_err());
    }

    #[test]
    fn api_key_follows_model_family() {
        let mut cfg = parse(
            r#"
            [llm]
            model = "claude-3-5-haiku-latest"
            openai_api_key = "sk-openai"
            anthropic_api_key = "sk-ant"
            "#,
        );
        assert_eq!(cfg.api_key_for_model().as_deref(), Some("sk-ant"));
        cfg.llm.model = "gpt-4o-mini".to_string();
        assert_eq!(cfg.api_key_for_model().as_deref(), Some("sk-openai"));
        cfg.llm.openai_api_key = Some(" ".to_string());
        assert_eq!(cfg.api_key_for_model(), None);
    }

    #[tokio::test]
    async fn load_reads_file_from_disk() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            file,
            r#"
            [server]
            bind_addr = "127.0.0.1:9999"

            [storage]
            database_path = "/tmp/inbox-test.db"

            [pipeline]
            settle_seconds = 5
            "#
        )
        .expect("write config");

        let (cfg, path) = InboxConfig::load_with_path(Some(file.path().to_path_buf()))
            .await
            .expect("load");
        assert_eq!(path, file.path());
        assert_eq!(cfg.pipeline.settle_seconds, 5);
        assert_eq!(cfg.bind_addr().expect("addr").port(), 9999);
    }

    #[tokio::test]
    async fn load_reports_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = InboxConfig::load(Some(dir.path().join("absent.toml")))
            .await
            .expect_err("missing file");
        assert!(err.to_string().contains("read config"));
    }

    #[test]
    fn expand_home_leaves_absolute_paths() {
        assert_eq!(
            expand_home("/var/lib/inbox.db").expect("path"),
            PathBuf::from("/var/lib/inbox.db")
        );
    }
}

//! Unified configuration for the connection orchestrator.
//!
//! Settings are read from `connect.toml` inside the configuration directory
//! and layered file → environment → explicit overrides.
//!
//! # Configuration File Format
//!
//! ```toml
//! [backend]
//! base_url = "https://api.example.com"
//! tenant_id = "tenant-1"
//!
//! [orchestrator]
//! poll_interval_ms = 2000
//! session_timeout_secs = 300
//! fallback_read_interval_ms = 2000
//! auto_select_delay_ms = 500
//! resume_window_secs = 60
//!
//! [accounts]
//! default_ai_enabled = false
//! default_auto_reply = true
//! always_on_platforms = ["facebook", "instagram", "whatsapp"]
//! mapping_grace_secs = 60
//!
//! [logging]
//! level = "info"
//! json = false
//! ```

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::{AccountFlags, Platform};

pub const CONFIG_FILE_NAME: &str = "connect.toml";

/// REST collaborator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// Bearer token; usually supplied through `CONNECT_API_TOKEN` instead.
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            tenant_id: None,
            api_token: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Timers and paths used by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    #[serde(default = "default_fallback_read_interval_ms")]
    pub fallback_read_interval_ms: u64,
    #[serde(default = "default_auto_select_delay_ms")]
    pub auto_select_delay_ms: u64,
    #[serde(default = "default_resume_window_secs")]
    pub resume_window_secs: u64,
    /// Defaults to `<config dir>/fallback`.
    #[serde(default)]
    pub fallback_dir: Option<PathBuf>,
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_session_timeout_secs() -> u64 {
    300
}

fn default_fallback_read_interval_ms() -> u64 {
    2000
}

fn default_auto_select_delay_ms() -> u64 {
    500
}

fn default_resume_window_secs() -> u64 {
    60
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            session_timeout_secs: default_session_timeout_secs(),
            fallback_read_interval_ms: default_fallback_read_interval_ms(),
            auto_select_delay_ms: default_auto_select_delay_ms(),
            resume_window_secs: default_resume_window_secs(),
            fallback_dir: None,
        }
    }
}

/// Defaults applied to newly provisioned accounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountsSection {
    #[serde(default)]
    pub default_ai_enabled: bool,
    #[serde(default = "default_auto_reply")]
    pub default_auto_reply: bool,
    /// Platforms whose accounts are expected to stay active at all times.
    #[serde(default = "default_always_on_platforms")]
    pub always_on_platforms: Vec<Platform>,
    /// An account written this recently is not yet treated as missing its mapping.
    #[serde(default = "default_mapping_grace_secs")]
    pub mapping_grace_secs: u64,
}

fn default_auto_reply() -> bool {
    true
}

fn default_mapping_grace_secs() -> u64 {
    60
}

fn default_always_on_platforms() -> Vec<Platform> {
    vec![Platform::Facebook, Platform::Instagram, Platform::Whatsapp]
}

impl Default for AccountsSection {
    fn default() -> Self {
        Self {
            default_ai_enabled: false,
            default_auto_reply: default_auto_reply(),
            always_on_platforms: default_always_on_platforms(),
            mapping_grace_secs: default_mapping_grace_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// When set, logs are also written to a daily rolling file here.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            log_dir: None,
        }
    }
}

/// The complete connect.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectToml {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub accounts: AccountsSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ConnectToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse connect.toml")
    }

    /// Returns the default configuration if the file doesn't exist.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE_NAME);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize connect.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Backend URL (env → file → default).
    pub fn base_url(&self) -> String {
        std::env::var("CONNECT_BACKEND_URL").unwrap_or_else(|_| self.backend.base_url.clone())
    }

    /// API token (env → file).
    pub fn api_token(&self) -> Option<String> {
        std::env::var("CONNECT_API_TOKEN")
            .ok()
            .or_else(|| self.backend.api_token.clone())
    }

    /// Tenant identifier (env → file).
    pub fn tenant_id(&self) -> Option<String> {
        std::env::var("CONNECT_TENANT_ID")
            .ok()
            .or_else(|| self.backend.tenant_id.clone())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let o = &self.orchestrator;

        if o.poll_interval_ms == 0 {
            warnings.push("poll_interval_ms must be greater than zero".to_string());
        }
        if o.fallback_read_interval_ms == 0 {
            warnings.push("fallback_read_interval_ms must be greater than zero".to_string());
        }
        if o.session_timeout_secs * 1000 <= o.poll_interval_ms {
            warnings.push(format!(
                "session_timeout_secs ({}) is shorter than one poll interval ({}ms)",
                o.session_timeout_secs, o.poll_interval_ms
            ));
        }
        if !self.backend.base_url.starts_with("http://")
            && !self.backend.base_url.starts_with("https://")
        {
            warnings.push(format!(
                "Invalid base_url '{}': must start with http:// or https://",
                self.backend.base_url
            ));
        }

        warnings
    }
}

/// Resolved timers for one coordinator.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub poll_interval: Duration,
    pub session_timeout: Duration,
    pub fallback_read_interval: Duration,
    pub auto_select_delay: Duration,
    pub resume_window: Duration,
    pub default_flags: AccountFlags,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_sections(&OrchestratorSection::default(), &AccountsSection::default())
    }
}

impl OrchestratorSettings {
    fn from_sections(o: &OrchestratorSection, a: &AccountsSection) -> Self {
        Self {
            poll_interval: Duration::from_millis(o.poll_interval_ms.max(1)),
            session_timeout: Duration::from_secs(o.session_timeout_secs),
            fallback_read_interval: Duration::from_millis(o.fallback_read_interval_ms.max(1)),
            auto_select_delay: Duration::from_millis(o.auto_select_delay_ms),
            resume_window: Duration::from_secs(o.resume_window_secs),
            default_flags: AccountFlags {
                ai_enabled: a.default_ai_enabled,
                auto_reply: a.default_auto_reply,
            },
        }
    }
}

/// Configuration combining connect.toml with runtime overrides.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    pub config_dir: PathBuf,
    pub toml: ConnectToml,
    /// Explicit override for the tenant (e.g. the signed-in user's tenant).
    pub tenant_override: Option<String>,
}

impl ConnectConfig {
    pub fn new(config_dir: PathBuf) -> Result<Self> {
        let toml = ConnectToml::load_or_default(&config_dir)?;
        Ok(Self {
            config_dir,
            toml,
            tenant_override: None,
        })
    }

    /// Load from the platform config directory (e.g. `~/.config/platform-connect`).
    pub fn from_default_dir() -> Result<Self> {
        let dir = dirs::config_dir()
            .ok_or_else(|| anyhow!("Could not determine the user config directory"))?
            .join("platform-connect");
        Self::new(dir)
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_override = Some(tenant_id.into());
        self
    }

    /// Tenant (override → env → file).
    pub fn tenant_id(&self) -> Result<String> {
        self.tenant_override
            .clone()
            .or_else(|| self.toml.tenant_id())
            .ok_or_else(|| anyhow!("No tenant configured. Set [backend].tenant_id or CONNECT_TENANT_ID"))
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings::from_sections(&self.toml.orchestrator, &self.toml.accounts)
    }

    pub fn fallback_dir(&self) -> PathBuf {
        self.toml
            .orchestrator
            .fallback_dir
            .clone()
            .unwrap_or_else(|| self.config_dir.join("fallback"))
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        self.toml.logging.log_dir.clone()
    }

    pub fn always_on_platforms(&self) -> &[Platform] {
        &self.toml.accounts.always_on_platforms
    }

    pub fn mapping_grace(&self) -> Duration {
        Duration::from_secs(self.toml.accounts.mapping_grace_secs)
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

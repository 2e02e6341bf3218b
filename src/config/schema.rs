use anyhow::{Context, Result};
use directories::UserDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Default directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".cdp-auth";

// ── Top-level config ──────────────────────────────────────────────

/// Top-level cdp-auth configuration, loaded from `config.toml`.
///
/// Resolution order: `--config <path>` → `~/.cdp-auth/config.toml` → built-in defaults.
/// Environment variables are applied on top (see [`Config::apply_env_overrides`]).
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Path the config was loaded from - computed, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// HTTP / WebSocket gateway (`[gateway]`).
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Debounce and polling behaviour of the correlation engine (`[engine]`).
    #[serde(default)]
    pub engine: EngineConfig,

    /// Token signing mode and lifetimes (`[issuance]`).
    #[serde(default)]
    pub issuance: IssuanceConfig,

    /// CodePen comment source (`[source]`).
    #[serde(default)]
    pub source: SourceConfig,

    /// Application registry storage (`[registry]`).
    #[serde(default)]
    pub registry: RegistryConfig,
}

// ── Gateway ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GatewayConfig {
    /// Gateway host (default: 127.0.0.1)
    #[serde(default = "default_gateway_host")]
    pub host: String,
    /// Gateway port (default: 3000)
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Trust proxy-forwarded client IP headers (`X-Forwarded-For`, `X-Real-IP`).
    /// Disabled by default; enable only behind a trusted reverse proxy.
    #[serde(default)]
    pub trust_forwarded_headers: bool,
    /// Max `/createApp` requests per minute per client IP. 0 disables the limit.
    #[serde(default = "default_create_app_rate_limit")]
    pub create_app_rate_limit_per_minute: u32,
}

fn default_gateway_host() -> String {
    "127.0.0.1".into()
}

fn default_gateway_port() -> u16 {
    3000
}

fn default_create_app_rate_limit() -> u32 {
    10
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
            trust_forwarded_headers: false,
            create_app_rate_limit_per_minute: default_create_app_rate_limit(),
        }
    }
}

// ── Engine ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EngineConfig {
    /// How often the pending signal is checked, in milliseconds (default: 1000).
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Minimum time between the starts of two polling cycles, in milliseconds (default: 2000).
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Upper bound on in-flight comment deletions per cycle (default: 4).
    #[serde(default = "default_max_concurrent_deletes")]
    pub max_concurrent_deletes: usize,
    /// Upper bound on concurrent resolve/mint/deliver steps per cycle (default: 8).
    #[serde(default = "default_max_concurrent_issues")]
    pub max_concurrent_issues: usize,
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_cooldown_ms() -> u64 {
    2000
}

fn default_max_concurrent_deletes() -> usize {
    4
}

fn default_max_concurrent_issues() -> usize {
    8
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            cooldown_ms: default_cooldown_ms(),
            max_concurrent_deletes: default_max_concurrent_deletes(),
            max_concurrent_issues: default_max_concurrent_issues(),
        }
    }
}

// ── Issuance ──────────────────────────────────────────────────────

/// Which secret signs issued tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum IssuanceMode {
    /// One process-wide secret; comment text is the bare correlation id.
    GlobalSecret,
    /// Secret looked up per application key; comment text is `<id>:<key>`.
    #[default]
    PerApplicationSecret,
}

impl IssuanceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GlobalSecret => "global-secret",
            Self::PerApplicationSecret => "per-application-secret",
        }
    }
}

impl std::str::FromStr for IssuanceMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "global-secret" | "global" => Ok(Self::GlobalSecret),
            "per-application-secret" | "per-application" | "app" => {
                Ok(Self::PerApplicationSecret)
            }
            other => anyhow::bail!(
                "Unknown issuance mode '{other}'. Use 'global-secret' or 'per-application-secret'"
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct IssuanceConfig {
    /// Signing mode (default: `per-application-secret`).
    #[serde(default)]
    pub mode: IssuanceMode,
    /// Secret for `global-secret` mode. Overridden by `JWT_SECRET`.
    #[serde(default)]
    pub global_secret: Option<String>,
    /// Token lifetime in `global-secret` mode, seconds (default: 86400).
    #[serde(default = "default_global_ttl_secs")]
    pub global_ttl_secs: u64,
    /// Token lifetime in `per-application-secret` mode, seconds (default: 300).
    #[serde(default = "default_application_ttl_secs")]
    pub application_ttl_secs: u64,
}

fn default_global_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_application_ttl_secs() -> u64 {
    5 * 60
}

impl Default for IssuanceConfig {
    fn default() -> Self {
        Self {
            mode: IssuanceMode::default(),
            global_secret: None,
            global_ttl_secs: default_global_ttl_secs(),
            application_ttl_secs: default_application_ttl_secs(),
        }
    }
}

// ── Source ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SourceConfig {
    /// CodePen base URL (default: https://codepen.io).
    #[serde(default = "default_source_base_url")]
    pub base_url: String,
    /// Pen owner username. Overridden by `CDP_USER`.
    #[serde(default)]
    pub user: String,
    /// Pen whose comments carry correlation requests. Overridden by `PEN_ID`.
    #[serde(default)]
    pub pen_id: String,
    /// Logged-in session cookie of the pen owner. Overridden by `CDP_SESSION_COOKIE`.
    #[serde(default)]
    pub session_cookie: String,
    /// How often the CSRF token and cookies are renewed, seconds (default: 600).
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    /// Per-request HTTP timeout, seconds (default: 20).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_source_base_url() -> String {
    "https://codepen.io".into()
}

fn default_refresh_interval_secs() -> u64 {
    600
}

fn default_request_timeout_secs() -> u64 {
    20
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: default_source_base_url(),
            user: String::new(),
            pen_id: String::new(),
            session_cookie: String::new(),
            refresh_interval_secs: default_refresh_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl SourceConfig {
    pub fn is_configured(&self) -> bool {
        !self.user.trim().is_empty()
            && !self.pen_id.trim().is_empty()
            && !self.session_cookie.trim().is_empty()
    }
}

// ── Registry ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct RegistryConfig {
    /// SQLite database path. Defaults to `applications.db` next to the config file.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

// ── Loading ───────────────────────────────────────────────────────

fn default_config_dir() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(CONFIG_DIR_NAME))
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Config {
    /// Load config from `path`, or from the default location when `None`.
    ///
    /// A missing file is not an error: defaults are used and env overrides
    /// still apply.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_dir()?.join("config.toml"),
        };

        let mut config = if config_path.exists() {
            let contents = fs::read_to_string(&config_path)
                .await
                .with_context(|| format!("Failed to read config file {}", config_path.display()))?;
            Self::from_toml(&contents)?
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
            Config::default()
        };
        config.config_path = config_path;

        config.apply_env_overrides();
        tracing::info!(
            path = %config.config_path.display(),
            mode = config.issuance.mode.as_str(),
            "Config loaded"
        );
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("Failed to parse config file")
    }

    /// Resolved SQLite path for the application registry.
    pub fn registry_db_path(&self) -> PathBuf {
        if let Some(path) = &self.registry.db_path {
            return path.clone();
        }
        self.config_path
            .parent()
            .map_or_else(|| PathBuf::from("."), PathBuf::from)
            .join("applications.db")
    }

    /// Apply environment overrides. Variable names follow the existing
    /// deployment (`JWT_SECRET`, `CDP_USER`, `CDP_SESSION_COOKIE`, `PEN_ID`, `PORT`).
    pub fn apply_env_overrides(&mut self) {
        if let Some(secret) = env_nonempty("JWT_SECRET") {
            self.issuance.global_secret = Some(secret);
        }
        if let Some(user) = env_nonempty("CDP_USER") {
            self.source.user = user;
        }
        if let Some(cookie) = env_nonempty("CDP_SESSION_COOKIE") {
            self.source.session_cookie = cookie;
        }
        if let Some(pen) = env_nonempty("PEN_ID") {
            self.source.pen_id = pen;
        }
        if let Some(port) = env_nonempty("PORT") {
            match port.parse::<u16>() {
                Ok(port) => self.gateway.port = port,
                Err(_) => tracing::warn!("Ignoring invalid PORT value '{port}'"),
            }
        }
        if let Some(mode) = env_nonempty("CDP_AUTH_MODE") {
            match mode.parse::<IssuanceMode>() {
                Ok(mode) => self.issuance.mode = mode,
                Err(e) => tracing::warn!("Ignoring CDP_AUTH_MODE: {e}"),
            }
        }
        if let Some(db) = env_nonempty("CDP_AUTH_DB") {
            self.registry.db_path = Some(PathBuf::from(db));
        }
    }

    /// Validate values that would otherwise fail at an arbitrary point at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.gateway.host.trim().is_empty() {
            anyhow::bail!("gateway.host must not be empty");
        }
        if self.engine.tick_interval_ms == 0 {
            anyhow::bail!("engine.tick_interval_ms must be greater than 0");
        }
        if self.engine.max_concurrent_deletes == 0 || self.engine.max_concurrent_issues == 0 {
            anyhow::bail!("engine concurrency limits must be greater than 0");
        }
        if self.issuance.mode == IssuanceMode::GlobalSecret
            && self
                .issuance
                .global_secret
                .as_deref()
                .map_or(true, |s| s.trim().is_empty())
        {
            anyhow::bail!("issuance.mode = 'global-secret' requires JWT_SECRET or issuance.global_secret");
        }
        if self.source.refresh_interval_secs == 0 {
            anyhow::bail!("source.refresh_interval_secs must be greater than 0");
        }
        Ok(())
    }

    /// Stricter validation for `serve`: the comment source must be reachable.
    pub fn validate_for_serve(&self) -> Result<()> {
        self.validate()?;
        if !self.source.is_configured() {
            anyhow::bail!("CDP_USER, CDP_SESSION_COOKIE and PEN_ID required!");
        }
        Ok(())
    }

    /// JSON schema of the config file, pretty-printed.
    pub fn json_schema() -> Result<String> {
        let schema = schemars::schema_for!(Config);
        serde_json::to_string_pretty(&schema).context("Failed to serialize config schema")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_polling_and_token_timings() {
        let config = Config::default();
        assert_eq!(config.engine.tick_interval_ms, 1000);
        assert_eq!(config.engine.cooldown_ms, 2000);
        assert_eq!(config.issuance.global_ttl_secs, 86_400);
        assert_eq!(config.issuance.application_ttl_secs, 300);
        assert_eq!(config.source.refresh_interval_secs, 600);
        assert_eq!(config.issuance.mode, IssuanceMode::PerApplicationSecret);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config = Config::from_toml(
            r#"
            [engine]
            cooldown_ms = 500

            [issuance]
            mode = "global-secret"
            global_secret = "s3cret"
            "#,
        )
        .unwrap();
        assert_eq!(config.engine.cooldown_ms, 500);
        assert_eq!(config.engine.tick_interval_ms, 1000);
        assert_eq!(config.issuance.mode, IssuanceMode::GlobalSecret);
        assert_eq!(config.gateway.port, 3000);
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let err = Config::from_toml("[issuance]\nmode = \"shared\"\n").unwrap_err();
        assert!(format!("{err:#}").contains("parse"));
    }

    #[test]
    fn mode_parses_short_aliases() {
        assert_eq!(
            "global".parse::<IssuanceMode>().unwrap(),
            IssuanceMode::GlobalSecret
        );
        assert_eq!(
            "per-application".parse::<IssuanceMode>().unwrap(),
            IssuanceMode::PerApplicationSecret
        );
        assert!("nope".parse::<IssuanceMode>().is_err());
    }

    #[test]
    fn global_mode_requires_secret() {
        let mut config = Config::default();
        config.issuance.mode = IssuanceMode::GlobalSecret;
        assert!(config.validate().is_err());

        config.issuance.global_secret = Some("   ".into());
        assert!(config.validate().is_err());

        config.issuance.global_secret = Some("secret".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn serve_requires_source_credentials() {
        let mut config = Config::default();
        let err = config.validate_for_serve().unwrap_err();
        assert!(err.to_string().contains("PEN_ID"));

        config.source.user = "alice".into();
        config.source.pen_id = "abcdef".into();
        config.source.session_cookie = "cp_session=1".into();
        assert!(config.validate_for_serve().is_ok());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut config = Config::default();
        config.engine.max_concurrent_deletes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn registry_path_defaults_next_to_config() {
        let mut config = Config::default();
        config.config_path = PathBuf::from("/etc/cdp-auth/config.toml");
        assert_eq!(
            config.registry_db_path(),
            PathBuf::from("/etc/cdp-auth/applications.db")
        );

        config.registry.db_path = Some(PathBuf::from("/var/lib/apps.db"));
        assert_eq!(config.registry_db_path(), PathBuf::from("/var/lib/apps.db"));
    }

    #[test]
    fn json_schema_mentions_sections() {
        let schema = Config::json_schema().unwrap();
        assert!(schema.contains("engine"));
        assert!(schema.contains("issuance"));
    }
}

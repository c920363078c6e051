use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Startup-only configuration failure. The process must not serve when
/// any of these is returned.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required credential: {0}")]
    MissingCredential(&'static str),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub hosting: HostingConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub intake: IntakeConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub intent: IntentConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Secrets never come from the TOML file.
    #[serde(skip)]
    pub credentials: Credentials,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompletionConfig {
    #[serde(default = "default_completion_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_completion_timeout_secs")]
    pub timeout_secs: u64,
    /// Pause between full sweeps of the credential pool while rate limited.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            base_url: default_completion_base_url(),
            model: default_model(),
            system_prompt: default_system_prompt(),
            timeout_secs: default_completion_timeout_secs(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_completion_base_url() -> String {
    "https://api.groq.com/openai/v1".to_string()
}
fn default_model() -> String {
    "llama-3.3-70b-versatile".to_string()
}
fn default_system_prompt() -> String {
    "You are a concise, honest software engineering assistant. \
     Never claim to have performed an action you did not perform. \
     If the user wants files uploaded, ask them to send a ZIP archive first."
        .to_string()
}
fn default_completion_timeout_secs() -> u64 {
    60
}
fn default_retry_backoff_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct HostingConfig {
    #[serde(default = "default_hosting_api_base")]
    pub api_base: String,
    #[serde(default = "default_hosting_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_private")]
    pub private: bool,
}

impl Default for HostingConfig {
    fn default() -> Self {
        Self {
            api_base: default_hosting_api_base(),
            timeout_secs: default_hosting_timeout_secs(),
            private: default_private(),
        }
    }
}

fn default_hosting_api_base() -> String {
    "https://api.github.com".to_string()
}
fn default_hosting_timeout_secs() -> u64 {
    30
}
fn default_private() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionsConfig {
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    #[serde(default = "default_max_users")]
    pub max_users: usize,
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            max_users: default_max_users(),
            idle_ttl_secs: default_idle_ttl_secs(),
        }
    }
}

fn default_max_turns() -> usize {
    20
}
fn default_max_users() -> usize {
    10_000
}
fn default_idle_ttl_secs() -> u64 {
    24 * 60 * 60
}

#[derive(Debug, Deserialize, Clone)]
pub struct IntakeConfig {
    /// Parent directory for per-upload working directories.
    /// Defaults to the OS temp dir.
    #[serde(default)]
    pub work_root: Option<PathBuf>,
    #[serde(default = "default_max_download_bytes")]
    pub max_download_bytes: u64,
    #[serde(default = "default_max_extracted_bytes")]
    pub max_extracted_bytes: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
    /// Hosts `/events/archive-url` may download from.
    #[serde(default = "default_download_hosts")]
    pub download_hosts: Vec<String>,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            work_root: None,
            max_download_bytes: default_max_download_bytes(),
            max_extracted_bytes: default_max_extracted_bytes(),
            max_entries: default_max_entries(),
            download_timeout_secs: default_download_timeout_secs(),
            download_hosts: default_download_hosts(),
        }
    }
}

impl IntakeConfig {
    pub fn work_root(&self) -> PathBuf {
        self.work_root.clone().unwrap_or_else(std::env::temp_dir)
    }
}

fn default_max_download_bytes() -> u64 {
    20 * 1024 * 1024
}
fn default_max_extracted_bytes() -> u64 {
    100 * 1024 * 1024
}
fn default_max_entries() -> usize {
    10_000
}
fn default_download_timeout_secs() -> u64 {
    60
}
fn default_download_hosts() -> Vec<String> {
    vec!["api.telegram.org".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_commit_message")]
    pub commit_message: String,
    #[serde(default = "default_exclude_globs")]
    pub exclude_globs: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            commit_message: default_commit_message(),
            exclude_globs: default_exclude_globs(),
        }
    }
}

fn default_commit_message() -> String {
    "Upload via relay".to_string()
}
fn default_exclude_globs() -> Vec<String> {
    vec!["**/.git/**".to_string(), "__MACOSX/**".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct IntentConfig {
    #[serde(default = "default_upload_keywords")]
    pub upload_keywords: Vec<String>,
    #[serde(default = "default_name_markers")]
    pub name_markers: Vec<String>,
    #[serde(default = "default_repo_name")]
    pub default_repo_name: String,
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            upload_keywords: default_upload_keywords(),
            name_markers: default_name_markers(),
            default_repo_name: default_repo_name(),
        }
    }
}

fn default_upload_keywords() -> Vec<String> {
    vec!["upload".to_string(), "ارفع".to_string()]
}
fn default_name_markers() -> Vec<String> {
    vec!["repo".to_string(), "name".to_string(), "باسم".to_string()]
}
fn default_repo_name() -> String {
    "my-new-project".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    18789
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

/// Secrets read from the process environment.
#[derive(Clone, Default)]
pub struct Credentials {
    /// Completion-service keys in rotation order.
    pub completion_keys: Vec<String>,
    pub messaging_token: Option<String>,
    pub hosting_token: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("completion_keys", &self.completion_keys.len())
            .field("messaging_token", &self.messaging_token.is_some())
            .field("hosting_token", &self.hosting_token.is_some())
            .finish()
    }
}

impl Credentials {
    /// Reads credentials through `lookup` (normally `std::env::var`).
    ///
    /// Completion keys come from `COMPLETION_API_KEYS` (comma-separated)
    /// followed by `GROQ_API_KEY`, `GROQ_API_KEY_2`, `GROQ_API_KEY_3`, ...
    /// up to the first gap. Duplicates are dropped, first occurrence wins.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

        let mut keys: Vec<String> = Vec::new();
        let mut push = |key: String| {
            if !keys.contains(&key) {
                keys.push(key);
            }
        };

        if let Some(list) = non_empty(lookup("COMPLETION_API_KEYS")) {
            for key in list.split(',').map(str::trim).filter(|k| !k.is_empty()) {
                push(key.to_string());
            }
        }
        if let Some(key) = non_empty(lookup("GROQ_API_KEY")) {
            push(key);
            let mut n = 2;
            while let Some(key) = non_empty(lookup(&format!("GROQ_API_KEY_{}", n))) {
                push(key);
                n += 1;
            }
        }

        Self {
            completion_keys: keys,
            messaging_token: non_empty(lookup("TELEGRAM_BOT_TOKEN")),
            hosting_token: non_empty(lookup("GITHUB_TOKEN")),
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Checks the credentials a serving process cannot run without.
    pub fn require_serving(&self) -> Result<(), ConfigError> {
        if self.completion_keys.is_empty() {
            return Err(ConfigError::MissingCredential(
                "COMPLETION_API_KEYS or GROQ_API_KEY",
            ));
        }
        if self.messaging_token.is_none() {
            return Err(ConfigError::MissingCredential("TELEGRAM_BOT_TOKEN"));
        }
        Ok(())
    }
}

/// Loads the TOML config at `path` and the credentials from the environment.
///
/// A missing file is not an error: every section has defaults. `PORT`
/// overrides `server.port` when set.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    load_config_with(path, |key| std::env::var(key).ok())
}

pub fn load_config_with(
    path: &Path,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Config, ConfigError> {
    let mut config: Config = if path.exists() {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content)?
    } else {
        Config::default()
    };

    if let Some(port) = lookup("PORT") {
        config.server.port = port
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("PORT is not a valid port: '{}'", port)))?;
    }

    config.credentials = Credentials::from_lookup(lookup);
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.sessions.max_turns == 0 {
        return Err(ConfigError::Invalid("sessions.max_turns must be > 0".into()));
    }
    if config.sessions.max_users == 0 {
        return Err(ConfigError::Invalid("sessions.max_users must be > 0".into()));
    }
    if config.completion.timeout_secs == 0 {
        return Err(ConfigError::Invalid(
            "completion.timeout_secs must be > 0".into(),
        ));
    }
    if config.hosting.timeout_secs == 0 {
        return Err(ConfigError::Invalid("hosting.timeout_secs must be > 0".into()));
    }
    if config.intake.max_entries == 0 || config.intake.max_extracted_bytes == 0 {
        return Err(ConfigError::Invalid(
            "intake.max_entries and intake.max_extracted_bytes must be > 0".into(),
        ));
    }
    if config.intake.max_download_bytes == 0 || config.intake.download_timeout_secs == 0 {
        return Err(ConfigError::Invalid(
            "intake.max_download_bytes and intake.download_timeout_secs must be > 0".into(),
        ));
    }
    if config.completion.model.trim().is_empty() {
        return Err(ConfigError::Invalid("completion.model must not be empty".into()));
    }
    match config.logging.format.as_str() {
        "pretty" | "compact" | "json" => {}
        other => {
            return Err(ConfigError::Invalid(format!(
                "Unknown logging.format: '{}'. Must be pretty, compact, or json.",
                other
            )))
        }
    }
    Ok(())
}

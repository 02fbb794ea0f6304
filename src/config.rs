use anyhow::{Context, Result};
use dirs::{config_dir, data_dir};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for RepoVault
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    /// Source-control account and credentials
    #[serde(default)]
    pub github: GitHubConfig,

    /// Storage provider credentials and endpoints
    #[serde(default)]
    pub drive: DriveConfig,

    /// Backup pipeline behavior
    #[serde(default)]
    pub backup: BackupConfig,

    /// HTTP control surface
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Run history database
    #[serde(default)]
    pub history: HistoryConfig,
}

/// GitHub configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GitHubConfig {
    /// Account whose repositories are backed up
    pub account: Option<String>,

    /// Personal access token (falls back to GITHUB_TOKEN / gh CLI)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Authentication method
    #[serde(default = "default_auth_method")]
    pub auth_method: String, // "auto", "gh_cli", "token"

    /// REST API base URL
    #[serde(default = "default_github_api_url")]
    pub api_url: String,

    /// Web base URL used for source archive downloads
    #[serde(default = "default_github_web_url")]
    pub web_url: String,

    /// Repositories requested per listing page
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

/// Google Drive configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DriveConfig {
    pub client_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    /// Long-lived refresh token, never rewritten by the application
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    pub redirect_uri: Option<String>,

    /// Destination folder for uploads; also scopes retention listing
    pub folder_id: Option<String>,

    /// Plain-text file holding the current access token
    #[serde(default = "default_token_file")]
    pub token_file: String,

    #[serde(default = "default_token_url")]
    pub token_url: String,

    #[serde(default = "default_drive_api_url")]
    pub api_url: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
}

/// Backup pipeline configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BackupConfig {
    /// Shared temporary root for working copies and archives
    #[serde(default = "default_working_directory")]
    pub working_directory: String,

    /// Maximum age of a remote archive before it is swept
    #[serde(default = "default_retention")]
    pub retention: String, // "2d"

    /// Schedule interval
    #[serde(default = "default_interval")]
    pub interval: String, // "1h"

    /// Fire a run as soon as the scheduler starts
    #[serde(default)]
    pub run_on_start: bool,

    /// Deflate level for archives (0-9)
    #[serde(default = "default_compression_level")]
    pub compression_level: i64,

    /// Redirect hops allowed when downloading source archives
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,

    /// Timeout for a single git clone in seconds
    #[serde(default = "default_clone_timeout")]
    pub clone_timeout: u64,

    /// Keep the .git directory of shallow clones inside archives
    #[serde(default)]
    pub keep_git_metadata: bool,
}

/// Control surface configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Log format
    #[serde(default = "default_log_format")]
    pub format: String, // "compact", "full"
}

/// Run history configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HistoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_history_database")]
    pub database: String,
}

// Default value functions
fn default_auth_method() -> String {
    "auto".to_string()
}
fn default_github_api_url() -> String {
    "https://api.github.com".to_string()
}
fn default_github_web_url() -> String {
    "https://github.com".to_string()
}
fn default_page_size() -> u32 {
    100
}
fn default_token_url() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}
fn default_drive_api_url() -> String {
    "https://www.googleapis.com".to_string()
}
fn default_request_timeout() -> u64 {
    300
}
fn default_true() -> bool {
    true
}
fn default_retention() -> String {
    "2d".to_string()
}
fn default_interval() -> String {
    "1h".to_string()
}
fn default_compression_level() -> i64 {
    9
}
fn default_max_redirects() -> usize {
    5
}
fn default_clone_timeout() -> u64 {
    600
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}

fn default_working_directory() -> String {
    std::env::temp_dir()
        .join("repovault")
        .to_string_lossy()
        .into_owned()
}

fn app_data_file(name: &str) -> String {
    data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("repovault")
        .join(name)
        .to_string_lossy()
        .into_owned()
}

fn default_token_file() -> String {
    app_data_file("access_token")
}

fn default_history_database() -> String {
    app_data_file("history.db")
}

// Default implementations
impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            account: None,
            token: None,
            auth_method: default_auth_method(),
            api_url: default_github_api_url(),
            web_url: default_github_web_url(),
            page_size: default_page_size(),
        }
    }
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            refresh_token: None,
            redirect_uri: None,
            folder_id: None,
            token_file: default_token_file(),
            token_url: default_token_url(),
            api_url: default_drive_api_url(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            working_directory: default_working_directory(),
            retention: default_retention(),
            interval: default_interval(),
            run_on_start: false,
            compression_level: default_compression_level(),
            max_redirects: default_max_redirects(),
            clone_timeout: default_clone_timeout(),
            keep_git_metadata: false,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            bind: default_bind(),
            port: default_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            database: default_history_database(),
        }
    }
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            let mut config = Self::default();

            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            // Saved before env overrides so secrets from the environment never land on disk
            config.save(&config_path)?;
            tracing::info!("Created default configuration at: {:?}", config_path);

            config.apply_env_overrides();
            config.expand_paths()?;
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.apply_env_overrides();
        config.expand_paths()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("repovault").join("config.yml"))
    }

    /// Overlay credentials and ports supplied through the environment
    pub fn apply_env_overrides(&mut self) {
        fn var(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.trim().is_empty())
        }

        if let Some(account) = var("GITHUB_USERNAME") {
            self.github.account = Some(account);
        }
        if let Some(token) = var("GITHUB_TOKEN") {
            self.github.token = Some(token);
        }
        if let Some(client_id) = var("GOOGLE_CLIENT_ID") {
            self.drive.client_id = Some(client_id);
        }
        if let Some(secret) = var("GOOGLE_CLIENT_SECRET") {
            self.drive.client_secret = Some(secret);
        }
        if let Some(refresh) = var("GOOGLE_REFRESH_TOKEN") {
            self.drive.refresh_token = Some(refresh);
        }
        if let Some(redirect) = var("GOOGLE_REDIRECT_URI") {
            self.drive.redirect_uri = Some(redirect);
        }
        if let Some(folder) = var("GOOGLE_DRIVE_FOLDER_ID") {
            self.drive.folder_id = Some(folder);
        }
        if let Some(port) = var("PORT") {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!("Ignoring invalid PORT value: {}", port),
            }
        }
    }

    /// Expand environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.backup.working_directory = shellexpand::full(&self.backup.working_directory)
            .context("Failed to expand working_directory path")?
            .into_owned();

        self.drive.token_file = shellexpand::full(&self.drive.token_file)
            .context("Failed to expand token_file path")?
            .into_owned();

        self.history.database = shellexpand::full(&self.history.database)
            .context("Failed to expand history database path")?
            .into_owned();

        Ok(())
    }

    pub fn working_directory(&self) -> PathBuf {
        PathBuf::from(&self.backup.working_directory)
    }

    /// Retention window for remote archives
    pub fn retention_window(&self) -> Result<Duration> {
        parse_duration(&self.backup.retention)
            .with_context(|| format!("Invalid retention: {}", self.backup.retention))
    }

    /// Interval between scheduled runs
    pub fn schedule_interval(&self) -> Result<Duration> {
        let interval = parse_duration(&self.backup.interval)
            .with_context(|| format!("Invalid interval: {}", self.backup.interval))?;
        anyhow::ensure!(!interval.is_zero(), "Schedule interval must be greater than zero");
        Ok(interval)
    }
}

/// Parse duration strings like "30m", "1h", "2d"
pub fn parse_duration(duration_str: &str) -> Result<Duration> {
    let duration_str = duration_str.trim().to_lowercase();

    let secs = if let Some(value) = duration_str.strip_suffix('s') {
        value.parse::<u64>().context("Invalid seconds value")?
    } else if let Some(value) = duration_str.strip_suffix('m') {
        value.parse::<u64>().map(|v| v * 60).context("Invalid minutes value")?
    } else if let Some(value) = duration_str.strip_suffix('h') {
        value.parse::<u64>().map(|v| v * 3600).context("Invalid hours value")?
    } else if let Some(value) = duration_str.strip_suffix('d') {
        value.parse::<u64>().map(|v| v * 86400).context("Invalid days value")?
    } else {
        // Try to parse as raw seconds
        duration_str
            .parse::<u64>()
            .context("Invalid duration format. Use format like '30m', '1h', '2d'")?
    };

    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tempfile::TempDir;

    const ENV_KEYS: [&str; 8] = [
        "GITHUB_USERNAME",
        "GITHUB_TOKEN",
        "GOOGLE_CLIENT_ID",
        "GOOGLE_CLIENT_SECRET",
        "GOOGLE_REFRESH_TOKEN",
        "GOOGLE_REDIRECT_URI",
        "GOOGLE_DRIVE_FOLDER_ID",
        "PORT",
    ];

    fn clear_env() {
        for key in ENV_KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    fn test_config_default_values() {
        let config = Config::default();

        assert_eq!(config.github.api_url, "https://api.github.com");
        assert_eq!(config.github.page_size, 100);
        assert_eq!(config.backup.retention, "2d");
        assert_eq!(config.backup.interval, "1h");
        assert_eq!(config.backup.compression_level, 9);
        assert_eq!(config.backup.max_redirects, 5);
        assert!(!config.backup.keep_git_metadata);
        assert_eq!(config.server.port, 3000);
        assert!(config.drive.token_file.ends_with("access_token"));
        assert!(config.drive.folder_id.is_none());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("2d").unwrap(), Duration::from_secs(172_800));
        assert_eq!(parse_duration(" 2D ").unwrap(), Duration::from_secs(172_800));
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_retention_window_default_is_two_days() {
        let config = Config::default();
        assert_eq!(
            config.retention_window().unwrap(),
            Duration::from_secs(2 * 86400)
        );
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut config = Config::default();
        config.backup.interval = "0m".to_string();
        assert!(config.schedule_interval().is_err());
    }

    #[test]
    #[serial]
    fn test_expand_paths() {
        env::set_var("TEST_REPOVAULT_HOME", "/test/home");

        let mut config = Config::default();
        config.backup.working_directory = "${TEST_REPOVAULT_HOME}/work".to_string();
        config.drive.token_file = "${TEST_REPOVAULT_HOME}/token".to_string();

        config.expand_paths().expect("Failed to expand paths");

        assert_eq!(config.backup.working_directory, "/test/home/work");
        assert_eq!(config.drive.token_file, "/test/home/token");

        env::remove_var("TEST_REPOVAULT_HOME");
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        env::set_var("GITHUB_USERNAME", "octocat");
        env::set_var("GOOGLE_REFRESH_TOKEN", "refresh-from-env");
        env::set_var("GOOGLE_DRIVE_FOLDER_ID", "folder-123");
        env::set_var("PORT", "8081");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.github.account.as_deref(), Some("octocat"));
        assert_eq!(config.drive.refresh_token.as_deref(), Some("refresh-from-env"));
        assert_eq!(config.drive.folder_id.as_deref(), Some("folder-123"));
        assert_eq!(config.server.port, 8081);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_port_env_is_ignored() {
        clear_env();
        env::set_var("PORT", "not-a-port");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.server.port, 3000);

        clear_env();
    }

    #[test]
    fn test_config_load_nonexistent_file() {
        let nonexistent_path = Path::new("/nonexistent/path/config.yml");
        let result = Config::load(nonexistent_path);
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn test_config_save_and_load() {
        clear_env();
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("config.yml");

        let mut config = Config::default();
        config.github.account = Some("testuser".to_string());
        config.backup.retention = "7d".to_string();
        config.server.port = 9000;

        config.save(&config_path).expect("Failed to save config");
        let loaded = Config::load(&config_path).expect("Failed to load config");

        assert_eq!(loaded.github.account, Some("testuser".to_string()));
        assert_eq!(loaded.backup.retention, "7d");
        assert_eq!(loaded.server.port, 9000);
    }

    #[test]
    fn test_secrets_not_serialized_when_absent() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(!yaml.contains("client_secret"));
        assert!(!yaml.contains("refresh_token"));
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml_content = r#"
github:
  account: "octocat"
  auth_method: "token"
  page_size: 50
drive:
  client_id: "client"
  client_secret: "secret"
  refresh_token: "refresh"
  folder_id: "folder"
  token_file: "/var/lib/repovault/token"
backup:
  working_directory: "/tmp/backups"
  retention: "3d"
  interval: "30m"
  run_on_start: true
  keep_git_metadata: true
server:
  enabled: false
  port: 8080
logging:
  level: "debug"
"#;

        let config: Config = serde_yaml::from_str(yaml_content).expect("Failed to parse YAML");

        assert_eq!(config.github.account.as_deref(), Some("octocat"));
        assert_eq!(config.github.auth_method, "token");
        assert_eq!(config.github.page_size, 50);
        assert_eq!(config.github.web_url, "https://github.com");
        assert_eq!(config.drive.refresh_token.as_deref(), Some("refresh"));
        assert_eq!(config.drive.folder_id.as_deref(), Some("folder"));
        assert_eq!(config.drive.token_url, "https://oauth2.googleapis.com/token");
        assert_eq!(config.backup.retention, "3d");
        assert!(config.backup.run_on_start);
        assert!(config.backup.keep_git_metadata);
        assert_eq!(config.backup.compression_level, 9);
        assert!(!config.server.enabled);
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.logging.level, "debug");
        assert!(config.history.enabled);
    }

    #[test]
    fn test_example_config_parses() {
        let config: Config = serde_yaml::from_str(include_str!("../config.example.yml"))
            .expect("Failed to parse config.example.yml");

        assert_eq!(config.github.account.as_deref(), Some("octocat"));
        assert!(config.drive.client_secret.is_none());
        assert_eq!(config.retention_window().unwrap(), Duration::from_secs(2 * 86400));
        assert_eq!(config.schedule_interval().unwrap(), Duration::from_secs(3600));
    }
}

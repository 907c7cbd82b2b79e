//! Configuration file management for campaignd.
//!
//! Provides a TOML-based config file at `~/.config/campaignd/config.toml`
//! and a resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use campaignd_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub smtp: SmtpSection,
    #[serde(default)]
    pub server: ServerSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SmtpSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub notify_from: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ServerSection {
    pub port: Option<u16>,
    pub timezone: Option<String>,
    pub enable_cron_on_startup: Option<bool>,
    pub log_level: Option<String>,
    pub log_file: Option<String>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the campaignd config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/campaignd` or
/// `~/.config/campaignd`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("campaignd");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("campaignd")
}

/// Return the path to the campaignd config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Load and parse the config file, if one exists. Absence is not an error:
/// every field also has an env var and a default to fall back to.
fn load_config() -> Option<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str(&contents) {
        Ok(config) => Some(config),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "ignoring malformed config file");
            None
        }
    }
}

/// Write a starter config file to `config_path()`, creating parent dirs as
/// needed and setting owner-only permissions on Unix. Refuses to overwrite
/// an existing file unless `force`.
pub fn write_starter_config(database_url: &str, force: bool) -> Result<PathBuf> {
    let path = config_path();
    if path.exists() && !force {
        anyhow::bail!("config file already exists at {} (use --force to overwrite)", path.display());
    }

    let dir = config_dir();
    std::fs::create_dir_all(&dir).with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let config = ConfigFile {
        database: DatabaseSection {
            url: Some(database_url.to_owned()),
        },
        smtp: SmtpSection::default(),
        server: ServerSection {
            port: Some(DEFAULT_PORT),
            timezone: Some(DEFAULT_TIMEZONE.to_owned()),
            enable_cron_on_startup: Some(true),
            log_level: Some(DEFAULT_LOG_LEVEL.to_owned()),
            log_file: None,
        },
    };

    let contents = toml::to_string_pretty(&config).context("failed to serialize config")?;
    std::fs::write(&path, &contents).with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms).with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(path)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// SMTP settings resolved into the shape `campaignd_core::notify::Notifier`
/// expects. `None` when no host is configured: resolution falls through to
/// `Notifier::new(None)`, which no-ops sends with a warning.
#[derive(Debug, Clone)]
pub struct ResolvedSmtp {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
}

/// Fully resolved configuration, ready for use by every subcommand.
#[derive(Debug, Clone)]
pub struct CampaigndConfig {
    pub db_config: DbConfig,
    pub smtp: Option<ResolvedSmtp>,
    pub port: u16,
    pub timezone: String,
    pub enable_cron_on_startup: bool,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

const DEFAULT_PORT: u16 = 3020;
const DEFAULT_TIMEZONE: &str = "UTC";
const DEFAULT_LOG_LEVEL: &str = "info";

impl CampaigndConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default, field by field.
    ///
    /// - DB URL: `cli_database_url` > `CAMPAIGND_DATABASE_URL` > config file > `DbConfig::DEFAULT_URL`
    /// - Port: `cli_port` > `CAMPAIGND_PORT` > config file > `3020`
    /// - SMTP: `CAMPAIGND_SMTP_*` env vars > config file > unconfigured
    pub fn resolve(cli_database_url: Option<&str>, cli_port: Option<u16>) -> Result<Self> {
        let file = load_config();

        let database_url = cli_database_url
            .map(str::to_owned)
            .or_else(|| std::env::var("CAMPAIGND_DATABASE_URL").ok())
            .or_else(|| file.as_ref().and_then(|f| f.database.url.clone()))
            .unwrap_or_else(|| DbConfig::DEFAULT_URL.to_owned());
        let db_config = DbConfig::new(database_url);

        let port = cli_port
            .or_else(|| std::env::var("CAMPAIGND_PORT").ok().and_then(|v| v.parse().ok()))
            .or_else(|| file.as_ref().and_then(|f| f.server.port))
            .unwrap_or(DEFAULT_PORT);

        let timezone = std::env::var("CAMPAIGND_DEFAULT_TIMEZONE")
            .ok()
            .or_else(|| file.as_ref().and_then(|f| f.server.timezone.clone()))
            .unwrap_or_else(|| DEFAULT_TIMEZONE.to_owned());

        let enable_cron_on_startup = std::env::var("CAMPAIGND_ENABLE_CRON_ON_STARTUP")
            .ok()
            .map(|v| v != "false" && v != "0")
            .or_else(|| file.as_ref().and_then(|f| f.server.enable_cron_on_startup))
            .unwrap_or(true);

        let log_level = std::env::var("CAMPAIGND_LOG_LEVEL")
            .ok()
            .or_else(|| file.as_ref().and_then(|f| f.server.log_level.clone()))
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_owned());

        let log_file = std::env::var("CAMPAIGND_LOG_FILE")
            .ok()
            .or_else(|| file.as_ref().and_then(|f| f.server.log_file.clone()))
            .map(PathBuf::from);

        let smtp = Self::resolve_smtp(file.as_ref());

        Ok(Self {
            db_config,
            smtp,
            port,
            timezone,
            enable_cron_on_startup,
            log_level,
            log_file,
        })
    }

    fn resolve_smtp(file: Option<&ConfigFile>) -> Option<ResolvedSmtp> {
        let host = std::env::var("CAMPAIGND_SMTP_HOST")
            .ok()
            .or_else(|| file.and_then(|f| f.smtp.host.clone()))?;

        let port = std::env::var("CAMPAIGND_SMTP_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .or_else(|| file.and_then(|f| f.smtp.port))
            .unwrap_or(587);

        let username = std::env::var("CAMPAIGND_SMTP_USER")
            .ok()
            .or_else(|| file.and_then(|f| f.smtp.username.clone()))
            .unwrap_or_default();

        let password = std::env::var("CAMPAIGND_SMTP_PASS")
            .ok()
            .or_else(|| file.and_then(|f| f.smtp.password.clone()))
            .unwrap_or_default();

        let from = std::env::var("CAMPAIGND_NOTIFY_FROM")
            .ok()
            .or_else(|| file.and_then(|f| f.smtp.notify_from.clone()))
            .unwrap_or_else(|| username.clone());

        Some(ResolvedSmtp {
            host,
            port,
            username,
            password,
            from,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|e| e.into_inner())
    }

    #[test]
    fn resolve_defaults_when_nothing_set() {
        let _lock = lock_env();
        unsafe { std::env::remove_var("CAMPAIGND_DATABASE_URL") };
        unsafe { std::env::remove_var("CAMPAIGND_PORT") };
        unsafe { std::env::remove_var("CAMPAIGND_SMTP_HOST") };
        unsafe { std::env::set_var("XDG_CONFIG_HOME", "/nonexistent-campaignd-test-dir") };

        let config = CampaigndConfig::resolve(None, None).unwrap();
        assert_eq!(config.db_config.database_url, DbConfig::DEFAULT_URL);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.timezone, "UTC");
        assert!(config.enable_cron_on_startup);
        assert!(config.smtp.is_none());
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert!(config.log_file.is_none());

        unsafe { std::env::remove_var("XDG_CONFIG_HOME") };
    }

    #[test]
    fn log_level_and_file_resolve_from_env() {
        let _lock = lock_env();
        unsafe { std::env::set_var("CAMPAIGND_LOG_LEVEL", "debug") };
        unsafe { std::env::set_var("CAMPAIGND_LOG_FILE", "/var/log/campaignd/campaignd.log") };
        unsafe { std::env::set_var("XDG_CONFIG_HOME", "/nonexistent-campaignd-test-dir") };

        let config = CampaigndConfig::resolve(None, None).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.log_file, Some(PathBuf::from("/var/log/campaignd/campaignd.log")));

        unsafe { std::env::remove_var("CAMPAIGND_LOG_LEVEL") };
        unsafe { std::env::remove_var("CAMPAIGND_LOG_FILE") };
        unsafe { std::env::remove_var("XDG_CONFIG_HOME") };
    }

    #[test]
    fn cli_flag_overrides_env_and_default() {
        let _lock = lock_env();
        unsafe { std::env::set_var("CAMPAIGND_DATABASE_URL", "postgresql://env:5432/envdb") };

        let config = CampaigndConfig::resolve(Some("postgresql://cli:5432/clidb"), Some(9000)).unwrap();
        assert_eq!(config.db_config.database_url, "postgresql://cli:5432/clidb");
        assert_eq!(config.port, 9000);

        unsafe { std::env::remove_var("CAMPAIGND_DATABASE_URL") };
    }

    #[test]
    fn smtp_resolves_when_host_present() {
        let _lock = lock_env();
        unsafe { std::env::set_var("CAMPAIGND_SMTP_HOST", "smtp.example.com") };
        unsafe { std::env::set_var("CAMPAIGND_SMTP_PORT", "2525") };

        let config = CampaigndConfig::resolve(None, None).unwrap();
        let smtp = config.smtp.expect("smtp should resolve once host is set");
        assert_eq!(smtp.host, "smtp.example.com");
        assert_eq!(smtp.port, 2525);

        unsafe { std::env::remove_var("CAMPAIGND_SMTP_HOST") };
        unsafe { std::env::remove_var("CAMPAIGND_SMTP_PORT") };
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(path.ends_with("campaignd/config.toml"));
    }
}

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use libwarden::ProtocolVersion;
use libwarden::version::{self, PROTOCOL_NAME};
use serde::Deserialize;
use thiserror::Error;

use crate::executor::PagingLimits;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("unknown protocol version {0:?}")]
    UnknownVersion(String),
    #[error("no protocol versions enabled")]
    NoVersions,
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub idle_timeout_secs: u64,
    /// How often idle sessions are swept
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 1800,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PagingConfig {
    pub default_page_size: u32,
    pub max_page_size: u32,
}

impl Default for PagingConfig {
    fn default() -> Self {
        let limits = PagingLimits::default();
        Self {
            default_page_size: limits.default_page_size,
            max_page_size: limits.max_page_size,
        }
    }
}

/// Login attempts allowed per remote host within a sliding window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub attempts: u32,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            attempts: 10,
            window_secs: 60,
        }
    }
}

/// Administrator created at startup when no account of that name exists
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct BootstrapAdmin {
    pub name: String,
    pub email: String,
    pub real_name: String,
    pub password: String,
}

impl fmt::Debug for BootstrapAdmin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapAdmin")
            .field("name", &self.name)
            .field("email", &self.email)
            .field("real_name", &self.real_name)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Main configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen: SocketAddr,
    /// Advertised protocol versions, e.g. `["1.0", "1.1"]`
    pub versions: Vec<String>,
    pub session: SessionConfig,
    pub paging: PagingConfig,
    pub rate_limit: RateLimitConfig,
    pub bootstrap: Option<BootstrapAdmin>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 7480)),
            versions: vec!["1.0".into(), "1.1".into()],
            session: SessionConfig::default(),
            paging: PagingConfig::default(),
            rate_limit: RateLimitConfig::default(),
            bootstrap: None,
        }
    }
}

impl Config {
    /// Load `path`, or the default location when `None`.
    ///
    /// A missing file at the default location yields the defaults; a missing
    /// explicit path is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::config_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// `~/.config/warden/wardend.toml`
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("warden/wardend.toml"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.protocol_versions()?;
        if self.paging.default_page_size == 0 || self.paging.max_page_size == 0 {
            return Err(ConfigError::Invalid("page sizes must be positive".into()));
        }
        if self.paging.default_page_size > self.paging.max_page_size {
            return Err(ConfigError::Invalid(
                "default_page_size exceeds max_page_size".into(),
            ));
        }
        if self.session.idle_timeout_secs == 0 || self.session.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid("session intervals must be positive".into()));
        }
        if self.rate_limit.attempts == 0 || self.rate_limit.window_secs == 0 {
            return Err(ConfigError::Invalid("rate limit must allow attempts".into()));
        }
        Ok(())
    }

    /// The enabled versions, resolved against the known protocol table
    pub fn protocol_versions(&self) -> Result<Vec<ProtocolVersion>, ConfigError> {
        let mut resolved: Vec<ProtocolVersion> = Vec::new();
        for entry in &self.versions {
            let unknown = || ConfigError::UnknownVersion(entry.clone());
            let (major, minor) = entry.trim().split_once('.').ok_or_else(unknown)?;
            let major = major.parse().map_err(|_| unknown())?;
            let minor = minor.parse().map_err(|_| unknown())?;
            let identifier = libwarden::ProtocolIdentifier::new(PROTOCOL_NAME, major, minor);
            let version = version::find(&identifier).ok_or_else(unknown)?;
            if !resolved.iter().any(|v| v.matches(&identifier)) {
                resolved.push(version);
            }
        }
        if resolved.is_empty() {
            return Err(ConfigError::NoVersions);
        }
        Ok(resolved)
    }

    pub fn paging_limits(&self) -> PagingLimits {
        PagingLimits {
            default_page_size: self.paging.default_page_size,
            max_page_size: self.paging.max_page_size,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.session.sweep_interval_secs)
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit.window_secs)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use libwarden::version::{V1_0, V1_1};

    use super::*;

    fn write(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn empty_file_gives_defaults() {
        let file = write("");
        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.protocol_versions().unwrap(), vec![V1_0, V1_1]);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let file = write(
            r#"
            listen = "0.0.0.0:9000"
            versions = ["1.0"]

            [paging]
            max_page_size = 100

            [bootstrap]
            name = "root"
            email = "root@example.org"
            real_name = "Root"
            password = "hunter22"
            "#,
        );
        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.listen.port(), 9000);
        assert_eq!(config.protocol_versions().unwrap(), vec![V1_0]);
        assert_eq!(config.paging.max_page_size, 100);
        assert_eq!(config.paging.default_page_size, 50);
        assert_eq!(config.session, SessionConfig::default());

        let bootstrap = config.bootstrap.unwrap();
        assert_eq!(bootstrap.name, "root");
        assert!(!format!("{bootstrap:?}").contains("hunter22"));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let file = write(r#"versions = ["1.0", "2.7"]"#);
        let err = Config::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownVersion(v) if v == "2.7"));

        let file = write(r#"versions = []"#);
        assert!(matches!(
            Config::load(Some(file.path())),
            Err(ConfigError::NoVersions)
        ));
    }

    #[test]
    fn inconsistent_paging_is_rejected() {
        let file = write("[paging]\ndefault_page_size = 80\nmax_page_size = 40\n");
        assert!(matches!(
            Config::load(Some(file.path())),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let file = write("listen = 42");
        assert!(matches!(
            Config::load(Some(file.path())),
            Err(ConfigError::Parse { .. })
        ));
    }
}

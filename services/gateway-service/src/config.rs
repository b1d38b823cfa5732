//! Configuration types and loading
//!
//! Precedence: CLI args > env vars > config file > defaults. Only the
//! upstream base URL has an env overlay (`UPSTREAM_BASE_URL`), so one image
//! can be pointed at different backends without editing the file.

use gateway::Endpoints;
use serde::Deserialize;
use session::{CookiePolicy, SameSite};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub cookies: CookieConfig,
}

/// Inbound listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Upstream backend settings
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_recovery_path")]
    pub recovery_path: String,
    #[serde(default = "default_sign_in_path")]
    pub sign_in_path: String,
    #[serde(default = "default_sign_out_path")]
    pub sign_out_path: String,
}

/// Session cookie attributes
#[derive(Debug, Deserialize)]
pub struct CookieConfig {
    #[serde(default = "default_secure")]
    pub secure: bool,
    #[serde(default = "default_same_site")]
    pub same_site: SameSite,
    #[serde(default = "default_access_max_age")]
    pub access_max_age_secs: u64,
    #[serde(default = "default_refresh_max_age")]
    pub refresh_max_age_secs: u64,
    #[serde(default = "default_cookie_path")]
    pub path: String,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            secure: default_secure(),
            same_site: default_same_site(),
            access_max_age_secs: default_access_max_age(),
            refresh_max_age_secs: default_refresh_max_age(),
            path: default_cookie_path(),
        }
    }
}

fn default_timeout() -> u64 {
    30
}

fn default_max_connections() -> usize {
    1000
}

fn default_recovery_path() -> String {
    Endpoints::default().recovery
}

fn default_sign_in_path() -> String {
    Endpoints::default().sign_in
}

fn default_sign_out_path() -> String {
    Endpoints::default().sign_out
}

fn default_secure() -> bool {
    true
}

fn default_same_site() -> SameSite {
    SameSite::Lax
}

fn default_access_max_age() -> u64 {
    15 * 60
}

fn default_refresh_max_age() -> u64 {
    7 * 24 * 60 * 60
}

fn default_cookie_path() -> String {
    "/".into()
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn endpoints(&self) -> Endpoints {
        Endpoints {
            sign_in: self.sign_in_path.clone(),
            sign_out: self.sign_out_path.clone(),
            recovery: self.recovery_path.clone(),
        }
    }
}

impl CookieConfig {
    pub fn policy(&self) -> CookiePolicy {
        CookiePolicy {
            path: self.path.clone(),
            secure: self.secure,
            same_site: self.same_site,
            access_max_age: Duration::from_secs(self.access_max_age_secs),
            refresh_max_age: Duration::from_secs(self.refresh_max_age_secs),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(url) = std::env::var("UPSTREAM_BASE_URL") {
            config.upstream.base_url = url;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let base_url = &self.upstream.base_url;
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(common::Error::InvalidValue {
                field: "upstream.base_url",
                reason: format!("must start with http:// or https://, got: {base_url}"),
            });
        }

        if self.upstream.timeout_secs == 0 {
            return Err(common::Error::InvalidValue {
                field: "upstream.timeout_secs",
                reason: "must be greater than 0".into(),
            });
        }

        if self.server.max_connections == 0 {
            return Err(common::Error::InvalidValue {
                field: "server.max_connections",
                reason: "must be greater than 0".into(),
            });
        }

        // Browsers reject SameSite=None cookies without Secure
        if self.cookies.same_site == SameSite::None && !self.cookies.secure {
            return Err(common::Error::Config(
                "cookies.same_site = \"None\" requires cookies.secure = true".into(),
            ));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("dashboard-gateway.toml")
    }
}

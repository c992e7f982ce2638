//! Configuration handling for samlvpn
//!
//! The config file is TOML. Every key has a default except the path to the
//! OpenVPN profile, so a minimal file is a single line:
//!
//! ```toml
//! openvpn_config_file = "~/.config/samlvpn/client.ovpn"
//! ```

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Widest mode the credentials file may be created with (owner read/write).
pub const MAX_CREDENTIALS_PERMISSIONS: u32 = 0o600;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
    #[error("No config file found, looked in: {0}")]
    NotFound(String),
    #[error("Invalid config:\n- {}", .0.join("\n- "))]
    Invalid(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the (SAML-patched) OpenVPN binary.
    pub openvpn_binary: PathBuf,
    /// Path to the OpenVPN profile used for both the probe and the session.
    pub openvpn_config_file: PathBuf,
    /// Address the SAML callback listener binds to.
    pub server_address: SocketAddr,
    /// How long to wait for the browser to deliver the SAML response.
    pub server_timeout_secs: u64,
    /// Deadline for the challenge probe.
    pub probe_timeout_secs: u64,
    /// Command used to open the challenge URL. `%s` is replaced by the URL,
    /// otherwise the URL is appended. Empty means print the URL instead.
    pub browser_command: Vec<String>,
    /// Optional page to send the browser to once the SAML response arrived.
    pub redirect_url: Option<String>,
    /// Run OpenVPN ourselves. When false the final command is printed.
    pub run_command: bool,
    /// Prefix the OpenVPN session with sudo (skipped when already root).
    pub use_sudo: bool,
    /// How many times to re-run OpenVPN after an AUTH_FAILED.
    pub auth_failed_retries: u32,
    /// Command to run once an established connection is lost.
    pub connection_lost_command: Vec<String>,
    pub temp_credentials_file_path: PathBuf,
    pub temp_credentials_file_permissions: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            openvpn_binary: PathBuf::from("openvpn"),
            openvpn_config_file: PathBuf::new(),
            server_address: SocketAddr::from(([127, 0, 0, 1], 35001)),
            server_timeout_secs: 60,
            probe_timeout_secs: 30,
            browser_command: vec!["xdg-open".to_string()],
            redirect_url: None,
            run_command: true,
            use_sudo: true,
            auth_failed_retries: 0,
            connection_lost_command: Vec::new(),
            temp_credentials_file_path: default_credentials_path(),
            temp_credentials_file_permissions: 0o400,
        }
    }
}

impl Config {
    /// Load a config file, expanding `~` and `$VAR` in path values.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.expand_paths();
        Ok(config)
    }

    /// Load `explicit` if given, otherwise the first default location that exists.
    pub fn find(explicit: Option<&Path>) -> Result<(PathBuf, Self), ConfigError> {
        if let Some(path) = explicit {
            return Ok((path.to_path_buf(), Self::load(path)?));
        }

        let candidates = default_search_paths();
        for path in &candidates {
            debug!("Looking for config at {}", path.display());
            if path.exists() {
                return Ok((path.clone(), Self::load(path)?));
            }
        }

        Err(ConfigError::NotFound(
            candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
        ))
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check every setting and report all problems together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.openvpn_binary.as_os_str().is_empty() {
            problems.push("openvpn_binary must not be empty".to_string());
        }
        if self.openvpn_config_file.as_os_str().is_empty() {
            problems.push("openvpn_config_file is required".to_string());
        }
        if self.server_timeout_secs == 0 {
            problems.push("server_timeout_secs must be greater than zero".to_string());
        }
        if self.probe_timeout_secs == 0 {
            problems.push("probe_timeout_secs must be greater than zero".to_string());
        }
        if self.temp_credentials_file_path.as_os_str().is_empty() {
            problems.push("temp_credentials_file_path must not be empty".to_string());
        }
        if self.temp_credentials_file_permissions & !MAX_CREDENTIALS_PERMISSIONS != 0 {
            problems.push(format!(
                "temp_credentials_file_permissions {:o} is broader than owner read/write ({:o})",
                self.temp_credentials_file_permissions, MAX_CREDENTIALS_PERMISSIONS
            ));
        }
        if self.temp_credentials_file_permissions & 0o400 == 0 {
            problems.push("temp_credentials_file_permissions must allow owner read".to_string());
        }
        if let Some(url) = &self.redirect_url {
            if url::Url::parse(url).is_err() {
                problems.push(format!("redirect_url {:?} is not an absolute URL", url));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    pub fn server_timeout(&self) -> Duration {
        Duration::from_secs(self.server_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    fn expand_paths(&mut self) {
        self.openvpn_binary = expand_path(&self.openvpn_binary);
        self.openvpn_config_file = expand_path(&self.openvpn_config_file);
        self.temp_credentials_file_path = expand_path(&self.temp_credentials_file_path);
    }
}

/// Default config locations, most specific first.
pub fn default_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        let xdg = PathBuf::from(xdg);
        paths.push(xdg.join("samlvpn").join("config.toml"));
        paths.push(xdg.join("samlvpn.toml"));
    }
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config").join("samlvpn.toml"));
        paths.push(home.join(".samlvpn.toml"));
    }

    paths
}

/// Where the credentials file lives unless configured otherwise.
pub fn default_credentials_path() -> PathBuf {
    if let Some(cache) = dirs::cache_dir() {
        return cache.join("samlvpn-credentials");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".samlvpn-credentials")
}

/// Expand a leading `~` and `$VAR` / `${VAR}` references. Unknown variables
/// expand to nothing.
pub fn expand_path(path: &Path) -> PathBuf {
    PathBuf::from(expand_vars(&path.to_string_lossy(), |key| {
        std::env::var(key).ok()
    }))
}

fn expand_vars<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut input = input.to_string();
    if input == "~" || input.starts_with("~/") {
        if let Some(home) = lookup("HOME") {
            input.replace_range(..1, &home);
        }
    }

    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        let mut name = String::new();
        if chars.peek() == Some(&'{') {
            chars.next();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_ascii_alphanumeric() || c == '_' {
                    name.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
        }

        if name.is_empty() {
            out.push('$');
        } else if let Some(value) = lookup(&name) {
            out.push_str(&value);
        }
    }

    out
}

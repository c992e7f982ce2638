//! OpenVPN profile parsing
//!
//! Only two directives matter to us:
//!
//! | Directive | Example | Used for |
//! |-----------|---------|----------|
//! | `remote` | `remote cvpn-endpoint-0abc.prod.clientvpn.eu-west-1.amazonaws.com 443` | host and port |
//! | `proto` | `proto udp` | `--proto` on the command line |
//!
//! Everything else in the profile is left for OpenVPN to interpret.

use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::config::Config;

const DEFAULT_PROTOCOL: &str = "udp";

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("Failed to read OpenVPN profile {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Line {line}: remote must be followed by a host and a port")]
    MalformedRemote { line: usize },
    #[error("Line {line}: invalid remote port {value:?}")]
    InvalidPort { line: usize, value: String },
    #[error("No remote directive found in OpenVPN profile")]
    MissingRemote,
}

/// Endpoint details pulled out of an OpenVPN profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub host: String,
    pub port: u16,
    pub protocol: String,
}

impl Profile {
    pub fn load(path: &Path) -> Result<Self, ProfileError> {
        let content = std::fs::read_to_string(path).map_err(|source| ProfileError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse profile text. The first `remote` wins, like OpenVPN's own
    /// connection order.
    pub fn parse(content: &str) -> Result<Self, ProfileError> {
        let mut remote: Option<(String, u16)> = None;
        let mut protocol: Option<String> = None;

        for (idx, raw) in content.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            let parts: Vec<&str> = line.split_whitespace().collect();
            match parts[0] {
                "remote" => {
                    if parts.len() != 3 {
                        return Err(ProfileError::MalformedRemote { line: line_no });
                    }
                    let port = parts[2].parse().map_err(|_| ProfileError::InvalidPort {
                        line: line_no,
                        value: parts[2].to_string(),
                    })?;
                    if remote.is_none() {
                        remote = Some((parts[1].to_string(), port));
                    } else {
                        debug!("Ignoring additional remote on line {}", line_no);
                    }
                }
                "proto" if parts.len() >= 2 => {
                    protocol = Some(parts[1].to_string());
                }
                _ => {}
            }
        }

        let (host, port) = remote.ok_or(ProfileError::MissingRemote)?;

        Ok(Self {
            host,
            port,
            protocol: protocol.unwrap_or_else(|| DEFAULT_PROTOCOL.to_string()),
        })
    }
}

/// Everything needed to talk to one VPN endpoint. Built once per run and
/// never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub binary: PathBuf,
    pub config_path: PathBuf,
}

impl SessionContext {
    pub fn new(config: &Config, profile: Profile) -> Self {
        Self {
            host: profile.host,
            port: profile.port,
            protocol: profile.protocol,
            binary: config.openvpn_binary.clone(),
            config_path: config.openvpn_config_file.clone(),
        }
    }

    /// Read the profile named by `config` and build the context from it.
    pub fn load(config: &Config) -> Result<Self, ProfileError> {
        let profile = Profile::load(&config.openvpn_config_file)?;
        Ok(Self::new(config, profile))
    }
}

impl fmt::Display for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} ({}) via {} using {}",
            self.host,
            self.port,
            self.protocol,
            self.binary.display(),
            self.config_path.display()
        )
    }
}

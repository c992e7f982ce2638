//! samlvpn - connect to SAML-authenticated OpenVPN endpoints
//!
//! Endpoints like AWS Client VPN with federated login make the OpenVPN client
//! fail its first attempt with a challenge pointing at the identity provider.
//! This crate drives the external `openvpn` binary through that handshake:
//! it provokes the challenge, opens the login page in a browser, catches the
//! SAML response on a local HTTP endpoint and then runs and watches the real
//! session.
//!
//! # Architecture
//!
//! - `config`: Configuration file handling (TOML)
//! - `openvpn`: Profile parsing and OpenVPN command lines
//! - `process`: Running external programs and reading their output
//! - `saml`: Challenge probe, callback server, credential payload
//! - `vpn`: Endpoint resolution and the session supervisor
//! - `hooks`: Browser launch and connection-lost command
//! - `session`: The connection flow tying it all together
//!
//! # Usage
//!
//! ```bash
//! samlvpn init
//! samlvpn connect
//! ```

pub mod config;
pub mod hooks;
pub mod openvpn;
pub mod process;
pub mod saml;
pub mod session;
pub mod vpn;

pub use config::{Config, ConfigError};
pub use openvpn::{SessionContext, VpnCommand};
pub use process::{Execute, RunOutput, Stream, SystemExecutor};
pub use session::{Connection, Error, SamlVpn};
pub use vpn::{DnsResolver, Outcome, Resolve, Supervisor, SupervisorPolicy};

//! OpenVPN session supervisor
//!
//! Runs the real VPN session and decides what happened from its log, since
//! OpenVPN's exit status does not say whether authentication failed:
//!
//! ```text
//! Building -> Running -> Success
//!                     -> AuthFailed -> Building      (while retries remain)
//!                     -> ConnectionLost -> hook -> done
//!                     -> Cancelled
//!                     -> Error
//! ```
//!
//! Hostname resolution and process execution are injected so the state
//! machine can run against scripted output.

use std::fmt;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::hooks;
use crate::openvpn::command::needs_sudo;
use crate::openvpn::{SessionContext, VpnCommand};
use crate::process::{ExecError, Execute, Stream};
use crate::saml::CredentialFile;
use crate::saml::probe::AUTH_FAILED_MARKER;
use crate::vpn::locator::{Resolve, ResolutionError};

/// Logged once the tunnel is up and routes are in place.
pub const INITIALIZED_MARKER: &str = "Initialization Sequence Completed";

/// Logged when OpenVPN shuts down because of Ctrl+C.
pub const INTERRUPT_MARKER: &str = "SIGINT";

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Could not resolve VPN hostname: {0}")]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("Authentication failed after {attempts} attempt(s)")]
    AuthFailed { attempts: u32 },

    #[error("OpenVPN {}", describe_exit(.0))]
    Exit(Option<i32>),
}

/// How one OpenVPN run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Clean exit without reaching either marker.
    Success,
    /// The server rejected the credentials.
    AuthFailed,
    /// The tunnel came up and the process ended later.
    ConnectionLost,
    /// The tunnel came up and the user stopped it with Ctrl+C.
    Cancelled,
    /// Non-zero exit (or signal) without any marker.
    Error(Option<i32>),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::AuthFailed => write!(f, "authentication failed"),
            Outcome::ConnectionLost => write!(f, "connection lost"),
            Outcome::Cancelled => write!(f, "cancelled"),
            Outcome::Error(code) => write!(f, "OpenVPN {}", describe_exit(code)),
        }
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exited with status {}", code),
        None => "was terminated by a signal".to_string(),
    }
}

/// Classify a finished OpenVPN run from its log lines.
///
/// Markers are matched in the order they appear and the first one decides:
/// AUTH_FAILED before initialization is an auth failure; initialization first
/// means the session was established, so however it ended afterwards it is
/// treated as a lost connection. This is a heuristic. A user pressing Ctrl+C
/// is told apart only by OpenVPN logging the SIGINT after initialization.
pub fn classify(lines: &[String], exit_code: Option<i32>) -> Outcome {
    let mut initialized = false;

    for line in lines {
        if initialized {
            if line.contains(INTERRUPT_MARKER) {
                return Outcome::Cancelled;
            }
        } else if line.contains(AUTH_FAILED_MARKER) {
            return Outcome::AuthFailed;
        } else if line.contains(INITIALIZED_MARKER) {
            initialized = true;
        }
    }

    if initialized {
        return Outcome::ConnectionLost;
    }

    match exit_code {
        Some(0) => Outcome::Success,
        code => Outcome::Error(code),
    }
}

/// Knobs for the supervisor, taken from the config
#[derive(Debug, Clone)]
pub struct SupervisorPolicy {
    /// Re-runs allowed after AUTH_FAILED. Zero means fail on the first one.
    pub retries: u32,
    pub use_sudo: bool,
    pub connection_lost_command: Vec<String>,
    /// Copy OpenVPN's output to our stdout/stderr.
    pub echo_output: bool,
}

impl SupervisorPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retries: config.auth_failed_retries,
            use_sudo: needs_sudo(config.use_sudo),
            connection_lost_command: config.connection_lost_command.clone(),
            echo_output: true,
        }
    }
}

pub struct Supervisor<'a, R, E> {
    context: &'a SessionContext,
    resolver: R,
    executor: E,
    policy: SupervisorPolicy,
}

impl<'a, R: Resolve, E: Execute> Supervisor<'a, R, E> {
    pub fn new(context: &'a SessionContext, resolver: R, executor: E, policy: SupervisorPolicy) -> Self {
        Self {
            context,
            resolver,
            executor,
            policy,
        }
    }

    /// Resolve the endpoint afresh and build the session command.
    pub async fn build_command(&self, credentials: &Path) -> Result<VpnCommand, SupervisorError> {
        let remote = self.resolver.resolve(&self.context.host).await?;
        info!("Remote address: {}", remote);
        Ok(VpnCommand::session(
            self.context,
            remote,
            credentials,
            self.policy.use_sudo,
        ))
    }

    /// Run OpenVPN until it exits for good.
    ///
    /// The credentials file is erased as soon as the tunnel reports it is up.
    pub async fn run(&self, credentials: &CredentialFile) -> Result<Outcome, SupervisorError> {
        let mut attempts = 0;

        loop {
            attempts += 1;
            let command = self.build_command(credentials.path()).await?;

            info!("Starting OpenVPN (attempt {})", attempts);
            debug!("Command: {}", command);

            let echo = self.policy.echo_output;
            let output = self
                .executor
                .run(&command, |stream, line| {
                    if echo {
                        match stream {
                            Stream::Stdout => println!("{}", line),
                            Stream::Stderr => eprintln!("{}", line),
                        }
                    }
                    if line.contains(INITIALIZED_MARKER) {
                        credentials.erase();
                    }
                })
                .await?;

            let outcome = classify(&output.lines, output.exit_code);
            info!("OpenVPN finished: {}", outcome);

            match outcome {
                Outcome::AuthFailed if attempts <= self.policy.retries => {
                    warn!(
                        "Auth failed, retrying ({} of {})",
                        attempts, self.policy.retries
                    );
                }
                Outcome::AuthFailed => return Err(SupervisorError::AuthFailed { attempts }),
                Outcome::ConnectionLost => {
                    warn!("Connection lost. Restart samlvpn to reconnect.");
                    if !hooks::run_connection_lost(&self.policy.connection_lost_command).await {
                        warn!("Connection-lost command failed, continuing shutdown");
                    }
                    return Ok(outcome);
                }
                Outcome::Error(code) => return Err(SupervisorError::Exit(code)),
                Outcome::Success | Outcome::Cancelled => return Ok(outcome),
            }
        }
    }
}

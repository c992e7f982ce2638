//! OpenVPN command lines
//!
//! Commands are plain values so they can be logged, printed for the user to
//! run by hand, or handed to an executor.

use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use crate::openvpn::profile::SessionContext;

/// Auth source that makes OpenVPN read credentials from its stdin.
pub const STDIN_AUTH_SOURCE: &str = "/dev/stdin";

/// Username/password pair that gets the server to answer with a SAML challenge
/// instead of a real authentication attempt.
pub fn probe_credentials(callback_port: u16) -> String {
    format!("N/A\nACS::{}", callback_port)
}

/// One invocation of an external program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpnCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Written to the child's stdin, which is then closed.
    pub stdin: Option<String>,
}

impl VpnCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// The throwaway run that provokes an AUTH_FAILED carrying the challenge.
    pub fn probe(context: &SessionContext, callback_port: u16) -> Self {
        let mut cmd = Self::new(&context.binary)
            .arg("--config")
            .arg(context.config_path.to_string_lossy())
            .args(["--verb", "3"])
            .arg("--proto")
            .arg(&context.protocol)
            .arg("--remote")
            .arg(&context.host)
            .arg(context.port.to_string())
            .args(["--auth-retry", "none"])
            .args(["--auth-user-pass", STDIN_AUTH_SOURCE]);
        cmd.stdin = Some(probe_credentials(callback_port));
        cmd
    }

    /// The real session, pointed at an already resolved address and reading
    /// its credentials from `credentials`.
    pub fn session(
        context: &SessionContext,
        remote: IpAddr,
        credentials: &Path,
        use_sudo: bool,
    ) -> Self {
        let base = if use_sudo {
            Self::new("sudo").arg(context.binary.to_string_lossy())
        } else {
            Self::new(&context.binary)
        };

        base.arg("--config")
            .arg(context.config_path.to_string_lossy())
            .args(["--verb", "3", "--auth-nocache"])
            .arg("--proto")
            .arg(&context.protocol)
            .arg("--remote")
            .arg(remote.to_string())
            .arg(context.port.to_string())
            .args(["--auth-retry", "none"])
            .arg("--auth-user-pass")
            .arg(credentials.to_string_lossy())
    }

    /// Build a tokio command with piped stdio. The child is killed if the
    /// handle is dropped before it exits.
    pub fn to_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl fmt::Display for VpnCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", shell_quote(&self.program.to_string_lossy()))?;
        for arg in &self.args {
            write!(f, " {}", shell_quote(arg))?;
        }
        Ok(())
    }
}

/// Decide whether the session needs a sudo prefix.
pub fn needs_sudo(configured: bool) -> bool {
    configured && !running_as_root()
}

#[cfg(unix)]
fn running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    false
}

fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=@%+,".contains(c));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

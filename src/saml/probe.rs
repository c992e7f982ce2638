//! SAML challenge probe
//!
//! Runs OpenVPN once with placeholder credentials. The server rejects them and
//! its control message carries what we need:
//!
//! ```text
//! Fri Sep 25 13:12:53 2020 AUTH: Received control message: AUTH_FAILED,CRV1:R:<sid>:<b64>:https://idp/...
//! ```
//!
//! Split on `:`, field 6 is the session ID and fields 8 and 9 are the URL
//! (split in two by its own scheme separator). This is a scrape of the
//! client's log format as of OpenVPN 2.4/2.5 with the AWS SAML patches, not a
//! protocol; a change in the log timestamp format breaks it.

use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::openvpn::{SessionContext, VpnCommand};
use crate::process::{ExecError, Execute};

/// Marker of the log line that carries the challenge.
pub const AUTH_FAILED_MARKER: &str = "AUTH_FAILED";

const FIELD_DELIMITER: char = ':';
const SID_FIELD: usize = 6;
const URL_SCHEME_FIELD: usize = 8;
const URL_REST_FIELD: usize = 9;
const MIN_FIELDS: usize = 10;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("OpenVPN did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Could not parse challenge: {0}")]
    Parse(String),

    #[error("OpenVPN probe failed: {reason}\nOpenVPN output:\n{output}")]
    Exec { reason: String, output: String },
}

impl From<ExecError> for ProbeError {
    fn from(err: ExecError) -> Self {
        ProbeError::Exec {
            reason: err.to_string(),
            output: String::new(),
        }
    }
}

/// Where to authenticate, and which server-side session it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub url: Url,
    pub sid: String,
}

/// Run the probe against the server described by `context`.
///
/// Each call consumes an authentication attempt on the server, so callers
/// must not retry it behind the user's back.
pub async fn probe<E: Execute>(
    executor: &E,
    context: &SessionContext,
    callback_port: u16,
    timeout: Duration,
) -> Result<Challenge, ProbeError> {
    let command = VpnCommand::probe(context, callback_port);
    info!("Probing {}:{} for a SAML challenge", context.host, context.port);

    let output = tokio::time::timeout(timeout, executor.run(&command, |_, _| {}))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))??;

    let text = output.text();
    match parse_probe_output(&text) {
        Ok(challenge) => {
            debug!("Challenge URL: {}", challenge.url);
            Ok(challenge)
        }
        Err(err) if !output.success() => {
            debug!("Probe output unusable: {}", err);
            Err(ProbeError::Exec {
                reason: match output.exit_code {
                    Some(code) => format!("exited with status {}", code),
                    None => "terminated by a signal".to_string(),
                },
                output: text,
            })
        }
        Err(err) => Err(err),
    }
}

/// Pull the challenge URL and session ID out of OpenVPN log output.
pub fn parse_probe_output(output: &str) -> Result<Challenge, ProbeError> {
    let line = output
        .lines()
        .find(|line| line.contains(AUTH_FAILED_MARKER))
        .ok_or_else(|| ProbeError::Parse(format!("no {} line in output", AUTH_FAILED_MARKER)))?;

    let fields: Vec<&str> = line.trim_end().split(FIELD_DELIMITER).collect();
    if fields.len() < MIN_FIELDS {
        return Err(ProbeError::Parse(format!(
            "expected at least {} fields in {:?}, found {}",
            MIN_FIELDS,
            line,
            fields.len()
        )));
    }

    let sid = fields[SID_FIELD];
    if sid.is_empty() {
        return Err(ProbeError::Parse(format!("empty session ID in {:?}", line)));
    }

    let raw_url = format!(
        "{}{}{}",
        fields[URL_SCHEME_FIELD], FIELD_DELIMITER, fields[URL_REST_FIELD]
    );
    let url = Url::parse(&raw_url)
        .map_err(|e| ProbeError::Parse(format!("invalid challenge URL {:?}: {}", raw_url, e)))?;

    Ok(Challenge {
        url,
        sid: sid.to_string(),
    })
}

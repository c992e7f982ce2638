//! Connection flow
//!
//! 1. Start the SAML callback listener
//! 2. Probe OpenVPN for the challenge URL and session ID
//! 3. Send the user's browser to the challenge URL
//! 4. Wait for the SAML response
//! 5. Write the credentials file and hand over to the supervisor (or print
//!    the command when not running it ourselves)

use std::future::Future;
use thiserror::Error;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::config::{Config, ConfigError};
use crate::hooks;
use crate::openvpn::{ProfileError, SessionContext, VpnCommand};
use crate::process::{Execute, SystemExecutor};
use crate::saml::{
    CallbackError, CallbackServer, CredentialError, CredentialFile, ProbeError, materialize, probe,
};
use crate::vpn::{DnsResolver, Outcome, Resolve, Supervisor, SupervisorError, SupervisorPolicy};

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Could not load OpenVPN profile: {0}")]
    Profile(#[from] ProfileError),

    #[error("Challenge probe failed: {0}")]
    Probe(#[from] ProbeError),

    #[error("SAML callback failed: {0}")]
    Callback(#[from] CallbackError),

    #[error("Could not create credentials: {0}")]
    Credentials(#[from] CredentialError),

    #[error("VPN session failed: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("Interrupted")]
    Interrupted,
}

/// How `connect` ended without an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connection {
    /// OpenVPN ran and exited with this outcome.
    Finished(Outcome),
    /// Non-interactive mode: the command the user should run.
    Printed(VpnCommand),
}

/// One configured VPN endpoint and the collaborators used to reach it
pub struct SamlVpn<R = DnsResolver, E = SystemExecutor> {
    config: Config,
    context: SessionContext,
    resolver: R,
    executor: E,
}

impl SamlVpn {
    /// Validate `config`, read its OpenVPN profile and use the real resolver
    /// and process executor.
    pub fn new(config: Config) -> Result<Self, Error> {
        config.validate()?;
        let context = SessionContext::load(&config)?;
        info!("Session: {}", context);
        Ok(Self::with_parts(
            config,
            context,
            DnsResolver::new(),
            SystemExecutor::new(),
        ))
    }
}

impl<R: Resolve, E: Execute> SamlVpn<R, E> {
    pub fn with_parts(config: Config, context: SessionContext, resolver: R, executor: E) -> Self {
        Self {
            config,
            context,
            resolver,
            executor,
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// Run the SAML handshake and return the OpenVPN credentials payload.
    pub async fn acquire_credentials(&self) -> Result<Zeroizing<String>, Error> {
        let listening = CallbackServer::from_config(&self.config).start().await?;

        let challenge = probe(
            &self.executor,
            &self.context,
            listening.local_addr().port(),
            self.config.probe_timeout(),
        )
        .await?;

        let browser_command = self.config.browser_command.clone();
        let url = challenge.url.to_string();
        tokio::spawn(async move {
            hooks::open_browser(&browser_command, &url).await;
        });

        info!("Waiting for server to receive SAML callback");
        let assertion = Zeroizing::new(listening.wait_for_response().await?);

        Ok(materialize(&challenge.sid, &assertion)?)
    }

    /// Authenticate and then run (or print) the VPN session, stopping on
    /// Ctrl+C.
    pub async fn connect(&self) -> Result<Connection, Error> {
        self.connect_until(ctrl_c).await
    }

    /// Like [`connect`](Self::connect), with `interrupt` producing the next
    /// interrupt request.
    ///
    /// One interrupt aborts authentication. Once OpenVPN runs it receives the
    /// terminal's Ctrl+C itself and is given time to shut down; a second
    /// interrupt kills it. Either way the credentials file is erased before
    /// this returns.
    pub async fn connect_until<F, Fut>(&self, mut interrupt: F) -> Result<Connection, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        let payload = tokio::select! {
            result = self.acquire_credentials() => result?,
            () = interrupt() => return Err(Error::Interrupted),
        };

        let credentials = CredentialFile::create(
            &self.config.temp_credentials_file_path,
            &payload,
            self.config.temp_credentials_file_permissions,
        )?;
        drop(payload);

        let supervisor = Supervisor::new(
            &self.context,
            &self.resolver,
            &self.executor,
            SupervisorPolicy::from_config(&self.config),
        );

        if !self.config.run_command {
            let command = supervisor.build_command(credentials.path()).await?;
            credentials.persist();
            return Ok(Connection::Printed(command));
        }

        let outcome = tokio::select! {
            outcome = supervisor.run(&credentials) => outcome?,
            () = second_interrupt(&mut interrupt) => {
                warn!("Forced exit, stopping OpenVPN");
                return Err(Error::Interrupted);
            }
        };
        Ok(Connection::Finished(outcome))
    }
}

async fn second_interrupt<F, Fut>(interrupt: &mut F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    interrupt().await;
    info!("Waiting for OpenVPN to shut down, press Ctrl+C again to force");
    interrupt().await;
}

/// Resolves on Ctrl+C; never, if the handler cannot be installed.
async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}

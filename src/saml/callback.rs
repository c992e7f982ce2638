//! Local SAML callback listener
//!
//! The IdP finishes the browser login by POSTing a form with a `SAMLResponse`
//! field to the assertion consumer URL, which the VPN server pointed at
//! `127.0.0.1:35001`. We serve that address just long enough to receive one
//! response and hand it to the waiting connection flow.
//!
//! ```text
//! CallbackServer --start()--> ListeningCallback --wait_for_response()--> assertion
//!     (idle)                      (listening)                      \---> Timeout
//! ```
//!
//! The handoff is a oneshot channel whose sender is taken by the first valid
//! POST, so at most one value is ever delivered. The listener is shut down on
//! every exit path, including drop.

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;

/// Form field the IdP posts the assertion in.
pub const SAML_FIELD: &str = "SAMLResponse";

/// How long in-flight requests get to finish once we stop listening.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum CallbackError {
    #[error("Cannot bind SAML listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Timed out waiting for SAML response after {0:?}")]
    Timeout(Duration),

    #[error("Invalid SAML callback: {0}")]
    Validation(String),

    #[error("SAML listener stopped before a response arrived")]
    Closed,
}

/// Settings for the callback listener, not yet bound
#[derive(Debug, Clone)]
pub struct CallbackServer {
    address: SocketAddr,
    redirect_url: Option<String>,
    timeout: Duration,
}

impl CallbackServer {
    pub fn new(address: SocketAddr, redirect_url: Option<String>, timeout: Duration) -> Self {
        Self {
            address,
            redirect_url,
            timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.server_address,
            config.redirect_url.clone(),
            config.server_timeout(),
        )
    }

    /// Bind the listener and start serving in the background.
    pub async fn start(self) -> Result<ListeningCallback, CallbackError> {
        let bind_err = |source: std::io::Error| CallbackError::Bind {
            addr: self.address,
            source,
        };
        let listener = TcpListener::bind(self.address).await.map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;
        info!(
            "Listening for SAML callback on {}, timeout {:?}",
            local_addr, self.timeout
        );

        let (response_tx, response_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let app = router(HandlerState {
            sender: Arc::new(Mutex::new(Some(response_tx))),
            redirect_url: self.redirect_url.map(Arc::from),
        });

        let server = tokio::spawn(async move {
            let shutdown = async {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!("SAML listener error: {}", e);
            }
            debug!("SAML listener stopped");
        });

        Ok(ListeningCallback {
            local_addr,
            timeout: self.timeout,
            response: response_rx,
            shutdown: Some(shutdown_tx),
            server,
        })
    }
}

/// A bound listener waiting for its one SAML response
#[derive(Debug)]
pub struct ListeningCallback {
    local_addr: SocketAddr,
    timeout: Duration,
    response: oneshot::Receiver<String>,
    shutdown: Option<oneshot::Sender<()>>,
    server: JoinHandle<()>,
}

impl ListeningCallback {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Block until the SAML response arrives or the timeout passes. The
    /// listener is closed before this returns either way.
    pub async fn wait_for_response(mut self) -> Result<String, CallbackError> {
        let result = tokio::time::timeout(self.timeout, &mut self.response).await;
        self.shutdown().await;

        match result {
            Ok(Ok(assertion)) => {
                info!("Received SAML response ({} bytes)", assertion.len());
                Ok(assertion)
            }
            Ok(Err(_)) => Err(CallbackError::Closed),
            Err(_) => Err(CallbackError::Timeout(self.timeout)),
        }
    }

    async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut self.server)
            .await
            .is_err()
        {
            debug!("SAML listener did not drain in time, aborting");
            self.server.abort();
            let _ = (&mut self.server).await;
        }
    }
}

impl Drop for ListeningCallback {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.server.abort();
    }
}

#[derive(Clone)]
struct HandlerState {
    sender: Arc<Mutex<Option<oneshot::Sender<String>>>>,
    redirect_url: Option<Arc<str>>,
}

fn router(state: HandlerState) -> Router {
    Router::new().fallback(handle_callback).with_state(state)
}

async fn handle_callback(
    State(state): State<HandlerState>,
    method: Method,
    body: Bytes,
) -> Response {
    info!("Handling HTTP request {}", method);

    if method != Method::POST {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            "hey there! you might want to try POST",
        )
            .into_response();
    }

    let assertion = match extract_assertion(&body) {
        Ok(assertion) => assertion,
        Err(e) => {
            warn!("{}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };

    let sender = match state.sender.lock() {
        Ok(mut sender) => sender.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    };

    match sender {
        Some(tx) => match tx.send(assertion) {
            Ok(()) => (
                StatusCode::OK,
                Html(success_page(state.redirect_url.as_deref())),
            )
                .into_response(),
            Err(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "samlvpn is no longer waiting for a SAML response",
            )
                .into_response(),
        },
        None => {
            warn!("Ignoring duplicate SAML response");
            (StatusCode::CONFLICT, "SAML response already received").into_response()
        }
    }
}

/// Pull the SAML response out of a url-encoded form body.
///
/// Some IdPs wrap the base64 payload across lines; whitespace is dropped so
/// the value fits on the single password line OpenVPN reads.
pub fn extract_assertion(body: &[u8]) -> Result<String, CallbackError> {
    let value = url::form_urlencoded::parse(body)
        .find(|(key, _)| key == SAML_FIELD)
        .map(|(_, value)| value.chars().filter(|c| !c.is_whitespace()).collect::<String>())
        .ok_or_else(|| CallbackError::Validation(format!("form has no {} field", SAML_FIELD)))?;

    if value.is_empty() {
        return Err(CallbackError::Validation(format!(
            "{} form field has zero length",
            SAML_FIELD
        )));
    }
    Ok(value)
}

fn success_page(redirect_url: Option<&str>) -> String {
    let (refresh, message) = match redirect_url {
        Some(url) => {
            let url = html_escape(url);
            (
                format!(r#"<meta http-equiv="refresh" content="5; url={}" />"#, url),
                format!("Redirecting you to {}...", url),
            )
        }
        None => (String::new(), "You can close this now".to_string()),
    };

    format!(
        "<html>
  <head>
    <title>samlvpn</title>
    {}
  </head>
  <body>
    <h2>Got SAML response!</h2>
    <p>{}</p>
  </body>
</html>",
        refresh, message
    )
}

fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

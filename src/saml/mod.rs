//! SAML handshake around the external OpenVPN client
//!
//! The server only hands out a SAML challenge in response to a failed login,
//! so the flow is:
//! 1. probe - run OpenVPN with placeholder credentials and scrape the
//!    challenge URL and session ID from its AUTH_FAILED line
//! 2. callback - serve a local endpoint the IdP posts the SAML response to
//! 3. credentials - combine session ID and SAML response into the password
//!    OpenVPN sends on the real connection
pub mod callback;
pub mod credentials;
pub mod probe;

pub use callback::{CallbackError, CallbackServer, ListeningCallback};
pub use credentials::{CredentialError, CredentialFile, materialize};
pub use probe::{Challenge, ProbeError, parse_probe_output, probe};

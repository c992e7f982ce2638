//! VPN session management
//!
//! - `locator`: resolve the endpoint to a fresh address for each attempt
//! - `supervisor`: run OpenVPN, classify how it ended, retry or recover

pub mod locator;
pub mod supervisor;

pub use locator::{DnsResolver, Resolve, ResolutionError};
pub use supervisor::{Outcome, Supervisor, SupervisorError, SupervisorPolicy, classify};

//! OpenVPN integration module
//!
//! samlvpn never speaks the VPN protocol itself. It reads the user's OpenVPN
//! profile for the remote endpoint and builds the command lines used to run
//! the external client, once as a deliberately failing probe and once for the
//! real session.

pub mod command;
pub mod profile;

pub use command::VpnCommand;
pub use profile::{Profile, ProfileError, SessionContext};

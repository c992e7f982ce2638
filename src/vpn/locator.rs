//! VPN endpoint resolution
//!
//! Endpoints such as AWS Client VPN answer on any subdomain and rotate the
//! servers behind them. Looking up `<random label>.<host>` forces a fresh
//! answer from every cache between us and the authoritative server, so a
//! retry does not keep landing on the same (possibly bad) server.

use rand::RngCore;
use rand::rngs::OsRng;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;
use tracing::{debug, info};

const LABEL_BYTES: usize = 12;

#[derive(Error, Debug)]
pub enum ResolutionError {
    #[error("DNS lookup for {host} failed: {source}")]
    Lookup {
        host: String,
        source: std::io::Error,
    },
    #[error("No addresses found for {0}")]
    NoAddresses(String),
}

/// Turns the VPN hostname into an address to connect to.
pub trait Resolve: Send + Sync {
    fn resolve(&self, host: &str) -> impl Future<Output = Result<IpAddr, ResolutionError>> + Send;
}

impl<T: Resolve> Resolve for &T {
    fn resolve(&self, host: &str) -> impl Future<Output = Result<IpAddr, ResolutionError>> + Send {
        (**self).resolve(host)
    }
}

/// Resolves through the system resolver with a random label prefix
#[derive(Debug, Clone, Copy, Default)]
pub struct DnsResolver;

impl DnsResolver {
    pub fn new() -> Self {
        Self
    }
}

impl Resolve for DnsResolver {
    async fn resolve(&self, host: &str) -> Result<IpAddr, ResolutionError> {
        let name = randomized_hostname(host);
        info!("Looking up {}", name);

        let addrs = tokio::net::lookup_host((name.as_str(), 0))
            .await
            .map_err(|source| ResolutionError::Lookup {
                host: name.clone(),
                source,
            })?;

        let ip = first_address(&name, addrs)?;
        debug!("{} resolved to {}", name, ip);
        Ok(ip)
    }
}

/// 12 random bytes, hex encoded.
pub fn random_label() -> String {
    let mut bytes = [0u8; LABEL_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn randomized_hostname(host: &str) -> String {
    format!("{}.{}", random_label(), host)
}

fn first_address<I>(name: &str, mut addrs: I) -> Result<IpAddr, ResolutionError>
where
    I: Iterator<Item = SocketAddr>,
{
    addrs
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| ResolutionError::NoAddresses(name.to_string()))
}

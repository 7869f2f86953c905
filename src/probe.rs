//! Endpoint liveness probing.
//!
//! A probe is a bounded TCP connect against the registration service port.
//! Network failure is an ordinary `false`, never an error.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::types::EndpointRecord;

#[async_trait]
pub trait Prober: Send + Sync {
    /// Whether the service answers on `addr`.
    async fn probe(&self, addr: IpAddr) -> bool;

    /// Whether any address of `endpoint` answers, IPv6 tried first.
    async fn is_responsive(&self, endpoint: &EndpointRecord) -> bool {
        for addr in endpoint.addresses() {
            if self.probe(addr).await {
                return true;
            }
        }
        false
    }

    /// Address to resolve `endpoint` to: IPv6 when it answers there,
    /// otherwise IPv4 when that answers.
    async fn reachable_address(&self, endpoint: &EndpointRecord) -> Option<IpAddr> {
        if let Some(v6) = endpoint.ipv6 {
            if self.probe(IpAddr::V6(v6)).await {
                return Some(IpAddr::V6(v6));
            }
        }
        if let Some(v4) = endpoint.ipv4 {
            if self.probe(IpAddr::V4(v4)).await {
                return Some(IpAddr::V4(v4));
            }
        }
        None
    }
}

pub struct TcpProber {
    port: u16,
    timeout: Duration,
}

impl TcpProber {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, addr: IpAddr) -> bool {
        let target = SocketAddr::new(addr, self.port);
        match timeout(self.timeout, TcpStream::connect(target)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Probe of {} failed: {}", target, e);
                false
            }
            Err(_) => {
                debug!("Probe of {} timed out after {:?}", target, self.timeout);
                false
            }
        }
    }
}

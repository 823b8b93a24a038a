use std::net::IpAddr;

use async_trait::async_trait;

/// Gateway port-mapping helper (UPnP-IGD or similar), consumed as an
/// opaque collaborator. Returns the internal and external addresses
/// after requesting a mapping for `port`. A failure leaves the client
/// on its bound listening address.
#[async_trait]
pub trait PortMapper: Send + Sync + 'static {
    async fn map_port(&self, port: u16) -> crate::Result<(IpAddr, IpAddr)>;
}

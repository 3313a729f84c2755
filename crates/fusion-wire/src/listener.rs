//! Binds one of the daemon's three TCP ports (spec §2: Asset Manager
//! 13031, Resource Manager 13032, per-agent provider listener 13033) and
//! hands back framed channels as connections arrive.

use fusion_core::error::{FusionError, Result};
use tokio::net::{TcpListener as TokioTcpListener, ToSocketAddrs};
use tracing::debug;

use crate::channel::WireChannel;

pub struct WireListener {
    inner: TokioTcpListener,
}

impl WireListener {
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let inner = TokioTcpListener::bind(addr)
            .await
            .map_err(|err| FusionError::protocol_io("bind failed", err))?;
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.inner
            .local_addr()
            .map_err(|err| FusionError::protocol_io("local_addr failed", err))
    }

    /// Accepts one connection and wraps it in a `WireChannel`. The caller
    /// is responsible for calling `validate_protocol_version` before
    /// trusting anything else on the connection.
    pub async fn accept(&self) -> Result<(WireChannel, std::net::SocketAddr)> {
        let (stream, peer) = self
            .inner
            .accept()
            .await
            .map_err(|err| FusionError::protocol_io("accept failed", err))?;
        debug!(%peer, "accepted connection");
        Ok((WireChannel::new(stream), peer))
    }
}

//! gRPC client transport configuration and channel utilities.
//!
//! This module is responsible only for transport-level configuration:
//! connect and RPC timeouts plus HTTP/2 keepalive. Channels are opened
//! lazily — construction never blocks on an unreachable peer, and connection
//! failures surface per call as recoverable statuses.

use std::time::Duration;

use tonic::transport::{Channel, Endpoint};

/// Transport credentials for an outbound channel, supplied by the
/// application's connect resolver.
// TODO: add a TLS variant once the tls feature set is enabled on tonic.
#[derive(Debug, Clone, Copy, Default)]
pub enum ChannelCredentials {
    #[default]
    Insecure,
}

/// Transport credentials for a listening server, supplied by the
/// application's bind resolver.
#[derive(Debug, Clone, Copy, Default)]
pub enum ServerCredentials {
    #[default]
    Insecure,
}

/// Configuration for the gRPC client transport stack.
#[derive(Debug, Clone)]
pub struct GrpcClientConfig {
    /// Timeout for establishing the initial connection.
    pub connect_timeout: Duration,

    /// Timeout for individual RPC calls (applied at transport level).
    pub rpc_timeout: Duration,
}

impl Default for GrpcClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(30),
        }
    }
}

impl GrpcClientConfig {
    /// Set the connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the RPC timeout.
    #[must_use]
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }
}

/// Build a tonic `Endpoint` with timeouts and keepalive settings.
///
/// Configures:
/// - Connect timeout
/// - Per-RPC timeout
/// - TCP keepalive (30 seconds)
/// - HTTP/2 keepalive interval (30 seconds) with a 10 second timeout
/// - Keep alive while idle
///
/// # Errors
/// Fails when `uri` is not a valid endpoint URI.
pub fn build_endpoint(
    uri: String,
    cfg: &GrpcClientConfig,
) -> Result<Endpoint, tonic::transport::Error> {
    let endpoint = Endpoint::from_shared(uri)?
        .connect_timeout(cfg.connect_timeout)
        .timeout(cfg.rpc_timeout)
        .tcp_keepalive(Some(Duration::from_secs(30)))
        .http2_keep_alive_interval(Duration::from_secs(30))
        .keep_alive_timeout(Duration::from_secs(10))
        .keep_alive_while_idle(true);

    Ok(endpoint)
}

/// Open a lazily connecting channel with the configured transport stack.
///
/// The connection is established on first use; until then the channel is a
/// cheap handle. Dropping every clone of the returned channel closes the
/// underlying connections.
///
/// # Errors
/// Fails when `uri` is not a valid endpoint URI.
pub fn open_channel(
    uri: impl Into<String>,
    cfg: &GrpcClientConfig,
) -> Result<Channel, tonic::transport::Error> {
    let uri_string = uri.into();
    let endpoint = build_endpoint(uri_string, cfg)?;
    tracing::debug!(uri = %endpoint.uri(), "opened lazy gRPC channel");
    Ok(endpoint.connect_lazy())
}

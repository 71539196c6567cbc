//! Outbound side: one uniform client per remote service descriptor.
//!
//! Clients are derived from the catalog at startup; calls are dispatched by
//! method name over a lazily connecting channel with the raw byte codec.
//! Two guarantees the callee can rely on:
//! - the `"origin"` metadata entry always carries this application's
//!   configured name (overwritten, never merged), and
//! - a method the descriptor does not declare resolves to an
//!   `UNIMPLEMENTED` status instead of panicking or dispatching blind.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use srvkit::group::ServiceGroup;
use srvkit_transport_grpc::client::{open_channel, ChannelCredentials, GrpcClientConfig};
use srvkit_transport_grpc::codec::RawCodec;
use srvkit_transport_grpc::attach_origin;
use tonic::metadata::{AsciiMetadataValue, MetadataMap};
use tonic::transport::Channel;
use tonic::Status;

use crate::{ClientArgs, RpcSetupError};

/// Connection policy produced by the application's [`ConnectResolver`].
#[derive(Debug, Clone)]
pub struct ConnectPolicy {
    /// Endpoint URI, e.g. `http://worker.internal:4444`.
    pub uri: String,
    /// Transport credential policy; never hardcoded by the adapter.
    pub credentials: ChannelCredentials,
    /// Transport tuning for this channel.
    pub config: GrpcClientConfig,
}

impl ConnectPolicy {
    pub fn insecure(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            credentials: ChannelCredentials::Insecure,
            config: GrpcClientConfig::default(),
        }
    }
}

/// Externally supplied transport policy for outbound channels, consulted
/// once per remote service at build time.
pub trait ConnectResolver: Send + Sync {
    /// Decide how to reach `service`.
    ///
    /// # Errors
    /// Any error fails client construction.
    fn resolve(&self, service: &str, group: &ServiceGroup) -> anyhow::Result<ConnectPolicy>;
}

impl<F> ConnectResolver for F
where
    F: Fn(&str, &ServiceGroup) -> anyhow::Result<ConnectPolicy> + Send + Sync,
{
    fn resolve(&self, service: &str, group: &ServiceGroup) -> anyhow::Result<ConnectPolicy> {
        self(service, group)
    }
}

/// Uniform call surface for one remote service.
pub struct RpcClient {
    /// Service name within the namespace, e.g. `Worker`.
    service: String,
    /// Fully qualified gRPC service path, e.g. `proj.Worker`.
    qualified: String,
    methods: BTreeSet<String>,
    origin: AsciiMetadataValue,
    channel: Channel,
}

impl RpcClient {
    /// Unary call to `method` with an opaque payload.
    ///
    /// The `"origin"` metadata entry is always overwritten with the caller's
    /// configured application name before dispatch.
    ///
    /// # Errors
    /// - `UNIMPLEMENTED` with message `"{service}.{method} is not supported"`
    ///   when the remote descriptor does not declare `method`;
    /// - any transport or remote status otherwise, forwarded verbatim.
    pub async fn call(
        &self,
        method: &str,
        payload: Bytes,
        metadata: Option<MetadataMap>,
    ) -> Result<Bytes, Status> {
        let mut metadata = metadata.unwrap_or_default();
        attach_origin(&mut metadata, &self.origin);

        if !self.methods.contains(method) {
            return Err(Status::unimplemented(format!(
                "{}.{} is not supported",
                self.service, method
            )));
        }

        let path = http::uri::PathAndQuery::from_maybe_shared(format!(
            "/{}/{}",
            self.qualified, method
        ))
        .map_err(|e| Status::internal(format!("invalid rpc path: {e}")))?;

        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready().await.map_err(|e| {
            Status::unavailable(format!("service {} is not ready: {e}", self.qualified))
        })?;

        let mut request = tonic::Request::new(payload);
        *request.metadata_mut() = metadata;

        let response = grpc.unary(request, path, RawCodec).await?;
        Ok(response.into_inner())
    }

    /// Remote service name within the namespace.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Methods the remote descriptor declares.
    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.iter().map(String::as_str)
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("service", &self.qualified)
            .field("methods", &self.methods)
            .finish_non_exhaustive()
    }
}

/// All clients derived from the client-side protocol definition, one per
/// remote service descriptor.
#[derive(Debug, Default)]
pub struct ClientSet {
    clients: RwLock<HashMap<String, Arc<RpcClient>>>,
}

impl ClientSet {
    pub(crate) fn empty() -> Self {
        Self::default()
    }

    /// Fetch the client for `service`, if the definition declared one and
    /// the set has not been closed.
    pub fn get(&self, service: &str) -> Option<Arc<RpcClient>> {
        self.clients.read().get(service).cloned()
    }

    /// Names of all materialized clients, in no particular order.
    pub fn names(&self) -> Vec<String> {
        self.clients.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    /// Drop every channel handle. Connections close once in-flight calls
    /// holding clones finish. Closing twice is a no-op.
    pub fn close(&self) {
        self.clients.write().clear();
    }
}

/// Materialize a client for every service descriptor under `{config.ns}`.
///
/// Plain data types in the definition are skipped by their load-time tag.
///
/// # Errors
/// Fails when the connect resolver errors, when a resolved URI is invalid,
/// or when the application name cannot be used as metadata.
pub(crate) fn build_clients(
    group: &Arc<ServiceGroup>,
    args: &ClientArgs,
) -> Result<ClientSet, RpcSetupError> {
    let config = group.config();
    let origin: AsciiMetadataValue =
        config
            .name
            .parse()
            .map_err(|_| RpcSetupError::InvalidOrigin {
                name: config.name.clone(),
            })?;

    let mut clients = HashMap::new();
    for descriptor in args.catalog.services_in(&config.ns) {
        let service = descriptor.name().to_owned();
        let policy = args
            .connect
            .resolve(&service, group)
            .map_err(|source| RpcSetupError::ConnectResolver {
                service: service.clone(),
                source,
            })?;
        let ChannelCredentials::Insecure = policy.credentials;

        let channel =
            open_channel(policy.uri.clone(), &policy.config).map_err(|source| {
                RpcSetupError::InvalidUri {
                    uri: policy.uri.clone(),
                    source,
                }
            })?;

        let client = RpcClient {
            qualified: format!("{}.{}", config.ns, service),
            methods: descriptor.methods().map(str::to_owned).collect(),
            origin: origin.clone(),
            channel,
            service: service.clone(),
        };
        tracing::debug!(
            service = %client.qualified,
            uri = %policy.uri,
            "rpc client materialized"
        );
        clients.insert(service, Arc::new(client));
    }

    Ok(ClientSet {
        clients: RwLock::new(clients),
    })
}

//! gRPC service module for srvkit applications.
//!
//! One bootstrap spec brings up the whole RPC boundary of an application and
//! registers it as a single service in the group:
//! - when [`GrpcArgs::server`] is present, an inbound server is started for
//!   the descriptor at `{config.ns}.{config.name}`, every handler wrapped by
//!   the permission shim;
//! - when [`GrpcArgs::clients`] is present, a client is materialized for
//!   every service descriptor under `{config.ns}`.
//!
//! ```ignore
//! let catalog = Arc::new(ProtoCatalog::load("protos/app.bin")?);
//! let args = GrpcArgs::default()
//!     .with_server(ServerArgs {
//!         catalog: catalog.clone(),
//!         handlers,
//!         permission: Some(Arc::new(|origin, method| origin == "Gateway" || method == "Ping")),
//!         bind: Arc::new(bind_from_config),
//!     })
//!     .with_clients(ClientArgs { catalog, connect: Arc::new(static_routes) });
//! let specs = vec![ServiceSpec::new("rpc", Arc::new(GrpcInit::new(args)))];
//! let group = srvkit::init_group(config, specs).await?;
//!
//! let rpc = group.get_as::<GrpcService>("rpc")?;
//! let reply = rpc.client("Worker")?.call("Run", payload, None).await?;
//! ```

pub mod catalog;
pub mod client;
pub mod server;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use srvkit::group::ServiceGroup;
use srvkit::service::{Service, ServiceCtx, ServiceInit};
use tonic::Status;

pub use catalog::{CatalogError, ProtoCatalog, ProtoCatalogBuilder, ProtoEntry, ServiceDescriptor};
pub use client::{ClientSet, ConnectPolicy, ConnectResolver, RpcClient};
pub use server::{
    handler_fn, BindPolicy, BindResolver, PermissionPredicate, RpcContext, RpcHandlerFn,
    RpcServerHandle,
};
pub use srvkit_transport_grpc::client::{ChannelCredentials, GrpcClientConfig, ServerCredentials};
pub use srvkit_transport_grpc::ORIGIN_METADATA_KEY;

/// Configuration-time failures of the RPC module. These stop startup; they
/// are never surfaced per call.
#[derive(Debug, thiserror::Error)]
pub enum RpcSetupError {
    #[error("no gRPC service at {path}")]
    ServiceNotFound { path: String },

    #[error("handler registered for unknown method {service}.{method}")]
    UnknownMethod { service: String, method: String },

    #[error("bind resolver failed: {source}")]
    BindResolver {
        #[source]
        source: anyhow::Error,
    },

    #[error("connect resolver failed for service '{service}': {source}")]
    ConnectResolver {
        service: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid listen address '{addr}': {source}")]
    InvalidListenAddr {
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error("failed to bind rpc server at {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid client uri '{uri}': {source}")]
    InvalidUri {
        uri: String,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("application name '{name}' cannot be used as origin metadata")]
    InvalidOrigin { name: String },

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Inbound server configuration.
#[derive(Clone)]
pub struct ServerArgs {
    /// Server-side protocol definition.
    pub catalog: Arc<ProtoCatalog>,
    /// Handlers keyed by method name; validated against the descriptor.
    pub handlers: HashMap<String, RpcHandlerFn>,
    /// Authorization predicate; `None` allows every caller.
    pub permission: Option<PermissionPredicate>,
    /// Listen address and credential policy, always externally supplied.
    pub bind: Arc<dyn BindResolver>,
}

/// Outbound client configuration.
#[derive(Clone)]
pub struct ClientArgs {
    /// Client-side protocol definition.
    pub catalog: Arc<ProtoCatalog>,
    /// Per-service address and credential policy, always externally supplied.
    pub connect: Arc<dyn ConnectResolver>,
}

/// Arguments for the RPC service initializer.
#[derive(Clone, Default)]
pub struct GrpcArgs {
    pub server: Option<ServerArgs>,
    pub clients: Option<ClientArgs>,
}

impl GrpcArgs {
    #[must_use]
    pub fn with_server(mut self, server: ServerArgs) -> Self {
        self.server = Some(server);
        self
    }

    #[must_use]
    pub fn with_clients(mut self, clients: ClientArgs) -> Self {
        self.clients = Some(clients);
        self
    }
}

/// The RPC boundary of an application, registered as one entry in the
/// service group.
pub struct GrpcService {
    server: Option<RpcServerHandle>,
    clients: ClientSet,
}

impl GrpcService {
    /// Bring up the server and/or clients described by `args`.
    ///
    /// # Errors
    /// Any [`RpcSetupError`] is a fatal configuration error.
    pub async fn start(ctx: &ServiceCtx, args: GrpcArgs) -> Result<Arc<Self>, RpcSetupError> {
        let group: &Arc<ServiceGroup> = ctx.group();

        let server = match args.server {
            Some(server_args) => Some(
                server::start_server(
                    group.clone(),
                    server_args,
                    ctx.cancellation_token().child_token(),
                )
                .await?,
            ),
            None => None,
        };

        let clients = match args.clients {
            Some(client_args) => client::build_clients(group, &client_args)?,
            None => ClientSet::empty(),
        };

        Ok(Arc::new(Self { server, clients }))
    }

    /// Handle of the inbound server, when one was configured.
    pub fn server(&self) -> Option<&RpcServerHandle> {
        self.server.as_ref()
    }

    /// All outbound clients.
    pub fn clients(&self) -> &ClientSet {
        &self.clients
    }

    /// Client for one remote service.
    ///
    /// # Errors
    /// `UNIMPLEMENTED` when no client was materialized under `service` —
    /// callers treat an unknown counterpart like any other recoverable call
    /// error.
    pub fn client(&self, service: &str) -> Result<Arc<RpcClient>, Status> {
        self.clients.get(service).ok_or_else(|| {
            Status::unimplemented(format!("no rpc client for service '{service}'"))
        })
    }
}

#[async_trait]
impl Service for GrpcService {
    fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }

    /// Graceful teardown: stop accepting inbound calls, drain in-flight
    /// ones, then drop every outbound channel. Safe when already stopped.
    async fn stop(&self) -> anyhow::Result<()> {
        if let Some(server) = &self.server {
            server.stop().await;
        }
        self.clients.close();
        Ok(())
    }
}

/// Bootstrap initializer for the RPC service.
pub struct GrpcInit {
    args: GrpcArgs,
}

impl GrpcInit {
    pub fn new(args: GrpcArgs) -> Self {
        Self { args }
    }
}

#[async_trait]
impl ServiceInit for GrpcInit {
    async fn init(&self, ctx: ServiceCtx) -> anyhow::Result<Arc<dyn Service>> {
        let service = GrpcService::start(&ctx, self.args.clone()).await?;
        Ok(service as Arc<dyn Service>)
    }
}

//! Inbound side: permission shim, dynamic dispatch table, and the server
//! adapter.
//!
//! The hosted service name is `{ns}.{name}` from the application config, so
//! the dispatch table is routed dynamically: a tower service matches the
//! gRPC path `/{service}/{method}` against the descriptor-backed handler
//! table and runs known methods through `tonic::server::Grpc` with the raw
//! byte codec. Anything else answers with transport-level `UNIMPLEMENTED`,
//! the same way tonic's generated servers answer unknown routes.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{header, HeaderValue, Request, Response};
use parking_lot::Mutex;
use srvkit::group::ServiceGroup;
use srvkit_transport_grpc::codec::RawCodec;
use srvkit_transport_grpc::{client::ServerCredentials, extract_origin};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataMap;
use tonic::{Code, Status};

use crate::{RpcSetupError, ServerArgs};

/// Per-call context handed to inbound handlers.
///
/// Constructed for each call and dropped with it; the group reference is the
/// same shared group the rest of the application sees.
pub struct RpcContext {
    /// Raw request payload.
    pub request: Bytes,
    /// Call metadata; `"origin"` carries the caller identity.
    pub metadata: MetadataMap,
    /// The live service group.
    pub group: Arc<ServiceGroup>,
}

impl RpcContext {
    /// Caller identity from the `"origin"` metadata entry, or `""` when the
    /// caller did not identify itself.
    pub fn origin(&self) -> &str {
        extract_origin(&self.metadata).unwrap_or_default()
    }
}

/// Unified inbound handler shape: one future, one completion, per call.
pub type RpcHandlerFn = Arc<dyn Fn(RpcContext) -> BoxFuture<'static, Result<Bytes, Status>> + Send + Sync>;

/// Wrap an async closure as an [`RpcHandlerFn`].
pub fn handler_fn<F, Fut>(f: F) -> RpcHandlerFn
where
    F: Fn(RpcContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Bytes, Status>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Pure authorization predicate over `(origin, method)`.
pub type PermissionPredicate = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Bind policy produced by the application's [`BindResolver`].
#[derive(Debug, Clone)]
pub struct BindPolicy {
    /// `host:port` listen address.
    pub listen_addr: String,
    /// Transport credential policy; never hardcoded by the adapter.
    pub credentials: ServerCredentials,
}

/// Externally supplied transport policy for the server listener.
pub trait BindResolver: Send + Sync {
    /// Decide where and with which credentials to listen.
    ///
    /// # Errors
    /// Any error fails server startup.
    fn resolve(&self, group: &ServiceGroup) -> anyhow::Result<BindPolicy>;
}

impl<F> BindResolver for F
where
    F: Fn(&ServiceGroup) -> anyhow::Result<BindPolicy> + Send + Sync,
{
    fn resolve(&self, group: &ServiceGroup) -> anyhow::Result<BindPolicy> {
        self(group)
    }
}

/// Wrap `handler` with the permission check for `method`.
///
/// When the predicate rejects the caller the call completes immediately with
/// `PERMISSION_DENIED` and the wrapped handler is never invoked; otherwise
/// the handler's result or error is forwarded unchanged.
pub(crate) fn shim_handler(
    method: &str,
    handler: RpcHandlerFn,
    allow: PermissionPredicate,
) -> RpcHandlerFn {
    let method = method.to_owned();
    Arc::new(move |ctx: RpcContext| {
        if !allow(ctx.origin(), &method) {
            tracing::debug!(
                method = %method,
                origin = %ctx.origin(),
                "rpc call denied"
            );
            return Box::pin(std::future::ready(Err(Status::permission_denied(
                "permission denied",
            ))));
        }
        handler(ctx)
    })
}

/// `/{service}/{method}` from a gRPC request path.
fn split_grpc_path(path: &str) -> Option<(&str, &str)> {
    let path = path.strip_prefix('/')?;
    let (service, method) = path.split_once('/')?;
    if service.is_empty() || method.is_empty() || method.contains('/') {
        return None;
    }
    Some((service, method))
}

/// Header-only `UNIMPLEMENTED` answer for unknown services and methods,
/// mirroring tonic's generated fallback arm.
fn unimplemented_response() -> Response<axum::body::Body> {
    let mut response = Response::new(axum::body::Body::empty());
    let headers = response.headers_mut();
    headers.insert(
        Status::GRPC_STATUS,
        HeaderValue::from(Code::Unimplemented as i32),
    );
    headers.insert(header::CONTENT_TYPE, tonic::metadata::GRPC_CONTENT_TYPE);
    response
}

struct DispatchInner {
    /// Fully qualified hosted service, `{ns}.{name}`.
    qualified: String,
    /// Method name to shimmed handler.
    handlers: HashMap<String, RpcHandlerFn>,
    group: Arc<ServiceGroup>,
}

/// Dynamic dispatch table exposed as a tower service.
#[derive(Clone)]
pub(crate) struct RpcDispatcher {
    inner: Arc<DispatchInner>,
}

impl RpcDispatcher {
    pub(crate) fn new(
        qualified: String,
        handlers: HashMap<String, RpcHandlerFn>,
        group: Arc<ServiceGroup>,
    ) -> Self {
        Self {
            inner: Arc::new(DispatchInner {
                qualified,
                handlers,
                group,
            }),
        }
    }
}

/// Bridges one call into the shimmed handler via `tonic::server::Grpc`.
struct UnaryCall {
    handler: RpcHandlerFn,
    group: Arc<ServiceGroup>,
}

impl tonic::server::UnaryService<Bytes> for UnaryCall {
    type Response = Bytes;
    type Future = BoxFuture<'static, Result<tonic::Response<Bytes>, Status>>;

    fn call(&mut self, request: tonic::Request<Bytes>) -> Self::Future {
        let handler = self.handler.clone();
        let group = self.group.clone();
        Box::pin(async move {
            let (metadata, _extensions, payload) = request.into_parts();
            let ctx = RpcContext {
                request: payload,
                metadata,
                group,
            };
            handler(ctx).await.map(tonic::Response::new)
        })
    }
}

impl tower::Service<Request<axum::body::Body>> for RpcDispatcher {
    type Response = Response<axum::body::Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<axum::body::Body>) -> Self::Future {
        let inner = self.inner.clone();
        Box::pin(async move {
            let handler = match split_grpc_path(req.uri().path()) {
                Some((service, method)) if service == inner.qualified => {
                    inner.handlers.get(method).cloned()
                }
                _ => None,
            };

            let Some(handler) = handler else {
                tracing::debug!(path = %req.uri().path(), "no rpc handler for path");
                return Ok(unimplemented_response());
            };

            let call = UnaryCall {
                handler,
                group: inner.group.clone(),
            };
            let mut grpc = tonic::server::Grpc::new(RawCodec);
            let response = grpc.unary(call, req).await;
            Ok(response.map(axum::body::Body::new))
        })
    }
}

/// Running server bound to a local address.
///
/// Dropping the handle does not stop the server; call
/// [`stop`](RpcServerHandle::stop) (or cancel the parent token) for a
/// graceful shutdown.
pub struct RpcServerHandle {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RpcServerHandle {
    /// Address the server is accepting connections on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Graceful shutdown: stop accepting new calls, let in-flight calls
    /// finish, and wait for the serve task. Safe to call repeatedly; a
    /// second stop is a no-op.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "rpc server task ended abnormally");
            }
        }
    }
}

impl std::fmt::Debug for RpcServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServerHandle")
            .field("local_addr", &self.local_addr)
            .field("stopped", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Start the inbound server for the service descriptor at
/// `{config.ns}.{config.name}`.
///
/// The listener is bound before this function returns: a resolved
/// `start_server` means the server is accepting connections.
///
/// # Errors
/// Fails when the descriptor is missing at the expected path, when a handler
/// is registered for a method the descriptor does not declare, when the bind
/// resolver errors, or when the resolved address cannot be parsed or bound.
pub(crate) async fn start_server(
    group: Arc<ServiceGroup>,
    args: ServerArgs,
    cancel: CancellationToken,
) -> Result<RpcServerHandle, RpcSetupError> {
    let config = group.config();
    let ns = config.ns.clone();
    let name = config.name.clone();
    let qualified = config.qualified_name();

    let descriptor =
        args.catalog
            .service(&ns, &name)
            .ok_or_else(|| RpcSetupError::ServiceNotFound {
                path: qualified.clone(),
            })?;

    for method in args.handlers.keys() {
        if !descriptor.has_method(method) {
            return Err(RpcSetupError::UnknownMethod {
                service: qualified.clone(),
                method: method.clone(),
            });
        }
    }

    let allow: PermissionPredicate = args
        .permission
        .unwrap_or_else(|| Arc::new(|_origin, _method| true));

    let handlers: HashMap<String, RpcHandlerFn> = args
        .handlers
        .into_iter()
        .map(|(method, handler)| {
            let shimmed = shim_handler(&method, handler, allow.clone());
            (method, shimmed)
        })
        .collect();

    let policy = args
        .bind
        .resolve(&group)
        .map_err(|source| RpcSetupError::BindResolver { source })?;
    let ServerCredentials::Insecure = policy.credentials;

    let addr: SocketAddr =
        policy
            .listen_addr
            .parse()
            .map_err(|source| RpcSetupError::InvalidListenAddr {
                addr: policy.listen_addr.clone(),
                source,
            })?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| RpcSetupError::Bind { addr, source })?;
    let local_addr = listener
        .local_addr()
        .map_err(|source| RpcSetupError::Bind { addr, source })?;

    tracing::info!(
        service = %qualified,
        %local_addr,
        methods = handlers.len(),
        "rpc server listening"
    );

    let dispatcher = RpcDispatcher::new(qualified, handlers, group);
    let router = axum::Router::new().fallback_service(dispatcher);

    let shutdown = cancel.clone();
    let task = tokio::spawn(async move {
        let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
            shutdown.cancelled().await;
        });
        if let Err(e) = serve.await {
            tracing::error!(error = %e, "rpc server terminated abnormally");
        }
    });

    Ok(RpcServerHandle {
        local_addr,
        cancel,
        task: Mutex::new(Some(task)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use srvkit::config::AppConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_group() -> Arc<ServiceGroup> {
        Arc::new(ServiceGroup::new(AppConfig::new("proj", "App")))
    }

    fn ctx_with_origin(origin: Option<&str>) -> RpcContext {
        let mut metadata = MetadataMap::new();
        if let Some(origin) = origin {
            metadata.insert("origin", origin.parse().unwrap());
        }
        RpcContext {
            request: Bytes::from_static(b"payload"),
            metadata,
            group: test_group(),
        }
    }

    fn counting_handler(counter: Arc<AtomicUsize>) -> RpcHandlerFn {
        handler_fn(move |ctx: RpcContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(ctx.request) }
        })
    }

    #[test]
    fn split_grpc_path_accepts_service_and_method() {
        assert_eq!(
            split_grpc_path("/proj.App/Echo"),
            Some(("proj.App", "Echo"))
        );
        assert_eq!(split_grpc_path("/proj.App/"), None);
        assert_eq!(split_grpc_path("/proj.App"), None);
        assert_eq!(split_grpc_path("proj.App/Echo"), None);
        assert_eq!(split_grpc_path("/a/b/c"), None);
    }

    #[tokio::test]
    async fn denying_predicate_blocks_the_handler() {
        let invoked = Arc::new(AtomicUsize::new(0));
        let shimmed = shim_handler(
            "Echo",
            counting_handler(invoked.clone()),
            Arc::new(|_, _| false),
        );

        let err = shimmed(ctx_with_origin(Some("Caller")))
            .await
            .expect_err("call should be denied");
        assert_eq!(err.code(), Code::PermissionDenied);
        assert_eq!(
            invoked.load(Ordering::SeqCst),
            0,
            "handler must never run when denied"
        );
    }

    #[tokio::test]
    async fn allowing_predicate_forwards_the_result_unchanged() {
        let invoked = Arc::new(AtomicUsize::new(0));
        let shimmed = shim_handler(
            "Echo",
            counting_handler(invoked.clone()),
            Arc::new(|_, _| true),
        );

        let reply = shimmed(ctx_with_origin(Some("Caller"))).await.unwrap();
        assert_eq!(reply, Bytes::from_static(b"payload"));
        assert_eq!(invoked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_errors_surface_as_the_call_status() {
        let handler = handler_fn(|_ctx| async {
            Err(Status::failed_precondition("not today"))
        });
        let shimmed = shim_handler("Echo", handler, Arc::new(|_, _| true));

        let err = shimmed(ctx_with_origin(None)).await.expect_err("should fail");
        assert_eq!(err.code(), Code::FailedPrecondition);
        assert_eq!(err.message(), "not today");
    }

    #[tokio::test]
    async fn predicate_sees_origin_and_method() {
        let seen: Arc<parking_lot::Mutex<Vec<(String, String)>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_probe = seen.clone();
        let shimmed = shim_handler(
            "Echo",
            handler_fn(|_ctx| async { Ok(Bytes::new()) }),
            Arc::new(move |origin, method| {
                seen_probe.lock().push((origin.to_owned(), method.to_owned()));
                true
            }),
        );

        shimmed(ctx_with_origin(Some("Caller"))).await.unwrap();
        // Missing origin degrades to the empty string, never a crash.
        shimmed(ctx_with_origin(None)).await.unwrap();

        let calls = seen.lock();
        assert_eq!(calls[0], ("Caller".to_owned(), "Echo".to_owned()));
        assert_eq!(calls[1], (String::new(), "Echo".to_owned()));
    }

    #[tokio::test]
    async fn missing_descriptor_fails_with_the_full_path() {
        let group = test_group();
        let args = ServerArgs {
            catalog: Arc::new(crate::ProtoCatalog::builder().build()),
            handlers: HashMap::new(),
            permission: None,
            bind: Arc::new(|_group: &ServiceGroup| -> anyhow::Result<BindPolicy> {
                Ok(BindPolicy {
                    listen_addr: "127.0.0.1:0".to_owned(),
                    credentials: ServerCredentials::Insecure,
                })
            }),
        };

        let err = start_server(group, args, CancellationToken::new())
            .await
            .expect_err("missing descriptor should fail");
        assert!(matches!(err, RpcSetupError::ServiceNotFound { .. }));
        assert!(
            err.to_string().contains("proj.App"),
            "error should name the path: {err}"
        );
    }

    #[tokio::test]
    async fn handler_for_undeclared_method_fails_setup() {
        let group = test_group();
        let mut handlers = HashMap::new();
        handlers.insert(
            "NotInProto".to_owned(),
            handler_fn(|_ctx| async { Ok(Bytes::new()) }),
        );
        let args = ServerArgs {
            catalog: Arc::new(
                crate::ProtoCatalog::builder()
                    .service("proj", "App", ["Echo"])
                    .build(),
            ),
            handlers,
            permission: None,
            bind: Arc::new(|_group: &ServiceGroup| -> anyhow::Result<BindPolicy> {
                Ok(BindPolicy {
                    listen_addr: "127.0.0.1:0".to_owned(),
                    credentials: ServerCredentials::Insecure,
                })
            }),
        };

        let err = start_server(group, args, CancellationToken::new())
            .await
            .expect_err("undeclared method should fail");
        assert!(matches!(err, RpcSetupError::UnknownMethod { .. }));
        assert!(err.to_string().contains("NotInProto"));
    }

    #[tokio::test]
    async fn invalid_listen_addr_is_a_setup_error() {
        let group = test_group();
        let args = ServerArgs {
            catalog: Arc::new(
                crate::ProtoCatalog::builder()
                    .service("proj", "App", ["Echo"])
                    .build(),
            ),
            handlers: HashMap::new(),
            permission: None,
            bind: Arc::new(|_group: &ServiceGroup| -> anyhow::Result<BindPolicy> {
                Ok(BindPolicy {
                    listen_addr: "not-an-address".to_owned(),
                    credentials: ServerCredentials::Insecure,
                })
            }),
        };

        let err = start_server(group, args, CancellationToken::new())
            .await
            .expect_err("bad address should fail");
        assert!(matches!(err, RpcSetupError::InvalidListenAddr { .. }));
        assert!(err.to_string().contains("not-an-address"));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let group = test_group();
        let args = ServerArgs {
            catalog: Arc::new(
                crate::ProtoCatalog::builder()
                    .service("proj", "App", ["Echo"])
                    .build(),
            ),
            handlers: HashMap::new(),
            permission: None,
            bind: Arc::new(|_group: &ServiceGroup| -> anyhow::Result<BindPolicy> {
                Ok(BindPolicy {
                    listen_addr: "127.0.0.1:0".to_owned(),
                    credentials: ServerCredentials::Insecure,
                })
            }),
        };

        let handle = start_server(group, args, CancellationToken::new())
            .await
            .expect("server should start");
        assert_ne!(handle.local_addr().port(), 0, "ephemeral port was bound");

        handle.stop().await;
        handle.stop().await;
    }
}

//! Service contracts: the capability object, its initializer, and the
//! per-service bootstrap context.
//!
//! Design notes:
//! - Initializers are explicit values ([`ServiceInit`] implementations or the
//!   [`init_fn`]/[`init_with_callback`] adapters); there is no runtime
//!   string-to-initializer resolution.
//! - The framework speaks exactly one completion style internally (a future
//!   resolving to `Result`). Callback-style producers are converted once, at
//!   the outermost edge, by [`init_with_callback`].

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::group::ServiceGroup;

/// An independently initialized capability module registered into the group.
///
/// Services are opaque to the framework; consumers downcast to the concrete
/// type via [`ServiceGroup::get_as`]. The optional `stop` hook is invoked by
/// [`ServiceGroup::stop_all`] during application shutdown.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Downcast hook. Implementations return `self`.
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Release resources held by this service. Must tolerate being called
    /// after the service already stopped.
    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Context handed to a service initializer.
///
/// The group reference is shared, not a snapshot: initializers run
/// concurrently and may observe a partially populated group. A service that
/// needs a sibling must treat its absence as recoverable (retry or fail),
/// never as a crash.
#[derive(Clone)]
pub struct ServiceCtx {
    name: Arc<str>,
    group: Arc<ServiceGroup>,
    cancellation_token: CancellationToken,
}

impl ServiceCtx {
    pub(crate) fn new(
        name: impl Into<Arc<str>>,
        group: Arc<ServiceGroup>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            group,
            cancellation_token,
        }
    }

    /// Name this service is being registered under.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The shared service group (possibly still being populated).
    #[inline]
    pub fn group(&self) -> &Arc<ServiceGroup> {
        &self.group
    }

    /// Application configuration carried by the group.
    #[inline]
    pub fn config(&self) -> &crate::config::AppConfig {
        self.group.config()
    }

    /// Token cancelled when the application shuts down. Long-running
    /// services select on it in their background loops.
    #[inline]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }
}

/// Asynchronous service initializer.
#[async_trait]
pub trait ServiceInit: Send + Sync + 'static {
    async fn init(&self, ctx: ServiceCtx) -> anyhow::Result<Arc<dyn Service>>;
}

/// A named service to bring up during bootstrap.
#[derive(Clone)]
pub struct ServiceSpec {
    pub name: String,
    pub init: Arc<dyn ServiceInit>,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>, init: Arc<dyn ServiceInit>) -> Self {
        Self {
            name: name.into(),
            init,
        }
    }
}

impl std::fmt::Debug for ServiceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceSpec")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

struct FnInit<F>(F);

#[async_trait]
impl<F, Fut> ServiceInit for FnInit<F>
where
    F: Fn(ServiceCtx) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Arc<dyn Service>>> + Send + 'static,
{
    async fn init(&self, ctx: ServiceCtx) -> anyhow::Result<Arc<dyn Service>> {
        (self.0)(ctx).await
    }
}

/// Wrap a future-returning closure as a [`ServiceInit`].
pub fn init_fn<F, Fut>(f: F) -> Arc<dyn ServiceInit>
where
    F: Fn(ServiceCtx) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Arc<dyn Service>>> + Send + 'static,
{
    Arc::new(FnInit(f))
}

/// Consume-once completion handle for callback-style initializers.
///
/// Exactly one of [`done`](Completion::done) or [`fail`](Completion::fail)
/// can ever be called; the handle is consumed by either. Dropping it without
/// signalling fails the service's bootstrap.
pub struct Completion {
    tx: oneshot::Sender<anyhow::Result<Arc<dyn Service>>>,
}

impl Completion {
    /// Report successful initialization.
    pub fn done(self, service: Arc<dyn Service>) {
        let _ = self.tx.send(Ok(service));
    }

    /// Report failed initialization.
    pub fn fail(self, err: anyhow::Error) {
        let _ = self.tx.send(Err(err));
    }
}

struct CallbackInit<F>(F);

#[async_trait]
impl<F> ServiceInit for CallbackInit<F>
where
    F: Fn(ServiceCtx, Completion) + Send + Sync + 'static,
{
    async fn init(&self, ctx: ServiceCtx) -> anyhow::Result<Arc<dyn Service>> {
        let (tx, rx) = oneshot::channel();
        (self.0)(ctx, Completion { tx });
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "initializer dropped its completion handle without signalling"
            )),
        }
    }
}

/// Adapt a callback-style producer into a [`ServiceInit`].
///
/// The producer receives the context and a [`Completion`] handle and may
/// signal from any task; the conversion to the framework's future style
/// happens here, once.
pub fn init_with_callback<F>(f: F) -> Arc<dyn ServiceInit>
where
    F: Fn(ServiceCtx, Completion) + Send + Sync + 'static,
{
    Arc::new(CallbackInit(f))
}

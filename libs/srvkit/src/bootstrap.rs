//! Bootstrap orchestrator: concurrent construction of the service group.
//!
//! Phase order is deliberately flat — every initializer is spawned at once
//! and the join is completion-ordered:
//! - N independent services each taking duration `d` come up in ≈ `d`.
//! - The first failure wins and fails the whole bootstrap; siblings already
//!   in flight are *not* cancelled and their side effects are not rolled
//!   back. That is the accepted contract, not an oversight: initializers are
//!   plain spawned tasks and run to completion on their own.
//! - No ordering between services is provided. An initializer that needs a
//!   sibling observes the shared group and treats absence as recoverable.
//! - No timeout is imposed here; a hanging initializer hangs the bootstrap.
//!   Callers that want a deadline wrap the returned future themselves.

use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};

use crate::config::AppConfig;
use crate::group::ServiceGroup;
use crate::service::{ServiceCtx, ServiceSpec};

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    /// Two specs claimed the same name. Rejected before any initializer runs.
    #[error("duplicate service name '{name}' in service specs")]
    DuplicateService { name: String },

    /// A service's initializer failed (or panicked). The original message is
    /// preserved in the error chain.
    #[error("service '{name}' failed to initialize: {source}")]
    Service {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Bring up every service in `specs` concurrently and return the populated
/// group.
///
/// Each initializer receives a [`ServiceCtx`] holding a shared reference to
/// the group (not a snapshot) and a child cancellation token. On success the
/// service is inserted under its spec name immediately, so concurrently
/// running siblings can observe it.
///
/// # Errors
/// Returns [`BootstrapError::DuplicateService`] when two specs share a name,
/// or [`BootstrapError::Service`] for the first initializer failure in
/// completion order.
pub async fn init_group(
    config: AppConfig,
    specs: Vec<ServiceSpec>,
) -> Result<Arc<ServiceGroup>, BootstrapError> {
    let mut seen = HashSet::new();
    for spec in &specs {
        if !seen.insert(spec.name.clone()) {
            return Err(BootstrapError::DuplicateService {
                name: spec.name.clone(),
            });
        }
    }

    let group = Arc::new(ServiceGroup::new(config));
    tracing::info!(
        app = %group.config().qualified_name(),
        services = specs.len(),
        "bootstrapping service group"
    );

    let mut pending = FuturesUnordered::new();
    for spec in specs {
        let ServiceSpec { name, init } = spec;
        let ctx = ServiceCtx::new(
            name.as_str(),
            group.clone(),
            group.cancellation_token().child_token(),
        );
        let task_group = group.clone();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let service = init.init(ctx).await?;
            task_group.insert(&task_name, service);
            Ok::<_, anyhow::Error>(())
        });
        pending.push(async move { (name, handle.await) });
    }

    while let Some((name, joined)) = pending.next().await {
        match joined {
            Ok(Ok(())) => {
                tracing::debug!(service = %name, "service initialized");
            }
            Ok(Err(source)) => {
                return Err(BootstrapError::Service { name, source });
            }
            Err(join_err) => {
                return Err(BootstrapError::Service {
                    name,
                    source: anyhow::anyhow!("initializer panicked: {join_err}"),
                });
            }
        }
    }

    tracing::info!(
        app = %group.config().qualified_name(),
        services = group.len(),
        "service group ready"
    );
    Ok(group)
}

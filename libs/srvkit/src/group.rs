//! The shared service group.
//!
//! Design goals:
//! - One group per application lifetime, shared by reference with every
//!   service and request handler.
//! - The map grows monotonically during bootstrap; only the orchestrator
//!   writes (crate-private [`ServiceGroup::insert`]), behind a single writer
//!   lock.
//! - Reads are defensive: a missing or differently-typed entry is a
//!   recoverable [`GroupError`], never a panic.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::service::Service;

#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error("service not found: {name}")]
    NotFound { name: String },

    #[error("service '{name}' has a different type than requested")]
    TypeMismatch { name: String },
}

/// Live mapping from service name to service, plus the shared configuration.
pub struct ServiceGroup {
    config: AppConfig,
    cancellation_token: CancellationToken,
    services: RwLock<HashMap<String, Arc<dyn Service>>>,
}

impl ServiceGroup {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            cancellation_token: CancellationToken::new(),
            services: RwLock::new(HashMap::new()),
        }
    }

    /// Application configuration. Immutable for the group's lifetime.
    #[inline]
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Root token cancelled by [`ServiceGroup::stop_all`].
    #[inline]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Fetch a service by name.
    ///
    /// During bootstrap the group may be partially populated; callers that
    /// depend on a sibling must handle `None`.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.services.read().get(name).cloned()
    }

    /// Fetch a service by name, failing with a typed error when absent.
    ///
    /// # Errors
    /// Returns [`GroupError::NotFound`] when no service is registered under
    /// `name`.
    pub fn require(&self, name: &str) -> Result<Arc<dyn Service>, GroupError> {
        self.get(name).ok_or_else(|| GroupError::NotFound {
            name: name.to_owned(),
        })
    }

    /// Fetch a service and downcast it to its concrete type.
    ///
    /// # Errors
    /// Returns [`GroupError::NotFound`] when absent and
    /// [`GroupError::TypeMismatch`] when the entry is not a `T`.
    pub fn get_as<T: Service>(&self, name: &str) -> Result<Arc<T>, GroupError> {
        let service = self.require(name)?;
        service
            .as_any()
            .downcast::<T>()
            .map_err(|_| GroupError::TypeMismatch {
                name: name.to_owned(),
            })
    }

    /// Registered service names, in no particular order.
    pub fn names(&self) -> Vec<String> {
        self.services.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.services.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.read().is_empty()
    }

    /// Register a service. Only the bootstrap orchestrator writes; names are
    /// unique per the spec-level invariant enforced before spawning.
    pub(crate) fn insert(&self, name: &str, service: Arc<dyn Service>) {
        self.services.write().insert(name.to_owned(), service);
    }

    /// Shut the group down: cancel the root token, then invoke every
    /// service's stop hook. Per-service failures are logged, not propagated,
    /// so one misbehaving service cannot block the rest of shutdown.
    pub async fn stop_all(&self) {
        self.cancellation_token.cancel();

        let services: Vec<(String, Arc<dyn Service>)> = {
            let guard = self.services.read();
            guard.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        for (name, service) in services {
            if let Err(e) = service.stop().await {
                tracing::warn!(service = %name, error = %e, "service stop failed");
            } else {
                tracing::debug!(service = %name, "service stopped");
            }
        }
    }
}

// The service map holds trait objects, so Debug is written by hand.
impl std::fmt::Debug for ServiceGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceGroup")
            .field("config", &self.config.qualified_name())
            .field("services", &self.names())
            .finish()
    }
}

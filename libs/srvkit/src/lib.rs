//! srvkit — pluggable backend service composition.
//!
//! An application declares a set of named services; [`bootstrap::init_group`]
//! brings them up concurrently and exposes them through a shared
//! [`group::ServiceGroup`]. Services are opaque capability objects produced
//! by explicit initializers ([`service::ServiceInit`]); the group is the one
//! broadly shared, read-mostly resource of the application.
//!
//! ```ignore
//! let config = AppConfig::new("proj", "App");
//! let specs = vec![
//!     ServiceSpec::new("redis", init_fn(redis_init)),
//!     ServiceSpec::new("rpc", Arc::new(GrpcInit::new(grpc_args))),
//! ];
//! let group = srvkit::bootstrap::init_group(config, specs).await?;
//! let redis = group.get_as::<RedisService>("redis")?;
//! // ... on shutdown:
//! group.stop_all().await;
//! ```

pub mod bootstrap;
pub mod config;
pub mod group;
pub mod service;
pub mod telemetry;

pub use bootstrap::{init_group, BootstrapError};
pub use config::{AppConfig, ConfigError};
pub use group::{GroupError, ServiceGroup};
pub use service::{
    init_fn, init_with_callback, Completion, Service, ServiceCtx, ServiceInit, ServiceSpec,
};

//! Service Registry for Armature
//!
//! An in-memory, Eureka-style service registry: instances register,
//! heartbeat, and cancel; clients fetch incremental membership snapshots; a
//! background loop evicts instances that stopped heartbeating.
//!
//! ## Features
//!
//! - **Registration** - Out-of-order registrations are resolved by dirty timestamp
//! - **Incremental Fetch** - A freshness token avoids resending unchanged membership
//! - **Heartbeats** - Renewals never invalidate client caches
//! - **Self-Preserving Eviction** - At most 15% of instances are evicted per pass (configurable)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use armature_registry::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = Registry::start(RegistryConfig::from_env()?)?;
//!
//!     let now = registry.now();
//!     let instance = Instance::new("prod", "billing", "billing-1", now)
//!         .with_addr("10.0.0.1:8080")
//!         .with_version("v1.4.2");
//!     registry.register(instance, now).await?;
//!
//!     // First fetch: since = 0
//!     let data = registry.fetch("prod", "billing", status::UP, 0).await?;
//!     println!("{} instance(s)", data.instances.len());
//!
//!     // Later fetches pass the token back; NotFresh means "no changes"
//!     match registry.fetch("prod", "billing", status::UP, data.latest_timestamp).await {
//!         Err(e) if e.is_not_fresh() => println!("up to date"),
//!         other => println!("{:?}", other),
//!     }
//!
//!     registry.renew("prod", "billing", "billing-1").await?;
//!     registry.cancel("prod", "billing", "billing-1", registry.now()).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod application;
pub mod clock;
pub mod config;
pub mod error;
pub mod eviction;
pub mod instance;
pub mod registry;

pub use application::Application;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::RegistryConfig;
pub use error::{ConfigError, RegistryError, RegistryResult};
pub use eviction::{EvictionReport, Evictor, eviction_cap, select_victims};
pub use instance::{
    CancelRequest, FetchData, FetchRequest, Instance, RegisterRequest, RenewRequest, status,
};
pub use registry::{Registry, ServiceRegistry};

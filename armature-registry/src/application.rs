//! Per-application instance table.

use crate::error::{RegistryError, RegistryResult};
use crate::instance::{FetchData, Instance};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{trace, warn};

/// All instances of one `(app_id, env)`.
///
/// The instance map and the freshness token live behind the application's
/// own lock. Everything returned from here is an owned copy.
#[derive(Debug)]
pub struct Application {
    app_id: String,
    env: String,
    state: RwLock<AppState>,
}

#[derive(Debug, Default)]
struct AppState {
    instances: HashMap<String, Instance>,
    latest_timestamp: i64,
    /// Set once the registry has dropped this application; no writes after that
    detached: bool,
}

/// Outcome of an upsert.
#[derive(Debug, Clone)]
pub(crate) struct Upsert {
    pub instance: Instance,
    pub is_new: bool,
    pub stale: bool,
}

impl Application {
    /// Create an empty application
    pub fn new(app_id: impl Into<String>, env: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            env: env.into(),
            state: RwLock::new(AppState::default()),
        }
    }

    /// Application identifier
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Environment
    pub fn env(&self) -> &str {
        &self.env
    }

    /// Timestamp of the last membership change
    pub async fn latest_timestamp(&self) -> i64 {
        self.state.read().await.latest_timestamp
    }

    /// Number of registered instances
    pub async fn len(&self) -> usize {
        self.state.read().await.instances.len()
    }

    /// Whether the application has no instances
    pub async fn is_empty(&self) -> bool {
        self.state.read().await.instances.is_empty()
    }

    /// Copy of every instance, regardless of status
    pub async fn all_instances(&self) -> Vec<Instance> {
        self.state.read().await.instances.values().cloned().collect()
    }

    /// Instances matching `status`, if anything changed after `since`.
    pub async fn fetch(&self, status: u32, since: i64) -> RegistryResult<FetchData> {
        let state = self.state.read().await;
        if state.detached {
            return Err(self.not_found());
        }
        if since >= state.latest_timestamp {
            return Err(RegistryError::NotFresh {
                since,
                latest: state.latest_timestamp,
            });
        }

        let instances: Vec<Instance> = state
            .instances
            .values()
            .filter(|instance| instance.matches(status))
            .cloned()
            .collect();

        if instances.is_empty() {
            return Err(RegistryError::NoMatchingInstance {
                app_id: self.app_id.clone(),
                env: self.env.clone(),
                status,
            });
        }

        trace!(app_id = %self.app_id, env = %self.env, count = instances.len(), "Fetched instances");

        Ok(FetchData {
            instances,
            latest_timestamp: state.latest_timestamp,
        })
    }

    /// Insert or update an instance.
    ///
    /// Hands the instance back untouched when the application is detached.
    pub(crate) async fn upsert(
        &self,
        mut incoming: Instance,
        latest_timestamp: i64,
    ) -> Result<Upsert, Instance> {
        let mut state = self.state.write().await;
        if state.detached {
            return Err(incoming);
        }

        let mut stale = false;
        let existing = state.instances.get(&incoming.hostname);
        let is_new = existing.is_none();

        if let Some(existing) = existing {
            incoming.up_timestamp = existing.up_timestamp;
            if incoming.dirty_timestamp < existing.dirty_timestamp {
                warn!(
                    app_id = %self.app_id,
                    env = %self.env,
                    hostname = %incoming.hostname,
                    incoming_dirty = incoming.dirty_timestamp,
                    existing_dirty = existing.dirty_timestamp,
                    "Stale registration, keeping existing record"
                );
                incoming = existing.clone();
                stale = true;
            }
        }

        state
            .instances
            .insert(incoming.hostname.clone(), incoming.clone());
        state.latest_timestamp = latest_timestamp;

        Ok(Upsert {
            instance: incoming,
            is_new,
            stale,
        })
    }

    /// Remove an instance, returning it and the remaining count.
    pub(crate) async fn cancel(
        &self,
        hostname: &str,
        latest_timestamp: i64,
    ) -> RegistryResult<(Instance, usize)> {
        let mut state = self.state.write().await;
        if state.detached {
            return Err(self.not_found());
        }

        let mut removed = state
            .instances
            .remove(hostname)
            .ok_or_else(|| RegistryError::instance_not_found(&self.app_id, &self.env, hostname))?;

        removed.latest_timestamp = latest_timestamp;
        state.latest_timestamp = latest_timestamp;

        Ok((removed, state.instances.len()))
    }

    /// Record a heartbeat. Leaves the freshness token alone.
    pub(crate) async fn renew(&self, hostname: &str, now: i64) -> RegistryResult<Instance> {
        let mut state = self.state.write().await;
        if state.detached {
            return Err(self.not_found());
        }

        let instance = state
            .instances
            .get_mut(hostname)
            .ok_or_else(|| RegistryError::instance_not_found(&self.app_id, &self.env, hostname))?;

        instance.renew_timestamp = now;
        Ok(instance.clone())
    }

    /// Mark the application detached if it is still empty.
    ///
    /// Callers hold the registry map's write lock, so no register can look
    /// this application up between the check and the map removal.
    pub(crate) async fn detach_if_empty(&self) -> bool {
        let mut state = self.state.write().await;
        if state.instances.is_empty() {
            state.detached = true;
        }
        state.detached
    }

    fn not_found(&self) -> RegistryError {
        RegistryError::app_not_found(&self.app_id, &self.env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::status;

    fn instance(hostname: &str, dirty: i64) -> Instance {
        Instance::new("test", "svc.a", hostname, 1)
            .with_addr("10.0.0.1:8080")
            .with_dirty_timestamp(dirty)
    }

    #[tokio::test]
    async fn test_upsert_and_fetch() {
        let app = Application::new("svc.a", "test");

        let upsert = app.upsert(instance("h1", 1), 10).await.unwrap();
        assert!(upsert.is_new);
        assert!(!upsert.stale);
        assert_eq!(app.latest_timestamp().await, 10);

        let data = app.fetch(status::UP, 0).await.unwrap();
        assert_eq!(data.latest_timestamp, 10);
        assert_eq!(data.instances, vec![upsert.instance]);
    }

    #[tokio::test]
    async fn test_upsert_carries_up_timestamp() {
        let app = Application::new("svc.a", "test");
        app.upsert(instance("h1", 1), 10).await.unwrap();

        let mut later = instance("h1", 2);
        later.up_timestamp = 999;
        let upsert = app.upsert(later, 20).await.unwrap();

        assert!(!upsert.is_new);
        assert_eq!(upsert.instance.up_timestamp, 1);
        assert_eq!(upsert.instance.dirty_timestamp, 2);
    }

    #[tokio::test]
    async fn test_stale_upsert_keeps_existing() {
        let app = Application::new("svc.a", "test");
        app.upsert(instance("h1", 100), 10).await.unwrap();

        let stale = Instance::new("test", "svc.a", "h1", 1)
            .with_addr("10.0.0.2:8080")
            .with_dirty_timestamp(50);
        let upsert = app.upsert(stale, 20).await.unwrap();

        assert!(upsert.stale);
        assert_eq!(upsert.instance.addrs, vec!["10.0.0.1:8080".to_string()]);
        assert_eq!(app.latest_timestamp().await, 20);
    }

    #[tokio::test]
    async fn test_fetch_errors() {
        let app = Application::new("svc.a", "test");
        app.upsert(instance("h1", 1), 10).await.unwrap();

        assert!(app.fetch(status::UP, 10).await.unwrap_err().is_not_fresh());
        assert!(app.fetch(status::UP, 11).await.unwrap_err().is_not_fresh());
        assert!(matches!(
            app.fetch(status::DOWN, 0).await,
            Err(RegistryError::NoMatchingInstance { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_and_renew() {
        let app = Application::new("svc.a", "test");
        app.upsert(instance("h1", 1), 10).await.unwrap();
        app.upsert(instance("h2", 1), 11).await.unwrap();

        let renewed = app.renew("h1", 500).await.unwrap();
        assert_eq!(renewed.renew_timestamp, 500);
        assert_eq!(app.latest_timestamp().await, 11);

        let (removed, remaining) = app.cancel("h1", 30).await.unwrap();
        assert_eq!(removed.latest_timestamp, 30);
        assert_eq!(remaining, 1);
        assert_eq!(app.latest_timestamp().await, 30);

        assert!(app.cancel("h1", 31).await.unwrap_err().is_not_found());
        assert!(app.renew("h1", 600).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_detached_application_rejects_writes() {
        let app = Application::new("svc.a", "test");
        app.upsert(instance("h1", 1), 10).await.unwrap();
        assert!(!app.detach_if_empty().await);

        app.cancel("h1", 20).await.unwrap();
        assert!(app.detach_if_empty().await);

        assert!(app.upsert(instance("h2", 1), 30).await.is_err());
        assert!(matches!(
            app.fetch(status::ALL, 0).await,
            Err(RegistryError::AppNotFound { .. })
        ));
    }
}

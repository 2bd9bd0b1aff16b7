//! The registry: application map plus the four client operations.

use crate::application::Application;
use crate::clock::{Clock, SystemClock};
use crate::config::RegistryConfig;
use crate::error::{ConfigError, RegistryError, RegistryResult};
use crate::eviction::{self, Evictor};
use crate::instance::{
    CancelRequest, FetchData, FetchRequest, Instance, RegisterRequest, RenewRequest, app_key,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Registry operations, as seen by transports and the eviction loop.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Register or refresh an instance
    async fn register(
        &self,
        instance: Instance,
        latest_timestamp: i64,
    ) -> RegistryResult<Arc<Application>>;

    /// Instances of an application whose status matches, if changed since `since`
    async fn fetch(
        &self,
        env: &str,
        app_id: &str,
        status: u32,
        since: i64,
    ) -> RegistryResult<FetchData>;

    /// Remove an instance
    async fn cancel(
        &self,
        env: &str,
        app_id: &str,
        hostname: &str,
        latest_timestamp: i64,
    ) -> RegistryResult<Instance>;

    /// Record a heartbeat
    async fn renew(&self, env: &str, app_id: &str, hostname: &str) -> RegistryResult<Instance>;

    /// Copy of every instance in every application
    async fn all_instances(&self) -> Vec<Instance>;
}

/// In-memory service registry.
///
/// The map lock only guards which applications exist; each application
/// guards its own instances.
pub struct Registry {
    apps: RwLock<HashMap<String, Arc<Application>>>,
    clock: Arc<dyn Clock>,
    config: RegistryConfig,
    eviction: Mutex<Option<JoinHandle<()>>>,
}

impl Registry {
    /// Create a registry without starting the eviction loop.
    ///
    /// The configuration is taken as given; call [`RegistryConfig::validate`]
    /// first, or use [`Registry::start`], which rejects invalid values. An
    /// out-of-range retention ratio never widens the eviction cap beyond the
    /// whole population, see [`crate::eviction::eviction_cap`].
    pub fn new(config: RegistryConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a registry reading time from `clock`.
    ///
    /// Like [`Registry::new`], the configuration is not validated here.
    pub fn with_clock(config: RegistryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            apps: RwLock::new(HashMap::new()),
            clock,
            config,
            eviction: Mutex::new(None),
        }
    }

    /// Create a registry and start its eviction loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: RegistryConfig) -> Result<Arc<Self>, ConfigError> {
        Self::start_with_clock(config, Arc::new(SystemClock))
    }

    /// Like [`Registry::start`], reading time from `clock`
    pub fn start_with_clock(
        config: RegistryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let registry = Arc::new(Self::with_clock(config, clock));

        if registry.config.eviction_enabled {
            let evictor = Evictor::new(&registry.config, registry.clock.clone());
            let handle = eviction::spawn(
                Arc::downgrade(&registry),
                evictor,
                registry.config.eviction_interval,
            );
            if let Ok(mut slot) = registry.eviction.lock() {
                *slot = Some(handle);
            }
        }

        info!(
            eviction = registry.config.eviction_enabled,
            interval = ?registry.config.eviction_interval,
            staleness = ?registry.config.staleness_threshold,
            retention_ratio = registry.config.retention_ratio,
            "Service registry started"
        );

        Ok(registry)
    }

    /// Stop the eviction loop, if running
    pub fn stop_eviction(&self) {
        if let Ok(mut slot) = self.eviction.lock()
            && let Some(handle) = slot.take()
        {
            handle.abort();
            info!("Eviction loop stopped");
        }
    }

    /// Whether the eviction loop is running
    pub fn is_evicting(&self) -> bool {
        self.eviction
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|handle| !handle.is_finished()))
            .unwrap_or(false)
    }

    /// Active configuration
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Current time according to the registry's clock
    pub fn now(&self) -> i64 {
        self.clock.now_nanos()
    }

    /// Register or refresh an instance.
    ///
    /// Creates the application on first use. `latest_timestamp` becomes the
    /// application's freshness token.
    pub async fn register(
        &self,
        instance: Instance,
        latest_timestamp: i64,
    ) -> RegistryResult<Arc<Application>> {
        let key = instance.app_key();
        let mut instance = instance;

        loop {
            let app = self.get_or_create(&key, &instance).await;

            match app.upsert(instance, latest_timestamp).await {
                Ok(upsert) => {
                    if upsert.is_new {
                        debug!(
                            app_id = %app.app_id(),
                            env = %app.env(),
                            hostname = %upsert.instance.hostname,
                            "New instance registered"
                        );
                    } else if !upsert.stale {
                        debug!(
                            app_id = %app.app_id(),
                            env = %app.env(),
                            hostname = %upsert.instance.hostname,
                            "Instance registration refreshed"
                        );
                    }
                    return Ok(app);
                }
                Err(returned) => {
                    // Emptied and removed between lookup and upsert
                    debug!(key = %key, "Application detached during register, retrying");
                    instance = returned;
                }
            }
        }
    }

    /// Instances of `(app_id, env)` matching `status`, if changed after `since`.
    pub async fn fetch(
        &self,
        env: &str,
        app_id: &str,
        status: u32,
        since: i64,
    ) -> RegistryResult<FetchData> {
        let app = self.require(app_id, env).await?;
        app.fetch(status, since).await
    }

    /// Remove an instance; drops the application once it is empty.
    pub async fn cancel(
        &self,
        env: &str,
        app_id: &str,
        hostname: &str,
        latest_timestamp: i64,
    ) -> RegistryResult<Instance> {
        let app = self.require(app_id, env).await?;
        let (instance, remaining) = app.cancel(hostname, latest_timestamp).await?;

        debug!(app_id = %app_id, env = %env, hostname = %hostname, remaining, "Instance cancelled");

        if remaining == 0 {
            self.remove_if_empty(&app_key(app_id, env), &app).await;
        }

        Ok(instance)
    }

    /// Record a heartbeat for an instance.
    pub async fn renew(&self, env: &str, app_id: &str, hostname: &str) -> RegistryResult<Instance> {
        let app = self.require(app_id, env).await?;
        let instance = app.renew(hostname, self.clock.now_nanos()).await?;
        debug!(app_id = %app_id, env = %env, hostname = %hostname, "Instance renewed");
        Ok(instance)
    }

    /// Register from a transport request.
    ///
    /// A zero `latest_timestamp` is replaced by the current time.
    pub async fn register_request(
        &self,
        req: &RegisterRequest,
    ) -> RegistryResult<Arc<Application>> {
        let now = self.clock.now_nanos();
        let instance = Instance::from_request(req, now);
        self.register(instance, or_now(req.latest_timestamp, now))
            .await
    }

    /// Fetch from a transport request
    pub async fn fetch_request(&self, req: &FetchRequest) -> RegistryResult<FetchData> {
        self.fetch(&req.env, &req.app_id, req.status, req.latest_timestamp)
            .await
    }

    /// Cancel from a transport request; a zero timestamp means now
    pub async fn cancel_request(&self, req: &CancelRequest) -> RegistryResult<Instance> {
        let latest = or_now(req.latest_timestamp, self.clock.now_nanos());
        self.cancel(&req.env, &req.app_id, &req.hostname, latest)
            .await
    }

    /// Renew from a transport request
    pub async fn renew_request(&self, req: &RenewRequest) -> RegistryResult<Instance> {
        self.renew(&req.env, &req.app_id, &req.hostname).await
    }

    /// Look up an application
    pub async fn application(&self, app_id: &str, env: &str) -> Option<Arc<Application>> {
        self.apps.read().await.get(&app_key(app_id, env)).cloned()
    }

    /// Snapshot of every live application
    pub async fn applications(&self) -> Vec<Arc<Application>> {
        self.apps.read().await.values().cloned().collect()
    }

    /// Number of live applications
    pub async fn app_count(&self) -> usize {
        self.apps.read().await.len()
    }

    /// Total number of instances across all applications
    pub async fn instance_count(&self) -> usize {
        let mut total = 0;
        for app in self.applications().await {
            total += app.len().await;
        }
        total
    }

    /// Copy of every instance in every application
    pub async fn all_instances(&self) -> Vec<Instance> {
        let mut instances = Vec::new();
        for app in self.applications().await {
            instances.extend(app.all_instances().await);
        }
        instances
    }

    async fn require(&self, app_id: &str, env: &str) -> RegistryResult<Arc<Application>> {
        self.application(app_id, env)
            .await
            .ok_or_else(|| RegistryError::app_not_found(app_id, env))
    }

    async fn get_or_create(&self, key: &str, instance: &Instance) -> Arc<Application> {
        if let Some(app) = self.apps.read().await.get(key) {
            return app.clone();
        }

        let mut apps = self.apps.write().await;
        apps.entry(key.to_string())
            .or_insert_with(|| {
                debug!(app_id = %instance.app_id, env = %instance.env, "Creating application");
                Arc::new(Application::new(&instance.app_id, &instance.env))
            })
            .clone()
    }

    /// Drop `app` from the map if it is still the mapped entry and still empty.
    async fn remove_if_empty(&self, key: &str, app: &Arc<Application>) {
        let mut apps = self.apps.write().await;
        let is_current = apps
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, app));

        if is_current && app.detach_if_empty().await {
            apps.remove(key);
            debug!(key = %key, "Removed empty application");
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        if let Ok(slot) = self.eviction.get_mut()
            && let Some(handle) = slot.take()
        {
            handle.abort();
        }
    }
}

#[async_trait]
impl ServiceRegistry for Registry {
    async fn register(
        &self,
        instance: Instance,
        latest_timestamp: i64,
    ) -> RegistryResult<Arc<Application>> {
        Registry::register(self, instance, latest_timestamp).await
    }

    async fn fetch(
        &self,
        env: &str,
        app_id: &str,
        status: u32,
        since: i64,
    ) -> RegistryResult<FetchData> {
        Registry::fetch(self, env, app_id, status, since).await
    }

    async fn cancel(
        &self,
        env: &str,
        app_id: &str,
        hostname: &str,
        latest_timestamp: i64,
    ) -> RegistryResult<Instance> {
        Registry::cancel(self, env, app_id, hostname, latest_timestamp).await
    }

    async fn renew(&self, env: &str, app_id: &str, hostname: &str) -> RegistryResult<Instance> {
        Registry::renew(self, env, app_id, hostname).await
    }

    async fn all_instances(&self) -> Vec<Instance> {
        Registry::all_instances(self).await
    }
}

fn or_now(timestamp: i64, now: i64) -> i64 {
    if timestamp == 0 { now } else { timestamp }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::instance::status;

    fn registry() -> (Registry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let registry = Registry::with_clock(RegistryConfig::default(), clock.clone());
        (registry, clock)
    }

    fn instance(app_id: &str, hostname: &str, addr: &str) -> Instance {
        Instance::new("test", app_id, hostname, 1_000).with_addr(addr)
    }

    #[test]
    fn test_default_registry_is_empty() {
        let registry = Registry::default();
        assert_eq!(tokio_test::block_on(registry.app_count()), 0);
        assert!(tokio_test::block_on(registry.all_instances()).is_empty());
        assert!(!registry.is_evicting());
    }

    #[tokio::test]
    async fn test_register_then_fetch() {
        let (registry, _) = registry();
        let app = registry
            .register(instance("svc.a", "h1", "10.0.0.1:8080"), 10)
            .await
            .unwrap();
        assert_eq!(app.app_id(), "svc.a");

        let data = registry.fetch("test", "svc.a", status::UP, 0).await.unwrap();
        assert_eq!(data.latest_timestamp, 10);
        assert_eq!(data.instances.len(), 1);
        assert_eq!(data.instances[0].addrs, vec!["10.0.0.1:8080".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_app() {
        let (registry, _) = registry();
        let err = registry.fetch("test", "nope", status::ALL, 0).await.unwrap_err();
        assert_eq!(err, RegistryError::app_not_found("nope", "test"));
        assert!(registry.renew("test", "nope", "h1").await.is_err());
        assert!(registry.cancel("test", "nope", "h1", 1).await.is_err());
    }

    #[tokio::test]
    async fn test_environments_are_separate() {
        let (registry, _) = registry();
        registry
            .register(instance("svc.a", "h1", "10.0.0.1:8080"), 10)
            .await
            .unwrap();

        let prod = Instance::new("prod", "svc.a", "h1", 1_000);
        registry.register(prod, 11).await.unwrap();

        assert_eq!(registry.app_count().await, 2);
        assert!(registry.application("svc.a", "prod").await.is_some());
    }

    #[tokio::test]
    async fn test_cancel_last_instance_removes_app() {
        let (registry, _) = registry();
        registry
            .register(instance("svc.a", "h1", "10.0.0.1:8080"), 10)
            .await
            .unwrap();

        let removed = registry.cancel("test", "svc.a", "h1", 20).await.unwrap();
        assert_eq!(removed.latest_timestamp, 20);
        assert_eq!(registry.app_count().await, 0);
        assert!(matches!(
            registry.fetch("test", "svc.a", status::ALL, 0).await,
            Err(RegistryError::AppNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_renew_uses_clock() {
        let (registry, clock) = registry();
        registry
            .register(instance("svc.a", "h1", "10.0.0.1:8080"), 10)
            .await
            .unwrap();

        clock.set(5_000);
        let renewed = registry.renew("test", "svc.a", "h1").await.unwrap();
        assert_eq!(renewed.renew_timestamp, 5_000);

        let err = registry.fetch("test", "svc.a", status::UP, 10).await.unwrap_err();
        assert!(err.is_not_fresh());
    }

    #[tokio::test]
    async fn test_register_after_app_removed() {
        let (registry, _) = registry();
        let first = registry
            .register(instance("svc.a", "h1", "10.0.0.1:8080"), 10)
            .await
            .unwrap();
        registry.cancel("test", "svc.a", "h1", 20).await.unwrap();

        let second = registry
            .register(instance("svc.a", "h2", "10.0.0.2:8080"), 30)
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.len().await, 1);
    }

    #[tokio::test]
    async fn test_requests() {
        let (registry, clock) = registry();
        let req = RegisterRequest {
            env: "test".into(),
            app_id: "com.xx.testapp".into(),
            hostname: "webapi".into(),
            addrs: vec!["http://testapp.com".into()],
            status: status::UP,
            version: "v1.0.0".into(),
            ..Default::default()
        };
        registry.register_request(&req).await.unwrap();

        let fetch = FetchRequest {
            env: "test".into(),
            app_id: "com.xx.testapp".into(),
            status: status::UP,
            latest_timestamp: 0,
        };
        let data = registry.fetch_request(&fetch).await.unwrap();
        assert_eq!(data.latest_timestamp, 1_000);
        assert_eq!(data.instances[0].version, "v1.0.0");

        clock.advance(std::time::Duration::from_nanos(500));
        let renewed = registry
            .renew_request(&RenewRequest {
                env: "test".into(),
                app_id: "com.xx.testapp".into(),
                hostname: "webapi".into(),
            })
            .await
            .unwrap();
        assert_eq!(renewed.renew_timestamp, 1_500);

        let cancelled = registry
            .cancel_request(&CancelRequest {
                env: "test".into(),
                app_id: "com.xx.testapp".into(),
                hostname: "webapi".into(),
                latest_timestamp: 0,
            })
            .await
            .unwrap();
        assert_eq!(cancelled.latest_timestamp, 1_500);
        assert!(registry.fetch_request(&fetch).await.is_err());
    }

    #[tokio::test]
    async fn test_start_and_stop_eviction() {
        let registry = Registry::start(RegistryConfig::default()).unwrap();
        assert!(registry.is_evicting());

        registry.stop_eviction();
        assert!(!registry.is_evicting());

        let disabled = Registry::start(RegistryConfig::default().with_eviction(false)).unwrap();
        assert!(!disabled.is_evicting());
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let result = Registry::start(RegistryConfig::default().with_retention_ratio(-0.1));
        assert!(result.is_err());
    }
    #[tokio::test]
    async fn test_new_keeps_config_as_given() {
        let config = RegistryConfig::default().with_retention_ratio(f64::NAN);
        let registry = Registry::new(config);

        assert!(registry.config().retention_ratio.is_nan());
        assert!(registry.config().validate().is_err());
        assert!(!registry.is_evicting());

        // An evictor built from it still keeps every instance
        let mut evictor = Evictor::new(registry.config(), registry.clock.clone());
        let report = evictor.run_once(&registry).await;
        assert_eq!(report.cap, 0);
    }
}

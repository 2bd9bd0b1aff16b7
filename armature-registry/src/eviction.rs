//! Self-preserving eviction of instances that stopped heartbeating.
//!
//! Each pass evicts at most `N - floor(N * retention_ratio)` instances out of
//! a population of `N`, picked uniformly at random among the expired ones. A
//! partition or clock jump that makes most instances look stale therefore
//! drains the registry gradually instead of emptying it in one pass.

use crate::clock::{Clock, duration_nanos};
use crate::config::RegistryConfig;
use crate::registry::{Registry, ServiceRegistry};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Summary of one eviction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Instances in the registry when the pass started
    pub total: usize,
    /// Instances past the staleness threshold
    pub expired: usize,
    /// Most instances this pass was allowed to evict
    pub cap: usize,
    /// Instances actually cancelled
    pub evicted: usize,
}

/// Runs eviction passes against a registry.
pub struct Evictor<G = StdRng> {
    staleness_threshold: Duration,
    retention_ratio: f64,
    clock: Arc<dyn Clock>,
    rng: G,
}

impl Evictor<StdRng> {
    /// Create an evictor; seeded from `config.rng_seed` when set
    pub fn new(config: &RegistryConfig, clock: Arc<dyn Clock>) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self::with_rng(config, clock, rng)
    }
}

impl<G: Rng + Send> Evictor<G> {
    /// Create an evictor drawing from `rng`
    pub fn with_rng(config: &RegistryConfig, clock: Arc<dyn Clock>, rng: G) -> Self {
        Self {
            staleness_threshold: config.staleness_threshold,
            retention_ratio: config.retention_ratio,
            clock,
            rng,
        }
    }

    /// Run a single pass.
    ///
    /// Victims go through the registry's public `cancel`, so an emptied
    /// application is cleaned up exactly as for a client cancel. Cancel
    /// failures (e.g. the instance was cancelled concurrently) are skipped.
    pub async fn run_once<R>(&mut self, registry: &R) -> EvictionReport
    where
        R: ServiceRegistry + ?Sized,
    {
        let now = self.clock.now_nanos();
        let threshold = duration_nanos(self.staleness_threshold);

        let instances = registry.all_instances().await;
        let total = instances.len();
        let mut expired: Vec<_> = instances
            .into_iter()
            .filter(|instance| now.saturating_sub(instance.renew_timestamp) > threshold)
            .collect();
        // Snapshot order follows map iteration; fix it so a seeded RNG reproduces
        expired.sort_by(|a, b| {
            (&a.app_id, &a.env, &a.hostname).cmp(&(&b.app_id, &b.env, &b.hostname))
        });

        let mut report = EvictionReport {
            total,
            expired: expired.len(),
            cap: eviction_cap(total, self.retention_ratio),
            evicted: 0,
        };

        if report.expired == 0 || report.cap == 0 {
            debug!(total, expired = report.expired, "Nothing to evict");
            return report;
        }

        let victims = select_victims(expired, report.cap, &mut self.rng);
        for victim in victims {
            match registry
                .cancel(&victim.env, &victim.app_id, &victim.hostname, now)
                .await
            {
                Ok(_) => {
                    report.evicted += 1;
                    debug!(
                        app_id = %victim.app_id,
                        env = %victim.env,
                        hostname = %victim.hostname,
                        last_renew = victim.renew_timestamp,
                        "Evicted expired instance"
                    );
                }
                Err(e) => {
                    warn!(hostname = %victim.hostname, error = %e, "Eviction cancel failed");
                }
            }
        }

        info!(
            total = report.total,
            expired = report.expired,
            cap = report.cap,
            evicted = report.evicted,
            "Eviction pass complete"
        );

        report
    }
}

/// Most instances a single pass may evict out of `total`.
///
/// The ratio is clamped to `[0, 1]`; NaN retains everything.
pub fn eviction_cap(total: usize, retention_ratio: f64) -> usize {
    let ratio = if retention_ratio.is_nan() {
        1.0
    } else {
        retention_ratio.clamp(0.0, 1.0)
    };
    let retained = (total as f64 * ratio).floor() as usize;
    total.saturating_sub(retained)
}

/// Pick `count` items uniformly at random (partial Fisher-Yates).
///
/// Returns every candidate when there are no more than `count`.
pub fn select_victims<T, G>(mut candidates: Vec<T>, count: usize, rng: &mut G) -> Vec<T>
where
    G: Rng + ?Sized,
{
    if candidates.len() <= count {
        return candidates;
    }

    for i in 0..count {
        let j = rng.random_range(i..candidates.len());
        candidates.swap(i, j);
    }
    candidates.truncate(count);
    candidates
}

/// Spawn the recurring eviction task.
///
/// The task holds only a weak reference and exits once the registry is gone.
pub(crate) fn spawn(
    registry: Weak<Registry>,
    mut evictor: Evictor,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let Some(registry) = registry.upgrade() else {
                debug!("Registry dropped, eviction loop exiting");
                break;
            };
            evictor.run_once(&*registry).await;
        }
    })
}

//! Coordinator lifecycle: start, background loops, dispose.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{DataLayerError, Result};

use super::{CoordinatorState, DataLayerCoordinator};

impl DataLayerCoordinator {
    /// Start the coordinator.
    ///
    /// Startup flow:
    /// 1. Require at least one registered source
    /// 2. Restore the persisted sync cursor and index from L2
    /// 3. Spawn the background loops (self-check, expiry sweep, recovery probes)
    /// 4. Ready
    ///
    /// A failed start leaves the coordinator in `Created`.
    #[tracing::instrument(skip(self))]
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let startup_start = Instant::now();
        if self.state() != CoordinatorState::Created {
            return Err(DataLayerError::Initialization(format!(
                "cannot start from state {}",
                self.state()
            )));
        }
        info!("Starting data layer...");
        self.set_state(CoordinatorState::Initializing);

        if self.switcher.is_empty() {
            self.set_state(CoordinatorState::Created);
            return Err(DataLayerError::Initialization("no data sources registered".to_string()));
        }

        if !self.sync.restore().await {
            debug!("No persisted sync state; the first incremental sync will run in full");
        }

        let config = &self.config;
        let loops = vec![
            self.spawn_loop("self_check", Duration::from_secs(config.health_check_interval_secs), |c| async move {
                c.run_self_check().await;
            }),
            self.spawn_loop("cache_sweep", Duration::from_secs(config.cache_sweep_interval_secs), |c| async move {
                c.sweep_expired().await;
                c.stats().await;
            }),
            self.spawn_loop(
                "recovery_probe",
                Duration::from_secs(config.recovery_probe_interval_secs),
                |c| async move {
                    let recovered = c.probe_down_sources().await;
                    if recovered > 0 {
                        info!(recovered, "Data sources recovered");
                    }
                },
            ),
        ];
        self.background.lock().extend(loops);

        self.set_state(CoordinatorState::Ready);
        crate::metrics::record_startup_total(startup_start.elapsed());
        info!(
            sources = self.switcher.len(),
            elapsed_ms = startup_start.elapsed().as_millis() as u64,
            "Data layer ready"
        );
        Ok(())
    }

    /// Run `tick` every `period` until dispose. The task holds only a weak
    /// reference, so a coordinator dropped without `dispose` still stops it.
    fn spawn_loop<F, Fut>(self: &Arc<Self>, name: &'static str, period: Duration, tick: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut shutdown = self.shutdown.subscribe();
        let period = period.max(Duration::from_millis(10));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let Some(coordinator) = weak.upgrade() else { break };
                        tick(coordinator).await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!(task = name, "Background loop stopped");
        })
    }

    /// Shut down: stop the loops, wait for in-flight syncs, stop the worker
    /// pool, close every tier and the event bus. Idempotent.
    #[tracing::instrument(skip(self))]
    pub async fn dispose(&self) {
        if matches!(self.state(), CoordinatorState::ShuttingDown | CoordinatorState::Disposed) {
            return;
        }
        let shutdown_start = Instant::now();
        info!("Initiating data layer shutdown...");
        self.set_state(CoordinatorState::ShuttingDown);

        let _ = self.shutdown.send(true);
        let loops: Vec<JoinHandle<()>> = std::mem::take(&mut *self.background.lock());
        for handle in loops {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background loop ended abnormally");
            }
        }

        self.sync.wait_idle().await;
        self.workers.shutdown().await;
        self.tiers.close().await;
        self.events.close();

        self.set_state(CoordinatorState::Disposed);
        info!(elapsed_ms = shutdown_start.elapsed().as_millis() as u64, "Data layer shutdown complete");
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Source registry with health tracking and failover.
//!
//! [`DataSourceSwitcher::execute`] ranks the routable sources (healthy, then
//! unknown, then degraded; ties by lower average response time, then
//! registration order) and tries them one after another. Each source is tried
//! at most once per call. Only when every candidate has failed does the
//! caller see an error.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, info, instrument, warn};

use super::health::{DataSourceDescriptor, HealthThresholds, HealthTransition, SourceHealth};
use super::{DataSource, SourceError};
use crate::config::DataLayerConfig;
use crate::error::{DataLayerError, Result};
use crate::events::{DataLayerEvent, EventBus};
use crate::tier::now_millis;

struct SourceSlot {
    source: Arc<dyn DataSource>,
    descriptor: DataSourceDescriptor,
}

pub struct DataSourceSwitcher {
    slots: RwLock<Vec<SourceSlot>>,
    active: RwLock<Option<String>>,
    thresholds: HealthThresholds,
    default_timeout: Duration,
    max_sources_tried: Option<usize>,
    events: Arc<EventBus>,
}

impl DataSourceSwitcher {
    #[must_use]
    pub fn new(
        thresholds: HealthThresholds,
        default_timeout: Duration,
        max_sources_tried: Option<usize>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            active: RwLock::new(None),
            thresholds,
            default_timeout,
            max_sources_tried,
            events,
        }
    }

    #[must_use]
    pub fn from_config(config: &DataLayerConfig, events: Arc<EventBus>) -> Self {
        Self::new(
            HealthThresholds::from_config(config),
            config.request_timeout(),
            config.max_sources_tried,
            events,
        )
    }

    /// Add a source in `unknown` health. Ids must be unique.
    pub fn register(&self, source: Arc<dyn DataSource>) -> Result<()> {
        let mut slots = self.slots.write();
        if slots.iter().any(|s| s.descriptor.id == source.id()) {
            return Err(DataLayerError::Initialization(format!(
                "data source '{}' registered twice",
                source.id()
            )));
        }
        let descriptor = DataSourceDescriptor::new(source.id(), source.display_name(), source.base_endpoint());
        info!(source = %descriptor.id, endpoint = %descriptor.base_endpoint, "Registered data source");
        crate::metrics::set_source_health(&descriptor.id, descriptor.health.gauge_value());
        slots.push(SourceSlot { source, descriptor });
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    /// Snapshot of every registered source, in registration order.
    #[must_use]
    pub fn descriptors(&self) -> Vec<DataSourceDescriptor> {
        self.slots.read().iter().map(|s| s.descriptor.clone()).collect()
    }

    #[must_use]
    pub fn descriptor(&self, id: &str) -> Option<DataSourceDescriptor> {
        self.slots
            .read()
            .iter()
            .find(|s| s.descriptor.id == id)
            .map(|s| s.descriptor.clone())
    }

    /// Source that served the last successful request.
    #[must_use]
    pub fn active_source(&self) -> Option<String> {
        self.active.read().clone()
    }

    /// Whether the active source (or, before any request, any source) is routable.
    #[must_use]
    pub fn active_is_healthy(&self) -> bool {
        let slots = self.slots.read();
        match self.active.read().as_deref() {
            Some(id) => slots
                .iter()
                .find(|s| s.descriptor.id == id)
                .is_some_and(|s| s.descriptor.health.is_routable() && s.descriptor.health != SourceHealth::Degraded),
            None => slots.iter().any(|s| s.descriptor.health.is_routable()),
        }
    }

    /// Routable sources in preference order.
    #[must_use]
    pub fn ranked_candidates(&self) -> Vec<Arc<dyn DataSource>> {
        let slots = self.slots.read();
        let mut ranked: Vec<(u8, f64, usize, Arc<dyn DataSource>)> = slots
            .iter()
            .enumerate()
            .filter_map(|(order, slot)| {
                let rank = slot.descriptor.health.routing_rank()?;
                let latency = slot.descriptor.average_response_time_ms.unwrap_or(f64::MAX);
                Some((rank, latency, order, slot.source.clone()))
            })
            .collect();
        ranked.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| a.1.total_cmp(&b.1))
                .then_with(|| a.2.cmp(&b.2))
        });
        ranked.into_iter().map(|(_, _, _, source)| source).collect()
    }

    /// Run `op` against the best source, failing over to the next on error
    /// or timeout. `timeout` applies per attempt (default from config).
    ///
    /// On a timeout the in-flight attempt is dropped, which cancels it.
    #[instrument(skip(self, op), fields(source))]
    pub async fn execute<T, F, Fut>(&self, operation: &str, timeout: Option<Duration>, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn DataSource>) -> Fut,
        Fut: Future<Output = std::result::Result<T, SourceError>>,
    {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let candidates = self.ranked_candidates();
        let budget = self.max_sources_tried.unwrap_or(usize::MAX).max(1);

        let mut attempted = Vec::new();
        let mut last_error: Option<SourceError> = None;

        for source in candidates.into_iter().take(budget) {
            let id = source.id().to_string();
            attempted.push(id.clone());
            let start = Instant::now();

            let outcome = match tokio::time::timeout(timeout, op(source)).await {
                Ok(result) => result,
                Err(_) => Err(SourceError::Timeout(timeout)),
            };
            let elapsed = start.elapsed();

            match outcome {
                Ok(value) => {
                    tracing::Span::current().record("source", id.as_str());
                    crate::metrics::record_source_request(&id, operation, "success", elapsed);
                    self.record_success(&id, elapsed);
                    self.set_active(&id);
                    return Ok(value);
                }
                Err(e) => {
                    let status = if matches!(e, SourceError::Timeout(_)) { "timeout" } else { "error" };
                    crate::metrics::record_source_request(&id, operation, status, elapsed);
                    warn!(source = %id, operation, error = %e, "Source attempt failed, failing over");
                    self.record_failure(&id);
                    last_error = Some(e);
                }
            }
        }

        crate::metrics::record_sources_exhausted(operation);
        match last_error {
            Some(SourceError::Timeout(after)) if !attempted.is_empty() => Err(DataLayerError::Timeout {
                source_id: attempted.last().cloned().unwrap_or_default(),
                after_ms: after.as_millis() as u64,
            }),
            Some(e) => Err(DataLayerError::DataSourceExhausted {
                attempted,
                last_error: e.to_string(),
            }),
            None => Err(DataLayerError::DataSourceExhausted {
                attempted,
                last_error: "no routable data source".to_string(),
            }),
        }
    }

    /// Probe every registered source once and fold the results into health.
    #[instrument(skip(self))]
    pub async fn run_health_checks(&self) -> Vec<DataSourceDescriptor> {
        let sources: Vec<Arc<dyn DataSource>> = self.slots.read().iter().map(|s| s.source.clone()).collect();
        self.probe_all(sources).await;
        self.descriptors()
    }

    /// Probe only down/recovering sources. Returns how many became healthy.
    #[instrument(skip(self))]
    pub async fn probe_down_sources(&self) -> usize {
        let sources: Vec<Arc<dyn DataSource>> = self
            .slots
            .read()
            .iter()
            .filter(|s| !s.descriptor.health.is_routable())
            .map(|s| s.source.clone())
            .collect();
        if sources.is_empty() {
            return 0;
        }
        let transitions = self.probe_all(sources).await;
        transitions.iter().filter(|t| t.to == SourceHealth::Healthy).count()
    }

    async fn probe_all(&self, sources: Vec<Arc<dyn DataSource>>) -> Vec<HealthTransition> {
        let timeout = self.default_timeout;
        let probes = sources.into_iter().map(|source| async move {
            let start = Instant::now();
            let ok = matches!(tokio::time::timeout(timeout, source.probe()).await, Ok(Ok(())));
            (source.id().to_string(), ok, start.elapsed())
        });

        let mut transitions = Vec::new();
        for (id, ok, elapsed) in join_all(probes).await {
            debug!(source = %id, ok, ?elapsed, "Probe finished");
            let outcome = if ok { Ok(elapsed) } else { Err(()) };
            if let Some(t) = self.update(&id, |d, th, now| d.record_probe(outcome, now, th)) {
                transitions.push(t);
            }
        }
        transitions
    }

    fn record_success(&self, id: &str, elapsed: Duration) {
        self.update(id, |d, th, now| d.record_success(elapsed, now, th));
    }

    fn record_failure(&self, id: &str) {
        self.update(id, |d, th, now| d.record_failure(now, th));
    }

    /// Apply an observation to one descriptor and publish any health change.
    fn update(
        &self,
        id: &str,
        apply: impl FnOnce(&mut DataSourceDescriptor, &HealthThresholds, i64) -> Option<HealthTransition>,
    ) -> Option<HealthTransition> {
        let transition = {
            let mut slots = self.slots.write();
            let slot = slots.iter_mut().find(|s| s.descriptor.id == id)?;
            apply(&mut slot.descriptor, &self.thresholds, now_millis())
        }?;

        info!(source = %id, from = %transition.from, to = %transition.to, "Source health changed");
        crate::metrics::set_source_health(id, transition.to.gauge_value());
        self.events.publish(DataLayerEvent::SourceHealthChanged {
            source_id: id.to_string(),
            from: transition.from,
            to: transition.to,
        });
        Some(transition)
    }

    fn set_active(&self, id: &str) {
        let previous = {
            let mut active = self.active.write();
            if active.as_deref() == Some(id) {
                return;
            }
            active.replace(id.to_string())
        };
        info!(from = ?previous, to = %id, "Active data source switched");
        crate::metrics::record_source_switch(id);
        self.events.publish(DataLayerEvent::DataSourceSwitched {
            from: previous,
            to: id.to_string(),
        });
    }
}

//! Per-source health state machine.
//!
//! ```text
//!   unknown ──success──▶ healthy ◀──success── degraded
//!      │                    │                    ▲
//!      │                    └──degraded_threshold┘
//!      │                         failures
//!      └──────────── down_threshold failures (from any state) ──▶ down
//!
//!   down ──probe ok──▶ recovering ──recovery_threshold probes ok──▶ healthy
//!     ▲                    │
//!     └────probe failed────┘
//! ```
//!
//! `consecutive_failures` is only reset by reaching `healthy` (or by a
//! successful production request), so a `down` source always carries at
//! least `down_threshold` failures.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::config::DataLayerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceHealth {
    Unknown,
    Healthy,
    Degraded,
    Recovering,
    Down,
}

impl SourceHealth {
    /// Whether `execute` may route production traffic to the source.
    #[must_use]
    pub fn is_routable(self) -> bool {
        matches!(self, Self::Healthy | Self::Unknown | Self::Degraded)
    }

    /// Routing preference, lower is better. `None` = not routable.
    #[must_use]
    pub fn routing_rank(self) -> Option<u8> {
        match self {
            Self::Healthy => Some(0),
            Self::Unknown => Some(1),
            Self::Degraded => Some(2),
            Self::Recovering | Self::Down => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Recovering => "recovering",
            Self::Down => "down",
        }
    }

    pub(crate) fn gauge_value(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Healthy => 1,
            Self::Degraded => 2,
            Self::Recovering => 3,
            Self::Down => 4,
        }
    }
}

impl fmt::Display for SourceHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthThresholds {
    pub degraded: u32,
    pub down: u32,
    pub recovery: u32,
    /// EMA smoothing factor for response times
    pub ema_alpha: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            degraded: 2,
            down: 5,
            recovery: 3,
            ema_alpha: 0.3,
        }
    }
}

impl HealthThresholds {
    #[must_use]
    pub fn from_config(config: &DataLayerConfig) -> Self {
        Self {
            degraded: config.degraded_threshold,
            down: config.down_threshold,
            recovery: config.recovery_threshold,
            ema_alpha: config.response_time_ema_alpha,
        }
    }
}

/// A health change produced by one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthTransition {
    pub from: SourceHealth,
    pub to: SourceHealth,
}

/// Registry entry for one source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataSourceDescriptor {
    pub id: String,
    pub display_name: String,
    pub base_endpoint: String,
    pub health: SourceHealth,
    pub consecutive_failures: u32,
    /// Consecutive successful probes while down/recovering
    pub recovery_probe_successes: u32,
    /// `None` until the first successful call
    pub average_response_time_ms: Option<f64>,
    /// Epoch millis
    pub last_success_at: Option<i64>,
    pub last_failure_at: Option<i64>,
}

impl DataSourceDescriptor {
    #[must_use]
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, base_endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            base_endpoint: base_endpoint.into(),
            health: SourceHealth::Unknown,
            consecutive_failures: 0,
            recovery_probe_successes: 0,
            average_response_time_ms: None,
            last_success_at: None,
            last_failure_at: None,
        }
    }

    fn transition(&mut self, from: SourceHealth) -> Option<HealthTransition> {
        (from != self.health).then_some(HealthTransition { from, to: self.health })
    }

    fn observe_latency(&mut self, elapsed: Duration, alpha: f64) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.average_response_time_ms = Some(match self.average_response_time_ms {
            Some(avg) => alpha * ms + (1.0 - alpha) * avg,
            None => ms,
        });
    }

    /// A production request (or health probe of a routable source) succeeded.
    pub fn record_success(&mut self, elapsed: Duration, now: i64, th: &HealthThresholds) -> Option<HealthTransition> {
        if matches!(self.health, SourceHealth::Down | SourceHealth::Recovering) {
            return self.record_probe(Ok(elapsed), now, th);
        }
        let from = self.health;
        self.observe_latency(elapsed, th.ema_alpha);
        self.last_success_at = Some(now);
        self.consecutive_failures = 0;
        self.health = SourceHealth::Healthy;
        self.transition(from)
    }

    /// A production request failed (timeout, non-2xx, transport error).
    pub fn record_failure(&mut self, now: i64, th: &HealthThresholds) -> Option<HealthTransition> {
        let from = self.health;
        self.last_failure_at = Some(now);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.recovery_probe_successes = 0;

        if self.consecutive_failures >= th.down {
            self.health = SourceHealth::Down;
        } else if self.health == SourceHealth::Recovering {
            self.health = SourceHealth::Down;
        } else if self.consecutive_failures >= th.degraded
            && matches!(self.health, SourceHealth::Healthy | SourceHealth::Unknown)
        {
            self.health = SourceHealth::Degraded;
        }
        self.transition(from)
    }

    /// A health probe completed. Drives the down → recovering → healthy path.
    pub fn record_probe(
        &mut self,
        outcome: Result<Duration, ()>,
        now: i64,
        th: &HealthThresholds,
    ) -> Option<HealthTransition> {
        let from = self.health;
        if !matches!(from, SourceHealth::Down | SourceHealth::Recovering) {
            return match outcome {
                Ok(elapsed) => self.record_success(elapsed, now, th),
                Err(()) => self.record_failure(now, th),
            };
        }

        match outcome {
            Ok(elapsed) => {
                self.observe_latency(elapsed, th.ema_alpha);
                self.last_success_at = Some(now);
                self.recovery_probe_successes = self.recovery_probe_successes.saturating_add(1);
                if self.recovery_probe_successes >= th.recovery {
                    self.health = SourceHealth::Healthy;
                    self.consecutive_failures = 0;
                    self.recovery_probe_successes = 0;
                } else {
                    self.health = SourceHealth::Recovering;
                }
            }
            Err(()) => {
                self.last_failure_at = Some(now);
                self.consecutive_failures = self.consecutive_failures.saturating_add(1).max(th.down);
                self.recovery_probe_successes = 0;
                self.health = SourceHealth::Down;
            }
        }
        self.transition(from)
    }
}

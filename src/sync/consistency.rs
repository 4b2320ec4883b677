//! Consistency reports: local fingerprints vs. the authoritative source.

use serde::Serialize;

use crate::error::DataLayerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Local copy is stale; re-fetch the affected keys
    RefreshCache,
    /// Too much has drifted; run a full sync
    Resync,
    /// Local tiers disagree with each other and with the source
    RepairData,
    /// Source no longer knows the key; drop the local copy
    Discard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionPriority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecommendedAction {
    pub action_type: ActionType,
    pub affected_keys: Vec<String>,
    pub priority: ActionPriority,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsistencyReport {
    /// Epoch millis
    pub checked_at: i64,
    pub total_checked: usize,
    pub inconsistent_keys: Vec<String>,
    pub recommended_actions: Vec<RecommendedAction>,
}

impl ConsistencyReport {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.inconsistent_keys.is_empty()
    }

    #[must_use]
    pub fn actions_of(&self, action_type: ActionType) -> Option<&RecommendedAction> {
        self.recommended_actions.iter().find(|a| a.action_type == action_type)
    }

    /// Divergence automatic reconciliation cannot resolve, as an error.
    #[must_use]
    pub fn conflict(&self) -> Option<DataLayerError> {
        self.actions_of(ActionType::RepairData).map(|a| DataLayerError::SyncConflict {
            keys: a.affected_keys.clone(),
        })
    }
}

/// What one sampled key looks like locally and upstream.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct KeyObservation {
    pub code: String,
    pub remote: Option<String>,
    pub indexed: Option<String>,
    pub l2: Option<String>,
    pub l3: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Consistent,
    Refresh,
    Repair,
    Discard,
}

impl KeyObservation {
    pub(crate) fn verdict(&self) -> Verdict {
        let Some(remote) = self.remote.as_deref() else {
            return Verdict::Discard;
        };
        let stale = |local: &Option<String>| local.as_deref().is_some_and(|l| l != remote);

        if let (Some(l2), Some(l3)) = (self.l2.as_deref(), self.l3.as_deref()) {
            if l2 != l3 && l2 != remote && l3 != remote {
                return Verdict::Repair;
            }
        }
        let lost = self.indexed.is_some() && self.l2.is_none() && self.l3.is_none();
        if lost || stale(&self.l2) || stale(&self.l3) || stale(&self.indexed) {
            Verdict::Refresh
        } else {
            Verdict::Consistent
        }
    }
}

/// Build the report from per-key observations.
pub(crate) fn classify(observations: &[KeyObservation], resync_ratio: f64, checked_at: i64) -> ConsistencyReport {
    let mut refresh = Vec::new();
    let mut repair = Vec::new();
    let mut discard = Vec::new();

    for obs in observations {
        match obs.verdict() {
            Verdict::Consistent => {}
            Verdict::Refresh => refresh.push(obs.code.clone()),
            Verdict::Repair => repair.push(obs.code.clone()),
            Verdict::Discard => discard.push(obs.code.clone()),
        }
    }

    let mut inconsistent: Vec<String> = refresh.iter().chain(&repair).chain(&discard).cloned().collect();
    inconsistent.sort();

    let mut actions = Vec::new();
    let total = observations.len();
    if total > 0 && inconsistent.len() as f64 / total as f64 > resync_ratio {
        actions.push(RecommendedAction {
            action_type: ActionType::Resync,
            affected_keys: inconsistent.clone(),
            priority: ActionPriority::High,
        });
    }
    for (action_type, keys, priority) in [
        (ActionType::RepairData, repair, ActionPriority::High),
        (ActionType::RefreshCache, refresh, ActionPriority::Medium),
        (ActionType::Discard, discard, ActionPriority::Low),
    ] {
        if !keys.is_empty() {
            actions.push(RecommendedAction { action_type, affected_keys: keys, priority });
        }
    }

    ConsistencyReport {
        checked_at,
        total_checked: total,
        inconsistent_keys: inconsistent,
        recommended_actions: actions,
    }
}

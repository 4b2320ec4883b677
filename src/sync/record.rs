use std::collections::VecDeque;
use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    Full,
    Incremental,
    Selective,
}

impl SyncType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
            Self::Selective => "selective",
        }
    }
}

impl fmt::Display for SyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one sync run. Immutable once finished.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncOperationRecord {
    pub sync_id: String,
    pub sync_type: SyncType,
    /// Epoch millis
    pub started_at: i64,
    pub finished_at: i64,
    pub items_added: u64,
    pub items_updated: u64,
    pub items_deleted: u64,
    pub success: bool,
    pub error_detail: Option<String>,
    /// Cursor for the next incremental sync
    pub source_version_token: Option<String>,
}

impl SyncOperationRecord {
    #[must_use]
    pub fn changed(&self) -> bool {
        self.items_added + self.items_updated + self.items_deleted > 0
    }

    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        self.finished_at - self.started_at
    }
}

/// Fixed-capacity ring of finished records, oldest first.
#[derive(Debug)]
pub(crate) struct SyncHistory {
    records: VecDeque<SyncOperationRecord>,
    capacity: usize,
}

impl SyncHistory {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn push(&mut self, record: SyncOperationRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub(crate) fn to_vec(&self) -> Vec<SyncOperationRecord> {
        self.records.iter().cloned().collect()
    }

    pub(crate) fn last(&self) -> Option<&SyncOperationRecord> {
        self.records.back()
    }

    pub(crate) fn failures(&self) -> usize {
        self.records.iter().filter(|r| !r.success).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(n: u64, success: bool) -> SyncOperationRecord {
        SyncOperationRecord {
            sync_id: n.to_string(),
            sync_type: SyncType::Full,
            started_at: 0,
            finished_at: 10,
            items_added: n,
            items_updated: 0,
            items_deleted: 0,
            success,
            error_detail: None,
            source_version_token: None,
        }
    }

    #[test]
    fn test_ring_drops_oldest() {
        let mut history = SyncHistory::new(2);
        history.push(record(1, true));
        history.push(record(2, false));
        history.push(record(3, true));

        let ids: Vec<String> = history.to_vec().into_iter().map(|r| r.sync_id).collect();
        assert_eq!(ids, vec!["2".to_string(), "3".to_string()]);
        assert_eq!(history.failures(), 1);
        assert_eq!(history.last().map(|r| r.items_added), Some(3));
    }

    #[test]
    fn test_record_helpers() {
        assert!(record(1, true).changed());
        assert!(!record(0, true).changed());
        assert_eq!(record(0, true).duration_ms(), 10);
        assert_eq!(SyncType::Incremental.to_string(), "incremental");
    }
}

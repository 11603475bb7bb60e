//! Process-scoped cache of finished job records.

use std::sync::Arc;

use dashmap::DashMap;
use strand_types::job::JobRecord;
use uuid::Uuid;

/// Terminal job records keyed by job ID.
///
/// Only terminal records are cached since they never change again. The
/// cache is explicit state owned by the `JobService`; `clear()` drops it.
#[derive(Debug, Clone, Default)]
pub struct JobCache {
    records: Arc<DashMap<Uuid, JobRecord>>,
}

impl JobCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &Uuid) -> Option<JobRecord> {
        self.records.get(id).map(|r| r.clone())
    }

    /// Cache `record` if it is terminal. Returns whether it was stored.
    pub fn insert(&self, record: &JobRecord) -> bool {
        if !record.status.is_terminal() {
            return false;
        }
        self.records.insert(record.id, record.clone());
        true
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strand_types::job::JobStatus;

    #[test]
    fn only_terminal_records_are_cached() {
        let cache = JobCache::new();
        let mut record = JobRecord::queued(Uuid::now_v7(), "echo", json!({}), json!({}), None);
        assert!(!cache.insert(&record));
        assert!(cache.is_empty());

        record.status = JobStatus::Success;
        assert!(cache.insert(&record));
        assert_eq!(cache.get(&record.id).unwrap().status, JobStatus::Success);

        cache.clear();
        assert!(cache.get(&record.id).is_none());
    }
}

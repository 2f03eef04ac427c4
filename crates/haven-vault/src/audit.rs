use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use haven_core::{AuditRecord, AuditSink, HavenResult, ResourceId, TimeRange};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::error;

use crate::store::InMemoryAuditStore;

/// Persistence behind an `AuditTrail`.
pub trait AuditStore: Send + Sync {
    fn append(&self, entry: &AuditEntry) -> HavenResult<()>;
    fn load(&self) -> HavenResult<Vec<AuditEntry>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Position in the whole trail, starting at 1.
    pub sequence: u64,
    /// Position among entries for the same resource, starting at 1.
    pub resource_sequence: u64,
    pub record: AuditRecord,
    pub previous_hash: Option<String>,
    pub hash: String,
}

struct TrailState {
    /// Entries appended so far, including resumed ones.
    sequence: u64,
    head: Option<String>,
    per_resource: HashMap<ResourceId, u64>,
}

/// Hash-chained append-only audit log.
///
/// Every entry includes the hash of the previous entry, so editing or
/// removing any entry breaks `verify_chain`. Only the chain head and the
/// counters live in memory; entries are read back from the store. Appends
/// never fail: if the store rejects an entry it is copied to the fallback
/// buffer, logged at error level and counted in `lost_persistence_count`.
pub struct AuditTrail {
    state: Mutex<TrailState>,
    store: Box<dyn AuditStore>,
    fallback: Mutex<Vec<AuditEntry>>,
    lost: AtomicU64,
}

impl AuditTrail {
    /// Backed by an `InMemoryAuditStore`.
    pub fn new() -> Self {
        Self::resume(Box::new(InMemoryAuditStore::new()), &[])
    }

    /// Resume from whatever the store already holds and persist new entries
    /// to it.
    pub fn with_store(store: Box<dyn AuditStore>) -> HavenResult<Self> {
        let existing = store.load()?;
        Ok(Self::resume(store, &existing))
    }

    fn resume(store: Box<dyn AuditStore>, existing: &[AuditEntry]) -> Self {
        let mut per_resource = HashMap::new();
        for entry in existing {
            per_resource.insert(entry.record.resource_id.clone(), entry.resource_sequence);
        }
        Self {
            state: Mutex::new(TrailState {
                sequence: existing.last().map_or(0, |e| e.sequence),
                head: existing.last().map(|e| e.hash.clone()),
                per_resource,
            }),
            store,
            fallback: Mutex::new(Vec::new()),
            lost: AtomicU64::new(0),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, TrailState> {
        // A panic elsewhere must not stop auditing.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_fallback(&self) -> MutexGuard<'_, Vec<AuditEntry>> {
        self.fallback.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn compute_hash(
        previous: Option<&str>,
        sequence: u64,
        resource_sequence: u64,
        record: &AuditRecord,
    ) -> String {
        let mut hasher = Sha256::new();
        if let Some(prev) = previous {
            hasher.update(prev.as_bytes());
        }
        hasher.update(sequence.to_le_bytes());
        hasher.update(resource_sequence.to_le_bytes());
        let record_bytes = serde_json::to_vec(record).unwrap_or_default();
        hasher.update(&record_bytes);
        hex::encode(hasher.finalize())
    }

    /// Append a record and return the stored entry.
    pub fn append(&self, record: AuditRecord) -> AuditEntry {
        let entry = {
            let mut state = self.lock_state();
            state.sequence += 1;
            let sequence = state.sequence;
            let resource_sequence = {
                let counter = state
                    .per_resource
                    .entry(record.resource_id.clone())
                    .or_insert(0);
                *counter += 1;
                *counter
            };
            let previous_hash = state.head.take();
            let hash = Self::compute_hash(
                previous_hash.as_deref(),
                sequence,
                resource_sequence,
                &record,
            );
            state.head = Some(hash.clone());
            AuditEntry {
                sequence,
                resource_sequence,
                record,
                previous_hash,
                hash,
            }
        };

        // Stores may receive entries out of sequence order; readers sort.
        if let Err(e) = self.store.append(&entry) {
            self.lost.fetch_add(1, Ordering::Relaxed);
            error!(
                sequence = entry.sequence,
                resource = %entry.record.resource_id,
                kind = entry.record.kind.label(),
                error = %e,
                "audit persistence failed; entry routed to fallback"
            );
            self.lock_fallback().push(entry.clone());
        }
        entry
    }

    /// Stored entries plus fallback entries, in sequence order.
    pub fn entries(&self) -> Vec<AuditEntry> {
        let mut entries = match self.store.load() {
            Ok(entries) => entries,
            Err(e) => {
                error!(error = %e, "audit store unreadable; showing fallback entries only");
                Vec::new()
            }
        };
        entries.extend(self.lock_fallback().iter().cloned());
        entries.sort_by_key(|e| e.sequence);
        entries.dedup_by_key(|e| e.sequence);
        entries
    }

    /// Entries for one resource within `range`, in sequence order.
    pub fn entries_for(&self, resource_id: &ResourceId, range: TimeRange) -> Vec<AuditEntry> {
        self.entries()
            .into_iter()
            .filter(|e| &e.record.resource_id == resource_id && range.contains(&e.record.occurred_at))
            .collect()
    }

    pub fn verify_chain(&self) -> bool {
        verify_entries(&self.entries())
    }

    pub fn head(&self) -> Option<String> {
        self.lock_state().head.clone()
    }

    pub fn len(&self) -> usize {
        self.lock_state().sequence as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries the store failed to persist.
    pub fn lost_persistence_count(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    /// Entries that only exist in memory because persistence failed.
    pub fn fallback_entries(&self) -> Vec<AuditEntry> {
        self.lock_fallback().clone()
    }
}

impl Default for AuditTrail {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditSink for AuditTrail {
    fn record(&self, record: AuditRecord) {
        self.append(record);
    }
}

/// Recompute every hash and link. Works on entries read back from a store.
pub fn verify_entries(entries: &[AuditEntry]) -> bool {
    let mut previous: Option<&AuditEntry> = None;
    for (i, entry) in entries.iter().enumerate() {
        if entry.sequence != i as u64 + 1 {
            return false;
        }
        let expected_prev = previous.map(|p| p.hash.as_str());
        if entry.previous_hash.as_deref() != expected_prev {
            return false;
        }
        let expected = AuditTrail::compute_hash(
            expected_prev,
            entry.sequence,
            entry.resource_sequence,
            &entry.record,
        );
        if expected != entry.hash {
            return false;
        }
        previous = Some(entry);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use haven_core::{ActorId, AuditEventKind, ExportJobState, HavenError, Timestamp};
    use std::sync::{mpsc, Arc};

    struct FailingStore;

    impl AuditStore for FailingStore {
        fn append(&self, _entry: &AuditEntry) -> HavenResult<()> {
            Err(HavenError::AuditPersistence("disk full".into()))
        }
        fn load(&self) -> HavenResult<Vec<AuditEntry>> {
            Ok(Vec::new())
        }
    }

    fn make_record(resource: &str, to: ExportJobState) -> AuditRecord {
        AuditRecord::new(
            ResourceId::new(resource),
            Some(ActorId::new("alice")),
            AuditEventKind::JobStateChanged {
                from: None,
                to,
                detail: String::new(),
            },
        )
    }

    #[test]
    fn test_empty_trail_is_valid() {
        let trail = AuditTrail::new();
        assert!(trail.verify_chain());
        assert!(trail.is_empty());
        assert_eq!(trail.head(), None);
    }

    #[test]
    fn test_append_chains_hashes() {
        let trail = AuditTrail::new();
        let a = trail.append(make_record("job-1", ExportJobState::Queued));
        let b = trail.append(make_record("job-1", ExportJobState::Materializing));
        assert_eq!(a.previous_hash, None);
        assert_eq!(b.previous_hash.as_deref(), Some(a.hash.as_str()));
        assert_eq!(trail.head(), Some(b.hash));
        assert!(trail.verify_chain());
    }

    #[test]
    fn test_per_resource_sequences() {
        let trail = AuditTrail::new();
        trail.append(make_record("job-1", ExportJobState::Queued));
        trail.append(make_record("job-2", ExportJobState::Queued));
        let third = trail.append(make_record("job-1", ExportJobState::Materializing));
        assert_eq!(third.sequence, 3);
        assert_eq!(third.resource_sequence, 2);

        let for_job = trail.entries_for(&ResourceId::new("job-1"), TimeRange::all());
        assert_eq!(for_job.len(), 2);
        assert!(for_job[0].sequence < for_job[1].sequence);
    }

    #[test]
    fn test_entries_for_time_range() {
        let trail = AuditTrail::new();
        let mut early = make_record("job-1", ExportJobState::Queued);
        early.occurred_at = Timestamp::from_seconds(100);
        let mut late = make_record("job-1", ExportJobState::Materializing);
        late.occurred_at = Timestamp::from_seconds(200);
        trail.append(early);
        trail.append(late);
        let window = TimeRange::between(Timestamp::from_seconds(150), Timestamp::from_seconds(250));
        let found = trail.entries_for(&ResourceId::new("job-1"), window);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].record.occurred_at, Timestamp::from_seconds(200));
    }

    #[test]
    fn test_edit_breaks_chain() {
        let trail = AuditTrail::new();
        for _ in 0..3 {
            trail.append(make_record("job-1", ExportJobState::Queued));
        }
        let mut entries = trail.entries();
        assert!(verify_entries(&entries));
        entries[1].record.actor_id = Some(ActorId::new("mallory"));
        assert!(!verify_entries(&entries));

        let mut entries = trail.entries();
        entries.remove(1);
        assert!(!verify_entries(&entries));
    }

    #[test]
    fn test_store_failure_is_swallowed() {
        let trail = AuditTrail::with_store(Box::new(FailingStore)).unwrap();
        trail.record(make_record("job-1", ExportJobState::Queued));
        trail.record(make_record("job-1", ExportJobState::Failed));
        assert_eq!(trail.len(), 2);
        assert_eq!(trail.lost_persistence_count(), 2);
        assert_eq!(trail.fallback_entries().len(), 2);
        assert!(trail.verify_chain());
    }

    #[test]
    fn test_resume_from_store() {
        let store = Arc::new(InMemoryAuditStore::new());
        {
            let trail = AuditTrail::with_store(Box::new(store.clone())).unwrap();
            trail.append(make_record("job-1", ExportJobState::Queued));
        }
        let trail = AuditTrail::with_store(Box::new(store.clone())).unwrap();
        let next = trail.append(make_record("job-1", ExportJobState::Materializing));
        assert_eq!(next.sequence, 2);
        assert_eq!(next.resource_sequence, 2);
        assert!(trail.verify_chain());
        assert_eq!(store.load().unwrap().len(), 2);
    }

    #[test]
    fn test_concurrent_appends_keep_per_resource_order() {
        let trail = Arc::new(AuditTrail::new());
        let handles: Vec<_> = (0..4)
            .map(|j| {
                let trail = trail.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        trail.append(make_record(&format!("job-{j}"), ExportJobState::Queued));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(trail.len(), 100);
        assert!(trail.verify_chain());
        for j in 0..4 {
            let seqs: Vec<u64> = trail
                .entries_for(&ResourceId::new(format!("job-{j}")), TimeRange::all())
                .iter()
                .map(|e| e.resource_sequence)
                .collect();
            assert_eq!(seqs, (1..=25).collect::<Vec<u64>>());
        }
    }

    struct GatedStore {
        inner: InMemoryAuditStore,
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl AuditStore for GatedStore {
        fn append(&self, entry: &AuditEntry) -> HavenResult<()> {
            self.entered.lock().unwrap().send(()).unwrap();
            self.release.lock().unwrap().recv().unwrap();
            self.inner.append(entry)
        }
        fn load(&self) -> HavenResult<Vec<AuditEntry>> {
            self.inner.load()
        }
    }

    #[test]
    fn test_state_not_held_during_store_write() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let trail = Arc::new(
            AuditTrail::with_store(Box::new(GatedStore {
                inner: InMemoryAuditStore::new(),
                entered: Mutex::new(entered_tx),
                release: Mutex::new(release_rx),
            }))
            .unwrap(),
        );

        let writer = {
            let trail = trail.clone();
            std::thread::spawn(move || trail.append(make_record("job-1", ExportJobState::Queued)))
        };
        entered_rx.recv().unwrap();

        assert!(trail.state.try_lock().is_ok());
        assert_eq!(trail.len(), 1);
        assert!(trail.head().is_some());

        release_tx.send(()).unwrap();
        let entry = writer.join().unwrap();
        assert_eq!(trail.entries(), vec![entry]);
        assert!(trail.verify_chain());
    }

    #[test]
    fn test_entries_come_from_store() {
        let store = Arc::new(InMemoryAuditStore::new());
        let trail = AuditTrail::with_store(Box::new(store.clone())).unwrap();
        trail.append(make_record("job-1", ExportJobState::Queued));
        trail.append(make_record("job-1", ExportJobState::Materializing));
        assert_eq!(trail.entries(), store.load().unwrap());
        assert_eq!(trail.fallback_entries().len(), 0);
    }
}

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use haven_core::{ExportJobId, HavenError};

use crate::error::{ExportError, ExportResult};
use crate::event::ExportJobEvent;

/// Append-only, strictly ordered event log keyed by job id.
///
/// `append` succeeds only when the log currently holds `expected_version`
/// events, so two writers racing on one job cannot both win.
pub trait EventStore: Send + Sync {
    /// Returns the new version.
    fn append(
        &self,
        job_id: ExportJobId,
        expected_version: u64,
        event: &ExportJobEvent,
    ) -> ExportResult<u64>;

    fn load(&self, job_id: ExportJobId) -> ExportResult<Vec<ExportJobEvent>>;

    fn job_ids(&self) -> ExportResult<Vec<ExportJobId>>;
}

fn check_event(job_id: ExportJobId, event: &ExportJobEvent) -> ExportResult<()> {
    if event.job_id() != job_id {
        return Err(ExportError::InvalidEventLog(format!(
            "event for job {} appended to log of job {}",
            event.job_id(),
            job_id
        )));
    }
    Ok(())
}

#[derive(Default)]
pub struct InMemoryEventStore {
    logs: Mutex<HashMap<ExportJobId, Vec<ExportJobEvent>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventStore for InMemoryEventStore {
    fn append(
        &self,
        job_id: ExportJobId,
        expected_version: u64,
        event: &ExportJobEvent,
    ) -> ExportResult<u64> {
        check_event(job_id, event)?;
        let mut logs = self
            .logs
            .lock()
            .map_err(|_| HavenError::Storage("event store lock poisoned".into()))?;
        let log = logs.entry(job_id).or_default();
        let actual = log.len() as u64;
        if actual != expected_version {
            return Err(ExportError::ConcurrencyConflict {
                job_id,
                expected: expected_version,
                actual,
            });
        }
        log.push(event.clone());
        Ok(actual + 1)
    }

    fn load(&self, job_id: ExportJobId) -> ExportResult<Vec<ExportJobEvent>> {
        let logs = self
            .logs
            .lock()
            .map_err(|_| HavenError::Storage("event store lock poisoned".into()))?;
        logs.get(&job_id)
            .cloned()
            .ok_or(ExportError::NotFound(job_id))
    }

    fn job_ids(&self) -> ExportResult<Vec<ExportJobId>> {
        let logs = self
            .logs
            .lock()
            .map_err(|_| HavenError::Storage("event store lock poisoned".into()))?;
        let mut ids: Vec<ExportJobId> = logs.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}

/// One JSON-lines file per job under a directory.
pub struct JsonlEventStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlEventStore {
    pub fn new(dir: impl Into<PathBuf>) -> ExportResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            HavenError::Storage(format!("create event dir {}: {}", dir.display(), e))
        })?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, job_id: ExportJobId) -> PathBuf {
        self.dir.join(format!("{job_id}.events.jsonl"))
    }

    fn read(&self, job_id: ExportJobId) -> ExportResult<Option<Vec<ExportJobEvent>>> {
        let file = match fs::File::open(self.path_for(job_id)) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(HavenError::Storage(format!("open event log: {}", e)).into()),
        };
        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| HavenError::Storage(format!("read event log: {}", e)))?;
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(&line).map_err(HavenError::from)?);
        }
        Ok(Some(events))
    }
}

impl EventStore for JsonlEventStore {
    fn append(
        &self,
        job_id: ExportJobId,
        expected_version: u64,
        event: &ExportJobEvent,
    ) -> ExportResult<u64> {
        check_event(job_id, event)?;
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| HavenError::Storage("event store lock poisoned".into()))?;
        let actual = self.read(job_id)?.map_or(0, |e| e.len() as u64);
        if actual != expected_version {
            return Err(ExportError::ConcurrencyConflict {
                job_id,
                expected: expected_version,
                actual,
            });
        }
        let mut line = serde_json::to_vec(event).map_err(HavenError::from)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(job_id))
            .map_err(|e| HavenError::Storage(format!("open event log: {}", e)))?;
        file.write_all(&line)
            .and_then(|_| file.sync_data())
            .map_err(|e| HavenError::Storage(format!("write event log: {}", e)))?;
        Ok(actual + 1)
    }

    fn load(&self, job_id: ExportJobId) -> ExportResult<Vec<ExportJobEvent>> {
        self.read(job_id)?.ok_or(ExportError::NotFound(job_id))
    }

    fn job_ids(&self) -> ExportResult<Vec<ExportJobId>> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| HavenError::Storage(format!("list event dir: {}", e)))?;
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| HavenError::Storage(format!("list event dir: {}", e)))?;
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".events.jsonl")) else {
                continue;
            };
            if let Some(id) = ExportJobId::parse(stem) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ExportFilters, ExportJob, ExportType, ReportingPeriod};
    use chrono::NaiveDate;
    use haven_core::ActorId;

    fn make_job() -> (ExportJob, ExportJobEvent) {
        let period = ReportingPeriod::new(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 6, 30).unwrap(),
        )
        .unwrap();
        ExportJob::queue(
            ExportType::CocApr,
            period,
            ExportFilters::default(),
            ActorId::new("alice"),
            "APR",
        )
        .unwrap()
    }

    fn exercise(store: &dyn EventStore) {
        let (mut job, queued) = make_job();
        assert_eq!(store.append(job.id(), 0, &queued).unwrap(), 1);
        let started = job.start_materialization().unwrap();
        assert_eq!(store.append(job.id(), 1, &started).unwrap(), 2);

        assert!(matches!(
            store.append(job.id(), 1, &started),
            Err(ExportError::ConcurrencyConflict {
                expected: 1,
                actual: 2,
                ..
            })
        ));

        let events = store.load(job.id()).unwrap();
        assert_eq!(ExportJob::reconstruct(job.id(), &events).unwrap(), job);
        assert_eq!(store.job_ids().unwrap(), vec![job.id()]);

        let (other, other_queued) = make_job();
        assert!(matches!(
            store.append(job.id(), 2, &other_queued),
            Err(ExportError::InvalidEventLog(_))
        ));
        assert!(matches!(
            store.load(other.id()),
            Err(ExportError::NotFound(_))
        ));
    }

    #[test]
    fn test_in_memory_store() {
        exercise(&InMemoryEventStore::new());
    }

    #[test]
    fn test_jsonl_store() {
        let dir = std::env::temp_dir().join(format!("haven-events-{}", uuid::Uuid::new_v4()));
        exercise(&JsonlEventStore::new(&dir).unwrap());
        let _ = fs::remove_dir_all(&dir);
    }
}

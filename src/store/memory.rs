/// In-memory store backend
///
/// Implements all three store traits over mutex-guarded maps. Used by the
/// hermetic test suite and by `database_url = "memory"` dry runs. Lease
/// atomicity comes for free from the store mutex: the select-and-mark runs
/// under one lock acquisition.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::errors::FacegateError;
use crate::store::{
    AnalyticsRow, BlobStore, CatalogStore, EmbeddingRecord, Event, EventKind, Job, JobStatus,
    PersonStateRecord, PresenceStatus, PresenceStore, Subject, SubjectStatus,
};

#[derive(Default)]
pub struct MemoryStore {
    /// (tenant_id, subject_id) -> Subject
    subjects: Mutex<HashMap<(String, String), Subject>>,
    jobs: Mutex<HashMap<String, Job>>,
    /// (subject_id, campus_id) -> PersonStateRecord
    person_states: Mutex<HashMap<(String, String), PersonStateRecord>>,
    events: Mutex<Vec<Event>>,
    /// (campus_id, date) -> AnalyticsRow
    analytics: Mutex<HashMap<(String, NaiveDate), AnalyticsRow>>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    /// Test hook: when set, presence writes fail with a Transient error so the
    /// engine's re-queue-on-failed-flush path can be exercised.
    fail_presence_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent presence writes fail (or succeed again) with a
    /// Transient error. Test hook only.
    pub fn set_fail_presence_writes(&self, fail: bool) {
        self.fail_presence_writes.store(fail, Ordering::SeqCst);
    }

    fn check_presence_writable(&self) -> Result<(), FacegateError> {
        if self.fail_presence_writes.load(Ordering::SeqCst) {
            return Err(FacegateError::Transient(
                "injected presence write failure".to_string(),
            ));
        }
        Ok(())
    }

    fn lock_poisoned() -> FacegateError {
        FacegateError::Transient("store mutex poisoned".to_string())
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn upsert_subject(&self, subject: &Subject) -> Result<(), FacegateError> {
        let mut subjects = self.subjects.lock().map_err(|_| Self::lock_poisoned())?;
        subjects.insert(
            (subject.tenant_id.clone(), subject.subject_id.clone()),
            subject.clone(),
        );
        Ok(())
    }

    async fn get_subject(
        &self,
        tenant_id: &str,
        subject_id: &str,
    ) -> Result<Subject, FacegateError> {
        let subjects = self.subjects.lock().map_err(|_| Self::lock_poisoned())?;
        subjects
            .get(&(tenant_id.to_string(), subject_id.to_string()))
            .cloned()
            .ok_or_else(|| FacegateError::NotFound(format!("subject {}", subject_id)))
    }

    async fn list_active_subjects(
        &self,
        tenant_id: &str,
        model: &str,
        updated_since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Subject>, FacegateError> {
        let subjects = self.subjects.lock().map_err(|_| Self::lock_poisoned())?;
        Ok(subjects
            .values()
            .filter(|s| s.tenant_id == tenant_id && s.is_active())
            .filter(|s| {
                s.embedding_record(model)
                    .map(|r| r.status == JobStatus::Done)
                    .unwrap_or(false)
            })
            .filter(|s| updated_since.map(|ts| s.last_updated >= ts).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn list_ineligible_subject_ids(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<String>, FacegateError> {
        let subjects = self.subjects.lock().map_err(|_| Self::lock_poisoned())?;
        Ok(subjects
            .values()
            .filter(|s| s.tenant_id == tenant_id && !s.is_active())
            .map(|s| s.subject_id.clone())
            .collect())
    }

    async fn list_tenant_ids(&self) -> Result<Vec<String>, FacegateError> {
        let subjects = self.subjects.lock().map_err(|_| Self::lock_poisoned())?;
        let mut ids: Vec<String> = subjects.values().map(|s| s.tenant_id.clone()).collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn list_done_embedding_handles(
        &self,
        tenant_id: &str,
        model: &str,
    ) -> Result<Vec<(String, String)>, FacegateError> {
        let subjects = self.subjects.lock().map_err(|_| Self::lock_poisoned())?;
        let mut out = Vec::new();
        for s in subjects.values().filter(|s| s.tenant_id == tenant_id) {
            if let Some(record) = s.embedding_record(model) {
                if record.status == JobStatus::Done {
                    if let Some(handle) = &record.handle {
                        out.push((s.subject_id.clone(), handle.clone()));
                    }
                }
            }
        }
        out.sort();
        Ok(out)
    }

    async fn set_embedding_record(
        &self,
        tenant_id: &str,
        subject_id: &str,
        model: &str,
        record: EmbeddingRecord,
    ) -> Result<(), FacegateError> {
        let mut subjects = self.subjects.lock().map_err(|_| Self::lock_poisoned())?;
        let subject = subjects
            .get_mut(&(tenant_id.to_string(), subject_id.to_string()))
            .ok_or_else(|| FacegateError::NotFound(format!("subject {}", subject_id)))?;
        subject.embeddings.insert(model.to_string(), record);
        subject.last_updated = Utc::now();
        Ok(())
    }

    async fn set_subject_status(
        &self,
        tenant_id: &str,
        subject_id: &str,
        status: SubjectStatus,
    ) -> Result<(), FacegateError> {
        let mut subjects = self.subjects.lock().map_err(|_| Self::lock_poisoned())?;
        let subject = subjects
            .get_mut(&(tenant_id.to_string(), subject_id.to_string()))
            .ok_or_else(|| FacegateError::NotFound(format!("subject {}", subject_id)))?;
        subject.status = status;
        subject.last_updated = Utc::now();
        Ok(())
    }

    async fn insert_job(&self, job: &Job) -> Result<(), FacegateError> {
        let mut jobs = self.jobs.lock().map_err(|_| Self::lock_poisoned())?;
        if jobs.contains_key(&job.job_id) {
            return Err(FacegateError::Conflict(format!(
                "job {} already exists",
                job.job_id
            )));
        }
        jobs.insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    async fn latest_job(
        &self,
        tenant_id: &str,
        subject_id: &str,
        model: &str,
    ) -> Result<Option<Job>, FacegateError> {
        let jobs = self.jobs.lock().map_err(|_| Self::lock_poisoned())?;
        Ok(jobs
            .values()
            .filter(|j| {
                j.tenant_id == tenant_id && j.subject_id == subject_id && j.model == model
            })
            .max_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.job_id.cmp(&b.job_id))
            })
            .cloned())
    }

    async fn get_job(&self, job_id: &str) -> Result<Job, FacegateError> {
        let jobs = self.jobs.lock().map_err(|_| Self::lock_poisoned())?;
        jobs.get(job_id)
            .cloned()
            .ok_or_else(|| FacegateError::NotFound(format!("job {}", job_id)))
    }

    async fn lease_jobs(
        &self,
        worker_id: &str,
        model: &str,
        limit: usize,
    ) -> Result<Vec<Job>, FacegateError> {
        let mut jobs = self.jobs.lock().map_err(|_| Self::lock_poisoned())?;
        // FIFO by created_at, tie-break by job_id
        let mut candidates: Vec<(DateTime<Utc>, String)> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued && j.model == model)
            .map(|j| (j.created_at, j.job_id.clone()))
            .collect();
        candidates.sort();
        candidates.truncate(limit);

        let now = Utc::now();
        let mut leased = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            if let Some(job) = jobs.get_mut(&id) {
                job.status = JobStatus::Started;
                job.started_at = Some(now);
                job.heartbeat = Some(now);
                job.worker_id = Some(worker_id.to_string());
                leased.push(job.clone());
            }
        }
        Ok(leased)
    }

    async fn heartbeat_job(&self, job_id: &str) -> Result<(), FacegateError> {
        let mut jobs = self.jobs.lock().map_err(|_| Self::lock_poisoned())?;
        if let Some(job) = jobs.get_mut(job_id) {
            if job.status == JobStatus::Started {
                job.heartbeat = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn complete_job(
        &self,
        job_id: &str,
        terminal: JobStatus,
        error: Option<String>,
    ) -> Result<(), FacegateError> {
        if !terminal.is_terminal() {
            return Err(FacegateError::validation(
                "terminal",
                "complete_job requires a terminal status",
            ));
        }
        let mut jobs = self.jobs.lock().map_err(|_| Self::lock_poisoned())?;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| FacegateError::NotFound(format!("job {}", job_id)))?;
        if job.status != JobStatus::Started {
            return Err(FacegateError::Conflict(format!(
                "job {} is {} — only started jobs can complete",
                job_id, job.status
            )));
        }
        job.status = terminal;
        job.finished_at = Some(Utc::now());
        job.error = error;
        Ok(())
    }

    async fn requeue_job(
        &self,
        job_id: &str,
        error: Option<String>,
    ) -> Result<(), FacegateError> {
        let mut jobs = self.jobs.lock().map_err(|_| Self::lock_poisoned())?;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| FacegateError::NotFound(format!("job {}", job_id)))?;
        if job.status != JobStatus::Started {
            return Err(FacegateError::Conflict(format!(
                "job {} is {} — only started jobs can be requeued",
                job_id, job.status
            )));
        }
        job.status = JobStatus::Queued;
        job.retry_count += 1;
        job.started_at = None;
        job.heartbeat = None;
        job.worker_id = None;
        job.error = error;
        Ok(())
    }

    async fn list_stuck_jobs(
        &self,
        heartbeat_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, FacegateError> {
        let jobs = self.jobs.lock().map_err(|_| Self::lock_poisoned())?;
        Ok(jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Started
                    && j.heartbeat.map(|hb| hb < heartbeat_before).unwrap_or(true)
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PresenceStore for MemoryStore {
    async fn upsert_person_states(
        &self,
        states: &[PersonStateRecord],
    ) -> Result<(), FacegateError> {
        self.check_presence_writable()?;
        let mut map = self
            .person_states
            .lock()
            .map_err(|_| Self::lock_poisoned())?;
        for state in states {
            map.insert(
                (state.subject_id.clone(), state.campus_id.clone()),
                state.clone(),
            );
        }
        Ok(())
    }

    async fn load_person_states(&self) -> Result<Vec<PersonStateRecord>, FacegateError> {
        let map = self
            .person_states
            .lock()
            .map_err(|_| Self::lock_poisoned())?;
        Ok(map.values().cloned().collect())
    }

    async fn append_events(&self, events: &[Event]) -> Result<(), FacegateError> {
        self.check_presence_writable()?;
        let mut stored = self.events.lock().map_err(|_| Self::lock_poisoned())?;
        stored.extend_from_slice(events);
        Ok(())
    }

    async fn list_events(
        &self,
        campus_id: &str,
        kind: Option<EventKind>,
        limit: usize,
    ) -> Result<Vec<Event>, FacegateError> {
        let stored = self.events.lock().map_err(|_| Self::lock_poisoned())?;
        let mut matching: Vec<Event> = stored
            .iter()
            .filter(|e| e.campus_id == campus_id)
            .filter(|e| kind.map(|k| e.kind == k).unwrap_or(true))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn list_person_states(
        &self,
        campus_id: &str,
        status: Option<PresenceStatus>,
    ) -> Result<Vec<PersonStateRecord>, FacegateError> {
        let map = self
            .person_states
            .lock()
            .map_err(|_| Self::lock_poisoned())?;
        Ok(map
            .values()
            .filter(|s| s.campus_id == campus_id)
            .filter(|s| status.map(|st| s.status == st).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn upsert_analytics(&self, rows: &[AnalyticsRow]) -> Result<(), FacegateError> {
        let mut map = self.analytics.lock().map_err(|_| Self::lock_poisoned())?;
        for row in rows {
            map.insert((row.campus_id.clone(), row.date), row.clone());
        }
        Ok(())
    }

    async fn list_analytics(
        &self,
        campus_id: &str,
        since: NaiveDate,
    ) -> Result<Vec<AnalyticsRow>, FacegateError> {
        let map = self.analytics.lock().map_err(|_| Self::lock_poisoned())?;
        let mut rows: Vec<AnalyticsRow> = map
            .values()
            .filter(|r| r.campus_id == campus_id && r.date >= since)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.date.cmp(&a.date));
        Ok(rows)
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn put(
        &self,
        data: Vec<u8>,
        _metadata: serde_json::Value,
    ) -> Result<String, FacegateError> {
        let handle = Uuid::new_v4().to_string();
        let mut blobs = self.blobs.lock().map_err(|_| Self::lock_poisoned())?;
        blobs.insert(handle.clone(), data);
        Ok(handle)
    }

    async fn get(&self, handle: &str) -> Result<Vec<u8>, FacegateError> {
        let blobs = self.blobs.lock().map_err(|_| Self::lock_poisoned())?;
        blobs
            .get(handle)
            .cloned()
            .ok_or_else(|| FacegateError::NotFound(format!("blob {}", handle)))
    }

    async fn delete(&self, handle: &str) -> Result<(), FacegateError> {
        let mut blobs = self.blobs.lock().map_err(|_| Self::lock_poisoned())?;
        blobs.remove(handle);
        Ok(())
    }
}

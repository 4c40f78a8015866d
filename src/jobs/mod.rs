/// Durable embedding-job queue (front-end over the document store)
///
/// State machine: queued -> started -> {done, failed, duplicate}, with
/// started -> queued allowed only through recovery. Lease atomicity lives in
/// the store layer; this module owns enqueue idempotency and the stuck-job
/// recovery policy.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::errors::{DomainError, FacegateError};
use crate::store::{CatalogStore, EmbeddingRecord, Job, JobStatus, Subject};

/// Result of an enqueue call. Enqueue is idempotent per (subject, model):
/// an existing non-terminal job or an already-done embedding makes it a no-op.
#[derive(Debug, Clone)]
pub enum EnqueueOutcome {
    /// A new queued job was created.
    Created(Job),
    /// A job for this (subject, model) is already queued or started.
    AlreadyPending(Job),
    /// The subject already has a done embedding for this model.
    AlreadyDone,
}

impl EnqueueOutcome {
    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueOutcome::Created(_))
    }
}

/// What a recovery pass did.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub failed: usize,
}

pub struct JobQueue {
    store: Arc<dyn CatalogStore>,
    max_retries: u32,
}

impl JobQueue {
    pub fn new(store: Arc<dyn CatalogStore>, max_retries: u32) -> Self {
        JobQueue { store, max_retries }
    }

    /// Create a queued job for (subject, model) unless one is already pending
    /// or the embedding already exists. Also stamps the subject's per-model
    /// record as queued so enrollment status is visible immediately.
    pub async fn enqueue(
        &self,
        subject: &Subject,
        model: &str,
        allowed_models: &[String],
    ) -> Result<EnqueueOutcome, FacegateError> {
        if !allowed_models.iter().any(|m| m == model) {
            return Err(FacegateError::validation(
                "model",
                &format!("Model {} is not enabled for enrollment", model),
            ));
        }
        if subject.blacklisted {
            return Err(FacegateError::Domain(DomainError::Blacklisted(
                subject.subject_id.clone(),
            )));
        }

        if let Some(record) = subject.embedding_record(model) {
            if record.status == JobStatus::Done {
                return Ok(EnqueueOutcome::AlreadyDone);
            }
        }

        if let Some(existing) = self
            .store
            .latest_job(&subject.tenant_id, &subject.subject_id, model)
            .await?
        {
            match existing.status {
                JobStatus::Queued | JobStatus::Started => {
                    return Ok(EnqueueOutcome::AlreadyPending(existing));
                }
                JobStatus::Done => return Ok(EnqueueOutcome::AlreadyDone),
                // failed / duplicate: a fresh enrollment may retry
                JobStatus::Failed | JobStatus::Duplicate => {}
            }
        }

        let now = Utc::now();
        let job = Job {
            job_id: Uuid::new_v4().to_string(),
            tenant_id: subject.tenant_id.clone(),
            subject_id: subject.subject_id.clone(),
            subject_kind: subject.kind,
            model: model.to_string(),
            status: JobStatus::Queued,
            created_at: now,
            started_at: None,
            finished_at: None,
            heartbeat: None,
            worker_id: None,
            retry_count: 0,
            error: None,
        };
        self.store.insert_job(&job).await?;
        self.store
            .set_embedding_record(
                &subject.tenant_id,
                &subject.subject_id,
                model,
                EmbeddingRecord::queued(now),
            )
            .await?;

        tracing::info!(
            job_id = %job.job_id,
            tenant_id = %job.tenant_id,
            subject_id = %job.subject_id,
            model = %model,
            "Enqueued embedding job"
        );
        Ok(EnqueueOutcome::Created(job))
    }

    /// Atomically lease up to `limit` queued jobs for `model`.
    pub async fn lease(
        &self,
        worker_id: &str,
        model: &str,
        limit: usize,
    ) -> Result<Vec<Job>, FacegateError> {
        self.store.lease_jobs(worker_id, model, limit).await
    }

    /// Refresh the lease heartbeat. No-op unless the job is started.
    pub async fn heartbeat(&self, job_id: &str) -> Result<(), FacegateError> {
        self.store.heartbeat_job(job_id).await
    }

    /// Transition started -> terminal. Conflict unless currently started.
    pub async fn complete(
        &self,
        job_id: &str,
        terminal: JobStatus,
        error: Option<String>,
    ) -> Result<(), FacegateError> {
        self.store.complete_job(job_id, terminal, error).await
    }

    /// Return a started job to the queue after a transient failure.
    pub async fn requeue(&self, job_id: &str, error: Option<String>) -> Result<(), FacegateError> {
        self.store.requeue_job(job_id, error).await
    }

    pub async fn get(&self, job_id: &str) -> Result<Job, FacegateError> {
        self.store.get_job(job_id).await
    }

    /// Reclaim jobs whose lease went stale: heartbeat older than
    /// `stuck_timeout`. Jobs with retries left go back to queued; the rest
    /// fail terminally with error "stuck".
    pub async fn recover(&self, stuck_timeout: Duration) -> Result<RecoveryReport, FacegateError> {
        self.recover_at(Utc::now(), stuck_timeout).await
    }

    /// Recovery with an explicit "now" (tests pass synthetic clocks).
    pub async fn recover_at(
        &self,
        now: DateTime<Utc>,
        stuck_timeout: Duration,
    ) -> Result<RecoveryReport, FacegateError> {
        let cutoff = now - stuck_timeout;
        let stuck = self.store.list_stuck_jobs(cutoff).await?;

        let mut report = RecoveryReport::default();
        for job in stuck {
            if job.retry_count < self.max_retries {
                match self.store.requeue_job(&job.job_id, job.error.clone()).await {
                    Ok(()) => {
                        tracing::info!(
                            job_id = %job.job_id,
                            retry = job.retry_count + 1,
                            "Requeued stuck job"
                        );
                        report.requeued += 1;
                    }
                    // Another recoverer or the owning worker got there first
                    Err(FacegateError::Conflict(_)) => {}
                    Err(e) => return Err(e),
                }
            } else {
                match self
                    .store
                    .complete_job(&job.job_id, JobStatus::Failed, Some("stuck".to_string()))
                    .await
                {
                    Ok(()) => {
                        tracing::warn!(
                            job_id = %job.job_id,
                            retries = job.retry_count,
                            "Marking stuck job failed after max retries"
                        );
                        report.failed += 1;
                    }
                    Err(FacegateError::Conflict(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::{EnrollmentImages, SubjectKind, SubjectStatus};
    use std::collections::HashMap;

    fn subject(id: &str) -> Subject {
        Subject {
            tenant_id: "t1".to_string(),
            subject_id: id.to_string(),
            kind: SubjectKind::Employee,
            name: "Avery".to_string(),
            contact: None,
            status: SubjectStatus::Active,
            blacklisted: false,
            images: EnrollmentImages::default(),
            embeddings: HashMap::new(),
            registered_at: Utc::now(),
            last_updated: Utc::now(),
        }
    }

    const MODELS: &[&str] = &["buffalo_l", "mobile_facenet_v1"];

    fn allowed() -> Vec<String> {
        MODELS.iter().map(|m| m.to_string()).collect()
    }

    async fn queue_with_subject(id: &str) -> (Arc<MemoryStore>, JobQueue, Subject) {
        let store = Arc::new(MemoryStore::new());
        let s = subject(id);
        store.upsert_subject(&s).await.unwrap();
        let queue = JobQueue::new(store.clone(), 3);
        (store, queue, s)
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent_while_pending() {
        let (_store, queue, s) = queue_with_subject("s1").await;
        let first = queue.enqueue(&s, "buffalo_l", &allowed()).await.unwrap();
        assert!(first.is_created());
        let second = queue.enqueue(&s, "buffalo_l", &allowed()).await.unwrap();
        assert!(matches!(second, EnqueueOutcome::AlreadyPending(_)));
    }

    #[tokio::test]
    async fn test_enqueue_rejects_unknown_model() {
        let (_store, queue, s) = queue_with_subject("s1").await;
        let err = queue.enqueue(&s, "resnet50", &allowed()).await.unwrap_err();
        assert!(matches!(err, FacegateError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_enqueue_rejects_blacklisted() {
        let (_store, queue, mut s) = queue_with_subject("s1").await;
        s.blacklisted = true;
        let err = queue.enqueue(&s, "buffalo_l", &allowed()).await.unwrap_err();
        assert!(matches!(err, FacegateError::Domain(DomainError::Blacklisted(_))));
    }

    #[tokio::test]
    async fn test_recovery_requeues_then_fails() {
        let (store, queue, s) = queue_with_subject("s1").await;
        queue.enqueue(&s, "buffalo_l", &allowed()).await.unwrap();

        let timeout = Duration::minutes(30);
        for expected_retry in 1..=3u32 {
            let leased = queue.lease("w1", "buffalo_l", 1).await.unwrap();
            assert_eq!(leased.len(), 1);
            // Heartbeat goes stale: recover 31 minutes in the future
            let later = Utc::now() + Duration::minutes(31);
            let report = queue.recover_at(later, timeout).await.unwrap();
            assert_eq!(report.requeued, 1);
            let job = store.get_job(&leased[0].job_id).await.unwrap();
            assert_eq!(job.status, JobStatus::Queued);
            assert_eq!(job.retry_count, expected_retry);
        }

        // Fourth cycle: retries exhausted
        let leased = queue.lease("w1", "buffalo_l", 1).await.unwrap();
        let later = Utc::now() + Duration::minutes(31);
        let report = queue.recover_at(later, timeout).await.unwrap();
        assert_eq!(report.failed, 1);
        let job = queue.get(&leased[0].job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("stuck"));
    }

    #[tokio::test]
    async fn test_fresh_lease_is_not_recovered() {
        let (_store, queue, s) = queue_with_subject("s1").await;
        queue.enqueue(&s, "buffalo_l", &allowed()).await.unwrap();
        queue.lease("w1", "buffalo_l", 1).await.unwrap();
        let report = queue.recover(Duration::minutes(30)).await.unwrap();
        assert_eq!(report.requeued, 0);
        assert_eq!(report.failed, 0);
    }
}

/// Embedding training worker
///
/// Consumes the job queue: leases batches, loads the enrollment image set,
/// extracts one embedding per pose, enforces intra-set consistency, scans the
/// tenant for near-duplicates, and publishes the aggregate to the catalog.
///
/// Face-content rejections (no faces, pose mismatch, duplicate) are terminal.
/// Infrastructure errors requeue the job up to max_retries. Leasing pauses
/// while the host is short on memory or CPU.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use sysinfo::System;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::catalog::EmbeddingCatalog;
use crate::config::WorkerConfig;
use crate::detect::{select_primary_face, FaceDetector, Frame};
use crate::embedding::{first_inconsistent_pair, Embedding};
use crate::errors::{DomainError, FacegateError};
use crate::jobs::JobQueue;
use crate::store::{
    BlobStore, CatalogStore, EmbeddingRecord, Job, JobStatus, Pose, SubjectStatus,
};

/// How often the polling loop runs stuck-job recovery.
const RECOVERY_INTERVAL_SECS: u64 = 300;
/// How often worker statistics are logged.
const STATS_INTERVAL_SECS: u64 = 3600;

/// Pause leasing when the host is over the configured memory/CPU thresholds.
pub struct ResourceMonitor {
    sys: System,
    memory_threshold: f32,
    cpu_threshold: f32,
}

impl ResourceMonitor {
    pub fn new(memory_threshold: f32, cpu_threshold: f32) -> Self {
        ResourceMonitor {
            sys: System::new(),
            memory_threshold,
            cpu_threshold,
        }
    }

    /// True when there is headroom to lease more jobs. CPU usage is averaged
    /// over a one-second window between refreshes.
    pub async fn check(&mut self) -> bool {
        self.sys.refresh_memory();
        self.sys.refresh_cpu_usage();
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        self.sys.refresh_cpu_usage();

        let total = self.sys.total_memory();
        let memory_percent = if total == 0 {
            0.0
        } else {
            self.sys.used_memory() as f32 / total as f32 * 100.0
        };
        if memory_percent > self.memory_threshold {
            tracing::warn!(memory_percent, "Memory usage too high — pausing lease");
            return false;
        }

        let cpu_percent = self.sys.global_cpu_info().cpu_usage();
        if cpu_percent > self.cpu_threshold {
            tracing::warn!(cpu_percent, "CPU usage too high — pausing lease");
            return false;
        }
        true
    }
}

#[derive(Debug, Default)]
struct WorkerStats {
    processed: u64,
    failed: u64,
    duplicates: u64,
}

/// Terminal outcome of one job execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Done,
    Failed(String),
    Duplicate(String),
}

pub struct TrainingWorker {
    worker_id: String,
    config: WorkerConfig,
    queue: Arc<JobQueue>,
    store: Arc<dyn CatalogStore>,
    images: Arc<dyn BlobStore>,
    catalog: Arc<EmbeddingCatalog>,
    detector: tokio::sync::Mutex<Box<dyn FaceDetector>>,
    stats: Mutex<WorkerStats>,
    started_at: DateTime<Utc>,
}

impl TrainingWorker {
    pub fn new(
        worker_id: &str,
        config: WorkerConfig,
        queue: Arc<JobQueue>,
        store: Arc<dyn CatalogStore>,
        images: Arc<dyn BlobStore>,
        catalog: Arc<EmbeddingCatalog>,
        detector: Box<dyn FaceDetector>,
    ) -> Self {
        TrainingWorker {
            worker_id: worker_id.to_string(),
            config,
            queue,
            store,
            images,
            catalog,
            detector: tokio::sync::Mutex::new(detector),
            stats: Mutex::new(WorkerStats::default()),
            started_at: Utc::now(),
        }
    }

    /// Main polling loop. Observes the shutdown token: stops leasing on
    /// cancellation and lets in-flight jobs finish before returning.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        if !self.config.enabled {
            tracing::warn!(worker_id = %self.worker_id, "Training worker is disabled");
            return;
        }

        tracing::info!(worker_id = %self.worker_id, model = %self.config.model_name, "Training worker started");

        {
            let mut detector = self.detector.lock().await;
            if let Err(e) = detector.ensure_ready().await {
                tracing::error!(error = %e, "Failed to initialize face detector");
                return;
            }
        }

        let mut monitor =
            ResourceMonitor::new(self.config.memory_threshold, self.config.cpu_threshold);
        let semaphore = Arc::new(Semaphore::new(self.config.max_workers));
        let mut last_recovery = tokio::time::Instant::now();
        let mut last_stats = tokio::time::Instant::now();

        while !shutdown.is_cancelled() {
            if !monitor.check().await {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.polling_interval() * 2) => continue,
                }
            }

            if last_recovery.elapsed().as_secs() > RECOVERY_INTERVAL_SECS {
                if let Err(e) = self.queue.recover(self.config.stuck_timeout()).await {
                    tracing::error!(error = %e, "Stuck-job recovery failed");
                }
                last_recovery = tokio::time::Instant::now();
            }

            if last_stats.elapsed().as_secs() > STATS_INTERVAL_SECS {
                self.log_stats();
                last_stats = tokio::time::Instant::now();
            }

            let jobs = match self
                .queue
                .lease(&self.worker_id, &self.config.model_name, self.config.batch_size)
                .await
            {
                Ok(jobs) => jobs,
                Err(e) => {
                    tracing::error!(error = %e, "Lease failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.polling_interval()) => continue,
                    }
                }
            };

            if jobs.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.polling_interval()) => continue,
                }
            }

            tracing::info!(count = jobs.len(), "Leased embedding jobs");
            let mut tasks = JoinSet::new();
            for job in jobs {
                let worker = Arc::clone(&self);
                let semaphore = Arc::clone(&semaphore);
                tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    worker.process_job(job).await;
                });
            }
            // In-flight jobs always run to completion, shutdown or not
            while tasks.join_next().await.is_some() {}
        }

        self.log_stats();
        tracing::info!(worker_id = %self.worker_id, "Training worker stopped");
    }

    fn log_stats(&self) {
        let stats = self.stats.lock().expect("worker stats lock poisoned");
        let uptime = Utc::now() - self.started_at;
        tracing::info!(
            processed = stats.processed,
            failed = stats.failed,
            duplicates = stats.duplicates,
            uptime_secs = uptime.num_seconds(),
            "Worker stats"
        );
    }

    fn bump(&self, f: impl FnOnce(&mut WorkerStats)) {
        let mut stats = self.stats.lock().expect("worker stats lock poisoned");
        f(&mut stats);
    }

    /// Run one leased job to a terminal state, with a lease heartbeat ticking
    /// in the background for long detector or scan phases.
    pub async fn process_job(self: Arc<Self>, job: Job) {
        let heartbeat = {
            let queue = Arc::clone(&self.queue);
            let job_id = job.job_id.clone();
            let interval = self.config.heartbeat_interval();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(interval);
                tick.tick().await;
                loop {
                    tick.tick().await;
                    if let Err(e) = queue.heartbeat(&job_id).await {
                        tracing::warn!(job_id = %job_id, error = %e, "Heartbeat failed");
                    }
                }
            })
        };

        let result = self.execute_job(&job).await;
        heartbeat.abort();

        match result {
            Ok(JobOutcome::Done) => {
                self.bump(|s| s.processed += 1);
                tracing::info!(job_id = %job.job_id, subject_id = %job.subject_id, "Job done");
            }
            Ok(JobOutcome::Duplicate(of)) => {
                self.bump(|s| s.duplicates += 1);
                tracing::info!(
                    job_id = %job.job_id,
                    subject_id = %job.subject_id,
                    duplicate_of = %of,
                    "Duplicate face found"
                );
            }
            Ok(JobOutcome::Failed(reason)) => {
                self.bump(|s| s.failed += 1);
                tracing::warn!(job_id = %job.job_id, subject_id = %job.subject_id, reason = %reason, "Job failed");
            }
            Err(e) => {
                // Infrastructure failure: requeue while retries remain
                self.bump(|s| s.failed += 1);
                if job.retry_count < self.config.max_retries {
                    tracing::warn!(
                        job_id = %job.job_id,
                        retry = job.retry_count + 1,
                        error = %e,
                        "Requeuing job after transient failure"
                    );
                    if let Err(re) = self.queue.requeue(&job.job_id, Some(e.to_string())).await {
                        tracing::error!(job_id = %job.job_id, error = %re, "Requeue failed");
                    }
                } else {
                    tracing::error!(
                        job_id = %job.job_id,
                        retries = job.retry_count,
                        error = %e,
                        "Job failed after max retries"
                    );
                    if let Err(ce) = self
                        .queue
                        .complete(&job.job_id, JobStatus::Failed, Some(e.to_string()))
                        .await
                    {
                        tracing::error!(job_id = %job.job_id, error = %ce, "Failed to mark job failed");
                    }
                }
            }
        }
    }

    /// The per-job contract: poses -> consistency gate -> aggregate ->
    /// duplicate gate -> publish. Domain rejections are resolved to terminal
    /// states here; infrastructure errors propagate to the caller.
    async fn execute_job(&self, job: &Job) -> Result<JobOutcome, FacegateError> {
        let subject = self.store.get_subject(&job.tenant_id, &job.subject_id).await?;
        let record_created_at = subject
            .embedding_record(&job.model)
            .map(|r| r.created_at)
            .unwrap_or(job.created_at);
        let started_at = Utc::now();

        // Mark the subject's per-model record started alongside the job
        self.store
            .set_embedding_record(
                &job.tenant_id,
                &job.subject_id,
                &job.model,
                EmbeddingRecord {
                    handle: None,
                    status: JobStatus::Started,
                    created_at: record_created_at,
                    started_at: Some(started_at),
                    finished_at: None,
                    duplicate_of: None,
                    error: None,
                },
            )
            .await?;

        // One embedding per pose, in order; missing or faceless poses are skipped
        let mut poses: Vec<Pose> = Vec::new();
        let mut embeddings: Vec<Embedding> = Vec::new();
        for pose in Pose::ALL {
            let handle = match subject.images.get(pose) {
                Some(h) => h,
                None => continue,
            };
            let bytes = match self.images.get(handle).await {
                Ok(bytes) => bytes,
                Err(FacegateError::NotFound(_)) => {
                    tracing::warn!(
                        subject_id = %job.subject_id,
                        pose = %pose,
                        "Enrollment image missing — skipping pose"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };
            let frame = Frame::from_encoded(bytes, Utc::now());

            let faces = {
                let mut detector = self.detector.lock().await;
                detector.ensure_ready().await?;
                detector.detect(&frame).await?
            };
            tracing::debug!(pose = %pose, faces = faces.len(), "Pose processed");

            if let Some(face) = select_primary_face(faces) {
                poses.push(pose);
                embeddings.push(face.embedding);
            }
            self.queue.heartbeat(&job.job_id).await?;
        }

        if embeddings.is_empty() {
            let reason = DomainError::NoFaces.to_string();
            self.finish_rejected(job, record_created_at, started_at, &reason, None)
                .await?;
            return Ok(JobOutcome::Failed(reason));
        }

        // All collected poses must be the same person
        if let Some((i, j)) = first_inconsistent_pair(&embeddings, self.config.similarity_threshold)
        {
            let reason = DomainError::PoseMismatch {
                first: poses[i].to_string(),
                second: poses[j].to_string(),
            }
            .to_string();
            self.finish_rejected(
                job,
                record_created_at,
                started_at,
                &reason,
                Some(SubjectStatus::Incomplete),
            )
            .await?;
            return Ok(JobOutcome::Failed(reason));
        }

        let aggregate = Embedding::mean(&embeddings)?.normalized();

        // Full-catalog duplicate scan within the tenant; first match wins
        for (other_id, other_embedding) in self.catalog.done_embeddings(&job.tenant_id).await? {
            if other_id == job.subject_id {
                continue;
            }
            let similarity = aggregate.cosine_similarity(&other_embedding);
            if similarity > self.config.duplicate_threshold {
                self.finish_duplicate(job, record_created_at, started_at, &other_id)
                    .await?;
                return Ok(JobOutcome::Duplicate(other_id));
            }
        }

        self.catalog
            .publish(
                &job.tenant_id,
                &job.subject_id,
                &aggregate,
                record_created_at,
                Some(started_at),
            )
            .await?;
        self.queue.complete(&job.job_id, JobStatus::Done, None).await?;
        Ok(JobOutcome::Done)
    }

    async fn finish_rejected(
        &self,
        job: &Job,
        record_created_at: DateTime<Utc>,
        started_at: DateTime<Utc>,
        reason: &str,
        subject_status: Option<SubjectStatus>,
    ) -> Result<(), FacegateError> {
        self.store
            .set_embedding_record(
                &job.tenant_id,
                &job.subject_id,
                &job.model,
                EmbeddingRecord {
                    handle: None,
                    status: JobStatus::Failed,
                    created_at: record_created_at,
                    started_at: Some(started_at),
                    finished_at: Some(Utc::now()),
                    duplicate_of: None,
                    error: Some(reason.to_string()),
                },
            )
            .await?;
        if let Some(status) = subject_status {
            self.store
                .set_subject_status(&job.tenant_id, &job.subject_id, status)
                .await?;
        }
        self.queue
            .complete(&job.job_id, JobStatus::Failed, Some(reason.to_string()))
            .await
    }

    async fn finish_duplicate(
        &self,
        job: &Job,
        record_created_at: DateTime<Utc>,
        started_at: DateTime<Utc>,
        duplicate_of: &str,
    ) -> Result<(), FacegateError> {
        self.store
            .set_embedding_record(
                &job.tenant_id,
                &job.subject_id,
                &job.model,
                EmbeddingRecord {
                    handle: None,
                    status: JobStatus::Duplicate,
                    created_at: record_created_at,
                    started_at: Some(started_at),
                    finished_at: Some(Utc::now()),
                    duplicate_of: Some(duplicate_of.to_string()),
                    error: None,
                },
            )
            .await?;
        // Not hard-deleted: an external janitor removes it after the dwell,
        // leaving the record inspectable by administrators.
        self.store
            .set_subject_status(
                &job.tenant_id,
                &job.subject_id,
                SubjectStatus::PendingDuplicateRemoval,
            )
            .await?;
        self.queue
            .complete(&job.job_id, JobStatus::Duplicate, None)
            .await
    }
}

/// Start the training worker as a background task.
pub fn spawn_training_worker(
    worker: Arc<TrainingWorker>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        worker.run(shutdown).await;
    })
}

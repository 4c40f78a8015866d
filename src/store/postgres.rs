/// PostgreSQL-backed store implementation
///
/// Uses sqlx with PgPool for connection pooling and production-grade
/// persistence. Subjects carry their image and embedding maps as JSONB
/// documents; the job lease uses FOR UPDATE SKIP LOCKED so two workers can
/// never receive the same job. Supports optional migration execution on
/// startup.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{
    postgres::{PgPool, PgPoolOptions, PgRow},
    Row,
};
use uuid::Uuid;

use crate::errors::FacegateError;
use crate::store::{
    AnalyticsRow, BlobStore, CatalogStore, EmbeddingRecord, EnrollmentImages, Event, EventKind,
    Job, JobStatus, PersonStateRecord, PresenceStatus, PresenceStore, Subject, SubjectKind,
    SubjectStatus,
};

/// PostgreSQL-backed store using a shared sqlx connection pool.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to PostgreSQL at database_url with a production-ready pool.
    /// If run_migrations is true, automatically runs pending migrations.
    pub async fn new(database_url: &str, run_migrations: bool) -> Result<Self, FacegateError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .idle_timeout(Duration::from_secs(300))
            .max_lifetime(Duration::from_secs(1800))
            .connect(database_url)
            .await
            .map_err(|e| {
                FacegateError::Transient(format!("Failed to connect to database: {}", e))
            })?;

        if run_migrations {
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .map_err(|e| FacegateError::Transient(format!("Migration failed: {}", e)))?;
        }

        Ok(PostgresStore { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn parse_enum<T: FromStr<Err = String>>(raw: &str) -> Result<T, FacegateError> {
    raw.parse::<T>().map_err(FacegateError::Transient)
}

fn row_to_subject(row: &PgRow) -> Result<Subject, FacegateError> {
    let kind: String = row
        .try_get("kind")
        .map_err(|e| FacegateError::Transient(e.to_string()))?;
    let status: String = row
        .try_get("status")
        .map_err(|e| FacegateError::Transient(e.to_string()))?;
    let images: serde_json::Value = row
        .try_get("images")
        .map_err(|e| FacegateError::Transient(e.to_string()))?;
    let embeddings: serde_json::Value = row
        .try_get("embeddings")
        .map_err(|e| FacegateError::Transient(e.to_string()))?;

    Ok(Subject {
        tenant_id: row
            .try_get("tenant_id")
            .map_err(|e| FacegateError::Transient(e.to_string()))?,
        subject_id: row
            .try_get("subject_id")
            .map_err(|e| FacegateError::Transient(e.to_string()))?,
        kind: parse_enum::<SubjectKind>(&kind)?,
        name: row
            .try_get("name")
            .map_err(|e| FacegateError::Transient(e.to_string()))?,
        contact: row
            .try_get("contact")
            .map_err(|e| FacegateError::Transient(e.to_string()))?,
        status: parse_enum::<SubjectStatus>(&status)?,
        blacklisted: row
            .try_get("blacklisted")
            .map_err(|e| FacegateError::Transient(e.to_string()))?,
        images: serde_json::from_value::<EnrollmentImages>(images)
            .map_err(|e| FacegateError::Transient(format!("Bad images document: {}", e)))?,
        embeddings: serde_json::from_value(embeddings)
            .map_err(|e| FacegateError::Transient(format!("Bad embeddings document: {}", e)))?,
        registered_at: row
            .try_get("registered_at")
            .map_err(|e| FacegateError::Transient(e.to_string()))?,
        last_updated: row
            .try_get("last_updated")
            .map_err(|e| FacegateError::Transient(e.to_string()))?,
    })
}

fn row_to_job(row: &PgRow) -> Result<Job, FacegateError> {
    let status: String = row
        .try_get("status")
        .map_err(|e| FacegateError::Transient(e.to_string()))?;
    let kind: String = row
        .try_get("subject_kind")
        .map_err(|e| FacegateError::Transient(e.to_string()))?;
    let retry_count: i32 = row
        .try_get("retry_count")
        .map_err(|e| FacegateError::Transient(e.to_string()))?;

    Ok(Job {
        job_id: row
            .try_get("job_id")
            .map_err(|e| FacegateError::Transient(e.to_string()))?,
        tenant_id: row
            .try_get("tenant_id")
            .map_err(|e| FacegateError::Transient(e.to_string()))?,
        subject_id: row
            .try_get("subject_id")
            .map_err(|e| FacegateError::Transient(e.to_string()))?,
        subject_kind: parse_enum::<SubjectKind>(&kind)?,
        model: row
            .try_get("model")
            .map_err(|e| FacegateError::Transient(e.to_string()))?,
        status: parse_enum::<JobStatus>(&status)?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| FacegateError::Transient(e.to_string()))?,
        started_at: row
            .try_get("started_at")
            .map_err(|e| FacegateError::Transient(e.to_string()))?,
        finished_at: row
            .try_get("finished_at")
            .map_err(|e| FacegateError::Transient(e.to_string()))?,
        heartbeat: row
            .try_get("heartbeat")
            .map_err(|e| FacegateError::Transient(e.to_string()))?,
        worker_id: row
            .try_get("worker_id")
            .map_err(|e| FacegateError::Transient(e.to_string()))?,
        retry_count: retry_count.max(0) as u32,
        error: row
            .try_get("error")
            .map_err(|e| FacegateError::Transient(e.to_string()))?,
    })
}

fn row_to_person_state(row: &PgRow) -> Result<PersonStateRecord, FacegateError> {
    let kind: String = row
        .try_get("kind")
        .map_err(|e| FacegateError::Transient(e.to_string()))?;
    let status: String = row
        .try_get("status")
        .map_err(|e| FacegateError::Transient(e.to_string()))?;
    let entries: i64 = row
        .try_get("entries_today")
        .map_err(|e| FacegateError::Transient(e.to_string()))?;
    let exits: i64 = row
        .try_get("exits_today")
        .map_err(|e| FacegateError::Transient(e.to_string()))?;
    let detections: i64 = row
        .try_get("detections_today")
        .map_err(|e| FacegateError::Transient(e.to_string()))?;

    Ok(PersonStateRecord {
        tenant_id: row
            .try_get("tenant_id")
            .map_err(|e| FacegateError::Transient(e.to_string()))?,
        subject_id: row
            .try_get("subject_id")
            .map_err(|e| FacegateError::Transient(e.to_string()))?,
        campus_id: row
            .try_get("campus_id")
            .map_err(|e| FacegateError::Transient(e.to_string()))?,
        kind: parse_enum::<SubjectKind>(&kind)?,
        name: row
            .try_get("name")
            .map_err(|e| FacegateError::Transient(e.to_string()))?,
        status: parse_enum::<PresenceStatus>(&status)?,
        current_entry_at: row
            .try_get("current_entry_at")
            .map_err(|e| FacegateError::Transient(e.to_string()))?,
        last_exit_at: row
            .try_get("last_exit_at")
            .map_err(|e| FacegateError::Transient(e.to_string()))?,
        entries_today: entries.max(0) as u64,
        exits_today: exits.max(0) as u64,
        detections_today: detections.max(0) as u64,
        last_camera: row
            .try_get("last_camera")
            .map_err(|e| FacegateError::Transient(e.to_string()))?,
        last_seen_at: row
            .try_get("last_seen_at")
            .map_err(|e| FacegateError::Transient(e.to_string()))?,
    })
}

fn row_to_event(row: &PgRow) -> Result<Event, FacegateError> {
    let kind: String = row
        .try_get("kind")
        .map_err(|e| FacegateError::Transient(e.to_string()))?;
    let bbox: Option<serde_json::Value> = row
        .try_get("bbox")
        .map_err(|e| FacegateError::Transient(e.to_string()))?;
    let similarity: Option<f64> = row
        .try_get("similarity")
        .map_err(|e| FacegateError::Transient(e.to_string()))?;
    let detection_count: Option<i64> = row
        .try_get("detection_count")
        .map_err(|e| FacegateError::Transient(e.to_string()))?;

    Ok(Event {
        event_id: row
            .try_get("event_id")
            .map_err(|e| FacegateError::Transient(e.to_string()))?,
        kind: parse_enum::<EventKind>(&kind)?,
        tenant_id: row
            .try_get("tenant_id")
            .map_err(|e| FacegateError::Transient(e.to_string()))?,
        campus_id: row
            .try_get("campus_id")
            .map_err(|e| FacegateError::Transient(e.to_string()))?,
        subject_id: row
            .try_get("subject_id")
            .map_err(|e| FacegateError::Transient(e.to_string()))?,
        cluster_id: row
            .try_get("cluster_id")
            .map_err(|e| FacegateError::Transient(e.to_string()))?,
        camera_id: row
            .try_get("camera_id")
            .map_err(|e| FacegateError::Transient(e.to_string()))?,
        timestamp: row
            .try_get("ts")
            .map_err(|e| FacegateError::Transient(e.to_string()))?,
        similarity: similarity.map(|s| s as f32),
        bbox: match bbox {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| FacegateError::Transient(format!("Bad bbox document: {}", e)))?,
            None => None,
        },
        detection_count: detection_count.map(|c| c.max(0) as u64),
        is_new: row
            .try_get("is_new")
            .map_err(|e| FacegateError::Transient(e.to_string()))?,
    })
}

fn row_to_analytics(row: &PgRow) -> Result<AnalyticsRow, FacegateError> {
    fn get_count(row: &PgRow, column: &str) -> Result<u64, FacegateError> {
        let v: i64 = row
            .try_get(column)
            .map_err(|e| FacegateError::Transient(e.to_string()))?;
        Ok(v.max(0) as u64)
    }

    Ok(AnalyticsRow {
        tenant_id: row
            .try_get("tenant_id")
            .map_err(|e| FacegateError::Transient(e.to_string()))?,
        campus_id: row
            .try_get("campus_id")
            .map_err(|e| FacegateError::Transient(e.to_string()))?,
        date: row
            .try_get("date")
            .map_err(|e| FacegateError::Transient(e.to_string()))?,
        inside: get_count(row, "inside")?,
        employees_inside: get_count(row, "employees_inside")?,
        visitors_inside: get_count(row, "visitors_inside")?,
        entries: get_count(row, "entries")?,
        exits: get_count(row, "exits")?,
        unknown_detections: get_count(row, "unknown_detections")?,
        unique_unknowns: get_count(row, "unique_unknowns")?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| FacegateError::Transient(e.to_string()))?,
    })
}

const SUBJECT_COLUMNS: &str = "tenant_id, subject_id, kind, name, contact, status, blacklisted, \
     images, embeddings, registered_at, last_updated";

const JOB_COLUMNS: &str = "job_id, tenant_id, subject_id, subject_kind, model, status, \
     created_at, started_at, finished_at, heartbeat, worker_id, retry_count, error";

#[async_trait]
impl CatalogStore for PostgresStore {
    async fn upsert_subject(&self, subject: &Subject) -> Result<(), FacegateError> {
        let images = serde_json::to_value(&subject.images)
            .map_err(|e| FacegateError::Transient(e.to_string()))?;
        let embeddings = serde_json::to_value(&subject.embeddings)
            .map_err(|e| FacegateError::Transient(e.to_string()))?;

        sqlx::query(
            "INSERT INTO subjects \
             (tenant_id, subject_id, kind, name, contact, status, blacklisted, images, embeddings, registered_at, last_updated) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (tenant_id, subject_id) DO UPDATE SET \
               kind = EXCLUDED.kind, \
               name = EXCLUDED.name, \
               contact = EXCLUDED.contact, \
               status = EXCLUDED.status, \
               blacklisted = EXCLUDED.blacklisted, \
               images = EXCLUDED.images, \
               embeddings = EXCLUDED.embeddings, \
               last_updated = EXCLUDED.last_updated",
        )
        .bind(&subject.tenant_id)
        .bind(&subject.subject_id)
        .bind(subject.kind.to_string())
        .bind(&subject.name)
        .bind(&subject.contact)
        .bind(subject.status.to_string())
        .bind(subject.blacklisted)
        .bind(&images)
        .bind(&embeddings)
        .bind(subject.registered_at)
        .bind(subject.last_updated)
        .execute(&self.pool)
        .await
        .map_err(|e| FacegateError::Transient(format!("Failed to upsert subject: {}", e)))?;

        Ok(())
    }

    async fn get_subject(
        &self,
        tenant_id: &str,
        subject_id: &str,
    ) -> Result<Subject, FacegateError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM subjects WHERE tenant_id = $1 AND subject_id = $2",
            SUBJECT_COLUMNS
        ))
        .bind(tenant_id)
        .bind(subject_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| FacegateError::Transient(e.to_string()))?
        .ok_or_else(|| FacegateError::NotFound(format!("subject {}", subject_id)))?;

        row_to_subject(&row)
    }

    async fn list_active_subjects(
        &self,
        tenant_id: &str,
        model: &str,
        updated_since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Subject>, FacegateError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM subjects \
             WHERE tenant_id = $1 \
               AND status = 'active' \
               AND blacklisted = FALSE \
               AND embeddings -> $2 ->> 'status' = 'done' \
               AND ($3::timestamptz IS NULL OR last_updated >= $3)",
            SUBJECT_COLUMNS
        ))
        .bind(tenant_id)
        .bind(model)
        .bind(updated_since)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| FacegateError::Transient(format!("Failed to list subjects: {}", e)))?;

        rows.iter().map(row_to_subject).collect()
    }

    async fn list_ineligible_subject_ids(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<String>, FacegateError> {
        let rows = sqlx::query(
            "SELECT subject_id FROM subjects \
             WHERE tenant_id = $1 AND (status != 'active' OR blacklisted = TRUE)",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| FacegateError::Transient(e.to_string()))?;

        rows.iter()
            .map(|row| {
                row.try_get("subject_id")
                    .map_err(|e| FacegateError::Transient(e.to_string()))
            })
            .collect()
    }

    async fn list_tenant_ids(&self) -> Result<Vec<String>, FacegateError> {
        let rows = sqlx::query("SELECT DISTINCT tenant_id FROM subjects ORDER BY tenant_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| FacegateError::Transient(e.to_string()))?;

        rows.iter()
            .map(|row| {
                row.try_get("tenant_id")
                    .map_err(|e| FacegateError::Transient(e.to_string()))
            })
            .collect()
    }

    async fn list_done_embedding_handles(
        &self,
        tenant_id: &str,
        model: &str,
    ) -> Result<Vec<(String, String)>, FacegateError> {
        let rows = sqlx::query(
            "SELECT subject_id, embeddings -> $2 ->> 'handle' AS handle FROM subjects \
             WHERE tenant_id = $1 AND embeddings -> $2 ->> 'status' = 'done' \
             ORDER BY subject_id",
        )
        .bind(tenant_id)
        .bind(model)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| FacegateError::Transient(e.to_string()))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let subject_id: String = row
                .try_get("subject_id")
                .map_err(|e| FacegateError::Transient(e.to_string()))?;
            let handle: Option<String> = row
                .try_get("handle")
                .map_err(|e| FacegateError::Transient(e.to_string()))?;
            if let Some(handle) = handle {
                out.push((subject_id, handle));
            }
        }
        Ok(out)
    }

    async fn set_embedding_record(
        &self,
        tenant_id: &str,
        subject_id: &str,
        model: &str,
        record: EmbeddingRecord,
    ) -> Result<(), FacegateError> {
        let record_json = serde_json::to_value(&record)
            .map_err(|e| FacegateError::Transient(e.to_string()))?;

        let result = sqlx::query(
            "UPDATE subjects \
             SET embeddings = jsonb_set(embeddings, ARRAY[$3], $4::jsonb, true), \
                 last_updated = $5 \
             WHERE tenant_id = $1 AND subject_id = $2",
        )
        .bind(tenant_id)
        .bind(subject_id)
        .bind(model)
        .bind(&record_json)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            FacegateError::Transient(format!("Failed to update embedding record: {}", e))
        })?;

        if result.rows_affected() == 0 {
            return Err(FacegateError::NotFound(format!("subject {}", subject_id)));
        }
        Ok(())
    }

    async fn set_subject_status(
        &self,
        tenant_id: &str,
        subject_id: &str,
        status: SubjectStatus,
    ) -> Result<(), FacegateError> {
        let result = sqlx::query(
            "UPDATE subjects SET status = $3, last_updated = $4 \
             WHERE tenant_id = $1 AND subject_id = $2",
        )
        .bind(tenant_id)
        .bind(subject_id)
        .bind(status.to_string())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| FacegateError::Transient(format!("Failed to update status: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(FacegateError::NotFound(format!("subject {}", subject_id)));
        }
        Ok(())
    }

    async fn insert_job(&self, job: &Job) -> Result<(), FacegateError> {
        sqlx::query(
            "INSERT INTO embedding_jobs \
             (job_id, tenant_id, subject_id, subject_kind, model, status, created_at, retry_count) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&job.job_id)
        .bind(&job.tenant_id)
        .bind(&job.subject_id)
        .bind(job.subject_kind.to_string())
        .bind(&job.model)
        .bind(job.status.to_string())
        .bind(job.created_at)
        .bind(job.retry_count as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| FacegateError::Transient(format!("Failed to insert job: {}", e)))?;

        Ok(())
    }

    async fn latest_job(
        &self,
        tenant_id: &str,
        subject_id: &str,
        model: &str,
    ) -> Result<Option<Job>, FacegateError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM embedding_jobs \
             WHERE tenant_id = $1 AND subject_id = $2 AND model = $3 \
             ORDER BY created_at DESC, job_id DESC LIMIT 1",
            JOB_COLUMNS
        ))
        .bind(tenant_id)
        .bind(subject_id)
        .bind(model)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| FacegateError::Transient(e.to_string()))?;

        row.as_ref().map(row_to_job).transpose()
    }

    async fn get_job(&self, job_id: &str) -> Result<Job, FacegateError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM embedding_jobs WHERE job_id = $1",
            JOB_COLUMNS
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| FacegateError::Transient(e.to_string()))?
        .ok_or_else(|| FacegateError::NotFound(format!("job {}", job_id)))?;

        row_to_job(&row)
    }

    async fn lease_jobs(
        &self,
        worker_id: &str,
        model: &str,
        limit: usize,
    ) -> Result<Vec<Job>, FacegateError> {
        // Single atomic select-and-mark. SKIP LOCKED keeps concurrent leasers
        // from blocking on (or double-claiming) the same rows.
        let rows = sqlx::query(&format!(
            "UPDATE embedding_jobs SET \
               status = 'started', \
               started_at = NOW(), \
               heartbeat = NOW(), \
               worker_id = $1 \
             WHERE job_id IN ( \
               SELECT job_id FROM embedding_jobs \
               WHERE status = 'queued' AND model = $2 \
               ORDER BY created_at ASC, job_id ASC \
               LIMIT $3 \
               FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {}",
            JOB_COLUMNS
        ))
        .bind(worker_id)
        .bind(model)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| FacegateError::Transient(format!("Lease failed: {}", e)))?;

        let mut jobs: Vec<Job> = rows
            .iter()
            .map(row_to_job)
            .collect::<Result<Vec<_>, _>>()?;
        jobs.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        Ok(jobs)
    }

    async fn heartbeat_job(&self, job_id: &str) -> Result<(), FacegateError> {
        sqlx::query(
            "UPDATE embedding_jobs SET heartbeat = NOW() \
             WHERE job_id = $1 AND status = 'started'",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| FacegateError::Transient(format!("Heartbeat failed: {}", e)))?;

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

        let result = sqlx::query(
            "UPDATE embedding_jobs \
             SET status = $2, finished_at = NOW(), error = $3 \
             WHERE job_id = $1 AND status = 'started'",
        )
        .bind(job_id)
        .bind(terminal.to_string())
        .bind(&error)
        .execute(&self.pool)
        .await
        .map_err(|e| FacegateError::Transient(format!("Complete failed: {}", e)))?;

        if result.rows_affected() == 0 {
            // Distinguish a missing job from a wrong-state job
            let current = self.get_job(job_id).await?;
            return Err(FacegateError::Conflict(format!(
                "job {} is {} — only started jobs can complete",
                job_id, current.status
            )));
        }
        Ok(())
    }

    async fn requeue_job(
        &self,
        job_id: &str,
        error: Option<String>,
    ) -> Result<(), FacegateError> {
        let result = sqlx::query(
            "UPDATE embedding_jobs \
             SET status = 'queued', retry_count = retry_count + 1, \
                 started_at = NULL, heartbeat = NULL, worker_id = NULL, error = $2 \
             WHERE job_id = $1 AND status = 'started'",
        )
        .bind(job_id)
        .bind(&error)
        .execute(&self.pool)
        .await
        .map_err(|e| FacegateError::Transient(format!("Requeue failed: {}", e)))?;

        if result.rows_affected() == 0 {
            let current = self.get_job(job_id).await?;
            return Err(FacegateError::Conflict(format!(
                "job {} is {} — only started jobs can be requeued",
                job_id, current.status
            )));
        }
        Ok(())
    }

    async fn list_stuck_jobs(
        &self,
        heartbeat_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, FacegateError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM embedding_jobs \
             WHERE status = 'started' AND (heartbeat IS NULL OR heartbeat < $1)",
            JOB_COLUMNS
        ))
        .bind(heartbeat_before)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| FacegateError::Transient(e.to_string()))?;

        rows.iter().map(row_to_job).collect()
    }
}

#[async_trait]
impl PresenceStore for PostgresStore {
    async fn upsert_person_states(
        &self,
        states: &[PersonStateRecord],
    ) -> Result<(), FacegateError> {
        if states.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| FacegateError::Transient(e.to_string()))?;

        for state in states {
            sqlx::query(
                "INSERT INTO person_status \
                 (tenant_id, subject_id, campus_id, kind, name, status, current_entry_at, \
                  last_exit_at, entries_today, exits_today, detections_today, last_camera, last_seen_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
                 ON CONFLICT (subject_id, campus_id) DO UPDATE SET \
                   tenant_id = EXCLUDED.tenant_id, \
                   kind = EXCLUDED.kind, \
                   name = EXCLUDED.name, \
                   status = EXCLUDED.status, \
                   current_entry_at = EXCLUDED.current_entry_at, \
                   last_exit_at = EXCLUDED.last_exit_at, \
                   entries_today = EXCLUDED.entries_today, \
                   exits_today = EXCLUDED.exits_today, \
                   detections_today = EXCLUDED.detections_today, \
                   last_camera = EXCLUDED.last_camera, \
                   last_seen_at = EXCLUDED.last_seen_at",
            )
            .bind(&state.tenant_id)
            .bind(&state.subject_id)
            .bind(&state.campus_id)
            .bind(state.kind.to_string())
            .bind(&state.name)
            .bind(match state.status {
                PresenceStatus::Inside => "inside",
                PresenceStatus::Outside => "outside",
            })
            .bind(state.current_entry_at)
            .bind(state.last_exit_at)
            .bind(state.entries_today as i64)
            .bind(state.exits_today as i64)
            .bind(state.detections_today as i64)
            .bind(&state.last_camera)
            .bind(state.last_seen_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                FacegateError::Transient(format!("Failed to upsert person state: {}", e))
            })?;
        }

        tx.commit()
            .await
            .map_err(|e| FacegateError::Transient(e.to_string()))?;
        Ok(())
    }

    async fn load_person_states(&self) -> Result<Vec<PersonStateRecord>, FacegateError> {
        let rows = sqlx::query(
            "SELECT tenant_id, subject_id, campus_id, kind, name, status, current_entry_at, \
             last_exit_at, entries_today, exits_today, detections_today, last_camera, last_seen_at \
             FROM person_status",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| FacegateError::Transient(e.to_string()))?;

        rows.iter().map(row_to_person_state).collect()
    }

    async fn append_events(&self, events: &[Event]) -> Result<(), FacegateError> {
        if events.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| FacegateError::Transient(e.to_string()))?;

        for event in events {
            let bbox = event
                .bbox
                .as_ref()
                .map(serde_json::to_value)
                .transpose()
                .map_err(|e| FacegateError::Transient(e.to_string()))?;

            sqlx::query(
                "INSERT INTO campus_events \
                 (event_id, kind, tenant_id, campus_id, subject_id, cluster_id, camera_id, ts, \
                  similarity, bbox, detection_count, is_new) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            )
            .bind(&event.event_id)
            .bind(event.kind.to_string())
            .bind(&event.tenant_id)
            .bind(&event.campus_id)
            .bind(&event.subject_id)
            .bind(&event.cluster_id)
            .bind(&event.camera_id)
            .bind(event.timestamp)
            .bind(event.similarity.map(|s| s as f64))
            .bind(&bbox)
            .bind(event.detection_count.map(|c| c as i64))
            .bind(event.is_new)
            .execute(&mut *tx)
            .await
            .map_err(|e| FacegateError::Transient(format!("Failed to insert event: {}", e)))?;
        }

        tx.commit()
            .await
            .map_err(|e| FacegateError::Transient(e.to_string()))?;
        Ok(())
    }

    async fn list_events(
        &self,
        campus_id: &str,
        kind: Option<EventKind>,
        limit: usize,
    ) -> Result<Vec<Event>, FacegateError> {
        let rows = sqlx::query(
            "SELECT event_id, kind, tenant_id, campus_id, subject_id, cluster_id, camera_id, ts, \
             similarity, bbox, detection_count, is_new \
             FROM campus_events \
             WHERE campus_id = $1 AND ($2::text IS NULL OR kind = $2) \
             ORDER BY ts DESC LIMIT $3",
        )
        .bind(campus_id)
        .bind(kind.map(|k| k.to_string()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| FacegateError::Transient(e.to_string()))?;

        rows.iter().map(row_to_event).collect()
    }

    async fn list_person_states(
        &self,
        campus_id: &str,
        status: Option<PresenceStatus>,
    ) -> Result<Vec<PersonStateRecord>, FacegateError> {
        let status_str = status.map(|s| match s {
            PresenceStatus::Inside => "inside",
            PresenceStatus::Outside => "outside",
        });

        let rows = sqlx::query(
            "SELECT tenant_id, subject_id, campus_id, kind, name, status, current_entry_at, \
             last_exit_at, entries_today, exits_today, detections_today, last_camera, last_seen_at \
             FROM person_status \
             WHERE campus_id = $1 AND ($2::text IS NULL OR status = $2)",
        )
        .bind(campus_id)
        .bind(status_str)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| FacegateError::Transient(e.to_string()))?;

        rows.iter().map(row_to_person_state).collect()
    }

    async fn upsert_analytics(&self, rows: &[AnalyticsRow]) -> Result<(), FacegateError> {
        if rows.is_empty() {
            return Ok(());
        }

        for row in rows {
            sqlx::query(
                "INSERT INTO campus_analytics \
                 (tenant_id, campus_id, date, inside, employees_inside, visitors_inside, \
                  entries, exits, unknown_detections, unique_unknowns, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
                 ON CONFLICT (campus_id, date) DO UPDATE SET \
                   tenant_id = EXCLUDED.tenant_id, \
                   inside = EXCLUDED.inside, \
                   employees_inside = EXCLUDED.employees_inside, \
                   visitors_inside = EXCLUDED.visitors_inside, \
                   entries = EXCLUDED.entries, \
                   exits = EXCLUDED.exits, \
                   unknown_detections = EXCLUDED.unknown_detections, \
                   unique_unknowns = EXCLUDED.unique_unknowns, \
                   updated_at = EXCLUDED.updated_at",
            )
            .bind(&row.tenant_id)
            .bind(&row.campus_id)
            .bind(row.date)
            .bind(row.inside as i64)
            .bind(row.employees_inside as i64)
            .bind(row.visitors_inside as i64)
            .bind(row.entries as i64)
            .bind(row.exits as i64)
            .bind(row.unknown_detections as i64)
            .bind(row.unique_unknowns as i64)
            .bind(row.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                FacegateError::Transient(format!("Failed to upsert analytics: {}", e))
            })?;
        }
        Ok(())
    }

    async fn list_analytics(
        &self,
        campus_id: &str,
        since: NaiveDate,
    ) -> Result<Vec<AnalyticsRow>, FacegateError> {
        let rows = sqlx::query(
            "SELECT tenant_id, campus_id, date, inside, employees_inside, visitors_inside, \
             entries, exits, unknown_detections, unique_unknowns, updated_at \
             FROM campus_analytics \
             WHERE campus_id = $1 AND date >= $2 \
             ORDER BY date DESC",
        )
        .bind(campus_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| FacegateError::Transient(e.to_string()))?;

        rows.iter().map(row_to_analytics).collect()
    }
}

#[async_trait]
impl BlobStore for PostgresStore {
    async fn put(
        &self,
        data: Vec<u8>,
        metadata: serde_json::Value,
    ) -> Result<String, FacegateError> {
        let handle = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO face_blobs (handle, data, metadata, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(handle)
        .bind(&data)
        .bind(&metadata)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| FacegateError::Transient(format!("Failed to store blob: {}", e)))?;

        Ok(handle.to_string())
    }

    async fn get(&self, handle: &str) -> Result<Vec<u8>, FacegateError> {
        let uuid = Uuid::parse_str(handle)
            .map_err(|_| FacegateError::validation("handle", "Malformed blob handle"))?;

        let row = sqlx::query("SELECT data FROM face_blobs WHERE handle = $1")
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| FacegateError::Transient(e.to_string()))?
            .ok_or_else(|| FacegateError::NotFound(format!("blob {}", handle)))?;

        row.try_get("data")
            .map_err(|e| FacegateError::Transient(e.to_string()))
    }

    async fn delete(&self, handle: &str) -> Result<(), FacegateError> {
        let uuid = Uuid::parse_str(handle)
            .map_err(|_| FacegateError::validation("handle", "Malformed blob handle"))?;

        sqlx::query("DELETE FROM face_blobs WHERE handle = $1")
            .bind(uuid)
            .execute(&self.pool)
            .await
            .map_err(|e| FacegateError::Transient(e.to_string()))?;

        Ok(())
    }
}

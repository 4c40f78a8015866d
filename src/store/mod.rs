/// Store abstraction layer
///
/// Domain records and the traits the core requires of its persistence:
/// a document store for subjects/jobs/presence (CatalogStore, PresenceStore)
/// and a large-object store for embedding and image blobs (BlobStore).
/// The trait abstraction enables multiple backends: PostgreSQL in production,
/// an in-memory backend for tests and dry runs.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::detect::BoundingBox;
use crate::errors::FacegateError;

pub mod memory;
pub mod postgres;

/// Employee or visitor. The core treats both uniformly; the distinction only
/// feeds per-kind occupancy counters and display metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectKind {
    Employee,
    Visitor,
}

impl fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubjectKind::Employee => write!(f, "employee"),
            SubjectKind::Visitor => write!(f, "visitor"),
        }
    }
}

impl FromStr for SubjectKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "employee" => Ok(SubjectKind::Employee),
            "visitor" => Ok(SubjectKind::Visitor),
            other => Err(format!("Unknown subject kind: {}", other)),
        }
    }
}

/// Administrative lifecycle of a subject. Only `Active` subjects are eligible
/// for matching; the other states are set by enrollment outcomes or admins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectStatus {
    Active,
    Inactive,
    /// Enrollment images disagreed with each other.
    Incomplete,
    /// Flagged as a duplicate of another subject; an external janitor deletes
    /// it after the configured dwell.
    PendingDuplicateRemoval,
}

impl fmt::Display for SubjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubjectStatus::Active => write!(f, "active"),
            SubjectStatus::Inactive => write!(f, "inactive"),
            SubjectStatus::Incomplete => write!(f, "incomplete"),
            SubjectStatus::PendingDuplicateRemoval => write!(f, "pending_duplicate_removal"),
        }
    }
}

impl FromStr for SubjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubjectStatus::Active),
            "inactive" => Ok(SubjectStatus::Inactive),
            "incomplete" => Ok(SubjectStatus::Incomplete),
            "pending_duplicate_removal" => Ok(SubjectStatus::PendingDuplicateRemoval),
            other => Err(format!("Unknown subject status: {}", other)),
        }
    }
}

/// The three enrollment views, processed in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pose {
    Center,
    Left,
    Right,
}

impl Pose {
    pub const ALL: [Pose; 3] = [Pose::Center, Pose::Left, Pose::Right];
}

impl fmt::Display for Pose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pose::Center => write!(f, "center"),
            Pose::Left => write!(f, "left"),
            Pose::Right => write!(f, "right"),
        }
    }
}

/// Blob handles for the enrollment image set. Immutable once written;
/// re-enrollment replaces the whole set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrollmentImages {
    pub center: Option<String>,
    pub left: Option<String>,
    pub right: Option<String>,
}

impl EnrollmentImages {
    pub fn get(&self, pose: Pose) -> Option<&str> {
        match pose {
            Pose::Center => self.center.as_deref(),
            Pose::Left => self.left.as_deref(),
            Pose::Right => self.right.as_deref(),
        }
    }
}

/// Job lifecycle. The same status set tracks the per-model embedding record on
/// the subject, so one terminal transition covers both documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Started,
    Done,
    Failed,
    Duplicate,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed | JobStatus::Duplicate)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Started => write!(f, "started"),
            JobStatus::Done => write!(f, "done"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Duplicate => write!(f, "duplicate"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "started" => Ok(JobStatus::Started),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            "duplicate" => Ok(JobStatus::Duplicate),
            other => Err(format!("Unknown job status: {}", other)),
        }
    }
}

/// Per-model embedding state attached to a subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    /// Blob handle of the serialized embedding. Present only when status is done.
    pub handle: Option<String>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Subject this enrollment duplicated, when status is duplicate.
    pub duplicate_of: Option<String>,
    pub error: Option<String>,
}

impl EmbeddingRecord {
    pub fn queued(now: DateTime<Utc>) -> Self {
        EmbeddingRecord {
            handle: None,
            status: JobStatus::Queued,
            created_at: now,
            started_at: None,
            finished_at: None,
            duplicate_of: None,
            error: None,
        }
    }
}

/// A person enrolled in the system. `(tenant_id, subject_id)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subject {
    pub tenant_id: String,
    pub subject_id: String,
    pub kind: SubjectKind,
    pub name: String,
    pub contact: Option<String>,
    pub status: SubjectStatus,
    pub blacklisted: bool,
    pub images: EnrollmentImages,
    /// model name -> embedding record
    pub embeddings: HashMap<String, EmbeddingRecord>,
    pub registered_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl Subject {
    /// Eligible for matching: active and not blacklisted.
    pub fn is_active(&self) -> bool {
        self.status == SubjectStatus::Active && !self.blacklisted
    }

    pub fn embedding_record(&self, model: &str) -> Option<&EmbeddingRecord> {
        self.embeddings.get(model)
    }
}

/// A durable embedding-training work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub tenant_id: String,
    pub subject_id: String,
    pub subject_kind: SubjectKind,
    pub model: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub heartbeat: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub retry_count: u32,
    pub error: Option<String>,
}

/// Where a camera sits in the entry/exit topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraRole {
    Entry,
    Exit,
}

impl FromStr for CameraRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "entry" => Ok(CameraRole::Entry),
            "exit" => Ok(CameraRole::Exit),
            other => Err(format!("Unknown camera role: {}", other)),
        }
    }
}

/// Static camera registration, loaded at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Camera {
    pub camera_id: String,
    pub tenant_id: String,
    pub campus_id: String,
    pub role: CameraRole,
    pub display_name: String,
}

/// Inside or outside the campus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Inside,
    Outside,
}

impl FromStr for PresenceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inside" => Ok(PresenceStatus::Inside),
            "outside" => Ok(PresenceStatus::Outside),
            other => Err(format!("Unknown presence status: {}", other)),
        }
    }
}

/// Persisted snapshot of a person's presence state. The in-memory engine is
/// authoritative; this record mirrors it with at most last-flush staleness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonStateRecord {
    pub tenant_id: String,
    pub subject_id: String,
    pub campus_id: String,
    pub kind: SubjectKind,
    pub name: String,
    pub status: PresenceStatus,
    pub current_entry_at: Option<DateTime<Utc>>,
    pub last_exit_at: Option<DateTime<Utc>>,
    pub entries_today: u64,
    pub exits_today: u64,
    pub detections_today: u64,
    pub last_camera: Option<String>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Entry,
    Exit,
    UnknownDetection,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Entry => write!(f, "entry"),
            EventKind::Exit => write!(f, "exit"),
            EventKind::UnknownDetection => write!(f, "unknown_detection"),
        }
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "entry" => Ok(EventKind::Entry),
            "exit" => Ok(EventKind::Exit),
            "unknown_detection" => Ok(EventKind::UnknownDetection),
            other => Err(format!("Unknown event kind: {}", other)),
        }
    }
}

/// Append-only campus event. Timestamps are detection timestamps, never emit
/// timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub kind: EventKind,
    pub tenant_id: String,
    pub campus_id: String,
    pub subject_id: Option<String>,
    pub cluster_id: Option<String>,
    pub camera_id: String,
    pub timestamp: DateTime<Utc>,
    pub similarity: Option<f32>,
    pub bbox: Option<BoundingBox>,
    /// Running total for unknown_detection events.
    pub detection_count: Option<u64>,
    /// True on the first sighting of a new unknown cluster.
    pub is_new: Option<bool>,
}

/// Per-(tenant, campus, day) aggregates, upsert-replaced on a timer.
/// Rebuildable from events and person states.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsRow {
    pub tenant_id: String,
    pub campus_id: String,
    pub date: NaiveDate,
    pub inside: u64,
    pub employees_inside: u64,
    pub visitors_inside: u64,
    pub entries: u64,
    pub exits: u64,
    pub unknown_detections: u64,
    pub unique_unknowns: u64,
    pub updated_at: DateTime<Utc>,
}

/// Document-store operations the enrollment side requires: subjects, their
/// per-model embedding records, and the leased job queue.
///
/// All implementations must be Send + Sync to support concurrent access.
/// `lease_jobs` is the only inter-process contention point and MUST be atomic
/// at the store layer: two workers leasing concurrently never receive the
/// same job.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Insert or replace a subject document.
    async fn upsert_subject(&self, subject: &Subject) -> Result<(), FacegateError>;

    /// Fetch a subject. NotFound if absent.
    async fn get_subject(&self, tenant_id: &str, subject_id: &str)
        -> Result<Subject, FacegateError>;

    /// Subjects eligible for matching under `model`: active, not blacklisted,
    /// record status done. With a watermark, only subjects whose
    /// `last_updated` is at or after it.
    async fn list_active_subjects(
        &self,
        tenant_id: &str,
        model: &str,
        updated_since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Subject>, FacegateError>;

    /// Subject ids that must be dropped from matching (inactive or blacklisted).
    async fn list_ineligible_subject_ids(&self, tenant_id: &str)
        -> Result<Vec<String>, FacegateError>;

    /// All tenant ids present in the subject collection.
    async fn list_tenant_ids(&self) -> Result<Vec<String>, FacegateError>;

    /// (subject_id, blob handle) for every done embedding in the tenant under
    /// `model`. Feeds the duplicate scan.
    async fn list_done_embedding_handles(
        &self,
        tenant_id: &str,
        model: &str,
    ) -> Result<Vec<(String, String)>, FacegateError>;

    /// Replace the subject's embedding record for `model` and bump last_updated.
    async fn set_embedding_record(
        &self,
        tenant_id: &str,
        subject_id: &str,
        model: &str,
        record: EmbeddingRecord,
    ) -> Result<(), FacegateError>;

    /// Update the subject's administrative status and bump last_updated.
    async fn set_subject_status(
        &self,
        tenant_id: &str,
        subject_id: &str,
        status: SubjectStatus,
    ) -> Result<(), FacegateError>;

    /// Insert a new job document.
    async fn insert_job(&self, job: &Job) -> Result<(), FacegateError>;

    /// Most recently created job for (tenant, subject, model), if any.
    async fn latest_job(
        &self,
        tenant_id: &str,
        subject_id: &str,
        model: &str,
    ) -> Result<Option<Job>, FacegateError>;

    /// Fetch a job by id. NotFound if absent.
    async fn get_job(&self, job_id: &str) -> Result<Job, FacegateError>;

    /// Atomically select up to `limit` queued jobs for `model` in created_at
    /// order, mark them started with worker/lease stamps, and return them.
    async fn lease_jobs(
        &self,
        worker_id: &str,
        model: &str,
        limit: usize,
    ) -> Result<Vec<Job>, FacegateError>;

    /// Refresh the lease heartbeat. No-op unless the job is started.
    async fn heartbeat_job(&self, job_id: &str) -> Result<(), FacegateError>;

    /// Transition started -> terminal. Conflict if the job is not started,
    /// so a job reaches a terminal state exactly once.
    async fn complete_job(
        &self,
        job_id: &str,
        terminal: JobStatus,
        error: Option<String>,
    ) -> Result<(), FacegateError>;

    /// Transition started -> queued with retry_count incremented (recovery and
    /// transient-failure requeue). Conflict if the job is not started.
    async fn requeue_job(&self, job_id: &str, error: Option<String>)
        -> Result<(), FacegateError>;

    /// Started jobs whose heartbeat is older than the cutoff.
    async fn list_stuck_jobs(
        &self,
        heartbeat_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, FacegateError>;
}

/// Persistence for the presence engine: batched state upserts, append-only
/// events, and daily analytics.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Bulk upsert keyed by (subject_id, campus_id). Last write wins.
    async fn upsert_person_states(
        &self,
        states: &[PersonStateRecord],
    ) -> Result<(), FacegateError>;

    /// Every persisted person state (startup reload).
    async fn load_person_states(&self) -> Result<Vec<PersonStateRecord>, FacegateError>;

    /// Append events in order. Event documents are immutable.
    async fn append_events(&self, events: &[Event]) -> Result<(), FacegateError>;

    /// Recent events for a campus, newest first, optionally filtered by kind.
    async fn list_events(
        &self,
        campus_id: &str,
        kind: Option<EventKind>,
        limit: usize,
    ) -> Result<Vec<Event>, FacegateError>;

    /// Person states for a campus, optionally filtered by presence status.
    async fn list_person_states(
        &self,
        campus_id: &str,
        status: Option<PresenceStatus>,
    ) -> Result<Vec<PersonStateRecord>, FacegateError>;

    /// Upsert daily aggregates keyed by (campus_id, date).
    async fn upsert_analytics(&self, rows: &[AnalyticsRow]) -> Result<(), FacegateError>;

    /// Daily aggregates for a campus at or after `since`, newest first.
    async fn list_analytics(
        &self,
        campus_id: &str,
        since: NaiveDate,
    ) -> Result<Vec<AnalyticsRow>, FacegateError>;
}

/// Large-object store addressed by opaque handles.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes with metadata, returning a new opaque handle.
    async fn put(
        &self,
        data: Vec<u8>,
        metadata: serde_json::Value,
    ) -> Result<String, FacegateError>;

    /// Fetch bytes by handle. NotFound if absent.
    async fn get(&self, handle: &str) -> Result<Vec<u8>, FacegateError>;

    /// Delete by handle. Deleting a missing handle is not an error.
    async fn delete(&self, handle: &str) -> Result<(), FacegateError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_round_trip() {
        for status in [
            JobStatus::Queued,
            JobStatus::Started,
            JobStatus::Done,
            JobStatus::Failed,
            JobStatus::Duplicate,
        ] {
            assert_eq!(status.to_string().parse::<JobStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Started.is_terminal());
        assert!(JobStatus::Done.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Duplicate.is_terminal());
    }

    #[test]
    fn test_pose_order_is_center_left_right() {
        assert_eq!(Pose::ALL, [Pose::Center, Pose::Left, Pose::Right]);
    }

    #[test]
    fn test_subject_active_excludes_blacklisted() {
        let mut subject = Subject {
            tenant_id: "t1".to_string(),
            subject_id: "s1".to_string(),
            kind: SubjectKind::Employee,
            name: "Avery".to_string(),
            contact: None,
            status: SubjectStatus::Active,
            blacklisted: false,
            images: EnrollmentImages::default(),
            embeddings: HashMap::new(),
            registered_at: Utc::now(),
            last_updated: Utc::now(),
        };
        assert!(subject.is_active());
        subject.blacklisted = true;
        assert!(!subject.is_active());
        subject.blacklisted = false;
        subject.status = SubjectStatus::Incomplete;
        assert!(!subject.is_active());
    }
}

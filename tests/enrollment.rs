//! End-to-end enrollment scenarios: happy path, multi-person rejection,
//! duplicate rejection, lease exclusivity, and terminal-transition invariants,
//! all against the in-memory store backend with a scripted detector.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use facegate::catalog::EmbeddingCatalog;
use facegate::config::{CatalogConfig, WorkerConfig};
use facegate::detect::{BoundingBox, Face, ScriptedDetector};
use facegate::embedding::Embedding;
use facegate::errors::FacegateError;
use facegate::jobs::{EnqueueOutcome, JobQueue};
use facegate::store::memory::MemoryStore;
use facegate::store::{
    BlobStore, CatalogStore, EnrollmentImages, JobStatus, Subject, SubjectKind, SubjectStatus,
};
use facegate::worker::TrainingWorker;

fn unit(values: Vec<f32>) -> Embedding {
    Embedding::new(values).normalized()
}

fn face(embedding: Embedding) -> Face {
    Face {
        bbox: BoundingBox {
            x1: 0.0,
            y1: 0.0,
            x2: 100.0,
            y2: 100.0,
        },
        det_score: 0.95,
        embedding,
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    queue: Arc<JobQueue>,
    catalog: Arc<EmbeddingCatalog>,
    config: WorkerConfig,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let config = WorkerConfig::default();
        let queue = Arc::new(JobQueue::new(store.clone(), config.max_retries));
        let catalog = Arc::new(EmbeddingCatalog::new(
            store.clone(),
            store.clone(),
            &config.model_name,
            CatalogConfig::default(),
        ));
        Harness {
            store,
            queue,
            catalog,
            config,
        }
    }

    /// Create a subject with a full three-pose image set and a queued job.
    async fn enroll(&self, subject_id: &str) -> Subject {
        let center = self.store.put(vec![1], serde_json::json!({})).await.unwrap();
        let left = self.store.put(vec![2], serde_json::json!({})).await.unwrap();
        let right = self.store.put(vec![3], serde_json::json!({})).await.unwrap();

        let now = Utc::now();
        let subject = Subject {
            tenant_id: "T1".to_string(),
            subject_id: subject_id.to_string(),
            kind: SubjectKind::Employee,
            name: format!("subject {}", subject_id),
            contact: None,
            status: SubjectStatus::Active,
            blacklisted: false,
            images: EnrollmentImages {
                center: Some(center),
                left: Some(left),
                right: Some(right),
            },
            embeddings: HashMap::new(),
            registered_at: now,
            last_updated: now,
        };
        self.store.upsert_subject(&subject).await.unwrap();

        let outcome = self
            .queue
            .enqueue(&subject, &self.config.model_name, &self.config.allowed_models)
            .await
            .unwrap();
        assert!(outcome.is_created());
        subject
    }

    /// Lease one job and run it through a worker backed by the given
    /// pose-detection script.
    async fn run_one_job(&self, script: Vec<Vec<Face>>) {
        let detector = Box::new(ScriptedDetector::new(&self.config.model_name, script));
        let worker = Arc::new(TrainingWorker::new(
            "test_worker",
            self.config.clone(),
            self.queue.clone(),
            self.store.clone(),
            self.store.clone(),
            self.catalog.clone(),
            detector,
        ));
        let jobs = self
            .queue
            .lease("test_worker", &self.config.model_name, 1)
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);
        worker.process_job(jobs[0].clone()).await;
    }
}

/// Three slightly different views of one face.
fn same_person_poses() -> Vec<Embedding> {
    vec![
        unit(vec![1.0, 0.05, 0.0]),
        unit(vec![0.98, 0.0, 0.1]),
        unit(vec![1.0, -0.05, 0.05]),
    ]
}

#[tokio::test]
async fn happy_path_enrollment_produces_done_embedding() {
    let h = Harness::new();
    let subject = h.enroll("S1").await;

    let poses = same_person_poses();
    h.run_one_job(poses.iter().cloned().map(|e| vec![face(e)]).collect())
        .await;

    // Job reached done through exactly one lease->complete
    let job = h
        .store
        .latest_job("T1", "S1", "buffalo_l")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, JobStatus::Done);
    assert!(job.finished_at.is_some());

    // Subject record is done with a blob handle attached
    let stored = h.store.get_subject("T1", "S1").await.unwrap();
    let record = stored.embedding_record("buffalo_l").unwrap();
    assert_eq!(record.status, JobStatus::Done);
    let handle = record.handle.as_ref().expect("done record has a handle");

    // Blob round-trip is bit-exact and equals normalize(mean(poses))
    let decoded = h.catalog.fetch_embedding(handle).await.unwrap();
    let expected = Embedding::mean(&poses).unwrap().normalized();
    for (a, b) in decoded.as_slice().iter().zip(expected.as_slice()) {
        assert_eq!(a.to_bits(), b.to_bits());
    }

    // Catalog size for the tenant increases by one
    h.catalog.initial_load().await.unwrap();
    assert_eq!(h.catalog.list_active("T1").len(), 1);
    assert_eq!(subject.subject_id, "S1");
}

#[tokio::test]
async fn second_terminal_transition_is_rejected() {
    let h = Harness::new();
    h.enroll("S1").await;
    h.run_one_job(same_person_poses().into_iter().map(|e| vec![face(e)]).collect())
        .await;

    let job = h
        .store
        .latest_job("T1", "S1", "buffalo_l")
        .await
        .unwrap()
        .unwrap();
    let err = h
        .queue
        .complete(&job.job_id, JobStatus::Failed, None)
        .await
        .unwrap_err();
    assert!(matches!(err, FacegateError::Conflict(_)));
}

#[tokio::test]
async fn multi_person_enrollment_fails_naming_the_poses() {
    let h = Harness::new();
    h.enroll("S1").await;

    // Center and left are person A; right is person B (pairwise cosine ~ 0)
    let person_a = unit(vec![1.0, 0.05, 0.0]);
    let person_a_again = unit(vec![0.99, 0.0, 0.05]);
    let person_b = unit(vec![0.0, 1.0, 0.0]);
    h.run_one_job(vec![
        vec![face(person_a)],
        vec![face(person_a_again)],
        vec![face(person_b)],
    ])
    .await;

    let job = h
        .store
        .latest_job("T1", "S1", "buffalo_l")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.expect("failure carries an error");
    assert!(error.contains("right"), "error should name the right pose: {}", error);
    assert!(error.contains("center"), "error should name the center pose: {}", error);

    let stored = h.store.get_subject("T1", "S1").await.unwrap();
    assert_eq!(stored.status, SubjectStatus::Incomplete);
    let record = stored.embedding_record("buffalo_l").unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert!(record.handle.is_none(), "no blob is attached on rejection");
}

#[tokio::test]
async fn no_faces_in_any_image_fails_terminally() {
    let h = Harness::new();
    h.enroll("S1").await;
    h.run_one_job(vec![vec![], vec![], vec![]]).await;

    let job = h
        .store
        .latest_job("T1", "S1", "buffalo_l")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 0, "face-content failures are not retried");
    assert!(job.error.unwrap().to_lowercase().contains("no faces"));
}

#[tokio::test]
async fn multi_face_frame_enrolls_the_largest_face() {
    let h = Harness::new();
    h.enroll("S1").await;

    let wanted = unit(vec![1.0, 0.0, 0.0]);
    let bystander = unit(vec![0.0, 1.0, 0.0]);
    let small_face = Face {
        bbox: BoundingBox {
            x1: 0.0,
            y1: 0.0,
            x2: 20.0,
            y2: 20.0,
        },
        det_score: 0.99,
        embedding: bystander,
    };
    // The enrollee stands closer to the camera in every pose
    let script = (0..3)
        .map(|_| vec![small_face.clone(), face(wanted.clone())])
        .collect();
    h.run_one_job(script).await;

    let stored = h.store.get_subject("T1", "S1").await.unwrap();
    let record = stored.embedding_record("buffalo_l").unwrap();
    assert_eq!(record.status, JobStatus::Done);

    let decoded = h
        .catalog
        .fetch_embedding(record.handle.as_ref().unwrap())
        .await
        .unwrap();
    assert!(decoded.dot(&unit(vec![1.0, 0.0, 0.0])) > 0.99);
}

#[tokio::test]
async fn duplicate_enrollment_is_flagged_not_deleted() {
    let h = Harness::new();
    h.enroll("S1").await;
    h.run_one_job(same_person_poses().into_iter().map(|e| vec![face(e)]).collect())
        .await;

    // S2 enrolls with the same face (cosine ~ 0.95 against S1's aggregate)
    h.enroll("S2").await;
    let near_identical = vec![
        unit(vec![1.0, 0.06, 0.0]),
        unit(vec![0.99, 0.04, 0.02]),
        unit(vec![1.0, 0.02, -0.02]),
    ];
    h.run_one_job(near_identical.into_iter().map(|e| vec![face(e)]).collect())
        .await;

    let job = h
        .store
        .latest_job("T1", "S2", "buffalo_l")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, JobStatus::Duplicate);

    let stored = h.store.get_subject("T1", "S2").await.unwrap();
    assert_eq!(stored.status, SubjectStatus::PendingDuplicateRemoval);
    let record = stored.embedding_record("buffalo_l").unwrap();
    assert_eq!(record.status, JobStatus::Duplicate);
    assert_eq!(record.duplicate_of.as_deref(), Some("S1"));
    assert!(record.handle.is_none());

    // S2 still exists for administrative inspection
    assert!(h.store.get_subject("T1", "S2").await.is_ok());

    // At most one done record exists for the face
    let handles = h
        .store
        .list_done_embedding_handles("T1", "buffalo_l")
        .await
        .unwrap();
    assert_eq!(handles.len(), 1);
    assert_eq!(handles[0].0, "S1");
}

#[tokio::test]
async fn re_enqueue_after_done_is_a_no_op() {
    let h = Harness::new();
    h.enroll("S1").await;
    h.run_one_job(same_person_poses().into_iter().map(|e| vec![face(e)]).collect())
        .await;

    let stored = h.store.get_subject("T1", "S1").await.unwrap();
    let outcome = h
        .queue
        .enqueue(&stored, "buffalo_l", &h.config.allowed_models)
        .await
        .unwrap();
    assert!(matches!(outcome, EnqueueOutcome::AlreadyDone));

    // Still exactly one job in the store for the pair
    let job = h
        .store
        .latest_job("T1", "S1", "buffalo_l")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, JobStatus::Done);
}

#[tokio::test]
async fn concurrent_lease_of_one_job_is_exclusive() {
    let h = Harness::new();
    h.enroll("S1").await;

    let queue_a = h.queue.clone();
    let queue_b = h.queue.clone();
    let (a, b) = tokio::join!(
        queue_a.lease("worker_a", "buffalo_l", 5),
        queue_b.lease("worker_b", "buffalo_l", 5),
    );
    let a = a.unwrap();
    let b = b.unwrap();

    assert_eq!(a.len() + b.len(), 1, "exactly one worker receives the job");
    let winner = a.first().or_else(|| b.first()).unwrap();
    assert_eq!(winner.status, JobStatus::Started);
    assert!(winner.heartbeat.is_some());
}

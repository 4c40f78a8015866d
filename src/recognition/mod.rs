/// Recognition pipeline
///
/// Per camera, three stages in their own tasks: capture -> recognize -> emit,
/// joined by bounded channels (2 and 10). When a channel is full the producer
/// drops its newest frame, so a slow detector sheds load instead of building
/// latency. The recognize stage skips every other frame, matches faces
/// against the tenant's catalog snapshot, and classifies scores into
/// identified / ambiguous / unknown bands. A single bad frame never aborts
/// the pipeline; read failures restart the source until the consecutive
/// failure cap is hit, after which the camera unit exits and is eligible for
/// external restart.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::catalog::{EmbeddingCatalog, TenantSnapshot};
use crate::config::RecognitionConfig;
use crate::detect::{BoundingBox, Face, FaceDetector, Frame};
use crate::embedding::Embedding;
use crate::errors::FacegateError;
use crate::presence::PresenceEngine;
use crate::store::{Camera, SubjectKind};

/// capture -> recognize backlog. Most-recent-frame policy: tiny on purpose.
const FRAME_CHANNEL_CAPACITY: usize = 2;
/// recognize -> emit backlog.
const DETECTION_CHANNEL_CAPACITY: usize = 10;
/// How often each camera logs its frame count and campus counters.
const STATUS_LOG_INTERVAL_SECS: u64 = 30;

/// Capture parameters requested from the video source.
#[derive(Debug, Clone, Copy)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Driver-side frame buffer depth.
    pub buffer_frames: u32,
}

impl CaptureSettings {
    pub fn from_config(config: &RecognitionConfig) -> Self {
        CaptureSettings {
            width: config.capture_width,
            height: config.capture_height,
            fps: config.capture_fps,
            buffer_frames: 1,
        }
    }
}

/// A video source the integrator's backend provides (RTSP, V4L2, files).
/// The core only opens it, reads frames, and reopens it after failures.
#[async_trait]
pub trait VideoSource: Send {
    /// Open (or reopen) the source with the requested capture settings.
    async fn open(&mut self, settings: &CaptureSettings) -> Result<(), FacegateError>;

    /// Read the next frame. Blocks (cooperatively) until one is available.
    async fn read(&mut self) -> Result<Frame, FacegateError>;
}

/// Video source stand-in for cameras without a linked capture backend.
/// Opens cleanly and never yields a frame, so the pipeline idles until
/// shutdown instead of tripping the read-failure cap.
pub struct IdleSource;

#[async_trait]
impl VideoSource for IdleSource {
    async fn open(&mut self, _settings: &CaptureSettings) -> Result<(), FacegateError> {
        Ok(())
    }

    async fn read(&mut self) -> Result<Frame, FacegateError> {
        std::future::pending::<()>().await;
        unreachable!("pending future never resolves")
    }
}

/// What the recognize stage forwards to the presence engine.
#[derive(Debug, Clone)]
pub enum Detection {
    Identified {
        subject_id: String,
        kind: SubjectKind,
        name: String,
        camera_id: String,
        timestamp: chrono::DateTime<chrono::Utc>,
        score: f32,
    },
    Unknown {
        embedding: Embedding,
        bbox: BoundingBox,
        camera_id: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

/// Optional sink for rendering detections (preview windows, debug overlays).
/// Rendering decisions are not part of the core contract.
pub trait DisplaySink: Send {
    fn render(&mut self, detection: &Detection);
}

/// Classify one detected face against a catalog snapshot.
///
/// - score >= recognition_threshold: identified
/// - score < unknown_threshold: unknown (with the probe embedding)
/// - in between: ambiguous, emit nothing
/// An empty snapshot emits nothing; without a catalog there is no score to
/// band against.
pub fn classify_face(
    face: &Face,
    snapshot: &TenantSnapshot,
    camera_id: &str,
    timestamp: chrono::DateTime<chrono::Utc>,
    config: &RecognitionConfig,
) -> Option<Detection> {
    let probe = face.embedding.normalized();
    let (entry, score) = snapshot.best_match(&probe)?;

    if score >= config.recognition_threshold {
        Some(Detection::Identified {
            subject_id: entry.subject_id.clone(),
            kind: entry.kind,
            name: entry.name.clone(),
            camera_id: camera_id.to_string(),
            timestamp,
            score,
        })
    } else if score < config.unknown_threshold {
        Some(Detection::Unknown {
            embedding: probe,
            bbox: face.bbox,
            camera_id: camera_id.to_string(),
            timestamp,
        })
    } else {
        // Ambiguous zone
        None
    }
}

/// Handles for one camera's three stages.
pub struct CameraPipeline {
    pub camera_id: String,
    pub handles: Vec<tokio::task::JoinHandle<()>>,
}

impl CameraPipeline {
    /// Wait for every stage to finish.
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Start the capture/recognize/emit tasks for one camera.
pub fn spawn_camera(
    camera: Camera,
    mut source: Box<dyn VideoSource>,
    mut detector: Box<dyn FaceDetector>,
    catalog: Arc<EmbeddingCatalog>,
    engine: Arc<PresenceEngine>,
    mut display: Option<Box<dyn DisplaySink>>,
    config: RecognitionConfig,
    shutdown: CancellationToken,
) -> CameraPipeline {
    let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(FRAME_CHANNEL_CAPACITY);
    let (detection_tx, mut detection_rx) =
        mpsc::channel::<Detection>(DETECTION_CHANNEL_CAPACITY);

    let camera_id = camera.camera_id.clone();
    let mut handles = Vec::with_capacity(3);

    // Capture stage
    {
        let camera_id = camera.camera_id.clone();
        let settings = CaptureSettings::from_config(&config);
        let max_failures = config.max_read_failures;
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = source.open(&settings).await {
                tracing::error!(camera_id = %camera_id, error = %e, "Failed to open video source");
                return;
            }
            tracing::info!(camera_id = %camera_id, "Camera capture started");

            let mut consecutive_failures: u32 = 0;
            loop {
                let frame = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    frame = source.read() => frame,
                };
                match frame {
                    Ok(frame) => {
                        consecutive_failures = 0;
                        // Drop-newest: a full channel discards this frame
                        let _ = frame_tx.try_send(frame);
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        if consecutive_failures >= max_failures {
                            tracing::error!(
                                camera_id = %camera_id,
                                failures = consecutive_failures,
                                "Too many consecutive read failures — camera unit exiting"
                            );
                            break;
                        }
                        tracing::warn!(
                            camera_id = %camera_id,
                            failures = consecutive_failures,
                            error = %e,
                            "Frame read failed — restarting source"
                        );
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
                        }
                        if let Err(reopen) = source.open(&settings).await {
                            tracing::warn!(camera_id = %camera_id, error = %reopen, "Source restart failed");
                        }
                    }
                }
            }
            tracing::info!(camera_id = %camera_id, "Camera capture stopped");
        }));
    }

    // Recognize stage: detector is invoked serially on this task
    {
        let camera_id = camera.camera_id.clone();
        let tenant_id = camera.tenant_id.clone();
        let campus_id = camera.campus_id.clone();
        let engine = Arc::clone(&engine);
        let config = config.clone();
        handles.push(tokio::spawn(async move {
            let mut frame_count: u64 = 0;
            let mut last_status_log = tokio::time::Instant::now();
            while let Some(frame) = frame_rx.recv().await {
                frame_count += 1;

                if last_status_log.elapsed().as_secs() >= STATUS_LOG_INTERVAL_SECS {
                    if let Some(status) = engine.campus_status(&campus_id) {
                        tracing::debug!(
                            camera_id = %camera_id,
                            frames = frame_count,
                            campus_id = %campus_id,
                            inside = status.current_inside,
                            entries = status.total_entries_today,
                            exits = status.total_exits_today,
                            "Camera status"
                        );
                    }
                    last_status_log = tokio::time::Instant::now();
                }

                // Halve CPU load
                if frame_count % config.frame_skip != 0 {
                    continue;
                }

                let snapshot = match catalog.snapshot(&tenant_id) {
                    Some(s) if !s.is_empty() => s,
                    _ => continue,
                };

                if let Err(e) = detector.ensure_ready().await {
                    tracing::error!(camera_id = %camera_id, error = %e, "Detector initialization failed");
                    continue;
                }
                let faces = match detector.detect(&frame).await {
                    Ok(faces) => faces,
                    Err(e) => {
                        // One bad frame never aborts the pipeline
                        tracing::warn!(camera_id = %camera_id, error = %e, "Detection failed — dropping frame");
                        continue;
                    }
                };

                for face in &faces {
                    if let Some(detection) =
                        classify_face(face, &snapshot, &camera_id, frame.captured_at, &config)
                    {
                        let _ = detection_tx.try_send(detection);
                    }
                }
            }
            tracing::debug!(camera_id = %camera_id, "Recognize stage stopped");
        }));
    }

    // Emit stage
    {
        let camera_id = camera.camera_id.clone();
        handles.push(tokio::spawn(async move {
            while let Some(detection) = detection_rx.recv().await {
                if let Some(sink) = display.as_mut() {
                    sink.render(&detection);
                }
                match detection {
                    Detection::Identified {
                        subject_id,
                        kind,
                        name,
                        camera_id,
                        timestamp,
                        score,
                    } => {
                        engine.process_identified(
                            &subject_id,
                            kind,
                            &name,
                            &camera_id,
                            timestamp,
                            score,
                        );
                    }
                    Detection::Unknown {
                        embedding,
                        bbox,
                        camera_id,
                        timestamp,
                    } => {
                        engine.process_unknown(&camera_id, timestamp, embedding, Some(bbox));
                    }
                }
            }
            tracing::debug!(camera_id = %camera_id, "Emit stage stopped");
        }));
    }

    CameraPipeline { camera_id, handles }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogEntry;
    use crate::config::PresenceConfig;
    use crate::detect::ScriptedDetector;
    use crate::store::memory::MemoryStore;
    use crate::store::CameraRole;
    use crate::store::CatalogStore;
    use chrono::Utc;
    use std::collections::HashMap;

    fn unit(values: Vec<f32>) -> Embedding {
        Embedding::new(values).normalized()
    }

    fn snapshot_with(entries: Vec<(&str, Embedding)>) -> TenantSnapshot {
        let mut map = HashMap::new();
        for (id, embedding) in entries {
            map.insert(
                id.to_string(),
                CatalogEntry {
                    subject_id: id.to_string(),
                    name: format!("person {}", id),
                    kind: SubjectKind::Employee,
                    embedding,
                },
            );
        }
        TenantSnapshot { entries: map }
    }

    fn face_with(embedding: Embedding) -> Face {
        Face {
            bbox: BoundingBox {
                x1: 0.0,
                y1: 0.0,
                x2: 10.0,
                y2: 10.0,
            },
            det_score: 0.9,
            embedding,
        }
    }

    #[test]
    fn test_classify_identified_above_threshold() {
        let config = RecognitionConfig::default();
        let snapshot = snapshot_with(vec![("s1", unit(vec![1.0, 0.0]))]);
        let face = face_with(unit(vec![0.99, 0.05]));
        let detection =
            classify_face(&face, &snapshot, "cam1", Utc::now(), &config).unwrap();
        match detection {
            Detection::Identified { subject_id, score, .. } => {
                assert_eq!(subject_id, "s1");
                assert!(score >= config.recognition_threshold);
            }
            other => panic!("expected identified, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_unknown_below_floor() {
        let config = RecognitionConfig::default();
        let snapshot = snapshot_with(vec![("s1", unit(vec![1.0, 0.0]))]);
        // Orthogonal probe: score 0.0 < 0.35
        let face = face_with(unit(vec![0.0, 1.0]));
        let detection =
            classify_face(&face, &snapshot, "cam1", Utc::now(), &config).unwrap();
        assert!(matches!(detection, Detection::Unknown { .. }));
    }

    #[test]
    fn test_classify_ambiguous_band_emits_nothing() {
        let config = RecognitionConfig::default();
        let snapshot = snapshot_with(vec![("s1", unit(vec![1.0, 0.0]))]);
        // cos = 0.40: between unknown (0.35) and recognition (0.45)
        let probe = unit(vec![0.40, (1.0f32 - 0.40 * 0.40).sqrt()]);
        let face = face_with(probe);
        assert!(classify_face(&face, &snapshot, "cam1", Utc::now(), &config).is_none());
    }

    #[test]
    fn test_classify_empty_snapshot_emits_nothing() {
        let config = RecognitionConfig::default();
        let snapshot = TenantSnapshot::default();
        let face = face_with(unit(vec![1.0, 0.0]));
        assert!(classify_face(&face, &snapshot, "cam1", Utc::now(), &config).is_none());
    }

    /// Scripted source: yields the given frames, then fails every read.
    struct ScriptedSource {
        frames: std::collections::VecDeque<Frame>,
        opened: bool,
    }

    #[async_trait]
    impl VideoSource for ScriptedSource {
        async fn open(&mut self, _settings: &CaptureSettings) -> Result<(), FacegateError> {
            self.opened = true;
            Ok(())
        }

        async fn read(&mut self) -> Result<Frame, FacegateError> {
            if !self.opened {
                return Err(FacegateError::Transient("source not open".to_string()));
            }
            match self.frames.pop_front() {
                Some(frame) => Ok(frame),
                None => Err(FacegateError::Transient("stream ended".to_string())),
            }
        }
    }

    #[tokio::test]
    async fn test_pipeline_end_to_end_with_scripted_camera() {
        let store = Arc::new(MemoryStore::new());
        let camera = Camera {
            camera_id: "cam1".to_string(),
            tenant_id: "t1".to_string(),
            campus_id: "campusA".to_string(),
            role: CameraRole::Entry,
            display_name: "Entry".to_string(),
        };
        let engine = Arc::new(PresenceEngine::new(
            store.clone(),
            PresenceConfig::default(),
            vec![camera.clone()],
        ));

        // Catalog with one enrolled identity
        let identity = unit(vec![1.0, 0.0, 0.0]);
        let catalog = Arc::new(EmbeddingCatalog::new(
            store.clone(),
            store.clone(),
            "buffalo_l",
            crate::config::CatalogConfig::default(),
        ));
        {
            use crate::store::{EnrollmentImages, Subject, SubjectStatus};
            let now = Utc::now();
            let subject = Subject {
                tenant_id: "t1".to_string(),
                subject_id: "s1".to_string(),
                kind: SubjectKind::Employee,
                name: "Avery".to_string(),
                contact: None,
                status: SubjectStatus::Active,
                blacklisted: false,
                images: EnrollmentImages::default(),
                embeddings: HashMap::new(),
                registered_at: now,
                last_updated: now,
            };
            store.upsert_subject(&subject).await.unwrap();
            catalog
                .publish("t1", "s1", &identity, now, Some(now))
                .await
                .unwrap();
            catalog.initial_load().await.unwrap();
        }

        // Four frames; frame_skip=2 processes frames 2 and 4
        let frames: Vec<Frame> = (0..4)
            .map(|_| Frame::from_encoded(vec![0u8], Utc::now()))
            .collect();
        let source = Box::new(ScriptedSource {
            frames: frames.into(),
            opened: false,
        });
        // Script detections for the two processed frames
        let probe = unit(vec![0.99, 0.05, 0.0]);
        let detector = Box::new(ScriptedDetector::new(
            "buffalo_l",
            vec![vec![face_with(probe.clone())], vec![face_with(probe)]],
        ));

        let mut config = RecognitionConfig::default();
        config.max_read_failures = 2;
        let shutdown = CancellationToken::new();
        let pipeline = spawn_camera(
            camera,
            source,
            detector,
            catalog,
            Arc::clone(&engine),
            None,
            config,
            shutdown.clone(),
        );

        // Capture exhausts its frames and exits on read failures; the other
        // stages drain and close behind it.
        tokio::time::timeout(std::time::Duration::from_secs(10), pipeline.join())
            .await
            .expect("pipeline did not drain");

        let person = engine.person_status("s1").expect("subject never detected");
        assert!(person.detections_today >= 1);
        assert_eq!(person.last_camera.as_deref(), Some("cam1"));
    }
}

/// Face detector abstraction
///
/// The detection model is an external dependency consumed as a black box:
/// `detect(frame) -> [{bbox, det_score, embedding}]`. Implementations wrap
/// whatever inference runtime the deployment ships; the core never looks
/// inside a frame. Model instances are not assumed re-entrant, so each camera
/// and worker owns its own detector and calls it serially.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::embedding::Embedding;
use crate::errors::FacegateError;

/// A captured or stored image, opaque to the core.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    /// Pixel dimensions when known (capture sets them; stored enrollment
    /// images may not carry them).
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn from_encoded(data: Vec<u8>, captured_at: DateTime<Utc>) -> Self {
        Frame {
            data,
            width: None,
            height: None,
            captured_at,
        }
    }
}

/// Axis-aligned face bounding box: [x1, y1, x2, y2].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }
}

/// One detected face.
#[derive(Debug, Clone)]
pub struct Face {
    pub bbox: BoundingBox,
    pub det_score: f32,
    /// L2-normalizable embedding of model-specific dimension.
    pub embedding: Embedding,
}

/// Black-box face detection model.
///
/// Implementations must be Send so camera tasks can own them. Initialization
/// is lazy and idempotent: `ensure_ready` is called before the first frame and
/// may be called again after a restart.
#[async_trait]
pub trait FaceDetector: Send {
    /// Model identifier (e.g., "buffalo_l").
    fn model_name(&self) -> &str;

    /// Initialize the underlying model if not already initialized.
    async fn ensure_ready(&mut self) -> Result<(), FacegateError>;

    /// Detect faces in a frame. Returns an empty vec when no face is present.
    async fn detect(&mut self, frame: &Frame) -> Result<Vec<Face>, FacegateError>;
}

/// Pick the face to enroll when a frame contains several people: largest
/// bounding-box area wins, detector score breaks ties.
pub fn select_primary_face(faces: Vec<Face>) -> Option<Face> {
    faces.into_iter().max_by(|a, b| {
        a.bbox
            .area()
            .partial_cmp(&b.bbox.area())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                a.det_score
                    .partial_cmp(&b.det_score)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
    })
}

/// Detector stand-in for builds without an inference runtime linked. Reports
/// no faces in every frame; deployments swap in a real model through the
/// library API.
pub struct NullDetector {
    model: String,
    warned: bool,
}

impl NullDetector {
    pub fn new(model: &str) -> Self {
        NullDetector {
            model: model.to_string(),
            warned: false,
        }
    }
}

#[async_trait]
impl FaceDetector for NullDetector {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn ensure_ready(&mut self) -> Result<(), FacegateError> {
        if !self.warned {
            tracing::warn!(
                model = %self.model,
                "Null detector backend active — no faces will be detected"
            );
            self.warned = true;
        }
        Ok(())
    }

    async fn detect(&mut self, _frame: &Frame) -> Result<Vec<Face>, FacegateError> {
        Ok(Vec::new())
    }
}

/// Scripted detector for tests and dry runs: returns a pre-programmed list of
/// faces per call, in order, then empty results.
pub struct ScriptedDetector {
    model: String,
    script: std::collections::VecDeque<Vec<Face>>,
    ready: bool,
}

impl ScriptedDetector {
    pub fn new(model: &str, script: Vec<Vec<Face>>) -> Self {
        ScriptedDetector {
            model: model.to_string(),
            script: script.into(),
            ready: false,
        }
    }
}

#[async_trait]
impl FaceDetector for ScriptedDetector {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn ensure_ready(&mut self) -> Result<(), FacegateError> {
        self.ready = true;
        Ok(())
    }

    async fn detect(&mut self, _frame: &Frame) -> Result<Vec<Face>, FacegateError> {
        if !self.ready {
            return Err(FacegateError::Transient(
                "detector used before initialization".to_string(),
            ));
        }
        Ok(self.script.pop_front().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x2: f32, y2: f32, score: f32) -> Face {
        Face {
            bbox: BoundingBox {
                x1: 0.0,
                y1: 0.0,
                x2,
                y2,
            },
            det_score: score,
            embedding: Embedding::new(vec![1.0, 0.0]),
        }
    }

    #[test]
    fn test_largest_face_wins() {
        let picked = select_primary_face(vec![face(10.0, 10.0, 0.99), face(20.0, 20.0, 0.50)])
            .unwrap();
        assert_eq!(picked.bbox.x2, 20.0);
    }

    #[test]
    fn test_score_breaks_area_tie() {
        let picked = select_primary_face(vec![face(10.0, 10.0, 0.60), face(10.0, 10.0, 0.90)])
            .unwrap();
        assert_eq!(picked.det_score, 0.90);
    }

    #[test]
    fn test_empty_input_yields_none() {
        assert!(select_primary_face(vec![]).is_none());
    }

    #[tokio::test]
    async fn test_null_detector_finds_nothing() {
        let mut det = NullDetector::new("buffalo_l");
        det.ensure_ready().await.unwrap();
        let frame = Frame::from_encoded(vec![1, 2, 3], Utc::now());
        assert!(det.detect(&frame).await.unwrap().is_empty());
        assert_eq!(det.model_name(), "buffalo_l");
    }

    #[tokio::test]
    async fn test_scripted_detector_requires_init() {
        let mut det = ScriptedDetector::new("buffalo_l", vec![vec![face(1.0, 1.0, 0.9)]]);
        let frame = Frame::from_encoded(vec![], Utc::now());
        assert!(det.detect(&frame).await.is_err());
        det.ensure_ready().await.unwrap();
        assert_eq!(det.detect(&frame).await.unwrap().len(), 1);
        assert!(det.detect(&frame).await.unwrap().is_empty());
    }
}

/// facegate: the face-recognition back-plane of a visitor/employee
/// access-control system.
///
/// Three subsystems share one tenant-scoped embedding catalog:
/// - the embedding training worker (durable leased job queue -> embeddings)
/// - the recognition pipeline (per-camera capture/recognize/emit stages)
/// - the presence engine (entry/exit state machine + unknown clustering)
///
/// The face-detection model and video sources are external: integrators
/// supply [`detect::FaceDetector`] and [`recognition::VideoSource`]
/// implementations and wire them in through this library API.

pub mod catalog;
pub mod config;
pub mod detect;
pub mod embedding;
pub mod errors;
pub mod http;
pub mod jobs;
pub mod logging;
pub mod presence;
pub mod recognition;
pub mod store;
pub mod worker;

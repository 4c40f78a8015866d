/// Presence state engine
///
/// Converts the noisy stream of per-camera recognitions into authoritative
/// ENTRY/EXIT events. Each subject carries a small state machine: a first
/// sighting at an entry/exit camera opens a pending detection, a repeat
/// sighting at least `confirm_delay` later confirms it, and pendings that
/// never confirm expire after `stale_expiry`. Detections on the wrong camera
/// for the current status only refresh last-seen bookkeeping.
///
/// Unknown faces are clustered online per campus so one physical person maps
/// to one tracked identity. Persistence is batched: keyed last-write-wins
/// state upserts plus append-only events, flushed at 50 items or every 5
/// seconds, re-queued when the store misbehaves.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::PresenceConfig;
use crate::detect::BoundingBox;
use crate::embedding::Embedding;
use crate::errors::FacegateError;
use crate::store::{
    AnalyticsRow, Camera, CameraRole, Event, EventKind, PersonStateRecord, PresenceStatus,
    PresenceStore, SubjectKind,
};

/// A first sighting awaiting confirmation.
#[derive(Debug, Clone)]
struct PendingDetection {
    camera_id: String,
    first_seen_at: DateTime<Utc>,
    similarity: f32,
}

/// Runtime state for one subject at a campus. The persisted record mirrors
/// this; pendings are in-memory only.
#[derive(Debug, Clone)]
struct PersonState {
    tenant_id: String,
    subject_id: String,
    campus_id: String,
    kind: SubjectKind,
    name: String,
    status: PresenceStatus,
    current_entry_at: Option<DateTime<Utc>>,
    last_exit_at: Option<DateTime<Utc>>,
    entries_today: u64,
    exits_today: u64,
    detections_today: u64,
    last_camera: Option<String>,
    last_seen_at: Option<DateTime<Utc>>,
    pending_entry: Option<PendingDetection>,
    pending_exit: Option<PendingDetection>,
    last_detection_logged: Option<DateTime<Utc>>,
}

impl PersonState {
    fn new(
        tenant_id: &str,
        subject_id: &str,
        campus_id: &str,
        kind: SubjectKind,
        name: &str,
    ) -> Self {
        PersonState {
            tenant_id: tenant_id.to_string(),
            subject_id: subject_id.to_string(),
            campus_id: campus_id.to_string(),
            kind,
            name: name.to_string(),
            status: PresenceStatus::Outside,
            current_entry_at: None,
            last_exit_at: None,
            entries_today: 0,
            exits_today: 0,
            detections_today: 0,
            last_camera: None,
            last_seen_at: None,
            pending_entry: None,
            pending_exit: None,
            last_detection_logged: None,
        }
    }

    fn from_record(record: &PersonStateRecord) -> Self {
        PersonState {
            tenant_id: record.tenant_id.clone(),
            subject_id: record.subject_id.clone(),
            campus_id: record.campus_id.clone(),
            kind: record.kind,
            name: record.name.clone(),
            status: record.status,
            current_entry_at: record.current_entry_at,
            last_exit_at: record.last_exit_at,
            entries_today: record.entries_today,
            exits_today: record.exits_today,
            detections_today: record.detections_today,
            last_camera: record.last_camera.clone(),
            last_seen_at: record.last_seen_at,
            pending_entry: None,
            pending_exit: None,
            last_detection_logged: None,
        }
    }

    fn to_record(&self) -> PersonStateRecord {
        PersonStateRecord {
            tenant_id: self.tenant_id.clone(),
            subject_id: self.subject_id.clone(),
            campus_id: self.campus_id.clone(),
            kind: self.kind,
            name: self.name.clone(),
            status: self.status,
            current_entry_at: self.current_entry_at,
            last_exit_at: self.last_exit_at,
            entries_today: self.entries_today,
            exits_today: self.exits_today,
            detections_today: self.detections_today,
            last_camera: self.last_camera.clone(),
            last_seen_at: self.last_seen_at,
        }
    }

    fn should_log_detection(&self, now: DateTime<Utc>) -> bool {
        match self.last_detection_logged {
            None => true,
            Some(last) => (now - last) >= chrono::Duration::seconds(30),
        }
    }
}

/// Running identity for a face that matches no enrolled subject.
#[derive(Debug, Clone)]
struct UnknownCluster {
    cluster_id: String,
    campus_id: String,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    detection_count: u64,
    cameras_seen: HashSet<String>,
    window: VecDeque<Embedding>,
    /// Plain element-wise mean of the window, never renormalized. The
    /// cluster threshold is calibrated against the raw dot product with
    /// this shrunken mean.
    centroid: Embedding,
    last_bbox: Option<BoundingBox>,
}

impl UnknownCluster {
    fn new(
        cluster_id: String,
        campus_id: &str,
        timestamp: DateTime<Utc>,
        camera_id: &str,
        embedding: Embedding,
        bbox: Option<BoundingBox>,
        window_size: usize,
    ) -> Self {
        let mut window = VecDeque::with_capacity(window_size);
        window.push_back(embedding.clone());
        let centroid = embedding;
        UnknownCluster {
            cluster_id,
            campus_id: campus_id.to_string(),
            first_seen: timestamp,
            last_seen: timestamp,
            detection_count: 1,
            cameras_seen: HashSet::from([camera_id.to_string()]),
            window,
            centroid,
            last_bbox: bbox,
        }
    }

    fn update(
        &mut self,
        timestamp: DateTime<Utc>,
        camera_id: &str,
        embedding: Embedding,
        bbox: Option<BoundingBox>,
        window_size: usize,
    ) {
        self.last_seen = timestamp;
        self.detection_count += 1;
        self.cameras_seen.insert(camera_id.to_string());
        if self.window.len() == window_size {
            self.window.pop_front();
        }
        self.window.push_back(embedding);
        let members: Vec<Embedding> = self.window.iter().cloned().collect();
        // Window is never empty here
        if let Ok(mean) = Embedding::mean(&members) {
            self.centroid = mean;
        }
        self.last_bbox = bbox;
    }

    fn similarity(&self, embedding: &Embedding) -> f32 {
        self.centroid.dot(embedding)
    }
}

/// Per-campus occupancy counters, kept in lockstep with person states.
#[derive(Debug, Clone)]
struct CampusStats {
    tenant_id: String,
    inside: u64,
    employees_inside: HashSet<String>,
    visitors_inside: HashSet<String>,
    entries_today: u64,
    exits_today: u64,
    unknown_detections_today: u64,
}

impl CampusStats {
    fn new(tenant_id: &str) -> Self {
        CampusStats {
            tenant_id: tenant_id.to_string(),
            inside: 0,
            employees_inside: HashSet::new(),
            visitors_inside: HashSet::new(),
            entries_today: 0,
            exits_today: 0,
            unknown_detections_today: 0,
        }
    }
}

#[derive(Default)]
struct EngineState {
    /// subject_id -> state
    people: HashMap<String, PersonState>,
    /// campus_id -> cluster_id -> cluster
    unknowns: HashMap<String, HashMap<String, UnknownCluster>>,
    campus_stats: HashMap<String, CampusStats>,
}

#[derive(Default)]
struct FlushQueues {
    /// (subject_id, campus_id) -> newest record. Last write wins within a batch.
    state_upserts: HashMap<(String, String), PersonStateRecord>,
    events: Vec<Event>,
}

impl FlushQueues {
    fn len(&self) -> usize {
        self.state_upserts.len().max(self.events.len())
    }
}

/// JSON view of one campus's live counters.
#[derive(Debug, Clone, Serialize)]
pub struct CampusStatusView {
    pub campus_id: String,
    pub current_inside: u64,
    pub employees_inside: u64,
    pub visitors_inside: u64,
    pub total_entries_today: u64,
    pub total_exits_today: u64,
    pub unknown_detections_today: u64,
    pub unique_unknowns_today: u64,
}

/// JSON view of an unknown cluster.
#[derive(Debug, Clone, Serialize)]
pub struct UnknownClusterView {
    pub cluster_id: String,
    pub campus_id: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub detection_count: u64,
    pub cameras_seen: Vec<String>,
    pub last_bbox: Option<BoundingBox>,
}

pub struct PresenceEngine {
    config: PresenceConfig,
    store: Arc<dyn PresenceStore>,
    cameras: HashMap<String, Camera>,
    state: RwLock<EngineState>,
    queues: Mutex<FlushQueues>,
}

impl PresenceEngine {
    pub fn new(
        store: Arc<dyn PresenceStore>,
        config: PresenceConfig,
        cameras: Vec<Camera>,
    ) -> Self {
        let mut state = EngineState::default();
        let mut camera_map = HashMap::new();
        for camera in cameras {
            state
                .campus_stats
                .entry(camera.campus_id.clone())
                .or_insert_with(|| CampusStats::new(&camera.tenant_id));
            state.unknowns.entry(camera.campus_id.clone()).or_default();
            camera_map.insert(camera.camera_id.clone(), camera);
        }

        PresenceEngine {
            config,
            store,
            cameras: camera_map,
            state: RwLock::new(state),
            queues: Mutex::new(FlushQueues::default()),
        }
    }

    pub fn camera(&self, camera_id: &str) -> Option<&Camera> {
        self.cameras.get(camera_id)
    }

    /// Reload persisted person states and rebuild campus counters. Called
    /// once at startup before any detection is processed.
    pub async fn load_state(&self) -> Result<(), FacegateError> {
        let records = self.store.load_person_states().await?;
        let mut state = self.state.write().expect("presence state lock poisoned");

        for record in &records {
            let person = PersonState::from_record(record);
            let stats = state
                .campus_stats
                .entry(record.campus_id.clone())
                .or_insert_with(|| CampusStats::new(&record.tenant_id));
            if person.status == PresenceStatus::Inside {
                stats.inside += 1;
                match person.kind {
                    SubjectKind::Employee => {
                        stats.employees_inside.insert(person.subject_id.clone());
                    }
                    SubjectKind::Visitor => {
                        stats.visitors_inside.insert(person.subject_id.clone());
                    }
                }
            }
            stats.entries_today += person.entries_today;
            stats.exits_today += person.exits_today;
            state.people.insert(person.subject_id.clone(), person);
        }

        tracing::info!(people = records.len(), "Loaded presence state");
        Ok(())
    }

    /// Process a recognized detection from a camera.
    pub fn process_identified(
        &self,
        subject_id: &str,
        kind: SubjectKind,
        name: &str,
        camera_id: &str,
        timestamp: DateTime<Utc>,
        similarity: f32,
    ) {
        let camera = match self.cameras.get(camera_id) {
            Some(c) => c.clone(),
            None => {
                tracing::warn!(camera_id = %camera_id, "Detection from unregistered camera");
                return;
            }
        };

        let mut queued_event: Option<Event> = None;
        let mut queued_state: Option<PersonStateRecord> = None;

        {
            let mut state = self.state.write().expect("presence state lock poisoned");
            let person = state
                .people
                .entry(subject_id.to_string())
                .or_insert_with(|| {
                    PersonState::new(
                        &camera.tenant_id,
                        subject_id,
                        &camera.campus_id,
                        kind,
                        name,
                    )
                });

            person.detections_today += 1;
            person.last_camera = Some(camera_id.to_string());
            person.last_seen_at = Some(timestamp);

            if person.should_log_detection(timestamp) {
                tracing::info!(
                    subject_id = %subject_id,
                    name = %person.name,
                    camera_id = %camera_id,
                    status = ?person.status,
                    similarity,
                    detections_today = person.detections_today,
                    "Subject detected"
                );
                person.last_detection_logged = Some(timestamp);
            }

            let transition = match camera.role {
                CameraRole::Entry => {
                    Self::handle_entry(person, &camera, camera_id, timestamp, similarity, &self.config)
                }
                CameraRole::Exit => {
                    Self::handle_exit(person, &camera, camera_id, timestamp, similarity, &self.config)
                }
            };

            if let Some(event) = transition {
                let person_snapshot = person.clone();
                let stats = state
                    .campus_stats
                    .entry(camera.campus_id.clone())
                    .or_insert_with(|| CampusStats::new(&camera.tenant_id));
                match event.kind {
                    EventKind::Entry => {
                        stats.inside += 1;
                        stats.entries_today += 1;
                        match person_snapshot.kind {
                            SubjectKind::Employee => {
                                stats.employees_inside.insert(subject_id.to_string());
                            }
                            SubjectKind::Visitor => {
                                stats.visitors_inside.insert(subject_id.to_string());
                            }
                        }
                    }
                    EventKind::Exit => {
                        stats.inside = stats.inside.saturating_sub(1);
                        stats.exits_today += 1;
                        stats.employees_inside.remove(subject_id);
                        stats.visitors_inside.remove(subject_id);
                    }
                    EventKind::UnknownDetection => {}
                }
                tracing::info!(
                    kind = %event.kind,
                    subject_id = %subject_id,
                    campus_id = %camera.campus_id,
                    similarity,
                    "Presence transition confirmed"
                );
                queued_event = Some(event);
                queued_state = Some(person_snapshot.to_record());
            }
        }

        if queued_event.is_some() || queued_state.is_some() {
            let mut queues = self.queues.lock().expect("presence queue lock poisoned");
            if let Some(event) = queued_event {
                queues.events.push(event);
            }
            if let Some(record) = queued_state {
                queues.state_upserts.insert(
                    (record.subject_id.clone(), record.campus_id.clone()),
                    record,
                );
            }
        }
    }

    fn handle_entry(
        person: &mut PersonState,
        camera: &Camera,
        camera_id: &str,
        timestamp: DateTime<Utc>,
        similarity: f32,
        config: &PresenceConfig,
    ) -> Option<Event> {
        if person.status != PresenceStatus::Outside {
            // Already inside: wrong-camera sighting, bookkeeping only
            return None;
        }
        match &person.pending_entry {
            None => {
                person.pending_entry = Some(PendingDetection {
                    camera_id: camera_id.to_string(),
                    first_seen_at: timestamp,
                    similarity,
                });
                None
            }
            Some(pending) => {
                if timestamp - pending.first_seen_at >= config.confirm_delay() {
                    let entered_at = pending.first_seen_at;
                    person.status = PresenceStatus::Inside;
                    person.current_entry_at = Some(entered_at);
                    person.entries_today += 1;
                    person.pending_entry = None;
                    Some(Event {
                        event_id: Uuid::new_v4().to_string(),
                        kind: EventKind::Entry,
                        tenant_id: camera.tenant_id.clone(),
                        campus_id: camera.campus_id.clone(),
                        subject_id: Some(person.subject_id.clone()),
                        cluster_id: None,
                        camera_id: camera_id.to_string(),
                        // Detection time, not confirmation time
                        timestamp: entered_at,
                        similarity: Some(similarity),
                        bbox: None,
                        detection_count: None,
                        is_new: None,
                    })
                } else {
                    None
                }
            }
        }
    }

    fn handle_exit(
        person: &mut PersonState,
        camera: &Camera,
        camera_id: &str,
        timestamp: DateTime<Utc>,
        similarity: f32,
        config: &PresenceConfig,
    ) -> Option<Event> {
        if person.status != PresenceStatus::Inside {
            return None;
        }
        match &person.pending_exit {
            None => {
                person.pending_exit = Some(PendingDetection {
                    camera_id: camera_id.to_string(),
                    first_seen_at: timestamp,
                    similarity,
                });
                None
            }
            Some(pending) => {
                if timestamp - pending.first_seen_at >= config.confirm_delay() {
                    let exited_at = pending.first_seen_at;
                    person.status = PresenceStatus::Outside;
                    person.last_exit_at = Some(exited_at);
                    person.current_entry_at = None;
                    person.exits_today += 1;
                    person.pending_exit = None;
                    Some(Event {
                        event_id: Uuid::new_v4().to_string(),
                        kind: EventKind::Exit,
                        tenant_id: camera.tenant_id.clone(),
                        campus_id: camera.campus_id.clone(),
                        subject_id: Some(person.subject_id.clone()),
                        cluster_id: None,
                        camera_id: camera_id.to_string(),
                        timestamp: exited_at,
                        similarity: Some(similarity),
                        bbox: None,
                        detection_count: None,
                        is_new: None,
                    })
                } else {
                    None
                }
            }
        }
    }

    /// Process a detection that matched no enrolled subject. Assigns the face
    /// to the best-matching cluster at or above the threshold, or opens a new
    /// cluster.
    pub fn process_unknown(
        &self,
        camera_id: &str,
        timestamp: DateTime<Utc>,
        embedding: Embedding,
        bbox: Option<BoundingBox>,
    ) {
        let camera = match self.cameras.get(camera_id) {
            Some(c) => c.clone(),
            None => return,
        };
        let probe = embedding.normalized();

        let event = {
            let mut state = self.state.write().expect("presence state lock poisoned");
            let clusters = state.unknowns.entry(camera.campus_id.clone()).or_default();

            // Argmax over cluster centroids, then threshold the maximum
            let best = clusters
                .values()
                .map(|c| (c.cluster_id.clone(), c.similarity(&probe)))
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

            let event = match best {
                Some((cluster_id, score)) if score >= self.config.unknown_cluster_threshold => {
                    let cluster = clusters.get_mut(&cluster_id).expect("cluster disappeared");
                    cluster.update(
                        timestamp,
                        camera_id,
                        probe,
                        bbox,
                        self.config.cluster_window,
                    );
                    if cluster.detection_count % 10 == 0 {
                        tracing::warn!(
                            cluster_id = %cluster.cluster_id,
                            camera_id = %camera_id,
                            detections = cluster.detection_count,
                            cameras = cluster.cameras_seen.len(),
                            "Unknown person detected again"
                        );
                    }
                    Event {
                        event_id: Uuid::new_v4().to_string(),
                        kind: EventKind::UnknownDetection,
                        tenant_id: camera.tenant_id.clone(),
                        campus_id: camera.campus_id.clone(),
                        subject_id: None,
                        cluster_id: Some(cluster.cluster_id.clone()),
                        camera_id: camera_id.to_string(),
                        timestamp,
                        similarity: Some(score),
                        bbox,
                        detection_count: Some(cluster.detection_count),
                        is_new: None,
                    }
                }
                _ => {
                    let cluster_id =
                        format!("unknown_{}_{}", camera.campus_id, clusters.len() + 1);
                    let cluster = UnknownCluster::new(
                        cluster_id.clone(),
                        &camera.campus_id,
                        timestamp,
                        camera_id,
                        probe,
                        bbox,
                        self.config.cluster_window,
                    );
                    clusters.insert(cluster_id.clone(), cluster);
                    tracing::warn!(
                        cluster_id = %cluster_id,
                        camera_id = %camera_id,
                        campus_id = %camera.campus_id,
                        "New unknown person detected"
                    );
                    Event {
                        event_id: Uuid::new_v4().to_string(),
                        kind: EventKind::UnknownDetection,
                        tenant_id: camera.tenant_id.clone(),
                        campus_id: camera.campus_id.clone(),
                        subject_id: None,
                        cluster_id: Some(cluster_id),
                        camera_id: camera_id.to_string(),
                        timestamp,
                        similarity: None,
                        bbox,
                        detection_count: Some(1),
                        is_new: Some(true),
                    }
                }
            };

            let stats = state
                .campus_stats
                .entry(camera.campus_id.clone())
                .or_insert_with(|| CampusStats::new(&camera.tenant_id));
            stats.unknown_detections_today += 1;
            event
        };

        let mut queues = self.queues.lock().expect("presence queue lock poisoned");
        queues.events.push(event);
    }

    /// Clear pending entry/exit detections older than `stale_expiry`.
    pub fn sweep_stale(&self) {
        self.sweep_stale_at(Utc::now());
    }

    pub fn sweep_stale_at(&self, now: DateTime<Utc>) {
        let expiry = self.config.stale_expiry();
        let mut state = self.state.write().expect("presence state lock poisoned");
        for person in state.people.values_mut() {
            if let Some(pending) = &person.pending_entry {
                if now - pending.first_seen_at > expiry {
                    person.pending_entry = None;
                }
            }
            if let Some(pending) = &person.pending_exit {
                if now - pending.first_seen_at > expiry {
                    person.pending_exit = None;
                }
            }
        }
    }

    /// True when either queue has reached the flush threshold.
    pub fn flush_due(&self) -> bool {
        let queues = self.queues.lock().expect("presence queue lock poisoned");
        queues.state_upserts.len() >= self.config.batch_flush_items
            || queues.events.len() >= self.config.batch_flush_items
    }

    /// Drain both queues to the store. A failed write re-queues everything it
    /// drained so acknowledged state is never lost; newer state upserts queued
    /// in the meantime win over the re-queued ones.
    pub async fn flush(&self) -> Result<(), FacegateError> {
        let (states, events) = {
            let mut queues = self.queues.lock().expect("presence queue lock poisoned");
            if queues.len() == 0 {
                return Ok(());
            }
            let states: Vec<PersonStateRecord> =
                queues.state_upserts.drain().map(|(_, v)| v).collect();
            let events: Vec<Event> = std::mem::take(&mut queues.events);
            (states, events)
        };

        let state_result = self.store.upsert_person_states(&states).await;
        let event_result = match &state_result {
            Ok(()) => self.store.append_events(&events).await,
            Err(_) => Err(FacegateError::Transient(
                "skipping event append after state upsert failure".to_string(),
            )),
        };

        match (state_result, event_result) {
            (Ok(()), Ok(())) => {
                tracing::debug!(
                    states = states.len(),
                    events = events.len(),
                    "Flushed presence batch"
                );
                Ok(())
            }
            (state_result, event_result) => {
                let mut queues = self.queues.lock().expect("presence queue lock poisoned");
                if state_result.is_err() {
                    for record in states {
                        let key = (record.subject_id.clone(), record.campus_id.clone());
                        // A newer record queued during the failed flush wins
                        queues.state_upserts.entry(key).or_insert(record);
                    }
                }
                if event_result.is_err() {
                    let mut restored = events;
                    restored.append(&mut queues.events);
                    queues.events = restored;
                }
                Err(FacegateError::Transient(
                    "presence flush failed — batch re-queued".to_string(),
                ))
            }
        }
    }

    /// Analytics rows for every campus, dated by `now`.
    pub fn analytics_rows_at(&self, now: DateTime<Utc>) -> Vec<AnalyticsRow> {
        let state = self.state.read().expect("presence state lock poisoned");
        state
            .campus_stats
            .iter()
            .map(|(campus_id, stats)| AnalyticsRow {
                tenant_id: stats.tenant_id.clone(),
                campus_id: campus_id.clone(),
                date: now.date_naive(),
                inside: stats.inside,
                employees_inside: stats.employees_inside.len() as u64,
                visitors_inside: stats.visitors_inside.len() as u64,
                entries: stats.entries_today,
                exits: stats.exits_today,
                unknown_detections: stats.unknown_detections_today,
                unique_unknowns: state
                    .unknowns
                    .get(campus_id)
                    .map(|c| c.len() as u64)
                    .unwrap_or(0),
                updated_at: now,
            })
            .collect()
    }

    /// Upsert daily aggregates for every campus.
    pub async fn update_analytics(&self) -> Result<(), FacegateError> {
        let rows = self.analytics_rows_at(Utc::now());
        self.store.upsert_analytics(&rows).await
    }

    // ------------------------------------------------------------------
    // Query API (reads are served from memory; history traverses the store)
    // ------------------------------------------------------------------

    pub fn campus_status(&self, campus_id: &str) -> Option<CampusStatusView> {
        let state = self.state.read().expect("presence state lock poisoned");
        state.campus_stats.get(campus_id).map(|stats| CampusStatusView {
            campus_id: campus_id.to_string(),
            current_inside: stats.inside,
            employees_inside: stats.employees_inside.len() as u64,
            visitors_inside: stats.visitors_inside.len() as u64,
            total_entries_today: stats.entries_today,
            total_exits_today: stats.exits_today,
            unknown_detections_today: stats.unknown_detections_today,
            unique_unknowns_today: state
                .unknowns
                .get(campus_id)
                .map(|c| c.len() as u64)
                .unwrap_or(0),
        })
    }

    pub fn all_campus_statuses(&self) -> Vec<CampusStatusView> {
        let state = self.state.read().expect("presence state lock poisoned");
        let mut views: Vec<CampusStatusView> = state
            .campus_stats
            .iter()
            .map(|(campus_id, stats)| CampusStatusView {
                campus_id: campus_id.clone(),
                current_inside: stats.inside,
                employees_inside: stats.employees_inside.len() as u64,
                visitors_inside: stats.visitors_inside.len() as u64,
                total_entries_today: stats.entries_today,
                total_exits_today: stats.exits_today,
                unknown_detections_today: stats.unknown_detections_today,
                unique_unknowns_today: state
                    .unknowns
                    .get(campus_id)
                    .map(|c| c.len() as u64)
                    .unwrap_or(0),
            })
            .collect();
        views.sort_by(|a, b| a.campus_id.cmp(&b.campus_id));
        views
    }

    pub fn person_status(&self, subject_id: &str) -> Option<PersonStateRecord> {
        let state = self.state.read().expect("presence state lock poisoned");
        state.people.get(subject_id).map(|p| p.to_record())
    }

    /// Unknown clusters for a campus, most-detected first.
    pub fn campus_unknowns(&self, campus_id: &str) -> Vec<UnknownClusterView> {
        let state = self.state.read().expect("presence state lock poisoned");
        let mut views: Vec<UnknownClusterView> = state
            .unknowns
            .get(campus_id)
            .map(|clusters| {
                clusters
                    .values()
                    .map(|c| {
                        let mut cameras: Vec<String> = c.cameras_seen.iter().cloned().collect();
                        cameras.sort();
                        UnknownClusterView {
                            cluster_id: c.cluster_id.clone(),
                            campus_id: c.campus_id.clone(),
                            first_seen: c.first_seen,
                            last_seen: c.last_seen,
                            detection_count: c.detection_count,
                            cameras_seen: cameras,
                            last_bbox: c.last_bbox,
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        views.sort_by(|a, b| b.detection_count.cmp(&a.detection_count));
        views
    }

    pub async fn campus_events(
        &self,
        campus_id: &str,
        kind: Option<EventKind>,
        limit: usize,
    ) -> Result<Vec<Event>, FacegateError> {
        self.store.list_events(campus_id, kind, limit).await
    }

    pub async fn campus_people(
        &self,
        campus_id: &str,
        status: Option<PresenceStatus>,
    ) -> Result<Vec<PersonStateRecord>, FacegateError> {
        self.store.list_person_states(campus_id, status).await
    }

    pub async fn campus_analytics(
        &self,
        campus_id: &str,
        days: i64,
    ) -> Result<Vec<AnalyticsRow>, FacegateError> {
        let since = (Utc::now() - chrono::Duration::days(days)).date_naive();
        self.store.list_analytics(campus_id, since).await
    }

    #[cfg(test)]
    fn cluster_centroid(&self, campus_id: &str, cluster_id: &str) -> Option<Embedding> {
        let state = self.state.read().expect("presence state lock poisoned");
        state
            .unknowns
            .get(campus_id)
            .and_then(|c| c.get(cluster_id))
            .map(|c| c.centroid.clone())
    }
}

/// Spawn the engine's background tasks: batch flush, analytics upsert, and
/// the stale-pending sweep. All three stop on the shutdown token; the flush
/// task drains both queues one final time on the way out.
pub fn spawn_presence_tasks(
    engine: Arc<PresenceEngine>,
    shutdown: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();

    {
        let engine = Arc::clone(&engine);
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let flush_interval = engine.config.batch_flush_interval();
            let mut last_flush = tokio::time::Instant::now();
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        if engine.flush_due() || last_flush.elapsed() >= flush_interval {
                            if let Err(e) = engine.flush().await {
                                tracing::error!(error = %e, "Presence flush failed");
                            }
                            last_flush = tokio::time::Instant::now();
                        }
                    }
                }
            }
            // Shutdown flushes both queues
            if let Err(e) = engine.flush().await {
                tracing::error!(error = %e, "Final presence flush failed");
            }
        }));
    }

    {
        let engine = Arc::clone(&engine);
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(engine.config.analytics_interval());
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        if let Err(e) = engine.update_analytics().await {
                            tracing::error!(error = %e, "Analytics update failed");
                        }
                    }
                }
            }
        }));
    }

    {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(engine.config.stale_sweep_interval());
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => engine.sweep_stale(),
                }
            }
        }));
    }

    handles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn cameras() -> Vec<Camera> {
        vec![
            Camera {
                camera_id: "cam1".to_string(),
                tenant_id: "t1".to_string(),
                campus_id: "campusA".to_string(),
                role: CameraRole::Entry,
                display_name: "Main Entry Gate".to_string(),
            },
            Camera {
                camera_id: "cam2".to_string(),
                tenant_id: "t1".to_string(),
                campus_id: "campusA".to_string(),
                role: CameraRole::Exit,
                display_name: "Main Exit Gate".to_string(),
            },
        ]
    }

    fn engine() -> (Arc<MemoryStore>, PresenceEngine) {
        let store = Arc::new(MemoryStore::new());
        let engine = PresenceEngine::new(store.clone(), PresenceConfig::default(), cameras());
        (store, engine)
    }

    fn at(secs: f64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_700_000_000_000 + (secs * 1000.0) as i64).unwrap()
    }

    fn detect(engine: &PresenceEngine, camera: &str, secs: f64) {
        engine.process_identified("s1", SubjectKind::Employee, "Avery", camera, at(secs), 0.88);
    }

    #[tokio::test]
    async fn test_entry_confirmed_after_delay_with_first_seen_timestamp() {
        let (store, engine) = engine();
        for t in [0.0, 0.5, 1.0, 2.5] {
            detect(&engine, "cam1", t);
        }

        let person = engine.person_status("s1").unwrap();
        assert_eq!(person.status, PresenceStatus::Inside);
        assert_eq!(person.entries_today, 1);
        assert_eq!(person.current_entry_at, Some(at(0.0)));

        let status = engine.campus_status("campusA").unwrap();
        assert_eq!(status.current_inside, 1);
        assert_eq!(status.total_entries_today, 1);

        engine.flush().await.unwrap();
        let events = store.list_events("campusA", Some(EventKind::Entry), 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].timestamp, at(0.0));
        assert_eq!(events[0].subject_id.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_single_detection_never_confirms_and_expires() {
        let (_store, engine) = engine();
        detect(&engine, "cam1", 0.0);

        engine.sweep_stale_at(at(5.1));
        // After expiry even a quick second sighting starts over
        detect(&engine, "cam1", 5.2);
        let person = engine.person_status("s1").unwrap();
        assert_eq!(person.status, PresenceStatus::Outside);
        assert_eq!(person.entries_today, 0);
    }

    #[tokio::test]
    async fn test_exit_mirrors_entry() {
        let (_store, engine) = engine();
        detect(&engine, "cam1", 0.0);
        detect(&engine, "cam1", 2.1);
        assert_eq!(
            engine.person_status("s1").unwrap().status,
            PresenceStatus::Inside
        );

        detect(&engine, "cam2", 10.0);
        detect(&engine, "cam2", 12.5);
        let person = engine.person_status("s1").unwrap();
        assert_eq!(person.status, PresenceStatus::Outside);
        assert_eq!(person.exits_today, 1);
        assert_eq!(person.current_entry_at, None);
        assert_eq!(person.last_exit_at, Some(at(10.0)));

        let status = engine.campus_status("campusA").unwrap();
        assert_eq!(status.current_inside, 0);
    }

    #[tokio::test]
    async fn test_wrong_camera_updates_bookkeeping_only() {
        let (_store, engine) = engine();
        // Exit-camera sightings while outside must not open a pending exit
        detect(&engine, "cam2", 0.0);
        detect(&engine, "cam2", 3.0);
        let person = engine.person_status("s1").unwrap();
        assert_eq!(person.status, PresenceStatus::Outside);
        assert_eq!(person.exits_today, 0);
        assert_eq!(person.detections_today, 2);
        assert_eq!(person.last_camera.as_deref(), Some("cam2"));
    }

    #[tokio::test]
    async fn test_unknown_clustering_merges_similar_faces() {
        let (_store, engine) = engine();
        let fa = Embedding::new(vec![1.0, 0.2, 0.0]).normalized();
        let fb = Embedding::new(vec![0.9, 0.45, 0.0]).normalized();
        assert!(fa.dot(&fb) >= 0.65);

        for i in 0..3 {
            engine.process_unknown("cam1", at(i as f64), fa.clone(), None);
        }
        for i in 3..5 {
            engine.process_unknown("cam2", at(i as f64), fb.clone(), None);
        }

        let unknowns = engine.campus_unknowns("campusA");
        assert_eq!(unknowns.len(), 1);
        assert_eq!(unknowns[0].detection_count, 5);
        assert_eq!(unknowns[0].cameras_seen, vec!["cam1", "cam2"]);

        // Centroid is the plain mean of the window, not renormalized
        let centroid = engine
            .cluster_centroid("campusA", &unknowns[0].cluster_id)
            .unwrap();
        let members = vec![fa.clone(), fa.clone(), fa.clone(), fb.clone(), fb.clone()];
        let expected = Embedding::mean(&members).unwrap();
        for (a, b) in centroid.as_slice().iter().zip(expected.as_slice()) {
            assert!((a - b).abs() < 1e-5);
        }
        assert!(centroid.l2_norm() < 1.0, "mean of distinct unit vectors shrinks");
    }

    #[tokio::test]
    async fn test_dissimilar_unknowns_get_separate_clusters() {
        let (_store, engine) = engine();
        let fa = Embedding::new(vec![1.0, 0.0, 0.0]);
        let fb = Embedding::new(vec![0.0, 1.0, 0.0]);
        engine.process_unknown("cam1", at(0.0), fa, None);
        engine.process_unknown("cam1", at(1.0), fb, None);
        assert_eq!(engine.campus_unknowns("campusA").len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_events_mark_first_sighting() {
        let (store, engine) = engine();
        let f = Embedding::new(vec![1.0, 0.0]);
        engine.process_unknown("cam1", at(0.0), f.clone(), None);
        engine.process_unknown("cam1", at(1.0), f, None);
        engine.flush().await.unwrap();

        let mut events = store
            .list_events("campusA", Some(EventKind::UnknownDetection), 10)
            .await
            .unwrap();
        events.sort_by_key(|e| e.timestamp);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].is_new, Some(true));
        assert_eq!(events[0].detection_count, Some(1));
        assert_eq!(events[1].is_new, None);
        assert_eq!(events[1].detection_count, Some(2));
    }

    #[tokio::test]
    async fn test_failed_flush_requeues_and_retries() {
        let (store, engine) = engine();
        detect(&engine, "cam1", 0.0);
        detect(&engine, "cam1", 2.1);

        store.set_fail_presence_writes(true);
        assert!(engine.flush().await.is_err());

        store.set_fail_presence_writes(false);
        engine.flush().await.unwrap();
        let events = store.list_events("campusA", None, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        let states = store
            .list_person_states("campusA", Some(PresenceStatus::Inside))
            .await
            .unwrap();
        assert_eq!(states.len(), 1);
    }

    #[tokio::test]
    async fn test_analytics_rows_track_counters() {
        let (_store, engine) = engine();
        detect(&engine, "cam1", 0.0);
        detect(&engine, "cam1", 2.1);
        engine.process_unknown("cam1", at(3.0), Embedding::new(vec![1.0, 0.0]), None);

        let rows = engine.analytics_rows_at(at(10.0));
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.campus_id, "campusA");
        assert_eq!(row.inside, 1);
        assert_eq!(row.employees_inside, 1);
        assert_eq!(row.entries, 1);
        assert_eq!(row.unknown_detections, 1);
        assert_eq!(row.unique_unknowns, 1);
    }

    #[tokio::test]
    async fn test_state_reload_rebuilds_counters() {
        let (store, engine) = engine();
        detect(&engine, "cam1", 0.0);
        detect(&engine, "cam1", 2.1);
        engine.flush().await.unwrap();

        let reloaded = PresenceEngine::new(store.clone(), PresenceConfig::default(), cameras());
        reloaded.load_state().await.unwrap();
        let status = reloaded.campus_status("campusA").unwrap();
        assert_eq!(status.current_inside, 1);
        assert_eq!(status.total_entries_today, 1);
        assert_eq!(
            reloaded.person_status("s1").unwrap().status,
            PresenceStatus::Inside
        );
    }
}

/// Tenant-scoped embedding catalog
///
/// Source of truth for identity on the hot path. Keeps a tenant-partitioned
/// in-memory view of done embeddings; matchers read immutable per-tenant
/// snapshots (Arc swap, copy-on-write) so reads never block the sync writer.
///
/// The first sync is a full load executed synchronously at startup. After
/// that a background task re-lists subjects whose last_updated crossed the
/// previous watermark, diff-applies them, and drops subjects that became
/// inactive or blacklisted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::CatalogConfig;
use crate::embedding::Embedding;
use crate::errors::FacegateError;
use crate::store::{BlobStore, CatalogStore, EmbeddingRecord, JobStatus, SubjectKind};

/// One matchable identity in a tenant's slice of the catalog.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub subject_id: String,
    pub name: String,
    pub kind: SubjectKind,
    /// Unit-normalized; dot product against a normalized probe is cosine.
    pub embedding: Embedding,
}

/// Immutable view of one tenant's catalog. Handed to matchers by Arc.
#[derive(Debug, Default)]
pub struct TenantSnapshot {
    pub entries: HashMap<String, CatalogEntry>,
}

impl TenantSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Best catalog match for a unit-normalized probe embedding.
    pub fn best_match(&self, probe: &Embedding) -> Option<(&CatalogEntry, f32)> {
        let mut best: Option<(&CatalogEntry, f32)> = None;
        for entry in self.entries.values() {
            let score = probe.dot(&entry.embedding);
            match best {
                Some((_, current)) if score <= current => {}
                _ => best = Some((entry, score)),
            }
        }
        best
    }
}

/// Catalog statistics for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogStats {
    pub total_embeddings: usize,
    pub employees: usize,
    pub visitors: usize,
    pub last_sync: Option<DateTime<Utc>>,
    pub initial_load_complete: bool,
}

pub struct EmbeddingCatalog {
    store: Arc<dyn CatalogStore>,
    blobs: Arc<dyn BlobStore>,
    model: String,
    config: CatalogConfig,
    view: RwLock<HashMap<String, Arc<TenantSnapshot>>>,
    last_sync: RwLock<Option<DateTime<Utc>>>,
    initial_load_complete: AtomicBool,
}

impl EmbeddingCatalog {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        blobs: Arc<dyn BlobStore>,
        model: &str,
        config: CatalogConfig,
    ) -> Self {
        EmbeddingCatalog {
            store,
            blobs,
            model: model.to_string(),
            config,
            view: RwLock::new(HashMap::new()),
            last_sync: RwLock::new(None),
            initial_load_complete: AtomicBool::new(false),
        }
    }

    /// Full load of every tenant's done embeddings. Called synchronously at
    /// startup before any matcher runs.
    pub async fn initial_load(&self) -> Result<(), FacegateError> {
        let started = Utc::now();
        let tenants = self.store.list_tenant_ids().await?;

        let mut fresh: HashMap<String, Arc<TenantSnapshot>> = HashMap::new();
        let mut total = 0usize;
        for tenant in &tenants {
            let snapshot = self.load_tenant_slice(tenant, None, None).await?;
            total += snapshot.len();
            fresh.insert(tenant.clone(), Arc::new(snapshot));
        }

        {
            let mut view = self.view.write().expect("catalog view lock poisoned");
            *view = fresh;
        }
        *self.last_sync.write().expect("catalog sync lock poisoned") = Some(started);
        self.initial_load_complete.store(true, Ordering::SeqCst);

        tracing::info!(
            tenants = tenants.len(),
            embeddings = total,
            "Embedding catalog loaded"
        );
        Ok(())
    }

    /// Incremental reconciliation: apply subjects updated since the previous
    /// watermark and drop subjects that are no longer eligible.
    pub async fn sync(&self) -> Result<(), FacegateError> {
        let watermark = *self.last_sync.read().expect("catalog sync lock poisoned");
        if watermark.is_none() {
            tracing::warn!("Catalog sync called before initial load");
            return Ok(());
        }
        let started = Utc::now();

        // Re-list tenants so newly enrolled tenants appear without a restart.
        let tenants = self.store.list_tenant_ids().await?;
        let mut updated_total = 0usize;
        let mut removed_total = 0usize;

        for tenant in &tenants {
            let current = self.snapshot(tenant);
            let base = current
                .as_deref()
                .map(|s| s.entries.clone())
                .unwrap_or_default();

            let slice = self
                .load_tenant_slice(tenant, watermark, Some(base))
                .await?;

            let ineligible = self.store.list_ineligible_subject_ids(tenant).await?;
            let mut entries = slice.entries;
            for id in &ineligible {
                if entries.remove(id).is_some() {
                    removed_total += 1;
                }
            }
            updated_total += entries.len();

            let mut view = self.view.write().expect("catalog view lock poisoned");
            view.insert(tenant.clone(), Arc::new(TenantSnapshot { entries }));
        }

        *self.last_sync.write().expect("catalog sync lock poisoned") = Some(started);
        tracing::debug!(
            tenants = tenants.len(),
            entries = updated_total,
            removed = removed_total,
            "Embedding catalog synced"
        );
        Ok(())
    }

    /// Load (or incrementally refresh) one tenant's slice.
    async fn load_tenant_slice(
        &self,
        tenant: &str,
        updated_since: Option<DateTime<Utc>>,
        base: Option<HashMap<String, CatalogEntry>>,
    ) -> Result<TenantSnapshot, FacegateError> {
        let subjects = self
            .store
            .list_active_subjects(tenant, &self.model, updated_since)
            .await?;

        let mut entries = base.unwrap_or_default();
        for subject in subjects {
            let record = match subject.embedding_record(&self.model) {
                Some(r) if r.status == JobStatus::Done => r,
                _ => continue,
            };
            let handle = match &record.handle {
                Some(h) => h,
                None => {
                    tracing::warn!(
                        tenant_id = %tenant,
                        subject_id = %subject.subject_id,
                        "Done embedding record without a blob handle — skipping"
                    );
                    continue;
                }
            };
            match self.fetch_embedding(handle).await {
                Ok(embedding) => {
                    entries.insert(
                        subject.subject_id.clone(),
                        CatalogEntry {
                            subject_id: subject.subject_id.clone(),
                            name: subject.name.clone(),
                            kind: subject.kind,
                            embedding: embedding.normalized(),
                        },
                    );
                }
                Err(e) => {
                    tracing::error!(
                        tenant_id = %tenant,
                        subject_id = %subject.subject_id,
                        error = %e,
                        "Failed to load embedding blob — skipping subject"
                    );
                }
            }
        }
        Ok(TenantSnapshot { entries })
    }

    /// Wait-free read of a tenant's current snapshot.
    pub fn snapshot(&self, tenant: &str) -> Option<Arc<TenantSnapshot>> {
        let view = self.view.read().expect("catalog view lock poisoned");
        view.get(tenant).cloned()
    }

    /// Active entries for a tenant, from the in-memory view.
    pub fn list_active(&self, tenant: &str) -> Vec<CatalogEntry> {
        self.snapshot(tenant)
            .map(|s| s.entries.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Write the embedding blob, then atomically flip the subject's record to
    /// done. Returns the blob handle.
    pub async fn publish(
        &self,
        tenant: &str,
        subject_id: &str,
        embedding: &Embedding,
        record_created_at: DateTime<Utc>,
        started_at: Option<DateTime<Utc>>,
    ) -> Result<String, FacegateError> {
        let metadata = serde_json::json!({
            "tenant_id": tenant,
            "subject_id": subject_id,
            "model": self.model,
            "type": "embedding",
            "dimension": embedding.dimension(),
        });
        let handle = self.blobs.put(embedding.to_bytes(), metadata).await?;

        let now = Utc::now();
        self.store
            .set_embedding_record(
                tenant,
                subject_id,
                &self.model,
                EmbeddingRecord {
                    handle: Some(handle.clone()),
                    status: JobStatus::Done,
                    created_at: record_created_at,
                    started_at,
                    finished_at: Some(now),
                    duplicate_of: None,
                    error: None,
                },
            )
            .await?;
        Ok(handle)
    }

    /// Fetch and decode an embedding blob.
    pub async fn fetch_embedding(&self, handle: &str) -> Result<Embedding, FacegateError> {
        let bytes = self.blobs.get(handle).await?;
        Embedding::from_bytes(&bytes)
    }

    /// (subject_id, decoded embedding) pairs for the duplicate scan. Streams
    /// blobs one at a time so memory stays bounded on large tenants.
    pub async fn done_embeddings(
        &self,
        tenant: &str,
    ) -> Result<Vec<(String, Embedding)>, FacegateError> {
        let handles = self
            .store
            .list_done_embedding_handles(tenant, &self.model)
            .await?;
        let mut out = Vec::with_capacity(handles.len());
        for (subject_id, handle) in handles {
            match self.fetch_embedding(&handle).await {
                Ok(embedding) => out.push((subject_id, embedding)),
                Err(e) => {
                    tracing::warn!(
                        tenant_id = %tenant,
                        subject_id = %subject_id,
                        error = %e,
                        "Skipping unreadable embedding during duplicate scan"
                    );
                }
            }
        }
        Ok(out)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn stats(&self) -> CatalogStats {
        let view = self.view.read().expect("catalog view lock poisoned");
        let mut total = 0usize;
        let mut employees = 0usize;
        let mut visitors = 0usize;
        for snapshot in view.values() {
            for entry in snapshot.entries.values() {
                total += 1;
                match entry.kind {
                    SubjectKind::Employee => employees += 1,
                    SubjectKind::Visitor => visitors += 1,
                }
            }
        }
        CatalogStats {
            total_embeddings: total,
            employees,
            visitors,
            last_sync: *self.last_sync.read().expect("catalog sync lock poisoned"),
            initial_load_complete: self.initial_load_complete.load(Ordering::SeqCst),
        }
    }

}

/// Background reconciliation loop. Runs until the shutdown token fires.
pub fn spawn_catalog_sync(
    catalog: Arc<EmbeddingCatalog>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let interval = catalog.config.sync_interval();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The immediate first tick is redundant with the startup load
        tick.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(e) = catalog.sync().await {
                        tracing::error!(error = %e, "Catalog sync failed");
                    }
                }
            }
        }
        tracing::debug!("Catalog sync task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::{EnrollmentImages, Subject, SubjectStatus};

    fn unit(values: Vec<f32>) -> Embedding {
        Embedding::new(values).normalized()
    }

    async fn seed_subject(
        store: &Arc<MemoryStore>,
        catalog: &EmbeddingCatalog,
        id: &str,
        embedding: &Embedding,
    ) {
        let now = Utc::now();
        let subject = Subject {
            tenant_id: "t1".to_string(),
            subject_id: id.to_string(),
            kind: SubjectKind::Employee,
            name: format!("person {}", id),
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
            .publish("t1", id, embedding, now, Some(now))
            .await
            .unwrap();
    }

    fn catalog_over(store: Arc<MemoryStore>) -> EmbeddingCatalog {
        EmbeddingCatalog::new(
            store.clone(),
            store,
            "buffalo_l",
            CatalogConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_initial_load_and_match() {
        let store = Arc::new(MemoryStore::new());
        let catalog = catalog_over(store.clone());
        let e1 = unit(vec![1.0, 0.0, 0.0]);
        seed_subject(&store, &catalog, "s1", &e1).await;

        catalog.initial_load().await.unwrap();
        let snapshot = catalog.snapshot("t1").unwrap();
        assert_eq!(snapshot.len(), 1);

        let probe = unit(vec![0.95, 0.05, 0.0]);
        let (entry, score) = snapshot.best_match(&probe).unwrap();
        assert_eq!(entry.subject_id, "s1");
        assert!(score > 0.9);
    }

    #[tokio::test]
    async fn test_sync_picks_up_new_and_drops_inactive() {
        let store = Arc::new(MemoryStore::new());
        let catalog = catalog_over(store.clone());
        seed_subject(&store, &catalog, "s1", &unit(vec![1.0, 0.0])).await;
        catalog.initial_load().await.unwrap();
        assert_eq!(catalog.snapshot("t1").unwrap().len(), 1);

        seed_subject(&store, &catalog, "s2", &unit(vec![0.0, 1.0])).await;
        store
            .set_subject_status("t1", "s1", SubjectStatus::Inactive)
            .await
            .unwrap();

        catalog.sync().await.unwrap();
        let snapshot = catalog.snapshot("t1").unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.entries.contains_key("s2"));
        assert!(!snapshot.entries.contains_key("s1"));
    }

    #[tokio::test]
    async fn test_stats_counts_kinds() {
        let store = Arc::new(MemoryStore::new());
        let catalog = catalog_over(store.clone());
        seed_subject(&store, &catalog, "s1", &unit(vec![1.0, 0.0])).await;
        catalog.initial_load().await.unwrap();

        let stats = catalog.stats();
        assert_eq!(stats.total_embeddings, 1);
        assert_eq!(stats.employees, 1);
        assert_eq!(stats.visitors, 0);
        assert!(stats.initial_load_complete);
        assert!(stats.last_sync.is_some());
    }

    #[tokio::test]
    async fn test_snapshot_is_stable_across_sync() {
        let store = Arc::new(MemoryStore::new());
        let catalog = catalog_over(store.clone());
        seed_subject(&store, &catalog, "s1", &unit(vec![1.0, 0.0])).await;
        catalog.initial_load().await.unwrap();

        let held = catalog.snapshot("t1").unwrap();
        store
            .set_subject_status("t1", "s1", SubjectStatus::Inactive)
            .await
            .unwrap();
        catalog.sync().await.unwrap();

        // The held snapshot still sees the old world; a fresh one does not.
        assert_eq!(held.len(), 1);
        assert_eq!(catalog.snapshot("t1").unwrap().len(), 0);
    }
}

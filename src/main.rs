use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use facegate::catalog::{spawn_catalog_sync, EmbeddingCatalog};
use facegate::config::Config;
use facegate::detect::NullDetector;
use facegate::http::{self, AppState};
use facegate::jobs::JobQueue;
use facegate::logging;
use facegate::presence::{spawn_presence_tasks, PresenceEngine};
use facegate::recognition::{spawn_camera, IdleSource, VideoSource};
use facegate::store::memory::MemoryStore;
use facegate::store::postgres::PostgresStore;
use facegate::store::{BlobStore, Camera, CameraRole, CatalogStore, PresenceStore};
use facegate::worker::{spawn_training_worker, TrainingWorker};

#[derive(Parser)]
#[command(name = "facegate", about = "Face-recognition access-control back-plane")]
struct Args {
    /// Path to the TOML config file
    #[arg(long, default_value = "facegate.toml")]
    config: String,
}

/// How often this process reclaims stuck jobs, independent of any worker.
const RECOVERY_INTERVAL_SECS: u64 = 300;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load_from(&args.config)?;
    logging::init_logging(&config);
    tracing::info!("facegate starting");

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let (catalog_store, presence_store, blob_store) = build_stores(&config).await?;
    let cameras = build_cameras(&config)?;

    // First sync is a full load, executed before any matcher runs
    let catalog = Arc::new(EmbeddingCatalog::new(
        Arc::clone(&catalog_store),
        Arc::clone(&blob_store),
        &config.worker.model_name,
        config.catalog.clone(),
    ));
    catalog
        .initial_load()
        .await
        .context("initial catalog load failed")?;
    let sync_task = spawn_catalog_sync(Arc::clone(&catalog), shutdown.clone());

    let engine = Arc::new(PresenceEngine::new(
        Arc::clone(&presence_store),
        config.presence.clone(),
        cameras.clone(),
    ));
    engine.load_state().await.context("presence state reload failed")?;
    let presence_tasks = spawn_presence_tasks(Arc::clone(&engine), shutdown.clone());

    // Stuck-job recovery runs here even when the worker loop is disabled, so
    // leases held by dead workers elsewhere are reclaimed.
    let queue = Arc::new(JobQueue::new(
        Arc::clone(&catalog_store),
        config.worker.max_retries,
    ));
    let recovery_task = spawn_recovery(Arc::clone(&queue), &config, shutdown.clone());

    // The stock binary carries null detector/video backends so every
    // subsystem runs end to end; deployments link real implementations
    // through the library API. The worker loop itself is gated by
    // worker.enabled.
    let worker = Arc::new(TrainingWorker::new(
        &config.worker.worker_id,
        config.worker.clone(),
        Arc::clone(&queue),
        Arc::clone(&catalog_store),
        Arc::clone(&blob_store),
        Arc::clone(&catalog),
        Box::new(NullDetector::new(&config.worker.model_name)),
    ));
    let worker_task = spawn_training_worker(worker, shutdown.clone());

    // build_cameras preserves config order, so zip recovers each source URI
    let mut pipelines = Vec::with_capacity(cameras.len());
    for (camera, cam_cfg) in cameras.iter().zip(&config.cameras) {
        let source = build_video_source(&camera.camera_id, cam_cfg.source.as_deref());
        pipelines.push(spawn_camera(
            camera.clone(),
            source,
            Box::new(NullDetector::new(&config.worker.model_name)),
            Arc::clone(&catalog),
            Arc::clone(&engine),
            None,
            config.recognition.clone(),
            shutdown.clone(),
        ));
    }

    let state = AppState {
        engine: Arc::clone(&engine),
        catalog: Arc::clone(&catalog),
    };
    http::serve(state, &config.http.bind, shutdown.clone()).await?;

    // HTTP has drained; wait for the background tasks to observe the token
    shutdown.cancel();
    let _ = sync_task.await;
    let _ = recovery_task.await;
    let _ = worker_task.await;
    for pipeline in pipelines {
        pipeline.join().await;
    }
    for task in presence_tasks {
        let _ = task.await;
    }

    tracing::info!("facegate stopped");
    Ok(())
}

async fn build_stores(
    config: &Config,
) -> Result<(
    Arc<dyn CatalogStore>,
    Arc<dyn PresenceStore>,
    Arc<dyn BlobStore>,
)> {
    if config.database_url == "memory" {
        tracing::warn!("Using the in-memory store backend — state will not survive a restart");
        let store = Arc::new(MemoryStore::new());
        Ok((store.clone(), store.clone(), store))
    } else {
        let store = Arc::new(
            PostgresStore::new(&config.database_url, true)
                .await
                .context("database connection failed")?,
        );
        Ok((store.clone(), store.clone(), store))
    }
}

fn build_cameras(config: &Config) -> Result<Vec<Camera>> {
    let mut cameras = Vec::with_capacity(config.cameras.len());
    for cam in &config.cameras {
        let role = CameraRole::from_str(&cam.role)
            .map_err(|e| anyhow::anyhow!("camera {}: {}", cam.camera_id, e))?;
        cameras.push(Camera {
            camera_id: cam.camera_id.clone(),
            tenant_id: cam.tenant_id.clone(),
            campus_id: cam.campus_id.clone(),
            role,
            display_name: cam
                .display_name
                .clone()
                .unwrap_or_else(|| cam.camera_id.clone()),
        });
    }
    Ok(cameras)
}

/// Resolve a camera's video source. No capture backend ships in the stock
/// binary, so every source resolves to an idle pipeline; configured URIs get
/// a warning so operators know the camera is not actually reading frames.
fn build_video_source(camera_id: &str, source: Option<&str>) -> Box<dyn VideoSource> {
    match source {
        Some(uri) => {
            tracing::warn!(
                camera_id = %camera_id,
                source = %uri,
                "No capture backend linked for this source — camera will idle"
            );
            Box::new(IdleSource)
        }
        None => {
            tracing::debug!(camera_id = %camera_id, "No video source configured — camera will idle");
            Box::new(IdleSource)
        }
    }
}

fn spawn_recovery(
    queue: Arc<JobQueue>,
    config: &Config,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let stuck_timeout = config.worker.stuck_timeout();
    tokio::spawn(async move {
        let mut tick =
            tokio::time::interval(std::time::Duration::from_secs(RECOVERY_INTERVAL_SECS));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    match queue.recover(stuck_timeout).await {
                        Ok(report) if report.requeued > 0 || report.failed > 0 => {
                            tracing::info!(
                                requeued = report.requeued,
                                failed = report.failed,
                                "Stuck-job recovery pass"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "Stuck-job recovery failed"),
                    }
                }
            }
        }
    })
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    shutdown.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        tracing::info!("Shutdown signal received");
        shutdown.cancel();
    });
}

//! Daemon lifecycle: startup, health check, systemd notify, expiry sweeper

use anyhow::{Context, Result};
use prometheus_client::registry::Registry;
use shardrop_core::config::ShardropConfig;
use shardrop_storage::{BlobStore, RetryPolicy, ShardTransport, StorageCredentials};
use shardrop_transfer::{now_secs, sweep_expired, JsonManifestStore, ManifestStore, SweepReport};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::metrics::{HealthState, SweepMetrics};

pub async fn run(config: ShardropConfig) -> Result<()> {
    info!("daemon starting");

    let credentials = StorageCredentials::from_env();
    let op = shardrop_storage::build_from_core_config(&config.storage, credentials.as_ref())
        .context("building storage operator")?;
    match shardrop_storage::check_health(&op).await {
        Ok(()) => info!(backend = %config.storage.backend, "storage: connected"),
        // sweeps retry on every tick
        Err(e) => warn!(backend = %config.storage.backend, "storage: {e}"),
    }

    let transport = ShardTransport::new(
        op.clone(),
        &config.storage.folder,
        RetryPolicy::from_config(&config.transfer),
    );
    let store = JsonManifestStore::open(&config.manifest.path)
        .await
        .with_context(|| format!("opening manifest store: {}", config.manifest.path.display()))?;

    // Start Prometheus metrics endpoint
    let mut registry = Registry::default();
    let metrics = SweepMetrics::register(&mut registry);
    if let Some(addr) = config.daemon.metrics_addr.clone() {
        let state = HealthState {
            registry: Arc::new(registry),
            operator: op,
        };
        tokio::spawn(async move {
            if let Err(e) = crate::metrics::serve(addr, state).await {
                error!("metrics server failed: {e}");
            }
        });
    }

    notify_ready();

    let interval = Duration::from_secs(config.daemon.sweep_interval_secs.max(1));
    info!(
        interval_secs = interval.as_secs(),
        manifests = %store.path().display(),
        "sweeper: running"
    );
    sweep_loop(&transport, &store, &metrics, interval, shutdown_signal()).await;

    info!("daemon stopped");
    Ok(())
}

/// Sweep on every tick (the first one immediately) until `shutdown` resolves.
/// A sweep already running is allowed to finish.
async fn sweep_loop<S, M>(
    transport: &ShardTransport<S>,
    store: &M,
    metrics: &SweepMetrics,
    interval: Duration,
    shutdown: impl Future<Output = ()>,
) where
    S: BlobStore,
    M: ManifestStore,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
            _ = ticker.tick() => {
                sweep_once(transport, store, metrics, now_secs()).await;
            }
        }
    }
}

async fn sweep_once<S, M>(
    transport: &ShardTransport<S>,
    store: &M,
    metrics: &SweepMetrics,
    now: u64,
) -> Option<SweepReport>
where
    S: BlobStore,
    M: ManifestStore,
{
    let report = match sweep_expired(transport, store, now).await {
        Ok(report) => {
            metrics.record(&report);
            Some(report)
        }
        Err(e) => {
            error!(error = %e, "expiry sweep failed");
            metrics.failures.inc();
            None
        }
    };
    match store.count().await {
        Ok(n) => {
            metrics.manifests.set(n as i64);
        }
        Err(e) => warn!(error = %e, "manifest count unavailable"),
    }
    report
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("ctrl-c handler unavailable: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn notify_ready() {
    // sd_notify(READY=1); no-op outside systemd
    if let Ok(socket) = std::env::var("NOTIFY_SOCKET") {
        #[cfg(unix)]
        {
            use std::os::unix::net::UnixDatagram;
            if let Ok(sock) = UnixDatagram::unbound() {
                if let Err(e) = sock.send_to(b"READY=1\n", &socket) {
                    tracing::debug!(notify_socket = %socket, "sd_notify failed: {e}");
                } else {
                    tracing::debug!(notify_socket = %socket, "sent systemd READY=1");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opendal::Operator;
    use shardrop_core::{Locator, RetrievalCode};
    use shardrop_crypto::KdfParams;
    use shardrop_transfer::{FileManifest, MemoryManifestStore, MANIFEST_VERSION};

    fn transport() -> ShardTransport<Operator> {
        let op = Operator::new(opendal::services::Memory::default())
            .unwrap()
            .finish();
        ShardTransport::new(
            op,
            "shards",
            RetryPolicy {
                max_attempts: 1,
                delay: Duration::from_millis(1),
                request_timeout: Duration::from_secs(5),
            },
        )
    }

    fn manifest(code: &str, locators: Vec<Locator>, expires_at: u64) -> FileManifest {
        FileManifest {
            version: MANIFEST_VERSION,
            retrieval_code: RetrievalCode::parse(code).unwrap(),
            access_secret: "$argon2id$placeholder".into(),
            key_salt: "00".repeat(16),
            kdf: KdfParams::default(),
            file_id: "11".repeat(16),
            shard_size: 64,
            original_size: 64 * locators.len() as u64,
            content_hash: "00".repeat(32),
            shard_locators: locators,
            original_name: "f".into(),
            mime_type: "application/octet-stream".into(),
            created_at: 0,
            expires_at,
        }
    }

    #[tokio::test]
    async fn sweep_once_updates_metrics() {
        let t = transport();
        let store = MemoryManifestStore::new();
        let shards = vec![
            t.upload("a", 0, vec![0; 40]).await.unwrap(),
            t.upload("a", 1, vec![0; 40]).await.unwrap(),
        ];
        store
            .insert_if_absent(&manifest("100100", shards, 10))
            .await
            .unwrap();
        store
            .insert_if_absent(&manifest("200200", Vec::new(), u64::MAX))
            .await
            .unwrap();

        let metrics = SweepMetrics::default();
        let report = sweep_once(&t, &store, &metrics, 100).await.unwrap();

        assert_eq!(report.removed, 1);
        assert_eq!(metrics.sweeps.get(), 1);
        assert_eq!(metrics.expired.get(), 1);
        assert_eq!(metrics.shards_deleted.get(), 2);
        assert_eq!(metrics.failures.get(), 0);
        assert_eq!(metrics.manifests.get(), 1);
    }

    #[tokio::test]
    async fn sweep_loop_stops_on_shutdown() {
        let t = transport();
        let store = MemoryManifestStore::new();
        let metrics = SweepMetrics::default();

        sweep_loop(&t, &store, &metrics, Duration::from_secs(3600), async {}).await;
        assert_eq!(metrics.sweeps.get(), 0);
    }

    #[tokio::test]
    async fn sweep_loop_runs_immediately() {
        let t = transport();
        let store = MemoryManifestStore::new();
        let metrics = SweepMetrics::default();

        let shutdown = tokio::time::sleep(Duration::from_millis(200));
        sweep_loop(&t, &store, &metrics, Duration::from_secs(3600), shutdown).await;
        assert_eq!(metrics.sweeps.get(), 1);
    }
}

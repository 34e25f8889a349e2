//! Integration test: aborts, compensation, tampering and store failures
//!
//! Fault-injecting wrappers around the in-memory blob store and manifest
//! store drive every failure path of the transfer engine.

use opendal::{ErrorKind, Operator};
use secrecy::SecretString;
use shardrop_core::{RetrievalCode, ShardropError, ShardropResult};
use shardrop_crypto::{AccessParams, KdfParams};
use shardrop_storage::{BlobStore, RetryPolicy, ShardTransport};
use shardrop_transfer::{
    now_secs, FileManifest, ManifestStore, MemoryManifestStore, TransferEngine, TransferSettings,
    UploadReceipt, UploadSource,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Blob store that permanently fails puts for one shard index and can refuse deletes.
/// A hanging shard is written but never acknowledged.
struct FaultyStore {
    inner: Operator,
    fail_put_suffix: Option<String>,
    hang_put_suffix: Option<String>,
    fail_remove: bool,
}

impl FaultyStore {
    fn healthy() -> Self {
        Self {
            inner: Operator::new(opendal::services::Memory::default())
                .expect("memory operator")
                .finish(),
            fail_put_suffix: None,
            hang_put_suffix: None,
            fail_remove: false,
        }
    }

    fn hanging_shard(index: u64) -> Self {
        Self {
            hang_put_suffix: Some(format!("/{index:08}")),
            ..Self::healthy()
        }
    }

    fn failing_shard(index: u64) -> Self {
        Self {
            fail_put_suffix: Some(format!("/{index:08}")),
            ..Self::healthy()
        }
    }

    async fn object_count(&self) -> usize {
        self.inner
            .list_with("")
            .recursive(true)
            .await
            .unwrap_or_default()
            .iter()
            .filter(|e| !e.metadata().is_dir())
            .count()
    }
}

impl BlobStore for FaultyStore {
    async fn put(&self, key: &str, body: Vec<u8>) -> opendal::Result<()> {
        if let Some(suffix) = &self.fail_put_suffix {
            if key.ends_with(suffix.as_str()) {
                return Err(opendal::Error::new(ErrorKind::Unexpected, "injected upload fault"));
            }
        }
        let hang = self
            .hang_put_suffix
            .as_deref()
            .is_some_and(|suffix| key.ends_with(suffix));
        BlobStore::put(&self.inner, key, body).await?;
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> opendal::Result<Vec<u8>> {
        BlobStore::get(&self.inner, key).await
    }

    async fn remove(&self, key: &str) -> opendal::Result<()> {
        if self.fail_remove {
            return Err(opendal::Error::new(ErrorKind::Unexpected, "injected delete fault"));
        }
        BlobStore::remove(&self.inner, key).await
    }
}

/// Manifest store that reports the first N codes as taken, or fails outright.
#[derive(Default)]
struct GateStore {
    inner: MemoryManifestStore,
    taken: AtomicU32,
    broken: bool,
}

impl ManifestStore for GateStore {
    async fn insert_if_absent(&self, manifest: &FileManifest) -> ShardropResult<bool> {
        if self.broken {
            return Err(ShardropError::Persistence("injected store outage".into()));
        }
        let collide = self
            .taken
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if collide {
            return Ok(false);
        }
        self.inner.insert_if_absent(manifest).await
    }

    async fn find_by_code(&self, code: &RetrievalCode) -> ShardropResult<Option<FileManifest>> {
        self.inner.find_by_code(code).await
    }

    async fn delete_by_code(&self, code: &RetrievalCode) -> ShardropResult<bool> {
        self.inner.delete_by_code(code).await
    }

    async fn find_expired(&self, now: u64) -> ShardropResult<Vec<FileManifest>> {
        self.inner.find_expired(now).await
    }

    async fn count(&self) -> ShardropResult<usize> {
        self.inner.count().await
    }
}

type Engine = TransferEngine<Arc<FaultyStore>, Arc<GateStore>>;

const SHARD: usize = 256;

fn engine_with(blobs: FaultyStore, store: GateStore, concurrency: usize) -> (Engine, Arc<FaultyStore>) {
    engine_timing_out(blobs, store, concurrency, Duration::from_secs(10))
}

fn engine_timing_out(
    blobs: FaultyStore,
    store: GateStore,
    concurrency: usize,
    request_timeout: Duration,
) -> (Engine, Arc<FaultyStore>) {
    let blobs = Arc::new(blobs);
    let transport = ShardTransport::new(
        blobs.clone(),
        "shards",
        RetryPolicy {
            max_attempts: 2,
            delay: Duration::from_millis(1),
            request_timeout,
        },
    );
    let settings = TransferSettings {
        shard_size: SHARD as u64,
        concurrency,
        code_attempts: 8,
        kdf: KdfParams { iterations: 1000 },
        access: AccessParams {
            mem_cost_kib: 256,
            time_cost: 1,
            parallelism: 1,
        },
        ..Default::default()
    };
    (
        TransferEngine::new(transport, Arc::new(store), settings),
        blobs,
    )
}

fn engine() -> (Engine, Arc<FaultyStore>) {
    engine_with(FaultyStore::healthy(), GateStore::default(), 1)
}

fn make_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i * 13 % 251) as u8).collect()
}

fn pw() -> SecretString {
    SecretString::from("correcthorse")
}

async fn upload(engine: &Engine, data: &[u8]) -> ShardropResult<UploadReceipt> {
    let source = UploadSource {
        size: data.len() as u64,
        original_name: "f.bin".into(),
        mime_type: "application/octet-stream".into(),
    };
    engine.upload(data, source, &pw(), None).await
}

/// Replace a committed manifest with an edited copy.
async fn edit_manifest(engine: &Engine, code: &RetrievalCode, edit: impl FnOnce(&mut FileManifest)) {
    let store = engine.store();
    let mut manifest = store.find_by_code(code).await.unwrap().unwrap();
    edit(&mut manifest);
    assert!(store.delete_by_code(code).await.unwrap());
    assert!(store.insert_if_absent(&manifest).await.unwrap());
}

#[tokio::test]
async fn flipped_byte_in_any_shard_is_integrity_error() {
    let (engine, blobs) = engine();
    let original = make_data(3 * SHARD - 10);
    let receipt = upload(&engine, &original).await.unwrap();
    let manifest = engine.store().find_by_code(&receipt.code).await.unwrap().unwrap();

    for (index, locator) in manifest.shard_locators.iter().enumerate() {
        let pristine = BlobStore::get(&blobs.inner, locator.as_str()).await.unwrap();
        for pos in [0, 12, pristine.len() / 2, pristine.len() - 1] {
            let mut tampered = pristine.clone();
            tampered[pos] ^= 0x01;
            BlobStore::put(&blobs.inner, locator.as_str(), tampered).await.unwrap();

            let err = engine
                .retrieve_bytes(receipt.code.as_str(), &pw(), None)
                .await
                .unwrap_err();
            assert!(
                matches!(err, ShardropError::Integrity { shard: Some(i) } if i == index as u64),
                "shard {index} byte {pos}: got {err:?}"
            );
        }
        BlobStore::put(&blobs.inner, locator.as_str(), pristine).await.unwrap();
    }

    let ok = engine.retrieve_bytes(receipt.code.as_str(), &pw(), None).await.unwrap();
    assert_eq!(ok.data, original);
}

#[tokio::test]
async fn swapped_locators_never_decrypt() {
    let (engine, _) = engine();
    let original = make_data(3 * SHARD);
    let receipt = upload(&engine, &original).await.unwrap();

    edit_manifest(&engine, &receipt.code, |m| m.shard_locators.swap(0, 2)).await;

    let err = engine
        .retrieve_bytes(receipt.code.as_str(), &pw(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ShardropError::Integrity { shard: Some(0) }), "got {err:?}");
}

#[tokio::test]
async fn truncated_locator_list_is_detected() {
    let (engine, _) = engine();
    let original = make_data(3 * SHARD);
    let receipt = upload(&engine, &original).await.unwrap();

    // Keep the manifest self-consistent so only the shard AAD can catch it
    edit_manifest(&engine, &receipt.code, |m| {
        m.shard_locators.pop();
        m.original_size = 2 * SHARD as u64;
    })
    .await;

    let err = engine
        .retrieve_bytes(receipt.code.as_str(), &pw(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ShardropError::Integrity { .. }), "got {err:?}");
}

#[tokio::test]
async fn shard_from_another_file_is_rejected() {
    let (engine, _) = engine();
    let a = upload(&engine, &make_data(2 * SHARD)).await.unwrap();
    let b = upload(&engine, &make_data(2 * SHARD)).await.unwrap();
    let b_manifest = engine.store().find_by_code(&b.code).await.unwrap().unwrap();

    edit_manifest(&engine, &a.code, |m| {
        m.shard_locators[1] = b_manifest.shard_locators[1].clone();
    })
    .await;

    let err = engine
        .retrieve_bytes(a.code.as_str(), &pw(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ShardropError::Integrity { shard: Some(1) }), "got {err:?}");
}

#[tokio::test]
async fn undersized_shard_is_transport_error() {
    let (engine, blobs) = engine();
    let receipt = upload(&engine, &make_data(2 * SHARD)).await.unwrap();
    let manifest = engine.store().find_by_code(&receipt.code).await.unwrap().unwrap();

    BlobStore::put(&blobs.inner, manifest.shard_locators[1].as_str(), Vec::new())
        .await
        .unwrap();

    let err = engine
        .retrieve_bytes(receipt.code.as_str(), &pw(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ShardropError::Transport { shard: Some(1), .. }), "got {err:?}");
}

#[tokio::test]
async fn failed_shard_aborts_and_deletes_stored_shards() {
    for concurrency in [1, 3] {
        let (engine, blobs) = engine_with(FaultyStore::failing_shard(2), GateStore::default(), concurrency);
        let err = upload(&engine, &make_data(5 * SHARD)).await.unwrap_err();

        assert!(
            matches!(err, ShardropError::Transport { shard: Some(2), .. }),
            "concurrency {concurrency}: got {err:?}"
        );
        assert_eq!(engine.store().count().await.unwrap(), 0, "no manifest may be committed");
        assert_eq!(blobs.object_count().await, 0, "stored shards must be compensated");
    }
}

#[tokio::test]
async fn unacknowledged_shard_is_deleted_on_abort() {
    for concurrency in [1, 2] {
        let (engine, blobs) = engine_timing_out(
            FaultyStore::hanging_shard(1),
            GateStore::default(),
            concurrency,
            Duration::from_millis(50),
        );
        let err = upload(&engine, &make_data(3 * SHARD)).await.unwrap_err();

        assert!(
            matches!(err, ShardropError::Transport { shard: Some(1), .. }),
            "concurrency {concurrency}: got {err:?}"
        );
        assert_eq!(engine.store().count().await.unwrap(), 0);
        assert_eq!(
            blobs.object_count().await,
            0,
            "concurrency {concurrency}: the timed-out shard was written and must be deleted"
        );
    }
}

#[tokio::test]
async fn failed_compensation_still_reports_original_error() {
    let blobs = FaultyStore {
        fail_remove: true,
        ..FaultyStore::failing_shard(2)
    };
    let (engine, blobs) = engine_with(blobs, GateStore::default(), 1);

    let err = upload(&engine, &make_data(4 * SHARD)).await.unwrap_err();
    assert!(matches!(err, ShardropError::Transport { shard: Some(2), .. }));
    // shards 0 and 1 are orphans (logged), but nothing references them
    assert_eq!(blobs.object_count().await, 2);
    assert_eq!(engine.store().count().await.unwrap(), 0);
}

#[tokio::test]
async fn manifest_store_outage_deletes_shards() {
    let store = GateStore {
        broken: true,
        ..Default::default()
    };
    let (engine, blobs) = engine_with(FaultyStore::healthy(), store, 1);

    let err = upload(&engine, &make_data(3 * SHARD)).await.unwrap_err();
    assert!(matches!(err, ShardropError::Persistence(_)), "got {err:?}");
    assert_eq!(blobs.object_count().await, 0);
}

#[tokio::test]
async fn code_collisions_are_rerolled() {
    let store = GateStore {
        taken: AtomicU32::new(5),
        ..Default::default()
    };
    let (engine, _) = engine_with(FaultyStore::healthy(), store, 1);

    let receipt = upload(&engine, &make_data(SHARD)).await.unwrap();
    assert_eq!(engine.store().count().await.unwrap(), 1);
    assert!(engine.store().find_by_code(&receipt.code).await.unwrap().is_some());
}

#[tokio::test]
async fn exhausted_code_attempts_fail_cleanly() {
    let store = GateStore {
        taken: AtomicU32::new(1_000),
        ..Default::default()
    };
    let (engine, blobs) = engine_with(FaultyStore::healthy(), store, 1);

    let err = upload(&engine, &make_data(2 * SHARD)).await.unwrap_err();
    assert!(err.to_string().contains("no free retrieval code after 8 attempts"), "{err}");
    assert_eq!(blobs.object_count().await, 0);
}

#[tokio::test]
async fn expired_and_unknown_codes_look_the_same() {
    let (engine, _) = engine();
    let receipt = upload(&engine, &make_data(SHARD)).await.unwrap();

    edit_manifest(&engine, &receipt.code, |m| m.expires_at = now_secs() - 1).await;

    let expired = engine
        .retrieve_bytes(receipt.code.as_str(), &pw(), None)
        .await
        .unwrap_err();
    assert!(matches!(expired, ShardropError::NotFound));

    let other = if receipt.code.as_str() == "000000" { "000001" } else { "000000" };
    let unknown = engine.retrieve_bytes(other, &pw(), None).await.unwrap_err();
    assert_eq!(expired.to_string(), unknown.to_string());
}

#[tokio::test]
async fn failed_download_leaves_no_file() {
    let tmp = tempfile::TempDir::new().unwrap();
    let (engine, blobs) = engine();
    let receipt = upload(&engine, &make_data(3 * SHARD)).await.unwrap();
    let manifest = engine.store().find_by_code(&receipt.code).await.unwrap().unwrap();

    let mut last = BlobStore::get(&blobs.inner, manifest.shard_locators[2].as_str())
        .await
        .unwrap();
    let n = last.len();
    last[n - 1] ^= 0xFF;
    BlobStore::put(&blobs.inner, manifest.shard_locators[2].as_str(), last)
        .await
        .unwrap();

    let dest = tmp.path().join("out.bin");
    let err = engine
        .retrieve_to_path(receipt.code.as_str(), &pw(), &dest, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ShardropError::Integrity { shard: Some(2) }));
    assert!(!dest.exists());
    assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
}

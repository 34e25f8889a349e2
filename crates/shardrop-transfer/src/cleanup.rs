//! Expiry sweep: delete expired manifests together with their shards.
//!
//! Shards go first. A manifest is removed only once all of its shards are
//! gone, so a partly failed record is picked up again by the next sweep
//! instead of leaking shards. Deletes are idempotent, so overlapping sweeps
//! are harmless.

use serde::Serialize;
use shardrop_core::ShardropResult;
use shardrop_storage::{BlobStore, ShardTransport};
use tracing::{info, warn};

use crate::store::ManifestStore;

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Expired manifests found
    pub expired: usize,
    /// Manifests deleted (with all of their shards)
    pub removed: usize,
    pub shards_deleted: usize,
    /// Manifests left in place because a shard or manifest delete failed
    pub failed: usize,
}

/// Delete every manifest with `expires_at <= now` and its shards.
///
/// Only listing the expired set can fail the sweep as a whole; errors on a
/// single record are counted in `failed` and logged.
pub async fn sweep_expired<S, M>(
    transport: &ShardTransport<S>,
    store: &M,
    now: u64,
) -> ShardropResult<SweepReport>
where
    S: BlobStore,
    M: ManifestStore,
{
    let expired = store.find_expired(now).await?;
    let mut report = SweepReport {
        expired: expired.len(),
        ..Default::default()
    };

    for manifest in expired {
        let code = &manifest.retrieval_code;
        let total = manifest.shard_locators.len();
        let left = transport.delete_all(&manifest.shard_locators).await;
        report.shards_deleted += total - left.len();

        if !left.is_empty() {
            warn!(code = %code, remaining = left.len(), "expired manifest kept, shard deletes failed");
            report.failed += 1;
            continue;
        }

        match store.delete_by_code(code).await {
            Ok(_) => report.removed += 1,
            Err(e) => {
                warn!(code = %code, error = %e, "expired manifest delete failed");
                report.failed += 1;
            }
        }
    }

    if report.expired > 0 {
        info!(
            expired = report.expired,
            removed = report.removed,
            shards = report.shards_deleted,
            failed = report.failed,
            "expiry sweep finished"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::tests::sample;
    use crate::store::MemoryManifestStore;
    use opendal::Operator;
    use shardrop_core::RetrievalCode;
    use shardrop_storage::RetryPolicy;
    use std::time::Duration;

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

    #[tokio::test]
    async fn sweeps_only_expired_records() {
        let t = transport();
        let store = MemoryManifestStore::new();

        let mut old = sample("100001", 2);
        old.shard_locators = vec![
            t.upload("old", 0, vec![1; 40]).await.unwrap(),
            t.upload("old", 1, vec![1; 40]).await.unwrap(),
        ];
        old.expires_at = 500;
        let mut live = sample("100002", 1);
        live.shard_locators = vec![t.upload("live", 0, vec![2; 40]).await.unwrap()];
        live.expires_at = 5_000;
        store.insert_if_absent(&old).await.unwrap();
        store.insert_if_absent(&live).await.unwrap();

        let report = sweep_expired(&t, &store, 1_000).await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                expired: 1,
                removed: 1,
                shards_deleted: 2,
                failed: 0
            }
        );

        let code = |s: &str| RetrievalCode::parse(s).unwrap();
        assert!(store.find_by_code(&code("100001")).await.unwrap().is_none());
        assert!(store.find_by_code(&code("100002")).await.unwrap().is_some());
        assert!(t.fetch(&old.shard_locators[0], 0).await.is_err());
        assert!(t.fetch(&live.shard_locators[0], 0).await.is_ok());

        // second run finds nothing
        let again = sweep_expired(&t, &store, 1_000).await.unwrap();
        assert_eq!(again, SweepReport::default());
    }

    #[tokio::test]
    async fn already_missing_shards_do_not_block_removal() {
        let t = transport();
        let store = MemoryManifestStore::new();
        let mut gone = sample("100003", 3);
        gone.expires_at = 1;
        store.insert_if_absent(&gone).await.unwrap();

        let report = sweep_expired(&t, &store, 10).await.unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.failed, 0);
    }
}

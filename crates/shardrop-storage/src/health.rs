//! Storage reachability probe used by `shardrop status` and the daemon's `/readyz`

use anyhow::Result;
use opendal::Operator;

/// Listing the root is the cheapest call every backend supports.
pub async fn check_health(op: &Operator) -> Result<()> {
    let info = op.info();
    op.list("/").await.map(|_| ()).map_err(|e| {
        anyhow::anyhow!(
            "{} storage (root '{}') is unreachable: {e}",
            info.scheme(),
            info.root()
        )
    })
}

pub async fn is_healthy(op: &Operator) -> bool {
    match check_health(op).await {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(error = %e, "storage not ready");
            false
        }
    }
}

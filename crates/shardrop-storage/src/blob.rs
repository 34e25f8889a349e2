//! The object-storage seam used by `ShardTransport`

use opendal::Operator;
use std::future::Future;
use std::sync::Arc;

/// Minimal blob interface: whole-object put, get and remove by key.
///
/// Errors are plain `opendal::Error`s so that wrappers (fault injection,
/// counting) can hand back the same kinds the real backends produce.
pub trait BlobStore: Send + Sync {
    fn put(&self, key: &str, body: Vec<u8>) -> impl Future<Output = opendal::Result<()>> + Send;

    fn get(&self, key: &str) -> impl Future<Output = opendal::Result<Vec<u8>>> + Send;

    fn remove(&self, key: &str) -> impl Future<Output = opendal::Result<()>> + Send;
}

impl BlobStore for Operator {
    async fn put(&self, key: &str, body: Vec<u8>) -> opendal::Result<()> {
        self.write(key, body).await.map(|_| ())
    }

    async fn get(&self, key: &str) -> opendal::Result<Vec<u8>> {
        Ok(self.read(key).await?.to_vec())
    }

    async fn remove(&self, key: &str) -> opendal::Result<()> {
        self.delete(key).await
    }
}

impl<T: BlobStore> BlobStore for Arc<T> {
    async fn put(&self, key: &str, body: Vec<u8>) -> opendal::Result<()> {
        (**self).put(key, body).await
    }

    async fn get(&self, key: &str) -> opendal::Result<Vec<u8>> {
        (**self).get(key).await
    }

    async fn remove(&self, key: &str) -> opendal::Result<()> {
        (**self).remove(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_op() -> Operator {
        Operator::new(opendal::services::Memory::default())
            .unwrap()
            .finish()
    }

    #[tokio::test]
    async fn operator_put_get_remove() {
        let op = memory_op();
        BlobStore::put(&op, "a/b", b"payload".to_vec()).await.unwrap();
        assert_eq!(BlobStore::get(&op, "a/b").await.unwrap(), b"payload");

        BlobStore::remove(&op, "a/b").await.unwrap();
        let err = BlobStore::get(&op, "a/b").await.unwrap_err();
        assert_eq!(err.kind(), opendal::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn arc_delegates() {
        let op = Arc::new(memory_op());
        op.put("k", vec![1, 2, 3]).await.unwrap();
        assert_eq!(op.get("k").await.unwrap(), vec![1, 2, 3]);
    }
}

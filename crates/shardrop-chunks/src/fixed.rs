//! Fixed-size sharding
//!
//! A payload of `L` bytes with shard size `S` becomes `ceil(L / S)` shards:
//! every shard holds exactly `S` bytes except the last, which holds the
//! remainder (`1..=S` bytes). A payload that is an exact multiple of `S` does
//! not get a trailing empty shard, and an empty payload has no valid plan.
//!
//! Shard index order is the only reassembly order.

use std::io;
use std::ops::Range;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Layout of one payload split into fixed-size shards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardPlan {
    total_len: u64,
    shard_size: u64,
}

impl ShardPlan {
    /// `None` when either the payload or the shard size is zero.
    pub fn new(total_len: u64, shard_size: u64) -> Option<Self> {
        if total_len == 0 || shard_size == 0 {
            return None;
        }
        Some(Self {
            total_len,
            shard_size,
        })
    }

    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    pub fn shard_size(&self) -> u64 {
        self.shard_size
    }

    /// Number of shards: `ceil(total_len / shard_size)`, always >= 1
    pub fn count(&self) -> u64 {
        self.total_len.div_ceil(self.shard_size)
    }

    /// Byte range of shard `index` within the payload
    pub fn range(&self, index: u64) -> Option<Range<u64>> {
        if index >= self.count() {
            return None;
        }
        let start = index * self.shard_size;
        let end = (start + self.shard_size).min(self.total_len);
        Some(start..end)
    }

    /// Plaintext length of shard `index`
    pub fn len_of(&self, index: u64) -> Option<u64> {
        self.range(index).map(|r| r.end - r.start)
    }

    pub fn ranges(&self) -> impl Iterator<Item = Range<u64>> + '_ {
        (0..self.count()).filter_map(move |i| self.range(i))
    }
}

/// Split an in-memory payload into shard slices.
///
/// Returns an empty list for empty data or a zero shard size.
pub fn split_slice(data: &[u8], shard_size: usize) -> Vec<&[u8]> {
    if shard_size == 0 {
        return vec![];
    }
    data.chunks(shard_size).collect()
}

/// Reads a payload of declared length one shard at a time.
///
/// Holds at most one shard of plaintext. Fails if the source ends early or
/// carries bytes beyond the declared length.
pub struct ShardReader<R> {
    inner: R,
    plan: ShardPlan,
    next: u64,
}

impl<R: AsyncRead + Unpin> ShardReader<R> {
    pub fn new(inner: R, plan: ShardPlan) -> Self {
        Self {
            inner,
            plan,
            next: 0,
        }
    }

    pub fn plan(&self) -> ShardPlan {
        self.plan
    }

    /// Next `(index, plaintext)` pair, or `None` after the last shard.
    pub async fn next_shard(&mut self) -> io::Result<Option<(u64, Vec<u8>)>> {
        let index = self.next;
        let Some(len) = self.plan.len_of(index) else {
            let mut probe = [0u8; 1];
            if self.inner.read(&mut probe).await? > 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("source is longer than the declared {} bytes", self.plan.total_len),
                ));
            }
            return Ok(None);
        };

        let len = usize::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "shard too large"))?;
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf).await.map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "source ended inside shard {index} (declared {} bytes)",
                        self.plan.total_len
                    ),
                )
            } else {
                e
            }
        })?;

        self.next += 1;
        tracing::trace!(shard = index, bytes = len, "read shard");
        Ok(Some((index, buf)))
    }
}

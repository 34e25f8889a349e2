use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of digits in a retrieval code
pub const CODE_LEN: usize = 6;

/// Opaque reference to one stored shard, as handed out by object storage
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Locator(String);

impl Locator {
    pub fn new(key: impl Into<String>) -> Self {
        Locator(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The short numeric code a recipient types to find a shared file
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RetrievalCode(String);

impl RetrievalCode {
    /// Draw a uniformly random code from the thread-local CSPRNG.
    pub fn generate() -> Self {
        let n: u32 = rand::thread_rng().gen_range(0..10u32.pow(CODE_LEN as u32));
        RetrievalCode(format!("{n:0width$}", width = CODE_LEN))
    }

    /// Parse user input; surrounding whitespace is ignored.
    pub fn parse(input: &str) -> Option<Self> {
        let s = input.trim();
        if s.len() == CODE_LEN && s.bytes().all(|b| b.is_ascii_digit()) {
            Some(RetrievalCode(s.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RetrievalCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RetrievalCode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        RetrievalCode::parse(&value).ok_or_else(|| format!("invalid retrieval code: {value:?}"))
    }
}

impl From<RetrievalCode> for String {
    fn from(code: RetrievalCode) -> Self {
        code.0
    }
}

/// Lifecycle of a single transfer.
///
/// ```text
/// Idle -> Deriving -> UploadingShards(i/n) -> Finalizing -> Done
///   \________\______________\___________________\______-> Failed(reason)
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferPhase {
    Idle,
    /// Deriving the shard key from the password
    Deriving,
    /// Shard `index` of `total` is being moved
    UploadingShards { index: u64, total: u64 },
    /// All shards stored; writing the manifest
    Finalizing,
    Done,
    Failed(String),
}

impl TransferPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferPhase::Done | TransferPhase::Failed(_))
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(&self, next: &TransferPhase) -> bool {
        use TransferPhase::*;
        match (self, next) {
            (Done, _) | (Failed(_), _) => false,
            (_, Failed(_)) => true,
            (Idle, Deriving) => true,
            (Deriving, UploadingShards { index: 0, .. }) => true,
            (UploadingShards { index: a, total: t }, UploadingShards { index: b, total: u }) => {
                t == u && *b == a + 1 && b < t
            }
            (UploadingShards { index, total }, Finalizing) => index + 1 == *total,
            (Finalizing, Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TransferPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferPhase::Idle => f.write_str("idle"),
            TransferPhase::Deriving => f.write_str("deriving key"),
            TransferPhase::UploadingShards { index, total } => {
                write!(f, "shard {}/{}", index + 1, total)
            }
            TransferPhase::Finalizing => f.write_str("finalizing"),
            TransferPhase::Done => f.write_str("done"),
            TransferPhase::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

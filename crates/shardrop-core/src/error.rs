use thiserror::Error;

pub type ShardropResult<T> = Result<T, ShardropError>;

#[derive(Debug, Error)]
pub enum ShardropError {
    /// Bad input caught before any network I/O (missing file, weak password, malformed code)
    #[error("invalid request: {0}")]
    Validation(String),

    /// A shard upload or fetch failed after the retry budget was spent
    #[error("{}", transport_message(.shard, .message))]
    Transport { shard: Option<u64>, message: String },

    /// No live manifest for the code; expired and never-existed look the same
    #[error("not found")]
    NotFound,

    /// Access password did not match the stored access secret
    #[error("wrong password")]
    Auth,

    /// AEAD authentication or reassembly check failed
    #[error("{}", integrity_message(.shard))]
    Integrity { shard: Option<u64> },

    /// Manifest store unavailable or write failed
    #[error("manifest store error: {0}")]
    Persistence(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ShardropError {
    pub fn transport(shard: Option<u64>, message: impl Into<String>) -> Self {
        ShardropError::Transport {
            shard,
            message: message.into(),
        }
    }

    pub fn integrity(shard: Option<u64>) -> Self {
        ShardropError::Integrity { shard }
    }

    /// Shard index carried by transport and integrity failures
    pub fn shard(&self) -> Option<u64> {
        match self {
            ShardropError::Transport { shard, .. } | ShardropError::Integrity { shard } => *shard,
            _ => None,
        }
    }
}

fn transport_message(shard: &Option<u64>, message: &str) -> String {
    match shard {
        Some(i) => format!("transport error on shard {i}: {message}"),
        None => format!("transport error: {message}"),
    }
}

fn integrity_message(shard: &Option<u64>) -> String {
    match shard {
        Some(i) => format!("wrong password or corrupted data (shard {i})"),
        None => "wrong password or corrupted data".to_string(),
    }
}

pub mod config;
pub mod error;
pub mod types;

pub use error::{ShardropError, ShardropResult};
pub use types::{Locator, RetrievalCode, TransferPhase};

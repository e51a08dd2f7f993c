use thiserror::Error;

use crate::{DecodingError, ledger::TxId};

#[derive(Error, Debug)]
pub enum Error {
    #[error("decoding error: {0}")]
    Decoding(#[from] DecodingError),

    #[error("rocksdb error: {0}")]
    Rocks(#[from] rocksdb::Error),

    #[error("table {0} does not exist")]
    MissingTable(&'static str),

    #[error("spent transaction {} not found in utxo table", hex::encode(.0))]
    MissingSpentTransaction(TxId),

    #[error("output {}:{vout} is not unspent", hex::encode(.tx_id))]
    MissingSpentOutput { tx_id: TxId, vout: u32 },

    #[error("insufficient funds: {available} available, {required} required")]
    InsufficientFunds { available: u64, required: u64 },

    #[error("chain already has a genesis block")]
    GenesisExists,

    #[error("chain has no blocks, run init first")]
    EmptyChain,

    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("{0}")]
    Custom(String),
}

impl Error {
    pub fn custom(error: impl std::fmt::Display) -> Error {
        Error::Custom(format!("{error}"))
    }

    /// Failure of the underlying key-value store, as opposed to an error in the data itself.
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, Error::Rocks(_) | Error::MissingTable(_))
    }

    /// Whether repeating the same operation could succeed. Invariant violations reproduce until
    /// the utxo table is rebuilt with a reindex, so only storage failures qualify.
    pub fn is_retryable(&self) -> bool {
        self.is_storage_failure()
    }
}

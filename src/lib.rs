//! Unspent transaction output index over an append-only ledger.
//!
//! The [`utxo_set::UtxoSet`] keeps, for every transaction that still has unspent outputs, the
//! list of those outputs. It is rebuilt from a full scan of the [`ledger::Ledger`] by
//! `reindex`, advanced block by block with `update`, and queried by owner with `find_utxo` and
//! `find_spendable_outputs`.

pub use storage::encdec::{DecodingError, DecodingResult};

pub mod chain;
pub mod error;
pub mod ledger;
pub mod storage;
pub mod transfer;
pub mod utxo_set;

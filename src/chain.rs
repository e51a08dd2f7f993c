use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::{
    error::Error,
    ledger::{
        Block, Transaction, TxOutput,
        block_store::{BlockStore, BlocksByHeightKV},
    },
    storage::{self, kv_store::StorageHandler, table::Table},
    transfer::build_transfer,
    utxo_set::{UtxoSet, UtxoSetKV},
};

const DEFAULT_SUBSIDY: u64 = 50;

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Config {
    /// Value created by each block's coinbase
    pub subsidy: Option<u64>,
}

impl Config {
    pub fn subsidy(&self) -> u64 {
        self.subsidy.unwrap_or(DEFAULT_SUBSIDY)
    }
}

/// Ledger and utxo index stored in one database, kept in step with each other.
#[derive(Clone)]
pub struct Chain {
    storage: StorageHandler,
    blocks: BlockStore,
    utxo_set: UtxoSet,
    subsidy: u64,
}

impl Chain {
    pub fn open(
        path: &Path,
        storage_config: &storage::Config,
        config: &Config,
    ) -> Result<Self, Error> {
        let storage = StorageHandler::open(
            path,
            storage_config.rocksdb_memory_budget_bytes(),
            &[BlocksByHeightKV::CF_NAME, UtxoSetKV::CF_NAME],
        )?;

        Ok(Self::new(storage, config.subsidy()))
    }

    pub fn new(storage: StorageHandler, subsidy: u64) -> Self {
        Self {
            blocks: BlockStore::new(storage.clone()),
            utxo_set: UtxoSet::new(storage.clone()),
            storage,
            subsidy,
        }
    }

    pub fn blocks(&self) -> &BlockStore {
        &self.blocks
    }

    pub fn utxo_set(&self) -> &UtxoSet {
        &self.utxo_set
    }

    /// Creates the genesis block paying the subsidy to `owner`, then builds the index from it.
    pub fn init(&self, owner: &[u8]) -> Result<Block, Error> {
        if self.blocks.tip()?.is_some() {
            return Err(Error::GenesisExists);
        }

        let coinbase = Transaction::coinbase(0, vec![TxOutput::new(self.subsidy, owner)]);
        let genesis = self.blocks.next_block(vec![coinbase])?;

        let mut task = self.storage.begin_task();
        self.blocks.stage_block(&mut task, &genesis);
        self.storage.apply_task(task.finalize())?;

        self.reindex()?;

        info!("created genesis block {}", hex::encode(genesis.hash));

        Ok(genesis)
    }

    /// Appends a block holding a coinbase to `miner` followed by `transactions`. The block and
    /// its effect on the utxo table are written together, or not at all.
    pub fn mine(&self, transactions: Vec<Transaction>, miner: &[u8]) -> Result<Block, Error> {
        let tip = self.blocks.tip()?.ok_or(Error::EmptyChain)?;

        let coinbase =
            Transaction::coinbase(tip.height + 1, vec![TxOutput::new(self.subsidy, miner)]);

        let mut all = Vec::with_capacity(transactions.len() + 1);
        all.push(coinbase);
        all.extend(transactions);

        let block = self.blocks.next_block(all)?;

        let mut task = self.storage.begin_task();
        self.utxo_set.stage_update(&mut task, &block)?;
        self.blocks.stage_block(&mut task, &block);
        self.storage.apply_task(task.finalize())?;

        info!(
            "mined block {} ({}) with {} txs, {} bytes",
            block.height,
            hex::encode(block.hash),
            block.transactions.len(),
            block.encoded_size()
        );

        Ok(block)
    }

    /// Sends `amount` from `from` to `to` in a newly mined block.
    pub fn transfer(
        &self,
        from: &[u8],
        to: &[u8],
        amount: u64,
        miner: &[u8],
    ) -> Result<Block, Error> {
        let tx = build_transfer(&self.utxo_set, from, to, amount)?;

        self.mine(vec![tx], miner)
    }

    pub fn reindex(&self) -> Result<(), Error> {
        self.utxo_set.reindex(&self.blocks)
    }

    pub fn balance(&self, owner: &[u8]) -> Result<u64, Error> {
        Ok(self
            .utxo_set
            .find_utxo(owner)?
            .iter()
            .map(|out| out.value)
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::ledger::{
        Ledger,
        tests::{ALICE, BOB, CAROL},
    };

    fn open(path: &Path) -> Chain {
        let storage_config = storage::Config {
            rocksdb_memory_budget: Some(0.0625),
        };

        Chain::open(path, &storage_config, &Config { subsidy: None }).unwrap()
    }

    #[test]
    fn init_funds_owner_once() {
        let dir = tempdir().unwrap();
        let chain = open(dir.path());

        assert!(matches!(chain.mine(vec![], ALICE), Err(Error::EmptyChain)));

        let genesis = chain.init(ALICE).unwrap();

        assert_eq!(genesis.height, 0);
        assert_eq!(chain.balance(ALICE).unwrap(), DEFAULT_SUBSIDY);
        assert!(matches!(chain.init(BOB), Err(Error::GenesisExists)));
    }

    #[test]
    fn transfers_move_value_and_keep_index_consistent() {
        let dir = tempdir().unwrap();
        let chain = open(dir.path());

        chain.init(ALICE).unwrap();
        chain.transfer(ALICE, BOB, 20, CAROL).unwrap();
        chain.transfer(BOB, CAROL, 5, ALICE).unwrap();

        assert_eq!(chain.balance(ALICE).unwrap(), 30 + 50);
        assert_eq!(chain.balance(BOB).unwrap(), 15);
        assert_eq!(chain.balance(CAROL).unwrap(), 50 + 5);
        assert_eq!(chain.blocks().tip().unwrap().unwrap().height, 2);

        let incremental = chain.utxo_set().entries().unwrap();
        chain.reindex().unwrap();
        assert_eq!(chain.utxo_set().entries().unwrap(), incremental);
    }

    #[test]
    fn failed_transfer_does_not_advance_tip() {
        let dir = tempdir().unwrap();
        let chain = open(dir.path());

        chain.init(ALICE).unwrap();

        let err = chain.transfer(BOB, ALICE, 10, BOB).unwrap_err();

        assert!(matches!(err, Error::InsufficientFunds { .. }));
        assert_eq!(chain.blocks().tip().unwrap().unwrap().height, 0);
    }

    #[test]
    fn block_spending_unknown_output_is_not_appended() {
        let dir = tempdir().unwrap();
        let chain = open(dir.path());

        chain.init(ALICE).unwrap();

        let bogus = Transaction::new(
            vec![crate::ledger::TxInput {
                tx_id: [3; 32],
                vout: 0,
            }],
            vec![TxOutput::new(1_000, BOB)],
        );

        assert!(matches!(
            chain.mine(vec![bogus], BOB),
            Err(Error::MissingSpentTransaction(_))
        ));
        assert_eq!(chain.blocks().tip().unwrap().unwrap().height, 0);
        assert_eq!(chain.balance(BOB).unwrap(), 0);
        assert_eq!(
            chain
                .blocks()
                .all_unspent_outputs_by_transaction()
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn chain_survives_reopen() {
        let dir = tempdir().unwrap();

        {
            let chain = open(dir.path());
            chain.init(ALICE).unwrap();
            chain.transfer(ALICE, BOB, 50, ALICE).unwrap();
        }

        let chain = open(dir.path());
        assert_eq!(chain.balance(BOB).unwrap(), 50);
        assert_eq!(chain.balance(ALICE).unwrap(), 50);
    }
}

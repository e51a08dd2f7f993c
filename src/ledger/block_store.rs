//! Append-only chain of blocks, persisted next to the utxo table.

use tracing::debug;

use crate::{
    define_table,
    error::Error,
    storage::kv_store::{StorageHandler, StorageTask},
};

use super::{Block, Ledger, Transaction, UnspentOutputsByTx, collect_unspent};

// heights are varuint encoded, so key order is height order
define_table! {
    name: BlocksByHeightKV,
    key_type: u64,
    value_type: Block,
    column_family: "blocks"
}

#[derive(Clone)]
pub struct BlockStore {
    storage: StorageHandler,
}

impl BlockStore {
    pub fn new(storage: StorageHandler) -> Self {
        Self { storage }
    }

    /// Most recent block, if any.
    pub fn tip(&self) -> Result<Option<Block>, Error> {
        let reader = self.storage.reader();
        let mut iter = reader.iter_kvs::<BlocksByHeightKV>(true)?;

        iter.next().transpose().map(|kv| kv.map(|(_, block)| block))
    }

    pub fn block_at(&self, height: u64) -> Result<Option<Block>, Error> {
        self.storage.reader().get::<BlocksByHeightKV>(&height)
    }

    /// Builds the block which would extend the current tip. Nothing is stored.
    pub fn next_block(&self, transactions: Vec<Transaction>) -> Result<Block, Error> {
        let block = match self.tip()? {
            Some(tip) => Block::new(tip.height + 1, tip.hash, transactions),
            None => Block::new(0, Default::default(), transactions),
        };

        Ok(block)
    }

    /// Queues the block for writing as part of `task`.
    pub fn stage_block(&self, task: &mut StorageTask, block: &Block) {
        debug!(
            "staging block {} ({})",
            block.height,
            hex::encode(block.hash)
        );

        task.set::<BlocksByHeightKV>(&block.height, block);
    }

    /// Every block from the tip down to genesis.
    pub fn blocks_newest_first(&self) -> Result<Vec<Block>, Error> {
        let reader = self.storage.reader();

        reader
            .iter_kvs::<BlocksByHeightKV>(true)?
            .map(|kv| kv.map(|(_, block)| block))
            .collect()
    }
}

impl Ledger for BlockStore {
    fn all_unspent_outputs_by_transaction(&self) -> Result<UnspentOutputsByTx, Error> {
        let reader = self.storage.reader();

        let blocks = reader
            .iter_kvs::<BlocksByHeightKV>(true)?
            .map(|kv| kv.map(|(_, block)| block));

        collect_unspent(blocks)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::{
        ledger::{
            TxOutput,
            tests::{ALICE, BOB, spend},
        },
        storage::table::Table,
    };

    fn open(path: &std::path::Path) -> BlockStore {
        let storage =
            StorageHandler::open(path, 64 * 1024 * 1024, &[BlocksByHeightKV::CF_NAME]).unwrap();

        BlockStore::new(storage)
    }

    fn append(store: &BlockStore, transactions: Vec<Transaction>) -> Block {
        let block = store.next_block(transactions).unwrap();

        let mut task = store.storage.begin_task();
        store.stage_block(&mut task, &block);
        store.storage.apply_task(task.finalize()).unwrap();

        block
    }

    #[test]
    fn empty_store_has_no_tip() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        assert_eq!(store.tip().unwrap(), None);
        assert_eq!(store.next_block(vec![]).unwrap().height, 0);
    }

    #[test]
    fn blocks_link_to_the_tip() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        let genesis = append(&store, vec![Transaction::coinbase(0, vec![])]);
        // cross the one-byte varuint boundary to check ordering
        let last = (1..=260)
            .map(|height| append(&store, vec![Transaction::coinbase(height, vec![])]))
            .last()
            .unwrap();

        assert_eq!(last.height, 260);
        assert_eq!(store.tip().unwrap(), Some(last.clone()));
        assert_eq!(store.block_at(0).unwrap(), Some(genesis.clone()));
        assert_eq!(
            store.block_at(260).unwrap().map(|b| b.prev_hash),
            store.block_at(259).unwrap().map(|b| b.hash)
        );

        let heights = store
            .blocks_newest_first()
            .unwrap()
            .iter()
            .map(|b| b.height)
            .collect::<Vec<_>>();
        assert_eq!(heights, (0..=260).rev().collect::<Vec<_>>());
    }

    #[test]
    fn persisted_chain_scan_matches_in_memory_scan() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        let cb0 = Transaction::coinbase(0, vec![TxOutput::new(50, ALICE)]);
        let b0 = append(&store, vec![cb0.clone()]);

        let pay = Transaction::new(
            vec![spend(&cb0, 0)],
            vec![TxOutput::new(15, BOB), TxOutput::new(35, ALICE)],
        );
        let b1 = append(
            &store,
            vec![Transaction::coinbase(1, vec![TxOutput::new(50, BOB)]), pay],
        );

        assert_eq!(
            store.all_unspent_outputs_by_transaction().unwrap(),
            vec![b0, b1].all_unspent_outputs_by_transaction().unwrap()
        );
    }
}

//! Ledger data model and the full-history unspent output scan.

use std::collections::{HashMap, HashSet};

use bitcoin::hashes::{Hash, sha256d};
use chainstate_macros::{Decode, Encode};
use indexmap::IndexMap;

use crate::{
    error::Error,
    storage::encdec::{Encode, EncodeBuilder},
};

pub mod block_store;

pub type TxId = [u8; 32];
pub type BlockHash = [u8; 32];

/// Unspent outputs of every transaction that still has at least one, in the shape stored in
/// the utxo table.
pub type UnspentOutputsByTx = IndexMap<TxId, Vec<UnspentOutput>>;

#[derive(Encode, Decode, Clone, Debug, PartialEq, Eq)]
pub struct TxOutput {
    pub value: u64,
    /// Locking condition, the hash of the key which may spend the output
    pub pub_key_hash: Vec<u8>,
}

impl TxOutput {
    pub fn new(value: u64, pub_key_hash: impl Into<Vec<u8>>) -> Self {
        Self {
            value,
            pub_key_hash: pub_key_hash.into(),
        }
    }

    pub fn is_locked_with_key(&self, pub_key_hash: &[u8]) -> bool {
        self.pub_key_hash == pub_key_hash
    }
}

/// Output together with its position in the creating transaction. Removing an earlier output
/// from a record doesn't renumber the rest.
#[derive(Encode, Decode, Clone, Debug, PartialEq, Eq)]
pub struct UnspentOutput {
    pub vout: u32,
    pub output: TxOutput,
}

/// Reference to the output being spent.
#[derive(Encode, Decode, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TxInput {
    pub tx_id: TxId,
    pub vout: u32,
}

#[derive(Encode, Decode, Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub id: TxId,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        let id = Self::compute_id(&inputs, &outputs, 0);

        Self {
            id,
            inputs,
            outputs,
        }
    }

    /// Creates new value out of nothing. The height salts the id, so coinbases paying the same
    /// outputs at different heights don't collide.
    pub fn coinbase(height: u64, outputs: Vec<TxOutput>) -> Self {
        let id = Self::compute_id(&[], &outputs, height);

        Self {
            id,
            inputs: Vec::new(),
            outputs,
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.is_empty()
    }

    fn compute_id(inputs: &[TxInput], outputs: &[TxOutput], salt: u64) -> TxId {
        let preimage = EncodeBuilder::new()
            .append(&inputs.to_vec())
            .append(&outputs.to_vec())
            .append(&salt)
            .build();

        sha256d::Hash::hash(&preimage).to_byte_array()
    }

    /// All outputs, numbered by their position.
    pub fn unspent_outputs(&self) -> Vec<UnspentOutput> {
        self.outputs
            .iter()
            .enumerate()
            .map(|(vout, output)| UnspentOutput {
                vout: vout as u32,
                output: output.clone(),
            })
            .collect()
    }
}

#[derive(Encode, Decode, Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub height: u64,
    pub prev_hash: BlockHash,
    pub hash: BlockHash,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(height: u64, prev_hash: BlockHash, transactions: Vec<Transaction>) -> Self {
        let tx_ids = transactions.iter().map(|tx| tx.id).collect::<Vec<_>>();

        let preimage = EncodeBuilder::new()
            .append(&height)
            .append(&prev_hash)
            .append(&tx_ids)
            .build();

        Self {
            height,
            prev_hash,
            hash: sha256d::Hash::hash(&preimage).to_byte_array(),
            transactions,
        }
    }

    pub fn encoded_size(&self) -> usize {
        self.encode().len()
    }
}

/// Authoritative source of transactions the utxo table is derived from.
pub trait Ledger {
    /// Computes, from the complete transaction history, the unspent outputs of every
    /// transaction that has any.
    fn all_unspent_outputs_by_transaction(&self) -> Result<UnspentOutputsByTx, Error>;
}

impl Ledger for [Block] {
    fn all_unspent_outputs_by_transaction(&self) -> Result<UnspentOutputsByTx, Error> {
        collect_unspent(self.iter().rev().cloned().map(Ok))
    }
}

impl Ledger for Vec<Block> {
    fn all_unspent_outputs_by_transaction(&self) -> Result<UnspentOutputsByTx, Error> {
        self.as_slice().all_unspent_outputs_by_transaction()
    }
}

/// Walks the chain from the tip back to genesis. Every spend is seen before the output it
/// spends, so an output is unspent exactly when no spend for it has been collected by the time
/// its transaction is reached. Transactions within a block are walked in reverse for the same
/// reason.
pub fn collect_unspent<I>(blocks_newest_first: I) -> Result<UnspentOutputsByTx, Error>
where
    I: Iterator<Item = Result<Block, Error>>,
{
    let mut spent: HashMap<TxId, HashSet<u32>> = HashMap::new();
    let mut unspent = UnspentOutputsByTx::new();

    for block in blocks_newest_first {
        let block = block?;

        for tx in block.transactions.iter().rev() {
            let spent_vouts = spent.remove(&tx.id).unwrap_or_default();

            let outputs = tx
                .unspent_outputs()
                .into_iter()
                .filter(|utxo| !spent_vouts.contains(&utxo.vout))
                .collect::<Vec<_>>();

            if !outputs.is_empty() {
                unspent.insert(tx.id, outputs);
            }

            if !tx.is_coinbase() {
                for input in &tx.inputs {
                    spent.entry(input.tx_id).or_default().insert(input.vout);
                }
            }
        }
    }

    Ok(unspent)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::encdec::Decode;

    pub const ALICE: &[u8] = b"alice";
    pub const BOB: &[u8] = b"bob";
    pub const CAROL: &[u8] = b"carol";

    /// Appends a block holding `transactions` to `chain`.
    pub fn push_block(chain: &mut Vec<Block>, transactions: Vec<Transaction>) -> Block {
        let prev_hash = chain.last().map(|b| b.hash).unwrap_or_default();
        let block = Block::new(chain.len() as u64, prev_hash, transactions);
        chain.push(block.clone());
        block
    }

    pub fn spend(tx: &Transaction, vout: u32) -> TxInput {
        TxInput { tx_id: tx.id, vout }
    }

    #[test]
    fn coinbase_ids_differ_by_height() {
        let out = vec![TxOutput::new(50, ALICE)];

        assert_ne!(
            Transaction::coinbase(0, out.clone()).id,
            Transaction::coinbase(1, out).id
        );
    }

    #[test]
    fn block_round_trips_through_codec() {
        let mut chain = Vec::new();
        let cb = Transaction::coinbase(0, vec![TxOutput::new(50, ALICE)]);
        let tx = Transaction::new(
            vec![spend(&cb, 0)],
            vec![TxOutput::new(20, BOB), TxOutput::new(30, ALICE)],
        );
        let block = push_block(&mut chain, vec![cb, tx]);

        let decoded = Block::decode_all(&block.encode()).unwrap();

        assert_eq!(decoded, block);
        assert_eq!(decoded.encoded_size(), block.encoded_size());
    }

    #[test]
    fn scan_skips_spent_outputs() {
        let mut chain = Vec::new();
        let cb0 = Transaction::coinbase(0, vec![TxOutput::new(50, ALICE)]);
        push_block(&mut chain, vec![cb0.clone()]);

        let pay = Transaction::new(
            vec![spend(&cb0, 0)],
            vec![TxOutput::new(20, BOB), TxOutput::new(30, ALICE)],
        );
        let cb1 = Transaction::coinbase(1, vec![TxOutput::new(50, CAROL)]);
        push_block(&mut chain, vec![cb1.clone(), pay.clone()]);

        let unspent = chain.all_unspent_outputs_by_transaction().unwrap();

        assert_eq!(unspent.len(), 2);
        assert!(!unspent.contains_key(&cb0.id));
        assert_eq!(unspent[&cb1.id], cb1.unspent_outputs());
        assert_eq!(unspent[&pay.id], pay.unspent_outputs());
    }

    #[test]
    fn scan_handles_spends_within_one_block() {
        let mut chain = Vec::new();
        let cb0 = Transaction::coinbase(0, vec![TxOutput::new(50, ALICE)]);
        push_block(&mut chain, vec![cb0.clone()]);

        let first = Transaction::new(
            vec![spend(&cb0, 0)],
            vec![TxOutput::new(10, BOB), TxOutput::new(40, ALICE)],
        );
        let second = Transaction::new(vec![spend(&first, 1)], vec![TxOutput::new(40, CAROL)]);
        let cb1 = Transaction::coinbase(1, vec![TxOutput::new(50, ALICE)]);
        push_block(&mut chain, vec![cb1, first.clone(), second.clone()]);

        let unspent = chain.all_unspent_outputs_by_transaction().unwrap();

        assert_eq!(
            unspent[&first.id],
            vec![UnspentOutput {
                vout: 0,
                output: TxOutput::new(10, BOB)
            }]
        );
        assert_eq!(unspent[&second.id], second.unspent_outputs());
        assert!(!unspent.contains_key(&cb0.id));
    }

    #[test]
    fn empty_ledger_has_no_unspent_outputs() {
        let chain: Vec<Block> = Vec::new();

        assert!(chain.all_unspent_outputs_by_transaction().unwrap().is_empty());
    }
}

/// The utxo table maps a transaction id to the outputs of that transaction which are still
/// unspent.
///
/// It is derived entirely from the ledger: [`UtxoSet::reindex`] rebuilds it from a full scan and
/// [`UtxoSet::update`] applies one block at a time. Only transactions with at least one unspent
/// output have an entry, empty records are deleted rather than stored.
///
/// # Table Definition
/// - **Key**: [`TxId`] - raw transaction id bytes.
/// - **Value**: `Vec<UnspentOutput>` - the unspent outputs, in creation order, each tagged with
///   its original output index.
use indexmap::IndexMap;
use tracing::{debug, info, trace};

use crate::{
    define_table,
    error::Error,
    ledger::{Block, Ledger, TxId, TxInput, TxOutput, UnspentOutput},
    storage::kv_store::{StorageHandler, StorageTask},
};

define_table! {
    name: UtxoSetKV,
    key_type: TxId,
    value_type: Vec<UnspentOutput>,
    column_family: "utxo"
}

/// Outputs picked to fund a spend, grouped by transaction.
pub type SpendableOutputs = IndexMap<TxId, Vec<u32>>;

#[derive(Clone)]
pub struct UtxoSet {
    storage: StorageHandler,
}

impl UtxoSet {
    pub fn new(storage: StorageHandler) -> Self {
        Self { storage }
    }

    /// Rebuilds the table from the ledger's unspent output scan.
    ///
    /// The table is dropped and recreated first, then populated in one batch. Readers running
    /// between the two steps can find the table missing or empty.
    pub fn reindex<L: Ledger + ?Sized>(&self, ledger: &L) -> Result<(), Error> {
        if !self.storage.drop_table::<UtxoSetKV>()? {
            debug!("utxo table did not exist, nothing to drop");
        }

        self.storage.create_table::<UtxoSetKV>()?;

        let utxos = ledger.all_unspent_outputs_by_transaction()?;

        let mut task = self.storage.begin_task();

        for (tx_id, outputs) in &utxos {
            task.set::<UtxoSetKV>(tx_id, outputs);
        }

        self.storage.apply_task(task.finalize())?;

        info!("reindexed utxo table with {} transactions", utxos.len());

        Ok(())
    }

    /// Applies every transaction of the block, in order, as one atomic write.
    pub fn update(&self, block: &Block) -> Result<(), Error> {
        let mut task = self.storage.begin_task();

        self.stage_update(&mut task, block)?;

        self.storage.apply_task(task.finalize())
    }

    /// Queues the effect of the block onto `task` without committing it, so the caller can
    /// commit it together with other writes.
    pub fn stage_update(&self, task: &mut StorageTask, block: &Block) -> Result<(), Error> {
        debug!(
            "applying block {} ({} txs) to utxo table",
            block.height,
            block.transactions.len()
        );

        for tx in &block.transactions {
            if !tx.is_coinbase() {
                for input in &tx.inputs {
                    Self::spend(task, input)?;
                }
            }

            let outputs = tx.unspent_outputs();

            if outputs.is_empty() {
                trace!("tx {} has no outputs, nothing to store", hex::encode(tx.id));
                continue;
            }

            task.set::<UtxoSetKV>(&tx.id, &outputs);
        }

        Ok(())
    }

    /// Removes the output the input refers to from its record, deleting the record if that was
    /// the last output.
    fn spend(task: &mut StorageTask, input: &TxInput) -> Result<(), Error> {
        let outputs = task
            .get::<UtxoSetKV>(&input.tx_id)?
            .ok_or(Error::MissingSpentTransaction(input.tx_id))?;

        let remaining = outputs
            .iter()
            .filter(|utxo| utxo.vout != input.vout)
            .cloned()
            .collect::<Vec<_>>();

        if remaining.len() == outputs.len() {
            return Err(Error::MissingSpentOutput {
                tx_id: input.tx_id,
                vout: input.vout,
            });
        }

        trace!(
            "spent {}:{}, {} outputs left",
            hex::encode(input.tx_id),
            input.vout,
            remaining.len()
        );

        if remaining.is_empty() {
            task.delete::<UtxoSetKV>(&input.tx_id);
        } else {
            task.set::<UtxoSetKV>(&input.tx_id, &remaining);
        }

        Ok(())
    }

    /// Every unspent output locked with `pub_key_hash`, in table order.
    pub fn find_utxo(&self, pub_key_hash: &[u8]) -> Result<Vec<TxOutput>, Error> {
        let reader = self.storage.reader();

        let mut utxos = Vec::new();

        for kv in reader.iter_kvs::<UtxoSetKV>(false)? {
            let (_, outputs) = kv?;

            utxos.extend(
                outputs
                    .into_iter()
                    .map(|utxo| utxo.output)
                    .filter(|out| out.is_locked_with_key(pub_key_hash)),
            );
        }

        Ok(utxos)
    }

    /// Greedily picks outputs locked with `pub_key_hash`, in table order, until their total
    /// reaches `amount`.
    ///
    /// The returned total is below `amount` when the owner doesn't have enough; that is for
    /// the caller to handle. It is always the exact sum of the selected outputs: an output
    /// which would push the total past `u64::MAX` is not selected.
    pub fn find_spendable_outputs(
        &self,
        pub_key_hash: &[u8],
        amount: u64,
    ) -> Result<(u64, SpendableOutputs), Error> {
        let reader = self.storage.reader();

        let mut accumulated = 0u64;
        let mut selected = SpendableOutputs::new();

        for kv in reader.iter_kvs::<UtxoSetKV>(false)? {
            let (tx_id, outputs) = kv?;

            for utxo in outputs {
                if !utxo.output.is_locked_with_key(pub_key_hash) || accumulated >= amount {
                    continue;
                }

                let Some(total) = accumulated.checked_add(utxo.output.value) else {
                    debug!(
                        "skipping {}:{}, total would overflow",
                        hex::encode(tx_id),
                        utxo.vout
                    );
                    continue;
                };

                accumulated = total;
                selected.entry(tx_id).or_default().push(utxo.vout);
            }
        }

        Ok((accumulated, selected))
    }

    /// Raw view of the whole table, in table order.
    pub fn entries(&self) -> Result<Vec<(TxId, Vec<UnspentOutput>)>, Error> {
        let reader = self.storage.reader();

        reader.iter_kvs::<UtxoSetKV>(false)?.collect()
    }
}

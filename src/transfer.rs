use tracing::debug;

use crate::{
    error::Error,
    ledger::{Transaction, TxInput, TxOutput},
    utxo_set::UtxoSet,
};

/// Builds a transaction moving `amount` from `from` to `to`, funded from `from`'s unspent
/// outputs, with any excess returned to `from` as change.
///
/// Unsigned: key management and signatures are out of scope.
pub fn build_transfer(
    utxo_set: &UtxoSet,
    from: &[u8],
    to: &[u8],
    amount: u64,
) -> Result<Transaction, Error> {
    if amount == 0 {
        return Err(Error::custom("transfer amount must be positive"));
    }

    let (available, selected) = utxo_set.find_spendable_outputs(from, amount)?;

    if available < amount {
        return Err(Error::InsufficientFunds {
            available,
            required: amount,
        });
    }

    let inputs = selected
        .into_iter()
        .flat_map(|(tx_id, vouts)| vouts.into_iter().map(move |vout| TxInput { tx_id, vout }))
        .collect::<Vec<_>>();

    let mut outputs = vec![TxOutput::new(amount, to)];

    if available > amount {
        outputs.push(TxOutput::new(available - amount, from));
    }

    debug!(
        "built transfer of {amount} spending {} inputs worth {available}",
        inputs.len()
    );

    Ok(Transaction::new(inputs, outputs))
}

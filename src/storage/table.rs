use std::marker::PhantomData;

use rocksdb::DBIteratorWithThreadMode;

use crate::error::Error;

use super::{
    encdec::{Decode, Encode},
    kv_store::Db,
};

/// Defines a Table, stored in its own column family.
///
/// # Example
/// ```ignore
/// define_table! {
///     name: UtxoSetKV,
///     key_type: TxId,
///     value_type: Vec<UnspentOutput>,
///     column_family: "utxo"
/// }
/// ```
#[macro_export]
macro_rules! define_table {
    {
        name: $name:ident,
        key_type: $key_type:ty,
        value_type: $value_type:ty,
        column_family: $cf_name:expr
    } => {
        pub struct $name;

        impl $crate::storage::table::Table for $name {
            const CF_NAME: &'static str = $cf_name;

            type Key = $key_type;
            type Value = $value_type;
        }
    };
}

/// A typed view over one column family.
///
/// Keeping each table in its own column family means a table can be dropped and recreated as a
/// unit, which is how the UTXO table is wiped on reindex.
pub trait Table {
    /// Name of the column family backing the table.
    const CF_NAME: &'static str;

    /// Key type for the table.
    type Key: Encode + Decode;

    /// Value type for the table.
    type Value: Encode + Decode;

    fn encode_key(key: &Self::Key) -> Vec<u8> {
        key.encode()
    }
}

/// Decodes raw key-values from a column family iterator into the table's types.
pub struct TableIterator<'a, T: Table> {
    inner: DBIteratorWithThreadMode<'a, Db>,
    _table: PhantomData<T>,
}

impl<'a, T: Table> TableIterator<'a, T> {
    pub fn new(inner: DBIteratorWithThreadMode<'a, Db>) -> Self {
        Self {
            inner,
            _table: PhantomData,
        }
    }
}

impl<T: Table> Iterator for TableIterator<'_, T> {
    type Item = Result<(T::Key, T::Value), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|res| -> Self::Item {
            let (raw_key, raw_value) = res?;

            Ok((
                T::Key::decode_all(&raw_key)?,
                T::Value::decode_all(&raw_value)?,
            ))
        })
    }
}

use std::{path::Path, sync::Arc};

use indexmap::IndexMap;
use rocksdb::{
    Cache, ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode,
    MultiThreaded, Options, SnapshotWithThreadMode, WriteBatch,
};
use sysinfo::System;
use tracing::{debug, info, trace};

use crate::error::Error;

use super::{
    encdec::{Decode, Encode},
    table::{Table, TableIterator},
};

/// Multi-threaded mode lets column families be created and dropped through a shared handle.
pub type Db = DBWithThreadMode<MultiThreaded>;

pub type RawKey = Vec<u8>;
pub type RawValue = Vec<u8>;

pub enum StorageAction {
    Set(RawValue),
    Delete,
}

#[derive(Clone)]
pub struct StorageHandler {
    pub db: Arc<Db>,
    // options every table (column family) is created with, including ones created after open
    table_opts: Options,
}

impl StorageHandler {
    /// Opens (or creates) the database at `path`, making sure each of `tables` exists. Tables
    /// already on disk are opened too, whether listed or not.
    pub fn open(path: &Path, memory_budget: u64, tables: &[&'static str]) -> Result<Self, Error> {
        info!("opening db at {}...", path.display());

        let mut db_opts = Options::default();
        db_opts.create_missing_column_families(true);
        db_opts.create_if_missing(true);

        info!(
            "using rocksdb memory budget: {:.2} GB ({} bytes)",
            memory_budget as f64 / 1024.0 / 1024.0 / 1024.0,
            memory_budget
        );

        let block_cache_budget = (memory_budget as f64 * 0.75) as usize;
        let memtable_budget = (memory_budget as f64 * 0.25) as usize;

        let cache = Cache::new_lru_cache(block_cache_budget);

        let sys = System::new_all();
        let cpus = std::cmp::max(2, sys.cpus().len()) as u32;
        db_opts.set_max_background_jobs(cpus as i32);
        db_opts.set_max_subcompactions(cpus);

        let mut table_opts = Options::default();

        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_block_cache(&cache);
        table_opts.set_block_based_table_factory(&block_opts);

        let per_memtable_cap = 512 * 1024 * 1024;
        table_opts.set_write_buffer_size(std::cmp::min(memtable_budget / 2, per_memtable_cap));
        table_opts.set_max_write_buffer_number(2);

        // a fresh database has no column families to list yet
        let mut cf_names = if path.join("CURRENT").exists() {
            Db::list_cf(&db_opts, path)?
        } else {
            Vec::new()
        };

        for table in tables {
            if !cf_names.iter().any(|name| name == table) {
                cf_names.push(table.to_string());
            }
        }

        debug!("opening column families: {cf_names:?}");

        let cfs = cf_names
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(name, table_opts.clone()));

        let db = Db::open_cf_descriptors(&db_opts, path, cfs)?;

        Ok(Self {
            db: Arc::new(db),
            table_opts,
        })
    }

    pub fn has_table<T: Table>(&self) -> bool {
        self.db.cf_handle(T::CF_NAME).is_some()
    }

    /// Drops the table and all of its data. Returns whether the table existed.
    pub fn drop_table<T: Table>(&self) -> Result<bool, Error> {
        if !self.has_table::<T>() {
            return Ok(false);
        }

        trace!("dropping table {}", T::CF_NAME);

        self.db.drop_cf(T::CF_NAME)?;

        Ok(true)
    }

    pub fn create_table<T: Table>(&self) -> Result<(), Error> {
        trace!("creating table {}", T::CF_NAME);

        self.db.create_cf(T::CF_NAME, &self.table_opts)?;

        Ok(())
    }

    /// Point-in-time view of every table.
    pub fn reader(&self) -> Reader<'_> {
        Reader {
            db: &self.db,
            snapshot: self.db.snapshot(),
        }
    }

    /// Starts buffering writes which are later committed together by `apply_task`. Reads made
    /// through the task see its own pending writes on top of a snapshot taken now.
    pub fn begin_task(&self) -> StorageTask<'_> {
        StorageTask {
            reader: self.reader(),
            write_buffer: IndexMap::new(),
        }
    }

    /// Commits every write of the task in a single atomic write batch.
    pub fn apply_task(&self, task: FinalizedTask) -> Result<(), Error> {
        let mut wb = WriteBatch::default();

        for (cf_name, actions) in task.write_buffer {
            let cf = self
                .db
                .cf_handle(cf_name)
                .ok_or(Error::MissingTable(cf_name))?;

            for (key, action) in actions {
                match action {
                    StorageAction::Set(value) => wb.put_cf(&cf, key, value),
                    StorageAction::Delete => wb.delete_cf(&cf, key),
                }
            }
        }

        debug!("writing batch of {} actions", wb.len());

        self.db.write(wb)?;

        Ok(())
    }
}

pub struct Reader<'a> {
    db: &'a Db,
    snapshot: SnapshotWithThreadMode<'a, Db>,
}

impl Reader<'_> {
    pub fn get<T>(&self, key: &T::Key) -> Result<Option<T::Value>, Error>
    where
        T: Table,
    {
        let res = self.get_raw::<T>(&T::encode_key(key))?;

        match res {
            Some(bytes) => Ok(Some(T::Value::decode_all(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_raw<T: Table>(&self, raw_key: &[u8]) -> Result<Option<RawValue>, Error> {
        let cf = self
            .db
            .cf_handle(T::CF_NAME)
            .ok_or(Error::MissingTable(T::CF_NAME))?;

        Ok(self.snapshot.get_cf(&cf, raw_key)?)
    }

    /// Iterates the whole table in key order (or reverse key order).
    pub fn iter_kvs<T: Table>(&self, reverse: bool) -> Result<TableIterator<'_, T>, Error> {
        let cf = self
            .db
            .cf_handle(T::CF_NAME)
            .ok_or(Error::MissingTable(T::CF_NAME))?;

        let mode = if reverse {
            IteratorMode::End
        } else {
            IteratorMode::Start
        };

        Ok(TableIterator::new(self.snapshot.iterator_cf(&cf, mode)))
    }
}

pub struct StorageTask<'a> {
    reader: Reader<'a>,
    // writes are held here, per table, until the task is applied
    write_buffer: IndexMap<&'static str, IndexMap<RawKey, StorageAction>>,
}

impl StorageTask<'_> {
    pub fn get<T>(&self, key: &T::Key) -> Result<Option<T::Value>, Error>
    where
        T: Table,
    {
        let encoded_key = T::encode_key(key);

        // Check the write buffer first
        if let Some(action) = self
            .write_buffer
            .get(T::CF_NAME)
            .and_then(|actions| actions.get(&encoded_key))
        {
            trace!("fetching {} from writebuf", hex::encode(&encoded_key));

            return match action {
                StorageAction::Set(value) => Ok(Some(T::Value::decode_all(value)?)),
                StorageAction::Delete => Ok(None),
            };
        }

        match self.reader.get_raw::<T>(&encoded_key)? {
            Some(bytes) => Ok(Some(T::Value::decode_all(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn set<T>(&mut self, key: &T::Key, value: &T::Value)
    where
        T: Table,
    {
        let encoded_key = T::encode_key(key);

        trace!("setting {}:{}", T::CF_NAME, hex::encode(&encoded_key));

        self.write_buffer
            .entry(T::CF_NAME)
            .or_default()
            .insert(encoded_key, StorageAction::Set(value.encode()));
    }

    pub fn delete<T>(&mut self, key: &T::Key)
    where
        T: Table,
    {
        let encoded_key = T::encode_key(key);

        trace!("deleting {}:{}", T::CF_NAME, hex::encode(&encoded_key));

        self.write_buffer
            .entry(T::CF_NAME)
            .or_default()
            .insert(encoded_key, StorageAction::Delete);
    }

    pub fn finalize(self) -> FinalizedTask {
        FinalizedTask {
            write_buffer: self.write_buffer,
        }
    }
}

pub struct FinalizedTask {
    pub write_buffer: IndexMap<&'static str, IndexMap<RawKey, StorageAction>>,
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::define_table;

    define_table! {
        name: NumbersKV,
        key_type: u64,
        value_type: Vec<u8>,
        column_family: "numbers"
    }

    const TEST_BUDGET: u64 = 64 * 1024 * 1024;

    fn open(path: &Path) -> StorageHandler {
        StorageHandler::open(path, TEST_BUDGET, &[NumbersKV::CF_NAME]).unwrap()
    }

    #[test]
    fn task_reads_its_own_writes() {
        let dir = tempdir().unwrap();
        let storage = open(dir.path());

        let mut task = storage.begin_task();
        task.set::<NumbersKV>(&1, &vec![1, 1]);
        assert_eq!(task.get::<NumbersKV>(&1).unwrap(), Some(vec![1, 1]));

        task.delete::<NumbersKV>(&1);
        assert_eq!(task.get::<NumbersKV>(&1).unwrap(), None);

        task.set::<NumbersKV>(&2, &vec![2]);
        storage.apply_task(task.finalize()).unwrap();

        let reader = storage.reader();
        assert_eq!(reader.get::<NumbersKV>(&1).unwrap(), None);
        assert_eq!(reader.get::<NumbersKV>(&2).unwrap(), Some(vec![2]));
    }

    #[test]
    fn unapplied_task_writes_nothing() {
        let dir = tempdir().unwrap();
        let storage = open(dir.path());

        let mut task = storage.begin_task();
        task.set::<NumbersKV>(&1, &vec![1]);
        drop(task);

        assert_eq!(storage.reader().get::<NumbersKV>(&1).unwrap(), None);
    }

    #[test]
    fn reader_is_a_snapshot() {
        let dir = tempdir().unwrap();
        let storage = open(dir.path());

        let reader = storage.reader();

        let mut task = storage.begin_task();
        task.set::<NumbersKV>(&5, &vec![5]);
        storage.apply_task(task.finalize()).unwrap();

        assert_eq!(reader.get::<NumbersKV>(&5).unwrap(), None);
        assert_eq!(storage.reader().get::<NumbersKV>(&5).unwrap(), Some(vec![5]));
    }

    #[test]
    fn iterates_in_key_order() {
        let dir = tempdir().unwrap();
        let storage = open(dir.path());

        let mut task = storage.begin_task();
        for n in [300u64, 2, 70_000, 1] {
            task.set::<NumbersKV>(&n, &vec![]);
        }
        storage.apply_task(task.finalize()).unwrap();

        let reader = storage.reader();
        let keys = reader
            .iter_kvs::<NumbersKV>(false)
            .unwrap()
            .map(|kv| kv.unwrap().0)
            .collect::<Vec<_>>();
        assert_eq!(keys, vec![1, 2, 300, 70_000]);

        let newest = reader.iter_kvs::<NumbersKV>(true).unwrap().next();
        assert_eq!(newest.unwrap().unwrap().0, 70_000);
    }

    #[test]
    fn drop_and_create_table() {
        let dir = tempdir().unwrap();
        let storage = open(dir.path());

        let mut task = storage.begin_task();
        task.set::<NumbersKV>(&1, &vec![1]);
        storage.apply_task(task.finalize()).unwrap();

        assert!(storage.drop_table::<NumbersKV>().unwrap());
        assert!(!storage.drop_table::<NumbersKV>().unwrap());
        assert!(matches!(
            storage.reader().get::<NumbersKV>(&1),
            Err(Error::MissingTable("numbers"))
        ));

        storage.create_table::<NumbersKV>().unwrap();
        assert_eq!(storage.reader().get::<NumbersKV>(&1).unwrap(), None);
    }

    #[test]
    fn reopen_keeps_tables() {
        let dir = tempdir().unwrap();

        {
            let storage = open(dir.path());
            let mut task = storage.begin_task();
            task.set::<NumbersKV>(&9, &vec![9]);
            storage.apply_task(task.finalize()).unwrap();
        }

        let storage = StorageHandler::open(dir.path(), TEST_BUDGET, &[]).unwrap();
        assert_eq!(storage.reader().get::<NumbersKV>(&9).unwrap(), Some(vec![9]));
    }

    #[test]
    fn open_fails_when_path_is_a_file() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("not-a-db");
        std::fs::write(&file, b"junk").unwrap();

        let err = StorageHandler::open(&file, TEST_BUDGET, &[NumbersKV::CF_NAME])
            .err()
            .unwrap();

        assert!(err.is_storage_failure());
    }
}

use redb::TableDefinition;

use super::db::{Database, DatabaseError};
use super::models::IndexRecord;
use super::tables::*;

impl Database {
    // ========================================================================
    // Index records
    // ========================================================================

    /// Store a record under both its path key and its content digest.
    /// Both rows are written in one transaction.
    pub fn put_index_record(
        &self,
        path_key: &str,
        record: &IndexRecord,
    ) -> Result<(), DatabaseError> {
        debug_assert!(!path_key.is_empty(), "path key must not be empty");
        debug_assert!(!record.digest.is_empty(), "record digest must not be empty");

        let data = rmp_serde::to_vec_named(record)?;
        let write_txn = self.begin_write()?;
        {
            let mut paths = write_txn.open_table(PATH_RECORDS)?;
            paths.insert(path_key, data.as_slice())?;

            let mut digests = write_txn.open_table(DIGEST_RECORDS)?;
            digests.insert(record.digest.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Get the record stored under a path key
    pub fn record_by_path_key(&self, path_key: &str) -> Result<Option<IndexRecord>, DatabaseError> {
        self.get_record(PATH_RECORDS, path_key)
    }

    /// Get the record stored under a content digest
    pub fn record_by_digest(&self, digest: &str) -> Result<Option<IndexRecord>, DatabaseError> {
        self.get_record(DIGEST_RECORDS, digest)
    }

    fn get_record(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> Result<Option<IndexRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(table)?;

        match table.get(key)? {
            Some(data) => {
                let record: IndexRecord = rmp_serde::from_slice(data.value())?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }
}

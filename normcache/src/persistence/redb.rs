use super::{decode_record, encode_record, KeyPattern, PersistenceBackend, Row};
use crate::error::CacheError;
use crate::record::{CacheKey, Record};
use log::debug;
use redb::{Database, ReadOnlyTable, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition, TableError};
use std::path::{Path, PathBuf};

const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("records");

/// Records in one redb table, key to JSON bytes.
pub struct RedbBackend {
    path: PathBuf,
    db: Database,
}

impl RedbBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        let db = Database::create(&path)?;
        debug!("redb backend opened at {}", path.display());
        Ok(Self { path, db })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `body` over the records table, or yields `empty` if it was never created.
    fn read<T>(&self, empty: T, body: impl FnOnce(&ReadOnlyTable<&'static str, &'static [u8]>) -> Result<T, CacheError>) -> Result<T, CacheError> {
        let tx = self.db.begin_read()?;
        match tx.open_table(RECORDS) {
            Ok(table) => body(&table),
            Err(TableError::TableDoesNotExist(_)) => Ok(empty),
            Err(e) => Err(e.into()),
        }
    }
}

impl PersistenceBackend for RedbBackend {
    fn name(&self) -> &'static str {
        "redb"
    }

    fn create_schema_if_needed(&mut self) -> Result<(), CacheError> {
        let tx = self.db.begin_write()?;
        tx.open_table(RECORDS)?;
        tx.commit()?;
        Ok(())
    }

    fn select(&self, keys: &[CacheKey]) -> Result<Vec<Row>, CacheError> {
        self.read(Vec::new(), |table| {
            let mut out = Vec::with_capacity(keys.len());
            for key in keys {
                if let Some(guard) = table.get(key.as_str())? {
                    out.push((key.clone(), decode_record(key, guard.value())));
                }
            }
            debug!("redb select {} keys -> {} rows", keys.len(), out.len());
            Ok(out)
        })
    }

    fn select_all(&self) -> Result<Vec<Row>, CacheError> {
        self.read(Vec::new(), |table| {
            let mut out = Vec::new();
            for entry in table.iter()? {
                let (k, v) = entry?;
                let key = CacheKey::new(k.value());
                let decoded = decode_record(&key, v.value());
                out.push((key, decoded));
            }
            Ok(out)
        })
    }

    fn upsert(&mut self, records: Vec<Record>) -> Result<(), CacheError> {
        if records.is_empty() {
            return Ok(());
        }
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(RECORDS)?;
            for record in &records {
                let text = encode_record(record)?;
                table.insert(record.key().as_str(), text.as_bytes())?;
            }
        }
        tx.commit()?;
        debug!("redb upserted {} records", records.len());
        Ok(())
    }

    fn delete(&mut self, key: &CacheKey) -> Result<bool, CacheError> {
        Ok(self.delete_many(std::slice::from_ref(key))? > 0)
    }

    fn delete_many(&mut self, keys: &[CacheKey]) -> Result<usize, CacheError> {
        let tx = self.db.begin_write()?;
        let mut deleted = 0;
        {
            let mut table = tx.open_table(RECORDS)?;
            for key in keys {
                if table.remove(key.as_str())?.is_some() {
                    deleted += 1;
                }
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    fn delete_matching(&mut self, pattern: &KeyPattern) -> Result<usize, CacheError> {
        let tx = self.db.begin_write()?;
        let deleted = {
            let mut table = tx.open_table(RECORDS)?;
            let before = table.len()?;
            table.retain(|key, _| !pattern.matches(key))?;
            before - table.len()?
        };
        tx.commit()?;
        Ok(deleted as usize)
    }

    fn clear(&mut self, vacuum: bool) -> Result<(), CacheError> {
        let tx = self.db.begin_write()?;
        tx.delete_table(RECORDS)?;
        tx.open_table(RECORDS)?;
        tx.commit()?;
        if vacuum {
            let compacted = self.db.compact()?;
            debug!("redb compaction of {} ran: {}", self.path.display(), compacted);
        }
        Ok(())
    }

    fn record_count(&self) -> Result<usize, CacheError> {
        self.read(0, |table| Ok(table.len()? as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Value;

    fn temp_db() -> PathBuf {
        std::env::temp_dir().join(format!("normcache_redb_{}.redb", rand::random::<u64>()))
    }

    fn luke() -> Record {
        let mut r = Record::new("Human:1000");
        r.insert("__typename", "Human");
        r.insert("name", "Luke Skywalker");
        r.insert("friends", Value::List(vec![Value::reference("Human:1002")]));
        r
    }

    #[test]
    fn reads_before_schema_creation_are_empty() {
        let backend = RedbBackend::open(temp_db()).unwrap();
        assert_eq!(backend.record_count().unwrap(), 0);
        assert!(backend.select(&[CacheKey::new("Human:1000")]).unwrap().is_empty());
    }

    #[test]
    fn records_persist_across_reopen() {
        let path = temp_db();
        {
            let mut backend = RedbBackend::open(&path).unwrap();
            backend.create_schema_if_needed().unwrap();
            backend.upsert(vec![luke(), Record::new("QUERY_ROOT")]).unwrap();
        }
        let backend = RedbBackend::open(&path).unwrap();
        let rows = backend.select(&[CacheKey::new("Human:1000")]).unwrap();
        assert_eq!(rows, vec![(CacheKey::new("Human:1000"), Ok(luke()))]);
        assert_eq!(backend.select_all().unwrap().len(), 2);
    }

    #[test]
    fn deletes_by_pattern_and_clears() {
        let mut backend = RedbBackend::open(temp_db()).unwrap();
        backend.create_schema_if_needed().unwrap();
        backend.upsert(vec![luke(), Record::new("Human:1001"), Record::new("Droid:2001")]).unwrap();
        assert_eq!(backend.delete_matching(&KeyPattern::new("HUMAN:*")).unwrap(), 2);
        assert!(backend.delete(&CacheKey::new("Droid:2001")).unwrap());
        backend.upsert(vec![luke()]).unwrap();
        backend.clear(true).unwrap();
        assert_eq!(backend.record_count().unwrap(), 0);
    }
}

use super::{KeyPattern, PersistenceBackend, Row};
use crate::error::CacheError;
use crate::record::{CacheKey, Record, RecordSet};

/// Keeps every record in process memory; nothing survives the store.
#[derive(Default)]
pub struct MemoryBackend {
    records: RecordSet,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: RecordSet) -> Self {
        Self { records }
    }
}

impl PersistenceBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn create_schema_if_needed(&mut self) -> Result<(), CacheError> {
        Ok(())
    }

    fn select(&self, keys: &[CacheKey]) -> Result<Vec<Row>, CacheError> {
        Ok(keys
            .iter()
            .filter_map(|key| self.records.get(key.as_str()))
            .map(|record| (record.key().clone(), Ok(record.clone())))
            .collect())
    }

    fn select_all(&self) -> Result<Vec<Row>, CacheError> {
        Ok(self.records.records().map(|record| (record.key().clone(), Ok(record.clone()))).collect())
    }

    fn upsert(&mut self, records: Vec<Record>) -> Result<(), CacheError> {
        for record in records {
            self.records.insert(record);
        }
        Ok(())
    }

    fn delete(&mut self, key: &CacheKey) -> Result<bool, CacheError> {
        Ok(self.records.remove(key.as_str()).is_some())
    }

    fn delete_many(&mut self, keys: &[CacheKey]) -> Result<usize, CacheError> {
        Ok(keys.iter().filter(|key| self.records.remove(key.as_str()).is_some()).count())
    }

    fn delete_matching(&mut self, pattern: &KeyPattern) -> Result<usize, CacheError> {
        let before = self.records.len();
        self.records.retain(|key, _| !pattern.matches(key.as_str()));
        Ok(before - self.records.len())
    }

    fn clear(&mut self, _vacuum: bool) -> Result<(), CacheError> {
        self.records.clear();
        Ok(())
    }

    fn record_count(&self) -> Result<usize, CacheError> {
        Ok(self.records.len())
    }
}

use super::{KeyPattern, PersistenceBackend, Row};
use crate::error::CacheError;
use crate::record::{CacheKey, Record};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;

/// Keeps the most recently used decoded records in front of a durable backend.
/// Undecodable rows are never cached.
pub struct LruBackend<B> {
    inner: B,
    cache: Mutex<LruCache<CacheKey, Record>>,
}

impl<B: PersistenceBackend> LruBackend<B> {
    pub fn new(inner: B, capacity: NonZeroUsize) -> Self {
        Self { inner, cache: Mutex::new(LruCache::new(capacity)) }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    pub fn cached(&self) -> Result<usize, CacheError> {
        Ok(self.cache.lock()?.len())
    }
}

impl<B: PersistenceBackend> PersistenceBackend for LruBackend<B> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn create_schema_if_needed(&mut self) -> Result<(), CacheError> {
        self.inner.create_schema_if_needed()
    }

    fn select(&self, keys: &[CacheKey]) -> Result<Vec<Row>, CacheError> {
        let mut out = Vec::with_capacity(keys.len());
        let mut misses = Vec::new();
        {
            let mut cache = self.cache.lock()?;
            for key in keys {
                match cache.get(key) {
                    Some(record) => out.push((key.clone(), Ok(record.clone()))),
                    None => misses.push(key.clone()),
                }
            }
        }
        if misses.is_empty() {
            return Ok(out);
        }
        let fetched = self.inner.select(&misses)?;
        let mut cache = self.cache.lock()?;
        for (key, decoded) in &fetched {
            if let Ok(record) = decoded {
                cache.put(key.clone(), record.clone());
            }
        }
        log::debug!("lru select {} hits, {} misses", out.len(), misses.len());
        out.extend(fetched);
        Ok(out)
    }

    fn select_all(&self) -> Result<Vec<Row>, CacheError> {
        self.inner.select_all()
    }

    fn upsert(&mut self, records: Vec<Record>) -> Result<(), CacheError> {
        let cached = records.clone();
        self.inner.upsert(records)?;
        let mut cache = self.cache.lock()?;
        for record in cached {
            cache.put(record.key().clone(), record);
        }
        Ok(())
    }

    fn delete(&mut self, key: &CacheKey) -> Result<bool, CacheError> {
        self.cache.lock()?.pop(key);
        self.inner.delete(key)
    }

    fn delete_many(&mut self, keys: &[CacheKey]) -> Result<usize, CacheError> {
        {
            let mut cache = self.cache.lock()?;
            for key in keys {
                cache.pop(key);
            }
        }
        self.inner.delete_many(keys)
    }

    fn delete_matching(&mut self, pattern: &KeyPattern) -> Result<usize, CacheError> {
        {
            let mut cache = self.cache.lock()?;
            let matching: Vec<CacheKey> = cache.iter().map(|(k, _)| k).filter(|k| pattern.matches(k.as_str())).cloned().collect();
            for key in matching {
                cache.pop(&key);
            }
        }
        self.inner.delete_matching(pattern)
    }

    fn clear(&mut self, vacuum: bool) -> Result<(), CacheError> {
        self.cache.lock()?.clear();
        self.inner.clear(vacuum)
    }

    fn record_count(&self) -> Result<usize, CacheError> {
        self.inner.record_count()
    }
}

use crate::deferred::DeferredValue;
use crate::error::{CacheError, RecordCodecError};
use crate::record::{CacheKey, Record};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;

type BatchFetch<'a, K, V> = Box<dyn Fn(&[K]) -> Result<HashMap<K, V>, CacheError> + 'a>;

struct LoaderState<K, V> {
    resolved: HashMap<K, Option<V>>,
    pending: Vec<K>,
    queued: HashSet<K>,
    batches: usize,
}

/// Coalesces the key lookups issued during one traversal into single bulk fetches.
///
/// `get` only queues unknown keys; the first time any of the returned values is forced,
/// every queued key is fetched in one call. Results, including misses, stay cached until
/// [`BatchLoader::clear`], so a key is fetched at most once per loader.
pub struct BatchLoader<'a, K, V> {
    fetch: BatchFetch<'a, K, V>,
    state: RefCell<LoaderState<K, V>>,
}

/// Loader over a persistence backend: per-key outcome is the record or its decode failure.
pub type RecordLoader<'a> = BatchLoader<'a, CacheKey, Result<Arc<Record>, RecordCodecError>>;

impl<'a, K, V> BatchLoader<'a, K, V>
where
    K: Eq + Hash + Clone + 'a,
    V: Clone + 'a,
{
    pub fn new(fetch: impl Fn(&[K]) -> Result<HashMap<K, V>, CacheError> + 'a) -> Self {
        Self {
            fetch: Box::new(fetch),
            state: RefCell::new(LoaderState { resolved: HashMap::new(), pending: Vec::new(), queued: HashSet::new(), batches: 0 }),
        }
    }

    pub fn get(&'a self, key: K) -> DeferredValue<'a, Option<V>> {
        {
            let mut state = self.state.borrow_mut();
            if let Some(value) = state.resolved.get(&key) {
                return DeferredValue::immediate(value.clone());
            }
            if state.queued.insert(key.clone()) {
                state.pending.push(key.clone());
            }
        }
        DeferredValue::deferred(move || self.load(&key))
    }

    /// Seeds a value so that it is never fetched.
    pub fn prime(&self, key: K, value: V) {
        let mut state = self.state.borrow_mut();
        state.queued.remove(&key);
        state.pending.retain(|k| k != &key);
        state.resolved.insert(key, Some(value));
    }

    pub fn clear(&self) {
        let mut state = self.state.borrow_mut();
        state.resolved.clear();
        state.pending.clear();
        state.queued.clear();
    }

    /// Number of bulk fetches issued so far.
    pub fn batch_count(&self) -> usize {
        self.state.borrow().batches
    }

    fn load(&self, key: &K) -> Result<Option<V>, CacheError> {
        {
            let mut state = self.state.borrow_mut();
            if let Some(value) = state.resolved.get(key) {
                return Ok(value.clone());
            }
            // a `clear` since `get` dropped the key from the queue
            if state.queued.insert(key.clone()) {
                state.pending.push(key.clone());
            }
        }
        self.dispatch()?;
        Ok(self.state.borrow().resolved.get(key).cloned().flatten())
    }

    fn dispatch(&self) -> Result<(), CacheError> {
        let keys = {
            let mut state = self.state.borrow_mut();
            state.queued.clear();
            std::mem::take(&mut state.pending)
        };
        if keys.is_empty() {
            return Ok(());
        }
        log::debug!("batch loader fetching {} keys", keys.len());
        let fetched = (self.fetch)(&keys);
        let mut state = self.state.borrow_mut();
        let mut found = match fetched {
            Ok(found) => found,
            Err(e) => {
                // keys stay pending so that every waiter sees the failure, not a miss
                for key in keys {
                    if state.queued.insert(key.clone()) {
                        state.pending.push(key);
                    }
                }
                return Err(e);
            }
        };
        state.batches += 1;
        for key in keys {
            let value = found.remove(&key);
            state.resolved.insert(key, value);
        }
        Ok(())
    }
}

//! Shared run state: configuration, the feature list, and a memoizing cache.
//!
//! Every unit in a run sees the same `RunContext`. Feature functions use the
//! cache for read-if-absent/compute/write memoization keyed by
//! `(category, key)`, typically to compute per-geocode values once.
//!
//! Two cache implementations ship with the crate:
//! - `LocalCache` keeps single-threaded semantics. Under contention two units
//!   may both compute a missing value; the first insert wins and later
//!   readers all observe that one value.
//! - `KeyedCache` makes check-then-set atomic per key, so each key is
//!   computed at most once even when units run concurrently. Locks are held
//!   per key, never across the whole cache.

use indexmap::IndexMap;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::config::RunConfig;
use crate::constants::cache::WEATHER_CATEGORY;
use crate::data::WeatherSeries;
use crate::errors::FeatureError;
use crate::feature::FeatureSet;
use crate::types::CacheCategory;

/// Type-erased cached value.
pub type CacheEntry = Arc<dyn Any + Send + Sync>;

/// Address of one cache entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    /// Namespace, e.g. `weather`.
    pub category: CacheCategory,
    /// Key inside the namespace, e.g. a geocode.
    pub key: String,
}

impl CacheKey {
    pub fn new(category: impl Into<CacheCategory>, key: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.category, self.key)
    }
}

/// Memoizing key/value store shared by every unit of a run.
pub trait ContextCache: Send + Sync {
    /// Return the cached value for `key`, if present.
    fn get(&self, key: &CacheKey) -> Option<CacheEntry>;

    /// Store `value`, replacing any previous value for `key`.
    fn insert(&self, key: CacheKey, value: CacheEntry);

    /// Drop the value for `key`. Returns `true` when something was removed.
    fn remove(&self, key: &CacheKey) -> bool;

    /// Return the cached value, computing and storing it when absent.
    ///
    /// A failed `compute` stores nothing, so a later caller may retry.
    fn get_or_try_insert_with(
        &self,
        key: CacheKey,
        compute: &mut dyn FnMut() -> Result<CacheEntry, FeatureError>,
    ) -> Result<CacheEntry, FeatureError>;

    /// Number of stored values.
    fn len(&self) -> usize;

    /// Returns `true` when nothing is stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Single-lock cache with reference (single-threaded) memoization semantics.
#[derive(Default)]
pub struct LocalCache {
    entries: RwLock<IndexMap<CacheKey, CacheEntry>>,
}

impl LocalCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ContextCache for LocalCache {
    fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).cloned()
    }

    fn insert(&self, key: CacheKey, value: CacheEntry) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key, value);
    }

    fn remove(&self, key: &CacheKey) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.shift_remove(key).is_some()
    }

    fn get_or_try_insert_with(
        &self,
        key: CacheKey,
        compute: &mut dyn FnMut() -> Result<CacheEntry, FeatureError>,
    ) -> Result<CacheEntry, FeatureError> {
        if let Some(hit) = self.get(&key) {
            return Ok(hit);
        }
        // Computed outside the lock so `compute` may itself read the cache.
        let value = compute()?;
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.entry(key).or_insert(value).clone())
    }

    fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

type Slot = Arc<Mutex<Option<CacheEntry>>>;

/// Concurrent cache with an atomic compute-once guarantee per key.
#[derive(Default)]
pub struct KeyedCache {
    slots: RwLock<HashMap<CacheKey, Slot>>,
}

impl KeyedCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &CacheKey) -> Slot {
        {
            let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(slot) = slots.get(key) {
                return Arc::clone(slot);
            }
        }
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(key.clone()).or_default())
    }

    /// Drop `slot` from the map if it is still empty and no other caller is
    /// waiting on it. Under the write lock nobody can take a new handle, so
    /// the map's handle plus ours means the slot is unused.
    fn discard_empty_slot(&self, key: &CacheKey, slot: &Slot) {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let unused = slots.get(key).is_some_and(|current| {
            Arc::ptr_eq(current, slot)
                && Arc::strong_count(slot) == 2
                && slot.lock().unwrap_or_else(PoisonError::into_inner).is_none()
        });
        if unused {
            slots.remove(key);
        }
    }
}

impl ContextCache for KeyedCache {
    fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let slot = {
            let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
            slots.get(key).cloned()?
        };
        slot.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn insert(&self, key: CacheKey, value: CacheEntry) {
        let slot = self.slot(&key);
        *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
    }

    fn remove(&self, key: &CacheKey) -> bool {
        let removed = {
            let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
            slots.remove(key)
        };
        removed.is_some_and(|slot| {
            slot.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
                .is_some()
        })
    }

    fn get_or_try_insert_with(
        &self,
        key: CacheKey,
        compute: &mut dyn FnMut() -> Result<CacheEntry, FeatureError>,
    ) -> Result<CacheEntry, FeatureError> {
        let slot = self.slot(&key);
        // Holding the slot lock while computing makes concurrent callers for
        // the same key wait for this result instead of computing their own.
        let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(hit) = guard.as_ref() {
            return Ok(Arc::clone(hit));
        }
        match compute() {
            Ok(value) => {
                *guard = Some(Arc::clone(&value));
                Ok(value)
            }
            Err(err) => {
                drop(guard);
                self.discard_empty_slot(&key, &slot);
                Err(err)
            }
        }
    }

    fn len(&self) -> usize {
        let slots: Vec<Slot> = {
            let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
            slots.values().cloned().collect()
        };
        slots
            .iter()
            .filter(|slot| {
                slot.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .is_some()
            })
            .count()
    }
}

/// State shared by every unit of one iteration run.
///
/// Created by the caller before a run and discarded afterwards; nothing in
/// it is persisted.
#[derive(Clone)]
pub struct RunContext {
    config: RunConfig,
    features: FeatureSet,
    cache: Arc<dyn ContextCache>,
}

impl RunContext {
    /// Create a context backed by a fresh `LocalCache`.
    pub fn new(config: RunConfig, features: FeatureSet) -> Self {
        Self::with_cache(config, features, Arc::new(LocalCache::new()))
    }

    /// Create a context backed by a fresh `KeyedCache`, for parallel runs.
    pub fn concurrent(config: RunConfig, features: FeatureSet) -> Self {
        Self::with_cache(config, features, Arc::new(KeyedCache::new()))
    }

    /// Create a context over a caller-supplied cache.
    pub fn with_cache(
        config: RunConfig,
        features: FeatureSet,
        cache: Arc<dyn ContextCache>,
    ) -> Self {
        Self {
            config,
            features,
            cache,
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn features(&self) -> &FeatureSet {
        &self.features
    }

    pub fn cache(&self) -> &dyn ContextCache {
        self.cache.as_ref()
    }

    /// Check run-wide configuration before any unit is processed.
    pub fn validate(&self) -> Result<(), FeatureError> {
        if self.features.is_empty() {
            return Err(FeatureError::Configuration(
                "run context has no feature functions configured".into(),
            ));
        }
        self.config.validate()
    }

    /// Typed lookup; `None` when absent or stored under a different type.
    pub fn cached<T: Any + Send + Sync>(&self, category: &str, key: &str) -> Option<Arc<T>> {
        self.cache
            .get(&CacheKey::new(category, key))
            .and_then(|entry| entry.downcast::<T>().ok())
    }

    /// Typed store, replacing any previous value.
    pub fn store<T: Any + Send + Sync>(&self, category: &str, key: &str, value: T) {
        self.cache
            .insert(CacheKey::new(category, key), Arc::new(value));
    }

    /// Typed read-if-absent/compute/write.
    ///
    /// `compute` runs only when the key is missing. With `KeyedCache` it runs
    /// at most once per key for the whole run.
    pub fn memoize<T, F>(&self, category: &str, key: &str, compute: F) -> Result<Arc<T>, FeatureError>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Result<T, FeatureError>,
    {
        let cache_key = CacheKey::new(category, key);
        let mut compute = Some(compute);
        let mut erased = || -> Result<CacheEntry, FeatureError> {
            let compute = compute.take().ok_or_else(|| {
                FeatureError::Configuration("memoized compute invoked twice".into())
            })?;
            Ok(Arc::new(compute()?) as CacheEntry)
        };
        let entry = self.cache.get_or_try_insert_with(cache_key.clone(), &mut erased)?;
        entry.downcast::<T>().map_err(|_| {
            FeatureError::Configuration(format!(
                "cache entry '{cache_key}' holds a different type"
            ))
        })
    }

    /// Weather prefetched for `geocode` by the grouped iterator, if any.
    pub fn weather(&self, geocode: &str) -> Option<Arc<WeatherSeries>> {
        self.cached::<WeatherSeries>(WEATHER_CATEGORY, geocode)
    }
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("config", &self.config)
            .field("features", &self.features.names())
            .field("cached_entries", &self.cache.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;

    fn entry(value: u32) -> CacheEntry {
        Arc::new(value)
    }

    fn exercise_basic(cache: &dyn ContextCache) {
        let key = CacheKey::new("weather", "94110");
        assert!(cache.is_empty());
        assert!(cache.get(&key).is_none());
        cache.insert(key.clone(), entry(7));
        assert_eq!(cache.len(), 1);
        let hit = cache.get(&key).unwrap().downcast::<u32>().unwrap();
        assert_eq!(*hit, 7);
        assert!(cache.remove(&key));
        assert!(!cache.remove(&key));
        assert!(cache.is_empty());
    }

    #[test]
    fn local_cache_basic_operations() {
        exercise_basic(&LocalCache::new());
    }

    #[test]
    fn keyed_cache_basic_operations() {
        exercise_basic(&KeyedCache::new());
    }

    #[test]
    fn failed_compute_stores_nothing() {
        for cache in [
            Arc::new(LocalCache::new()) as Arc<dyn ContextCache>,
            Arc::new(KeyedCache::new()) as Arc<dyn ContextCache>,
        ] {
            let key = CacheKey::new("weather", "02139");
            let err = cache
                .get_or_try_insert_with(key.clone(), &mut || {
                    Err(FeatureError::computation("weather", "station offline"))
                })
                .unwrap_err();
            assert!(matches!(err, FeatureError::FeatureComputation { .. }));
            assert!(cache.get(&key).is_none());
            let value = cache
                .get_or_try_insert_with(key.clone(), &mut || Ok(entry(3)))
                .unwrap();
            assert_eq!(*value.downcast::<u32>().unwrap(), 3);
        }
    }

    #[test]
    fn keyed_cache_drops_slots_of_failed_computations() {
        let cache = KeyedCache::new();
        for geocode in ["94110", "02139", "60614"] {
            let result = cache.get_or_try_insert_with(CacheKey::new("weather", geocode), &mut || {
                Err(FeatureError::computation("weather", "station offline"))
            });
            assert!(result.is_err());
        }
        assert!(cache.slots.read().unwrap().is_empty());

        cache
            .get_or_try_insert_with(CacheKey::new("weather", "94110"), &mut || Ok(entry(5)))
            .unwrap();
        assert_eq!(cache.slots.read().unwrap().len(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn keyed_cache_computes_each_key_once_under_contention() {
        let cache = Arc::new(KeyedCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));
        thread::scope(|scope| {
            for _ in 0..8 {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                let barrier = Arc::clone(&barrier);
                scope.spawn(move || {
                    barrier.wait();
                    let value = cache
                        .get_or_try_insert_with(CacheKey::new("weather", "94110"), &mut || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(std::time::Duration::from_millis(20));
                            Ok(entry(42))
                        })
                        .unwrap();
                    assert_eq!(*value.downcast::<u32>().unwrap(), 42);
                });
            }
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn memoize_is_typed_and_runs_once() {
        let ctx = RunContext::new(RunConfig::default(), FeatureSet::new());
        let mut calls = 0;
        let first = ctx
            .memoize("weather_features", "94110", || {
                calls += 1;
                Ok(12.5f64)
            })
            .unwrap();
        let second = ctx
            .memoize("weather_features", "94110", || -> Result<f64, FeatureError> {
                panic!("must not recompute")
            })
            .unwrap();
        assert_eq!(calls, 1);
        assert_eq!(*first, *second);
        assert_eq!(ctx.cached::<f64>("weather_features", "94110").as_deref(), Some(&12.5));
        assert!(ctx.cached::<u32>("weather_features", "94110").is_none());
    }

    #[test]
    fn memoize_reports_type_mismatch() {
        let ctx = RunContext::new(RunConfig::default(), FeatureSet::new());
        ctx.store("weather_features", "94110", 1u32);
        let err = ctx
            .memoize("weather_features", "94110", || Ok(String::from("x")))
            .unwrap_err();
        assert!(matches!(err, FeatureError::Configuration(ref msg) if msg.contains("different type")));
    }

    #[test]
    fn validate_requires_feature_functions() {
        let ctx = RunContext::new(RunConfig::default(), FeatureSet::new());
        assert!(matches!(ctx.validate(), Err(FeatureError::Configuration(_))));
    }
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use amp_core::{StateStore, StoreError, StoreResult};
use rustc_hash::FxHashMap;

/// Process-local [`StateStore`]. Compare-and-set is atomic under one mutex.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    map: Mutex<FxHashMap<String, String>>,
    writes: AtomicU64,
}

impl MemoryStateStore {
    pub fn new() -> Self { Self::default() }

    /// Successful mutations so far (create, set, delete).
    pub fn writes(&self) -> u64 { self.writes.load(Ordering::Relaxed) }

    pub fn len(&self) -> usize { self.map.lock().map(|m| m.len()).unwrap_or(0) }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    fn with_map<R>(&self, f: impl FnOnce(&mut FxHashMap<String, String>) -> StoreResult<R>) -> StoreResult<R> {
        let mut map = self.map.lock().map_err(|_| StoreError::Backend("state map lock poisoned".into()))?;
        let out = f(&mut map)?;
        Ok(out)
    }

    fn bump(&self) { self.writes.fetch_add(1, Ordering::Relaxed); }
}

#[async_trait::async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> { self.with_map(|m| Ok(m.get(key).cloned())) }

    async fn create(&self, key: &str, value: &str) -> StoreResult<()> {
        self.with_map(|m| {
            if m.contains_key(key) {
                return Err(StoreError::AlreadyExists(key.to_string()));
            }
            m.insert(key.to_string(), value.to_string());
            Ok(())
        })?;
        self.bump();
        Ok(())
    }

    async fn compare_and_set(&self, key: &str, expected: &str, new: &str) -> StoreResult<()> {
        self.with_map(|m| match m.get_mut(key) {
            None => Err(StoreError::NotFound(key.to_string())),
            Some(cur) if cur.as_str() != expected => Err(StoreError::Conflict {
                key: key.to_string(),
                expected: expected.to_string(),
                actual: cur.clone(),
            }),
            Some(cur) => {
                *cur = new.to_string();
                Ok(())
            }
        })?;
        self.bump();
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.with_map(|m| m.remove(key).map(|_| ()).ok_or_else(|| StoreError::NotFound(key.to_string())))?;
        self.bump();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cas_reports_actual_value_on_mismatch() {
        let s = MemoryStateStore::new();
        s.create("k", "a").await.unwrap();
        s.compare_and_set("k", "a", "b").await.unwrap();
        let err = s.compare_and_set("k", "a", "c").await.unwrap_err();
        assert_eq!(err, StoreError::Conflict { key: "k".into(), expected: "a".into(), actual: "b".into() });
        assert_eq!(s.get("k").await.unwrap().as_deref(), Some("b"));
        assert_eq!(s.compare_and_set("missing", "a", "b").await.unwrap_err(), StoreError::NotFound("missing".into()));
        assert_eq!(s.writes(), 2);
    }

    #[tokio::test]
    async fn create_is_exclusive() {
        let s = MemoryStateStore::new();
        s.create("k", "a").await.unwrap();
        assert_eq!(s.create("k", "b").await.unwrap_err(), StoreError::AlreadyExists("k".into()));
        s.delete("k").await.unwrap();
        assert!(s.is_empty());
        assert_eq!(s.delete("k").await.unwrap_err(), StoreError::NotFound("k".into()));
    }
}

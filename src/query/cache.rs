use moka::sync::Cache;
use std::time::Duration;

/// Short-lived cache of serialized query responses, keyed on endpoint,
/// filter and detector parameters.
pub struct SignalCache {
    inner: Cache<String, String>,
}

impl SignalCache {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            inner: Cache::builder()
                .time_to_live(Duration::from_secs(ttl_secs))
                .max_capacity(512)
                .build(),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.get(key)
    }

    pub fn insert(&self, key: String, value: String) {
        self.inner.insert(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let cache = SignalCache::new(60);
        assert!(cache.get("rage:p1").is_none());
        cache.insert("rage:p1".to_string(), "[]".to_string());
        assert_eq!(cache.get("rage:p1").as_deref(), Some("[]"));
    }
}

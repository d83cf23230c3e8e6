use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::sync::Cache;
use moka::Expiry;

use crate::sarif::SarifResult;

pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_CAPACITY: u64 = 50;

#[derive(Debug, Clone)]
pub struct CachedResults {
    pub results: Arc<Vec<SarifResult>>,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, CachedResults> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedResults,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Evaluator output keyed by `policy-id:input-hash`.
#[derive(Clone)]
pub struct ResultCache {
    inner: Cache<String, CachedResults>,
    default_ttl: Duration,
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("entries", &self.inner.entry_count())
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

impl ResultCache {
    pub fn new(capacity: u64, default_ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(capacity)
                .expire_after(PerEntryTtl)
                .build(),
            default_ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<Vec<SarifResult>>> {
        self.inner.get(key).map(|v| v.results)
    }

    pub fn insert(&self, key: String, results: Vec<SarifResult>) {
        self.insert_with_ttl(key, results, self.default_ttl);
    }

    pub fn insert_with_ttl(&self, key: String, results: Vec<SarifResult>, ttl: Duration) {
        self.inner.insert(
            key,
            CachedResults {
                results: Arc::new(results),
                ttl,
            },
        );
    }

    pub fn invalidate(&self, key: &str) {
        self.inner.invalidate(key);
    }
}

pub fn key(policy_id: &str, input_hash: &str) -> String {
    format!("{policy_id}:{input_hash}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Policy;
    use crate::sarif::ResultFactory;
    use crate::severity::SarifLevel;

    fn results() -> Vec<SarifResult> {
        let policy = Policy {
            id: "p".into(),
            ..Default::default()
        };
        let factory = ResultFactory::new(&policy, "");
        vec![factory.summary(SarifLevel::Note, "ok", vec![])]
    }

    #[test]
    fn stores_and_invalidates() {
        let cache = ResultCache::default();
        let k = key("p", "abc");
        assert!(cache.get(&k).is_none());
        cache.insert(k.clone(), results());
        assert_eq!(cache.get(&k).unwrap().len(), 1);
        cache.invalidate(&k);
        assert!(cache.get(&k).is_none());
    }

    #[test]
    fn entries_expire_after_their_ttl() {
        let cache = ResultCache::default();
        let k = key("p", "short");
        cache.insert_with_ttl(k.clone(), results(), Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(60));
        assert!(cache.get(&k).is_none());
    }
}

//! Shared store (SS) — the only durable, shared mutable state in the
//! system. A key-value store offering hashes, sets, sorted sets, atomic
//! increments, key expiry, and a compare-and-set primitive for lazy
//! activation. Every stateful component is handed an `Arc<dyn SharedStore>`
//! rather than owning storage directly, so PR/SRR/CC stay pure leaves.

pub mod redis;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;

#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
    async fn hset_many(&self, key: &str, fields: &[(&str, String)]) -> Result<()>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;
    async fn hdel(&self, key: &str, field: &str) -> Result<()>;

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64>;
    async fn incr_by_float(&self, key: &str, delta: f64) -> Result<f64>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn set_nx(&self, key: &str, value: &str) -> Result<bool>;

    async fn expire(&self, key: &str, ttl_secs: i64) -> Result<()>;
    async fn ttl(&self, key: &str) -> Result<Option<i64>>;
    async fn del(&self, key: &str) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;

    async fn sadd(&self, key: &str, member: &str) -> Result<()>;
    async fn srem(&self, key: &str, member: &str) -> Result<()>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;
    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;
    async fn zrem(&self, key: &str, member: &str) -> Result<()>;

    /// Atomic compare-and-set on a single hash field. If the field's current
    /// value equals `expected` (treating an absent field as `None`), sets it
    /// to `new` and returns `true`; otherwise leaves it untouched and
    /// returns `false`. Used by KV's activation-on-first-use transition so
    /// concurrent losers observe the post-transition state rather than
    /// racing a read-modify-write.
    async fn hash_field_cas(
        &self,
        key: &str,
        field: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool>;
}

/// In-memory `SharedStore` used by component tests, so each module's
/// `#[cfg(test)]` block can exercise real admission/CAS semantics without a
/// running Redis.
#[cfg(test)]
pub mod memory {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct Inner {
        hashes: HashMap<String, HashMap<String, String>>,
        strings: HashMap<String, String>,
        sets: HashMap<String, std::collections::HashSet<String>>,
        zsets: HashMap<String, BTreeMap<String, f64>>,
        expires: HashMap<String, Instant>,
    }

    pub struct MemoryStore {
        inner: Mutex<Inner>,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self { inner: Mutex::new(Inner::default()) }
        }

        fn check_expired(inner: &mut Inner, key: &str) {
            if let Some(exp) = inner.expires.get(key) {
                if Instant::now() >= *exp {
                    inner.hashes.remove(key);
                    inner.strings.remove(key);
                    inner.sets.remove(key);
                    inner.zsets.remove(key);
                    inner.expires.remove(key);
                }
            }
        }
    }

    #[async_trait]
    impl SharedStore for MemoryStore {
        async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
            let mut inner = self.inner.lock().unwrap();
            Self::check_expired(&mut inner, key);
            inner.hashes.entry(key.to_string()).or_default().insert(field.to_string(), value.to_string());
            Ok(())
        }

        async fn hset_many(&self, key: &str, fields: &[(&str, String)]) -> Result<()> {
            let mut inner = self.inner.lock().unwrap();
            Self::check_expired(&mut inner, key);
            let entry = inner.hashes.entry(key.to_string()).or_default();
            for (f, v) in fields {
                entry.insert(f.to_string(), v.clone());
            }
            Ok(())
        }

        async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
            let mut inner = self.inner.lock().unwrap();
            Self::check_expired(&mut inner, key);
            Ok(inner.hashes.get(key).and_then(|h| h.get(field).cloned()))
        }

        async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
            let mut inner = self.inner.lock().unwrap();
            Self::check_expired(&mut inner, key);
            Ok(inner.hashes.get(key).cloned().unwrap_or_default())
        }

        async fn hdel(&self, key: &str, field: &str) -> Result<()> {
            let mut inner = self.inner.lock().unwrap();
            if let Some(h) = inner.hashes.get_mut(key) {
                h.remove(field);
            }
            Ok(())
        }

        async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
            let mut inner = self.inner.lock().unwrap();
            Self::check_expired(&mut inner, key);
            let cur = inner.strings.get(key).and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);
            let next = cur + delta;
            inner.strings.insert(key.to_string(), next.to_string());
            Ok(next)
        }

        async fn incr_by_float(&self, key: &str, delta: f64) -> Result<f64> {
            let mut inner = self.inner.lock().unwrap();
            Self::check_expired(&mut inner, key);
            let cur = inner.strings.get(key).and_then(|v| v.parse::<f64>().ok()).unwrap_or(0.0);
            let next = cur + delta;
            inner.strings.insert(key.to_string(), next.to_string());
            Ok(next)
        }

        async fn get(&self, key: &str) -> Result<Option<String>> {
            let mut inner = self.inner.lock().unwrap();
            Self::check_expired(&mut inner, key);
            Ok(inner.strings.get(key).cloned())
        }

        async fn set(&self, key: &str, value: &str) -> Result<()> {
            let mut inner = self.inner.lock().unwrap();
            inner.strings.insert(key.to_string(), value.to_string());
            Ok(())
        }

        async fn set_nx(&self, key: &str, value: &str) -> Result<bool> {
            let mut inner = self.inner.lock().unwrap();
            Self::check_expired(&mut inner, key);
            if inner.strings.contains_key(key) {
                Ok(false)
            } else {
                inner.strings.insert(key.to_string(), value.to_string());
                Ok(true)
            }
        }

        async fn expire(&self, key: &str, ttl_secs: i64) -> Result<()> {
            let mut inner = self.inner.lock().unwrap();
            inner.expires.insert(key.to_string(), Instant::now() + Duration::from_secs(ttl_secs.max(0) as u64));
            Ok(())
        }

        async fn ttl(&self, key: &str) -> Result<Option<i64>> {
            let inner = self.inner.lock().unwrap();
            Ok(inner.expires.get(key).map(|exp| {
                exp.saturating_duration_since(Instant::now()).as_secs() as i64
            }))
        }

        async fn del(&self, key: &str) -> Result<()> {
            let mut inner = self.inner.lock().unwrap();
            inner.hashes.remove(key);
            inner.strings.remove(key);
            inner.sets.remove(key);
            inner.zsets.remove(key);
            inner.expires.remove(key);
            Ok(())
        }

        async fn exists(&self, key: &str) -> Result<bool> {
            let mut inner = self.inner.lock().unwrap();
            Self::check_expired(&mut inner, key);
            Ok(inner.hashes.contains_key(key) || inner.strings.contains_key(key)
                || inner.sets.contains_key(key) || inner.zsets.contains_key(key))
        }

        async fn sadd(&self, key: &str, member: &str) -> Result<()> {
            let mut inner = self.inner.lock().unwrap();
            inner.sets.entry(key.to_string()).or_default().insert(member.to_string());
            Ok(())
        }

        async fn srem(&self, key: &str, member: &str) -> Result<()> {
            let mut inner = self.inner.lock().unwrap();
            if let Some(s) = inner.sets.get_mut(key) {
                s.remove(member);
            }
            Ok(())
        }

        async fn smembers(&self, key: &str) -> Result<Vec<String>> {
            let inner = self.inner.lock().unwrap();
            Ok(inner.sets.get(key).map(|s| s.iter().cloned().collect()).unwrap_or_default())
        }

        async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
            let mut inner = self.inner.lock().unwrap();
            inner.zsets.entry(key.to_string()).or_default().insert(member.to_string(), score);
            Ok(())
        }

        async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
            let inner = self.inner.lock().unwrap();
            let Some(z) = inner.zsets.get(key) else { return Ok(vec![]) };
            let mut members: Vec<(&String, &f64)> = z.iter().collect();
            members.sort_by(|a, b| a.1.partial_cmp(b.1).unwrap());
            let len = members.len() as i64;
            let norm = |i: i64| if i < 0 { (len + i).max(0) } else { i.min(len) };
            let (s, e) = (norm(start), norm(stop) + 1);
            Ok(members[s as usize..e.min(len) as usize].iter().map(|(m, _)| (*m).clone()).collect())
        }

        async fn zrem(&self, key: &str, member: &str) -> Result<()> {
            let mut inner = self.inner.lock().unwrap();
            if let Some(z) = inner.zsets.get_mut(key) {
                z.remove(member);
            }
            Ok(())
        }

        async fn hash_field_cas(
            &self,
            key: &str,
            field: &str,
            expected: Option<&str>,
            new: &str,
        ) -> Result<bool> {
            let mut inner = self.inner.lock().unwrap();
            Self::check_expired(&mut inner, key);
            let h = inner.hashes.entry(key.to_string()).or_default();
            let current = h.get(field).map(|s| s.as_str());
            if current == expected {
                h.insert(field.to_string(), new.to_string());
                Ok(true)
            } else {
                Ok(false)
            }
        }
    }
}

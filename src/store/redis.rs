//! Redis-backed implementation of [`SharedStore`], via `fred`.
//!
//! Every persisted record in §6 is shaped like a Redis hash (`apikey:{id}`,
//! `usage:...`, `rate_limit:...`, `unavailable:{provider}:{accountId}`), so
//! the durable layer talks Redis commands directly rather than going through
//! a relational schema — the wire format is "strings in a hash", matching
//! the documented persistence shape bit-for-bit.

use anyhow::{Context, Result};
use async_trait::async_trait;
use fred::prelude::*;
use std::collections::HashMap;

use super::SharedStore;

/// Lua script for the activation-on-first-use compare-and-set: read the
/// field, compare against the expected value, and write atomically — a
/// single round trip so no other client can observe a torn read-modify-write.
const HASH_FIELD_CAS_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], ARGV[1])
local expected = ARGV[2]
if expected == '' then expected = false end
if current == expected then
    redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
    return 1
else
    return 0
end
"#;

pub struct RedisStore {
    client: RedisClient,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let config = RedisConfig::from_url(redis_url).context("invalid redis url")?;
        let client = RedisClient::new(config, None, None, None);
        client.connect();
        client.wait_for_connect().await.context("failed to connect to redis")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let _: () = self.client.hset(key, (field, value)).await?;
        Ok(())
    }

    async fn hset_many(&self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let map: HashMap<&str, String> = fields.iter().map(|(f, v)| (*f, v.clone())).collect();
        let _: () = self.client.hset(key, map).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let v: Option<String> = self.client.hget(key, field).await?;
        Ok(v)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let v: HashMap<String, String> = self.client.hgetall(key).await?;
        Ok(v)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let _: i64 = self.client.hdel(key, field).await?;
        Ok(())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let v: i64 = self.client.incrby(key, delta).await?;
        Ok(v)
    }

    async fn incr_by_float(&self, key: &str, delta: f64) -> Result<f64> {
        let v: f64 = self.client.incrbyfloat(key, delta).await?;
        Ok(v)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let v: Option<String> = self.client.get(key).await?;
        Ok(v)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let _: () = self.client.set(key, value, None, None, false).await?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str) -> Result<bool> {
        let v: Option<String> = self
            .client
            .set(key, value, None, Some(SetOptions::NX), false)
            .await?;
        Ok(v.is_some())
    }

    async fn expire(&self, key: &str, ttl_secs: i64) -> Result<()> {
        let _: bool = self.client.expire(key, ttl_secs).await?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<i64>> {
        let v: i64 = self.client.ttl(key).await?;
        Ok(if v >= 0 { Some(v) } else { None })
    }

    async fn del(&self, key: &str) -> Result<()> {
        let _: i64 = self.client.del(key).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let v: bool = self.client.exists(key).await?;
        Ok(v)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let _: i64 = self.client.sadd(key, member).await?;
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let _: i64 = self.client.srem(key, member).await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let v: Vec<String> = self.client.smembers(key).await?;
        Ok(v)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let _: i64 = self
            .client
            .zadd(key, None, None, false, false, (score, member))
            .await?;
        Ok(())
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let v: Vec<String> = self.client.zrange(key, start, stop, None, false, None, false).await?;
        Ok(v)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<()> {
        let _: i64 = self.client.zrem(key, member).await?;
        Ok(())
    }

    async fn hash_field_cas(
        &self,
        key: &str,
        field: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool> {
        let result: i64 = self
            .client
            .eval(
                HASH_FIELD_CAS_SCRIPT,
                vec![key],
                vec![field, expected.unwrap_or(""), new],
            )
            .await?;
        Ok(result == 1)
    }
}

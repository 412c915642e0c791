use std::collections::BTreeMap;
use std::time::Duration;

use tally_redis::redis::{self, Cmd, FromRedisValue, Script};
use tally_redis::{AsyncRedisPool, RedisError};

use crate::store::{AnalyticsStore, KeyTtl, StoreError};

/// Store capabilities backed by a Redis server or cluster.
///
/// Sketches are Redis HyperLogLogs with a standard error of 0.81%. A connection is taken from the
/// pool for every command and returned right after, so no connection is held while the caller
/// awaits other work.
///
/// In cluster mode, `SCAN` iterates the keys of the node serving the connection only.
#[derive(Clone, Debug)]
pub struct RedisStore {
    pool: AsyncRedisPool,
    take_field: Script,
}

impl RedisStore {
    /// Creates a store on top of a connection pool.
    pub fn new(pool: AsyncRedisPool) -> Self {
        Self {
            pool,
            take_field: Script::new(include_str!("take_field.lua")),
        }
    }

    async fn query<T: FromRedisValue>(&self, cmd: &Cmd) -> Result<T, StoreError> {
        let mut connection = self.pool.get_connection().await?;
        let value = cmd
            .query_async(&mut connection)
            .await
            .map_err(RedisError::Redis)?;
        Ok(value)
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

impl AnalyticsStore for RedisStore {
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX").arg("EX").arg(ttl_secs(ttl));

        let reply: Option<String> = self.query(&cmd).await?;
        Ok(reply.is_some())
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut cmd = redis::cmd("INCR");
        cmd.arg(key);
        self.query(&cmd).await
    }

    async fn get_int(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.query(&cmd).await
    }

    async fn hincr(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        let mut cmd = redis::cmd("HINCRBY");
        cmd.arg(key).arg(field).arg(delta);
        self.query(&cmd).await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<i64>, StoreError> {
        let mut cmd = redis::cmd("HGET");
        cmd.arg(key).arg(field);
        self.query(&cmd).await
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<i64>>, StoreError> {
        // `HMGET` requires at least one field.
        if fields.is_empty() {
            return Ok(Vec::new());
        }

        let mut cmd = redis::cmd("HMGET");
        cmd.arg(key).arg(fields);
        self.query(&cmd).await
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, i64)>, StoreError> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(key);

        let hash: BTreeMap<String, i64> = self.query(&cmd).await?;
        Ok(hash.into_iter().collect())
    }

    async fn hexists(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let mut cmd = redis::cmd("HEXISTS");
        cmd.arg(key).arg(field);
        self.query(&cmd).await
    }

    async fn hset_nx(&self, key: &str, field: &str, value: i64) -> Result<bool, StoreError> {
        let mut cmd = redis::cmd("HSETNX");
        cmd.arg(key).arg(field).arg(value);
        self.query(&cmd).await
    }

    async fn htake(&self, key: &str, field: &str) -> Result<Option<i64>, StoreError> {
        let mut connection = self.pool.get_connection().await?;
        let value = self
            .take_field
            .prepare_invoke()
            .key(key)
            .arg(field)
            .invoke_async(&mut connection)
            .await
            .map_err(RedisError::Redis)?;
        Ok(value)
    }

    async fn pf_add(&self, key: &str, element: &str) -> Result<bool, StoreError> {
        let mut cmd = redis::cmd("PFADD");
        cmd.arg(key).arg(element);
        self.query(&cmd).await
    }

    async fn pf_count(&self, key: &str) -> Result<u64, StoreError> {
        let mut cmd = redis::cmd("PFCOUNT");
        cmd.arg(key);
        self.query(&cmd).await
    }

    async fn pf_count_union(&self, keys: &[String]) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut cmd = redis::cmd("PFCOUNT");
        cmd.arg(keys);
        self.query(&cmd).await
    }

    async fn pf_merge(&self, dest: &str, sources: &[String]) -> Result<(), StoreError> {
        let mut cmd = redis::cmd("PFMERGE");
        cmd.arg(dest).arg(sources);
        self.query(&cmd).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(key);
        self.query(&cmd).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut cmd = redis::cmd("EXPIRE");
        cmd.arg(key).arg(ttl_secs(ttl));
        self.query(&cmd).await
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError> {
        let mut cmd = redis::cmd("TTL");
        cmd.arg(key);

        let secs: i64 = self.query(&cmd).await?;
        Ok(KeyTtl::from_secs(secs))
    }

    async fn zincr(&self, key: &str, member: &str, delta: i64) -> Result<f64, StoreError> {
        let mut cmd = redis::cmd("ZINCRBY");
        cmd.arg(key).arg(delta).arg(member);
        self.query(&cmd).await
    }

    async fn zrevrange_withscores(
        &self,
        key: &str,
        limit: usize,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut cmd = redis::cmd("ZREVRANGE");
        cmd.arg(key).arg(0).arg(limit - 1).arg("WITHSCORES");
        self.query(&cmd).await
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError> {
        let mut cmd = redis::cmd("SCAN");
        cmd.arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count.max(1));
        self.query(&cmd).await
    }
}

#[cfg(test)]
mod tests {
    use tally_redis::RedisConfig;

    use super::*;

    fn build_store() -> RedisStore {
        let url = std::env::var("TALLY_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_owned());
        let pool = AsyncRedisPool::from_config(&RedisConfig::single(url)).unwrap();
        RedisStore::new(pool)
    }

    /// Returns a key unique to the current test run.
    fn unique_key(name: &str) -> String {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("tally-test:{name}:{nanos}")
    }

    #[tokio::test]
    #[ignore = "requires a running redis server"]
    async fn test_hash_and_counter_commands() {
        let store = build_store();
        let key = unique_key("hash");

        assert_eq!(store.hincr(&key, "a", 2).await.unwrap(), 2);
        assert!(store.hset_nx(&key, "b", 7).await.unwrap());
        assert!(!store.hset_nx(&key, "b", 8).await.unwrap());
        assert!(store.hexists(&key, "b").await.unwrap());

        let fields = ["a".to_owned(), "c".to_owned()];
        assert_eq!(store.hmget(&key, &fields).await.unwrap(), [Some(2), None]);
        assert_eq!(
            store.hgetall(&key).await.unwrap(),
            [("a".to_owned(), 2), ("b".to_owned(), 7)]
        );

        assert_eq!(store.htake(&key, "a").await.unwrap(), Some(2));
        assert_eq!(store.htake(&key, "a").await.unwrap(), None);

        let counter = unique_key("counter");
        assert_eq!(store.incr(&counter).await.unwrap(), 1);
        assert_eq!(store.get_int(&counter).await.unwrap(), Some(1));
    }

    #[tokio::test]
    #[ignore = "requires a running redis server"]
    async fn test_sketch_and_expiry_commands() {
        let store = build_store();
        let day1 = unique_key("day1");
        let day2 = unique_key("day2");
        let week = unique_key("week");

        store.pf_add(&day1, "a").await.unwrap();
        store.pf_add(&day1, "b").await.unwrap();
        store.pf_add(&day2, "b").await.unwrap();
        store.pf_merge(&week, &[day1.clone(), day2]).await.unwrap();
        assert_eq!(store.pf_count(&week).await.unwrap(), 2);

        assert_eq!(store.ttl(&day1).await.unwrap(), KeyTtl::Persistent);
        assert!(store.expire(&day1, Duration::from_secs(60)).await.unwrap());
        assert!(matches!(store.ttl(&day1).await.unwrap(), KeyTtl::Expires(_)));

        let marker = unique_key("marker");
        let ttl = Duration::from_secs(60);
        assert!(store.set_nx_ex(&marker, "1", ttl).await.unwrap());
        assert!(!store.set_nx_ex(&marker, "1", ttl).await.unwrap());
    }

    #[tokio::test]
    #[ignore = "requires a running redis server"]
    async fn test_rank_and_scan_commands() {
        let store = build_store();
        let rank = unique_key("rank");

        store.zincr(&rank, "1", 3).await.unwrap();
        store.zincr(&rank, "2", 5).await.unwrap();
        assert_eq!(
            store.zrevrange_withscores(&rank, 1).await.unwrap(),
            [("2".to_owned(), 5.0)]
        );

        let mut cursor = 0;
        let mut found = false;
        loop {
            let (next, keys) = store.scan(cursor, &rank, 100).await.unwrap();
            found |= keys.contains(&rank);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        assert!(found);
    }
}

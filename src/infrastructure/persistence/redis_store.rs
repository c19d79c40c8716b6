//! Redis-backed shared store

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

use super::store::{SharedStore, StoreResult};

/// HINCRBY that refuses to resurrect an expired or deleted hash.
const INCR_EXISTING: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return redis.call('HINCRBY', KEYS[1], ARGV[1], ARGV[2])
end
return false
";

pub struct RedisStore {
    conn: ConnectionManager,
    incr_existing: redis::Script,
}

impl RedisStore {
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected to shared store at {}", url);
        Ok(Self {
            conn,
            incr_existing: redis::Script::new(INCR_EXISTING),
        })
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn hset_all(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().hset_multiple(key, fields).ignore();
        if let Some(ttl) = ttl {
            pipe.cmd("EXPIRE").arg(key).arg(ttl.as_secs().max(1)).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.hset_nx(key, field, value).await?)
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(key, field).await?)
    }

    async fn hget_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall(key).await?)
    }

    async fn hget_all_many(&self, keys: &[String]) -> StoreResult<Vec<HashMap<String, String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.hgetall(key);
        }
        Ok(pipe.query_async(&mut conn).await?)
    }

    async fn hincr_existing(&self, key: &str, field: &str, delta: i64) -> StoreResult<Option<i64>> {
        let mut conn = self.conn.clone();
        Ok(self
            .incr_existing
            .key(key)
            .arg(field)
            .arg(delta)
            .invoke_async(&mut conn)
            .await?)
    }

    async fn del(&self, keys: &[String]) -> StoreResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(keys).await?;
        Ok(())
    }

    async fn scan(&self, pattern: &str, batch: usize) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SCAN");
        cmd.cursor_arg(0)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(batch);

        let mut iter: redis::AsyncIter<String> = cmd.iter_async(&mut conn).await?;
        let mut keys = Vec::new();
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }
}

//! Redis-backed cache for presence sets and chat logs.

use anyhow::Result;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client as RedisClient};

use super::CacheStore;

/// Shares one multiplexed, auto-reconnecting connection across all sessions.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = RedisClient::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.sadd(key, member).await?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.srem(key, member).await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut members: Vec<String> = conn.smembers(key).await?;
        members.sort();
        Ok(members)
    }

    async fn list_push_capped(&self, key: &str, value: &str, cap: usize) -> Result<()> {
        let mut conn = self.conn.clone();
        let keep_from = -(cap as isize);
        // MULTI/EXEC so no reader sees the list above its cap
        let _: () = redis::pipe()
            .atomic()
            .rpush(key, value)
            .ignore()
            .ltrim(key, keep_from, -1)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn list_tail(&self, key: &str, n: usize) -> Result<Vec<String>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let entries: Vec<String> = conn.lrange(key, -(n as isize), -1).await?;
        Ok(entries)
    }
}

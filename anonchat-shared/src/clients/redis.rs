use std::collections::HashMap;

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, FromRedisValue, Script, ToRedisArgs};

#[derive(Clone)]
pub struct RedisClient {
    conn: ConnectionManager,
}

impl RedisClient {
    pub async fn connect(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        tracing::info!(url = %url, "connected to Redis");
        Ok(Self { conn })
    }

    pub async fn ping(&self) -> Result<(), redis::RedisError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, redis::RedisError> {
        let mut conn = self.conn.clone();
        conn.get(key).await
    }

    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, redis::RedisError> {
        let mut conn = self.conn.clone();
        conn.hgetall(key).await
    }

    pub async fn zcard(&self, key: &str) -> Result<u64, redis::RedisError> {
        let mut conn = self.conn.clone();
        conn.zcard(key).await
    }

    pub async fn zrangebyscore(
        &self,
        key: &str,
        min: &str,
        max: &str,
    ) -> Result<Vec<String>, redis::RedisError> {
        let mut conn = self.conn.clone();
        conn.zrangebyscore(key, min, max).await
    }

    /// Run a Lua script atomically. Redis loads it by SHA and falls back to
    /// `EVAL` when the script cache was flushed.
    pub async fn eval<K, A, T>(&self, script: &Script, keys: &[K], args: &[A]) -> Result<T, redis::RedisError>
    where
        K: ToRedisArgs,
        A: ToRedisArgs,
        T: FromRedisValue,
    {
        let mut conn = self.conn.clone();
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        for arg in args {
            invocation.arg(arg);
        }
        invocation.invoke_async(&mut conn).await
    }

    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

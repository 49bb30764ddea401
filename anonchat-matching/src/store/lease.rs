//! Single-instance guard for the Redis store.
//!
//! Socket.IO rooms live in process memory, so exactly one process may serve a
//! given Redis. The holder writes a random token under `anonchat:instance`
//! with a TTL and renews it every third of that TTL. A second process finds
//! the key taken and refuses to start. A holder that finds its token gone
//! stops serving.

use std::time::Duration;

use redis::Script;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use anonchat_shared::clients::redis::RedisClient;

use super::StoreResult;

const LEASE_KEY: &str = "anonchat:instance";

// KEYS: lease
// ARGV: holder, ttl_ms
const RENEW_LUA: &str = r#"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then return 0 end
redis.call('PEXPIRE', KEYS[1], ARGV[2])
return 1
"#;

// KEYS: lease
// ARGV: holder
const RELEASE_LUA: &str = r#"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then return 0 end
return redis.call('DEL', KEYS[1])
"#;

pub struct InstanceLease {
    redis: RedisClient,
    holder: String,
    ttl: Duration,
    renew: Script,
    release: Script,
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

impl InstanceLease {
    /// Take the lease, or `None` while another process holds it.
    pub async fn acquire(redis: RedisClient, ttl: Duration) -> StoreResult<Option<Self>> {
        let holder = Uuid::now_v7().to_string();
        let taken: Option<String> = redis::cmd("SET")
            .arg(LEASE_KEY)
            .arg(&holder)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut redis.connection())
            .await?;
        if taken.is_none() {
            return Ok(None);
        }

        tracing::info!(holder = %holder, ttl_secs = ttl.as_secs(), "instance lease acquired");
        Ok(Some(Self {
            redis,
            holder,
            ttl,
            renew: Script::new(RENEW_LUA),
            release: Script::new(RELEASE_LUA),
        }))
    }

    #[cfg(test)]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Extend the TTL. False when the lease expired and someone else took it.
    pub async fn renew(&self) -> StoreResult<bool> {
        let renewed: i64 = self
            .redis
            .eval(&self.renew, &[LEASE_KEY], &[self.holder.clone(), ttl_millis(self.ttl).to_string()])
            .await?;
        Ok(renewed == 1)
    }

    /// Drop the key if it is still ours.
    pub async fn release(&self) -> StoreResult<bool> {
        let released: i64 = self
            .redis
            .eval(&self.release, &[LEASE_KEY], &[self.holder.as_str()])
            .await?;
        Ok(released == 1)
    }

    /// Renew until `shutdown` fires, then release. Losing the lease cancels
    /// `shutdown`. A failed renewal is retried on the next tick; the key
    /// outlives two missed renewals.
    pub async fn keep_alive(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval((self.ttl / 3).max(Duration::from_millis(100)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => match self.renew().await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::error!(holder = %self.holder, "instance lease lost, shutting down");
                        shutdown.cancel();
                        return;
                    }
                    Err(e) => tracing::warn!(holder = %self.holder, error = %e, "instance lease renewal failed"),
                },
            }
        }

        match self.release().await {
            Ok(_) => tracing::info!(holder = %self.holder, "instance lease released"),
            Err(e) => tracing::warn!(holder = %self.holder, error = %e, "instance lease release failed"),
        }
    }
}

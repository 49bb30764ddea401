//! Persistent state behind the matchmaker.
//!
//! Three collections, each behind its own trait: the user directory, the
//! waiting pool and the session registry. Every operation that another user's
//! event could race with is a single atomic store operation; callers never
//! read-then-write shared records.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use anonchat_shared::errors::{AppError, ErrorCode};

use crate::models::{EndReason, PairId, ReportIntent, Session, UserId, UserProfile, WaitingEntry};

pub mod lease;
pub mod memory;
pub mod redis;

#[cfg(test)]
pub(crate) mod contract;

pub use self::lease::InstanceLease;
pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("user {0} already has an active session")]
    Conflict(UserId),

    #[error("corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(user) => AppError::new(
                ErrorCode::AlreadyInMatch,
                format!("user {user} already has an active session"),
            ),
            other => {
                tracing::error!(error = %other, "store unavailable");
                AppError::unavailable("store unavailable")
            }
        }
    }
}

/// Outcome of an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Added,
    AlreadyWaiting,
    InSession,
}

/// Outcome of [`WaitingPool::match_or_enqueue`].
#[derive(Debug, Clone, PartialEq)]
pub enum Placement {
    /// A partner was waiting. Both left the pool and the session is open.
    Paired { session: Session, partner: WaitingEntry },
    /// Nobody compatible was waiting; the caller's entry is now in the pool.
    Waiting,
    AlreadyWaiting,
    InSession,
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Create the profile on first contact, otherwise bump `last_active`.
    async fn touch(&self, user: UserId, default_language: &str, now: DateTime<Utc>) -> StoreResult<UserProfile>;

    async fn get(&self, user: UserId) -> StoreResult<Option<UserProfile>>;

    async fn set_language(&self, user: UserId, language: &str) -> StoreResult<()>;

    /// Atomic increment-and-return of the warning counter.
    async fn increment_warnings(&self, user: UserId) -> StoreResult<u32>;

    async fn set_banned(&self, user: UserId) -> StoreResult<()>;

    async fn set_premium_expiry(&self, user: UserId, expiry: Option<DateTime<Utc>>) -> StoreResult<()>;

    /// Clear the premium expiry only if it still equals `expected`.
    /// Returns whether this call cleared it.
    async fn clear_premium_if(&self, user: UserId, expected: DateTime<Utc>) -> StoreResult<bool>;
}

#[async_trait]
pub trait WaitingPool: Send + Sync {
    /// Insert the entry unless the user is already waiting or in an active session.
    async fn enqueue(&self, entry: WaitingEntry) -> StoreResult<Enqueued>;

    /// Atomically pick one other entry enqueued at or after `not_before`,
    /// same language first, oldest first, then the oldest of any language.
    /// Removes the picked entry and the caller's own entry in the same step.
    async fn match_and_remove(
        &self,
        user: UserId,
        language: &str,
        not_before: DateTime<Utc>,
    ) -> StoreResult<Option<WaitingEntry>>;

    /// Pair the entry's user with a waiting partner, or enqueue the entry.
    /// Candidates are chosen as in [`WaitingPool::match_and_remove`] and must
    /// not be in a session. Picking, removing the partner, opening the session
    /// and enqueueing on a miss are one atomic step, so two concurrent callers
    /// on an empty pool end up paired with each other and a failure leaves
    /// the pool untouched.
    async fn match_or_enqueue(&self, entry: WaitingEntry, not_before: DateTime<Utc>) -> StoreResult<Placement>;

    /// Returns whether an entry was removed.
    async fn cancel(&self, user: UserId) -> StoreResult<bool>;

    async fn get(&self, user: UserId) -> StoreResult<Option<WaitingEntry>>;

    /// Remove and return every entry enqueued before `cutoff`.
    async fn expire(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<WaitingEntry>>;

    async fn len(&self) -> StoreResult<u64>;
}

#[async_trait]
pub trait SessionRegistry: Send + Sync {
    /// Open a session for the two users, or `StoreError::Conflict` if either
    /// already has an active one.
    async fn create(&self, a: UserId, b: UserId, now: DateTime<Utc>) -> StoreResult<Session>;

    /// The active session the user belongs to.
    async fn lookup(&self, user: UserId) -> StoreResult<Option<Session>>;

    /// Mark the session ended. Returns the session as it was while active if
    /// this call performed the transition, `None` if it was already ended.
    async fn end(&self, pair_id: PairId, reason: EndReason, now: DateTime<Utc>) -> StoreResult<Option<Session>>;

    async fn touch(&self, pair_id: PairId, now: DateTime<Utc>) -> StoreResult<()>;

    /// Record a pending report on an active session the reporter belongs to.
    async fn set_report_intent(&self, pair_id: PairId, reporter: UserId) -> StoreResult<bool>;

    /// Atomically take the reporter's pending report, if any.
    async fn take_report_intent(&self, pair_id: PairId, reporter: UserId) -> StoreResult<Option<ReportIntent>>;

    /// Active sessions whose last activity is before `idle_before`.
    async fn stale(&self, idle_before: DateTime<Utc>) -> StoreResult<Vec<Session>>;

    async fn active_count(&self) -> StoreResult<u64>;

    async fn partner_of(&self, user: UserId) -> StoreResult<Option<UserId>> {
        Ok(self.lookup(user).await?.and_then(|s| s.partner_of(user)))
    }
}

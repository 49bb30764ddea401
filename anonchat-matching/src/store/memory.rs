//! In-process store with the same atomicity contract as the Redis store:
//! each trait method runs under the lock of the collection it touches.
//! Used by tests and by `ANONCHAT_STORE=memory` local runs.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{Enqueued, Placement, SessionRegistry, StoreError, StoreResult, UserDirectory, WaitingPool};
use crate::models::{
    EndReason, PairId, ReportIntent, Session, SessionStatus, UserId, UserProfile, WaitingEntry,
};

#[derive(Default)]
struct Sessions {
    by_pair: HashMap<PairId, Session>,
    by_member: HashMap<UserId, PairId>,
}

impl Sessions {
    fn insert(&mut self, session: &Session) {
        self.by_member.insert(session.member_a, session.pair_id);
        self.by_member.insert(session.member_b, session.pair_id);
        self.by_pair.insert(session.pair_id, session.clone());
    }
}

pub struct MemoryStore {
    /// Language of profiles created implicitly by moderation or premium writes.
    default_language: String,
    users: Mutex<HashMap<UserId, UserProfile>>,
    waiting: Mutex<HashMap<UserId, WaitingEntry>>,
    sessions: Mutex<Sessions>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Oldest eligible entry in `language`, else the oldest eligible entry of any
/// language. Ties on time break on user id.
fn pick_candidate(
    waiting: &HashMap<UserId, WaitingEntry>,
    user: UserId,
    language: &str,
    not_before: DateTime<Utc>,
    eligible: impl Fn(&UserId) -> bool,
) -> Option<UserId> {
    let oldest = |same_language: bool| {
        waiting
            .values()
            .filter(|e| e.user_id != user && e.enqueued_at >= not_before && eligible(&e.user_id))
            .filter(|e| !same_language || e.language == language)
            .min_by_key(|e| (e.enqueued_at, e.user_id))
            .map(|e| e.user_id)
    };
    oldest(true).or_else(|| oldest(false))
}

impl MemoryStore {
    pub fn new(default_language: impl Into<String>) -> Self {
        Self {
            default_language: default_language.into(),
            users: Mutex::default(),
            waiting: Mutex::default(),
            sessions: Mutex::default(),
        }
    }

    fn with_profile<R>(&self, user: UserId, f: impl FnOnce(&mut UserProfile) -> R) -> R {
        let mut users = lock(&self.users);
        let profile = users
            .entry(user)
            .or_insert_with(|| UserProfile::new(user, &self.default_language, Utc::now()));
        f(profile)
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn touch(&self, user: UserId, default_language: &str, now: DateTime<Utc>) -> StoreResult<UserProfile> {
        let mut users = lock(&self.users);
        let profile = users
            .entry(user)
            .or_insert_with(|| UserProfile::new(user, default_language, now));
        profile.last_active = now;
        Ok(profile.clone())
    }

    async fn get(&self, user: UserId) -> StoreResult<Option<UserProfile>> {
        Ok(lock(&self.users).get(&user).cloned())
    }

    async fn set_language(&self, user: UserId, language: &str) -> StoreResult<()> {
        let now = Utc::now();
        lock(&self.users)
            .entry(user)
            .or_insert_with(|| UserProfile::new(user, language, now))
            .language = language.to_string();
        Ok(())
    }

    async fn increment_warnings(&self, user: UserId) -> StoreResult<u32> {
        Ok(self.with_profile(user, |profile| {
            profile.warnings += 1;
            profile.warnings
        }))
    }

    async fn set_banned(&self, user: UserId) -> StoreResult<()> {
        self.with_profile(user, |profile| profile.banned = true);
        Ok(())
    }

    async fn set_premium_expiry(&self, user: UserId, expiry: Option<DateTime<Utc>>) -> StoreResult<()> {
        self.with_profile(user, |profile| profile.premium_expiry = expiry);
        Ok(())
    }

    async fn clear_premium_if(&self, user: UserId, expected: DateTime<Utc>) -> StoreResult<bool> {
        let mut users = lock(&self.users);
        match users.get_mut(&user) {
            Some(profile) if profile.premium_expiry == Some(expected) => {
                profile.premium_expiry = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl WaitingPool for MemoryStore {
    async fn enqueue(&self, entry: WaitingEntry) -> StoreResult<Enqueued> {
        // sessions before waiting, same order as `match_or_enqueue`
        let sessions = lock(&self.sessions);
        if sessions.by_member.contains_key(&entry.user_id) {
            return Ok(Enqueued::InSession);
        }
        let mut waiting = lock(&self.waiting);
        if waiting.contains_key(&entry.user_id) {
            return Ok(Enqueued::AlreadyWaiting);
        }
        waiting.insert(entry.user_id, entry);
        Ok(Enqueued::Added)
    }

    async fn match_and_remove(
        &self,
        user: UserId,
        language: &str,
        not_before: DateTime<Utc>,
    ) -> StoreResult<Option<WaitingEntry>> {
        let mut waiting = lock(&self.waiting);
        let Some(candidate) = pick_candidate(&waiting, user, language, not_before, |_| true) else {
            return Ok(None);
        };

        waiting.remove(&user);
        Ok(waiting.remove(&candidate))
    }

    async fn match_or_enqueue(&self, entry: WaitingEntry, not_before: DateTime<Utc>) -> StoreResult<Placement> {
        let mut sessions = lock(&self.sessions);
        if sessions.by_member.contains_key(&entry.user_id) {
            return Ok(Placement::InSession);
        }
        let mut waiting = lock(&self.waiting);
        if waiting.contains_key(&entry.user_id) {
            return Ok(Placement::AlreadyWaiting);
        }

        let candidate = pick_candidate(&waiting, entry.user_id, &entry.language, not_before, |id| {
            !sessions.by_member.contains_key(id)
        });
        let Some(partner) = candidate.and_then(|id| waiting.remove(&id)) else {
            waiting.insert(entry.user_id, entry);
            return Ok(Placement::Waiting);
        };

        let session = Session::open(Uuid::now_v7(), entry.user_id, partner.user_id, entry.enqueued_at);
        sessions.insert(&session);
        Ok(Placement::Paired { session, partner })
    }

    async fn cancel(&self, user: UserId) -> StoreResult<bool> {
        Ok(lock(&self.waiting).remove(&user).is_some())
    }

    async fn get(&self, user: UserId) -> StoreResult<Option<WaitingEntry>> {
        Ok(lock(&self.waiting).get(&user).cloned())
    }

    async fn expire(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<WaitingEntry>> {
        let mut waiting = lock(&self.waiting);
        let expired: Vec<UserId> = waiting
            .values()
            .filter(|e| e.enqueued_at < cutoff)
            .map(|e| e.user_id)
            .collect();
        Ok(expired.iter().filter_map(|id| waiting.remove(id)).collect())
    }

    async fn len(&self) -> StoreResult<u64> {
        Ok(lock(&self.waiting).len() as u64)
    }
}

#[async_trait]
impl SessionRegistry for MemoryStore {
    async fn create(&self, a: UserId, b: UserId, now: DateTime<Utc>) -> StoreResult<Session> {
        let mut sessions = lock(&self.sessions);
        for user in [a, b] {
            if sessions.by_member.contains_key(&user) {
                return Err(StoreError::Conflict(user));
            }
        }

        let session = Session::open(Uuid::now_v7(), a, b, now);
        sessions.insert(&session);
        Ok(session)
    }

    async fn lookup(&self, user: UserId) -> StoreResult<Option<Session>> {
        let sessions = lock(&self.sessions);
        Ok(sessions
            .by_member
            .get(&user)
            .and_then(|pair_id| sessions.by_pair.get(pair_id))
            .filter(|s| s.is_active())
            .cloned())
    }

    async fn end(&self, pair_id: PairId, _reason: EndReason, now: DateTime<Utc>) -> StoreResult<Option<Session>> {
        let mut sessions = lock(&self.sessions);
        let Some(session) = sessions.by_pair.get_mut(&pair_id) else {
            return Ok(None);
        };
        if !session.is_active() {
            return Ok(None);
        }

        let snapshot = session.clone();
        session.status = SessionStatus::Ended;
        session.report_by = None;
        session.last_activity = now;

        for member in [snapshot.member_a, snapshot.member_b] {
            if sessions.by_member.get(&member) == Some(&pair_id) {
                sessions.by_member.remove(&member);
            }
        }
        Ok(Some(snapshot))
    }

    async fn touch(&self, pair_id: PairId, now: DateTime<Utc>) -> StoreResult<()> {
        if let Some(session) = lock(&self.sessions).by_pair.get_mut(&pair_id) {
            if session.is_active() {
                session.last_activity = now;
            }
        }
        Ok(())
    }

    async fn set_report_intent(&self, pair_id: PairId, reporter: UserId) -> StoreResult<bool> {
        let mut sessions = lock(&self.sessions);
        match sessions.by_pair.get_mut(&pair_id) {
            Some(session) if session.is_active() && session.has_member(reporter) => {
                session.report_by = Some(reporter);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn take_report_intent(&self, pair_id: PairId, reporter: UserId) -> StoreResult<Option<ReportIntent>> {
        let mut sessions = lock(&self.sessions);
        match sessions.by_pair.get_mut(&pair_id) {
            Some(session) if session.is_active() && session.report_by == Some(reporter) => {
                let intent = session.report_intent();
                session.report_by = None;
                Ok(intent)
            }
            _ => Ok(None),
        }
    }

    async fn stale(&self, idle_before: DateTime<Utc>) -> StoreResult<Vec<Session>> {
        Ok(lock(&self.sessions)
            .by_pair
            .values()
            .filter(|s| s.is_active() && s.last_activity < idle_before)
            .cloned()
            .collect())
    }

    async fn active_count(&self) -> StoreResult<u64> {
        Ok(lock(&self.sessions).by_member.len() as u64 / 2)
    }
}

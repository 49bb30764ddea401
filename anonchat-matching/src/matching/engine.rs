use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use metrics::counter;

use anonchat_shared::errors::AppResult;

use super::timers::SearchTimers;
use crate::config::MatchingConfig;
use crate::events::{DomainEvent, EventPublisher};
use crate::gateway::{DeliveryError, Gateway, NoticeKey, Outbound};
use crate::models::{EndReason, MatchState, Session, UserId, WaitingEntry};
use crate::store::{Placement, SessionRegistry, UserDirectory, WaitingPool};

/// Current time at the store's resolution. Redis keeps milliseconds, so
/// timestamps compared after a round trip must be truncated the same way.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Result of a `/next` request.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Paired(Session),
    Searching,
    AlreadySearching,
    AlreadyPaired,
    Banned,
}

/// Result of a `/stop` request.
#[derive(Debug, Clone, PartialEq)]
pub enum StopOutcome {
    Ended(Session),
    SearchCancelled,
    NotPaired,
}

/// Orchestrates the per-user state machine over the three stores.
///
/// A user's state is never cached here. It is derived from the stores on
/// every call.
#[derive(Clone)]
pub struct MatchmakingEngine {
    pub(crate) users: Arc<dyn UserDirectory>,
    pub(crate) pool: Arc<dyn WaitingPool>,
    pub(crate) sessions: Arc<dyn SessionRegistry>,
    gateway: Arc<dyn Gateway>,
    pub(crate) events: EventPublisher,
    pub(crate) timers: SearchTimers,
    config: Arc<MatchingConfig>,
}

impl MatchmakingEngine {
    pub fn new<S>(
        store: Arc<S>,
        gateway: Arc<dyn Gateway>,
        events: EventPublisher,
        config: MatchingConfig,
        search_poll: Duration,
    ) -> Self
    where
        S: UserDirectory + WaitingPool + SessionRegistry + 'static,
    {
        Self {
            users: store.clone(),
            pool: store.clone(),
            sessions: store,
            gateway,
            events,
            timers: SearchTimers::new(search_poll),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    pub async fn state_of(&self, user: UserId) -> AppResult<MatchState> {
        if self.users.get(user).await?.is_some_and(|p| p.banned) {
            return Ok(MatchState::Banned);
        }
        if self.sessions.lookup(user).await?.is_some() {
            return Ok(MatchState::Paired);
        }
        if self.pool.get(user).await?.is_some() {
            return Ok(MatchState::Searching);
        }
        Ok(MatchState::Idle)
    }

    /// `/next`: pair with a waiting user, or start searching.
    pub async fn request_match(&self, user: UserId) -> AppResult<MatchOutcome> {
        let now = now();
        let (language, warnings, banned) = match self.users.get(user).await? {
            Some(p) => (p.language, p.warnings, p.banned),
            None => (self.config.default_language.clone(), 0, false),
        };

        if banned {
            self.deliver(vec![Outbound::notice(user, NoticeKey::Banned)]).await;
            return Ok(MatchOutcome::Banned);
        }
        if warnings >= self.config.max_warnings {
            tracing::info!(user_id = %user, warnings, "warning threshold already reached, banning");
            self.ban_user(user).await?;
            return Ok(MatchOutcome::Banned);
        }

        let not_before = now - chrono::Duration::from_std(self.config.wait_ttl).unwrap_or_else(|_| chrono::Duration::zero());
        let entry = WaitingEntry::new(user, language, now);
        match self.pool.match_or_enqueue(entry.clone(), not_before).await? {
            Placement::Paired { session, partner } => {
                self.timers.cancel(partner.user_id);
                tracing::info!(
                    pair_id = %session.pair_id,
                    member_a = %session.member_a,
                    member_b = %session.member_b,
                    "session started"
                );
                counter!("anonchat_sessions_created_total").increment(1);
                self.events.publish(DomainEvent::SessionStarted(session.clone())).await;
                self.deliver(vec![
                    Outbound::notice(user, NoticeKey::PartnerFound),
                    Outbound::notice(partner.user_id, NoticeKey::PartnerFound),
                ])
                .await;
                Ok(MatchOutcome::Paired(session))
            }
            Placement::Waiting => {
                tracing::debug!(user_id = %user, language = %entry.language, "user searching");
                self.arm_search_timer(entry, self.config.search_timeout);
                self.deliver(vec![Outbound::notice(user, NoticeKey::Searching)]).await;
                Ok(MatchOutcome::Searching)
            }
            Placement::AlreadyWaiting => {
                self.deliver(vec![Outbound::notice(user, NoticeKey::AlreadySearching)]).await;
                Ok(MatchOutcome::AlreadySearching)
            }
            Placement::InSession => {
                self.deliver(vec![Outbound::notice(user, NoticeKey::AlreadyPaired)]).await;
                Ok(MatchOutcome::AlreadyPaired)
            }
        }
    }

    /// Leave the waiting pool. Returns whether the user was searching.
    pub async fn cancel_search(&self, user: UserId) -> AppResult<bool> {
        let removed = self.pool.cancel(user).await?;
        self.timers.cancel(user);
        if removed {
            tracing::debug!(user_id = %user, "search cancelled");
        }
        Ok(removed)
    }

    /// End the user's session. The initiator is told they left, the partner
    /// that their partner left.
    pub async fn end_session(&self, user: UserId) -> AppResult<Option<Session>> {
        let Some(session) = self.sessions.lookup(user).await? else {
            return Ok(None);
        };
        if !self.close_session(&session, EndReason::Left, Some(user)).await? {
            return Ok(None);
        }

        let mut outbox = vec![Outbound::notice(user, NoticeKey::YouLeft)];
        if let Some(partner) = session.partner_of(user) {
            outbox.push(Outbound::notice(partner, NoticeKey::PartnerLeft));
        }
        self.deliver(outbox).await;
        Ok(Some(session))
    }

    /// `/stop`: end the session, or stop searching, or tell the user there is
    /// nothing to stop.
    pub async fn stop(&self, user: UserId) -> AppResult<StopOutcome> {
        if let Some(session) = self.end_session(user).await? {
            return Ok(StopOutcome::Ended(session));
        }
        if self.cancel_search(user).await? {
            self.deliver(vec![Outbound::notice(user, NoticeKey::SearchStopped)]).await;
            return Ok(StopOutcome::SearchCancelled);
        }
        self.deliver(vec![Outbound::notice(user, NoticeKey::NotPaired)]).await;
        Ok(StopOutcome::NotPaired)
    }

    /// Ban a user. Absorbing: the flag is never cleared here.
    pub async fn ban_user(&self, user: UserId) -> AppResult<()> {
        self.users.set_banned(user).await?;
        self.cancel_search(user).await?;

        let mut outbox = Vec::new();
        if let Some(session) = self.sessions.lookup(user).await? {
            if self.close_session(&session, EndReason::Banned, None).await? {
                if let Some(partner) = session.partner_of(user) {
                    outbox.push(Outbound::notice(partner, NoticeKey::PartnerBanned));
                }
            }
        }

        let warnings = self.users.get(user).await?.map(|p| p.warnings).unwrap_or(0);
        tracing::warn!(user_id = %user, warnings, "user banned");
        counter!("anonchat_bans_total").increment(1);
        self.events.publish(DomainEvent::UserBanned { user_id: user, warnings }).await;

        outbox.push(Outbound::notice(user, NoticeKey::Banned));
        self.deliver(outbox).await;
        Ok(())
    }

    /// Relay free text to the partner. Returns false when the sender is not
    /// in a session.
    pub async fn relay(&self, user: UserId, text: &str) -> AppResult<bool> {
        let Some(session) = self.sessions.lookup(user).await? else {
            return Ok(false);
        };
        let Some(partner) = session.partner_of(user) else {
            return Ok(false);
        };
        self.sessions.touch(session.pair_id, now()).await?;
        self.deliver(vec![Outbound::Forward { to: partner, text: text.to_string() }]).await;
        Ok(true)
    }

    /// Same cleanup as an explicit stop, for a user that went away.
    /// The partner, if any, is told their partner left.
    pub async fn disconnect(&self, user: UserId) -> AppResult<()> {
        let outbox = self.disconnect_outbox(user).await?;
        self.deliver(outbox).await;
        Ok(())
    }

    async fn disconnect_outbox(&self, user: UserId) -> AppResult<Vec<Outbound>> {
        self.cancel_search(user).await?;

        let mut outbox = Vec::new();
        if let Some(session) = self.sessions.lookup(user).await? {
            if self.close_session(&session, EndReason::Disconnected, Some(user)).await? {
                tracing::info!(user_id = %user, pair_id = %session.pair_id, "session ended by disconnect");
                if let Some(partner) = session.partner_of(user) {
                    outbox.push(Outbound::notice(partner, NoticeKey::PartnerLeft));
                }
            }
        }
        Ok(outbox)
    }

    /// End an active session. Returns whether this call performed the
    /// transition; only that caller records it.
    pub(crate) async fn close_session(
        &self,
        session: &Session,
        reason: EndReason,
        ended_by: Option<UserId>,
    ) -> AppResult<bool> {
        let ended_at = now();
        let Some(ended) = self.sessions.end(session.pair_id, reason, ended_at).await? else {
            return Ok(false);
        };

        tracing::info!(pair_id = %ended.pair_id, reason = reason.as_str(), "session ended");
        counter!("anonchat_sessions_ended_total", "reason" => reason.as_str()).increment(1);
        self.events
            .publish(DomainEvent::session_ended(ended, reason, ended_by, ended_at))
            .await;
        Ok(true)
    }

    async fn language_of(&self, user: UserId) -> String {
        match self.users.get(user).await {
            Ok(Some(profile)) => profile.language,
            Ok(None) => self.config.default_language.clone(),
            Err(e) => {
                tracing::warn!(user_id = %user, error = %e, "language lookup failed, using default");
                self.config.default_language.clone()
            }
        }
    }

    /// Send an outbox. State is already committed when this runs.
    ///
    /// An unreachable recipient gets the disconnect cleanup, whose notices are
    /// appended to the same outbox. Each user is cleaned up at most once.
    pub(crate) async fn deliver(&self, outbox: Vec<Outbound>) {
        let mut queue: VecDeque<Outbound> = outbox.into();
        let mut gone: HashSet<UserId> = HashSet::new();

        while let Some(message) = queue.pop_front() {
            let to = message.recipient();
            if gone.contains(&to) {
                continue;
            }

            let language = self.language_of(to).await;
            match self.gateway.deliver(&message, &language).await {
                Ok(()) => {}
                Err(DeliveryError::Unreachable(user)) => {
                    tracing::info!(user_id = %user, "recipient unreachable, treating as disconnect");
                    gone.insert(user);
                    match self.disconnect_outbox(user).await {
                        Ok(more) => queue.extend(more),
                        Err(e) => tracing::error!(user_id = %user, error = %e, "disconnect cleanup failed"),
                    }
                }
                Err(e @ DeliveryError::Transient(_)) => {
                    tracing::warn!(user_id = %to, error = %e, "notification dropped");
                }
            }
        }
    }
}

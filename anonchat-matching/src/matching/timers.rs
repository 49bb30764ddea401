//! Per-search timeout watchers.
//!
//! Each waiting entry gets one tokio task that sleeps until the search
//! deadline. The task is cancelled through its `CancellationToken` when the
//! search ends through the engine (match, cancel, ban). Entries that leave
//! the pool any other way, such as a sweep or a store flush, are noticed by a
//! slow poll of the waiting pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use metrics::counter;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::engine::{now, MatchmakingEngine};
use crate::events::DomainEvent;
use crate::gateway::{NoticeKey, Outbound};
use crate::models::{UserId, WaitingEntry};

const MIN_POLL: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct SearchTimers {
    armed: Arc<Mutex<HashMap<UserId, (u64, CancellationToken)>>>,
    generation: Arc<AtomicU64>,
    poll: Duration,
}

impl SearchTimers {
    pub fn new(poll: Duration) -> Self {
        Self {
            armed: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
            poll: poll.max(MIN_POLL),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, (u64, CancellationToken)>> {
        self.armed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a fresh timer for the user, cancelling any previous one.
    fn register(&self, user: UserId) -> (u64, CancellationToken) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        if let Some((_, previous)) = self.lock().insert(user, (generation, token.clone())) {
            previous.cancel();
        }
        (generation, token)
    }

    pub fn cancel(&self, user: UserId) {
        if let Some((_, token)) = self.lock().remove(&user) {
            token.cancel();
        }
    }

    /// Drop the registration if it still belongs to this timer.
    fn release(&self, user: UserId, generation: u64) {
        let mut armed = self.lock();
        if armed.get(&user).is_some_and(|(g, _)| *g == generation) {
            armed.remove(&user);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MatchmakingEngine {
    pub(crate) fn arm_search_timer(&self, entry: WaitingEntry, after: Duration) {
        let user = entry.user_id;
        let (generation, token) = self.timers.register(user);
        let engine = self.clone();

        tokio::spawn(async move {
            let deadline = Instant::now() + after;
            let period = engine.timers.poll;
            let mut poll = tokio::time::interval_at(Instant::now() + period, period);
            poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep_until(deadline) => break,
                    _ = poll.tick() => {
                        if !engine.is_waiting_since(&entry).await {
                            tracing::debug!(user_id = %user, "search ended elsewhere, timer released");
                            engine.timers.release(user, generation);
                            return;
                        }
                    }
                }
            }

            engine.timers.release(user, generation);
            engine.on_search_timeout(entry).await;
        });
    }

    /// Whether this exact search is still in the pool. Store errors count as
    /// yes, so a flaky store never ends a search early.
    async fn is_waiting_since(&self, entry: &WaitingEntry) -> bool {
        match self.pool.get(entry.user_id).await {
            Ok(Some(current)) => current.enqueued_at == entry.enqueued_at,
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(user_id = %entry.user_id, error = %e, "waiting pool check failed");
                true
            }
        }
    }

    /// The deadline passed. Acts only if the same search is still pending.
    pub(crate) async fn on_search_timeout(&self, entry: WaitingEntry) {
        let user = entry.user_id;
        if !self.is_waiting_since(&entry).await {
            return;
        }
        match self.pool.cancel(user).await {
            Ok(true) => {}
            // matched or cancelled since the check
            Ok(false) => return,
            Err(e) => {
                tracing::error!(user_id = %user, error = %e, "failed to dequeue timed out search");
                return;
            }
        }

        tracing::info!(user_id = %user, "search timed out");
        let outbox = self.search_expired(&entry).await;
        self.deliver(outbox).await;
    }

    /// Record an expired search and build the user's notice.
    pub(crate) async fn search_expired(&self, entry: &WaitingEntry) -> Vec<Outbound> {
        let waited_secs = (now() - entry.enqueued_at).num_seconds().max(0);
        counter!("anonchat_search_timeouts_total").increment(1);
        self.events
            .publish(DomainEvent::SearchTimedOut { user_id: entry.user_id, waited_secs })
            .await;

        let minutes = self.config().search_timeout.as_secs().div_ceil(60).max(1);
        vec![Outbound::notice_with(
            entry.user_id,
            NoticeKey::SearchTimeout,
            vec![("minutes", minutes.to_string())],
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MatchState;
    use crate::store::WaitingPool;
    use crate::testing::{harness, user};

    #[test]
    fn registering_again_cancels_the_previous_token() {
        let timers = SearchTimers::new(Duration::from_secs(10));
        let u = user(1);

        let (first_gen, first) = timers.register(u);
        let (_, second) = timers.register(u);
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());

        // a stale generation must not drop the newer registration
        timers.release(u, first_gen);
        assert_eq!(timers.len(), 1);

        timers.cancel(u);
        assert!(second.is_cancelled());
        assert!(timers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn search_times_out_after_the_bound() {
        let h = harness();
        let a = user(1);
        h.engine.request_match(a).await.unwrap();

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert_eq!(h.engine.state_of(a).await.unwrap(), MatchState::Searching);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.engine.state_of(a).await.unwrap(), MatchState::Idle);
        assert_eq!(h.gateway.notices_for(a), vec![NoticeKey::Searching, NoticeKey::SearchTimeout]);
        assert_eq!(h.sink.kinds(), vec!["search_timed_out"]);
        assert!(h.engine.timers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn matched_user_never_times_out() {
        let h = harness();
        let (a, b) = (user(1), user(2));
        h.engine.request_match(a).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        h.engine.request_match(b).await.unwrap();

        tokio::time::sleep(Duration::from_secs(600)).await;

        assert_eq!(h.engine.state_of(a).await.unwrap(), MatchState::Paired);
        assert!(!h.gateway.notices_for(a).contains(&NoticeKey::SearchTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn new_search_is_not_ended_by_an_old_deadline() {
        let h = harness();
        let a = user(1);
        h.engine.request_match(a).await.unwrap();
        tokio::time::sleep(Duration::from_secs(200)).await;
        h.engine.stop(a).await.unwrap();
        h.engine.request_match(a).await.unwrap();

        // first deadline would have been at 300s
        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(h.engine.state_of(a).await.unwrap(), MatchState::Searching);

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert_eq!(h.engine.state_of(a).await.unwrap(), MatchState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn search_removed_elsewhere_releases_the_timer() {
        let h = harness();
        let a = user(1);
        h.engine.request_match(a).await.unwrap();

        // as if another instance paired the user
        h.store.cancel(a).await.unwrap();
        tokio::time::sleep(Duration::from_secs(15)).await;

        assert!(h.engine.timers.is_empty());
        assert!(!h.gateway.notices_for(a).contains(&NoticeKey::SearchTimeout));
    }
}

//! Behaviour every store backend must share. Each case expects an empty
//! store; `memory.rs` runs them on a fresh `MemoryStore` and `redis.rs` on a
//! flushed Redis database.

use chrono::Duration;
use uuid::Uuid;

use super::{Enqueued, Placement, SessionRegistry, StoreError, UserDirectory, WaitingPool};
use crate::matching::engine::now;
use crate::models::{EndReason, UserId, WaitingEntry};

pub trait Store: UserDirectory + WaitingPool + SessionRegistry {}

impl<T: UserDirectory + WaitingPool + SessionRegistry> Store for T {}

fn uid(n: u128) -> UserId {
    Uuid::from_u128(n)
}

pub async fn match_prefers_same_language_then_oldest<S: Store>(store: &S) {
    let t0 = now() - Duration::seconds(30);

    store.enqueue(WaitingEntry::new(uid(1), "de", t0)).await.unwrap();
    store.enqueue(WaitingEntry::new(uid(2), "en", t0 + Duration::seconds(5))).await.unwrap();
    store.enqueue(WaitingEntry::new(uid(3), "en", t0 + Duration::seconds(10))).await.unwrap();

    let hit = store.match_and_remove(uid(9), "en", t0).await.unwrap().unwrap();
    assert_eq!(hit, WaitingEntry::new(uid(2), "en", t0 + Duration::seconds(5)));

    // no english left, falls back to the oldest of any language
    let hit = store.match_and_remove(uid(8), "fr", t0).await.unwrap().unwrap();
    assert_eq!(hit.user_id, uid(1));
    assert_eq!(hit.language, "de");
    assert_eq!(store.len().await.unwrap(), 1);
}

pub async fn match_skips_entries_past_the_window<S: Store>(store: &S) {
    let now = now();
    store
        .enqueue(WaitingEntry::new(uid(1), "en", now - Duration::seconds(600)))
        .await
        .unwrap();

    let hit = store
        .match_and_remove(uid(2), "en", now - Duration::seconds(300))
        .await
        .unwrap();
    assert!(hit.is_none());

    let expired = store.expire(now - Duration::seconds(300)).await.unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].user_id, uid(1));
    assert_eq!(store.len().await.unwrap(), 0);
}

pub async fn match_removes_the_caller_as_well<S: Store>(store: &S) {
    let now = now();
    store.enqueue(WaitingEntry::new(uid(1), "en", now)).await.unwrap();
    store.enqueue(WaitingEntry::new(uid(2), "en", now)).await.unwrap();

    let hit = store.match_and_remove(uid(1), "en", now).await.unwrap().unwrap();
    assert_eq!(hit.user_id, uid(2));
    assert!(WaitingPool::get(store, uid(1)).await.unwrap().is_none());
    assert_eq!(store.len().await.unwrap(), 0);
}

pub async fn enqueue_rejects_duplicates_and_paired_users<S: Store>(store: &S) {
    let now = now();
    assert_eq!(store.enqueue(WaitingEntry::new(uid(1), "en", now)).await.unwrap(), Enqueued::Added);
    assert_eq!(
        store.enqueue(WaitingEntry::new(uid(1), "en", now)).await.unwrap(),
        Enqueued::AlreadyWaiting
    );

    store.create(uid(2), uid(3), now).await.unwrap();
    assert_eq!(
        store.enqueue(WaitingEntry::new(uid(3), "en", now)).await.unwrap(),
        Enqueued::InSession
    );
    assert!(store.cancel(uid(1)).await.unwrap());
    assert!(!store.cancel(uid(1)).await.unwrap());
}

pub async fn match_or_enqueue_waits_then_pairs<S: Store>(store: &S) {
    let t0 = now() - Duration::seconds(10);
    let first = WaitingEntry::new(uid(2), "en", t0);

    let placed = store.match_or_enqueue(first.clone(), t0).await.unwrap();
    assert_eq!(placed, Placement::Waiting);
    assert_eq!(WaitingPool::get(store, uid(2)).await.unwrap(), Some(first.clone()));
    assert_eq!(
        store.match_or_enqueue(first.clone(), t0).await.unwrap(),
        Placement::AlreadyWaiting
    );

    let at = t0 + Duration::seconds(3);
    let Placement::Paired { session, partner } = store
        .match_or_enqueue(WaitingEntry::new(uid(1), "de", at), t0)
        .await
        .unwrap()
    else {
        panic!("expected a pairing");
    };
    assert_eq!(partner, first);
    assert_eq!((session.member_a, session.member_b), (uid(1), uid(2)));
    assert_eq!(session.created_at, at);
    assert!(session.is_active());

    assert_eq!(store.len().await.unwrap(), 0);
    assert_eq!(store.lookup(uid(1)).await.unwrap(), Some(session.clone()));
    assert_eq!(store.partner_of(uid(2)).await.unwrap(), Some(uid(1)));
    assert_eq!(store.active_count().await.unwrap(), 1);

    assert_eq!(
        store.match_or_enqueue(WaitingEntry::new(uid(2), "en", at), t0).await.unwrap(),
        Placement::InSession
    );
}

pub async fn match_or_enqueue_skips_paired_and_expired_entries<S: Store>(store: &S) {
    let now = now();
    store
        .enqueue(WaitingEntry::new(uid(1), "en", now - Duration::seconds(600)))
        .await
        .unwrap();
    store.enqueue(WaitingEntry::new(uid(2), "en", now)).await.unwrap();
    // a stale pool entry for someone who got paired meanwhile
    store.create(uid(2), uid(3), now).await.unwrap();

    let placed = store
        .match_or_enqueue(WaitingEntry::new(uid(4), "en", now), now - Duration::seconds(300))
        .await
        .unwrap();
    assert_eq!(placed, Placement::Waiting);
    assert_eq!(store.len().await.unwrap(), 3);
    assert_eq!(store.partner_of(uid(2)).await.unwrap(), Some(uid(3)));
}

pub async fn create_conflicts_when_a_member_is_paired<S: Store>(store: &S) {
    let now = now();
    let session = store.create(uid(1), uid(2), now).await.unwrap();
    assert_eq!(store.lookup(uid(2)).await.unwrap(), Some(session));

    let err = store.create(uid(2), uid(3), now).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(u) if u == uid(2)));
    assert!(store.lookup(uid(3)).await.unwrap().is_none());
    assert_eq!(store.partner_of(uid(2)).await.unwrap(), Some(uid(1)));
    assert_eq!(store.partner_of(uid(3)).await.unwrap(), None);
}

pub async fn end_frees_both_members_once<S: Store>(store: &S) {
    let now = now();
    let session = store.create(uid(1), uid(2), now).await.unwrap();

    let ended = store.end(session.pair_id, EndReason::Left, now).await.unwrap();
    assert_eq!(ended, Some(session.clone()));
    assert!(store.end(session.pair_id, EndReason::Left, now).await.unwrap().is_none());

    assert!(store.lookup(uid(1)).await.unwrap().is_none());
    assert!(store.lookup(uid(2)).await.unwrap().is_none());
    assert_eq!(store.active_count().await.unwrap(), 0);

    // both are free to pair again
    store.create(uid(1), uid(2), now).await.unwrap();
}

pub async fn report_intent_is_single_use<S: Store>(store: &S) {
    let session = store.create(uid(1), uid(2), now()).await.unwrap();

    assert!(!store.set_report_intent(session.pair_id, uid(7)).await.unwrap());
    assert!(store.set_report_intent(session.pair_id, uid(1)).await.unwrap());

    // only the reporter can consume it
    assert!(store.take_report_intent(session.pair_id, uid(2)).await.unwrap().is_none());
    let intent = store.take_report_intent(session.pair_id, uid(1)).await.unwrap().unwrap();
    assert_eq!(intent.target, uid(2));
    assert!(store.take_report_intent(session.pair_id, uid(1)).await.unwrap().is_none());
}

pub async fn stale_lists_only_idle_active_sessions<S: Store>(store: &S) {
    let old = now() - Duration::hours(30);
    let idle = store.create(uid(1), uid(2), old).await.unwrap();
    let fresh = store.create(uid(3), uid(4), now()).await.unwrap();

    let stale = store.stale(now() - Duration::hours(24)).await.unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].pair_id, idle.pair_id);

    SessionRegistry::touch(store, idle.pair_id, now()).await.unwrap();
    assert!(store.stale(now() - Duration::hours(24)).await.unwrap().is_empty());
    assert_ne!(idle.pair_id, fresh.pair_id);
}

pub async fn warnings_increment_and_premium_clears_once<S: Store>(store: &S) {
    assert_eq!(store.increment_warnings(uid(1)).await.unwrap(), 1);
    assert_eq!(store.increment_warnings(uid(1)).await.unwrap(), 2);

    let expiry = now() - Duration::days(1);
    store.set_premium_expiry(uid(1), Some(expiry)).await.unwrap();
    assert!(!store.clear_premium_if(uid(1), expiry + Duration::seconds(1)).await.unwrap());
    assert!(store.clear_premium_if(uid(1), expiry).await.unwrap());
    assert!(!store.clear_premium_if(uid(1), expiry).await.unwrap());

    let profile = UserDirectory::get(store, uid(1)).await.unwrap().unwrap();
    assert_eq!(profile.warnings, 2);
    assert_eq!(profile.premium_expiry, None);
}

/// `store` must have been built with `default_language`.
pub async fn implicit_profiles_use_the_configured_language<S: Store>(store: &S, default_language: &str) {
    store.increment_warnings(uid(1)).await.unwrap();
    store.set_banned(uid(2)).await.unwrap();
    store.set_premium_expiry(uid(3), Some(now())).await.unwrap();

    for n in 1..=3 {
        let profile = UserDirectory::get(store, uid(n)).await.unwrap().unwrap();
        assert_eq!(profile.language, default_language);
    }
}

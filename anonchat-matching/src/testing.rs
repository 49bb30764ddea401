//! Test doubles for the gateway, event sinks and store, and a harness wiring
//! them to an in-memory store.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::commands::CommandDispatcher;
use crate::config::{AppConfig, MatchingConfig};
use crate::events::{DomainEvent, EventPublisher, EventSink, SinkError};
use crate::gateway::{DeliveryError, Gateway, Localizer, NoticeKey, Outbound};
use crate::matching::MatchmakingEngine;
use crate::models::{EndReason, PairId, ReportIntent, Session, UserId, UserProfile, WaitingEntry};
use crate::moderation::ModerationWorkflow;
use crate::store::{
    Enqueued, MemoryStore, Placement, SessionRegistry, StoreResult, UserDirectory, WaitingPool,
};
use crate::AppState;

pub fn user(n: u128) -> UserId {
    Uuid::from_u128(n)
}

/// Records every delivered message with the language it was rendered in.
#[derive(Default)]
pub struct RecordingGateway {
    sent: Mutex<Vec<(Outbound, String)>>,
    unreachable: Mutex<HashSet<UserId>>,
    failing: Mutex<HashSet<UserId>>,
}

impl RecordingGateway {
    pub fn mark_unreachable(&self, user: UserId) {
        self.unreachable.lock().unwrap().insert(user);
    }

    pub fn fail_transiently(&self, user: UserId) {
        self.failing.lock().unwrap().insert(user);
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }

    pub fn sent(&self) -> Vec<Outbound> {
        self.sent.lock().unwrap().iter().map(|(m, _)| m.clone()).collect()
    }

    pub fn notices_for(&self, user: UserId) -> Vec<NoticeKey> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m {
                Outbound::Notice { to, key, .. } if to == user => Some(key),
                _ => None,
            })
            .collect()
    }

    pub fn forwards_for(&self, user: UserId) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m {
                Outbound::Forward { to, text } if to == user => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn menus_for(&self, user: UserId) -> usize {
        self.sent()
            .iter()
            .filter(|m| matches!(m, Outbound::ReportMenu { to } if *to == user))
            .count()
    }

    pub fn languages_for(&self, user: UserId) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m.recipient() == user)
            .map(|(_, lang)| lang.clone())
            .collect()
    }
}

#[async_trait]
impl Gateway for RecordingGateway {
    async fn deliver(&self, message: &Outbound, language: &str) -> Result<(), DeliveryError> {
        let to = message.recipient();
        if self.unreachable.lock().unwrap().contains(&to) {
            return Err(DeliveryError::Unreachable(to));
        }
        if self.failing.lock().unwrap().contains(&to) {
            return Err(DeliveryError::Transient("simulated failure".into()));
        }
        self.sent.lock().unwrap().push((message.clone(), language.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<DomainEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(DomainEvent::kind).collect()
    }

    pub fn ended_reasons(&self) -> Vec<EndReason> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                DomainEvent::SessionEnded { reason, .. } => Some(reason),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn handle(&self, event: &DomainEvent) -> Result<(), SinkError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Delegates to a `MemoryStore`, sleeping before every call so concurrent
/// callers interleave between store operations the way they would over a
/// network hop to Redis.
pub struct LatencyStore {
    inner: Arc<MemoryStore>,
    delay: Duration,
}

impl LatencyStore {
    pub fn new(inner: Arc<MemoryStore>, delay: Duration) -> Self {
        Self { inner, delay }
    }

    async fn hop(&self) {
        tokio::time::sleep(self.delay).await;
    }
}

#[async_trait]
impl UserDirectory for LatencyStore {
    async fn touch(&self, user: UserId, default_language: &str, now: DateTime<Utc>) -> StoreResult<UserProfile> {
        self.hop().await;
        UserDirectory::touch(&*self.inner, user, default_language, now).await
    }

    async fn get(&self, user: UserId) -> StoreResult<Option<UserProfile>> {
        self.hop().await;
        UserDirectory::get(&*self.inner, user).await
    }

    async fn set_language(&self, user: UserId, language: &str) -> StoreResult<()> {
        self.hop().await;
        self.inner.set_language(user, language).await
    }

    async fn increment_warnings(&self, user: UserId) -> StoreResult<u32> {
        self.hop().await;
        self.inner.increment_warnings(user).await
    }

    async fn set_banned(&self, user: UserId) -> StoreResult<()> {
        self.hop().await;
        self.inner.set_banned(user).await
    }

    async fn set_premium_expiry(&self, user: UserId, expiry: Option<DateTime<Utc>>) -> StoreResult<()> {
        self.hop().await;
        self.inner.set_premium_expiry(user, expiry).await
    }

    async fn clear_premium_if(&self, user: UserId, expected: DateTime<Utc>) -> StoreResult<bool> {
        self.hop().await;
        self.inner.clear_premium_if(user, expected).await
    }
}

#[async_trait]
impl WaitingPool for LatencyStore {
    async fn enqueue(&self, entry: WaitingEntry) -> StoreResult<Enqueued> {
        self.hop().await;
        self.inner.enqueue(entry).await
    }

    async fn match_and_remove(
        &self,
        user: UserId,
        language: &str,
        not_before: DateTime<Utc>,
    ) -> StoreResult<Option<WaitingEntry>> {
        self.hop().await;
        self.inner.match_and_remove(user, language, not_before).await
    }

    async fn match_or_enqueue(&self, entry: WaitingEntry, not_before: DateTime<Utc>) -> StoreResult<Placement> {
        self.hop().await;
        self.inner.match_or_enqueue(entry, not_before).await
    }

    async fn cancel(&self, user: UserId) -> StoreResult<bool> {
        self.hop().await;
        self.inner.cancel(user).await
    }

    async fn get(&self, user: UserId) -> StoreResult<Option<WaitingEntry>> {
        self.hop().await;
        WaitingPool::get(&*self.inner, user).await
    }

    async fn expire(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<WaitingEntry>> {
        self.hop().await;
        self.inner.expire(cutoff).await
    }

    async fn len(&self) -> StoreResult<u64> {
        self.hop().await;
        self.inner.len().await
    }
}

#[async_trait]
impl SessionRegistry for LatencyStore {
    async fn create(&self, a: UserId, b: UserId, now: DateTime<Utc>) -> StoreResult<Session> {
        self.hop().await;
        self.inner.create(a, b, now).await
    }

    async fn lookup(&self, user: UserId) -> StoreResult<Option<Session>> {
        self.hop().await;
        self.inner.lookup(user).await
    }

    async fn end(&self, pair_id: PairId, reason: EndReason, now: DateTime<Utc>) -> StoreResult<Option<Session>> {
        self.hop().await;
        self.inner.end(pair_id, reason, now).await
    }

    async fn touch(&self, pair_id: PairId, now: DateTime<Utc>) -> StoreResult<()> {
        self.hop().await;
        SessionRegistry::touch(&*self.inner, pair_id, now).await
    }

    async fn set_report_intent(&self, pair_id: PairId, reporter: UserId) -> StoreResult<bool> {
        self.hop().await;
        self.inner.set_report_intent(pair_id, reporter).await
    }

    async fn take_report_intent(&self, pair_id: PairId, reporter: UserId) -> StoreResult<Option<ReportIntent>> {
        self.hop().await;
        self.inner.take_report_intent(pair_id, reporter).await
    }

    async fn stale(&self, idle_before: DateTime<Utc>) -> StoreResult<Vec<Session>> {
        self.hop().await;
        self.inner.stale(idle_before).await
    }

    async fn active_count(&self) -> StoreResult<u64> {
        self.hop().await;
        self.inner.active_count().await
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<RecordingGateway>,
    pub sink: Arc<RecordingSink>,
    pub engine: MatchmakingEngine,
    pub moderation: ModerationWorkflow,
    pub dispatcher: CommandDispatcher,
}

pub fn harness() -> Harness {
    harness_with(MatchingConfig::default())
}

pub fn harness_with(config: MatchingConfig) -> Harness {
    let store = Arc::new(MemoryStore::new("en"));
    assemble(store.clone(), store, config)
}

/// Harness whose engine reaches the store through a [`LatencyStore`].
/// `Harness::store` is the inner store, for assertions without the delay.
pub fn harness_with_latency(delay: Duration) -> Harness {
    let store = Arc::new(MemoryStore::new("en"));
    let slow = Arc::new(LatencyStore::new(store.clone(), delay));
    assemble(store, slow, MatchingConfig::default())
}

fn assemble<S>(store: Arc<MemoryStore>, backend: Arc<S>, config: MatchingConfig) -> Harness
where
    S: UserDirectory + WaitingPool + SessionRegistry + 'static,
{
    let gateway = Arc::new(RecordingGateway::default());
    let sink = Arc::new(RecordingSink::default());
    let recording: Arc<dyn EventSink> = sink.clone();
    let events = EventPublisher::new(vec![recording]);

    let engine = MatchmakingEngine::new(backend, gateway.clone(), events, config, Duration::from_secs(10));
    let moderation = ModerationWorkflow::new(engine.clone());
    let localizer = Localizer::from_json(include_str!("../lang.json"), "en").expect("bundled translations");
    let dispatcher = CommandDispatcher::new(engine.clone(), moderation.clone(), Arc::new(localizer));

    Harness { store, gateway, sink, engine, moderation, dispatcher }
}

/// App state over a fresh harness with default configuration and no Redis.
pub fn app_state() -> Arc<AppState> {
    let config: AppConfig = ::config::Config::builder()
        .build()
        .unwrap()
        .try_deserialize()
        .unwrap();
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .build_recorder()
        .handle();

    Arc::new(AppState {
        config,
        dispatcher: harness().dispatcher,
        redis: None,
        metrics_handle,
    })
}

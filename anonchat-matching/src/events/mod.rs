//! Domain events raised by the matchmaker and fanned out to sinks.
//!
//! Sinks run after the state change they describe is committed. A failing
//! sink is logged and skipped; it never affects matchmaking state.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{EndReason, ReportIntent, Session, UserId};

pub mod archive;
pub mod publisher;

pub use self::archive::PgArchive;
pub use self::publisher::RabbitSink;

#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    SessionStarted(Session),
    SessionEnded {
        session: Session,
        reason: EndReason,
        ended_by: Option<UserId>,
        ended_at: DateTime<Utc>,
    },
    SearchTimedOut {
        user_id: UserId,
        waited_secs: i64,
    },
    ReportFiled {
        intent: ReportIntent,
        reason: String,
    },
    UserWarned {
        user_id: UserId,
        warnings: u32,
    },
    UserBanned {
        user_id: UserId,
        warnings: u32,
    },
}

impl DomainEvent {
    pub fn session_ended(session: Session, reason: EndReason, ended_by: Option<UserId>, ended_at: DateTime<Utc>) -> Self {
        DomainEvent::SessionEnded { session, reason, ended_by, ended_at }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DomainEvent::SessionStarted(_) => "session_started",
            DomainEvent::SessionEnded { .. } => "session_ended",
            DomainEvent::SearchTimedOut { .. } => "search_timed_out",
            DomainEvent::ReportFiled { .. } => "report_filed",
            DomainEvent::UserWarned { .. } => "user_warned",
            DomainEvent::UserBanned { .. } => "user_banned",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error(transparent)]
    Publish(#[from] anonchat_shared::clients::rabbitmq::PublishError),

    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &DomainEvent) -> Result<(), SinkError>;
}

/// Fan-out over every configured sink, in order.
#[derive(Clone, Default)]
pub struct EventPublisher {
    sinks: Arc<Vec<Arc<dyn EventSink>>>,
}

impl EventPublisher {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks: Arc::new(sinks) }
    }

    pub async fn publish(&self, event: DomainEvent) {
        for sink in self.sinks.iter() {
            if let Err(e) = sink.handle(&event).await {
                tracing::error!(sink = sink.name(), event = event.kind(), error = %e, "event sink failed");
            }
        }
    }

    pub async fn publish_all(&self, events: Vec<DomainEvent>) {
        for event in events {
            self.publish(event).await;
        }
    }
}

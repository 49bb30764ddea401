use async_trait::async_trait;
use serde::Serialize;

use anonchat_shared::clients::rabbitmq::RabbitMQClient;
use anonchat_shared::types::event::{payloads, routing_keys, Event};

use super::{DomainEvent, EventSink, SinkError};

const SOURCE: &str = "anonchat-matching";

/// Publishes domain events to the `anonchat.events` topic exchange.
pub struct RabbitSink {
    rabbitmq: RabbitMQClient,
}

impl RabbitSink {
    pub fn new(rabbitmq: RabbitMQClient) -> Self {
        Self { rabbitmq }
    }

    async fn send<T: Serialize + Send + Sync>(&self, event: Event<T>) -> Result<(), SinkError> {
        self.rabbitmq.publish(&event).await?;
        Ok(())
    }
}

#[async_trait]
impl EventSink for RabbitSink {
    fn name(&self) -> &'static str {
        "rabbitmq"
    }

    async fn handle(&self, event: &DomainEvent) -> Result<(), SinkError> {
        match event {
            DomainEvent::SessionStarted(session) => {
                self.send(
                    Event::new(
                        SOURCE,
                        routing_keys::MATCHING_SESSION_STARTED,
                        payloads::SessionStarted {
                            pair_id: session.pair_id,
                            member_a: session.member_a,
                            member_b: session.member_b,
                        },
                    )
                    .with_user(session.member_a),
                )
                .await
            }
            DomainEvent::SessionEnded { session, reason, ended_by, ended_at } => {
                let mut event = Event::new(
                    SOURCE,
                    routing_keys::MATCHING_SESSION_ENDED,
                    payloads::SessionEnded {
                        pair_id: session.pair_id,
                        member_a: session.member_a,
                        member_b: session.member_b,
                        started_at: session.created_at,
                        ended_at: *ended_at,
                        duration_secs: (*ended_at - session.created_at).num_seconds().max(0),
                        end_reason: reason.as_str().to_string(),
                        ended_by: *ended_by,
                    },
                );
                if let Some(user) = ended_by {
                    event = event.with_user(*user);
                }
                self.send(event).await
            }
            DomainEvent::SearchTimedOut { user_id, waited_secs } => {
                self.send(
                    Event::new(
                        SOURCE,
                        routing_keys::MATCHING_SEARCH_TIMED_OUT,
                        payloads::SearchTimedOut {
                            user_id: *user_id,
                            waited_secs: *waited_secs,
                        },
                    )
                    .with_user(*user_id),
                )
                .await
            }
            DomainEvent::ReportFiled { intent, reason } => {
                self.send(
                    Event::new(
                        SOURCE,
                        routing_keys::MODERATION_REPORT_FILED,
                        payloads::ReportFiled {
                            pair_id: intent.pair_id,
                            reporter_id: intent.reporter,
                            reported_id: intent.target,
                            reason: reason.clone(),
                        },
                    )
                    .with_user(intent.reporter),
                )
                .await
            }
            DomainEvent::UserWarned { user_id, warnings } => {
                self.send(
                    Event::new(
                        SOURCE,
                        routing_keys::MODERATION_USER_WARNED,
                        payloads::UserWarned {
                            user_id: *user_id,
                            warnings: *warnings,
                        },
                    )
                    .with_user(*user_id),
                )
                .await
            }
            DomainEvent::UserBanned { user_id, warnings } => {
                self.send(
                    Event::new(
                        SOURCE,
                        routing_keys::MODERATION_USER_BANNED,
                        payloads::UserBanned {
                            user_id: *user_id,
                            warnings: *warnings,
                        },
                    )
                    .with_user(*user_id),
                )
                .await
            }
        }
    }
}

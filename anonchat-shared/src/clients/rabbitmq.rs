use lapin::{
    options::*, types::FieldTable, BasicProperties, Channel, Connection, ConnectionProperties,
};
use serde::Serialize;

use crate::types::Event;

pub const EXCHANGE_NAME: &str = "anonchat.events";

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("event serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("broker did not confirm event {0}")]
    Nacked(uuid::Uuid),
}

#[derive(Clone)]
pub struct RabbitMQClient {
    channel: Channel,
}

impl RabbitMQClient {
    pub async fn connect(url: &str) -> Result<Self, lapin::Error> {
        let conn = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = conn.create_channel().await?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        channel
            .exchange_declare(
                EXCHANGE_NAME,
                lapin::ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        tracing::info!(exchange = EXCHANGE_NAME, "connected to RabbitMQ");
        Ok(Self { channel })
    }

    /// Publish an event, routed by its `event_type`, and wait for the broker confirm.
    pub async fn publish<T: Serialize>(&self, event: &Event<T>) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(event)?;

        let confirm = self
            .channel
            .basic_publish(
                EXCHANGE_NAME,
                &event.event_type,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(2), // persistent
            )
            .await?
            .await?;

        if confirm.is_nack() {
            return Err(PublishError::Nacked(event.id));
        }

        tracing::debug!(
            routing_key = %event.event_type,
            event_id = %event.id,
            "event published"
        );

        Ok(())
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Producer
//!
//! This module provides the typed producer. A `Producer<T>` serializes its
//! messages as JSON and publishes them to the exchange configured for `T`,
//! propagating the OpenTelemetry context in the message headers.

use crate::{
    connection::{ConnectionBuilder, ConnectionHandle},
    errors::AmqpError,
    message::OutboundMessage,
    otel,
    queue::QueueBinding,
};
use async_trait::async_trait;
use lapin::types::ShortString;
use opentelemetry::Context;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Type-erased view of a producer used by the lifecycle service.
#[async_trait]
pub trait ManagedProducer: Send + Sync {
    fn message_type(&self) -> &'static str;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Publishes messages of type `T`.
pub struct Producer<T> {
    connection: Arc<ConnectionBuilder<T>>,
}

impl<T> Producer<T>
where
    T: Serialize + Send + Sync,
{
    pub fn new(connection: Arc<ConnectionBuilder<T>>) -> Arc<Producer<T>> {
        Arc::new(Producer { connection })
    }

    /// Publishes `message` once per resolved routing key.
    ///
    /// Routing keys resolve to the message's own keys, else the configured
    /// keys, else the queue name. For exchanges that route on exact keys the
    /// queue is re-bound to each key before publishing; the broker treats the
    /// repeated binding as a no-op. Serialization and publish errors are
    /// returned to the caller.
    pub async fn send(&self, message: OutboundMessage<T>) -> Result<(), AmqpError> {
        let handle = self.connection.initialize_connection().await?;

        let correlation_id = if message.correlation_id.trim().is_empty() {
            Uuid::new_v4().to_string()
        } else {
            message.correlation_id.clone()
        };

        let body = serde_json::to_vec(&message.content).map_err(|err| {
            error!(
                error = err.to_string(),
                correlation_id,
                "failure to serialize message"
            );
            AmqpError::SerializePayloadError(err.to_string())
        })?;

        let mut properties = handle
            .basic_properties()
            .clone()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_correlation_id(ShortString::from(correlation_id.clone()))
            .with_priority(message.priority)
            .with_headers(otel::inject_headers(&Context::current()));
        if let Some(reply_to) = &message.reply_to {
            properties = properties.with_reply_to(ShortString::from(reply_to.clone()));
        }

        for routing_key in resolve_routing_keys(&message, &handle) {
            if handle.exchange_kind().requires_queue_binding() {
                handle
                    .channel()
                    .queue_bind(
                        &QueueBinding::new(handle.queue_name())
                            .exchange(handle.exchange_name())
                            .routing_key(&routing_key),
                    )
                    .await?;
            }

            handle
                .channel()
                .basic_publish(
                    handle.exchange_name(),
                    &routing_key,
                    &body,
                    properties.clone(),
                )
                .await?;

            debug!(
                exchange = handle.exchange_name(),
                routing_key,
                correlation_id,
                "sent message"
            );
        }

        info!(
            message = self.connection.message_type(),
            correlation_id,
            "sent a message"
        );

        Ok(())
    }

    pub async fn close(&self) -> Result<(), AmqpError> {
        self.connection.close_connection().await
    }
}

fn resolve_routing_keys<T>(message: &OutboundMessage<T>, handle: &ConnectionHandle) -> Vec<String> {
    let keys: Vec<String> = if !message.route_keys.is_empty() {
        message.route_keys.clone()
    } else if !handle.routing_keys().is_empty() {
        handle.routing_keys().to_vec()
    } else {
        vec![handle.queue_name().to_owned()]
    };

    keys.into_iter().map(|key| key.trim().to_owned()).collect()
}

#[async_trait]
impl<T> ManagedProducer for Producer<T>
where
    T: Serialize + Send + Sync,
{
    fn message_type(&self) -> &'static str {
        self.connection.message_type()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        Producer::close(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{QueueConfiguration, ServiceConfiguration},
        testing::{BrokerCall, RecordingBroker},
    };
    use serde::{ser::Error as _, Serializer};

    #[derive(Serialize)]
    struct Order {
        id: u32,
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("not serializable"))
        }
    }

    fn producer<T: Serialize + Send + Sync>(
        broker: &RecordingBroker,
        cfg: QueueConfiguration,
    ) -> Arc<Producer<T>> {
        Producer::new(Arc::new(ConnectionBuilder::new(
            Arc::new(ServiceConfiguration::default()),
            cfg,
            broker.connector(),
        )))
    }

    #[tokio::test]
    async fn send_initializes_lazily_and_publishes_json() {
        let broker = RecordingBroker::new();
        let producer = producer::<Order>(&broker, QueueConfiguration::new("orders", "orders.q1", false));

        producer.send(OutboundMessage::new(Order { id: 7 })).await.unwrap();
        producer.send(OutboundMessage::new(Order { id: 8 })).await.unwrap();

        assert_eq!(broker.count(&BrokerCall::Connect), 1);
        let published = broker.published();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].body, br#"{"id":7}"#.to_vec());
        assert_eq!(published[0].exchange, "orders");
        assert_eq!(published[0].routing_key, "orders.q1");
    }

    #[tokio::test]
    async fn send_falls_back_to_configured_routing_keys() {
        let broker = RecordingBroker::new();
        let mut cfg = QueueConfiguration::new("orders", "orders.q1", false);
        cfg.routing_keys_csv = Some("created, shipped".to_owned());
        let producer = producer::<Order>(&broker, cfg);

        producer.send(OutboundMessage::new(Order { id: 1 })).await.unwrap();

        let keys: Vec<_> = broker.published().into_iter().map(|p| p.routing_key).collect();
        assert_eq!(keys, vec!["created", "shipped"]);
    }

    #[tokio::test]
    async fn explicit_route_keys_take_precedence_and_rebind_direct_queue() {
        let broker = RecordingBroker::new();
        let mut cfg = QueueConfiguration::new("orders", "orders.q1", false);
        cfg.routing_keys_csv = Some("created".to_owned());
        let producer = producer::<Order>(&broker, cfg);

        producer
            .send(OutboundMessage::new(Order { id: 1 }).route_keys([" urgent "]))
            .await
            .unwrap();

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].routing_key, "urgent");
        assert_eq!(
            broker.count(&BrokerCall::QueueBind(
                "orders.q1".into(),
                "orders".into(),
                "urgent".into()
            )),
            1
        );
    }

    #[tokio::test]
    async fn fanout_and_topic_exchanges_are_not_rebound() {
        for kind in ["fanout", "topic"] {
            let broker = RecordingBroker::new();
            let mut cfg = QueueConfiguration::new("events", "events.q", false);
            cfg.exchange_type = kind.to_owned();
            let producer = producer::<Order>(&broker, cfg);

            producer.send(OutboundMessage::new(Order { id: 1 })).await.unwrap();

            // only the binding made while installing the topology
            assert_eq!(
                broker.count_matching(|c| matches!(c, BrokerCall::QueueBind(..))),
                1
            );
        }
    }

    #[tokio::test]
    async fn send_sets_priority_and_generated_correlation_id() {
        let broker = RecordingBroker::new();
        let producer = producer::<Order>(&broker, QueueConfiguration::new("orders", "orders.q1", false));

        producer
            .send(OutboundMessage::new(Order { id: 1 }).priority(12))
            .await
            .unwrap();

        let properties = &broker.published()[0].properties;
        assert_eq!(*properties.priority(), Some(12));
        let correlation_id = properties.correlation_id().clone().unwrap();
        assert!(Uuid::parse_str(correlation_id.as_str()).is_ok());
        assert_eq!(
            properties.expiration().as_ref().map(|e| e.as_str()),
            Some("3600000")
        );
        assert!(properties.reply_to().is_none());
    }

    #[tokio::test]
    async fn blank_correlation_id_is_replaced_on_send() {
        let broker = RecordingBroker::new();
        let producer = producer::<Order>(&broker, QueueConfiguration::new("orders", "orders.q1", false));

        let mut message = OutboundMessage::new(Order { id: 1 });
        message.correlation_id = String::new();
        producer.send(message).await.unwrap();

        let mut message = OutboundMessage::new(Order { id: 2 });
        message.correlation_id = "  ".to_owned();
        producer.send(message).await.unwrap();

        assert_eq!(broker.published().len(), 2);
        for published in broker.published() {
            let correlation_id = published.properties.correlation_id().clone().unwrap();
            assert!(Uuid::parse_str(correlation_id.as_str()).is_ok());
        }
    }

    #[tokio::test]
    async fn send_carries_reply_to_and_caller_correlation_id() {
        let broker = RecordingBroker::new();
        let producer = producer::<Order>(&broker, QueueConfiguration::new("orders", "orders.q1", false));

        producer
            .send(
                OutboundMessage::new(Order { id: 1 })
                    .reply_to("replies")
                    .correlation_id("abc-123"),
            )
            .await
            .unwrap();

        let properties = &broker.published()[0].properties;
        assert_eq!(
            properties.correlation_id().as_ref().map(|c| c.as_str()),
            Some("abc-123")
        );
        assert_eq!(
            properties.reply_to().as_ref().map(|r| r.as_str()),
            Some("replies")
        );
    }

    #[tokio::test]
    async fn publish_errors_propagate() {
        let broker = RecordingBroker::new();
        broker.fail_publishes();
        let producer = producer::<Order>(&broker, QueueConfiguration::new("orders", "orders.q1", false));

        assert_eq!(
            producer.send(OutboundMessage::new(Order { id: 1 })).await,
            Err(AmqpError::PublishingError("orders".into()))
        );
    }

    #[tokio::test]
    async fn serialization_errors_propagate_without_publishing() {
        let broker = RecordingBroker::new();
        let producer =
            producer::<Unserializable>(&broker, QueueConfiguration::new("orders", "orders.q1", false));

        let result = producer.send(OutboundMessage::new(Unserializable)).await;

        assert!(matches!(result, Err(AmqpError::SerializePayloadError(_))));
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let broker = RecordingBroker::new();
        let producer = producer::<Order>(&broker, QueueConfiguration::new("orders", "orders.q1", false));

        producer.close().await.unwrap();
        producer.send(OutboundMessage::new(Order { id: 1 })).await.unwrap();
        producer.close().await.unwrap();
        producer.close().await.unwrap();

        assert_eq!(broker.count(&BrokerCall::Close), 1);
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation and management of AMQP connections and channels.
//! The `BrokerConnector` and `BrokerChannel` traits are the only surface the rest of
//! the crate drives the broker through; `AmqpConnector` and `AmqpChannel` implement
//! them on top of `lapin`.

use crate::{
    config::ServiceConfiguration,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, QueueBindOptions,
    },
    types::{FieldTable, LongString},
    uri::{AMQPAuthority, AMQPUri, AMQPUserInfo},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{future::Future, sync::Arc};
use tracing::{debug, error};

/// A message pushed by the broker to a consumer subscription.
#[derive(Debug, Clone, Default)]
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

/// Stream of deliveries produced by `basic_consume`.
pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery, AmqpError>>;

/// Opens one connection and one channel on it.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(
        &self,
        cfg: &ServiceConfiguration,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError>;
}

/// The broker operations a typed channel needs.
///
/// Acknowledgement and rejection always target a single delivery tag: the
/// `multiple` flag is never set and rejected messages are never requeued.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares the queue and returns its name, generated by the broker when
    /// the definition's name is empty.
    async fn queue_declare(&self, def: &QueueDefinition) -> Result<String, AmqpError>;

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    /// Subscribes with manual acknowledgement.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn basic_reject(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    /// Closes the channel, then the connection, skipping whichever is already closed.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// `lapin` backed connector.
#[derive(Debug, Clone, Default)]
pub struct AmqpConnector;

impl AmqpConnector {
    pub fn new() -> Arc<AmqpConnector> {
        Arc::new(AmqpConnector)
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    /// Creates a new AMQP channel for communication with RabbitMQ.
    ///
    /// This establishes a connection using the host, port, vhost and credentials
    /// in `cfg`, then creates a channel on that connection. The pair is owned by
    /// the returned `AmqpChannel`.
    async fn connect(
        &self,
        cfg: &ServiceConfiguration,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!(host = cfg.host_name, vhost = cfg.virtual_host, "creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(cfg.connection_name.clone()));

        let uri = AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: cfg.username.clone(),
                    password: cfg.password.clone(),
                },
                host: cfg.host_name.clone(),
                port: cfg.port,
            },
            vhost: cfg.virtual_host.clone(),
            ..Default::default()
        };

        let connection = match Connection::connect_uri(uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError)
            }
        }?;
        debug!("amqp connected");

        debug!("creating amqp channel...");
        match connection.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(AmqpChannel {
                    connection,
                    channel,
                }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }
}

/// One `lapin` connection and the single channel opened on it.
pub struct AmqpChannel {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self
            .channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                def.options(),
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .channel
            .queue_declare(&def.name, def.options(), def.arguments())
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the queue"
                );
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            Ok(queue) => {
                debug!("queue: {} was created", queue.name());
                Ok(queue.name().to_string())
            }
        }
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match self
            .channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to configure qos");
                Err(AmqpError::QoSDeclarationError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(exchange.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(InboundDelivery {
                    delivery_tag: delivery.delivery_tag,
                    properties: delivery.properties,
                    data: delivery.data,
                }),
                Err(err) => Err(AmqpError::DeliveryError(err.to_string())),
            })
            .boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), delivery_tag, "error while acking message");
                Err(AmqpError::AckMessageError(delivery_tag))
            }
            _ => Ok(()),
        }
    }

    async fn basic_reject(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), delivery_tag, "error while rejecting message");
                Err(AmqpError::RejectMessageError(delivery_tag))
            }
            _ => Ok(()),
        }
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), consumer_tag, "error to cancel the consumer");
                Err(AmqpError::CancelConsumerError(consumer_tag.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let channel = async {
            if !self.channel.status().connected() {
                return Ok(());
            }
            self.channel.close(200, "OK").await.map_err(|err| {
                error!(error = err.to_string(), "error to close the channel");
                AmqpError::CloseConnectionError(err.to_string())
            })
        };

        let connection = async {
            if !self.connection.status().connected() {
                return Ok(());
            }
            self.connection.close(200, "OK").await.map_err(|err| {
                error!(error = err.to_string(), "error to close the connection");
                AmqpError::CloseConnectionError(err.to_string())
            })
        };

        close_in_order(channel, connection).await?;

        debug!("amqp connection closed");
        Ok(())
    }
}

/// Closes the channel, then the connection even when the channel close failed.
/// Returns the first failure.
async fn close_in_order<C, K>(channel: C, connection: K) -> Result<(), AmqpError>
where
    C: Future<Output = Result<(), AmqpError>>,
    K: Future<Output = Result<(), AmqpError>>,
{
    let channel_closed = channel.await;
    let connection_closed = connection.await;
    channel_closed.and(connection_closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn connection_is_closed_even_when_channel_close_fails() {
        let connection_closed = AtomicBool::new(false);

        let result = close_in_order(
            async { Err(AmqpError::CloseConnectionError("channel".into())) },
            async {
                connection_closed.store(true, Ordering::SeqCst);
                Ok(())
            },
        )
        .await;

        assert_eq!(result, Err(AmqpError::CloseConnectionError("channel".into())));
        assert!(connection_closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn connection_failure_is_reported_after_clean_channel_close() {
        let result = close_in_order(async { Ok(()) }, async {
            Err(AmqpError::CloseConnectionError("connection".into()))
        })
        .await;

        assert_eq!(
            result,
            Err(AmqpError::CloseConnectionError("connection".into()))
        );
    }
}

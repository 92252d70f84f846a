// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module provides the typed consumer. A `Consumer<T>` subscribes to the
//! queue configured for `T` with manual acknowledgement and turns every delivery
//! into an acknowledge or reject decision:
//!
//! 1. The body is deserialized into `T`
//! 2. The subscribed `MessageHandler<T>` is invoked with the typed message
//! 3. Success is acknowledged (in `AcknowledgeMode::Auto`)
//! 4. Parse failures, handler failures and missing handlers are rejected
//!    without requeue, which dead-letters the message when a DLQ is configured
//!
//! Deliveries of one consumer are processed one at a time, in arrival order.

use crate::{
    channel::{BrokerChannel, DeliveryStream, InboundDelivery},
    connection::ConnectionBuilder,
    errors::AmqpError,
    handler::{AcknowledgeMode, MessageHandler},
    message::InboundMessage,
    otel,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use serde::de::DeserializeOwned;
use std::{borrow::Cow, sync::Arc};
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Type-erased view of a consumer used by the lifecycle service.
#[async_trait]
pub trait ManagedConsumer: Send + Sync {
    fn message_type(&self) -> &'static str;

    async fn start_consumption(&self) -> Result<(), AmqpError>;

    async fn stop_consumption(&self) -> Result<(), AmqpError>;
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acknowledged,
    Rejected,
    /// Handled successfully; acknowledgement is up to the handler.
    Handled,
}

type SharedHandler<T> = Arc<RwLock<Option<Arc<dyn MessageHandler<T>>>>>;

enum ConsumptionState {
    NotStarted,
    Listening {
        consumer_tag: String,
        task: JoinHandle<()>,
    },
    Stopped,
}

/// Consumes messages of type `T`.
pub struct Consumer<T> {
    connection: Arc<ConnectionBuilder<T>>,
    handler: SharedHandler<T>,
    mode: AcknowledgeMode,
    processing: Arc<Mutex<()>>,
    state: Mutex<ConsumptionState>,
}

impl<T> Consumer<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(connection: Arc<ConnectionBuilder<T>>) -> Arc<Consumer<T>> {
        Self::with_acknowledge_mode(connection, AcknowledgeMode::Auto)
    }

    pub fn with_acknowledge_mode(
        connection: Arc<ConnectionBuilder<T>>,
        mode: AcknowledgeMode,
    ) -> Arc<Consumer<T>> {
        Arc::new(Consumer {
            connection,
            handler: Arc::new(RwLock::new(None)),
            mode,
            processing: Arc::new(Mutex::new(())),
            state: Mutex::new(ConsumptionState::NotStarted),
        })
    }

    pub fn acknowledge_mode(&self) -> AcknowledgeMode {
        self.mode
    }

    /// Sets the message-received handler, replacing any previous one.
    pub async fn subscribe(&self, handler: Arc<dyn MessageHandler<T>>) {
        *self.handler.write().await = Some(handler);
    }

    /// Removes the handler. Deliveries arriving without one are rejected.
    pub async fn unsubscribe(&self) {
        self.handler.write().await.take();
    }

    /// Initializes the connection if needed and subscribes to the queue.
    ///
    /// Calling it while already listening is a no-op. Fails with `NoSubscriber`
    /// when no handler is subscribed.
    pub async fn start_consumption(&self) -> Result<(), AmqpError> {
        let mut state = self.state.lock().await;

        match &*state {
            ConsumptionState::Listening { .. } => {
                warn!(message = self.message_type(), "consumer already listening");
                return Ok(());
            }
            ConsumptionState::Stopped => {
                return Err(AmqpError::ConnectionClosed(self.message_type().to_owned()))
            }
            ConsumptionState::NotStarted => {}
        }

        if self.handler.read().await.is_none() {
            return Err(AmqpError::NoSubscriber(self.message_type().to_owned()));
        }

        let handle = self.connection.initialize_connection().await?;
        let consumer_tag = format!("{}-{}", self.message_type(), Uuid::new_v4());
        let deliveries = handle
            .channel()
            .basic_consume(handle.queue_name(), &consumer_tag)
            .await?;

        let task = tokio::spawn(dispatch(
            deliveries,
            handle.channel().clone(),
            self.handler.clone(),
            self.processing.clone(),
            self.mode,
            self.message_type(),
        ));

        info!(
            consumer = self.message_type(),
            queue = handle.queue_name(),
            "started listening"
        );

        *state = ConsumptionState::Listening { consumer_tag, task };
        Ok(())
    }

    /// Cancels the subscription, waits for the in-flight delivery, and closes
    /// the connection. Safe to call before `start_consumption` and repeatedly.
    pub async fn stop_consumption(&self) -> Result<(), AmqpError> {
        let mut state = self.state.lock().await;
        let mut result = Ok(());

        match std::mem::replace(&mut *state, ConsumptionState::Stopped) {
            ConsumptionState::Listening { consumer_tag, task } => {
                if let Some(handle) = self.connection.current().await {
                    result = handle.channel().basic_cancel(&consumer_tag).await;
                }

                let _in_flight = self.processing.lock().await;
                task.abort();

                info!(consumer = self.message_type(), "stopped listening");
            }
            ConsumptionState::NotStarted => *state = ConsumptionState::NotStarted,
            ConsumptionState::Stopped => {}
        }

        let closed = self.connection.close_connection().await;
        result.and(closed)
    }

    /// Positive acknowledgement of exactly this delivery.
    pub async fn acknowledge(&self, message: &InboundMessage<T>) -> Result<(), AmqpError> {
        let handle = self
            .connection
            .current()
            .await
            .ok_or_else(|| AmqpError::NotConnected(self.message_type().to_owned()))?;

        handle.channel().basic_ack(message.delivery_tag).await
    }

    /// Negative acknowledgement of exactly this delivery, without requeue.
    pub async fn reject(&self, message: &InboundMessage<T>) -> Result<(), AmqpError> {
        let handle = self
            .connection
            .current()
            .await
            .ok_or_else(|| AmqpError::NotConnected(self.message_type().to_owned()))?;

        handle.channel().basic_reject(message.delivery_tag).await
    }

    pub fn message_type(&self) -> &'static str {
        self.connection.message_type()
    }
}

#[async_trait]
impl<T> ManagedConsumer for Consumer<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    fn message_type(&self) -> &'static str {
        self.connection.message_type()
    }

    async fn start_consumption(&self) -> Result<(), AmqpError> {
        Consumer::start_consumption(self).await
    }

    async fn stop_consumption(&self) -> Result<(), AmqpError> {
        Consumer::stop_consumption(self).await
    }
}

async fn dispatch<T>(
    mut deliveries: DeliveryStream,
    channel: Arc<dyn BrokerChannel>,
    handler: SharedHandler<T>,
    processing: Arc<Mutex<()>>,
    mode: AcknowledgeMode,
    message_type: &'static str,
) where
    T: DeserializeOwned + Send + Sync + 'static,
{
    let tracer = global::tracer("amqp consumer");

    while let Some(result) = deliveries.next().await {
        match result {
            Ok(delivery) => {
                let _processing = processing.lock().await;
                let current = handler.read().await.clone();

                if let Err(err) = consume(
                    &tracer,
                    &delivery,
                    channel.as_ref(),
                    current,
                    mode,
                    message_type,
                )
                .await
                {
                    error!(error = err.to_string(), "failure to settle delivery");
                }
            }
            Err(err) => error!(error = err.to_string(), "failure to receive delivery"),
        }
    }

    debug!(consumer = message_type, "delivery stream ended");
}

/// Processes one delivery and settles it on `channel`.
///
/// The returned error only reports a failed ack or reject; parse and handler
/// failures are settled by rejecting and yield `Ok(Settlement::Rejected)`.
pub(crate) async fn consume<T>(
    tracer: &BoxedTracer,
    delivery: &InboundDelivery,
    channel: &dyn BrokerChannel,
    handler: Option<Arc<dyn MessageHandler<T>>>,
    mode: AcknowledgeMode,
    message_type: &str,
) -> Result<Settlement, AmqpError>
where
    T: DeserializeOwned + Send + Sync,
{
    let (ctx, mut span) = otel::new_span(&delivery.properties, tracer, message_type);

    let correlation_id = delivery
        .properties
        .correlation_id()
        .as_ref()
        .map(|id| id.to_string());
    let reply_to = delivery
        .properties
        .reply_to()
        .as_ref()
        .map(|reply| reply.to_string());
    let delivery_tag = delivery.delivery_tag;

    let content = match serde_json::from_slice::<T>(&delivery.data) {
        Ok(content) => content,
        Err(err) => {
            let err = AmqpError::ParsePayloadError(err.to_string());
            error!(
                error = err.to_string(),
                correlation_id,
                delivery_tag,
                "failed processing message, so rejecting"
            );
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("failure to parse payload"),
            });
            channel.basic_reject(delivery_tag).await?;
            return Ok(Settlement::Rejected);
        }
    };

    let message = InboundMessage::new(content, reply_to, correlation_id, delivery_tag);
    info!(
        message = message_type,
        correlation_id = message.correlation_id,
        "received a message"
    );

    let Some(handler) = handler else {
        warn!(
            message = message_type,
            delivery_tag, "no handler subscribed, so rejecting"
        );
        span.set_status(Status::Error {
            description: Cow::from("no handler subscribed"),
        });
        channel.basic_reject(delivery_tag).await?;
        return Ok(Settlement::Rejected);
    };

    if let Err(err) = handler.on_message(&ctx, &message).await {
        let err = AmqpError::HandlerError(err.to_string());
        error!(
            error = err.to_string(),
            correlation_id = message.correlation_id,
            delivery_tag,
            "failed processing message, so rejecting"
        );
        span.record_error(&err);
        span.set_status(Status::Error {
            description: Cow::from("handler failure"),
        });
        channel.basic_reject(delivery_tag).await?;
        return Ok(Settlement::Rejected);
    }

    span.set_status(Status::Ok);

    match mode {
        AcknowledgeMode::Auto => {
            channel.basic_ack(delivery_tag).await?;
            debug!(delivery_tag, "message successfully processed");
            Ok(Settlement::Acknowledged)
        }
        AcknowledgeMode::Manual => Ok(Settlement::Handled),
    }
}

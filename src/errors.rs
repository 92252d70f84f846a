// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Messaging Layer
//!
//! This module provides the error type shared by every component of the crate.
//! The `AmqpError` enum covers connection and topology setup, publishing,
//! consumption, acknowledgement and composition-time registration failures.

use thiserror::Error;

/// Represents errors that can occur while driving the broker on behalf of a
/// typed producer or consumer.
///
/// Topology and connection variants are fatal for the message type that raised
/// them. Payload and handler variants are reported per delivery and never stop
/// a consumer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error publishing a message
    #[error("failure to publish to `{0}`")]
    PublishingError(String),

    /// Error serializing an outbound payload
    #[error("failure to serialize payload `{0}`")]
    SerializePayloadError(String),

    /// Error parsing an inbound payload
    #[error("failure to parse payload `{0}`")]
    ParsePayloadError(String),

    /// Error declaring a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error reported by the broker on an open consumer subscription
    #[error("failure to receive delivery `{0}`")]
    DeliveryError(String),

    /// Error cancelling a consumer subscription
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message `{0}`")]
    AckMessageError(u64),

    /// Error rejecting a message
    #[error("failure to reject message `{0}`")]
    RejectMessageError(u64),

    /// Error closing a channel or connection
    #[error("failure to close connection `{0}`")]
    CloseConnectionError(String),

    /// The registered handler failed to process a message
    #[error("failure to handle message `{0}`")]
    HandlerError(String),

    /// Invalid or unreadable configuration value
    #[error("invalid configuration `{0}`")]
    ConfigurationError(String),

    /// Operation requires a live channel but the connection is not initialized
    #[error("connection for `{0}` is not initialized")]
    NotConnected(String),

    /// Initialization was requested after the connection was closed
    #[error("connection for `{0}` was closed")]
    ConnectionClosed(String),

    /// A producer or consumer was registered twice for the same message type
    #[error("`{0}` is already registered")]
    AlreadyRegistered(String),

    /// Producer and consumer of one message type disagree on their topology
    #[error("conflicting queue configuration for `{0}`")]
    ConflictingConfiguration(String),

    /// Consumption was started without a message handler subscribed
    #[error("no handler subscribed for `{0}`")]
    NoSubscriber(String),
}

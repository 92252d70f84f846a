// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Typed message envelopes exchanged with producers and consumers.

use uuid::Uuid;

/// A message received from the broker, already deserialized.
///
/// The delivery tag identifies the delivery on the consumer's channel and is
/// what `Consumer::acknowledge` / `Consumer::reject` act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage<T> {
    pub content: T,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    pub delivery_tag: u64,
}

impl<T> InboundMessage<T> {
    pub fn new(
        content: T,
        reply_to: Option<String>,
        correlation_id: Option<String>,
        delivery_tag: u64,
    ) -> Self {
        InboundMessage {
            content,
            reply_to,
            correlation_id,
            delivery_tag,
        }
    }
}

/// A message to be published by a `Producer`.
///
/// The correlation id is generated on construction and can be overridden with
/// [`OutboundMessage::correlation_id`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage<T> {
    pub content: T,
    pub route_keys: Vec<String>,
    pub reply_to: Option<String>,
    pub correlation_id: String,
    pub priority: u8,
}

impl<T> OutboundMessage<T> {
    pub fn new(content: T) -> Self {
        OutboundMessage {
            content,
            route_keys: vec![],
            reply_to: None,
            correlation_id: Uuid::new_v4().to_string(),
            priority: 0,
        }
    }

    /// Publishes with these routing keys instead of the configured ones.
    pub fn route_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.route_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn reply_to(mut self, reply_to: &str) -> Self {
        self.reply_to = Some(reply_to.to_owned());
        self
    }

    /// Replaces the generated correlation id. Blank ids are ignored.
    pub fn correlation_id(mut self, correlation_id: &str) -> Self {
        if !correlation_id.trim().is_empty() {
            self.correlation_id = correlation_id.to_owned();
        }
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

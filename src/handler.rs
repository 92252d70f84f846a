// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Message-received notification for consumers.

use crate::message::InboundMessage;
use async_trait::async_trait;
use opentelemetry::Context;
use std::{future::Future, marker::PhantomData};
use thiserror::Error;

/// Error returned by a handler; the delivery is rejected when it occurs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<&str> for HandlerError {
    fn from(value: &str) -> Self {
        HandlerError(value.to_owned())
    }
}

impl From<String> for HandlerError {
    fn from(value: String) -> Self {
        HandlerError(value)
    }
}

/// Business logic invoked for every delivery of `T`, inline on the delivery
/// task and one message at a time.
#[async_trait]
pub trait MessageHandler<T>: Send + Sync {
    async fn on_message(&self, ctx: &Context, message: &InboundMessage<T>)
        -> Result<(), HandlerError>;
}

/// Who settles a successfully handled delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AcknowledgeMode {
    /// The consumer acknowledges once the handler returns `Ok`.
    #[default]
    Auto,
    /// The handler calls `Consumer::acknowledge` itself.
    Manual,
}

/// Adapts an async closure into a `MessageHandler`.
pub struct HandlerFn<T, F> {
    func: F,
    _message: PhantomData<fn(T)>,
}

impl<T, F> HandlerFn<T, F> {
    pub fn new(func: F) -> Self {
        HandlerFn {
            func,
            _message: PhantomData,
        }
    }
}

#[async_trait]
impl<T, F, Fut> MessageHandler<T> for HandlerFn<T, F>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(InboundMessage<T>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn on_message(
        &self,
        _ctx: &Context,
        message: &InboundMessage<T>,
    ) -> Result<(), HandlerError> {
        (self.func)(message.clone()).await
    }
}

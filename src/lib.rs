// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod channel;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod service;
pub mod topology;

#[cfg(test)]
mod testing;

pub use config::{DlxQueueConfiguration, QueueConfiguration, ServiceConfiguration};
pub use consumer::Consumer;
pub use errors::AmqpError;
pub use handler::{AcknowledgeMode, HandlerError, HandlerFn, MessageHandler};
pub use message::{InboundMessage, OutboundMessage};
pub use publisher::Producer;
pub use registry::{Configurator, MessagingRegistry};
pub use service::MessageService;

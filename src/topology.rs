// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module derives the broker objects a message type needs from its
//! `QueueConfiguration` and installs them over a `BrokerChannel`.
//!
//! Installation order matters: the dead-letter exchange and queue are declared
//! before the main queue so that the main queue's `x-dead-letter-*` arguments
//! refer to objects that already exist.

use crate::{
    channel::BrokerChannel,
    config::QueueConfiguration,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
};
use tracing::debug;

/// Dead-letter exchange, queue and the key binding them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterTopology {
    pub(crate) exchange: ExchangeDefinition,
    pub(crate) queue: QueueDefinition,
    pub(crate) routing_key: String,
}

/// Everything declared for one message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpTopology {
    pub(crate) exchange: ExchangeDefinition,
    pub(crate) dead_letter: Option<DeadLetterTopology>,
    pub(crate) queue: QueueDefinition,
    pub(crate) routing_keys: Vec<String>,
}

impl AmqpTopology {
    /// Derives the topology from a queue configuration.
    ///
    /// Fails when the configured exchange type is unknown.
    pub fn from_configuration(cfg: &QueueConfiguration) -> Result<AmqpTopology, AmqpError> {
        let mut exchange = ExchangeDefinition::new(&cfg.exchange_name).kind(cfg.exchange_kind()?);
        if cfg.is_durable {
            exchange = exchange.durable();
        }

        let mut queue = QueueDefinition::new(&cfg.queue_name)
            .max_length(cfg.max_queue_length)
            .max_priority(i32::from(cfg.max_priority));
        if cfg.is_durable {
            queue = queue.durable();
        }
        if cfg.is_exclusive {
            queue = queue.exclusive();
        }
        if cfg.auto_delete {
            queue = queue.delete();
        }

        let dead_letter = if cfg.add_dead_letter_queue {
            let dlx = cfg.resolved_dead_letter();
            let exchange_name = dlx.exchange_name();
            let queue_name = dlx.queue_name();
            let routing_key = dlx.routing_key.clone().unwrap_or_default();

            queue = queue.dead_letter_exchange(&exchange_name);
            if let Some(key) = &dlx.routing_key {
                queue = queue.dead_letter_routing_key(key);
            }

            let mut dlx_exchange = ExchangeDefinition::new(&exchange_name).kind(dlx.exchange_kind());
            let mut dlx_queue = QueueDefinition::new(&queue_name).max_length(dlx.max_queue_length);
            if cfg.is_durable {
                dlx_exchange = dlx_exchange.durable();
                dlx_queue = dlx_queue.durable();
            }

            Some(DeadLetterTopology {
                exchange: dlx_exchange,
                queue: dlx_queue,
                routing_key,
            })
        } else {
            None
        };

        Ok(AmqpTopology {
            exchange,
            dead_letter,
            queue,
            routing_keys: cfg.routing_keys(),
        })
    }

    pub fn exchange_name(&self) -> &str {
        self.exchange.name()
    }

    pub fn exchange_kind(&self) -> ExchangeKind {
        self.exchange.exchange_kind()
    }

    /// Routing keys parsed from the configuration; may be empty.
    pub fn routing_keys(&self) -> &[String] {
        &self.routing_keys
    }

    /// Bindings of the main queue. With no configured routing keys the queue
    /// is bound once with the empty key, which fanout exchanges need.
    pub fn bindings(&self, queue_name: &str) -> Vec<QueueBinding> {
        if self.routing_keys.is_empty() {
            return vec![QueueBinding::new(queue_name).exchange(self.exchange.name())];
        }

        self.routing_keys
            .iter()
            .map(|key| {
                QueueBinding::new(queue_name)
                    .exchange(self.exchange.name())
                    .routing_key(key)
            })
            .collect()
    }

    /// Installs the topology to the RabbitMQ server.
    ///
    /// This method performs the following operations in order:
    /// 1. Creates the main exchange
    /// 2. Creates the dead-letter exchange and queue, and binds them
    /// 3. Creates the main queue
    /// 4. Binds the main queue to the exchange once per routing key
    ///
    /// Returns the name of the main queue as resolved by the broker.
    pub async fn install(&self, channel: &dyn BrokerChannel) -> Result<String, AmqpError> {
        channel.exchange_declare(&self.exchange).await?;

        if let Some(dlx) = &self.dead_letter {
            self.install_dead_letter(channel, dlx).await?;
        }

        let queue_name = channel.queue_declare(&self.queue).await?;

        for binding in self.bindings(&queue_name) {
            channel.queue_bind(&binding).await?;
        }

        debug!(
            queue = queue_name,
            exchange = self.exchange.name(),
            "topology installed"
        );

        Ok(queue_name)
    }

    async fn install_dead_letter(
        &self,
        channel: &dyn BrokerChannel,
        dlx: &DeadLetterTopology,
    ) -> Result<(), AmqpError> {
        channel.exchange_declare(&dlx.exchange).await?;
        let dlq_name = channel.queue_declare(&dlx.queue).await?;

        channel
            .queue_bind(
                &QueueBinding::new(&dlq_name)
                    .exchange(dlx.exchange.name())
                    .routing_key(&dlx.routing_key),
            )
            .await
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Composition-Time Registration
//!
//! The `Configurator` creates producers and consumers per message type while
//! the process is being composed. Each message type gets exactly one
//! `ConnectionBuilder`, shared by its producer and consumer. `build` freezes the
//! registrations into a `MessagingRegistry` that the `MessageService` walks on
//! start and stop.

use crate::{
    channel::{AmqpConnector, BrokerConnector},
    config::{QueueConfiguration, ServiceConfiguration},
    connection::{message_type_name, ConnectionBuilder},
    consumer::{Consumer, ManagedConsumer},
    errors::AmqpError,
    handler::AcknowledgeMode,
    publisher::{ManagedProducer, Producer},
};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    any::{Any, TypeId},
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tracing::debug;

/// Registers producers and consumers, one per message type.
pub struct Configurator {
    service_cfg: Arc<ServiceConfiguration>,
    connector: Arc<dyn BrokerConnector>,
    connections: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    producer_types: HashSet<TypeId>,
    consumer_types: HashSet<TypeId>,
    producers: Vec<Arc<dyn ManagedProducer>>,
    consumers: Vec<Arc<dyn ManagedConsumer>>,
}

impl Configurator {
    /// Uses the `lapin` connector.
    pub fn new(service_cfg: ServiceConfiguration) -> Configurator {
        Self::with_connector(service_cfg, AmqpConnector::new())
    }

    pub fn with_connector(
        service_cfg: ServiceConfiguration,
        connector: Arc<dyn BrokerConnector>,
    ) -> Configurator {
        Configurator {
            service_cfg: Arc::new(service_cfg),
            connector,
            connections: HashMap::default(),
            producer_types: HashSet::default(),
            consumer_types: HashSet::default(),
            producers: vec![],
            consumers: vec![],
        }
    }

    pub fn add_producer<T>(
        &mut self,
        exchange_name: &str,
        queue_name: &str,
        add_dead_letter_queue: bool,
    ) -> Result<Arc<Producer<T>>, AmqpError>
    where
        T: Serialize + Send + Sync + 'static,
    {
        self.add_producer_with(exchange_name, queue_name, add_dead_letter_queue, |_| {})
    }

    /// Registers the producer of `T`; `configure` adjusts the queue
    /// configuration after the names and dead-letter flag are set.
    pub fn add_producer_with<T, F>(
        &mut self,
        exchange_name: &str,
        queue_name: &str,
        add_dead_letter_queue: bool,
        configure: F,
    ) -> Result<Arc<Producer<T>>, AmqpError>
    where
        T: Serialize + Send + Sync + 'static,
        F: FnOnce(&mut QueueConfiguration),
    {
        if self.producer_types.contains(&TypeId::of::<T>()) {
            return Err(AmqpError::AlreadyRegistered(format!(
                "producer {}",
                message_type_name::<T>()
            )));
        }

        let mut cfg = QueueConfiguration::new(exchange_name, queue_name, add_dead_letter_queue);
        configure(&mut cfg);

        let producer = Producer::new(self.connection_for::<T>(cfg)?);
        self.producer_types.insert(TypeId::of::<T>());
        self.producers.push(producer.clone());

        debug!(message = message_type_name::<T>(), "producer registered");
        Ok(producer)
    }

    pub fn add_consumer<T>(
        &mut self,
        exchange_name: &str,
        queue_name: &str,
        add_dead_letter_queue: bool,
    ) -> Result<Arc<Consumer<T>>, AmqpError>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        self.add_consumer_with(exchange_name, queue_name, add_dead_letter_queue, |_| {})
    }

    pub fn add_consumer_with<T, F>(
        &mut self,
        exchange_name: &str,
        queue_name: &str,
        add_dead_letter_queue: bool,
        configure: F,
    ) -> Result<Arc<Consumer<T>>, AmqpError>
    where
        T: DeserializeOwned + Send + Sync + 'static,
        F: FnOnce(&mut QueueConfiguration),
    {
        self.add_consumer_with_mode(
            exchange_name,
            queue_name,
            add_dead_letter_queue,
            AcknowledgeMode::Auto,
            configure,
        )
    }

    /// Registers the consumer of `T` with an explicit acknowledgement mode.
    pub fn add_consumer_with_mode<T, F>(
        &mut self,
        exchange_name: &str,
        queue_name: &str,
        add_dead_letter_queue: bool,
        mode: AcknowledgeMode,
        configure: F,
    ) -> Result<Arc<Consumer<T>>, AmqpError>
    where
        T: DeserializeOwned + Send + Sync + 'static,
        F: FnOnce(&mut QueueConfiguration),
    {
        if self.consumer_types.contains(&TypeId::of::<T>()) {
            return Err(AmqpError::AlreadyRegistered(format!(
                "consumer {}",
                message_type_name::<T>()
            )));
        }

        let mut cfg = QueueConfiguration::new(exchange_name, queue_name, add_dead_letter_queue);
        configure(&mut cfg);

        let consumer = Consumer::with_acknowledge_mode(self.connection_for::<T>(cfg)?, mode);
        self.consumer_types.insert(TypeId::of::<T>());
        self.consumers.push(consumer.clone());

        debug!(message = message_type_name::<T>(), "consumer registered");
        Ok(consumer)
    }

    /// Returns the builder of `T`, creating it on first registration. A later
    /// registration must describe the same topology.
    fn connection_for<T>(
        &mut self,
        cfg: QueueConfiguration,
    ) -> Result<Arc<ConnectionBuilder<T>>, AmqpError>
    where
        T: 'static,
    {
        let conflict = || AmqpError::ConflictingConfiguration(message_type_name::<T>().to_owned());

        if let Some(existing) = self.connections.get(&TypeId::of::<T>()) {
            let builder = existing
                .clone()
                .downcast::<ConnectionBuilder<T>>()
                .map_err(|_| conflict())?;

            if builder.queue_configuration() != &cfg {
                return Err(conflict());
            }
            return Ok(builder);
        }

        let builder = Arc::new(ConnectionBuilder::<T>::new(
            self.service_cfg.clone(),
            cfg,
            self.connector.clone(),
        ));
        self.connections
            .insert(TypeId::of::<T>(), builder.clone() as Arc<dyn Any + Send + Sync>);

        Ok(builder)
    }

    pub fn build(self) -> MessagingRegistry {
        MessagingRegistry {
            producers: self.producers,
            consumers: self.consumers,
        }
    }
}

/// Every producer and consumer registered during composition, in
/// registration order. Read-only once built.
pub struct MessagingRegistry {
    producers: Vec<Arc<dyn ManagedProducer>>,
    consumers: Vec<Arc<dyn ManagedConsumer>>,
}

impl MessagingRegistry {
    pub fn producers(&self) -> &[Arc<dyn ManagedProducer>] {
        &self.producers
    }

    pub fn consumers(&self) -> &[Arc<dyn ManagedConsumer>] {
        &self.consumers
    }
}

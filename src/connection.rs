// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Per Message Type Connection Lifecycle
//!
//! A `ConnectionBuilder<T>` owns the broker connection and channel used for
//! message type `T`. The first call to `initialize_connection` connects, installs
//! the topology and configures QoS; later calls return the same handle. The
//! producer and the consumer of `T` share one builder and only ever borrow the
//! live channel through the returned `ConnectionHandle`.

use crate::{
    channel::{BrokerChannel, BrokerConnector},
    config::{QueueConfiguration, ServiceConfiguration},
    errors::AmqpError,
    exchange::ExchangeKind,
    topology::AmqpTopology,
};
use lapin::{types::ShortString, BasicProperties};
use std::{marker::PhantomData, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, info};

const DELIVERY_MODE_TRANSIENT: u8 = 1;
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Short, human readable name of a message type, used for logging and
/// consumer tags.
pub(crate) fn message_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// The live channel plus the resolved topology of one message type.
pub struct ConnectionHandle {
    channel: Arc<dyn BrokerChannel>,
    queue_name: String,
    exchange_name: String,
    exchange_kind: ExchangeKind,
    routing_keys: Vec<String>,
    basic_properties: BasicProperties,
}

impl ConnectionHandle {
    pub fn channel(&self) -> &Arc<dyn BrokerChannel> {
        &self.channel
    }

    /// Queue name as resolved by the broker.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn exchange_kind(&self) -> ExchangeKind {
        self.exchange_kind
    }

    /// Configured routing keys; may be empty.
    pub fn routing_keys(&self) -> &[String] {
        &self.routing_keys
    }

    /// Expiration and delivery mode applied to every publish.
    pub fn basic_properties(&self) -> &BasicProperties {
        &self.basic_properties
    }
}

enum ConnectionState {
    NotInitialized,
    Open(Arc<ConnectionHandle>),
    Closed,
}

/// Owns the connection, channel and topology of message type `T`.
pub struct ConnectionBuilder<T> {
    service_cfg: Arc<ServiceConfiguration>,
    queue_cfg: QueueConfiguration,
    connector: Arc<dyn BrokerConnector>,
    state: Mutex<ConnectionState>,
    _message: PhantomData<fn() -> T>,
}

impl<T> ConnectionBuilder<T> {
    pub fn new(
        service_cfg: Arc<ServiceConfiguration>,
        queue_cfg: QueueConfiguration,
        connector: Arc<dyn BrokerConnector>,
    ) -> ConnectionBuilder<T> {
        ConnectionBuilder {
            service_cfg,
            queue_cfg,
            connector,
            state: Mutex::new(ConnectionState::NotInitialized),
            _message: PhantomData,
        }
    }

    pub fn message_type(&self) -> &'static str {
        message_type_name::<T>()
    }

    pub fn queue_configuration(&self) -> &QueueConfiguration {
        &self.queue_cfg
    }

    /// Connects and installs the topology on first use; afterwards returns the
    /// existing handle. Errors from the broker are returned as-is and leave the
    /// builder uninitialized. Fails with `ConnectionClosed` once closed.
    pub async fn initialize_connection(&self) -> Result<Arc<ConnectionHandle>, AmqpError> {
        let mut state = self.state.lock().await;

        match &*state {
            ConnectionState::Open(handle) => return Ok(handle.clone()),
            ConnectionState::Closed => {
                return Err(AmqpError::ConnectionClosed(self.message_type().to_owned()))
            }
            ConnectionState::NotInitialized => {}
        }

        info!(
            queue = self.queue_cfg.queue_name,
            exchange = self.queue_cfg.exchange_name,
            message = self.message_type(),
            "initializing connection"
        );

        let topology = AmqpTopology::from_configuration(&self.queue_cfg)?;
        let channel = self.connector.connect(&self.service_cfg).await?;

        let queue_name = match self.install(&topology, channel.as_ref()).await {
            Ok(name) => name,
            Err(err) => {
                // Best effort: the topology error is the one worth reporting.
                let _ = channel.close().await;
                return Err(err);
            }
        };

        let handle = Arc::new(ConnectionHandle {
            channel,
            queue_name,
            exchange_name: topology.exchange_name().to_owned(),
            exchange_kind: topology.exchange_kind(),
            routing_keys: topology.routing_keys().to_vec(),
            basic_properties: self.basic_properties(),
        });

        debug!(queue = handle.queue_name, "connection initialized");
        *state = ConnectionState::Open(handle.clone());

        Ok(handle)
    }

    async fn install(
        &self,
        topology: &AmqpTopology,
        channel: &dyn BrokerChannel,
    ) -> Result<String, AmqpError> {
        let queue_name = topology.install(channel).await?;
        channel.basic_qos(self.queue_cfg.prefetch_count).await?;
        Ok(queue_name)
    }

    fn basic_properties(&self) -> BasicProperties {
        let mode = if self.queue_cfg.is_persistent {
            DELIVERY_MODE_PERSISTENT
        } else {
            DELIVERY_MODE_TRANSIENT
        };

        let properties = BasicProperties::default().with_delivery_mode(mode);
        match self.queue_cfg.expiration_millis() {
            Some(expiration) => properties.with_expiration(ShortString::from(expiration)),
            None => properties,
        }
    }

    /// The live handle, if the connection is open.
    pub async fn current(&self) -> Option<Arc<ConnectionHandle>> {
        match &*self.state.lock().await {
            ConnectionState::Open(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    /// Closes the channel and connection if open. A no-op before
    /// initialization and after a previous close.
    pub async fn close_connection(&self) -> Result<(), AmqpError> {
        let mut state = self.state.lock().await;

        let handle = match std::mem::replace(&mut *state, ConnectionState::Closed) {
            ConnectionState::Open(handle) => handle,
            ConnectionState::NotInitialized => {
                *state = ConnectionState::NotInitialized;
                return Ok(());
            }
            ConnectionState::Closed => return Ok(()),
        };

        handle.channel.close().await?;

        info!(
            queue = handle.queue_name,
            exchange = handle.exchange_name,
            message = self.message_type(),
            "closed connection"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{BrokerCall, RecordingBroker};

    struct Order;

    fn builder(broker: &RecordingBroker, cfg: QueueConfiguration) -> Arc<ConnectionBuilder<Order>> {
        Arc::new(ConnectionBuilder::new(
            Arc::new(ServiceConfiguration::default()),
            cfg,
            broker.connector(),
        ))
    }

    #[test]
    fn message_type_name_strips_module_path() {
        assert_eq!(message_type_name::<Order>(), "Order");
        assert_eq!(message_type_name::<Vec<Order>>(), "Vec");
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let broker = RecordingBroker::new();
        let builder = builder(&broker, QueueConfiguration::new("orders", "orders.q1", false));

        let first = builder.initialize_connection().await.unwrap();
        let second = builder.initialize_connection().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(broker.count(&BrokerCall::Connect), 1);
        assert_eq!(
            broker.count(&BrokerCall::ExchangeDeclare("orders".into(), ExchangeKind::Direct)),
            1
        );
        assert_eq!(broker.count(&BrokerCall::QueueDeclare("orders.q1".into())), 1);
        assert_eq!(broker.count(&BrokerCall::Qos(1)), 1);
    }

    #[tokio::test]
    async fn concurrent_initialization_connects_once() {
        let broker = RecordingBroker::new();
        let builder = builder(&broker, QueueConfiguration::new("orders", "orders.q1", false));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let builder = builder.clone();
                tokio::spawn(async move { builder.initialize_connection().await.map(|_| ()) })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(broker.count(&BrokerCall::Connect), 1);
    }

    #[tokio::test]
    async fn handle_exposes_resolved_topology() {
        let broker = RecordingBroker::new();
        let mut cfg = QueueConfiguration::new("orders", "", false);
        cfg.exchange_type = "topic".to_owned();
        cfg.routing_keys_csv = Some("order.*, order.created".to_owned());
        cfg.prefetch_count = 20;
        cfg.is_persistent = true;
        let builder = builder(&broker, cfg);

        let handle = builder.initialize_connection().await.unwrap();

        assert_eq!(handle.queue_name(), "amq.gen-1");
        assert_eq!(handle.exchange_name(), "orders");
        assert_eq!(handle.exchange_kind(), ExchangeKind::Topic);
        assert_eq!(handle.routing_keys(), ["order.*", "order.created"]);
        assert_eq!(
            handle.basic_properties().expiration().as_ref().map(|e| e.as_str()),
            Some("3600000")
        );
        assert_eq!(
            *handle.basic_properties().delivery_mode(),
            Some(DELIVERY_MODE_PERSISTENT)
        );
        assert_eq!(broker.count(&BrokerCall::Qos(20)), 1);
    }

    #[tokio::test]
    async fn connection_failure_propagates_and_can_be_retried() {
        let broker = RecordingBroker::unreachable();
        let builder = builder(&broker, QueueConfiguration::new("orders", "orders.q1", false));

        assert_eq!(
            builder.initialize_connection().await.err(),
            Some(AmqpError::ConnectionError)
        );
        assert!(builder.current().await.is_none());
        assert_eq!(
            builder.initialize_connection().await.err(),
            Some(AmqpError::ConnectionError)
        );
        assert_eq!(broker.count(&BrokerCall::Connect), 2);
    }

    #[tokio::test]
    async fn close_before_initialize_is_noop() {
        let broker = RecordingBroker::new();
        let builder = builder(&broker, QueueConfiguration::new("orders", "orders.q1", false));

        builder.close_connection().await.unwrap();
        builder.close_connection().await.unwrap();

        assert!(broker.calls().is_empty());
        builder.initialize_connection().await.unwrap();
    }

    #[tokio::test]
    async fn close_twice_closes_once() {
        let broker = RecordingBroker::new();
        let builder = builder(&broker, QueueConfiguration::new("orders", "orders.q1", false));
        builder.initialize_connection().await.unwrap();

        builder.close_connection().await.unwrap();
        builder.close_connection().await.unwrap();

        assert_eq!(broker.count(&BrokerCall::Close), 1);
        assert!(builder.current().await.is_none());
        assert_eq!(
            builder.initialize_connection().await.err(),
            Some(AmqpError::ConnectionClosed("Order".into()))
        );
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Broker doubles shared by the unit tests.
//!
//! `RecordingBroker` hands out `mockall` mocks of `BrokerConnector` and
//! `BrokerChannel` whose expectations record every call into shared state.

use crate::{
    channel::{BrokerChannel, BrokerConnector, DeliveryStream, InboundDelivery},
    config::ServiceConfiguration,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::{types::ShortString, BasicProperties};
use mockall::mock;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

mock! {
    pub Connector {}

    #[async_trait]
    impl BrokerConnector for Connector {
        async fn connect(
            &self,
            cfg: &ServiceConfiguration,
        ) -> Result<Arc<dyn BrokerChannel>, AmqpError>;
    }
}

mock! {
    pub Channel {}

    #[async_trait]
    impl BrokerChannel for Channel {
        async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;
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
        async fn basic_consume(
            &self,
            queue: &str,
            consumer_tag: &str,
        ) -> Result<DeliveryStream, AmqpError>;
        async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;
        async fn basic_reject(&self, delivery_tag: u64) -> Result<(), AmqpError>;
        async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;
        async fn close(&self) -> Result<(), AmqpError>;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    Connect,
    ExchangeDeclare(String, ExchangeKind),
    QueueDeclare(String),
    QueueBind(String, String, String),
    Qos(u16),
    Publish(String, String),
    Consume(String),
    Ack(u64),
    Reject(u64),
    Cancel(String),
    Close,
}

#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: BasicProperties,
}

#[derive(Default)]
struct BrokerState {
    calls: Vec<BrokerCall>,
    queues: Vec<QueueDefinition>,
    published: Vec<PublishedMessage>,
    generated: usize,
    sender: Option<mpsc::UnboundedSender<Result<InboundDelivery, AmqpError>>>,
    receiver: Option<mpsc::UnboundedReceiver<Result<InboundDelivery, AmqpError>>>,
    fail_connect: bool,
    fail_publish: bool,
}

#[derive(Clone)]
pub struct RecordingBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl RecordingBroker {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        RecordingBroker {
            state: Arc::new(Mutex::new(BrokerState {
                sender: Some(sender),
                receiver: Some(receiver),
                ..Default::default()
            })),
        }
    }

    pub fn unreachable() -> Self {
        let broker = Self::new();
        broker.state.lock().unwrap().fail_connect = true;
        broker
    }

    pub fn fail_publishes(&self) {
        self.state.lock().unwrap().fail_publish = true;
    }

    pub fn calls(&self) -> Vec<BrokerCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, call: &BrokerCall) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    pub fn count_matching(&self, pred: impl Fn(&BrokerCall) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().unwrap().published.clone()
    }

    pub fn queue(&self, name: &str) -> Option<QueueDefinition> {
        self.state
            .lock()
            .unwrap()
            .queues
            .iter()
            .find(|q| q.name() == name)
            .cloned()
    }

    /// Pushes a delivery to the (single) consumer subscription.
    pub fn deliver(&self, tag: u64, body: &[u8], correlation_id: Option<&str>) {
        let mut properties = BasicProperties::default().with_reply_to(ShortString::from("replies"));
        if let Some(id) = correlation_id {
            properties = properties.with_correlation_id(ShortString::from(id));
        }

        let state = self.state.lock().unwrap();
        if let Some(sender) = &state.sender {
            sender
                .send(Ok(InboundDelivery {
                    delivery_tag: tag,
                    properties,
                    data: body.to_vec(),
                }))
                .unwrap();
        }
    }

    /// Pushes a broker-side subscription error.
    pub fn deliver_error(&self, err: AmqpError) {
        let state = self.state.lock().unwrap();
        if let Some(sender) = &state.sender {
            sender.send(Err(err)).unwrap();
        }
    }

    pub fn connector(&self) -> Arc<dyn BrokerConnector> {
        let mut connector = MockConnector::new();
        let broker = self.clone();

        connector.expect_connect().returning(move |_| {
            let mut state = broker.state.lock().unwrap();
            state.calls.push(BrokerCall::Connect);
            if state.fail_connect {
                return Err(AmqpError::ConnectionError);
            }
            drop(state);
            Ok(broker.channel())
        });

        Arc::new(connector)
    }

    pub fn channel(&self) -> Arc<dyn BrokerChannel> {
        let mut channel = MockChannel::new();

        let state = self.state.clone();
        channel.expect_exchange_declare().returning(move |def| {
            state
                .lock()
                .unwrap()
                .calls
                .push(BrokerCall::ExchangeDeclare(def.name().to_owned(), def.exchange_kind()));
            Ok(())
        });

        let state = self.state.clone();
        channel.expect_queue_declare().returning(move |def| {
            let mut state = state.lock().unwrap();
            let name = if def.name().is_empty() {
                state.generated += 1;
                format!("amq.gen-{}", state.generated)
            } else {
                def.name().to_owned()
            };
            state.calls.push(BrokerCall::QueueDeclare(name.clone()));
            let mut declared = def.clone();
            declared.name = name.clone();
            state.queues.push(declared);
            Ok(name)
        });

        let state = self.state.clone();
        channel.expect_queue_bind().returning(move |binding| {
            state.lock().unwrap().calls.push(BrokerCall::QueueBind(
                binding.queue_name.clone(),
                binding.exchange_name.clone(),
                binding.routing_key.clone(),
            ));
            Ok(())
        });

        let state = self.state.clone();
        channel.expect_basic_qos().returning(move |prefetch| {
            state.lock().unwrap().calls.push(BrokerCall::Qos(prefetch));
            Ok(())
        });

        let state = self.state.clone();
        channel
            .expect_basic_publish()
            .returning(move |exchange, routing_key, payload, properties| {
                let mut state = state.lock().unwrap();
                if state.fail_publish {
                    return Err(AmqpError::PublishingError(exchange.to_owned()));
                }
                state
                    .calls
                    .push(BrokerCall::Publish(exchange.to_owned(), routing_key.to_owned()));
                state.published.push(PublishedMessage {
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                    body: payload.to_vec(),
                    properties,
                });
                Ok(())
            });

        let state = self.state.clone();
        channel.expect_basic_consume().returning(move |queue, _| {
            let mut state = state.lock().unwrap();
            state.calls.push(BrokerCall::Consume(queue.to_owned()));
            let deliveries: DeliveryStream = match state.receiver.take() {
                Some(receiver) => stream::unfold(receiver, |mut receiver| async move {
                    receiver.recv().await.map(|d| (d, receiver))
                })
                .boxed(),
                None => stream::empty().boxed(),
            };
            Ok(deliveries)
        });

        let state = self.state.clone();
        channel.expect_basic_ack().returning(move |tag| {
            state.lock().unwrap().calls.push(BrokerCall::Ack(tag));
            Ok(())
        });

        let state = self.state.clone();
        channel.expect_basic_reject().returning(move |tag| {
            state.lock().unwrap().calls.push(BrokerCall::Reject(tag));
            Ok(())
        });

        let state = self.state.clone();
        channel.expect_basic_cancel().returning(move |tag| {
            let mut state = state.lock().unwrap();
            state.calls.push(BrokerCall::Cancel(tag.to_owned()));
            state.sender.take();
            Ok(())
        });

        let state = self.state.clone();
        channel.expect_close().returning(move || {
            state.lock().unwrap().calls.push(BrokerCall::Close);
            Ok(())
        });

        Arc::new(channel)
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messaging Lifecycle
//!
//! `MessageService` starts every registered consumer when the host starts and,
//! on shutdown, stops the consumers before closing the producers. Stopping runs
//! at most once no matter how many callers request it.

use crate::{errors::AmqpError, registry::MessagingRegistry};
use tokio::sync::Mutex;
use tracing::{error, info};

#[derive(Default)]
struct LifecycleState {
    started: bool,
    stopped: bool,
}

pub struct MessageService {
    registry: MessagingRegistry,
    state: Mutex<LifecycleState>,
}

impl MessageService {
    pub fn new(registry: MessagingRegistry) -> MessageService {
        MessageService {
            registry,
            state: Mutex::new(LifecycleState::default()),
        }
    }

    pub fn registry(&self) -> &MessagingRegistry {
        &self.registry
    }

    /// Starts every consumer in registration order. The first failure is
    /// returned and the service stays unstarted; consumers already listening
    /// keep running until `stop`.
    pub async fn start(&self) -> Result<(), AmqpError> {
        let mut state = self.state.lock().await;
        if state.started || state.stopped {
            return Ok(());
        }

        for consumer in self.registry.consumers() {
            consumer.start_consumption().await.map_err(|err| {
                error!(
                    error = err.to_string(),
                    consumer = consumer.message_type(),
                    "failure to start consumer"
                );
                err
            })?;
        }

        state.started = true;
        info!(
            consumers = self.registry.consumers().len(),
            producers = self.registry.producers().len(),
            "messaging started"
        );

        Ok(())
    }

    /// Stops all consumers, then closes all producers. Failures are logged and
    /// the remaining components are still shut down; the first error is
    /// returned. Later calls are no-ops.
    pub async fn stop(&self) -> Result<(), AmqpError> {
        let mut state = self.state.lock().await;
        if state.stopped {
            return Ok(());
        }
        state.stopped = true;

        let mut first_error = None;

        for consumer in self.registry.consumers() {
            if let Err(err) = consumer.stop_consumption().await {
                error!(
                    error = err.to_string(),
                    consumer = consumer.message_type(),
                    "failure to stop consumer"
                );
                first_error.get_or_insert(err);
            }
        }

        for producer in self.registry.producers() {
            if let Err(err) = producer.close().await {
                error!(
                    error = err.to_string(),
                    producer = producer.message_type(),
                    "failure to close producer"
                );
                first_error.get_or_insert(err);
            }
        }

        info!("messaging stopped");

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Waits for Ctrl-C (or SIGTERM on unix) and then stops the service.
    pub async fn shutdown_on_signal(&self) -> Result<(), AmqpError> {
        wait_for_signal().await;
        info!("shutdown signal received");
        self.stop().await
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(err) => {
            error!(error = err.to_string(), "failure to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

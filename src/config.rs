// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messaging Configuration
//!
//! Static connection parameters shared by the whole process and the per message
//! type topology parameters populated at composition time.

use crate::{errors::AmqpError, exchange::ExchangeKind};
use serde::Deserialize;

/// Configuration root the connection parameters live under.
pub const CONFIG_ROOT: &str = "RabbitMq";

/// Suffix appended to the dead-letter exchange prefix.
pub const DEAD_LETTER_EXCHANGE_SUFFIX: &str = "-DLX";
/// Suffix appended to the dead-letter queue prefix.
pub const DEAD_LETTER_QUEUE_SUFFIX: &str = "-DLQ";

/// Connection parameters for the broker. One instance per process.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ServiceConfiguration {
    pub host_name: String,
    pub port: u16,
    #[serde(rename = "Vhost")]
    pub virtual_host: String,
    pub username: String,
    pub password: String,
    pub connection_name: String,
}

impl Default for ServiceConfiguration {
    fn default() -> Self {
        ServiceConfiguration {
            host_name: "localhost".to_owned(),
            port: 5672,
            virtual_host: "/".to_owned(),
            username: "guest".to_owned(),
            password: "guest".to_owned(),
            connection_name: "rabbitmq-messaging".to_owned(),
        }
    }
}

impl ServiceConfiguration {
    /// Reads the configuration from `RABBITMQ_*` environment variables,
    /// falling back to defaults for unset keys.
    pub fn from_env() -> Result<Self, AmqpError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through an arbitrary key lookup. Keys are the
    /// upper-cased configuration root followed by the field name, e.g.
    /// `RABBITMQ_HOSTNAME`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AmqpError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let prefix = CONFIG_ROOT.to_uppercase();
        let get = |field: &str| lookup(&format!("{}_{}", prefix, field));

        let mut cfg = ServiceConfiguration::default();

        if let Some(host) = get("HOSTNAME") {
            cfg.host_name = host;
        }
        if let Some(port) = get("PORT") {
            cfg.port = port.trim().parse().map_err(|_| {
                AmqpError::ConfigurationError(format!("invalid {}_PORT `{}`", prefix, port))
            })?;
        }
        if let Some(vhost) = get("VHOST") {
            cfg.virtual_host = vhost;
        }
        if let Some(username) = get("USERNAME") {
            cfg.username = username;
        }
        if let Some(password) = get("PASSWORD") {
            cfg.password = password;
        }
        if let Some(name) = get("CONNECTION_NAME") {
            cfg.connection_name = name;
        }

        Ok(cfg)
    }
}

/// Dead-letter topology parameters. Empty prefixes fall back to the main
/// exchange and queue names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlxQueueConfiguration {
    pub exchange_name_prefix: String,
    pub queue_name_prefix: String,
    pub max_queue_length: i32,
    /// With a routing key the dead-letter exchange is `direct` and the main
    /// queue carries `x-dead-letter-routing-key`; without one it is `fanout`.
    pub routing_key: Option<String>,
}

impl Default for DlxQueueConfiguration {
    fn default() -> Self {
        DlxQueueConfiguration {
            exchange_name_prefix: String::new(),
            queue_name_prefix: String::new(),
            max_queue_length: 10000,
            routing_key: None,
        }
    }
}

impl DlxQueueConfiguration {
    /// Sets both prefixes at once.
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.exchange_name_prefix = prefix.to_owned();
        self.queue_name_prefix = prefix.to_owned();
        self
    }

    /// `{prefix}-DLX`
    pub fn exchange_name(&self) -> String {
        format!("{}{}", self.exchange_name_prefix, DEAD_LETTER_EXCHANGE_SUFFIX)
    }

    /// `{prefix}-DLQ`
    pub fn queue_name(&self) -> String {
        format!("{}{}", self.queue_name_prefix, DEAD_LETTER_QUEUE_SUFFIX)
    }

    pub(crate) fn exchange_kind(&self) -> ExchangeKind {
        match self.routing_key {
            Some(_) => ExchangeKind::Direct,
            None => ExchangeKind::Fanout,
        }
    }
}

/// Topology parameters of one message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfiguration {
    pub exchange_name: String,
    pub exchange_type: String,
    pub queue_name: String,
    pub routing_keys_csv: Option<String>,
    pub message_expiration_seconds: u32,
    pub max_queue_length: i32,
    pub prefetch_count: u16,
    pub is_durable: bool,
    pub is_persistent: bool,
    pub auto_delete: bool,
    pub is_exclusive: bool,
    pub max_priority: u8,
    pub add_dead_letter_queue: bool,
    pub dead_letter: DlxQueueConfiguration,
}

impl Default for QueueConfiguration {
    fn default() -> Self {
        QueueConfiguration {
            exchange_name: String::new(),
            exchange_type: ExchangeKind::Direct.to_string(),
            queue_name: String::new(),
            routing_keys_csv: None,
            message_expiration_seconds: 3600,
            max_queue_length: 10000,
            prefetch_count: 1,
            is_durable: false,
            is_persistent: false,
            auto_delete: false,
            is_exclusive: false,
            max_priority: 10,
            add_dead_letter_queue: false,
            dead_letter: DlxQueueConfiguration::default(),
        }
    }
}

impl QueueConfiguration {
    pub fn new(exchange_name: &str, queue_name: &str, add_dead_letter_queue: bool) -> Self {
        QueueConfiguration {
            exchange_name: exchange_name.to_owned(),
            queue_name: queue_name.to_owned(),
            add_dead_letter_queue,
            ..Default::default()
        }
    }

    pub fn exchange_kind(&self) -> Result<ExchangeKind, AmqpError> {
        self.exchange_type.parse()
    }

    /// Comma-split, trimmed routing keys. Blank entries are dropped, so an
    /// unset or blank CSV yields an empty list.
    pub fn routing_keys(&self) -> Vec<String> {
        self.routing_keys_csv
            .as_deref()
            .map(|csv| {
                csv.split(',')
                    .map(str::trim)
                    .filter(|key| !key.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Dead-letter settings with empty prefixes resolved against the main
    /// exchange and queue names.
    pub fn resolved_dead_letter(&self) -> DlxQueueConfiguration {
        let mut dlx = self.dead_letter.clone();
        if dlx.exchange_name_prefix.is_empty() {
            dlx.exchange_name_prefix = self.exchange_name.clone();
        }
        if dlx.queue_name_prefix.is_empty() {
            dlx.queue_name_prefix = if self.queue_name.is_empty() {
                self.exchange_name.clone()
            } else {
                self.queue_name.clone()
            };
        }
        dlx
    }

    /// Per-message expiration in milliseconds, as the string the broker expects.
    /// Zero disables expiration.
    pub fn expiration_millis(&self) -> Option<String> {
        match self.message_expiration_seconds {
            0 => None,
            secs => Some((u64::from(secs) * 1000).to_string()),
        }
    }
}

// src/rabbitmq/options.rs
//
// Declaration, subscription, publish and request options. Every field has a
// documented default so callers only spell out what they change.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Routing behaviour of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Fanout,
    #[default]
    Topic,
    Headers,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeOptions {
    pub kind: ExchangeKind,
    pub passive: bool,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    /// Publishes wait for a broker acknowledgement when set.
    pub confirm: bool,
    /// Passed through opaquely to the driver as declare arguments.
    pub arguments: Map<String, Value>,
}

impl ExchangeOptions {
    pub fn with_kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    pub fn confirm(mut self) -> Self {
        self.confirm = true;
        self
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: Value) -> Self {
        self.arguments.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    pub passive: bool,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: Map<String, Value>,
}

impl QueueOptions {
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: Value) -> Self {
        self.arguments.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueDeleteOptions {
    pub if_unused: bool,
    pub if_empty: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscribeOptions {
    /// Acknowledge each delivery after the handler returns. When unset the
    /// broker considers deliveries acknowledged on send.
    pub ack: bool,
    pub exclusive: bool,
    pub prefetch_count: Option<u16>,
}

impl SubscribeOptions {
    pub fn ack(mut self) -> Self {
        self.ack = true;
        self
    }

    pub fn with_prefetch(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = Some(prefetch_count);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishOptions {
    pub content_type: String,
    pub persistent: bool,
    pub mandatory: bool,
    pub headers: Map<String, Value>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            content_type: "application/json".to_string(),
            persistent: false,
            mandatory: false,
            headers: Map::new(),
        }
    }
}

impl PublishOptions {
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: Value) -> Self {
        self.headers.insert(key.into(), value);
        self
    }
}

/// What a timed-out request resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TimeoutBehavior {
    #[default]
    Reject,
    NullResult,
}

#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// `None` waits indefinitely for the reply.
    pub timeout: Option<Duration>,
    pub on_timeout: TimeoutBehavior,
    pub publish: PublishOptions,
}

impl RequestOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn on_timeout(mut self, behavior: TimeoutBehavior) -> Self {
        self.on_timeout = behavior;
        self
    }

    pub fn with_publish(mut self, publish: PublishOptions) -> Self {
        self.publish = publish;
        self
    }
}

// src/rabbitmq/reply.rs
//
// Per-connection reply channel: one exchange and one queue, each set once,
// bound with an empty routing key and consumed by a single subscription that
// feeds the correlation engine.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use super::connection::Connection;
use super::errors::{RabbitMQError, ReplyPart, Result};
use super::exchange::Exchange;
use super::lock;
use super::message::{Delivery, ReplyEnvelope};
use super::options::{ExchangeOptions, PublishOptions, QueueOptions, SubscribeOptions};
use super::queue::Queue;
use super::transport::LossHandler;

#[derive(Default)]
enum ReplyStatus {
    #[default]
    Unbound,
    Ready {
        consumer_tag: String,
    },
    Closed,
}

#[derive(Default)]
struct ReplyState {
    exchange: Option<Exchange>,
    queue: Option<Queue>,
    status: ReplyStatus,
}

#[derive(Default)]
pub(crate) struct ReplyChannel {
    state: Mutex<ReplyState>,
    // serializes create/init so set-once checks hold across the awaits
    setup: AsyncMutex<()>,
}

impl ReplyChannel {
    pub(crate) fn ensure_ready(&self, connection: &str) -> Result<()> {
        match lock(&self.state).status {
            ReplyStatus::Ready { .. } => Ok(()),
            ReplyStatus::Unbound => Err(RabbitMQError::ReplyChannelNotConfigured(connection.to_string())),
            ReplyStatus::Closed => Err(RabbitMQError::ConnectionClosed(connection.to_string())),
        }
    }

    pub(crate) fn take_consumer_tag(&self) -> Option<String> {
        let mut state = lock(&self.state);
        match std::mem::replace(&mut state.status, ReplyStatus::Closed) {
            ReplyStatus::Ready { consumer_tag } => Some(consumer_tag),
            _ => None,
        }
    }

    /// Back to unbound if `consumer_tag` is the live reply consumer.
    fn mark_lost(&self, consumer_tag: &str) -> bool {
        let mut state = lock(&self.state);
        match &state.status {
            ReplyStatus::Ready { consumer_tag: live } if live == consumer_tag => {
                state.status = ReplyStatus::Unbound;
                true
            }
            _ => false,
        }
    }

    fn exchange(&self) -> Option<Exchange> {
        lock(&self.state).exchange.clone()
    }

    fn queue(&self) -> Option<Queue> {
        lock(&self.state).queue.clone()
    }
}

impl Connection {
    /// Declares the exchange replies are published to. Can only be done once
    /// per connection.
    pub async fn create_reply_exchange(&self, name: &str, options: ExchangeOptions) -> Result<Exchange> {
        let reply = &self.inner().reply;
        let _setup = reply.setup.lock().await;

        if reply.exchange().is_some() {
            return Err(RabbitMQError::AlreadyConfigured {
                part: ReplyPart::Exchange,
                connection: self.name().to_string(),
            });
        }

        let exchange = self.create_exchange(name, options).await?;
        lock(&reply.state).exchange = Some(exchange.clone());
        Ok(exchange)
    }

    /// Declares the queue replies are consumed from. Can only be done once per
    /// connection.
    pub async fn create_reply_queue(&self, name: &str, options: QueueOptions) -> Result<Queue> {
        let reply = &self.inner().reply;
        let _setup = reply.setup.lock().await;

        if reply.queue().is_some() {
            return Err(RabbitMQError::AlreadyConfigured {
                part: ReplyPart::Queue,
                connection: self.name().to_string(),
            });
        }

        let queue = self.create_queue(name, options).await?;
        lock(&reply.state).queue = Some(queue.clone());
        Ok(queue)
    }

    pub fn reply_exchange(&self) -> Option<Exchange> {
        self.inner().reply.exchange()
    }

    pub fn reply_queue(&self) -> Option<Queue> {
        self.inner().reply.queue()
    }

    pub fn is_reply_ready(&self) -> bool {
        self.inner().reply.ensure_ready(self.name()).is_ok()
    }

    /// Binds the reply queue to the reply exchange with an empty routing key
    /// and starts the subscription that dispatches replies to waiting
    /// requests. Must run once before any `request` or `reply`.
    ///
    /// If the broker ends the reply subscription, pending requests fail with a
    /// transport error and the channel goes back to unbound; calling
    /// `init_reply` again resumes it.
    pub async fn init_reply(&self) -> Result<()> {
        let reply = &self.inner().reply;
        let _setup = reply.setup.lock().await;

        let (exchange, queue) = {
            let state = lock(&reply.state);
            let exchange = state.exchange.clone().ok_or_else(|| RabbitMQError::NotConfigured {
                part: ReplyPart::Exchange,
                connection: self.name().to_string(),
            })?;
            let queue = state.queue.clone().ok_or_else(|| RabbitMQError::NotConfigured {
                part: ReplyPart::Queue,
                connection: self.name().to_string(),
            })?;
            match state.status {
                ReplyStatus::Unbound => {}
                ReplyStatus::Ready { .. } => {
                    return Err(RabbitMQError::AlreadyConfigured {
                        part: ReplyPart::Binding,
                        connection: self.name().to_string(),
                    })
                }
                ReplyStatus::Closed => {
                    return Err(RabbitMQError::ConnectionClosed(self.name().to_string()))
                }
            }
            (exchange, queue)
        };

        queue.bind(exchange.name(), "").await?;

        let engine = Arc::clone(&self.inner().correlation);
        let connection = Arc::downgrade(self.inner());
        let on_lost: LossHandler = Arc::new(move |consumer_tag: &str, reason: &str| {
            let Some(inner) = connection.upgrade() else {
                return;
            };
            if inner.reply.mark_lost(consumer_tag) {
                warn!(connection = %inner.name, consumer_tag, reason, "Reply consumer lost");
                inner.correlation.fail_all(reason);
            }
        });
        let consumer_tag = queue
            .subscribe_watched(
                SubscribeOptions::default(),
                Arc::new(move |delivery: Delivery| {
                    engine.dispatch(&delivery);
                }),
                Some(on_lost),
            )
            .await?;

        let accepted = {
            let mut state = lock(&reply.state);
            if matches!(state.status, ReplyStatus::Unbound) {
                state.status = ReplyStatus::Ready {
                    consumer_tag: consumer_tag.clone(),
                };
                true
            } else {
                false
            }
        };
        // closed while subscribing
        if !accepted {
            let _ = queue.unsubscribe(&consumer_tag).await;
            return Err(RabbitMQError::ConnectionClosed(self.name().to_string()));
        }

        info!(
            connection = %self.name(),
            exchange = %exchange.name(),
            queue = %queue.name(),
            consumer_tag = %consumer_tag,
            "Reply channel ready"
        );
        Ok(())
    }

    /// Publishes `{ _task_id, result }` to the reply exchange, answering a
    /// request issued by any process bound to it.
    pub async fn reply(&self, task_id: &str, result: Value) -> Result<()> {
        if task_id.is_empty() {
            return Err(RabbitMQError::ValidationError(
                "taskId has to be a non-empty string".to_string(),
            ));
        }
        let reply = &self.inner().reply;
        reply.ensure_ready(self.name())?;

        let exchange = reply
            .exchange()
            .ok_or_else(|| RabbitMQError::ReplyChannelNotConfigured(self.name().to_string()))?;
        exchange
            .publish("", &ReplyEnvelope::new(task_id, result), &PublishOptions::default())
            .await
    }
}

// src/rabbitmq/connection.rs

use std::fmt;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, info, warn};

use super::correlation::{CorrelationEngine, TaskId};
use super::errors::{RabbitMQError, ResourceKind, Result};
use super::exchange::Exchange;
use super::lock;
use super::message;
use super::options::{ExchangeOptions, PublishOptions, QueueOptions, RequestOptions};
use super::queue::Queue;
use super::reply::ReplyChannel;
use super::transport::TransportPtr;

pub(crate) struct ConnectionInner {
    pub(crate) name: String,
    pub(crate) transport: TransportPtr,
    pub(crate) exchanges: Mutex<Vec<Exchange>>,
    pub(crate) queues: Mutex<Vec<Queue>>,
    pub(crate) reply: ReplyChannel,
    pub(crate) correlation: Arc<CorrelationEngine>,
}

/// A named broker session with its own exchange and queue registries and an
/// optional reply channel. Clones share the same session.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Wraps an already established transport session.
    pub fn new(name: impl Into<String>, transport: TransportPtr) -> Self {
        let name = name.into();
        Self {
            inner: Arc::new(ConnectionInner {
                correlation: Arc::new(CorrelationEngine::new(name.clone())),
                name,
                transport,
                exchanges: Mutex::new(Vec::new()),
                queues: Mutex::new(Vec::new()),
                reply: ReplyChannel::default(),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ConnectionInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<ConnectionInner> {
        &self.inner
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn same_as(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.correlation.pending()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.correlation.is_closed()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(RabbitMQError::ConnectionClosed(self.inner.name.clone()));
        }
        Ok(())
    }

    /// Declares an exchange and registers it under its name, which must be
    /// unused on this connection. An empty name is the broker default exchange.
    pub async fn create_exchange(&self, name: &str, options: ExchangeOptions) -> Result<Exchange> {
        self.ensure_open()?;
        if self.find_exchange(name).is_some() {
            return Err(RabbitMQError::already_exists(ResourceKind::Exchange, name));
        }

        let declared = self.inner.transport.declare_exchange(name, &options).await?;
        let exchange = Exchange::new(declared, options, &self.inner);

        {
            let mut exchanges = lock(&self.inner.exchanges);
            if exchanges.iter().any(|e| e.name() == exchange.name()) {
                return Err(RabbitMQError::already_exists(ResourceKind::Exchange, exchange.name()));
            }
            exchanges.push(exchange.clone());
        }

        info!(connection = %self.inner.name, exchange = %exchange.name(), "Created exchange");
        Ok(exchange)
    }

    pub fn exchanges(&self) -> Vec<Exchange> {
        lock(&self.inner.exchanges).clone()
    }

    pub fn find_exchange(&self, name: &str) -> Option<Exchange> {
        lock(&self.inner.exchanges)
            .iter()
            .find(|e| e.name() == name)
            .cloned()
    }

    pub fn get_exchange(&self, name: &str) -> Result<Exchange> {
        self.find_exchange(name)
            .ok_or_else(|| RabbitMQError::not_found(ResourceKind::Exchange, name))
    }

    /// Forgets the exchange locally; the broker-side exchange is left alone.
    pub fn remove_exchange(&self, name: &str) -> Result<Exchange> {
        let mut exchanges = lock(&self.inner.exchanges);
        let position = exchanges
            .iter()
            .position(|e| e.name() == name)
            .ok_or_else(|| RabbitMQError::not_found(ResourceKind::Exchange, name))?;
        Ok(exchanges.remove(position))
    }

    /// Declares a queue and registers it. An empty name lets the broker pick
    /// one; the returned queue carries the assigned name.
    pub async fn create_queue(&self, name: &str, options: QueueOptions) -> Result<Queue> {
        self.ensure_open()?;
        if !name.is_empty() && self.find_queue(name).is_some() {
            return Err(RabbitMQError::already_exists(ResourceKind::Queue, name));
        }

        let declared = self.inner.transport.declare_queue(name, &options).await?;
        let queue = Queue::new(declared, options, &self.inner);

        {
            let mut queues = lock(&self.inner.queues);
            if queues.iter().any(|q| q.name() == queue.name()) {
                return Err(RabbitMQError::already_exists(ResourceKind::Queue, queue.name()));
            }
            queues.push(queue.clone());
        }

        info!(connection = %self.inner.name, queue = %queue.name(), "Created queue");
        Ok(queue)
    }

    pub fn queues(&self) -> Vec<Queue> {
        lock(&self.inner.queues).clone()
    }

    pub fn find_queue(&self, name: &str) -> Option<Queue> {
        lock(&self.inner.queues)
            .iter()
            .find(|q| q.name() == name)
            .cloned()
    }

    pub fn get_queue(&self, name: &str) -> Result<Queue> {
        self.find_queue(name)
            .ok_or_else(|| RabbitMQError::not_found(ResourceKind::Queue, name))
    }

    /// Forgets the queue locally; the broker-side queue is left alone.
    pub fn remove_queue(&self, name: &str) -> Result<Queue> {
        let mut queues = lock(&self.inner.queues);
        let position = queues
            .iter()
            .position(|q| q.name() == name)
            .ok_or_else(|| RabbitMQError::not_found(ResourceKind::Queue, name))?;
        Ok(queues.remove(position))
    }

    /// Publishes a JSON object through a registered exchange.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Value,
        options: &PublishOptions,
    ) -> Result<()> {
        let exchange = self.get_exchange(exchange)?;
        let body = message::into_object(payload, "payload")?;
        exchange.publish(routing_key, &body, options).await
    }

    /// Issues a correlated request through `exchange` and waits for the reply
    /// carrying the same task id. The waiter is registered before publishing,
    /// and removed again if publishing fails, the wait times out, or the
    /// returned future is dropped.
    pub async fn request(
        &self,
        exchange: &Exchange,
        routing_key: &str,
        body: Value,
        options: RequestOptions,
    ) -> Result<Value> {
        if !exchange.belongs_to(&self.inner) {
            return Err(RabbitMQError::ValidationError(format!(
                "exchange '{}' does not belong to connection '{}'",
                exchange.name(),
                self.inner.name
            )));
        }
        let mut body = message::into_object(body, "body")?;
        self.inner.reply.ensure_ready(&self.inner.name)?;

        let task_id = TaskId::generate();
        message::inject_task_id(&mut body, task_id.as_str())?;
        let waiter = self.inner.correlation.register(task_id)?;
        // the reply consumer may have been lost since the check above
        self.inner.reply.ensure_ready(&self.inner.name)?;

        exchange.publish(routing_key, &body, &options.publish).await?;
        debug!(
            connection = %self.inner.name,
            exchange = %exchange.name(),
            routing_key,
            task_id = %waiter.task_id(),
            "Request published"
        );

        waiter.wait(options.timeout, options.on_timeout).await
    }

    /// Rejects every pending request with `ConnectionClosed`, stops the reply
    /// subscription and ends the transport session.
    pub async fn close(&self) -> Result<()> {
        let abandoned = self.inner.correlation.abandon_all();

        if let Some(consumer_tag) = self.inner.reply.take_consumer_tag() {
            if let Err(e) = self.inner.transport.unsubscribe(&consumer_tag).await {
                warn!(connection = %self.inner.name, error = %e, "Failed to stop reply consumer");
            }
        }

        self.inner.transport.disconnect().await?;
        info!(connection = %self.inner.name, abandoned, "Closed connection");
        Ok(())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.inner.name)
            .field("exchanges", &lock(&self.inner.exchanges).len())
            .field("queues", &lock(&self.inner.queues).len())
            .field("pending_requests", &self.inner.correlation.pending())
            .finish()
    }
}

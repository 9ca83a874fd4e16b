// src/rabbitmq/queue.rs

use std::fmt;
use std::sync::{Arc, Weak};

use tracing::{debug, info};

use super::connection::ConnectionInner;
use super::errors::Result;
use super::lock;
use super::message::Delivery;
use super::options::{QueueDeleteOptions, QueueOptions, SubscribeOptions};
use super::transport::{DeliveryHandler, LossHandler, TransportPtr};

/// Handle to a queue declared through a connection. Cheap to clone.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    name: String,
    options: QueueOptions,
    transport: TransportPtr,
    connection: Weak<ConnectionInner>,
}

impl Queue {
    pub(crate) fn new(name: String, options: QueueOptions, owner: &Arc<ConnectionInner>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name,
                options,
                transport: Arc::clone(&owner.transport),
                connection: Arc::downgrade(owner),
            }),
        }
    }

    /// The broker-side name, which the broker picks when declared unnamed.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn options(&self) -> &QueueOptions {
        &self.inner.options
    }

    pub(crate) fn belongs_to(&self, inner: &Arc<ConnectionInner>) -> bool {
        Weak::ptr_eq(&self.inner.connection, &Arc::downgrade(inner))
    }

    pub fn same_as(&self, other: &Queue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub async fn bind(&self, exchange: &str, routing_key: &str) -> Result<()> {
        self.inner
            .transport
            .bind_queue(&self.inner.name, exchange, routing_key)
            .await?;
        debug!(queue = %self.inner.name, exchange, routing_key, "Bound queue");
        Ok(())
    }

    pub async fn unbind(&self, exchange: &str, routing_key: &str) -> Result<()> {
        self.inner
            .transport
            .unbind_queue(&self.inner.name, exchange, routing_key)
            .await?;
        debug!(queue = %self.inner.name, exchange, routing_key, "Unbound queue");
        Ok(())
    }

    /// Starts consuming; `listener` runs once per delivery. Returns the
    /// consumer tag to pass to [`Queue::unsubscribe`].
    pub async fn subscribe<F>(&self, options: SubscribeOptions, listener: F) -> Result<String>
    where
        F: Fn(Delivery) + Send + Sync + 'static,
    {
        self.subscribe_with(options, Arc::new(listener)).await
    }

    pub async fn subscribe_with(&self, options: SubscribeOptions, handler: DeliveryHandler) -> Result<String> {
        self.subscribe_watched(options, handler, None).await
    }

    /// Like [`Queue::subscribe_with`], with `on_lost` told when the consumer
    /// is ended from the broker side.
    pub async fn subscribe_watched(
        &self,
        options: SubscribeOptions,
        handler: DeliveryHandler,
        on_lost: Option<LossHandler>,
    ) -> Result<String> {
        let consumer_tag = self
            .inner
            .transport
            .subscribe(&self.inner.name, &options, handler, on_lost)
            .await?;
        debug!(queue = %self.inner.name, consumer_tag = %consumer_tag, "Subscribed to queue");
        Ok(consumer_tag)
    }

    pub async fn unsubscribe(&self, consumer_tag: &str) -> Result<()> {
        self.inner.transport.unsubscribe(consumer_tag).await
    }

    /// Deletes the queue on the broker and drops it from the registry.
    pub async fn destroy(&self, options: QueueDeleteOptions) -> Result<()> {
        self.inner
            .transport
            .delete_queue(&self.inner.name, &options)
            .await?;

        if let Some(connection) = self.inner.connection.upgrade() {
            lock(&connection.queues).retain(|q| !q.same_as(self));
        }
        info!(queue = %self.inner.name, "Destroyed queue");
        Ok(())
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.inner.name)
            .field("options", &self.inner.options)
            .finish()
    }
}

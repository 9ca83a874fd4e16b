// src/rabbitmq/exchange.rs

use std::fmt;
use std::sync::{Arc, Weak};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use super::connection::{Connection, ConnectionInner};
use super::errors::{RabbitMQError, Result};
use super::lock;
use super::message;
use super::options::{ExchangeKind, ExchangeOptions, PublishOptions, RequestOptions};
use super::transport::TransportPtr;

/// Handle to an exchange declared through a [`Connection`]. Cheap to clone.
#[derive(Clone)]
pub struct Exchange {
    inner: Arc<ExchangeInner>,
}

struct ExchangeInner {
    name: String,
    options: ExchangeOptions,
    transport: TransportPtr,
    connection_name: String,
    connection: Weak<ConnectionInner>,
}

impl Exchange {
    pub(crate) fn new(name: String, options: ExchangeOptions, owner: &Arc<ConnectionInner>) -> Self {
        Self {
            inner: Arc::new(ExchangeInner {
                name,
                options,
                transport: Arc::clone(&owner.transport),
                connection_name: owner.name.clone(),
                connection: Arc::downgrade(owner),
            }),
        }
    }

    /// Empty for the broker's default exchange.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> ExchangeKind {
        self.inner.options.kind
    }

    pub fn is_confirm(&self) -> bool {
        self.inner.options.confirm
    }

    pub fn options(&self) -> &ExchangeOptions {
        &self.inner.options
    }

    /// The owning connection, as long as it is still alive.
    pub fn connection(&self) -> Result<Connection> {
        self.inner
            .connection
            .upgrade()
            .map(Connection::from_inner)
            .ok_or_else(|| RabbitMQError::ConnectionClosed(self.inner.connection_name.clone()))
    }

    pub(crate) fn belongs_to(&self, inner: &Arc<ConnectionInner>) -> bool {
        Weak::ptr_eq(&self.inner.connection, &Arc::downgrade(inner))
    }

    pub fn same_as(&self, other: &Exchange) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// In confirm mode this completes once the broker acknowledged the
    /// message, otherwise once the driver accepted it.
    pub async fn publish<T>(&self, routing_key: &str, body: &T, options: &PublishOptions) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let payload = message::encode(body)?;
        self.inner
            .transport
            .publish(
                &self.inner.name,
                routing_key,
                &payload,
                options,
                self.inner.options.confirm,
            )
            .await?;

        debug!(exchange = %self.inner.name, routing_key, bytes = payload.len(), "Published message");
        Ok(())
    }

    /// Publishes `body` tagged with a fresh task id and waits for the matching
    /// reply on the connection's reply channel.
    pub async fn request(&self, routing_key: &str, body: Value, options: RequestOptions) -> Result<Value> {
        self.connection()?.request(self, routing_key, body, options).await
    }

    /// Deletes the exchange on the broker and drops it from the registry.
    pub async fn destroy(&self, if_unused: bool) -> Result<()> {
        self.inner
            .transport
            .delete_exchange(&self.inner.name, if_unused)
            .await?;

        if let Some(connection) = self.inner.connection.upgrade() {
            lock(&connection.exchanges).retain(|e| !e.same_as(self));
        }
        info!(exchange = %self.inner.name, "Destroyed exchange");
        Ok(())
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("name", &self.inner.name)
            .field("kind", &self.inner.options.kind)
            .field("confirm", &self.inner.options.confirm)
            .finish()
    }
}

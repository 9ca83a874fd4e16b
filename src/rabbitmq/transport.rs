// src/rabbitmq/transport.rs
//
// The driver seam. Everything above this trait is broker-agnostic; the lapin
// driver and the in-memory broker both implement it.

use std::sync::Arc;

use async_trait::async_trait;

use super::errors::Result;
use super::message::Delivery;
use super::options::{
    ExchangeOptions, PublishOptions, QueueDeleteOptions, QueueOptions, SubscribeOptions,
};
use crate::config::ConnectionConfig;

/// Called once per delivery on the subscription's own task.
pub type DeliveryHandler = Arc<dyn Fn(Delivery) + Send + Sync>;

/// Called at most once, with the consumer tag and a reason, when a consumer
/// stops without `unsubscribe` or `disconnect` having been asked for.
pub type LossHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;

pub type TransportPtr = Arc<dyn Transport>;

/// One live session with a broker.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Declares an exchange and returns the name the broker knows it by.
    async fn declare_exchange(&self, name: &str, options: &ExchangeOptions) -> Result<String>;

    /// Declares a queue. An empty name asks the broker to assign one, which
    /// is returned.
    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<String>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// With `confirm` the call completes only once the broker acknowledged the
    /// message; otherwise it completes when the driver accepted it.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        options: &PublishOptions,
        confirm: bool,
    ) -> Result<()>;

    /// Starts a consumer and returns its consumer tag. `on_lost` hears about
    /// consumers the broker or driver ended on its own.
    async fn subscribe(
        &self,
        queue: &str,
        options: &SubscribeOptions,
        handler: DeliveryHandler,
        on_lost: Option<LossHandler>,
    ) -> Result<String>;

    async fn unsubscribe(&self, consumer_tag: &str) -> Result<()>;

    async fn delete_exchange(&self, name: &str, if_unused: bool) -> Result<()>;

    async fn delete_queue(&self, name: &str, options: &QueueDeleteOptions) -> Result<()>;

    /// Ends the session. Consumers started through it stop delivering.
    /// Calling it again is a no-op.
    async fn disconnect(&self) -> Result<()>;
}

/// Opens transport sessions from connection settings.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &ConnectionConfig) -> Result<TransportPtr>;
}

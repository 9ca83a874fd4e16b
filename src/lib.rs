//! Request/reply over RabbitMQ.
//!
//! A [`Broker`] keeps named [`Connection`]s; each connection keeps its own
//! exchanges and queues and may carry one reply channel. Once the reply
//! channel is initialized, [`Connection::request`] publishes a JSON object
//! tagged with a fresh `_task_id` and resolves with the `result` of the reply
//! that echoes it back.

pub mod config;
pub mod logging;
pub mod rabbitmq;

pub use config::{ConnectionConfig, RequestDefaults, RpcConfig};
pub use rabbitmq::{
    Broker, Connection, Exchange, ExchangeOptions, PublishOptions, Queue, QueueOptions,
    RabbitMQError, RequestOptions, Result, TimeoutBehavior,
};

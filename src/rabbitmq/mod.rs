// src/rabbitmq/mod.rs
// Request/reply correlation on top of AMQP 0-9-1

pub mod errors;
pub mod options;
pub mod message;
pub mod transport;
pub mod correlation;
pub mod memory;
pub mod lapin_transport;

mod connection;
mod exchange;
mod queue;
mod reply;
mod fanout;
mod registry;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use connection::Connection;
pub use correlation::{CorrelationEngine, TaskId, Waiter};
pub use errors::{ErrorKind, RabbitMQError, ReplyPart, ResourceKind, Result, TransportErrorKind};
pub use exchange::Exchange;
pub use fanout::{
    ExchangeTarget, FanoutDelivery, FanoutHandle, FanoutListener, FanoutQueue, FanoutTask,
    QueueTarget,
};
pub use lapin_transport::{LapinConnector, LapinTransport};
pub use memory::{EventKind, MemoryBroker, TransportEvent};
pub use message::{Delivery, ReplyEnvelope, TASK_ID_FIELD};
pub use options::{
    ExchangeKind, ExchangeOptions, PublishOptions, QueueDeleteOptions, QueueOptions,
    RequestOptions, SubscribeOptions, TimeoutBehavior,
};
pub use queue::Queue;
pub use registry::Broker;
pub use transport::{Connector, DeliveryHandler, LossHandler, Transport, TransportPtr};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// src/rabbitmq/memory.rs
//
// In-process broker implementing the transport contract. Several sessions can
// share one broker, which stands in for several processes sharing a RabbitMQ
// vhost. Every broker-side action is appended to an ordered event log.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use super::errors::{RabbitMQError, Result, TransportErrorKind};
use super::message::Delivery;
use super::options::{
    ExchangeKind, ExchangeOptions, PublishOptions, QueueDeleteOptions, QueueOptions,
    SubscribeOptions,
};
use super::transport::{Connector, DeliveryHandler, LossHandler, Transport, TransportPtr};
use crate::config::ConnectionConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Connected { session: u64 },
    ExchangeDeclared { name: String },
    QueueDeclared { name: String },
    Bound { queue: String, exchange: String, routing_key: String },
    Unbound { queue: String, exchange: String, routing_key: String },
    Subscribed { queue: String, consumer_tag: String },
    Unsubscribed { consumer_tag: String },
    ConsumerLost { consumer_tag: String },
    Published { exchange: String, routing_key: String },
    Disconnected { session: u64 },
}

#[derive(Debug, Clone)]
pub struct TransportEvent {
    /// Position in the broker's total order of events.
    pub sequence: u64,
    pub at: DateTime<Utc>,
    pub kind: EventKind,
}

struct Binding {
    queue: String,
    routing_key: String,
}

struct MemoryExchange {
    kind: ExchangeKind,
    bindings: Vec<Binding>,
}

struct MemoryConsumer {
    tag: String,
    session: u64,
    sender: mpsc::UnboundedSender<Delivery>,
    on_lost: Option<LossHandler>,
}

#[derive(Default)]
struct MemoryQueue {
    consumers: Vec<MemoryConsumer>,
    next_consumer: usize,
    backlog: VecDeque<Delivery>,
}

impl MemoryQueue {
    /// Round-robins across live consumers, parking the message when none is
    /// attached.
    fn enqueue(&mut self, mut delivery: Delivery) {
        while !self.consumers.is_empty() {
            let index = self.next_consumer % self.consumers.len();
            match self.consumers[index].sender.send(delivery) {
                Ok(()) => {
                    self.next_consumer = index + 1;
                    return;
                }
                Err(mpsc::error::SendError(returned)) => {
                    self.consumers.remove(index);
                    delivery = returned;
                }
            }
        }
        self.backlog.push_back(delivery);
    }
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, MemoryExchange>,
    queues: HashMap<String, MemoryQueue>,
}

pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    events: Mutex<Vec<TransportEvent>>,
    sessions: AtomicU64,
    latency: Option<Duration>,
    refuse_connections: AtomicBool,
    fail_publishes: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    /// Every declare, bind and subscribe sleeps for `latency` first.
    pub fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(Self::build(Some(latency)))
    }

    fn build(latency: Option<Duration>) -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            events: Mutex::new(Vec::new()),
            sessions: AtomicU64::new(0),
            latency,
            refuse_connections: AtomicBool::new(false),
            fail_publishes: AtomicBool::new(false),
        }
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn Connector> {
        Arc::new(MemoryConnector {
            broker: Arc::clone(self),
        })
    }

    /// Opens a session directly, bypassing the connector.
    pub fn session(self: &Arc<Self>) -> TransportPtr {
        let session = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        self.record(EventKind::Connected { session });
        Arc::new(MemoryTransport {
            broker: Arc::clone(self),
            session,
            closed: AtomicBool::new(false),
        })
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Ends every consumer on `queue` from the broker side, the way a channel
    /// exception would. Returns how many consumers were dropped.
    pub fn fail_consumers(&self, queue: &str) -> usize {
        let dropped: Vec<MemoryConsumer> = self
            .lock()
            .queues
            .get_mut(queue)
            .map(|q| q.consumers.drain(..).collect())
            .unwrap_or_default();

        for consumer in &dropped {
            self.record(EventKind::ConsumerLost {
                consumer_tag: consumer.tag.clone(),
            });
            if let Some(on_lost) = &consumer.on_lost {
                on_lost(consumer.tag.as_str(), "CHANNEL_ERROR - consumer channel closed");
            }
        }
        dropped.len()
    }

    pub fn events(&self) -> Vec<TransportEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    /// Messages parked on `queue` for lack of a consumer.
    pub fn backlog(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.backlog.len())
    }

    /// `(queue, routing_key)` pairs bound to `exchange`.
    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        self.lock()
            .exchanges
            .get(exchange)
            .map(|e| {
                e.bindings
                    .iter()
                    .map(|b| (b.queue.clone(), b.routing_key.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, kind: EventKind) {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let sequence = events.len() as u64;
        events.push(TransportEvent {
            sequence,
            at: Utc::now(),
            kind,
        });
    }

    async fn pause(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn route(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<usize> {
        let mut state = self.lock();

        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_string()]
        } else {
            let target = state.exchanges.get(exchange).ok_or_else(|| {
                RabbitMQError::PublishError(format!("NOT_FOUND - no exchange '{}'", exchange))
            })?;
            let mut queues: Vec<String> = Vec::new();
            for binding in &target.bindings {
                if routes_to(target.kind, &binding.routing_key, routing_key)
                    && !queues.contains(&binding.queue)
                {
                    queues.push(binding.queue.clone());
                }
            }
            queues
        };

        let mut delivered = 0;
        for name in targets {
            if let Some(queue) = state.queues.get_mut(&name) {
                queue.enqueue(Delivery {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    redelivered: false,
                    data: body.to_vec(),
                });
                delivered += 1;
            }
        }
        Ok(delivered)
    }
}

// headers exchanges are treated like fanout
fn routes_to(kind: ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Direct => binding_key == routing_key,
        ExchangeKind::Fanout | ExchangeKind::Headers => true,
        ExchangeKind::Topic => {
            let pattern: Vec<&str> = binding_key.split('.').collect();
            let words: Vec<&str> = routing_key.split('.').collect();
            topic_matches(&pattern, &words)
        }
    }
}

fn topic_matches(pattern: &[&str], words: &[&str]) -> bool {
    match (pattern.split_first(), words.split_first()) {
        (None, None) => true,
        (Some((&"#", rest)), _) => {
            topic_matches(rest, words) || (!words.is_empty() && topic_matches(pattern, &words[1..]))
        }
        (Some((&"*", rest)), Some((_, remaining))) => topic_matches(rest, remaining),
        (Some((head, rest)), Some((word, remaining))) => {
            head == word && topic_matches(rest, remaining)
        }
        _ => false,
    }
}

pub struct MemoryConnector {
    broker: Arc<MemoryBroker>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, config: &ConnectionConfig) -> Result<TransportPtr> {
        if self.broker.refuse_connections.load(Ordering::SeqCst) {
            return Err(RabbitMQError::connection(
                TransportErrorKind::Refused,
                format!("connect ECONNREFUSED {}:{}", config.host, config.port),
            ));
        }
        info!(host = %config.host, port = config.port, "Connected to in-memory broker");
        Ok(self.broker.session())
    }
}

pub struct MemoryTransport {
    broker: Arc<MemoryBroker>,
    session: u64,
    closed: AtomicBool,
}

impl MemoryTransport {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RabbitMQError::connection(
                TransportErrorKind::Reset,
                format!("session {} is closed", self.session),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn declare_exchange(&self, name: &str, options: &ExchangeOptions) -> Result<String> {
        self.ensure_open()?;
        self.broker.pause().await;
        if name.is_empty() {
            return Ok(String::new());
        }

        {
            let mut state = self.broker.lock();
            match state.exchanges.get(name) {
                Some(existing) if existing.kind != options.kind => {
                    return Err(RabbitMQError::ChannelError(format!(
                        "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{}'",
                        name
                    )));
                }
                Some(_) => {}
                None if options.passive => {
                    return Err(RabbitMQError::ChannelError(format!(
                        "NOT_FOUND - no exchange '{}'",
                        name
                    )));
                }
                None => {
                    state.exchanges.insert(
                        name.to_string(),
                        MemoryExchange {
                            kind: options.kind,
                            bindings: Vec::new(),
                        },
                    );
                }
            }
        }

        self.broker.record(EventKind::ExchangeDeclared {
            name: name.to_string(),
        });
        Ok(name.to_string())
    }

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<String> {
        self.ensure_open()?;
        self.broker.pause().await;

        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_string()
        };

        {
            let mut state = self.broker.lock();
            if !state.queues.contains_key(&name) {
                if options.passive {
                    return Err(RabbitMQError::ChannelError(format!(
                        "NOT_FOUND - no queue '{}'",
                        name
                    )));
                }
                state.queues.insert(name.clone(), MemoryQueue::default());
            }
        }

        self.broker.record(EventKind::QueueDeclared { name: name.clone() });
        Ok(name)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        self.broker.pause().await;

        {
            let mut state = self.broker.lock();
            if !state.queues.contains_key(queue) {
                return Err(RabbitMQError::ChannelError(format!(
                    "NOT_FOUND - no queue '{}'",
                    queue
                )));
            }
            let target = state.exchanges.get_mut(exchange).ok_or_else(|| {
                RabbitMQError::ChannelError(format!("NOT_FOUND - no exchange '{}'", exchange))
            })?;
            let exists = target
                .bindings
                .iter()
                .any(|b| b.queue == queue && b.routing_key == routing_key);
            if !exists {
                target.bindings.push(Binding {
                    queue: queue.to_string(),
                    routing_key: routing_key.to_string(),
                });
            }
        }

        self.broker.record(EventKind::Bound {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });
        Ok(())
    }

    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;

        {
            let mut state = self.broker.lock();
            if let Some(target) = state.exchanges.get_mut(exchange) {
                target
                    .bindings
                    .retain(|b| !(b.queue == queue && b.routing_key == routing_key));
            }
        }

        self.broker.record(EventKind::Unbound {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        _options: &PublishOptions,
        _confirm: bool,
    ) -> Result<()> {
        self.ensure_open()?;
        if self.broker.fail_publishes.load(Ordering::SeqCst) {
            return Err(RabbitMQError::PublishError(format!(
                "publish to '{}' rejected by broker",
                exchange
            )));
        }

        self.broker.record(EventKind::Published {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });
        let delivered = self.broker.route(exchange, routing_key, body)?;
        debug!(exchange, routing_key, delivered, "Routed message");
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        _options: &SubscribeOptions,
        handler: DeliveryHandler,
        on_lost: Option<LossHandler>,
    ) -> Result<String> {
        self.ensure_open()?;
        self.broker.pause().await;

        let consumer_tag = format!("ctag-{}", Uuid::new_v4().simple());
        let (sender, mut receiver) = mpsc::unbounded_channel::<Delivery>();

        {
            let mut state = self.broker.lock();
            let target = state.queues.get_mut(queue).ok_or_else(|| {
                RabbitMQError::ConsumeError(format!("NOT_FOUND - no queue '{}'", queue))
            })?;
            target.consumers.push(MemoryConsumer {
                tag: consumer_tag.clone(),
                session: self.session,
                sender,
                on_lost,
            });
            let parked: Vec<Delivery> = target.backlog.drain(..).collect();
            for delivery in parked {
                target.enqueue(delivery);
            }
        }

        tokio::spawn(async move {
            while let Some(delivery) = receiver.recv().await {
                handler(delivery);
            }
        });

        self.broker.record(EventKind::Subscribed {
            queue: queue.to_string(),
            consumer_tag: consumer_tag.clone(),
        });
        Ok(consumer_tag)
    }

    async fn unsubscribe(&self, consumer_tag: &str) -> Result<()> {
        self.ensure_open()?;

        {
            let mut state = self.broker.lock();
            for queue in state.queues.values_mut() {
                queue.consumers.retain(|c| c.tag != consumer_tag);
            }
        }

        self.broker.record(EventKind::Unsubscribed {
            consumer_tag: consumer_tag.to_string(),
        });
        Ok(())
    }

    async fn delete_exchange(&self, name: &str, if_unused: bool) -> Result<()> {
        self.ensure_open()?;
        if name.is_empty() {
            return Err(RabbitMQError::ChannelError(
                "ACCESS_REFUSED - the default exchange cannot be deleted".to_string(),
            ));
        }

        let mut state = self.broker.lock();
        if let Some(target) = state.exchanges.get(name) {
            if if_unused && !target.bindings.is_empty() {
                return Err(RabbitMQError::ChannelError(format!(
                    "PRECONDITION_FAILED - exchange '{}' in use",
                    name
                )));
            }
        }
        state.exchanges.remove(name);
        Ok(())
    }

    async fn delete_queue(&self, name: &str, options: &QueueDeleteOptions) -> Result<()> {
        self.ensure_open()?;

        let mut state = self.broker.lock();
        if let Some(target) = state.queues.get(name) {
            if options.if_unused && !target.consumers.is_empty() {
                return Err(RabbitMQError::ChannelError(format!(
                    "PRECONDITION_FAILED - queue '{}' in use",
                    name
                )));
            }
            if options.if_empty && !target.backlog.is_empty() {
                return Err(RabbitMQError::ChannelError(format!(
                    "PRECONDITION_FAILED - queue '{}' not empty",
                    name
                )));
            }
        }
        state.queues.remove(name);
        for exchange in state.exchanges.values_mut() {
            exchange.bindings.retain(|b| b.queue != name);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        {
            let mut state = self.broker.lock();
            for queue in state.queues.values_mut() {
                queue.consumers.retain(|c| c.session != self.session);
            }
        }

        self.broker.record(EventKind::Disconnected {
            session: self.session,
        });
        Ok(())
    }
}

// src/rabbitmq/fanout.rs
//
// Scatter/gather helper: prepare a set of queues (declare or reuse, bind,
// subscribe) and only then publish the task that will produce their messages.
// Matching responses to the task is left to the listeners.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::{join_all, try_join_all};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::connection::Connection;
use super::errors::{RabbitMQError, Result};
use super::exchange::Exchange;
use super::message::{self, Delivery};
use super::options::{PublishOptions, QueueDeleteOptions, QueueOptions, SubscribeOptions};
use super::queue::Queue;

/// What a fan-out listener receives: the delivery, the queue it arrived on,
/// and every queue taking part in the same request.
#[derive(Debug, Clone)]
pub struct FanoutDelivery {
    pub queue: Queue,
    pub queues: Arc<[Queue]>,
    pub delivery: Delivery,
}

pub type FanoutListener = Arc<dyn Fn(FanoutDelivery) + Send + Sync>;

#[derive(Debug, Clone)]
pub enum QueueTarget {
    Existing(Queue),
    /// Reused when a queue with this name is registered, declared otherwise.
    Named(String),
}

pub struct FanoutQueue {
    target: QueueTarget,
    options: Option<QueueOptions>,
    bind_exchange: String,
    bind_routing: String,
    subscribe_options: SubscribeOptions,
    listener: FanoutListener,
}

impl FanoutQueue {
    pub fn named<F>(
        name: impl Into<String>,
        bind_exchange: impl Into<String>,
        bind_routing: impl Into<String>,
        listener: F,
    ) -> Self
    where
        F: Fn(FanoutDelivery) + Send + Sync + 'static,
    {
        Self::build(QueueTarget::Named(name.into()), bind_exchange, bind_routing, listener)
    }

    pub fn existing<F>(
        queue: Queue,
        bind_exchange: impl Into<String>,
        bind_routing: impl Into<String>,
        listener: F,
    ) -> Self
    where
        F: Fn(FanoutDelivery) + Send + Sync + 'static,
    {
        Self::build(QueueTarget::Existing(queue), bind_exchange, bind_routing, listener)
    }

    fn build<F>(
        target: QueueTarget,
        bind_exchange: impl Into<String>,
        bind_routing: impl Into<String>,
        listener: F,
    ) -> Self
    where
        F: Fn(FanoutDelivery) + Send + Sync + 'static,
    {
        Self {
            target,
            options: None,
            bind_exchange: bind_exchange.into(),
            bind_routing: bind_routing.into(),
            subscribe_options: SubscribeOptions::default(),
            listener: Arc::new(listener),
        }
    }

    /// Declare options; only valid for a queue that still has to be declared.
    pub fn with_options(mut self, options: QueueOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn with_subscribe_options(mut self, options: SubscribeOptions) -> Self {
        self.subscribe_options = options;
        self
    }
}

#[derive(Debug, Clone)]
pub enum ExchangeTarget {
    Exchange(Exchange),
    Named(String),
}

impl From<Exchange> for ExchangeTarget {
    fn from(exchange: Exchange) -> Self {
        ExchangeTarget::Exchange(exchange)
    }
}

impl From<&Exchange> for ExchangeTarget {
    fn from(exchange: &Exchange) -> Self {
        ExchangeTarget::Exchange(exchange.clone())
    }
}

impl From<&str> for ExchangeTarget {
    fn from(name: &str) -> Self {
        ExchangeTarget::Named(name.to_string())
    }
}

impl From<String> for ExchangeTarget {
    fn from(name: String) -> Self {
        ExchangeTarget::Named(name)
    }
}

/// The message published once every queue is listening.
#[derive(Debug, Clone)]
pub struct FanoutTask {
    exchange: ExchangeTarget,
    routing_key: String,
    payload: Value,
    options: PublishOptions,
}

impl FanoutTask {
    pub fn new(exchange: impl Into<ExchangeTarget>, routing_key: impl Into<String>, payload: Value) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            payload,
            options: PublishOptions::default(),
        }
    }

    pub fn with_options(mut self, options: PublishOptions) -> Self {
        self.options = options;
        self
    }
}

/// Queues and consumers set up by one fan-out request.
#[derive(Debug)]
pub struct FanoutHandle {
    queues: Arc<[Queue]>,
    subscriptions: Vec<(Queue, String)>,
}

impl FanoutHandle {
    pub fn queues(&self) -> &[Queue] {
        &self.queues
    }

    pub fn consumer_tags(&self) -> Vec<&str> {
        self.subscriptions.iter().map(|(_, tag)| tag.as_str()).collect()
    }

    /// Stops every listener attached by the request.
    pub async fn cancel(self) -> Result<()> {
        for (queue, consumer_tag) in &self.subscriptions {
            queue.unsubscribe(consumer_tag).await?;
        }
        Ok(())
    }
}

enum Plan {
    Reuse(Queue),
    Declare(String, QueueOptions),
}

impl Connection {
    /// Declares or reuses each queue, binds it, subscribes its listener, and
    /// then publishes `task`. Every entry is declared before any is bound, and
    /// bound before any is subscribed; within a phase entries run in parallel.
    ///
    /// On failure the listeners attached so far are detached and queues
    /// declared by this call are deleted again. Reused queues are left as they
    /// were.
    pub async fn request_fanout(&self, queues: Vec<FanoutQueue>, task: FanoutTask) -> Result<FanoutHandle> {
        let exchange = match task.exchange {
            ExchangeTarget::Exchange(exchange) => {
                if !exchange.belongs_to(self.inner()) {
                    return Err(RabbitMQError::ValidationError(format!(
                        "task.exchange '{}' does not belong to connection '{}'",
                        exchange.name(),
                        self.name()
                    )));
                }
                exchange
            }
            ExchangeTarget::Named(name) => self.get_exchange(&name)?,
        };
        let payload = message::into_object(task.payload, "task.payload")?;
        let plans = self.plan(&queues)?;

        let outcomes = join_all(plans.into_iter().map(|plan| async move {
            match plan {
                Plan::Reuse(queue) => Ok((queue, false)),
                Plan::Declare(name, options) => {
                    self.create_queue(&name, options).await.map(|queue| (queue, true))
                }
            }
        }))
        .await;

        let mut declared = Vec::with_capacity(outcomes.len());
        let mut fresh = Vec::new();
        let mut failure = None;
        for outcome in outcomes {
            match outcome {
                Ok((queue, created)) => {
                    if created {
                        fresh.push(queue.clone());
                    }
                    declared.push(queue);
                }
                Err(e) => failure = failure.or(Some(e)),
            }
        }
        if let Some(e) = failure {
            discard(&fresh).await;
            return Err(e);
        }
        let declared: Arc<[Queue]> = declared.into();
        debug!(connection = %self.name(), queues = declared.len(), fresh = fresh.len(), "Fan-out queues declared");

        let bound = try_join_all(
            declared
                .iter()
                .zip(&queues)
                .map(|(queue, entry)| queue.bind(&entry.bind_exchange, &entry.bind_routing)),
        )
        .await;
        if let Err(e) = bound {
            discard(&fresh).await;
            return Err(e);
        }

        let subscribed = join_all(declared.iter().zip(&queues).map(|(queue, entry)| {
            let listener = Arc::clone(&entry.listener);
            let receiving = queue.clone();
            let all = Arc::clone(&declared);
            let options = entry.subscribe_options.clone();
            async move {
                let tag = queue
                    .subscribe(options, move |delivery| {
                        listener(FanoutDelivery {
                            queue: receiving.clone(),
                            queues: Arc::clone(&all),
                            delivery,
                        })
                    })
                    .await?;
                Ok::<_, RabbitMQError>((queue.clone(), tag))
            }
        }))
        .await;

        let mut subscriptions = Vec::with_capacity(subscribed.len());
        let mut failure = None;
        for outcome in subscribed {
            match outcome {
                Ok(subscription) => subscriptions.push(subscription),
                Err(e) => failure = failure.or(Some(e)),
            }
        }
        let handle = FanoutHandle {
            queues: declared,
            subscriptions,
        };
        if let Some(e) = failure {
            release(handle).await;
            discard(&fresh).await;
            return Err(e);
        }

        if let Err(e) = exchange.publish(&task.routing_key, &payload, &task.options).await {
            release(handle).await;
            discard(&fresh).await;
            return Err(e);
        }

        info!(
            connection = %self.name(),
            exchange = %exchange.name(),
            routing_key = %task.routing_key,
            queues = handle.queues.len(),
            "Fan-out request published"
        );
        Ok(handle)
    }

    fn plan(&self, queues: &[FanoutQueue]) -> Result<Vec<Plan>> {
        let mut fresh: HashSet<&str> = HashSet::new();
        let mut plans = Vec::with_capacity(queues.len());

        for (index, entry) in queues.iter().enumerate() {
            let plan = match &entry.target {
                QueueTarget::Existing(_) if entry.options.is_some() => {
                    return Err(RabbitMQError::ValidationError(format!(
                        "queues[{}].options can't be provided for an existing queue",
                        index
                    )));
                }
                QueueTarget::Existing(queue) => {
                    if !queue.belongs_to(self.inner()) {
                        return Err(RabbitMQError::ValidationError(format!(
                            "queues[{}].queue '{}' does not belong to connection '{}'",
                            index,
                            queue.name(),
                            self.name()
                        )));
                    }
                    Plan::Reuse(queue.clone())
                }
                QueueTarget::Named(name) => match self.find_queue(name) {
                    Some(_) if entry.options.is_some() => {
                        return Err(RabbitMQError::ValidationError(format!(
                            "queues[{}].options can't be provided, queue '{}' already exists",
                            index, name
                        )));
                    }
                    Some(queue) => Plan::Reuse(queue),
                    None => {
                        if !name.is_empty() && !fresh.insert(name.as_str()) {
                            return Err(RabbitMQError::ValidationError(format!(
                                "queues[{}].queue '{}' is listed twice",
                                index, name
                            )));
                        }
                        Plan::Declare(name.clone(), entry.options.clone().unwrap_or_default())
                    }
                },
            };
            plans.push(plan);
        }
        Ok(plans)
    }
}

async fn discard(fresh: &[Queue]) {
    for queue in fresh {
        if let Err(e) = queue.destroy(QueueDeleteOptions::default()).await {
            warn!(queue = %queue.name(), error = %e, "Failed to delete fan-out queue");
        }
    }
}

async fn release(handle: FanoutHandle) {
    for (queue, consumer_tag) in &handle.subscriptions {
        if let Err(e) = queue.unsubscribe(consumer_tag).await {
            warn!(queue = %queue.name(), error = %e, "Failed to release fan-out consumer");
        }
    }
}

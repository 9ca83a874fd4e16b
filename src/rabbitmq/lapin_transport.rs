// src/rabbitmq/lapin_transport.rs
//
// Transport over a live RabbitMQ broker. One lapin connection per session: a
// plain channel for declarations and fire-and-forget publishes, one in confirm
// mode for exchanges that require broker acks, and one channel per consumer.
// Shared channels closed by a broker exception are reopened on next use.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use amq_protocol_types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString};
use async_trait::async_trait;
use futures_lite::StreamExt;
use lapin::options as amqp;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use serde_json::{Map, Value};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::errors::{RabbitMQError, Result, TransportErrorKind};
use super::lock;
use super::message::Delivery;
use super::options::{
    ExchangeKind, ExchangeOptions, PublishOptions, QueueDeleteOptions, QueueOptions,
    SubscribeOptions,
};
use super::transport::{Connector, DeliveryHandler, LossHandler, Transport, TransportPtr};
use crate::config::ConnectionConfig;

/// Opens [`LapinTransport`] sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct LapinConnector;

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(&self, config: &ConnectionConfig) -> Result<TransportPtr> {
        Ok(Arc::new(LapinTransport::connect(config).await?))
    }
}

pub struct LapinTransport {
    connection: Connection,
    // declarations, deletes and unconfirmed publishes
    channel: AsyncMutex<Channel>,
    confirm_channel: AsyncMutex<Channel>,
    // consumer tag -> the consumer's own channel and delivery task
    consumers: Arc<Mutex<HashMap<String, ConsumerEntry>>>,
    closed: AtomicBool,
}

struct ConsumerEntry {
    channel: Channel,
    task: JoinHandle<()>,
}

impl LapinTransport {
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        info!(host = %config.host, port = config.port, vhost = %config.vhost, "Connecting to RabbitMQ");

        let connection = tokio::time::timeout(
            config.connect_timeout(),
            Connection::connect(&config.amqp_uri(), ConnectionProperties::default()),
        )
        .await??;

        let channel = connection.create_channel().await?;
        let confirm_channel = open_confirm_channel(&connection).await?;

        debug!("Successfully connected to RabbitMQ");
        Ok(Self {
            connection,
            channel: AsyncMutex::new(channel),
            confirm_channel: AsyncMutex::new(confirm_channel),
            consumers: Arc::new(Mutex::new(HashMap::new())),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RabbitMQError::connection(
                TransportErrorKind::Reset,
                "connection was closed",
            ));
        }
        Ok(())
    }

    /// A usable channel from `slot`. A channel the broker closed after an
    /// exception is replaced before use.
    async fn live_channel(&self, slot: &AsyncMutex<Channel>, confirm: bool) -> Result<Channel> {
        self.ensure_open()?;
        let mut guard = slot.lock().await;

        if !guard.status().connected() {
            debug!(confirm, "Creating new channel");
            *guard = if confirm {
                open_confirm_channel(&self.connection).await?
            } else {
                self.connection.create_channel().await?
            };
        }
        Ok(guard.clone())
    }

    async fn control_channel(&self) -> Result<Channel> {
        self.live_channel(&self.channel, false).await
    }
}

async fn open_confirm_channel(connection: &Connection) -> Result<Channel> {
    let channel = connection.create_channel().await?;
    channel
        .confirm_select(amqp::ConfirmSelectOptions::default())
        .await?;
    Ok(channel)
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

fn field_table(arguments: &Map<String, Value>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in arguments {
        table.insert(ShortString::from(key.clone()), amqp_value(value));
    }
    table
}

fn amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(flag) => AMQPValue::Boolean(*flag),
        Value::Number(number) => match number.as_i64() {
            Some(integer) => AMQPValue::LongLongInt(integer),
            None => AMQPValue::Double(number.as_f64().unwrap_or_default()),
        },
        Value::String(text) => AMQPValue::LongString(LongString::from(text.clone())),
        Value::Array(items) => AMQPValue::FieldArray(FieldArray::from(
            items.iter().map(amqp_value).collect::<Vec<_>>(),
        )),
        Value::Object(entries) => AMQPValue::FieldTable(field_table(entries)),
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn declare_exchange(&self, name: &str, options: &ExchangeOptions) -> Result<String> {
        // the default exchange always exists and cannot be redeclared
        if name.is_empty() {
            return Ok(String::new());
        }

        self.control_channel()
            .await?
            .exchange_declare(
                name,
                exchange_kind(options.kind),
                amqp::ExchangeDeclareOptions {
                    passive: options.passive,
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    internal: options.internal,
                    nowait: false,
                },
                field_table(&options.arguments),
            )
            .await?;
        Ok(name.to_string())
    }

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<String> {
        let queue = self
            .control_channel()
            .await?
            .queue_declare(
                name,
                amqp::QueueDeclareOptions {
                    passive: options.passive,
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    nowait: false,
                },
                field_table(&options.arguments),
            )
            .await?;

        debug!(queue = %queue.name().as_str(), messages = queue.message_count(), "Declared queue");
        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.control_channel()
            .await?
            .queue_bind(
                queue,
                exchange,
                routing_key,
                amqp::QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.control_channel()
            .await?
            .queue_unbind(queue, exchange, routing_key, FieldTable::default())
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        options: &PublishOptions,
        confirm: bool,
    ) -> Result<()> {
        let mut properties = BasicProperties::default()
            .with_message_id(Uuid::new_v4().to_string().into())
            .with_content_type(options.content_type.clone().into())
            .with_timestamp(chrono::Utc::now().timestamp() as u64);
        if options.persistent {
            properties = properties.with_delivery_mode(2);
        }
        if !options.headers.is_empty() {
            properties = properties.with_headers(field_table(&options.headers));
        }

        let channel = if confirm {
            self.live_channel(&self.confirm_channel, true).await?
        } else {
            self.control_channel().await?
        };

        let pending = channel
            .basic_publish(
                exchange,
                routing_key,
                amqp::BasicPublishOptions {
                    mandatory: options.mandatory,
                    ..amqp::BasicPublishOptions::default()
                },
                body,
                properties,
            )
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;

        if confirm {
            let confirmation = pending
                .await
                .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;
            if confirmation.is_nack() {
                return Err(RabbitMQError::PublishError(format!(
                    "broker rejected message for exchange '{}'",
                    exchange
                )));
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        options: &SubscribeOptions,
        handler: DeliveryHandler,
        on_lost: Option<LossHandler>,
    ) -> Result<String> {
        self.ensure_open()?;
        let channel = self.connection.create_channel().await?;
        if let Some(prefetch_count) = options.prefetch_count {
            channel
                .basic_qos(prefetch_count, amqp::BasicQosOptions::default())
                .await?;
        }

        let consumer_tag = format!("ctag-{}", Uuid::new_v4().simple());
        let consumed = channel
            .basic_consume(
                queue,
                &consumer_tag,
                amqp::BasicConsumeOptions {
                    no_ack: !options.ack,
                    exclusive: options.exclusive,
                    ..amqp::BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await;
        let mut consumer = match consumed {
            Ok(consumer) => consumer,
            Err(e) => {
                if channel.status().connected() {
                    let _ = channel.close(200, "Consume failed").await;
                }
                return Err(RabbitMQError::ConsumeError(e.to_string()));
            }
        };

        let (registered, wait_registered) = oneshot::channel::<()>();
        let manual_ack = options.ack;
        let tag = consumer_tag.clone();
        let consumers = Arc::clone(&self.consumers);
        let task = tokio::spawn(async move {
            let _ = wait_registered.await;

            let reason = loop {
                match consumer.next().await {
                    Some(Ok(delivery)) => {
                        let lapin::message::Delivery {
                            exchange,
                            routing_key,
                            redelivered,
                            data,
                            acker,
                            ..
                        } = delivery;

                        handler(Delivery {
                            exchange: exchange.as_str().to_string(),
                            routing_key: routing_key.as_str().to_string(),
                            redelivered,
                            data,
                        });

                        if manual_ack {
                            if let Err(e) = acker.ack(amqp::BasicAckOptions::default()).await {
                                error!(consumer_tag = %tag, error = %e, "Failed to acknowledge message");
                            }
                        }
                    }
                    Some(Err(e)) => break e.to_string(),
                    None => break "consumer cancelled by broker".to_string(),
                }
            };

            // still registered: nobody on our side asked it to stop
            let lost = lock(&consumers).remove(&tag);
            match lost {
                Some(entry) => {
                    warn!(consumer_tag = %tag, reason = %reason, "Consumer lost");
                    if entry.channel.status().connected() {
                        let _ = entry.channel.close(200, "Consumer lost").await;
                    }
                    if let Some(on_lost) = &on_lost {
                        on_lost(tag.as_str(), reason.as_str());
                    }
                }
                None => debug!(consumer_tag = %tag, "Consumer stopped"),
            }
        });

        lock(&self.consumers).insert(consumer_tag.clone(), ConsumerEntry { channel, task });
        let _ = registered.send(());

        info!(queue, consumer_tag = %consumer_tag, "Started consuming");
        Ok(consumer_tag)
    }

    async fn unsubscribe(&self, consumer_tag: &str) -> Result<()> {
        let entry = lock(&self.consumers).remove(consumer_tag);
        let Some(entry) = entry else {
            debug!(consumer_tag, "Consumer already stopped");
            return Ok(());
        };

        if entry.channel.status().connected() {
            entry
                .channel
                .basic_cancel(consumer_tag, amqp::BasicCancelOptions::default())
                .await?;
            entry.channel.close(200, "Consumer cancelled").await?;
        }
        Ok(())
    }

    async fn delete_exchange(&self, name: &str, if_unused: bool) -> Result<()> {
        self.control_channel()
            .await?
            .exchange_delete(
                name,
                amqp::ExchangeDeleteOptions {
                    if_unused,
                    nowait: false,
                },
            )
            .await?;
        Ok(())
    }

    async fn delete_queue(&self, name: &str, options: &QueueDeleteOptions) -> Result<()> {
        let purged = self
            .control_channel()
            .await?
            .queue_delete(
                name,
                amqp::QueueDeleteOptions {
                    if_unused: options.if_unused,
                    if_empty: options.if_empty,
                    nowait: false,
                },
            )
            .await?;
        debug!(queue = name, purged, "Deleted queue");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let stopped: Vec<ConsumerEntry> = lock(&self.consumers).drain().map(|(_, entry)| entry).collect();
        for entry in stopped {
            entry.task.abort();
        }
        info!("Closing RabbitMQ connection");
        self.connection.close(200, "Normal shutdown").await?;
        Ok(())
    }
}

// Shared setup for tests running against the in-memory broker.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use rabbitmq_rpc::config::ConnectionConfig;
use rabbitmq_rpc::rabbitmq::{
    Broker, Connection, Delivery, ExchangeOptions, MemoryBroker, QueueOptions, SubscribeOptions,
};

pub const REPLY_EXCHANGE: &str = "replies";
pub const TASK_EXCHANGE: &str = "tasks";

pub fn broker_on(memory: &Arc<MemoryBroker>) -> Broker {
    Broker::new(memory.connector())
}

/// A connection with its reply channel initialized and the task exchange
/// declared.
pub async fn requester(broker: &Broker, name: &str) -> Connection {
    let connection = broker
        .create_connection(name, &ConnectionConfig::default())
        .await
        .expect("connect");
    connection
        .create_reply_exchange(REPLY_EXCHANGE, ExchangeOptions::default())
        .await
        .expect("reply exchange");
    connection
        .create_reply_queue("", QueueOptions::default().exclusive())
        .await
        .expect("reply queue");
    connection.init_reply().await.expect("init reply");
    connection
        .create_exchange(TASK_EXCHANGE, ExchangeOptions::default())
        .await
        .expect("task exchange");
    connection
}

/// A second process answering `INCREMENT` with `value + 1`.
pub async fn increment_worker(broker: &Broker, name: &str) -> Connection {
    let worker = requester(broker, name).await;
    let inbox = worker
        .create_queue("tasks.increment", QueueOptions::default())
        .await
        .expect("worker queue");
    inbox.bind(TASK_EXCHANGE, "INCREMENT").await.expect("bind");

    let responder = worker.clone();
    inbox
        .subscribe(SubscribeOptions::default(), move |delivery: Delivery| {
            let task_id = delivery.task_id().expect("task id");
            let value = delivery.payload().expect("json")["value"].as_i64().expect("value");
            let responder = responder.clone();
            tokio::spawn(async move {
                responder
                    .reply(&task_id, json!(value + 1))
                    .await
                    .expect("reply");
            });
        })
        .await
        .expect("subscribe");
    worker
}

/// Polls `check` until it holds or a second has passed.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

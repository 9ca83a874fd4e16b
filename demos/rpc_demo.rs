// demos/rpc_demo.rs
//
// INCREMENT round trip against a live RabbitMQ. Broker settings come from
// RABBITMQ_* variables or a .env file.
//
//     cargo run --example rpc_demo

use anyhow::Result;
use serde_json::json;
use tracing::{error, info, warn};

use rabbitmq_rpc::config::ConnectionConfig;
use rabbitmq_rpc::logging::init_tracing;
use rabbitmq_rpc::rabbitmq::{
    Broker, Connection, ExchangeOptions, QueueOptions, RequestOptions, SubscribeOptions,
};

const REPLY_EXCHANGE: &str = "rpc.demo.replies";
const TASK_EXCHANGE: &str = "rpc.demo.tasks";

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = ConnectionConfig::from_env()?;
    let broker = Broker::lapin();

    let worker = broker.create_connection("worker", &config).await?;
    start_worker(&worker).await?;

    let client = broker.create_connection("main", &config).await?;
    client.create_reply_exchange(REPLY_EXCHANGE, ExchangeOptions::default()).await?;
    client.create_reply_queue("", QueueOptions::default().exclusive()).await?;
    client.init_reply().await?;

    let tasks = client.create_exchange(TASK_EXCHANGE, ExchangeOptions::default()).await?;
    let options = RequestOptions::default().with_timeout(std::time::Duration::from_secs(5));
    for value in 1..=3 {
        let result = tasks
            .request("INCREMENT", json!({ "value": value }), options.clone())
            .await?;
        info!(value, %result, "INCREMENT answered");
    }

    broker.shutdown().await?;
    Ok(())
}

async fn start_worker(worker: &Connection) -> Result<()> {
    worker.create_reply_exchange(REPLY_EXCHANGE, ExchangeOptions::default()).await?;
    worker.create_reply_queue("", QueueOptions::default().exclusive()).await?;
    worker.init_reply().await?;

    worker.create_exchange(TASK_EXCHANGE, ExchangeOptions::default()).await?;
    let inbox = worker.create_queue("rpc.demo.increment", QueueOptions::default()).await?;
    inbox.bind(TASK_EXCHANGE, "INCREMENT").await?;

    let responder = worker.clone();
    inbox
        .subscribe(SubscribeOptions::default(), move |delivery| {
            let Some(task_id) = delivery.task_id() else {
                warn!(routing_key = %delivery.routing_key, "Task without _task_id");
                return;
            };
            let value = delivery
                .payload()
                .ok()
                .and_then(|body| body.get("value").and_then(|v| v.as_i64()))
                .unwrap_or(0);
            let responder = responder.clone();
            tokio::spawn(async move {
                if let Err(e) = responder.reply(&task_id, json!(value + 1)).await {
                    error!(task_id = %task_id, error = %e, "Failed to reply");
                }
            });
        })
        .await?;
    Ok(())
}

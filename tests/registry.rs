mod common;

use serde_json::json;

use common::broker_on;
use rabbitmq_rpc::config::ConnectionConfig;
use rabbitmq_rpc::rabbitmq::{
    ErrorKind, ExchangeKind, ExchangeOptions, MemoryBroker, QueueDeleteOptions, QueueOptions,
    RabbitMQError, ResourceKind, TransportErrorKind,
};

#[tokio::test]
async fn connection_names_are_unique() {
    let memory = MemoryBroker::new();
    let broker = broker_on(&memory);
    let config = ConnectionConfig::default();

    let main = broker.create_connection("main", &config).await.unwrap();
    let err = broker.create_connection("main", &config).await.unwrap_err();
    assert!(matches!(
        err,
        RabbitMQError::AlreadyExists { kind: ResourceKind::Connection, ref name } if name == "main"
    ));

    assert!(broker.get_connection("main").unwrap().same_as(&main));
    assert_eq!(broker.connections().len(), 1);
    assert_eq!(broker.get_connection("other").unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(broker.remove_connection("other").await.unwrap_err().kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn refused_connection_is_reported() {
    let memory = MemoryBroker::new();
    memory.refuse_connections(true);
    let broker = broker_on(&memory);

    let err = broker
        .create_connection("main", &ConnectionConfig::default())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        RabbitMQError::ConnectionError { kind: TransportErrorKind::Refused, .. }
    ));
    assert!(err.to_string().contains("ECONNREFUSED"));
    assert!(broker.connections().is_empty());
}

#[tokio::test]
async fn exchanges_and_queues_are_registered_per_connection() {
    let memory = MemoryBroker::new();
    let broker = broker_on(&memory);
    let main = broker
        .create_connection("main", &ConnectionConfig::default())
        .await
        .unwrap();
    let other = broker
        .create_connection("other", &ConnectionConfig::default())
        .await
        .unwrap();

    let events = main
        .create_exchange("events", ExchangeOptions::default().with_kind(ExchangeKind::Fanout))
        .await
        .unwrap();
    assert_eq!(events.kind(), ExchangeKind::Fanout);
    assert!(events.connection().unwrap().same_as(&main));

    let err = main
        .create_exchange("events", ExchangeOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    // registries are per connection
    other
        .create_exchange("events", ExchangeOptions::default().with_kind(ExchangeKind::Fanout))
        .await
        .unwrap();
    assert!(main.get_exchange("events").unwrap().same_as(&events));
    assert!(!other.get_exchange("events").unwrap().same_as(&events));

    let queue = main.create_queue("", QueueOptions::default()).await.unwrap();
    assert!(queue.name().starts_with("amq.gen-"));
    assert!(main.get_queue(queue.name()).unwrap().same_as(&queue));
    assert_eq!(main.get_queue("missing").unwrap_err().kind(), ErrorKind::NotFound);

    main.create_queue("work", QueueOptions::default()).await.unwrap();
    let err = main.create_queue("work", QueueOptions::default()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    assert_eq!(main.queues().len(), 2);
}

#[tokio::test]
async fn remove_keeps_broker_side_destroy_deletes_it() {
    let memory = MemoryBroker::new();
    let broker = broker_on(&memory);
    let main = broker
        .create_connection("main", &ConnectionConfig::default())
        .await
        .unwrap();

    main.create_exchange("audit", ExchangeOptions::default()).await.unwrap();
    main.remove_exchange("audit").unwrap();
    assert!(main.find_exchange("audit").is_none());
    assert!(memory.has_exchange("audit"));

    let jobs = main.create_exchange("jobs", ExchangeOptions::default()).await.unwrap();
    jobs.destroy(false).await.unwrap();
    assert!(main.find_exchange("jobs").is_none());
    assert!(!memory.has_exchange("jobs"));

    let queue = main.create_queue("scratch", QueueOptions::default()).await.unwrap();
    queue.destroy(QueueDeleteOptions::default()).await.unwrap();
    assert!(main.find_queue("scratch").is_none());
    assert!(!memory.has_queue("scratch"));

    assert_eq!(main.remove_queue("scratch").unwrap_err().kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn queue_bind_subscribe_and_publish() {
    let memory = MemoryBroker::new();
    let broker = broker_on(&memory);
    let main = broker
        .create_connection("main", &ConnectionConfig::default())
        .await
        .unwrap();

    main.create_exchange("logs", ExchangeOptions::default()).await.unwrap();
    let queue = main.create_queue("logs.errors", QueueOptions::default()).await.unwrap();
    queue.bind("logs", "*.error").await.unwrap();

    let (sender, mut received) = tokio::sync::mpsc::unbounded_channel();
    let tag = queue
        .subscribe(Default::default(), move |delivery| {
            let _ = sender.send((delivery.routing_key.clone(), delivery.payload().unwrap()));
        })
        .await
        .unwrap();

    main.publish("logs", "db.info", json!({ "n": 1 }), &Default::default())
        .await
        .unwrap();
    main.publish("logs", "db.error", json!({ "n": 2 }), &Default::default())
        .await
        .unwrap();

    let (routing_key, payload) = received.recv().await.unwrap();
    assert_eq!(routing_key, "db.error");
    assert_eq!(payload, json!({ "n": 2 }));

    queue.unsubscribe(&tag).await.unwrap();
    queue.unbind("logs", "*.error").await.unwrap();
    assert!(memory.bindings("logs").is_empty());

    let err = main
        .publish("logs", "db.error", json!("not an object"), &Default::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    let err = main
        .publish("missing", "", json!({}), &Default::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn shutdown_closes_every_connection() {
    let memory = MemoryBroker::new();
    let broker = broker_on(&memory);
    let main = broker
        .create_connection("main", &ConnectionConfig::default())
        .await
        .unwrap();
    let other = broker
        .create_connection("other", &ConnectionConfig::default())
        .await
        .unwrap();

    broker.shutdown().await.unwrap();

    assert!(broker.connections().is_empty());
    assert!(main.is_closed() && other.is_closed());
    let err = main.create_queue("late", QueueOptions::default()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionClosed);
}

#[tokio::test]
async fn closing_twice_is_harmless() {
    let memory = MemoryBroker::new();
    let broker = broker_on(&memory);
    let main = broker
        .create_connection("main", &ConnectionConfig::default())
        .await
        .unwrap();

    main.close().await.unwrap();
    main.close().await.unwrap();
    broker.remove_connection("main").await.unwrap();

    let disconnects = memory
        .events()
        .iter()
        .filter(|e| matches!(e.kind, rabbitmq_rpc::rabbitmq::EventKind::Disconnected { .. }))
        .count();
    assert_eq!(disconnects, 1);
}

mod common;

use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use common::broker_on;
use rabbitmq_rpc::config::ConnectionConfig;
use rabbitmq_rpc::rabbitmq::{
    ErrorKind, EventKind, ExchangeKind, ExchangeOptions, FanoutQueue, FanoutTask, MemoryBroker,
    QueueOptions,
};

#[tokio::test]
async fn listeners_are_ready_before_task_is_published() {
    let memory = MemoryBroker::with_latency(Duration::from_millis(20));
    let broker = broker_on(&memory);
    let main = broker
        .create_connection("main", &ConnectionConfig::default())
        .await
        .unwrap();

    main.create_exchange("jobs", ExchangeOptions::default().with_kind(ExchangeKind::Direct))
        .await
        .unwrap();
    main.create_exchange("results", ExchangeOptions::default().with_kind(ExchangeKind::Fanout))
        .await
        .unwrap();
    let reused = main.create_queue("results.audit", QueueOptions::default()).await.unwrap();

    // a stand-in worker: every job on "jobs" produces one result on "results"
    let worker_inbox = main.create_queue("jobs.inbox", QueueOptions::default()).await.unwrap();
    worker_inbox.bind("jobs", "build").await.unwrap();
    let responder = main.clone();
    worker_inbox
        .subscribe(Default::default(), move |delivery| {
            let responder = responder.clone();
            let job = delivery.payload().unwrap();
            tokio::spawn(async move {
                responder
                    .publish("results", "", json!({ "done": job["id"] }), &Default::default())
                    .await
                    .unwrap();
            });
        })
        .await
        .unwrap();

    let (sender, mut received) = mpsc::unbounded_channel();
    let fresh_sender = sender.clone();
    let queues = vec![
        FanoutQueue::named("", "results", "", move |d| {
            let _ = fresh_sender.send((d.queue.name().to_string(), d.queues.len(), d.delivery.payload().unwrap()));
        })
        .with_options(QueueOptions::default().exclusive()),
        FanoutQueue::existing(reused.clone(), "results", "", move |d| {
            let _ = sender.send((d.queue.name().to_string(), d.queues.len(), d.delivery.payload().unwrap()));
        }),
    ];

    let handle = main
        .request_fanout(queues, FanoutTask::new("jobs", "build", json!({ "id": 7 })))
        .await
        .unwrap();

    assert_eq!(handle.queues().len(), 2);
    assert!(handle.queues()[0].name().starts_with("amq.gen-"));
    assert!(handle.queues()[1].same_as(&reused));

    let mut seen = Vec::new();
    for _ in 0..2 {
        let (queue, participants, payload) = received.recv().await.unwrap();
        assert_eq!(participants, 2);
        assert_eq!(payload, json!({ "done": 7 }));
        seen.push(queue);
    }
    seen.sort();
    let mut expected: Vec<String> = handle.queues().iter().map(|q| q.name().to_string()).collect();
    expected.sort();
    assert_eq!(seen, expected);

    let events = memory.events();
    let published = events
        .iter()
        .find(|e| matches!(&e.kind, EventKind::Published { exchange, .. } if exchange == "jobs"))
        .map(|e| e.sequence)
        .unwrap();
    let subscribed: Vec<u64> = events
        .iter()
        .filter(|e| matches!(&e.kind, EventKind::Subscribed { queue, .. } if expected.contains(queue)))
        .map(|e| e.sequence)
        .collect();
    assert_eq!(subscribed.len(), 2);
    assert!(subscribed.iter().all(|s| *s < published));

    let fresh = handle.queues()[0].name().to_string();
    handle.cancel().await.unwrap();
    assert_eq!(memory.consumer_count(&fresh), 0);
    assert_eq!(memory.consumer_count("results.audit"), 0);
}

#[tokio::test]
async fn named_queue_already_registered_is_reused() {
    let memory = MemoryBroker::new();
    let broker = broker_on(&memory);
    let main = broker
        .create_connection("main", &ConnectionConfig::default())
        .await
        .unwrap();
    main.create_exchange("jobs", ExchangeOptions::default()).await.unwrap();
    let existing = main.create_queue("collect", QueueOptions::default()).await.unwrap();

    let handle = main
        .request_fanout(
            vec![FanoutQueue::named("collect", "jobs", "#", |_| {})],
            FanoutTask::new("jobs", "any", json!({})),
        )
        .await
        .unwrap();

    assert!(handle.queues()[0].same_as(&existing));
    assert_eq!(main.queues().len(), 1);
    assert_eq!(memory.bindings("jobs"), vec![("collect".to_string(), "#".to_string())]);
}

#[tokio::test]
async fn options_on_existing_queue_are_rejected() {
    let memory = MemoryBroker::new();
    let broker = broker_on(&memory);
    let main = broker
        .create_connection("main", &ConnectionConfig::default())
        .await
        .unwrap();
    main.create_exchange("jobs", ExchangeOptions::default()).await.unwrap();
    let existing = main.create_queue("collect", QueueOptions::default()).await.unwrap();

    let err = main
        .request_fanout(
            vec![FanoutQueue::existing(existing, "jobs", "", |_| {}).with_options(QueueOptions::default())],
            FanoutTask::new("jobs", "", json!({})),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = main
        .request_fanout(
            vec![FanoutQueue::named("collect", "jobs", "", |_| {}).with_options(QueueOptions::default())],
            FanoutTask::new("jobs", "", json!({})),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(memory.events().iter().all(|e| !matches!(e.kind, EventKind::Published { .. })));
}

#[tokio::test]
async fn task_must_be_object_on_known_exchange() {
    let memory = MemoryBroker::new();
    let broker = broker_on(&memory);
    let main = broker
        .create_connection("main", &ConnectionConfig::default())
        .await
        .unwrap();
    main.create_exchange("jobs", ExchangeOptions::default()).await.unwrap();

    let err = main
        .request_fanout(vec![], FanoutTask::new("jobs", "", json!("text")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = main
        .request_fanout(vec![], FanoutTask::new("missing", "", json!({})))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn failed_publish_releases_listeners() {
    let memory = MemoryBroker::new();
    let broker = broker_on(&memory);
    let main = broker
        .create_connection("main", &ConnectionConfig::default())
        .await
        .unwrap();
    main.create_exchange("jobs", ExchangeOptions::default()).await.unwrap();

    memory.fail_publishes(true);
    let err = main
        .request_fanout(
            vec![FanoutQueue::named("collect", "jobs", "#", |_| {})],
            FanoutTask::new("jobs", "any", json!({})),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Transport);
    assert_eq!(memory.consumer_count("collect"), 0);
    assert!(main.find_queue("collect").is_none());
    assert!(!memory.has_queue("collect"));
}

#[tokio::test]
async fn failed_declare_removes_queues_declared_by_the_call() {
    let memory = MemoryBroker::new();
    let broker = broker_on(&memory);
    let main = broker
        .create_connection("main", &ConnectionConfig::default())
        .await
        .unwrap();
    main.create_exchange("jobs", ExchangeOptions::default()).await.unwrap();
    let kept = main.create_queue("kept", QueueOptions::default()).await.unwrap();

    let missing = QueueOptions {
        passive: true,
        ..QueueOptions::default()
    };
    let err = main
        .request_fanout(
            vec![
                FanoutQueue::named("fresh", "jobs", "#", |_| {}),
                FanoutQueue::existing(kept.clone(), "jobs", "#", |_| {}),
                FanoutQueue::named("ghost", "jobs", "#", |_| {}).with_options(missing),
            ],
            FanoutTask::new("jobs", "any", json!({})),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Transport);
    assert!(main.find_queue("fresh").is_none());
    assert!(!memory.has_queue("fresh"));
    assert!(main.find_queue("kept").unwrap().same_as(&kept));
    assert!(memory.has_queue("kept"));
    assert!(memory.bindings("jobs").is_empty());
}

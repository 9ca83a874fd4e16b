// src/rabbitmq/correlation.rs
//
// Waiter table for request/reply correlation. Requests register a one-shot
// waiter under a fresh task id before publishing; the reply subscription
// resolves it. Insertion, resolution and teardown all go through one mutex.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use super::errors::{RabbitMQError, Result};
use super::message::{Delivery, ReplyEnvelope};
use super::options::TimeoutBehavior;

/// Opaque correlation identifier: 122 random bits from a v4 UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskId(String);

impl TaskId {
    pub fn generate() -> Self {
        TaskId(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

enum Resolution {
    Reply(Value),
    Abandoned,
    Failed(String),
}

struct PendingRequest {
    sender: oneshot::Sender<Resolution>,
    created_at: Instant,
}

#[derive(Default)]
struct WaiterTable {
    closed: bool,
    pending: HashMap<String, PendingRequest>,
}

pub struct CorrelationEngine {
    connection: String,
    table: Mutex<WaiterTable>,
}

impl CorrelationEngine {
    pub fn new(connection: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
            table: Mutex::new(WaiterTable::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WaiterTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a waiter for `task_id`. Must happen before the request is
    /// published so a fast reply cannot be missed.
    pub fn register(self: &Arc<Self>, task_id: TaskId) -> Result<Waiter> {
        let (sender, receiver) = oneshot::channel();
        let mut table = self.lock();

        if table.closed {
            return Err(RabbitMQError::ConnectionClosed(self.connection.clone()));
        }
        if table.pending.contains_key(task_id.as_str()) {
            return Err(RabbitMQError::ValidationError(format!(
                "task id {} is already awaiting a reply",
                task_id
            )));
        }
        table.pending.insert(
            task_id.as_str().to_string(),
            PendingRequest {
                sender,
                created_at: Instant::now(),
            },
        );
        drop(table);

        debug!(connection = %self.connection, task_id = %task_id, "Registered reply waiter");
        Ok(Waiter {
            task_id,
            receiver,
            engine: Arc::clone(self),
        })
    }

    /// Hands `result` to the waiter for `task_id`. Returns false when no such
    /// waiter exists, which is not an error: the reply may belong to another
    /// process sharing the reply queue, or to a request that already gave up.
    pub fn resolve(&self, task_id: &str, result: Value) -> bool {
        let pending = self.lock().pending.remove(task_id);

        match pending {
            Some(request) => {
                debug!(
                    connection = %self.connection,
                    task_id = %task_id,
                    elapsed_ms = request.created_at.elapsed().as_millis() as u64,
                    "Resolved reply waiter"
                );
                // The caller may have stopped listening; nothing to do then.
                let _ = request.sender.send(Resolution::Reply(result));
                true
            }
            None => {
                debug!(connection = %self.connection, task_id = %task_id, "Dropping unmatched reply");
                false
            }
        }
    }

    /// Entry point of the reply subscription.
    pub fn dispatch(&self, delivery: &Delivery) -> bool {
        match ReplyEnvelope::decode(&delivery.data) {
            Ok(reply) => self.resolve(&reply.task_id, reply.result),
            Err(e) => {
                debug!(connection = %self.connection, error = %e, "Ignoring malformed reply");
                false
            }
        }
    }

    /// Rejects every outstanding waiter with `ConnectionClosed` and refuses
    /// new registrations. Returns how many waiters were abandoned.
    pub fn abandon_all(&self) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut table = self.lock();
            table.closed = true;
            table.pending.drain().map(|(_, request)| request).collect()
        };

        let count = drained.len();
        for request in drained {
            let _ = request.sender.send(Resolution::Abandoned);
        }
        if count > 0 {
            warn!(connection = %self.connection, abandoned = count, "Abandoned pending requests");
        }
        count
    }

    /// Rejects every outstanding waiter with a transport error, leaving the
    /// engine open for later registrations.
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut table = self.lock();
            table.pending.drain().map(|(_, request)| request).collect()
        };

        let count = drained.len();
        for request in drained {
            let _ = request.sender.send(Resolution::Failed(reason.to_string()));
        }
        if count > 0 {
            warn!(connection = %self.connection, failed = count, reason, "Failed pending requests");
        }
        count
    }

    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn remove(&self, task_id: &str) -> bool {
        self.lock().pending.remove(task_id).is_some()
    }
}

/// The caller's half of a pending request. Dropping it, for whatever reason,
/// removes the waiter from the table.
pub struct Waiter {
    task_id: TaskId,
    receiver: oneshot::Receiver<Resolution>,
    engine: Arc<CorrelationEngine>,
}

impl Waiter {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub async fn wait(mut self, timeout: Option<Duration>, on_timeout: TimeoutBehavior) -> Result<Value> {
        let outcome = match timeout {
            None => (&mut self.receiver).await,
            Some(after) => match tokio::time::timeout(after, &mut self.receiver).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.engine.remove(self.task_id.as_str());
                    // A reply may have landed between the deadline and the removal.
                    if let Ok(Resolution::Reply(result)) = self.receiver.try_recv() {
                        return Ok(result);
                    }
                    warn!(task_id = %self.task_id, ?after, "Request timed out");
                    return match on_timeout {
                        TimeoutBehavior::Reject => Err(RabbitMQError::Timeout {
                            task_id: self.task_id.to_string(),
                            after,
                        }),
                        TimeoutBehavior::NullResult => Ok(Value::Null),
                    };
                }
            },
        };

        match outcome {
            Ok(Resolution::Reply(result)) => Ok(result),
            Ok(Resolution::Failed(reason)) => Err(RabbitMQError::ConsumeError(format!(
                "reply consumer of connection '{}' stopped: {}",
                self.engine.connection, reason
            ))),
            Ok(Resolution::Abandoned) | Err(_) => {
                Err(RabbitMQError::ConnectionClosed(self.engine.connection.clone()))
            }
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.engine.remove(self.task_id.as_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::errors::ErrorKind;
    use serde_json::json;
    use std::collections::HashSet;

    fn engine() -> Arc<CorrelationEngine> {
        Arc::new(CorrelationEngine::new("main"))
    }

    #[test]
    fn task_ids_do_not_repeat() {
        let ids: HashSet<TaskId> = (0..10_000).map(|_| TaskId::generate()).collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[tokio::test]
    async fn resolve_delivers_to_matching_waiter() {
        let engine = engine();
        let waiter = engine.register(TaskId::generate()).unwrap();
        let task_id = waiter.task_id().to_string();

        assert!(engine.resolve(&task_id, json!(2)));
        assert_eq!(waiter.wait(None, TimeoutBehavior::Reject).await.unwrap(), json!(2));
        assert_eq!(engine.pending(), 0);
    }

    #[tokio::test]
    async fn unknown_task_id_is_dropped_without_side_effects() {
        let engine = engine();
        let waiter = engine.register(TaskId::generate()).unwrap();

        assert!(!engine.resolve("not-a-real-task", json!("stray")));
        assert_eq!(engine.pending(), 1);

        let task_id = waiter.task_id().to_string();
        engine.resolve(&task_id, json!("mine"));
        assert_eq!(
            waiter.wait(None, TimeoutBehavior::Reject).await.unwrap(),
            json!("mine")
        );
    }

    #[tokio::test]
    async fn abandon_all_rejects_every_waiter() {
        let engine = engine();
        let waiters: Vec<Waiter> = (0..5)
            .map(|_| engine.register(TaskId::generate()).unwrap())
            .collect();

        assert_eq!(engine.abandon_all(), 5);
        assert_eq!(engine.pending(), 0);

        for waiter in waiters {
            let err = waiter.wait(None, TimeoutBehavior::Reject).await.unwrap_err();
            assert!(matches!(err, RabbitMQError::ConnectionClosed(ref name) if name == "main"));
        }

        let err = engine.register(TaskId::generate()).err().unwrap();
        assert!(matches!(err, RabbitMQError::ConnectionClosed(_)));
    }

    #[tokio::test]
    async fn fail_all_rejects_waiters_but_stays_open() {
        let engine = engine();
        let waiter = engine.register(TaskId::generate()).unwrap();

        assert_eq!(engine.fail_all("channel closed"), 1);
        let err = waiter.wait(None, TimeoutBehavior::Reject).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.to_string().contains("channel closed"));

        assert!(!engine.is_closed());
        let later = engine.register(TaskId::generate()).unwrap();
        assert!(engine.resolve(later.task_id().as_str(), json!(1)));
    }

    #[tokio::test]
    async fn timeout_removes_waiter() {
        let engine = engine();
        let waiter = engine.register(TaskId::generate()).unwrap();
        let task_id = waiter.task_id().to_string();

        let err = waiter
            .wait(Some(Duration::from_millis(20)), TimeoutBehavior::Reject)
            .await
            .unwrap_err();
        assert!(matches!(err, RabbitMQError::Timeout { .. }));
        assert_eq!(engine.pending(), 0);
        assert!(!engine.resolve(&task_id, json!("late")));
    }

    #[tokio::test]
    async fn timeout_can_resolve_to_null() {
        let engine = engine();
        let waiter = engine.register(TaskId::generate()).unwrap();

        let result = waiter
            .wait(Some(Duration::from_millis(20)), TimeoutBehavior::NullResult)
            .await
            .unwrap();
        assert_eq!(result, Value::Null);
    }

    #[test]
    fn dropping_a_waiter_unregisters_it() {
        let engine = engine();
        let waiter = engine.register(TaskId::generate()).unwrap();
        assert_eq!(engine.pending(), 1);
        drop(waiter);
        assert_eq!(engine.pending(), 0);
    }

    #[test]
    fn duplicate_registration_is_refused() {
        let engine = engine();
        let task_id = TaskId::generate();
        let _waiter = engine.register(task_id.clone()).unwrap();
        assert!(engine.register(task_id).is_err());
    }

    #[tokio::test]
    async fn dispatch_decodes_reply_envelopes() {
        let engine = engine();
        let waiter = engine.register(TaskId::generate()).unwrap();
        let body = serde_json::to_vec(&json!({
            "_task_id": waiter.task_id().as_str(),
            "result": { "count": 2 }
        }))
        .unwrap();

        let malformed = Delivery {
            exchange: "replies".into(),
            routing_key: String::new(),
            redelivered: false,
            data: b"not json".to_vec(),
        };
        assert!(!engine.dispatch(&malformed));

        let reply = Delivery { data: body, ..malformed };
        assert!(engine.dispatch(&reply));
        assert_eq!(
            waiter.wait(None, TimeoutBehavior::Reject).await.unwrap(),
            json!({ "count": 2 })
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_resolutions_do_not_cross() {
        let engine = engine();
        let mut handles = Vec::new();

        for marker in 0..64u64 {
            let waiter = engine.register(TaskId::generate()).unwrap();
            let task_id = waiter.task_id().to_string();
            let resolver = Arc::clone(&engine);
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                resolver.resolve(&task_id, json!(marker * 10));
            });
            handles.push(tokio::spawn(async move {
                (marker, waiter.wait(None, TimeoutBehavior::Reject).await.unwrap())
            }));
        }

        for handle in handles {
            let (marker, result) = handle.await.unwrap();
            assert_eq!(result, json!(marker * 10));
        }
        assert_eq!(engine.pending(), 0);
    }
}

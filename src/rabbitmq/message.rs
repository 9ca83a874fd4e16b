// src/rabbitmq/message.rs
//
// Wire shapes for request/reply: requests are JSON objects carrying a reserved
// `_task_id` string, replies are `{ "_task_id": ..., "result": ... }`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::errors::{RabbitMQError, Result};

pub const TASK_ID_FIELD: &str = "_task_id";

/// A message handed to a subscription handler.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub data: Vec<u8>,
}

impl Delivery {
    /// Decodes the body as arbitrary JSON.
    pub fn payload(&self) -> Result<Value> {
        Ok(serde_json::from_slice(&self.data)?)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.data)?)
    }

    /// The correlation identifier carried by the body, if any.
    pub fn task_id(&self) -> Option<String> {
        match self.payload().ok()? {
            Value::Object(mut body) => match body.remove(TASK_ID_FIELD)? {
                Value::String(task_id) => Some(task_id),
                _ => None,
            },
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    #[serde(rename = "_task_id")]
    pub task_id: String,
    #[serde(default)]
    pub result: Value,
}

impl ReplyEnvelope {
    pub fn new(task_id: impl Into<String>, result: Value) -> Self {
        Self {
            task_id: task_id.into(),
            result,
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Accepts only structured payloads; `what` names the argument in the error.
pub fn into_object(payload: Value, what: &str) -> Result<Map<String, Value>> {
    match payload {
        Value::Object(body) => Ok(body),
        other => Err(RabbitMQError::ValidationError(format!(
            "{} has to be an object, got {}",
            what,
            json_type(&other)
        ))),
    }
}

/// Writes the correlation identifier into a request body. A body that already
/// owns the reserved field is rejected rather than silently overwritten.
pub fn inject_task_id(body: &mut Map<String, Value>, task_id: &str) -> Result<()> {
    if body.contains_key(TASK_ID_FIELD) {
        return Err(RabbitMQError::ValidationError(format!(
            "payload already sets the reserved field '{}'",
            TASK_ID_FIELD
        )));
    }
    body.insert(TASK_ID_FIELD.to_string(), Value::String(task_id.to_string()));
    Ok(())
}

pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn delivery(body: Value) -> Delivery {
        Delivery {
            exchange: "replies".to_string(),
            routing_key: String::new(),
            redelivered: false,
            data: serde_json::to_vec(&body).unwrap(),
        }
    }

    #[test]
    fn primitive_payloads_are_rejected() {
        let err = into_object(json!(42), "body").unwrap_err();
        assert!(matches!(err, RabbitMQError::ValidationError(_)));
        assert!(err.to_string().contains("a number"));
    }

    #[test]
    fn task_id_is_injected_once() {
        let mut body = into_object(json!({ "action": "INCREMENT" }), "body").unwrap();
        inject_task_id(&mut body, "abc").unwrap();
        assert_eq!(body[TASK_ID_FIELD], json!("abc"));

        let err = inject_task_id(&mut body, "def").unwrap_err();
        assert!(matches!(err, RabbitMQError::ValidationError(_)));
        assert_eq!(body[TASK_ID_FIELD], json!("abc"));
    }

    #[test]
    fn reply_envelope_uses_reserved_field_name() {
        let encoded = serde_json::to_value(ReplyEnvelope::new("t-1", json!(2))).unwrap();
        assert_eq!(encoded, json!({ "_task_id": "t-1", "result": 2 }));

        let decoded = ReplyEnvelope::decode(br#"{"_task_id":"t-2"}"#).unwrap();
        assert_eq!(decoded.result, Value::Null);
    }

    #[test]
    fn delivery_exposes_task_id() {
        assert_eq!(
            delivery(json!({ "_task_id": "t-9", "count": 1 })).task_id(),
            Some("t-9".to_string())
        );
        assert_eq!(delivery(json!({ "_task_id": 9 })).task_id(), None);
        assert_eq!(delivery(json!([1, 2])).task_id(), None);
    }
}

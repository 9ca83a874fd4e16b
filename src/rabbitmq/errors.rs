// src/rabbitmq/errors.rs

use std::fmt;
use std::io::ErrorKind as IoErrorKind;
use std::time::Duration;

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::time::error::Elapsed;

/// Registry scopes used in lookup and uniqueness errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Connection,
    Exchange,
    Queue,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Connection => write!(f, "connection"),
            ResourceKind::Exchange => write!(f, "exchange"),
            ResourceKind::Queue => write!(f, "queue"),
        }
    }
}

/// The halves of a connection's reply channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyPart {
    Exchange,
    Queue,
    Binding,
}

impl fmt::Display for ReplyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyPart::Exchange => write!(f, "reply exchange"),
            ReplyPart::Queue => write!(f, "reply queue"),
            ReplyPart::Binding => write!(f, "reply binding"),
        }
    }
}

/// Coarse classification of driver-level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    HostNotFound,
    Refused,
    Reset,
    Io,
    Protocol,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportErrorKind::HostNotFound => write!(f, "ENOTFOUND"),
            TransportErrorKind::Refused => write!(f, "ECONNREFUSED"),
            TransportErrorKind::Reset => write!(f, "ECONNRESET"),
            TransportErrorKind::Io => write!(f, "EIO"),
            TransportErrorKind::Protocol => write!(f, "EPROTO"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error("Invalid argument: {0}")]
    ValidationError(String),

    #[error("{kind} '{name}' is not defined")]
    NotFound { kind: ResourceKind, name: String },

    #[error("{kind} '{name}' is already defined")]
    AlreadyExists { kind: ResourceKind, name: String },

    #[error("The {part} of connection '{connection}' is already created")]
    AlreadyConfigured { part: ReplyPart, connection: String },

    #[error("The {part} of connection '{connection}' is not defined")]
    NotConfigured { part: ReplyPart, connection: String },

    #[error("The reply channel of connection '{0}' is not initialized")]
    ReplyChannelNotConfigured(String),

    #[error("RabbitMQ connection error ({kind}): {message}")]
    ConnectionError {
        kind: TransportErrorKind,
        message: String,
    },

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("Request {task_id} timed out after {after:?}")]
    Timeout { task_id: String, after: Duration },

    #[error("Connection timeout: {0}")]
    TimeoutError(String),

    #[error("Connection '{0}' was closed")]
    ConnectionClosed(String),
}

/// Checkable discriminant of a [`RabbitMQError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    AlreadyExists,
    AlreadyConfigured,
    NotConfigured,
    ReplyChannelNotConfigured,
    Transport,
    Serialization,
    Timeout,
    ConnectionClosed,
}

impl RabbitMQError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RabbitMQError::ValidationError(_) => ErrorKind::Validation,
            RabbitMQError::NotFound { .. } => ErrorKind::NotFound,
            RabbitMQError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            RabbitMQError::AlreadyConfigured { .. } => ErrorKind::AlreadyConfigured,
            RabbitMQError::NotConfigured { .. } => ErrorKind::NotConfigured,
            RabbitMQError::ReplyChannelNotConfigured(_) => ErrorKind::ReplyChannelNotConfigured,
            RabbitMQError::ConnectionError { .. }
            | RabbitMQError::ChannelError(_)
            | RabbitMQError::PublishError(_)
            | RabbitMQError::ConsumeError(_) => ErrorKind::Transport,
            RabbitMQError::SerializationError(_) => ErrorKind::Serialization,
            RabbitMQError::Timeout { .. } | RabbitMQError::TimeoutError(_) => ErrorKind::Timeout,
            RabbitMQError::ConnectionClosed(_) => ErrorKind::ConnectionClosed,
        }
    }

    pub(crate) fn not_found(kind: ResourceKind, name: &str) -> Self {
        RabbitMQError::NotFound {
            kind,
            name: name.to_string(),
        }
    }

    pub(crate) fn already_exists(kind: ResourceKind, name: &str) -> Self {
        RabbitMQError::AlreadyExists {
            kind,
            name: name.to_string(),
        }
    }

    pub(crate) fn connection(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        RabbitMQError::ConnectionError {
            kind,
            message: message.into(),
        }
    }
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

// Converting from lapin errors
impl From<LapinError> for RabbitMQError {
    fn from(error: LapinError) -> Self {
        let message = error.to_string();

        match &error {
            LapinError::IOError(io) => {
                let kind = match io.kind() {
                    IoErrorKind::ConnectionRefused => TransportErrorKind::Refused,
                    IoErrorKind::ConnectionReset
                    | IoErrorKind::ConnectionAborted
                    | IoErrorKind::BrokenPipe
                    | IoErrorKind::UnexpectedEof => TransportErrorKind::Reset,
                    IoErrorKind::NotFound => TransportErrorKind::HostNotFound,
                    // DNS failures surface as untyped io errors
                    _ if message.contains("lookup") || message.contains("resolve") => {
                        TransportErrorKind::HostNotFound
                    }
                    _ => TransportErrorKind::Io,
                };
                RabbitMQError::connection(kind, message)
            }
            LapinError::InvalidConnectionState(_) | LapinError::MissingHeartbeatError => {
                RabbitMQError::connection(TransportErrorKind::Reset, message)
            }
            LapinError::InvalidChannel(_)
            | LapinError::InvalidChannelState(_)
            | LapinError::ChannelsLimitReached => RabbitMQError::ChannelError(message),
            _ => RabbitMQError::connection(TransportErrorKind::Protocol, message),
        }
    }
}

impl From<Elapsed> for RabbitMQError {
    fn from(_: Elapsed) -> Self {
        RabbitMQError::TimeoutError("Connection timed out".to_string())
    }
}

// src/rabbitmq/registry.rs
//
// Top-level entry point: a registry of named connections sharing one connector.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{info, warn};

use super::connection::Connection;
use super::errors::{RabbitMQError, ResourceKind, Result};
use super::lapin_transport::LapinConnector;
use super::lock;
use super::transport::Connector;
use crate::config::ConnectionConfig;

pub struct Broker {
    connector: Arc<dyn Connector>,
    connections: Mutex<Vec<Connection>>,
}

impl Broker {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            connections: Mutex::new(Vec::new()),
        }
    }

    /// A broker that talks AMQP 0-9-1 through lapin.
    pub fn lapin() -> Self {
        Self::new(Arc::new(LapinConnector))
    }

    /// Opens a session and registers it under `name`, which must be unused.
    pub async fn create_connection(&self, name: &str, config: &ConnectionConfig) -> Result<Connection> {
        if self.find_connection(name).is_some() {
            return Err(RabbitMQError::already_exists(ResourceKind::Connection, name));
        }

        let transport = self.connector.connect(config).await?;
        let connection = Connection::new(name, transport);

        let lost_race = {
            let mut connections = lock(&self.connections);
            if connections.iter().any(|c| c.name() == name) {
                true
            } else {
                connections.push(connection.clone());
                false
            }
        };
        if lost_race {
            if let Err(e) = connection.close().await {
                warn!(connection = %name, error = %e, "Failed to close duplicate connection");
            }
            return Err(RabbitMQError::already_exists(ResourceKind::Connection, name));
        }

        info!(connection = %name, host = %config.host, port = config.port, "Created connection");
        Ok(connection)
    }

    pub fn connections(&self) -> Vec<Connection> {
        lock(&self.connections).clone()
    }

    pub fn find_connection(&self, name: &str) -> Option<Connection> {
        lock(&self.connections)
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    pub fn get_connection(&self, name: &str) -> Result<Connection> {
        self.find_connection(name)
            .ok_or_else(|| RabbitMQError::not_found(ResourceKind::Connection, name))
    }

    /// Deregisters and closes the connection. Requests still waiting on it
    /// fail with `ConnectionClosed`.
    pub async fn remove_connection(&self, name: &str) -> Result<()> {
        let connection = {
            let mut connections = lock(&self.connections);
            let position = connections
                .iter()
                .position(|c| c.name() == name)
                .ok_or_else(|| RabbitMQError::not_found(ResourceKind::Connection, name))?;
            connections.remove(position)
        };
        connection.close().await
    }

    /// Answers a request received on `connection_name`'s peers.
    pub async fn reply(&self, connection_name: &str, task_id: &str, result: Value) -> Result<()> {
        self.get_connection(connection_name)?.reply(task_id, result).await
    }

    /// Closes every registered connection, reporting the first failure.
    pub async fn shutdown(&self) -> Result<()> {
        let connections: Vec<Connection> = lock(&self.connections).drain(..).collect();
        let mut first_error = None;
        for connection in connections {
            if let Err(e) = connection.close().await {
                warn!(connection = %connection.name(), error = %e, "Failed to close connection");
                first_error = first_error.or(Some(e));
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::lapin()
    }
}

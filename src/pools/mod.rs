use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::broker::ResponseSink;
use crate::logging::{LogLevel, Logger};
use crate::server::PersistentConnection;
use crate::wire::codec::{CodecError, FrameAccumulator, WireCodec};
use crate::wire::envelope::{ClientAddress, ResponseEnvelope};
use crate::wire::handshake::encode_response_frame;

#[derive(Debug)]
pub enum PoolError {
    ConnectionNotFound { connection_id: u64 },
    Codec { connection_id: u64, source: CodecError },
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionNotFound { connection_id } => {
                write!(f, "client connection {connection_id} not found")
            }
            Self::Codec {
                connection_id,
                source,
            } => write!(f, "broken frame stream on connection {connection_id}: {source}"),
        }
    }
}

impl std::error::Error for PoolError {}

struct ConnectionRecord {
    connection: Arc<PersistentConnection>,
    inbound: FrameAccumulator,
    connected_at: DateTime<Utc>,
    bound_addresses: Vec<ClientAddress>,
}

#[derive(Clone, Debug)]
pub struct ConnectionSnapshot {
    pub connection_id: u64,
    pub connected_at: DateTime<Utc>,
    pub bound_addresses: Vec<ClientAddress>,
}

/// Live client connections and the client addresses bound to them.
///
/// This is the broker's response sink: a response for an address is framed and written to the
/// connection that last bound that address. Bindings die with their connection.
pub struct ClientConnectionPool {
    codec: WireCodec,
    logger: Logger,
    connections: Mutex<HashMap<u64, ConnectionRecord>>,
    bindings: Mutex<HashMap<ClientAddress, u64>>,
}

impl ClientConnectionPool {
    pub fn new(codec: WireCodec, logger: Logger) -> Self {
        Self {
            codec,
            logger,
            connections: Mutex::new(HashMap::new()),
            bindings: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, connection: Arc<PersistentConnection>) -> u64 {
        let connection_id = connection.id();
        self.connections
            .lock()
            .expect("connection pool lock poisoned")
            .insert(
                connection_id,
                ConnectionRecord {
                    connection,
                    inbound: FrameAccumulator::new(),
                    connected_at: Utc::now(),
                    bound_addresses: Vec::new(),
                },
            );
        connection_id
    }

    /// Routes responses for `client_address` to the connection, replacing any earlier binding.
    pub fn bind(&self, client_address: &ClientAddress, connection_id: u64) -> Result<(), PoolError> {
        let mut connections = self.connections.lock().expect("connection pool lock poisoned");
        let record = connections
            .get_mut(&connection_id)
            .ok_or(PoolError::ConnectionNotFound { connection_id })?;
        if !record.bound_addresses.contains(client_address) {
            record.bound_addresses.push(client_address.clone());
        }

        let previous = self
            .bindings
            .lock()
            .expect("binding map lock poisoned")
            .insert(client_address.clone(), connection_id);
        if let Some(previous) = previous.filter(|previous| *previous != connection_id) {
            if let Some(old) = connections.get_mut(&previous) {
                old.bound_addresses.retain(|address| address != client_address);
            }
        }
        Ok(())
    }

    pub fn bound_connection(&self, client_address: &ClientAddress) -> Option<u64> {
        self.bindings
            .lock()
            .expect("binding map lock poisoned")
            .get(client_address)
            .copied()
    }

    /// Buffers inbound bytes and returns every complete frame now available.
    pub fn push_inbound(&self, connection_id: u64, bytes: &[u8]) -> Result<Vec<Vec<u8>>, PoolError> {
        let mut connections = self.connections.lock().expect("connection pool lock poisoned");
        let record = connections
            .get_mut(&connection_id)
            .ok_or(PoolError::ConnectionNotFound { connection_id })?;
        record.inbound.push(bytes);

        let mut frames = Vec::new();
        while let Some(frame) = record
            .inbound
            .next_frame(&self.codec)
            .map_err(|source| PoolError::Codec {
                connection_id,
                source,
            })?
        {
            frames.push(frame);
        }
        Ok(frames)
    }

    pub fn active_connections(&self) -> Vec<(u64, Arc<PersistentConnection>)> {
        self.connections
            .lock()
            .expect("connection pool lock poisoned")
            .iter()
            .map(|(id, record)| (*id, Arc::clone(&record.connection)))
            .collect()
    }

    pub fn snapshot(&self, connection_id: u64) -> Option<ConnectionSnapshot> {
        self.connections
            .lock()
            .expect("connection pool lock poisoned")
            .get(&connection_id)
            .map(|record| ConnectionSnapshot {
                connection_id,
                connected_at: record.connected_at,
                bound_addresses: record.bound_addresses.clone(),
            })
    }

    /// Forgets the connection and its bindings, then shuts the socket down.
    pub fn terminate(&self, connection_id: u64, reason: &str) -> Result<(), PoolError> {
        let record = self
            .connections
            .lock()
            .expect("connection pool lock poisoned")
            .remove(&connection_id)
            .ok_or(PoolError::ConnectionNotFound { connection_id })?;

        let mut bindings = self.bindings.lock().expect("binding map lock poisoned");
        for address in &record.bound_addresses {
            if bindings.get(address) == Some(&connection_id) {
                bindings.remove(address);
            }
        }
        drop(bindings);

        self.logger.log(
            LogLevel::Info,
            Some("pools"),
            "Client connection closed",
            Some(json!({
                "connection_id": connection_id,
                "peer_addr": record.connection.peer_addr().to_string(),
                "bound_addresses": record.bound_addresses.len(),
                "reason": reason,
            })),
        );
        let _ = record.connection.shutdown();
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.connections
            .lock()
            .expect("connection pool lock poisoned")
            .len()
    }

    /// Frames and writes a response straight to a connection, bound or not.
    pub fn send_to_connection(
        &self,
        connection: &PersistentConnection,
        response: ResponseEnvelope,
    ) -> bool {
        let frame = match encode_response_frame(&self.codec, response) {
            Ok(frame) => frame,
            Err(error) => {
                self.logger.log(
                    LogLevel::Error,
                    Some("pools"),
                    "Failed to encode response frame",
                    Some(json!({ "connection_id": connection.id(), "error": error.to_string() })),
                );
                return false;
            }
        };

        match connection.write_frame(&frame) {
            Ok(()) => true,
            Err(error) => {
                self.logger.log(
                    LogLevel::Warn,
                    Some("pools"),
                    "Failed to write response frame",
                    Some(json!({ "connection_id": connection.id(), "error": error.to_string() })),
                );
                false
            }
        }
    }
}

impl ResponseSink for ClientConnectionPool {
    fn deliver(&self, client_address: &ClientAddress, response: ResponseEnvelope) -> bool {
        let connection = {
            let Some(connection_id) = self.bound_connection(client_address) else {
                return false;
            };
            let connections = self.connections.lock().expect("connection pool lock poisoned");
            match connections.get(&connection_id) {
                Some(record) => Arc::clone(&record.connection),
                None => return false,
            }
        };

        if self.send_to_connection(&connection, response) {
            return true;
        }
        let _ = self.terminate(connection.id(), "response write failed");
        false
    }
}

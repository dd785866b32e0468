use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::{AppConfig, ServerConfig};

const WRITE_RETRY_PAUSE: Duration = Duration::from_millis(1);
const WRITE_DEADLINE: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum ServerError {
    Bind {
        address: String,
        source: io::Error,
    },
    SetNonBlocking {
        source: io::Error,
    },
    TlsNotSupported,
    Accept {
        source: io::Error,
    },
    ConfigureAcceptedStream {
        source: io::Error,
    },
    StreamClone {
        source: io::Error,
    },
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { address, source } => {
                write!(f, "failed to bind PPP listener on {address}: {source}")
            }
            Self::SetNonBlocking { source } => {
                write!(f, "failed to set PPP listener to non-blocking mode: {source}")
            }
            Self::TlsNotSupported => {
                write!(f, "server.tls_enabled is set but the PPP transport has no TLS support")
            }
            Self::Accept { source } => write!(f, "failed to accept PPP client: {source}"),
            Self::ConfigureAcceptedStream { source } => {
                write!(f, "failed to configure accepted client stream: {source}")
            }
            Self::StreamClone { source } => {
                write!(f, "failed to clone client stream for full duplex IO: {source}")
            }
        }
    }
}

impl std::error::Error for ServerError {}

/// One client transport: a non-blocking stream split into independently locked halves so the
/// read loop never waits on a response being written.
pub struct PersistentConnection {
    id: u64,
    peer_addr: SocketAddr,
    reader: Mutex<TcpStream>,
    writer: Mutex<TcpStream>,
}

impl PersistentConnection {
    fn new(id: u64, stream: TcpStream, peer_addr: SocketAddr) -> Result<Self, ServerError> {
        stream
            .set_nodelay(true)
            .map_err(|source| ServerError::ConfigureAcceptedStream { source })?;
        stream
            .set_nonblocking(true)
            .map_err(|source| ServerError::ConfigureAcceptedStream { source })?;

        let writer = stream
            .try_clone()
            .map_err(|source| ServerError::StreamClone { source })?;

        Ok(Self {
            id,
            peer_addr,
            reader: Mutex::new(stream),
            writer: Mutex::new(writer),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn try_read(&self, buffer: &mut [u8]) -> io::Result<usize> {
        self.reader
            .lock()
            .expect("connection reader lock poisoned")
            .read(buffer)
    }

    /// Writes the whole frame, retrying while the socket buffer is full. Frames from
    /// concurrent writers never interleave.
    pub fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().expect("connection writer lock poisoned");
        let deadline = Instant::now() + WRITE_DEADLINE;
        let mut written = 0;

        while written < frame.len() {
            match writer.write(&frame[written..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(count) => written += count,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(io::Error::from(io::ErrorKind::TimedOut));
                    }
                    thread::sleep(WRITE_RETRY_PAUSE);
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => return Err(error),
            }
        }
        writer.flush()
    }

    pub fn shutdown(&self) -> io::Result<()> {
        let _ = self
            .reader
            .lock()
            .expect("connection reader lock poisoned")
            .shutdown(Shutdown::Both);
        self.writer
            .lock()
            .expect("connection writer lock poisoned")
            .shutdown(Shutdown::Both)
    }
}

/// Non-blocking PPP listener polled by the main loop.
pub struct TcpServer {
    listener: TcpListener,
    next_connection_id: AtomicU64,
    active_connections: Mutex<HashMap<u64, Arc<PersistentConnection>>>,
}

impl TcpServer {
    pub fn bind(config: &ServerConfig) -> Result<Self, ServerError> {
        if config.tls_enabled {
            return Err(ServerError::TlsNotSupported);
        }

        let address = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&address).map_err(|source| ServerError::Bind {
            address,
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| ServerError::SetNonBlocking { source })?;

        Ok(Self {
            listener,
            next_connection_id: AtomicU64::new(1),
            active_connections: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_app_config(app_config: &AppConfig) -> Result<Self, ServerError> {
        Self::bind(&app_config.server)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// `Ok(None)` when no client is waiting.
    pub fn try_accept(&self) -> Result<Option<Arc<PersistentConnection>>, ServerError> {
        match self.listener.accept() {
            Ok((stream, peer_addr)) => {
                let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                let connection = Arc::new(PersistentConnection::new(id, stream, peer_addr)?);
                self.active_connections
                    .lock()
                    .expect("active connections lock poisoned")
                    .insert(id, Arc::clone(&connection));
                Ok(Some(connection))
            }
            Err(source) if source.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(source) => Err(ServerError::Accept { source }),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.active_connections
            .lock()
            .expect("active connections lock poisoned")
            .len()
    }

    pub fn drop_connection(&self, id: u64) {
        self.active_connections
            .lock()
            .expect("active connections lock poisoned")
            .remove(&id);
    }

    pub fn shutdown_all_connections(&self) {
        let mut connections = self
            .active_connections
            .lock()
            .expect("active connections lock poisoned");

        for connection in connections.values() {
            let _ = connection.shutdown();
        }
        connections.clear();
    }
}

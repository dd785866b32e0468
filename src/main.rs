mod arbiter;
mod broker;
mod capabilities;
mod config;
mod content;
mod events;
mod heartbeat;
mod liveness;
mod logging;
mod pools;
mod server;
mod shutdown;
mod storage;
mod utils;
mod wire;

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::json;

use arbiter::arbiter_from_app_config;
use broker::{BrokerError, BrokerParts, BrokerSettings, RequestBroker};
use capabilities::{CapabilityRegistry, ContentStore, SmsOutbox};
use config::AppConfig;
use content::ContentCache;
use events::{EventEmitter, BROKER_IDLE_EVENT, BROKER_STARTED_EVENT, CLIENT_REMOVED_EVENT};
use heartbeat::Heartbeat;
use logging::{LogLevel, Logger, LoggerConfig};
use pools::ClientConnectionPool;
use server::{PersistentConnection, TcpServer};
use shutdown::ShutdownHooks;
use storage::StorageFacade;
use utils::runtime::{ensure_posix_or_exit, exit_on_startup_error};
use utils::startup_banner::print_startup_banner;
use utils::timing::timed_stage;
use wire::codec::WireCodec;
use wire::session::{evaluate_inbound_frame, InboundAction, SessionError};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const READ_CHUNK_BYTES: usize = 64 * 1024;

fn main() {
    ensure_posix_or_exit();
    print_startup_banner();

    let app_config = AppConfig::load_with_discovery(std::env::args().skip(1))
        .unwrap_or_else(|error| exit_on_startup_error("configuration", error));
    let log_level = LogLevel::from_config_value(&app_config.logging.level).unwrap_or_else(|| {
        exit_on_startup_error(
            "configuration",
            format!(
                "invalid logging.level '{}'. Allowed values: error, warn, info, debug, verbose",
                app_config.logging.level
            ),
        )
    });
    let logger = Logger::new(LoggerConfig {
        min_level: log_level,
        human_friendly: app_config.logging.human_friendly,
    });

    let storage = timed_stage("storage.initialize", Some("main::storage"), &logger, || {
        StorageFacade::initialize(&app_config, &logger)
    })
    .map(Arc::new)
    .unwrap_or_else(|error| exit_on_startup_error("storage initialization", error));

    let codec = WireCodec::from_app_config(&app_config)
        .unwrap_or_else(|error| exit_on_startup_error("wire codec configuration", error));
    let settings = BrokerSettings::from_app_config(&app_config)
        .unwrap_or_else(|error| exit_on_startup_error("broker configuration", error));
    let content = ContentCache::from_app_config(&app_config)
        .map_err(BrokerError::Content)
        .unwrap_or_else(|error| exit_on_startup_error("broker configuration", error));
    let arbiter = arbiter_from_app_config(&app_config, Arc::clone(&storage), logger.clone())
        .unwrap_or_else(|error| exit_on_startup_error("arbiter configuration", error));
    let registry = CapabilityRegistry::with_builtins(ContentStore::default(), SmsOutbox::default());
    logger.log(
        LogLevel::Info,
        Some("main::broker"),
        "Capability registry ready",
        Some(json!({
            "operations": registry.operations(),
            "ack_window_ms": settings.ack_window.as_millis() as u64,
            "recovery_policy": settings.recovery_policy.as_str(),
            "content_policy": content.policy().as_str(),
            "max_envelope_size_bytes": codec.max_envelope_size_bytes(),
        })),
    );

    let emitter = Arc::new(EventEmitter::new());
    let pool = Arc::new(ClientConnectionPool::new(codec, logger.clone()));
    let broker = RequestBroker::new(
        BrokerParts {
            codec,
            registry,
            arbiter,
            storage: Arc::clone(&storage),
            content,
            sink: pool.clone(),
            emitter: Arc::clone(&emitter),
            logger: logger.clone(),
        },
        settings,
    );

    let report = timed_stage("broker.recover", Some("main::recovery"), &logger, || broker.recover())
        .unwrap_or_else(|error| exit_on_startup_error("recovery", error));
    logger.log(
        LogLevel::Info,
        Some("main::recovery"),
        "Persisted ongoing requests re-driven",
        Some(json!({ "restored": report.restored, "dropped": report.dropped })),
    );

    let server = TcpServer::from_app_config(&app_config)
        .unwrap_or_else(|error| exit_on_startup_error("server startup", error));
    let bound_addr = server
        .local_addr()
        .unwrap_or_else(|error| exit_on_startup_error("server startup", error));
    logger.log(
        LogLevel::Info,
        Some("main::server"),
        &format!(
            "{} v{} listening for PPP clients",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ),
        Some(json!({
            "bind_address": bound_addr.to_string(),
            "ack_server_address": broker.ack_server_address(),
        })),
    );

    let shutdown_hooks = ShutdownHooks::install()
        .unwrap_or_else(|error| exit_on_startup_error("shutdown hooks", error));
    register_listeners(&emitter, &broker, &shutdown_hooks, &app_config, &logger);

    let mut heartbeat = Heartbeat::from_app_config(Arc::clone(&emitter), &app_config)
        .unwrap_or_else(|error| exit_on_startup_error("heartbeat configuration", error));
    heartbeat
        .start()
        .unwrap_or_else(|error| exit_on_startup_error("heartbeat", error));
    logger.log(
        LogLevel::Info,
        Some("main::heartbeat"),
        "Heartbeat started",
        Some(heartbeat.initial_metadata_payload()),
    );
    if let Err(error) = emitter.emit(
        BROKER_STARTED_EVENT,
        Some(json!({ "bind_address": bound_addr.to_string() })),
    ) {
        logger.warn(Some("main::events"), &error.to_string());
    }

    while !shutdown_hooks.is_triggered() {
        accept_clients(&server, &pool, &logger);
        for (connection_id, connection) in pool.active_connections() {
            let outcome =
                serve_connection(connection_id, &connection, &pool, &broker, &codec, &logger);
            if let Some(reason) = outcome {
                let _ = pool.terminate(connection_id, &reason);
                server.drop_connection(connection_id);
            }
        }
        thread::sleep(POLL_INTERVAL);
    }

    logger.info(Some("main::shutdown"), "Shutdown requested, stopping broker");
    emitter.begin_shutdown();
    if let Err(error) = heartbeat.stop() {
        logger.warn(Some("main::shutdown"), &error.to_string());
    }
    broker.shutdown();
    if let Err(error) = storage.flush() {
        logger.error(
            Some("main::shutdown"),
            &format!("failed to flush storage: {error}"),
        );
    }
    server.shutdown_all_connections();

    if emitter.wait_for_idle(Duration::from_secs(3)) {
        logger.info(Some("main::shutdown"), "All event listeners completed");
    } else {
        logger.warn(
            Some("main::shutdown"),
            "Listener drain timeout reached; continuing shutdown",
        );
    }
    logger.info(Some("main::shutdown"), "ppp-broker stopped");
}

fn register_listeners(
    emitter: &EventEmitter,
    broker: &RequestBroker,
    shutdown_hooks: &ShutdownHooks,
    app_config: &AppConfig,
    logger: &Logger,
) {
    broker.sweep_on_heartbeat(emitter);

    let removal_logger = logger.clone();
    emitter.on_async(CLIENT_REMOVED_EVENT, move |event| {
        removal_logger.log(
            LogLevel::Info,
            Some("main::broker"),
            "Client removed",
            event.payload,
        );
        Ok(())
    });

    if app_config.broker.exit_when_idle {
        let trigger = shutdown_hooks.trigger_handle();
        let idle_logger = logger.clone();
        emitter.on(BROKER_IDLE_EVENT, move |_| {
            idle_logger.info(Some("main::broker"), "Broker idle; exit_when_idle is set");
            trigger.trigger();
            Ok(())
        });
    }
}

fn accept_clients(server: &TcpServer, pool: &ClientConnectionPool, logger: &Logger) {
    loop {
        match server.try_accept() {
            Ok(Some(connection)) => {
                let peer_addr = connection.peer_addr().to_string();
                let connection_id = pool.register(connection);
                logger.log(
                    LogLevel::Debug,
                    Some("main::server"),
                    "Accepted client connection",
                    Some(json!({
                        "connection_id": connection_id,
                        "peer_addr": peer_addr,
                        "open_connections": server.connection_count(),
                    })),
                );
            }
            Ok(None) => return,
            Err(error) => {
                logger.warn(Some("main::server"), &error.to_string());
                return;
            }
        }
    }
}

/// Drains readable bytes and dispatches complete frames. Returns a reason when the connection
/// must be closed.
fn serve_connection(
    connection_id: u64,
    connection: &Arc<PersistentConnection>,
    pool: &Arc<ClientConnectionPool>,
    broker: &RequestBroker,
    codec: &WireCodec,
    logger: &Logger,
) -> Option<String> {
    let mut buffer = vec![0_u8; READ_CHUNK_BYTES];
    loop {
        let read = match connection.try_read(&mut buffer) {
            Ok(0) => return Some("peer closed the connection".to_owned()),
            Ok(read) => read,
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => return None,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => return Some(format!("socket read error: {error}")),
        };

        let frames = match pool.push_inbound(connection_id, &buffer[..read]) {
            Ok(frames) => frames,
            Err(error) => return Some(error.to_string()),
        };
        for frame in frames {
            match evaluate_inbound_frame(codec, &frame) {
                Ok(action) => dispatch(connection_id, connection, action, pool, broker, logger),
                Err(SessionError::Codec(error)) => {
                    return Some(format!("undecodable frame: {error}"));
                }
                Err(error) => {
                    logger.log(
                        LogLevel::Warn,
                        Some("main::wire"),
                        "Rejected inbound frame",
                        Some(json!({ "connection_id": connection_id, "error": error.to_string() })),
                    );
                    if let Some(rejection) = error.rejection() {
                        pool.send_to_connection(connection, rejection);
                    }
                }
            }
        }
    }
}

fn dispatch(
    connection_id: u64,
    connection: &Arc<PersistentConnection>,
    action: InboundAction,
    pool: &Arc<ClientConnectionPool>,
    broker: &RequestBroker,
    logger: &Logger,
) {
    match action {
        InboundAction::Request(request) => {
            if let Some(client_address) = &request.client_address {
                if let Err(error) = pool.bind(client_address, connection_id) {
                    logger.warn(Some("main::wire"), &error.to_string());
                }
            }
            broker.handle_request(request);
        }
        InboundAction::Ack(ack) => {
            broker.acknowledge(&ack);
        }
        InboundAction::ContentQuery(query) => {
            let pool = Arc::clone(pool);
            let connection = Arc::clone(connection);
            broker.handle_content_query(query, move |response| {
                pool.send_to_connection(&connection, response);
            });
        }
        InboundAction::Listen { client_address } => {
            if let Err(error) = pool.bind(&client_address, connection_id) {
                logger.warn(Some("main::wire"), &error.to_string());
            }
        }
    }
}

mod sessions;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::io;
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use crate::arbiter::{Arbiter, DecisionContext, Verdict};
use crate::capabilities::{
    CapabilityError, CapabilityFactory, CapabilityHandle, CapabilityRegistry, Production,
};
use crate::config::AppConfig;
use crate::content::{ContentCache, ContentEntry, ContentError};
use crate::events::{EventEmitter, BROKER_IDLE_EVENT, CLIENT_REMOVED_EVENT};
use crate::heartbeat::HEARTBEAT_EVENT;
use crate::liveness::AckOutcome;
use crate::logging::{LogLevel, Logger};
use crate::storage::{OngoingEntry, StorageError, StorageFacade};
use crate::wire::codec::WireCodec;
use crate::wire::envelope::{
    AckEnvelope, ClientAddress, ContentQueryEnvelope, EntityError, PayloadMap, RequestEnvelope,
    RequestType, ResponseEnvelope, ServerTag, StatusCode,
};
use crate::wire::handshake::{
    bad_request, capability_failed_close, content_not_found, content_uri, denied, dormant_close,
    nonce_from_uri_path, one_shot_granted, HandshakeFlow, FLOW_MISMATCH_CODE, INTERNAL_ERROR_CODE,
};

pub use sessions::ResponseSink;
use sessions::{Delivery, Outbox, SessionTable};

/// How requests restored from the store are re-authorized after a restart.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryPolicy {
    /// Ask the arbiter again, flagged as restored.
    Reprompt,
    /// Treat the persisted request as already approved.
    TrustPersisted,
}

impl RecoveryPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "reprompt" => Some(Self::Reprompt),
            "trust_persisted" => Some(Self::TrustPersisted),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reprompt => "reprompt",
            Self::TrustPersisted => "trust_persisted",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemovalReason {
    EndOfStream,
    Dormant,
    CapabilityFailed,
    Denied,
    Rejected,
    Explicit,
}

impl RemovalReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EndOfStream => "end_of_stream",
            Self::Dormant => "dormant",
            Self::CapabilityFailed => "capability_failed",
            Self::Denied => "denied",
            Self::Rejected => "rejected",
            Self::Explicit => "explicit",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckDisposition {
    Refreshed,
    UnknownClient,
    /// Addressed at an ack server of a previous broker process.
    StaleServerAddress,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub restored: usize,
    pub dropped: usize,
}

#[derive(Debug)]
pub enum BrokerError {
    UnknownRecoveryPolicy(String),
    ZeroAckWindow,
    Content(ContentError),
    Storage(StorageError),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownRecoveryPolicy(raw) => write!(
                f,
                "unknown broker.recovery_policy '{raw}' (expected reprompt or trust_persisted)"
            ),
            Self::ZeroAckWindow => write!(f, "broker.ack_window_ms must be greater than zero"),
            Self::Content(source) => write!(f, "content cache error: {source}"),
            Self::Storage(source) => write!(f, "broker storage error: {source}"),
        }
    }
}

impl std::error::Error for BrokerError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BrokerSettings {
    pub ack_window: Duration,
    pub recovery_policy: RecoveryPolicy,
}

impl BrokerSettings {
    pub fn from_app_config(config: &AppConfig) -> Result<Self, BrokerError> {
        if config.broker.ack_window_ms == 0 {
            return Err(BrokerError::ZeroAckWindow);
        }
        let recovery_policy = RecoveryPolicy::parse(&config.broker.recovery_policy)
            .ok_or_else(|| BrokerError::UnknownRecoveryPolicy(config.broker.recovery_policy.clone()))?;
        Ok(Self {
            ack_window: Duration::from_millis(config.broker.ack_window_ms),
            recovery_policy,
        })
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            ack_window: Duration::from_secs(10),
            recovery_policy: RecoveryPolicy::Reprompt,
        }
    }
}

/// Collaborators the broker drives but does not own the lifecycle of.
pub struct BrokerParts {
    pub codec: WireCodec,
    pub registry: CapabilityRegistry,
    pub arbiter: Arc<dyn Arbiter>,
    pub storage: Arc<StorageFacade>,
    pub content: ContentCache,
    pub sink: Arc<dyn ResponseSink>,
    pub emitter: Arc<EventEmitter>,
    pub logger: Logger,
}

/// Runs the PPP handshakes, owns the active-client set and evicts dormant clients.
///
/// Every request is processed on its own thread so a blocking arbiter or capability never
/// stalls unrelated clients. Cloning is cheap and shares the same broker.
#[derive(Clone)]
pub struct RequestBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    codec: WireCodec,
    registry: CapabilityRegistry,
    arbiter: Arc<dyn Arbiter>,
    storage: Arc<StorageFacade>,
    content: ContentCache,
    sink: Arc<dyn ResponseSink>,
    emitter: Arc<EventEmitter>,
    logger: Logger,
    recovery_policy: RecoveryPolicy,
    ack_server_address: String,
    table: Mutex<SessionTable>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl RequestBroker {
    pub fn new(parts: BrokerParts, settings: BrokerSettings) -> Self {
        let ack_server_address = format!("ack-{}", Uuid::new_v4().simple());
        Self {
            inner: Arc::new(BrokerInner {
                codec: parts.codec,
                registry: parts.registry,
                arbiter: parts.arbiter,
                storage: parts.storage,
                content: parts.content,
                sink: parts.sink,
                emitter: parts.emitter,
                logger: parts.logger,
                recovery_policy: settings.recovery_policy,
                ack_server_address,
                table: Mutex::new(SessionTable::new(settings.ack_window)),
                workers: Mutex::new(Vec::new()),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Address acks must carry; fresh for every broker process.
    pub fn ack_server_address(&self) -> &str {
        &self.inner.ack_server_address
    }

    /// Sorted snapshot of the active-client set.
    pub fn active_clients(&self) -> Vec<ClientAddress> {
        self.inner.table().addresses()
    }

    pub fn active_request(&self, client_address: &ClientAddress) -> Option<RequestEnvelope> {
        self.inner.table().request(client_address).cloned()
    }

    /// Accepts a decoded request and processes it on a worker thread.
    pub fn handle_request(&self, request: RequestEnvelope) {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            self.inner.logger.log(
                LogLevel::Warn,
                Some("broker::request"),
                "Dropping request received during shutdown",
                Some(request_payload(&request)),
            );
            return;
        }
        self.spawn_processing(request, false);
    }

    /// Second phase of the content handshake. The read runs on a worker thread and its single
    /// response is handed to `respond`.
    pub fn handle_content_query<F>(&self, query: ContentQueryEnvelope, respond: F)
    where
        F: FnOnce(ResponseEnvelope) + Send + 'static,
    {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            self.inner.logger.log(
                LogLevel::Warn,
                Some("broker::content"),
                "Dropping content query received during shutdown",
                Some(json!({ "uri_path": query.uri_path })),
            );
            return;
        }

        let uri_path = query.uri_path;
        let responder = Arc::new(Mutex::new(Some(respond)));
        let worker_responder = responder.clone();
        let worker_uri = uri_path.clone();
        let spawned = self.spawn_worker("ppp-content".to_owned(), move |inner| {
            let response = inner.read_content(&worker_uri);
            if let Some(respond) = worker_responder.lock().expect("content responder poisoned").take() {
                respond(response);
            }
        });
        if let Err(err) = spawned {
            self.inner.logger.log(
                LogLevel::Error,
                Some("broker::content"),
                "Failed to spawn content worker",
                Some(json!({ "uri_path": uri_path, "error": err.to_string() })),
            );
            if let Some(respond) = responder.lock().expect("content responder poisoned").take() {
                respond(ResponseEnvelope::failure(
                    StatusCode::BadRequest,
                    ServerTag::ContentProvider,
                    EntityError::new(INTERNAL_ERROR_CODE, err.to_string()),
                ));
            }
        }
    }

    pub fn acknowledge(&self, ack: &AckEnvelope) -> AckDisposition {
        if ack.ack_server_address != self.inner.ack_server_address {
            self.inner.logger.log(
                LogLevel::Debug,
                Some("broker::liveness"),
                "Dropping ack addressed at a stale ack server",
                Some(json!({
                    "client_address": ack.client_address.as_str(),
                    "ack_server_address": ack.ack_server_address,
                })),
            );
            return AckDisposition::StaleServerAddress;
        }

        match self.inner.table().ack(&ack.client_address, Instant::now()) {
            AckOutcome::Refreshed => AckDisposition::Refreshed,
            AckOutcome::Unknown => {
                self.inner.logger.log(
                    LogLevel::Debug,
                    Some("broker::liveness"),
                    "Dropping ack from unknown client",
                    Some(json!({ "client_address": ack.client_address.as_str() })),
                );
                AckDisposition::UnknownClient
            }
        }
    }

    /// Evicts every client whose ack deadline passed; returns how many were evicted.
    pub fn sweep_dormant(&self, now: Instant) -> usize {
        let dormant = self.inner.table().sweep(now);
        for (client_address, generation) in &dormant {
            self.inner.logger.log(
                LogLevel::Info,
                Some("broker::liveness"),
                "Evicting dormant client",
                Some(json!({ "client_address": client_address.as_str() })),
            );
            self.inner
                .remove(client_address, Some(*generation), RemovalReason::Dormant, |server| {
                    Some(dormant_close(server))
                });
        }
        dormant.len()
    }

    /// Drops expired content nonces; driven by the heartbeat.
    pub fn purge_content(&self, now: Instant) -> usize {
        self.inner.content.purge_expired(now)
    }

    /// Runs the dormancy sweep and the content purge on every heartbeat tick of `emitter`.
    pub fn sweep_on_heartbeat(&self, emitter: &EventEmitter) {
        let inner: Weak<BrokerInner> = Arc::downgrade(&self.inner);
        emitter.on(HEARTBEAT_EVENT, move |event| {
            let Some(inner) = inner.upgrade() else {
                return Ok(());
            };
            let broker = RequestBroker { inner };
            let now = Instant::now();
            let evicted = broker.sweep_dormant(now);
            let purged = broker.purge_content(now);
            if evicted > 0 || purged > 0 {
                broker.inner.logger.log(
                    LogLevel::Debug,
                    Some("broker::liveness"),
                    "Heartbeat sweep finished",
                    Some(json!({
                        "tick": event.payload.as_ref().and_then(|payload| payload.get("tick")),
                        "evicted": evicted,
                        "purged_nonces": purged,
                    })),
                );
            }
            Ok(())
        });
    }

    /// Cancels and forgets a client. Returns `false` when the address was not active.
    pub fn remove_client(&self, client_address: &ClientAddress) -> bool {
        self.inner
            .remove(client_address, None, RemovalReason::Explicit, |_| None)
    }

    /// Re-drives every persisted ongoing request. Call once, before accepting traffic.
    pub fn recover(&self) -> Result<RecoveryReport, BrokerError> {
        let entries = self.inner.storage.load_ongoing().map_err(BrokerError::Storage)?;
        let mut report = RecoveryReport::default();

        for entry in entries {
            match self.inner.restorable(entry) {
                Ok(request) => {
                    report.restored += 1;
                    self.spawn_processing(request, true);
                }
                Err((client_address, reason)) => {
                    report.dropped += 1;
                    self.inner.logger.log(
                        LogLevel::Warn,
                        Some("broker::recovery"),
                        "StoreInconsistency: dropping persisted ongoing request",
                        Some(json!({ "client_address": client_address, "reason": reason })),
                    );
                    if let Err(err) = self.inner.storage.delete_ongoing(&client_address) {
                        self.inner.logger.log(
                            LogLevel::Error,
                            Some("broker::recovery"),
                            "Failed to delete inconsistent store entry",
                            Some(json!({ "client_address": client_address, "error": err.to_string() })),
                        );
                    }
                }
            }
        }

        self.inner.logger.log(
            LogLevel::Info,
            Some("broker::recovery"),
            "Recovery finished",
            Some(json!({
                "restored": report.restored,
                "dropped": report.dropped,
                "policy": self.inner.recovery_policy.as_str(),
            })),
        );
        Ok(report)
    }

    /// Stops every running capability without touching the store, so the streams are
    /// recovered by the next process, then waits for the worker threads.
    pub fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let sessions = self.inner.table().drain();
        for session in &sessions {
            session.outbox.close_silently();
            if let Some(handle) = &session.handle {
                handle.cancel();
            }
        }

        let workers: Vec<JoinHandle<()>> = self
            .inner
            .workers
            .lock()
            .expect("broker workers mutex poisoned")
            .drain(..)
            .collect();
        for worker in workers {
            if worker.join().is_err() {
                self.inner.logger.error(Some("broker"), "Request worker panicked");
            }
        }
        self.inner.logger.log(
            LogLevel::Info,
            Some("broker"),
            "Broker stopped",
            Some(json!({ "cancelled_sessions": sessions.len() })),
        );
    }

    /// Runs `job` on a named thread that `shutdown` joins.
    fn spawn_worker<F>(&self, thread_name: String, job: F) -> io::Result<()>
    where
        F: FnOnce(&Arc<BrokerInner>) + Send + 'static,
    {
        let inner = self.inner.clone();
        let worker = thread::Builder::new()
            .name(thread_name)
            .spawn(move || job(&inner))?;

        let mut workers = self
            .inner
            .workers
            .lock()
            .expect("broker workers mutex poisoned");
        workers.retain(|worker| !worker.is_finished());
        workers.push(worker);
        Ok(())
    }

    fn spawn_processing(&self, request: RequestEnvelope, restored: bool) {
        let thread_name = match &request.client_address {
            Some(address) => format!("ppp-request-{address}"),
            None => "ppp-request".to_owned(),
        };
        let fallback_address = request.client_address.clone();

        let spawned =
            self.spawn_worker(thread_name, move |inner| inner.process(request, restored));
        match spawned {
            Ok(()) => {}
            Err(err) => {
                self.inner.logger.log(
                    LogLevel::Error,
                    Some("broker::request"),
                    "Failed to spawn request worker",
                    Some(json!({ "error": err.to_string() })),
                );
                if let Some(address) = fallback_address {
                    self.inner.sink.deliver(
                        &address,
                        bad_request(EntityError::new(INTERNAL_ERROR_CODE, err.to_string())),
                    );
                }
            }
        }
    }
}

impl BrokerInner {
    fn table(&self) -> std::sync::MutexGuard<'_, SessionTable> {
        self.table.lock().expect("broker session table mutex poisoned")
    }

    fn process(self: &Arc<Self>, request: RequestEnvelope, restored: bool) {
        let factory = match self.registry.resolve(request.operation()) {
            Ok(factory) => factory,
            Err(err) => {
                self.reply(&request, bad_request(err.to_entity_error()));
                return;
            }
        };

        let expected_type = match factory.flow() {
            HandshakeFlow::Content => RequestType::Content,
            HandshakeFlow::OneShot | HandshakeFlow::Ongoing => RequestType::Simple,
        };
        if request.request_type != expected_type {
            self.reply(
                &request,
                bad_request(EntityError::new(
                    FLOW_MISMATCH_CODE,
                    format!(
                        "operation '{}' requires request type {}",
                        request.operation(),
                        expected_type.as_str()
                    ),
                )),
            );
            return;
        }

        match factory.flow() {
            HandshakeFlow::OneShot => self.process_one_shot(factory.as_ref(), &request),
            HandshakeFlow::Content => self.process_content(factory.as_ref(), &request),
            HandshakeFlow::Ongoing => self.process_ongoing(factory.as_ref(), request, restored),
        }
    }

    fn process_one_shot(&self, factory: &dyn CapabilityFactory, request: &RequestEnvelope) {
        if let Some(refusal) = self.arbitrate(request, false) {
            self.reply(request, refusal);
            return;
        }

        let response = factory
            .create(request.client_address.as_ref(), &request.params)
            .and_then(|handle| one_shot_resource(handle.as_ref()))
            .map(one_shot_granted)
            .unwrap_or_else(|err| bad_request(err.to_entity_error()));
        self.reply(request, response);
    }

    fn process_content(&self, factory: &dyn CapabilityFactory, request: &RequestEnvelope) {
        if let Some(refusal) = self.arbitrate(request, false) {
            self.reply(request, refusal);
            return;
        }

        // Validates the arguments now; the read itself happens on the second request.
        if let Err(err) = factory.create(request.client_address.as_ref(), &request.params) {
            self.reply(request, bad_request(err.to_entity_error()));
            return;
        }

        let nonce = self.content.store(ContentEntry {
            sender_identity: request.sender_identity.clone(),
            params: request.params.clone(),
        });
        self.logger.log(
            LogLevel::Debug,
            Some("broker::content"),
            "Content request authorized",
            Some(json!({ "sender": request.sender_identity, "policy": self.content.policy().as_str() })),
        );
        self.reply(request, ResponseEnvelope::content_authorized(content_uri(&nonce)));
    }

    fn process_ongoing(
        self: &Arc<Self>,
        factory: &dyn CapabilityFactory,
        request: RequestEnvelope,
        restored: bool,
    ) {
        let Some(client_address) = request.client_address.clone() else {
            self.logger.log(
                LogLevel::Warn,
                Some("broker::ongoing"),
                "Dropping ongoing request without Client-Address",
                Some(request_payload(&request)),
            );
            return;
        };

        let outbox = Arc::new(Outbox::new(client_address.clone(), self.sink.clone()));
        let server_tag = factory.server_tag();
        let Some(generation) =
            self.table()
                .reserve(request.clone(), client_address.clone(), server_tag, outbox.clone())
        else {
            // The address is shared with the running stream, so nothing is sent on it.
            self.logger.log(
                LogLevel::Error,
                Some("broker::ongoing"),
                "Dropping ongoing request for an address with an active session",
                Some(request_payload(&request)),
            );
            return;
        };

        if !restored {
            let persisted = request
                .encode(&self.codec)
                .map_err(|err| err.to_string())
                .and_then(|payload| {
                    self.storage
                        .put_ongoing(client_address.as_str(), payload)
                        .map_err(|err| err.to_string())
                });
            if let Err(message) = persisted {
                self.logger.log(
                    LogLevel::Error,
                    Some("broker::ongoing"),
                    "Failed to persist ongoing request",
                    Some(json!({ "client_address": client_address.as_str(), "error": message })),
                );
                self.remove(&client_address, Some(generation), RemovalReason::Rejected, |_| {
                    Some(bad_request(EntityError::new(INTERNAL_ERROR_CODE, message)))
                });
                return;
            }
        }

        if let Some(refusal) = self.arbitrate(&request, restored) {
            self.remove(&client_address, Some(generation), RemovalReason::Denied, |_| {
                Some(refusal)
            });
            return;
        }

        let handle = match factory
            .create(Some(&client_address), &request.params)
            .and_then(|handle| handle.authorize().map(|_| handle))
        {
            Ok(handle) => handle,
            Err(err) => {
                self.remove(&client_address, Some(generation), RemovalReason::Rejected, |_| {
                    Some(bad_request(err.to_entity_error()))
                });
                return;
            }
        };

        if outbox.send(ResponseEnvelope::stream_authorized()) == Delivery::NoSink {
            self.log_undelivered(&client_address);
        }
        if !self
            .table()
            .activate(&client_address, generation, handle.clone(), Instant::now())
        {
            handle.cancel();
            return;
        }
        self.logger.log(
            LogLevel::Info,
            Some("broker::ongoing"),
            "Stream started",
            Some(json!({
                "client_address": client_address.as_str(),
                "operation": request.operation(),
                "restored": restored,
            })),
        );

        self.pump(&client_address, generation, server_tag, &outbox, handle.as_ref());
    }

    /// Forwards samples until the stream ends, fails or is cancelled.
    fn pump(
        &self,
        client_address: &ClientAddress,
        generation: u64,
        server_tag: ServerTag,
        outbox: &Outbox,
        handle: &dyn CapabilityHandle,
    ) {
        loop {
            match handle.produce_next() {
                Ok(Production::Sample(body)) => {
                    let resource =
                        ResponseEnvelope::resource(server_tag, body, &self.ack_server_address);
                    match outbox.send(resource) {
                        Delivery::Delivered => {}
                        Delivery::NoSink => self.log_undelivered(client_address),
                        Delivery::AlreadyClosed => return,
                    }
                }
                Ok(Production::EndOfStream) => {
                    self.remove(
                        client_address,
                        Some(generation),
                        RemovalReason::EndOfStream,
                        |server| Some(ResponseEnvelope::stream_ended(server)),
                    );
                    return;
                }
                Err(CapabilityError::Cancelled) => return,
                Err(err) => {
                    self.logger.log(
                        LogLevel::Warn,
                        Some("broker::ongoing"),
                        "Capability failed mid-stream",
                        Some(json!({ "client_address": client_address.as_str(), "error": err.to_string() })),
                    );
                    let message = err.to_string();
                    self.remove(
                        client_address,
                        Some(generation),
                        RemovalReason::CapabilityFailed,
                        |server| Some(capability_failed_close(server, message)),
                    );
                    return;
                }
            }
        }
    }

    /// `None` when allowed, otherwise the 403 to send.
    fn arbitrate(&self, request: &RequestEnvelope, restored: bool) -> Option<ResponseEnvelope> {
        if restored && self.recovery_policy == RecoveryPolicy::TrustPersisted {
            return None;
        }

        let decision = self
            .arbiter
            .decide(request, &DecisionContext { restored });
        match decision.verdict {
            Verdict::Allow => None,
            Verdict::Deny { reason } => {
                self.logger.log(
                    LogLevel::Info,
                    Some("broker::request"),
                    "Request denied",
                    Some(request_payload(request)),
                );
                Some(denied(reason))
            }
        }
    }

    /// Detaches the session, sends the final response built by `closing`, cancels the handle
    /// and deletes the persisted request. Emits the removal and idle events for sessions that
    /// were streaming.
    fn remove<F>(
        &self,
        client_address: &ClientAddress,
        generation: Option<u64>,
        reason: RemovalReason,
        closing: F,
    ) -> bool
    where
        F: FnOnce(ServerTag) -> Option<ResponseEnvelope>,
    {
        let Some(detached) = self.table().detach(client_address, generation) else {
            return false;
        };

        match closing(detached.server_tag) {
            Some(response) => {
                if detached.outbox.send(response) == Delivery::NoSink {
                    self.log_undelivered(client_address);
                }
                detached.outbox.close_silently();
            }
            None => detached.outbox.close_silently(),
        }
        if let Some(handle) = &detached.handle {
            handle.cancel();
        }
        if let Err(err) = self.storage.delete_ongoing(client_address.as_str()) {
            self.logger.log(
                LogLevel::Error,
                Some("broker::ongoing"),
                "Failed to delete persisted ongoing request",
                Some(json!({ "client_address": client_address.as_str(), "error": err.to_string() })),
            );
        }

        if detached.handle.is_none() {
            self.logger.log(
                LogLevel::Debug,
                Some("broker::ongoing"),
                "Released reservation of a stream that never started",
                Some(json!({ "client_address": client_address.as_str(), "reason": reason.as_str() })),
            );
            return true;
        }

        self.emit(
            CLIENT_REMOVED_EVENT,
            json!({ "client_address": client_address.as_str(), "reason": reason.as_str() }),
        );
        if detached.now_empty {
            self.emit(BROKER_IDLE_EVENT, json!({ "last_client_address": client_address.as_str() }));
        }
        true
    }

    fn read_content(&self, uri_path: &str) -> ResponseEnvelope {
        let Some(entry) = nonce_from_uri_path(uri_path).and_then(|nonce| self.content.take(nonce))
        else {
            self.logger.log(
                LogLevel::Debug,
                Some("broker::content"),
                "Content query for unknown nonce",
                Some(json!({ "uri_path": uri_path })),
            );
            return content_not_found(uri_path);
        };

        let result = self
            .registry
            .resolve(&entry.params.operation)
            .and_then(|factory| factory.create(None, &entry.params))
            .and_then(|handle| handle.produce_next());
        match result {
            Ok(Production::Sample(body)) => ResponseEnvelope::ok_close(ServerTag::ContentProvider, body),
            Ok(Production::EndOfStream) => {
                ResponseEnvelope::ok_close(ServerTag::ContentProvider, PayloadMap::new())
            }
            Err(err) => ResponseEnvelope::failure(
                StatusCode::BadRequest,
                ServerTag::ContentProvider,
                err.to_entity_error(),
            ),
        }
    }

    /// Checks a store entry can be re-driven; errors carry the address and reason to log.
    fn restorable(&self, entry: OngoingEntry) -> Result<RequestEnvelope, (String, String)> {
        let record = match entry {
            OngoingEntry::Valid(record) => record,
            OngoingEntry::Corrupt {
                client_address,
                reason,
            } => return Err((client_address, reason)),
        };

        let request = RequestEnvelope::decode(&self.codec, &record.envelope)
            .map_err(|err| (record.client_address.clone(), format!("undecodable envelope: {err}")))?;
        if request.client_address.as_ref().map(ClientAddress::as_str)
            != Some(record.client_address.as_str())
        {
            return Err((
                record.client_address,
                "envelope Client-Address does not match its key".to_owned(),
            ));
        }

        match self.registry.resolve(request.operation()) {
            Ok(factory) if factory.flow() == HandshakeFlow::Ongoing => Ok(request),
            Ok(factory) => Err((
                record.client_address,
                format!(
                    "operation '{}' is a {} capability",
                    request.operation(),
                    factory.flow().as_str()
                ),
            )),
            Err(err) => Err((record.client_address, err.to_string())),
        }
    }

    fn reply(&self, request: &RequestEnvelope, response: ResponseEnvelope) {
        let Some(client_address) = &request.client_address else {
            self.logger.log(
                LogLevel::Debug,
                Some("broker::request"),
                "Fire-and-forget request finished without a response",
                Some(json!({ "operation": request.operation(), "status": response.status().code() })),
            );
            return;
        };
        if !self.sink.deliver(client_address, response) {
            self.log_undelivered(client_address);
        }
    }

    fn log_undelivered(&self, client_address: &ClientAddress) {
        self.logger.log(
            LogLevel::Debug,
            Some("broker"),
            "No sink bound for client; response dropped",
            Some(json!({ "client_address": client_address.as_str() })),
        );
    }

    fn emit(&self, event: &str, payload: JsonValue) {
        if let Err(err) = self.emitter.emit(event, Some(payload)) {
            self.logger.log(
                LogLevel::Warn,
                Some("broker"),
                "Event listener failed",
                Some(json!({ "event": event, "error": err.to_string() })),
            );
        }
    }
}

/// Resource of a one-shot capability: from `authorize`, or the first produced sample.
fn one_shot_resource(handle: &dyn CapabilityHandle) -> Result<PayloadMap, CapabilityError> {
    if let Some(resource) = handle.authorize()? {
        return Ok(resource);
    }
    match handle.produce_next()? {
        Production::Sample(resource) => Ok(resource),
        Production::EndOfStream => Ok(PayloadMap::new()),
    }
}

fn request_payload(request: &RequestEnvelope) -> JsonValue {
    json!({
        "client_address": request.client_address.as_ref().map(ClientAddress::as_str),
        "sender": request.sender_identity,
        "operation": request.operation(),
        "reason": request.reason,
    })
}

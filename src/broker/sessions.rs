use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::capabilities::CapabilityHandle;
use crate::liveness::{AckOutcome, LivenessTracker};
use crate::wire::envelope::{ClientAddress, RequestEnvelope, ResponseEnvelope, ServerTag};

/// Delivers responses to whatever transport endpoint is bound to a client address.
pub trait ResponseSink: Send + Sync {
    /// Returns `false` when nothing is bound to the address and the response was dropped.
    fn deliver(&self, client_address: &ClientAddress, response: ResponseEnvelope) -> bool;
}

/// Per-client ordered response channel; nothing is sent after a close.
pub(crate) struct Outbox {
    client_address: ClientAddress,
    sink: Arc<dyn ResponseSink>,
    closed: Mutex<bool>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Delivery {
    Delivered,
    NoSink,
    AlreadyClosed,
}

impl Outbox {
    pub(crate) fn new(client_address: ClientAddress, sink: Arc<dyn ResponseSink>) -> Self {
        Self {
            client_address,
            sink,
            closed: Mutex::new(false),
        }
    }

    pub(crate) fn send(&self, response: ResponseEnvelope) -> Delivery {
        let mut closed = self.closed.lock().expect("outbox mutex poisoned");
        if *closed {
            return Delivery::AlreadyClosed;
        }
        if response.is_close() {
            *closed = true;
        }
        if self.sink.deliver(&self.client_address, response) {
            Delivery::Delivered
        } else {
            Delivery::NoSink
        }
    }

    pub(crate) fn close_silently(&self) {
        *self.closed.lock().expect("outbox mutex poisoned") = true;
    }
}

pub(crate) struct Session {
    pub(crate) generation: u64,
    pub(crate) request: RequestEnvelope,
    pub(crate) server_tag: ServerTag,
    pub(crate) outbox: Arc<Outbox>,
    /// `None` while authorization is still running.
    pub(crate) handle: Option<Arc<dyn CapabilityHandle>>,
}

/// What a removal hands back for teardown outside the table lock.
pub(crate) struct Detached {
    pub(crate) outbox: Arc<Outbox>,
    pub(crate) server_tag: ServerTag,
    /// `None` when the session never got past authorization.
    pub(crate) handle: Option<Arc<dyn CapabilityHandle>>,
    /// No activated session is left; pending reservations do not count.
    pub(crate) now_empty: bool,
}

/// Active-client set and liveness deadlines. Always used behind the broker's single mutex.
pub(crate) struct SessionTable {
    sessions: HashMap<ClientAddress, Session>,
    liveness: LivenessTracker,
    next_generation: u64,
}

impl SessionTable {
    pub(crate) fn new(ack_window: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            liveness: LivenessTracker::new(ack_window),
            next_generation: 1,
        }
    }

    /// Reserves the address for a new session; `None` when it is already taken.
    pub(crate) fn reserve(
        &mut self,
        request: RequestEnvelope,
        client_address: ClientAddress,
        server_tag: ServerTag,
        outbox: Arc<Outbox>,
    ) -> Option<u64> {
        if self.sessions.contains_key(&client_address) {
            return None;
        }

        let generation = self.next_generation;
        self.next_generation += 1;
        self.sessions.insert(
            client_address,
            Session {
                generation,
                request,
                server_tag,
                outbox,
                handle: None,
            },
        );
        Some(generation)
    }

    /// Attaches the running handle and starts the ack countdown. Fails when the session was
    /// removed while authorization ran.
    pub(crate) fn activate(
        &mut self,
        client_address: &ClientAddress,
        generation: u64,
        handle: Arc<dyn CapabilityHandle>,
        now: Instant,
    ) -> bool {
        match self.sessions.get_mut(client_address) {
            Some(session) if session.generation == generation => {
                session.handle = Some(handle);
                self.liveness.register(client_address.clone(), now);
                true
            }
            _ => false,
        }
    }

    /// Removes the session; with `Some(generation)` only that incarnation is removed.
    pub(crate) fn detach(
        &mut self,
        client_address: &ClientAddress,
        generation: Option<u64>,
    ) -> Option<Detached> {
        let matches = self
            .sessions
            .get(client_address)
            .is_some_and(|session| generation.map_or(true, |expected| session.generation == expected));
        if !matches {
            return None;
        }

        let session = self.sessions.remove(client_address)?;
        self.liveness.unregister(client_address);
        Some(Detached {
            outbox: session.outbox,
            server_tag: session.server_tag,
            handle: session.handle,
            now_empty: self.sessions.values().all(|other| other.handle.is_none()),
        })
    }

    pub(crate) fn ack(&mut self, client_address: &ClientAddress, now: Instant) -> AckOutcome {
        self.liveness.ack(client_address, now)
    }

    pub(crate) fn sweep(&mut self, now: Instant) -> Vec<(ClientAddress, u64)> {
        self.liveness
            .sweep(now)
            .into_iter()
            .filter_map(|address| {
                let generation = self.sessions.get(&address)?.generation;
                Some((address, generation))
            })
            .collect()
    }

    pub(crate) fn addresses(&self) -> Vec<ClientAddress> {
        let mut addresses: Vec<ClientAddress> = self.sessions.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub(crate) fn request(&self, client_address: &ClientAddress) -> Option<&RequestEnvelope> {
        self.sessions.get(client_address).map(|session| &session.request)
    }

    pub(crate) fn drain(&mut self) -> Vec<Session> {
        let sessions = self.sessions.drain().map(|(_, session)| session).collect();
        self.liveness = LivenessTracker::new(self.liveness.ack_window());
        sessions
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use crate::capabilities::{CapabilityError, CapabilityHandle, Production};
    use crate::liveness::AckOutcome;
    use crate::wire::envelope::{
        ClientAddress, PayloadMap, RequestEnvelope, RequestParams, RequestType, ResponseEnvelope,
        ServerTag,
    };

    use super::{Delivery, Outbox, ResponseSink, SessionTable};

    #[derive(Default)]
    struct VecSink {
        delivered: Mutex<Vec<ResponseEnvelope>>,
    }

    impl ResponseSink for VecSink {
        fn deliver(&self, _client_address: &ClientAddress, response: ResponseEnvelope) -> bool {
            self.delivered.lock().expect("sink mutex poisoned").push(response);
            true
        }
    }

    struct IdleHandle;

    impl CapabilityHandle for IdleHandle {
        fn authorize(&self) -> Result<Option<PayloadMap>, CapabilityError> {
            Ok(None)
        }

        fn produce_next(&self) -> Result<Production, CapabilityError> {
            Ok(Production::EndOfStream)
        }

        fn cancel(&self) {}
    }

    fn address(raw: &str) -> ClientAddress {
        ClientAddress::new(raw).expect("address should be valid")
    }

    fn request(raw: &str) -> RequestEnvelope {
        RequestEnvelope::new(
            Some(address(raw)),
            "com.example.maps",
            RequestType::Simple,
            RequestParams::new("RequestLocationUpdates"),
        )
    }

    fn outbox(raw: &str, sink: &Arc<VecSink>) -> Arc<Outbox> {
        Arc::new(Outbox::new(address(raw), sink.clone()))
    }

    #[test]
    fn outbox_refuses_to_send_after_close() {
        let sink = Arc::new(VecSink::default());
        let outbox = outbox("a", &sink);

        assert_eq!(outbox.send(ResponseEnvelope::stream_authorized()), Delivery::Delivered);
        assert_eq!(
            outbox.send(ResponseEnvelope::stream_ended(ServerTag::LocationService)),
            Delivery::Delivered
        );
        assert_eq!(
            outbox.send(ResponseEnvelope::resource(
                ServerTag::LocationService,
                PayloadMap::new(),
                "ack"
            )),
            Delivery::AlreadyClosed
        );
        assert_eq!(sink.delivered.lock().expect("sink mutex poisoned").len(), 2);
    }

    #[test]
    fn reserved_address_is_exclusive_until_detached() {
        let sink = Arc::new(VecSink::default());
        let mut table = SessionTable::new(Duration::from_secs(10));

        let first = table
            .reserve(request("a"), address("a"), ServerTag::LocationService, outbox("a", &sink))
            .expect("first reservation should succeed");
        assert!(table
            .reserve(request("a"), address("a"), ServerTag::LocationService, outbox("a", &sink))
            .is_none());

        assert!(table.detach(&address("a"), Some(first + 1)).is_none());
        let detached = table
            .detach(&address("a"), Some(first))
            .expect("matching generation should detach");
        assert!(detached.now_empty);
        assert!(detached.handle.is_none());
    }

    #[test]
    fn pending_reservations_do_not_keep_the_table_busy() {
        let sink = Arc::new(VecSink::default());
        let mut table = SessionTable::new(Duration::from_secs(10));
        let now = Instant::now();
        let a = table
            .reserve(request("a"), address("a"), ServerTag::LocationService, outbox("a", &sink))
            .expect("reservation should succeed");
        table
            .reserve(request("b"), address("b"), ServerTag::LocationService, outbox("b", &sink))
            .expect("reservation should succeed");
        assert!(table.activate(&address("a"), a, Arc::new(IdleHandle), now));

        let detached = table
            .detach(&address("a"), None)
            .expect("active session should detach");
        assert!(detached.handle.is_some());
        assert!(detached.now_empty);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn activation_after_removal_is_refused() {
        let sink = Arc::new(VecSink::default());
        let mut table = SessionTable::new(Duration::from_secs(10));
        let now = Instant::now();
        let generation = table
            .reserve(request("a"), address("a"), ServerTag::LocationService, outbox("a", &sink))
            .expect("reservation should succeed");
        table.detach(&address("a"), None);

        assert!(!table.activate(&address("a"), generation, Arc::new(IdleHandle), now));
        assert_eq!(table.ack(&address("a"), now), AckOutcome::Unknown);
    }

    #[test]
    fn sweep_reports_only_activated_sessions() {
        let sink = Arc::new(VecSink::default());
        let mut table = SessionTable::new(Duration::from_millis(100));
        let now = Instant::now();
        let a = table
            .reserve(request("a"), address("a"), ServerTag::LocationService, outbox("a", &sink))
            .expect("reservation should succeed");
        table
            .reserve(request("b"), address("b"), ServerTag::LocationService, outbox("b", &sink))
            .expect("reservation should succeed");
        assert!(table.activate(&address("a"), a, Arc::new(IdleHandle), now));

        assert_eq!(
            table.sweep(now + Duration::from_millis(150)),
            vec![(address("a"), a)]
        );
        assert_eq!(table.len(), 2);
        assert_eq!(table.addresses(), vec![address("a"), address("b")]);
    }
}

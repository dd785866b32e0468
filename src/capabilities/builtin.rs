//! Simulated providers for the operations the broker ships with.
//!
//! They stand in for the platform services (Wi-Fi, SMS, location, content stores) and can be
//! replaced by registering a factory under the same operation code.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use rmpv::Value;

use crate::wire::envelope::{map_value, ClientAddress, PayloadMap, RequestParams, ServerTag};
use crate::wire::handshake::HandshakeFlow;

use super::{CapabilityError, CapabilityFactory, CapabilityHandle, Production};

pub const DEFAULT_MIN_TIME_MS: u64 = 1_000;
const MIN_TIME_FLOOR_MS: u64 = 10;

fn invalid(operation: &str, message: impl Into<String>) -> CapabilityError {
    CapabilityError::InvalidArguments {
        operation: operation.to_owned(),
        message: message.into(),
    }
}

fn required_str<'a>(
    operation: &str,
    params: &'a RequestParams,
    name: &str,
) -> Result<&'a str, CapabilityError> {
    match params.arg_str(name) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(invalid(operation, format!("missing string argument '{name}'"))),
    }
}

fn body(entries: impl IntoIterator<Item = (&'static str, Value)>) -> PayloadMap {
    entries
        .into_iter()
        .map(|(key, value)| (key.to_owned(), value))
        .collect()
}

/// Returns a fixed resource once.
struct StaticHandle {
    resource: PayloadMap,
}

impl CapabilityHandle for StaticHandle {
    fn authorize(&self) -> Result<Option<PayloadMap>, CapabilityError> {
        Ok(Some(self.resource.clone()))
    }

    fn produce_next(&self) -> Result<Production, CapabilityError> {
        Ok(Production::EndOfStream)
    }

    fn cancel(&self) {}
}

pub struct ConnectionInfoFactory;

impl CapabilityFactory for ConnectionInfoFactory {
    fn operation(&self) -> &str {
        "GetConnectionInfo"
    }

    fn flow(&self) -> HandshakeFlow {
        HandshakeFlow::OneShot
    }

    fn server_tag(&self) -> ServerTag {
        ServerTag::AuthorizationService
    }

    fn create(
        &self,
        _client_address: Option<&ClientAddress>,
        _params: &RequestParams,
    ) -> Result<Arc<dyn CapabilityHandle>, CapabilityError> {
        Ok(Arc::new(StaticHandle {
            resource: body([
                ("SSID", Value::String("ppp-lab".into())),
                ("BSSID", Value::String("02:00:00:00:00:01".into())),
                ("Link-Speed-Mbps", Value::from(144_i64)),
                ("Rssi", Value::from(-48_i64)),
            ]),
        }))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentMessage {
    pub sender: Option<String>,
    pub destination: String,
    pub text: String,
}

/// Records messages instead of handing them to a modem.
#[derive(Clone, Debug, Default)]
pub struct SmsOutbox {
    sent: Arc<Mutex<Vec<SentMessage>>>,
}

impl SmsOutbox {
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().expect("sms outbox mutex poisoned").clone()
    }

    fn push(&self, message: SentMessage) -> usize {
        let mut sent = self.sent.lock().expect("sms outbox mutex poisoned");
        sent.push(message);
        sent.len()
    }
}

pub struct TextMessageFactory {
    outbox: SmsOutbox,
}

impl TextMessageFactory {
    pub fn new(outbox: SmsOutbox) -> Self {
        Self { outbox }
    }
}

struct TextMessageHandle {
    outbox: SmsOutbox,
    message: SentMessage,
    sent: AtomicBool,
}

impl CapabilityHandle for TextMessageHandle {
    fn authorize(&self) -> Result<Option<PayloadMap>, CapabilityError> {
        // Sends at most once per handle even if authorization is replayed.
        let message_id = if self.sent.swap(true, Ordering::SeqCst) {
            self.outbox.sent().len()
        } else {
            self.outbox.push(self.message.clone())
        };
        Ok(Some(body([
            ("Message-Id", Value::Integer((message_id as u64).into())),
            ("Destination", Value::String(self.message.destination.clone().into())),
        ])))
    }

    fn produce_next(&self) -> Result<Production, CapabilityError> {
        Ok(Production::EndOfStream)
    }

    fn cancel(&self) {}
}

impl CapabilityFactory for TextMessageFactory {
    fn operation(&self) -> &str {
        "SendTextMessage"
    }

    fn flow(&self) -> HandshakeFlow {
        HandshakeFlow::OneShot
    }

    fn server_tag(&self) -> ServerTag {
        ServerTag::AuthorizationService
    }

    fn create(
        &self,
        client_address: Option<&ClientAddress>,
        params: &RequestParams,
    ) -> Result<Arc<dyn CapabilityHandle>, CapabilityError> {
        let destination = required_str(self.operation(), params, "destination")?;
        let text = required_str(self.operation(), params, "text")?;
        Ok(Arc::new(TextMessageHandle {
            outbox: self.outbox.clone(),
            message: SentMessage {
                sender: client_address.map(ToString::to_string),
                destination: destination.to_owned(),
                text: text.to_owned(),
            },
            sent: AtomicBool::new(false),
        }))
    }
}

#[derive(Default)]
struct TickerState {
    cancelled: bool,
    produced: u64,
}

/// Paces a stream: the first tick is immediate, later ticks wait `interval`. `cancel` wakes a
/// waiting producer.
struct StreamTicker {
    interval: Duration,
    limit: Option<u64>,
    state: Mutex<TickerState>,
    wake: Condvar,
}

impl StreamTicker {
    fn from_params(operation: &str, params: &RequestParams) -> Result<Self, CapabilityError> {
        let interval_ms = match params.arguments.get("min_time_ms") {
            None => DEFAULT_MIN_TIME_MS,
            Some(value) => value
                .as_u64()
                .ok_or_else(|| invalid(operation, "'min_time_ms' must be a non-negative integer"))?,
        };
        let limit = match params.arguments.get("max_updates") {
            None => None,
            Some(value) => Some(
                value
                    .as_u64()
                    .ok_or_else(|| invalid(operation, "'max_updates' must be a non-negative integer"))?,
            ),
        };

        Ok(Self {
            interval: Duration::from_millis(interval_ms.max(MIN_TIME_FLOOR_MS)),
            limit,
            state: Mutex::new(TickerState::default()),
            wake: Condvar::new(),
        })
    }

    /// `Ok(Some(n))` for the n-th tick, `Ok(None)` once the limit is reached.
    fn next_tick(&self) -> Result<Option<u64>, CapabilityError> {
        let mut state = self.state.lock().expect("stream ticker mutex poisoned");
        if state.cancelled {
            return Err(CapabilityError::Cancelled);
        }
        if self.limit.is_some_and(|limit| state.produced >= limit) {
            return Ok(None);
        }

        if state.produced > 0 {
            let (guard, _) = self
                .wake
                .wait_timeout_while(state, self.interval, |state| !state.cancelled)
                .expect("stream ticker mutex poisoned");
            state = guard;
            if state.cancelled {
                return Err(CapabilityError::Cancelled);
            }
        }

        state.produced += 1;
        Ok(Some(state.produced))
    }

    fn cancel(&self) {
        let mut state = self.state.lock().expect("stream ticker mutex poisoned");
        state.cancelled = true;
        self.wake.notify_all();
    }
}

type SampleFn = fn(u64) -> PayloadMap;

struct StreamHandle {
    ticker: StreamTicker,
    sample: SampleFn,
}

impl CapabilityHandle for StreamHandle {
    fn authorize(&self) -> Result<Option<PayloadMap>, CapabilityError> {
        Ok(None)
    }

    fn produce_next(&self) -> Result<Production, CapabilityError> {
        Ok(match self.ticker.next_tick()? {
            Some(tick) => Production::Sample((self.sample)(tick)),
            None => Production::EndOfStream,
        })
    }

    fn cancel(&self) {
        self.ticker.cancel();
    }
}

fn now_rfc3339() -> Value {
    Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true).into())
}

// A slow walk north-east from a fixed origin.
fn location_sample(tick: u64) -> PayloadMap {
    let step = tick as f64 * 0.0001;
    body([
        ("Provider", Value::String("gps".into())),
        ("Latitude", Value::F64(52.2297 + step)),
        ("Longitude", Value::F64(21.0122 + step)),
        ("Accuracy", Value::F64(4.5)),
        ("Time", now_rfc3339()),
    ])
}

fn gps_status_sample(tick: u64) -> PayloadMap {
    body([
        ("Event", Value::String("GPS_EVENT_SATELLITE_STATUS".into())),
        ("Satellites", Value::Integer((6 + tick % 5).into())),
        ("Time", now_rfc3339()),
    ])
}

fn nmea_sample(tick: u64) -> PayloadMap {
    body([
        (
            "Nmea",
            Value::String(format!("$GPGGA,{:06},5213.782,N,02100.732,E,1,08,0.9,100.0,M,,,,*47", tick).into()),
        ),
        ("Timestamp", Value::Integer(Utc::now().timestamp_millis().into())),
    ])
}

macro_rules! stream_factory {
    ($name:ident, $operation:literal, $server:expr, $sample:expr) => {
        pub struct $name;

        impl CapabilityFactory for $name {
            fn operation(&self) -> &str {
                $operation
            }

            fn flow(&self) -> HandshakeFlow {
                HandshakeFlow::Ongoing
            }

            fn server_tag(&self) -> ServerTag {
                $server
            }

            fn create(
                &self,
                _client_address: Option<&ClientAddress>,
                params: &RequestParams,
            ) -> Result<Arc<dyn CapabilityHandle>, CapabilityError> {
                Ok(Arc::new(StreamHandle {
                    ticker: StreamTicker::from_params($operation, params)?,
                    sample: $sample,
                }))
            }
        }
    };
}

stream_factory!(
    LocationUpdatesFactory,
    "RequestLocationUpdates",
    ServerTag::LocationService,
    location_sample
);
stream_factory!(
    GpsStatusFactory,
    "AddGpsStatusListener",
    ServerTag::GpsStatusService,
    gps_status_sample
);
stream_factory!(NmeaFactory, "AddNmeaListener", ServerTag::NmeaService, nmea_sample);

/// Rows addressable by content URI, read by the `Query` capability.
#[derive(Clone, Debug, Default)]
pub struct ContentStore {
    rows: Arc<RwLock<HashMap<String, Vec<PayloadMap>>>>,
}

impl ContentStore {
    pub fn insert_rows(&self, uri: impl Into<String>, rows: Vec<PayloadMap>) {
        self.rows
            .write()
            .expect("content store lock poisoned")
            .insert(uri.into(), rows);
    }

    fn rows(&self, uri: &str) -> Option<Vec<PayloadMap>> {
        self.rows
            .read()
            .expect("content store lock poisoned")
            .get(uri)
            .cloned()
    }
}

pub struct ContentQueryFactory {
    store: ContentStore,
}

impl ContentQueryFactory {
    pub fn new(store: ContentStore) -> Self {
        Self { store }
    }
}

struct ContentQueryHandle {
    store: ContentStore,
    uri: String,
    limit: Option<usize>,
    delivered: AtomicU64,
}

impl CapabilityHandle for ContentQueryHandle {
    fn authorize(&self) -> Result<Option<PayloadMap>, CapabilityError> {
        Ok(None)
    }

    fn produce_next(&self) -> Result<Production, CapabilityError> {
        if self.delivered.fetch_add(1, Ordering::SeqCst) > 0 {
            return Ok(Production::EndOfStream);
        }

        let rows = self
            .store
            .rows(&self.uri)
            .ok_or_else(|| CapabilityError::Unavailable {
                operation: "Query".to_owned(),
                code: "NoSuchContent".to_owned(),
                message: format!("no content at '{}'", self.uri),
            })?;
        let rows: Vec<Value> = rows
            .into_iter()
            .take(self.limit.unwrap_or(usize::MAX))
            .map(map_value)
            .collect();

        Ok(Production::Sample(body([
            ("Uri", Value::String(self.uri.clone().into())),
            ("Count", Value::Integer((rows.len() as u64).into())),
            ("Rows", Value::Array(rows)),
        ])))
    }

    fn cancel(&self) {}
}

impl CapabilityFactory for ContentQueryFactory {
    fn operation(&self) -> &str {
        "Query"
    }

    fn flow(&self) -> HandshakeFlow {
        HandshakeFlow::Content
    }

    fn server_tag(&self) -> ServerTag {
        ServerTag::ContentProvider
    }

    fn create(
        &self,
        _client_address: Option<&ClientAddress>,
        params: &RequestParams,
    ) -> Result<Arc<dyn CapabilityHandle>, CapabilityError> {
        let uri = required_str(self.operation(), params, "uri")?;
        let limit = match params.arguments.get("limit") {
            None => None,
            Some(value) => Some(
                value
                    .as_u64()
                    .ok_or_else(|| invalid(self.operation(), "'limit' must be a non-negative integer"))?
                    as usize,
            ),
        };

        Ok(Arc::new(ContentQueryHandle {
            store: self.store.clone(),
            uri: uri.to_owned(),
            limit,
            delivered: AtomicU64::new(0),
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};

    use rmpv::Value;

    use crate::capabilities::{CapabilityError, CapabilityFactory, Production};
    use crate::wire::envelope::{PayloadMap, RequestParams};

    use super::{
        ConnectionInfoFactory, ContentQueryFactory, ContentStore, LocationUpdatesFactory,
        NmeaFactory, SmsOutbox, TextMessageFactory,
    };

    #[test]
    fn connection_info_returns_resource_on_authorize() {
        let handle = ConnectionInfoFactory
            .create(None, &RequestParams::new("GetConnectionInfo"))
            .expect("handle should be created");

        let resource = handle
            .authorize()
            .expect("authorize should pass")
            .expect("one-shot returns a resource");
        assert_eq!(resource.get("SSID"), Some(&Value::String("ppp-lab".into())));
        assert_eq!(
            handle.produce_next().expect("produce should pass"),
            Production::EndOfStream
        );
    }

    #[test]
    fn text_message_is_sent_once_even_if_reauthorized() {
        let outbox = SmsOutbox::default();
        let factory = TextMessageFactory::new(outbox.clone());
        let params = RequestParams::new("SendTextMessage")
            .with_arg("destination", "+48123456789")
            .with_arg("text", "on my way");

        let handle = factory.create(None, &params).expect("handle should be created");
        handle.authorize().expect("first authorize should pass");
        handle.authorize().expect("second authorize should pass");

        let sent = outbox.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].text, "on my way");

        let missing = factory
            .create(None, &RequestParams::new("SendTextMessage").with_arg("text", "hi"))
            .err()
            .expect("destination is required");
        assert!(matches!(missing, CapabilityError::InvalidArguments { .. }));
    }

    #[test]
    fn stream_paces_samples_and_honours_max_updates() {
        let params = RequestParams::new("RequestLocationUpdates")
            .with_arg("min_time_ms", 20_u64)
            .with_arg("max_updates", 2_u64);
        let handle = LocationUpdatesFactory
            .create(None, &params)
            .expect("handle should be created");
        assert!(handle.authorize().expect("authorize should pass").is_none());

        let started = Instant::now();
        let Production::Sample(first) = handle.produce_next().expect("first sample") else {
            panic!("expected a sample");
        };
        let Production::Sample(second) = handle.produce_next().expect("second sample") else {
            panic!("expected a sample");
        };
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert!(first.contains_key("Latitude"));
        assert_ne!(first.get("Latitude"), second.get("Latitude"));
        assert_eq!(
            handle.produce_next().expect("limit reached"),
            Production::EndOfStream
        );
    }

    #[test]
    fn cancel_wakes_a_blocked_producer_and_is_idempotent() {
        let params = RequestParams::new("AddNmeaListener").with_arg("min_time_ms", 60_000_u64);
        let handle = NmeaFactory.create(None, &params).expect("handle should be created");
        handle.produce_next().expect("first sample is immediate");

        let (tx, rx) = mpsc::channel();
        let producer = handle.clone();
        thread::spawn(move || {
            let _ = tx.send(producer.produce_next());
        });

        thread::sleep(Duration::from_millis(50));
        handle.cancel();
        handle.cancel();
        let result = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("blocked producer should wake up");
        assert_eq!(result, Err(CapabilityError::Cancelled));
    }

    #[test]
    fn rejects_non_integer_interval() {
        let params = RequestParams::new("RequestLocationUpdates").with_arg("min_time_ms", "soon");
        let err = LocationUpdatesFactory
            .create(None, &params)
            .err()
            .expect("string interval should fail");
        assert!(matches!(err, CapabilityError::InvalidArguments { .. }));
    }

    #[test]
    fn content_query_reads_rows_once() {
        let store = ContentStore::default();
        let mut row = PayloadMap::new();
        row.insert("name".to_owned(), Value::String("Ada".into()));
        store.insert_rows("content://contacts", vec![row.clone(), row]);

        let factory = ContentQueryFactory::new(store);
        let params = RequestParams::new("Query")
            .with_arg("uri", "content://contacts")
            .with_arg("limit", 1_u64);
        let handle = factory.create(None, &params).expect("handle should be created");

        let Production::Sample(result) = handle.produce_next().expect("read should pass") else {
            panic!("expected rows");
        };
        assert_eq!(result.get("Count"), Some(&Value::from(1_u64)));
        assert_eq!(
            handle.produce_next().expect("second read"),
            Production::EndOfStream
        );

        let missing = factory
            .create(None, &RequestParams::new("Query").with_arg("uri", "content://sms"))
            .expect("handle should be created");
        let err = missing.produce_next().expect_err("unknown uri should fail");
        assert_eq!(err.code(), "NoSuchContent");
    }
}

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};

use crate::config::AppConfig;
use crate::events::EventEmitter;

/// Tick event; `RequestBroker::sweep_on_heartbeat` evicts dormant clients and purges expired
/// content nonces on it.
pub const HEARTBEAT_EVENT: &str = "on-heartbeat";
pub const MIN_INTERVAL_MS: u64 = 100;
pub const MAX_INTERVAL_MS: u64 = 1_000;

#[derive(Clone, Copy, Debug)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: MAX_INTERVAL_MS,
        }
    }
}

#[derive(Debug)]
pub enum HeartbeatError {
    IntervalOutOfRange { interval_ms: u64 },
    AlreadyRunning,
    TickerPanicked,
}

impl fmt::Display for HeartbeatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IntervalOutOfRange { interval_ms } => write!(
                f,
                "heartbeat.interval_ms must be within {MIN_INTERVAL_MS}..={MAX_INTERVAL_MS}, got {interval_ms}"
            ),
            Self::AlreadyRunning => write!(f, "heartbeat ticker is already running"),
            Self::TickerPanicked => write!(f, "heartbeat ticker thread panicked"),
        }
    }
}

impl std::error::Error for HeartbeatError {}

struct Ticker {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

/// Drives the liveness sweep: emits numbered `on-heartbeat` events at a fixed cadence.
///
/// The ticker waits on a stop channel between ticks, so `stop` returns without waiting out
/// the interval.
pub struct Heartbeat {
    interval: Duration,
    emitter: Arc<EventEmitter>,
    ticks: Arc<AtomicU64>,
    ticker: Option<Ticker>,
}

impl Heartbeat {
    pub fn new(emitter: Arc<EventEmitter>, config: HeartbeatConfig) -> Result<Self, HeartbeatError> {
        if !(MIN_INTERVAL_MS..=MAX_INTERVAL_MS).contains(&config.interval_ms) {
            return Err(HeartbeatError::IntervalOutOfRange {
                interval_ms: config.interval_ms,
            });
        }

        Ok(Self {
            interval: Duration::from_millis(config.interval_ms),
            emitter,
            ticks: Arc::new(AtomicU64::new(0)),
            ticker: None,
        })
    }

    pub fn from_app_config(
        emitter: Arc<EventEmitter>,
        app_config: &AppConfig,
    ) -> Result<Self, HeartbeatError> {
        Self::new(
            emitter,
            HeartbeatConfig {
                interval_ms: app_config.heartbeat.interval_ms,
            },
        )
    }

    pub fn start(&mut self) -> Result<(), HeartbeatError> {
        if self.ticker.is_some() {
            return Err(HeartbeatError::AlreadyRunning);
        }

        let (stop, stopped) = mpsc::channel::<()>();
        let emitter = Arc::clone(&self.emitter);
        let ticks = Arc::clone(&self.ticks);
        let interval = self.interval;

        let thread = thread::spawn(move || loop {
            let tick = ticks.fetch_add(1, Ordering::SeqCst) + 1;
            let payload = json!({
                "tick": tick,
                "emitted_at": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            });
            // A failed sweep is retried on the next tick.
            if let Err(error) = emitter.emit(HEARTBEAT_EVENT, Some(payload)) {
                eprintln!("heartbeat listener error: {error}");
            }

            match stopped.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        });

        self.ticker = Some(Ticker { stop, thread });
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), HeartbeatError> {
        let Some(ticker) = self.ticker.take() else {
            return Ok(());
        };
        let _ = ticker.stop.send(());
        ticker.thread.join().map_err(|_| HeartbeatError::TickerPanicked)
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    /// Startup log payload.
    pub fn initial_metadata_payload(&self) -> Value {
        json!({
            "event": HEARTBEAT_EVENT,
            "interval_ms": self.interval.as_millis() as u64,
            "started_at": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        })
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use serde_json::Value;

    use crate::config::AppConfig;
    use crate::events::EventEmitter;

    use super::{Heartbeat, HeartbeatConfig, HeartbeatError, HEARTBEAT_EVENT, MAX_INTERVAL_MS};

    #[test]
    fn interval_must_stay_within_sweep_bounds() {
        let emitter = Arc::new(EventEmitter::new());

        assert!(matches!(
            Heartbeat::new(Arc::clone(&emitter), HeartbeatConfig { interval_ms: 99 }),
            Err(HeartbeatError::IntervalOutOfRange { interval_ms: 99 })
        ));
        assert!(matches!(
            Heartbeat::new(Arc::clone(&emitter), HeartbeatConfig { interval_ms: 1_001 }),
            Err(HeartbeatError::IntervalOutOfRange { interval_ms: 1_001 })
        ));
        let heartbeat = Heartbeat::from_app_config(emitter, &AppConfig::default())
            .expect("default config should be valid");
        assert_eq!(
            heartbeat.initial_metadata_payload()["interval_ms"],
            Value::from(AppConfig::default().heartbeat.interval_ms)
        );
        assert_eq!(HeartbeatConfig::default().interval_ms, MAX_INTERVAL_MS);
    }

    #[test]
    fn emits_numbered_ticks_until_stopped() {
        let emitter = Arc::new(EventEmitter::new());
        let (tx, rx) = mpsc::channel::<u64>();
        emitter.on(HEARTBEAT_EVENT, move |event| {
            let tick = event
                .payload
                .as_ref()
                .and_then(|payload| payload.get("tick"))
                .and_then(Value::as_u64)
                .ok_or_else(|| "missing tick in heartbeat payload".to_owned())?;
            let _ = tx.send(tick);
            Ok(())
        });

        let mut heartbeat = Heartbeat::new(Arc::clone(&emitter), HeartbeatConfig { interval_ms: 100 })
            .expect("heartbeat should be created");
        heartbeat.start().expect("heartbeat should start");
        assert!(matches!(heartbeat.start(), Err(HeartbeatError::AlreadyRunning)));

        let first = rx
            .recv_timeout(Duration::from_millis(500))
            .expect("first tick should arrive");
        let second = rx
            .recv_timeout(Duration::from_millis(500))
            .expect("second tick should arrive");
        heartbeat.stop().expect("heartbeat should stop");

        assert_eq!((first, second), (1, 2));
        assert!(heartbeat.ticks() >= 2);
    }

    #[test]
    fn stop_does_not_wait_out_the_interval() {
        let emitter = Arc::new(EventEmitter::new());
        let mut heartbeat = Heartbeat::new(emitter, HeartbeatConfig { interval_ms: MAX_INTERVAL_MS })
            .expect("heartbeat should be created");
        heartbeat.start().expect("heartbeat should start");

        let stopping = Instant::now();
        heartbeat.stop().expect("heartbeat should stop");
        assert!(stopping.elapsed() < Duration::from_millis(500));
        heartbeat.stop().expect("second stop is a no-op");
    }

    #[test]
    fn failing_listener_does_not_stop_the_ticker() {
        let emitter = Arc::new(EventEmitter::new());
        let (tx, rx) = mpsc::channel::<()>();
        emitter.on(HEARTBEAT_EVENT, move |_event| {
            let _ = tx.send(());
            Err("sweep failed".to_owned())
        });

        let mut heartbeat = Heartbeat::new(Arc::clone(&emitter), HeartbeatConfig { interval_ms: 100 })
            .expect("heartbeat should be created");
        heartbeat.start().expect("heartbeat should start");
        rx.recv_timeout(Duration::from_millis(500))
            .expect("first tick should arrive");
        rx.recv_timeout(Duration::from_millis(500))
            .expect("ticker should keep running after a listener error");
        heartbeat.stop().expect("heartbeat should stop");
    }
}

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;

/// Emitted after a client leaves the active-client set, whatever the reason.
pub const CLIENT_REMOVED_EVENT: &str = "broker.client_removed";
/// Emitted when a removal leaves the active-client set empty; the host may shut down.
pub const BROKER_IDLE_EVENT: &str = "broker.idle";
pub const BROKER_STARTED_EVENT: &str = "broker.started";

pub type ListenerResult = Result<(), String>;

type SyncListener = Arc<dyn Fn(&Event) -> ListenerResult + Send + Sync>;
type AsyncListener = Arc<dyn Fn(Event) -> ListenerResult + Send + Sync>;

#[derive(Clone, Debug)]
pub struct Event {
    pub name: String,
    pub payload: Option<Value>,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

#[derive(Debug)]
pub enum EmitError {
    ListenerFailed {
        event: String,
        listener_index: usize,
        message: String,
    },
    ListenerPanicked {
        event: String,
        listener_index: usize,
    },
}

impl fmt::Display for EmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ListenerFailed {
                event,
                listener_index,
                message,
            } => write!(
                f,
                "sync listener #{listener_index} failed for event '{event}': {message}"
            ),
            Self::ListenerPanicked {
                event,
                listener_index,
            } => write!(
                f,
                "sync listener #{listener_index} panicked for event '{event}'"
            ),
        }
    }
}

impl Error for EmitError {}

/// Boundary event bus between the broker core and the hosting process.
///
/// Sync listeners run on the emitting thread and can fail the emit; async listeners each get
/// their own thread and are tracked so shutdown can drain them.
#[derive(Default)]
pub struct EventEmitter {
    sync_listeners: RwLock<HashMap<String, Vec<SyncListener>>>,
    async_listeners: RwLock<HashMap<String, Vec<AsyncListener>>>,
    in_flight: Arc<AtomicUsize>,
    shutting_down: AtomicBool,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, event_name: impl Into<String>, listener: F)
    where
        F: Fn(&Event) -> ListenerResult + Send + Sync + 'static,
    {
        let event_name = event_name.into();
        let mut listeners = self
            .sync_listeners
            .write()
            .expect("sync listener map lock poisoned");
        listeners
            .entry(event_name)
            .or_default()
            .push(Arc::new(listener));
    }

    pub fn on_async<F>(&self, event_name: impl Into<String>, listener: F)
    where
        F: Fn(Event) -> ListenerResult + Send + Sync + 'static,
    {
        let event_name = event_name.into();
        let mut listeners = self
            .async_listeners
            .write()
            .expect("async listener map lock poisoned");
        listeners
            .entry(event_name)
            .or_default()
            .push(Arc::new(listener));
    }

    pub fn emit(&self, event_name: impl Into<String>, payload: Option<Value>) -> Result<(), EmitError> {
        let event = Event::new(event_name, payload);
        self.run_sync(&event)?;
        if !self.shutting_down.load(Ordering::SeqCst) {
            self.dispatch_async(event);
        }
        Ok(())
    }

    /// Stops dispatching new async listeners; sync listeners keep running.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Waits until every dispatched async listener returned, up to `timeout`.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        let started = Instant::now();
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            if started.elapsed() >= timeout {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        true
    }

    fn run_sync(&self, event: &Event) -> Result<(), EmitError> {
        let handlers = {
            let listeners = self
                .sync_listeners
                .read()
                .expect("sync listener map lock poisoned");
            match listeners.get(&event.name) {
                Some(handlers) => handlers.clone(),
                None => return Ok(()),
            }
        };

        for (idx, handler) in handlers.iter().enumerate() {
            let result = catch_unwind(AssertUnwindSafe(|| handler(event)));
            match result {
                Ok(Ok(())) => {}
                Ok(Err(message)) => {
                    return Err(EmitError::ListenerFailed {
                        event: event.name.clone(),
                        listener_index: idx,
                        message,
                    });
                }
                Err(_) => {
                    return Err(EmitError::ListenerPanicked {
                        event: event.name.clone(),
                        listener_index: idx,
                    });
                }
            }
        }

        Ok(())
    }

    fn dispatch_async(&self, event: Event) {
        let listeners = self
            .async_listeners
            .read()
            .expect("async listener map lock poisoned");

        let Some(handlers) = listeners.get(&event.name) else {
            return;
        };

        for (idx, handler) in handlers.iter().enumerate() {
            let listener = Arc::clone(handler);
            let event_for_listener = event.clone();
            let event_name = event.name.clone();
            let in_flight = Arc::clone(&self.in_flight);
            in_flight.fetch_add(1, Ordering::SeqCst);
            thread::spawn(move || {
                let result = catch_unwind(AssertUnwindSafe(|| listener(event_for_listener)));
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(message)) => {
                        eprintln!("async listener #{idx} failed for event '{event_name}': {message}");
                    }
                    Err(_) => {
                        eprintln!("async listener #{idx} panicked for event '{event_name}'");
                    }
                }
                in_flight.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use super::{EmitError, EventEmitter, BROKER_IDLE_EVENT, CLIENT_REMOVED_EVENT};

    #[test]
    fn sync_listener_receives_emitted_payload() {
        let emitter = EventEmitter::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        emitter.on(CLIENT_REMOVED_EVENT, move |event| {
            if event.payload == Some(json!({"client_address":"a1","reason":"dormant"})) {
                calls_clone.fetch_add(1, Ordering::Relaxed);
            }
            Ok(())
        });

        let result = emitter.emit(
            CLIENT_REMOVED_EVENT,
            Some(json!({"client_address":"a1","reason":"dormant"})),
        );
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn sync_listener_error_and_panic_bubble_up() {
        let emitter = EventEmitter::new();
        emitter.on(BROKER_IDLE_EVENT, |_event| Err("host refused".to_owned()));
        emitter.on("other", |_event| panic!("boom"));

        assert!(matches!(
            emitter.emit(BROKER_IDLE_EVENT, None),
            Err(EmitError::ListenerFailed {
                listener_index: 0,
                ..
            })
        ));
        assert!(matches!(
            emitter.emit("other", None),
            Err(EmitError::ListenerPanicked { .. })
        ));
    }

    #[test]
    fn async_listeners_are_drained_by_wait_for_idle() {
        let emitter = EventEmitter::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        emitter.on_async(BROKER_IDLE_EVENT, move |_event| {
            std::thread::sleep(Duration::from_millis(20));
            calls_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        emitter
            .emit(BROKER_IDLE_EVENT, None)
            .expect("emit should succeed");
        assert!(emitter.wait_for_idle(Duration::from_secs(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn async_listeners_are_skipped_after_shutdown_begins() {
        let emitter = EventEmitter::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        emitter.on_async(CLIENT_REMOVED_EVENT, move |_event| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        emitter.begin_shutdown();
        emitter
            .emit(CLIENT_REMOVED_EVENT, None)
            .expect("emit should succeed");
        assert!(emitter.wait_for_idle(Duration::from_millis(100)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}

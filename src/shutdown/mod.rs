use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[cfg(unix)]
use signal_hook::consts::signal::{SIGINT, SIGTERM};
#[cfg(unix)]
use signal_hook::flag;
#[cfg(unix)]
use signal_hook::low_level::unregister;
#[cfg(unix)]
use signal_hook::SigId;

/// Cloneable trigger for in-process shutdown requests (idle broker, fatal listener error).
#[derive(Clone, Debug)]
pub struct ShutdownTrigger {
    flag: Arc<AtomicBool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

pub struct ShutdownHooks {
    triggered: Arc<AtomicBool>,
    #[cfg(unix)]
    sig_ids: Vec<SigId>,
}

impl ShutdownHooks {
    /// Registers SIGINT and SIGTERM to flip the shared flag.
    pub fn install() -> io::Result<Self> {
        let triggered = Arc::new(AtomicBool::new(false));

        #[cfg(unix)]
        {
            let id_int = flag::register(SIGINT, Arc::clone(&triggered))?;
            let id_term = flag::register(SIGTERM, Arc::clone(&triggered))?;
            Ok(Self {
                triggered,
                sig_ids: vec![id_int, id_term],
            })
        }

        #[cfg(not(unix))]
        {
            Ok(Self { triggered })
        }
    }

    /// Hooks without signal registration.
    pub fn detached() -> Self {
        Self {
            triggered: Arc::new(AtomicBool::new(false)),
            #[cfg(unix)]
            sig_ids: Vec::new(),
        }
    }

    pub fn trigger_handle(&self) -> ShutdownTrigger {
        ShutdownTrigger {
            flag: Arc::clone(&self.triggered),
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }
}

impl Drop for ShutdownHooks {
    fn drop(&mut self) {
        #[cfg(unix)]
        for id in self.sig_ids.drain(..) {
            unregister(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ShutdownHooks;

    #[test]
    fn trigger_handle_flips_the_shared_flag() {
        let hooks = ShutdownHooks::detached();
        let trigger = hooks.trigger_handle();
        assert!(!hooks.is_triggered());

        let cloned = trigger.clone();
        cloned.trigger();
        assert!(hooks.is_triggered());
    }
}

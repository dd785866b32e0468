use std::time::{Duration, Instant};

use serde_json::json;

use crate::logging::{LogLevel, Logger};

/// Logs how long a startup stage took when dropped.
pub struct StageTimer<'a> {
    stage: &'a str,
    context: Option<&'a str>,
    started_at: Instant,
    logger: &'a Logger,
}

impl<'a> StageTimer<'a> {
    pub fn start(stage: &'a str, context: Option<&'a str>, logger: &'a Logger) -> Self {
        Self {
            stage,
            context,
            started_at: Instant::now(),
            logger,
        }
    }
}

impl Drop for StageTimer<'_> {
    fn drop(&mut self) {
        let elapsed = self.started_at.elapsed();
        self.logger.log(
            LogLevel::Debug,
            self.context,
            &format!("stage '{}' finished in {}", self.stage, human_duration(elapsed)),
            Some(json!({ "elapsed_ms": elapsed.as_millis() as u64 })),
        );
    }
}

pub fn timed_stage<T, F>(stage: &str, context: Option<&str>, logger: &Logger, task: F) -> T
where
    F: FnOnce() -> T,
{
    let _timer = StageTimer::start(stage, context, logger);
    task()
}

fn human_duration(duration: Duration) -> String {
    let millis = duration.as_secs_f64() * 1000.0;
    if millis < 1_000.0 {
        format!("{millis:.2} ms")
    } else {
        format!("{:.2} s", millis / 1_000.0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::logging::{LogLevel, Logger, LoggerConfig, MemorySink};

    use super::{human_duration, timed_stage};

    #[test]
    fn renders_short_and_long_durations() {
        assert_eq!(human_duration(Duration::from_millis(250)), "250.00 ms");
        assert_eq!(human_duration(Duration::from_millis(1_500)), "1.50 s");
    }

    #[test]
    fn timed_stage_returns_result_and_logs_at_debug() {
        let sink = Arc::new(MemorySink::default());
        let logger = Logger::with_sink(
            LoggerConfig {
                min_level: LogLevel::Debug,
                human_friendly: false,
            },
            sink.clone(),
        );

        let restored = timed_stage("broker.recover", Some("main::recovery"), &logger, || 3);
        assert_eq!(restored, 3);

        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("[DEBUG]"));
        assert!(lines[0].contains("stage 'broker.recover' finished in"));
    }
}

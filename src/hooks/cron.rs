//! Timed invocation of plug functions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::plug::PlugHandle;

use super::Hook;

/// A parsed schedule.
pub trait Schedule: Send + Sync {
    /// Delay from now until the next fire, or `None` when it never fires again.
    fn next_delay(&self) -> Option<Duration>;
}

/// Turns schedule expressions into [`Schedule`]s.
pub trait ScheduleParser: Send + Sync {
    /// Parse `expr`.
    fn parse(&self, expr: &str) -> Result<Box<dyn Schedule>>;
}

struct Interval(Duration);

impl Schedule for Interval {
    fn next_delay(&self) -> Option<Duration> {
        Some(self.0)
    }
}

/// Fixed-interval schedules.
///
/// Accepts `@every <duration>` (e.g. `@every 5s`, `@every 1h 30m`),
/// `@minutely`, `@hourly` and `@daily`.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntervalParser;

impl ScheduleParser for IntervalParser {
    fn parse(&self, expr: &str) -> Result<Box<dyn Schedule>> {
        let expr = expr.trim();
        let period = match expr {
            "@minutely" => Duration::from_secs(60),
            "@hourly" => Duration::from_secs(60 * 60),
            "@daily" => Duration::from_secs(24 * 60 * 60),
            _ => {
                let every = expr.strip_prefix("@every").ok_or_else(|| {
                    Error::invalid_manifest(format!("unsupported schedule expression: {:?}", expr))
                })?;
                humantime::parse_duration(every.trim()).map_err(|e| {
                    Error::invalid_manifest(format!("invalid schedule {:?}: {}", expr, e))
                })?
            }
        };
        if period.is_zero() {
            return Err(Error::invalid_manifest(format!(
                "schedule {:?} has a zero period",
                expr
            )));
        }
        Ok(Box::new(Interval(period)))
    }
}

struct Timer {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Arms one timer per declared schedule expression.
pub struct CronHook {
    parser: Arc<dyn ScheduleParser>,
    timers: Mutex<HashMap<String, Vec<Timer>>>,
}

impl CronHook {
    /// Create a cron hook using [`IntervalParser`].
    pub fn new() -> Self {
        Self::with_parser(IntervalParser)
    }

    /// Create a cron hook with a custom schedule parser.
    pub fn with_parser(parser: impl ScheduleParser + 'static) -> Self {
        Self {
            parser: Arc::new(parser),
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Number of armed timers across all plugs.
    pub fn timer_count(&self) -> usize {
        self.timers.lock().values().map(Vec::len).sum()
    }

    fn arm(plug: PlugHandle, function: String, expr: String, schedule: Box<dyn Schedule>) -> Timer {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            while let Some(delay) = schedule.next_delay() {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }

                tracing::debug!(plug = %plug.name(), function = %function, cron = %expr, "cron fired");
                let arg = json!({ "cron": expr });
                tokio::select! {
                    _ = token.cancelled() => break,
                    result = plug.invoke(&function, vec![arg]) => {
                        if let Err(e) = result {
                            tracing::warn!(
                                plug = %plug.name(),
                                function = %function,
                                cron = %expr,
                                error = %e,
                                "cron handler failed"
                            );
                        }
                    }
                }
            }
        });

        Timer { cancel, task }
    }
}

impl Hook for CronHook {
    fn name(&self) -> &'static str {
        "cron"
    }

    fn validate_manifest(&self, manifest: &Manifest) -> Vec<String> {
        manifest
            .cron_bindings()
            .filter_map(|(expr, function)| {
                self.parser
                    .parse(expr)
                    .err()
                    .map(|e| format!("function {}: {}", function, e))
            })
            .collect()
    }

    fn install(&self, plug: &PlugHandle) {
        let mut armed = Vec::new();
        for (expr, function) in plug.manifest().cron_bindings() {
            match self.parser.parse(expr) {
                Ok(schedule) => armed.push(Self::arm(
                    plug.clone(),
                    function.to_string(),
                    expr.to_string(),
                    schedule,
                )),
                Err(e) => {
                    tracing::warn!(plug = %plug.name(), cron = %expr, error = %e, "schedule skipped");
                }
            }
        }
        if !armed.is_empty() {
            self.timers
                .lock()
                .entry(plug.name().to_string())
                .or_default()
                .extend(armed);
        }
    }

    fn uninstall(&self, plug: &str) {
        if let Some(timers) = self.timers.lock().remove(plug) {
            for timer in timers {
                timer.cancel.cancel();
                timer.task.abort();
            }
        }
    }

    fn registrations(&self, plug: &str) -> usize {
        self.timers.lock().get(plug).map_or(0, Vec::len)
    }
}

impl Default for CronHook {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CronHook {
    fn drop(&mut self) {
        for timer in self.timers.get_mut().drain().flat_map(|(_, t)| t) {
            timer.cancel.cancel();
            timer.task.abort();
        }
    }
}

impl std::fmt::Debug for CronHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CronHook")
            .field("timer_count", &self.timer_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_parser() {
        let parser = IntervalParser;
        assert_eq!(
            parser.parse("@every 5s").unwrap().next_delay(),
            Some(Duration::from_secs(5))
        );
        assert_eq!(
            parser.parse("@every 1h 30m").unwrap().next_delay(),
            Some(Duration::from_secs(90 * 60))
        );
        assert_eq!(
            parser.parse("@hourly").unwrap().next_delay(),
            Some(Duration::from_secs(3600))
        );
    }

    #[test]
    fn test_interval_parser_rejects() {
        let parser = IntervalParser;
        assert!(parser.parse("*/5 * * * *").is_err());
        assert!(parser.parse("@every soon").is_err());
        assert!(parser.parse("@every 0s").is_err());
    }

    #[test]
    fn test_validate_manifest() {
        let hook = CronHook::new();
        let manifest = crate::manifest::ManifestBuilder::new("ticker")
            .on_cron("tick", "@every 1s")
            .on_cron("tock", "0 0 * * *")
            .build_unchecked();
        let problems = hook.validate_manifest(&manifest);
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("tock"));
    }

    struct Never;

    impl Schedule for Never {
        fn next_delay(&self) -> Option<Duration> {
            None
        }
    }

    struct AcceptAll;

    impl ScheduleParser for AcceptAll {
        fn parse(&self, _: &str) -> Result<Box<dyn Schedule>> {
            Ok(Box::new(Never))
        }
    }

    #[test]
    fn test_custom_parser() {
        let hook = CronHook::with_parser(AcceptAll);
        let manifest = crate::manifest::ManifestBuilder::new("ticker")
            .on_cron("tick", "0 0 * * *")
            .build_unchecked();
        assert!(hook.validate_manifest(&manifest).is_empty());
    }
}

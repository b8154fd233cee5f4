//! The process-wide error bus.
//!
//! Every component may publish through [`ErrorBus::track_error`]. For each report the bus:
//! 1. builds an [`ErrorEvent`] (severity from the category table, source from the stack),
//! 2. lets enrichers attach derived data (the impact analyzer fills [`ErrorEvent::impact`]),
//! 3. runs the category handler if one is registered, falling back to a structured log line,
//! 4. appends the event to a bounded history, and
//! 5. notifies subscribers.
//!
//! ## Notes
//!
//! - History is an audit trail: events are recorded whatever the handler decides.
//! - Handlers that fail are themselves tracked as `internal` errors. A per-thread depth counter stops the recursion
//!   after [`MAX_DEPTH`] nested reports, so a handler that keeps failing cannot loop forever.
//! - No lock is held while handlers, enrichers or subscribers run, so they may publish or query freely.

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use proctor_core::{CategorySeverity, ErrorCategory};

use super::event::{ErrorEvent, ErrorReport};
use crate::clock;

/// Maximum nesting of `track_error` calls on one thread.
pub const MAX_DEPTH: u32 = 3;
/// Default number of events kept in history.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

thread_local! {
    static DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// What a category handler decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The handler dealt with the error; skip the default log line.
    Handled,
    /// Fall through to the default log line.
    Continue,
}

pub type HandlerResult = Result<HandlerOutcome, Box<dyn std::error::Error + Send + Sync>>;
pub type ErrorHandler = Arc<dyn Fn(&ErrorEvent) -> HandlerResult + Send + Sync>;

/// Observer notified after an event is recorded.
pub trait ErrorSubscriber: Send + Sync {
    fn on_error(&self, event: &ErrorEvent);
}

/// Hook that can attach derived data to an event before it is recorded.
pub trait ErrorEnricher: Send + Sync {
    fn enrich(&self, event: &mut ErrorEvent);
}

struct DepthGuard;

impl DepthGuard {
    fn enter() -> Option<Self> {
        DEPTH.with(|depth| {
            if depth.get() >= MAX_DEPTH {
                None
            } else {
                depth.set(depth.get() + 1);
                Some(DepthGuard)
            }
        })
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

pub struct ErrorBus {
    handlers: RwLock<HashMap<ErrorCategory, ErrorHandler>>,
    subscribers: RwLock<Vec<Arc<dyn ErrorSubscriber>>>,
    enrichers: RwLock<Vec<Arc<dyn ErrorEnricher>>>,
    history: Mutex<VecDeque<ErrorEvent>>,
    capacity: usize,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

impl std::fmt::Debug for ErrorBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorBus")
            .field("capacity", &self.capacity)
            .field("count", &self.count())
            .finish_non_exhaustive()
    }
}

impl Default for ErrorBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }
}

impl ErrorBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(Vec::new()),
            enrichers: RwLock::new(Vec::new()),
            history: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_CAPACITY))),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register the handler for a category, replacing any previous one.
    pub fn register_handler<F>(&self, category: ErrorCategory, handler: F)
    where
        F: Fn(&ErrorEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(category, Arc::new(handler));
    }

    pub fn subscribe(&self, subscriber: Arc<dyn ErrorSubscriber>) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(subscriber);
    }

    pub fn add_enricher(&self, enricher: Arc<dyn ErrorEnricher>) {
        self.enrichers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(enricher);
    }

    /// Track one error.
    ///
    /// ## Returns
    /// - The recorded event, or `None` when the report was dropped by the recursion guard.
    pub fn track_error(&self, category: ErrorCategory, report: ErrorReport) -> Option<ErrorEvent> {
        let Some(_depth) = DepthGuard::enter() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                category = %category,
                message = %report.message,
                "error raised while handling errors too deeply; dropping it"
            );
            return None;
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut event = ErrorEvent::from_report(id, category, report, clock::now_ms());

        let enrichers = self.enrichers.read().unwrap_or_else(PoisonError::into_inner).clone();
        for enricher in enrichers {
            enricher.enrich(&mut event);
        }

        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&category)
            .cloned();
        let handled = match handler.map(|handler| handler(&event)) {
            Some(Ok(HandlerOutcome::Handled)) => true,
            Some(Ok(HandlerOutcome::Continue)) | None => false,
            Some(Err(err)) => {
                self.track_error(
                    ErrorCategory::Internal,
                    ErrorReport::new(format!("{category} handler failed: {err}"))
                        .with_context("failedCategory", category.as_str())
                        .with_context("originalEventId", event.id),
                );
                false
            }
        };
        if !handled {
            log_event(&event);
        }

        self.record(event.clone());

        let subscribers = self.subscribers.read().unwrap_or_else(PoisonError::into_inner).clone();
        for subscriber in subscribers {
            subscriber.on_error(&event);
        }
        Some(event)
    }

    fn record(&self, event: ErrorEvent) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        if history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back(event);
    }

    // ---- queries ----

    pub fn history(&self) -> Vec<ErrorEvent> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn by_category(&self, category: ErrorCategory) -> Vec<ErrorEvent> {
        self.filter(|e| e.category == category)
    }

    pub fn by_severity(&self, severity: CategorySeverity) -> Vec<ErrorEvent> {
        self.filter(|e| e.severity == severity)
    }

    pub fn count(&self) -> usize {
        self.history.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Reports rejected by the recursion guard since creation.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.history.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Drop events older than `max_age`; returns how many were removed.
    pub fn trim_older_than(&self, max_age: Duration) -> usize {
        let now = clock::now_ms();
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let before = history.len();
        history.retain(|e| !clock::is_older_than(e.timestamp, max_age, now));
        before - history.len()
    }

    fn filter(&self, keep: impl Fn(&ErrorEvent) -> bool) -> Vec<ErrorEvent> {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.iter().filter(|e| keep(e)).cloned().collect()
    }
}

fn log_event(event: &ErrorEvent) {
    let source = event.source.as_ref().map(ToString::to_string).unwrap_or_default();
    match event.severity {
        CategorySeverity::Critical | CategorySeverity::High => tracing::error!(
            category = %event.category,
            severity = %event.severity,
            %source,
            impact = event.impact_summary,
            "{}",
            event.message
        ),
        CategorySeverity::Medium => tracing::warn!(
            category = %event.category,
            severity = %event.severity,
            %source,
            impact = event.impact_summary,
            "{}",
            event.message
        ),
        CategorySeverity::Low => tracing::info!(
            category = %event.category,
            severity = %event.severity,
            %source,
            impact = event.impact_summary,
            "{}",
            event.message
        ),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::errors::ImpactAnalyzer;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counting(AtomicUsize);

    impl ErrorSubscriber for Counting {
        fn on_error(&self, _event: &ErrorEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_events_are_recorded_and_classified() {
        let bus = ErrorBus::new();
        let event = bus.track_error(ErrorCategory::Network, ErrorReport::new("refused")).unwrap();
        assert_eq!(event.severity, CategorySeverity::High);
        assert_eq!(event.impact_summary, "Network communication disrupted");
        assert_eq!(bus.count(), 1);
        assert_eq!(bus.by_category(ErrorCategory::Network).len(), 1);
        assert_eq!(bus.by_severity(CategorySeverity::Critical).len(), 0);
    }

    #[test]
    fn test_handled_errors_are_still_recorded() {
        let bus = ErrorBus::new();
        bus.register_handler(ErrorCategory::Console, |_| Ok(HandlerOutcome::Handled));
        bus.track_error(ErrorCategory::Console, ErrorReport::new("noise"));
        assert_eq!(bus.count(), 1);
    }

    #[test]
    fn test_failing_handler_is_tracked_as_internal() {
        let bus = ErrorBus::new();
        bus.register_handler(ErrorCategory::Build, |_| Err("handler exploded".into()));
        bus.track_error(ErrorCategory::Build, ErrorReport::new("compile failed"));

        let internal = bus.by_category(ErrorCategory::Internal);
        assert_eq!(internal.len(), 1);
        assert!(internal[0].message.contains("handler exploded"));
        assert_eq!(bus.count(), 2);
    }

    #[test]
    fn test_recursion_guard_stops_runaway_handlers() {
        let bus = ErrorBus::new();
        bus.register_handler(ErrorCategory::Runtime, |_| Err("again".into()));
        bus.register_handler(ErrorCategory::Internal, |_| Err("and again".into()));

        bus.track_error(ErrorCategory::Runtime, ErrorReport::new("first"));

        // runtime (depth 1) -> internal (2) -> internal (3) -> dropped
        assert_eq!(bus.count(), MAX_DEPTH as usize);
        assert_eq!(bus.dropped_count(), 1);
        // The guard unwinds fully: a fresh report is accepted again.
        bus.register_handler(ErrorCategory::Runtime, |_| Ok(HandlerOutcome::Continue));
        assert!(bus.track_error(ErrorCategory::Runtime, ErrorReport::new("second")).is_some());
    }

    #[test]
    fn test_history_is_a_ring() {
        let bus = ErrorBus::with_capacity(3);
        for i in 0..5 {
            bus.track_error(ErrorCategory::System, ErrorReport::new(format!("e{i}")));
        }
        let messages: Vec<_> = bus.history().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["e2", "e3", "e4"]);
    }

    #[test]
    fn test_subscribers_and_enrichers_run() {
        let bus = ErrorBus::new();
        let analyzer = Arc::new(ImpactAnalyzer::new());
        analyzer.register_component("A", ["B"]);
        analyzer.register_component("B", Vec::<String>::new());
        bus.add_enricher(analyzer.clone());
        let counter = Arc::new(Counting::default());
        bus.subscribe(counter.clone());

        let event = bus
            .track_error(ErrorCategory::Runtime, ErrorReport::new("B broke").with_component("B"))
            .unwrap();
        let impact = event.impact.unwrap();
        assert!(impact.affected_components.contains(&"A".to_string()));
        assert!(impact.affected_components.contains(&"B".to_string()));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(analyzer.events_for_component("A").len(), 1);
    }

    #[test]
    fn test_trim_and_clear() {
        let bus = ErrorBus::new();
        bus.track_error(ErrorCategory::System, ErrorReport::new("old"));
        assert_eq!(bus.trim_older_than(Duration::from_secs(3600)), 0);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(bus.trim_older_than(Duration::ZERO), 1);
        bus.track_error(ErrorCategory::System, ErrorReport::new("new"));
        bus.clear();
        assert_eq!(bus.count(), 0);
    }
}

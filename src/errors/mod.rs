//! Categorized error tracking: the bus, its events, and blast-radius analysis.
//!
//! ## Examples
//!
//! ```rust
//! use std::sync::Arc;
//! use proctor::errors::{ErrorBus, ErrorReport, ImpactAnalyzer};
//! use proctor_core::ErrorCategory;
//!
//! let bus = ErrorBus::new();
//! let impact = Arc::new(ImpactAnalyzer::new());
//! impact.register_component("api", ["db"]);
//! bus.add_enricher(impact);
//!
//! let event = bus
//!     .track_error(ErrorCategory::Network, ErrorReport::new("connection refused").with_component("db"))
//!     .expect("first-level report is never dropped");
//! assert_eq!(event.impact.expect("enriched").affected_components, vec!["db", "api"]);
//! ```

pub mod bus;
pub mod event;
pub mod impact;
pub mod recovery;

pub use bus::{ErrorBus, ErrorEnricher, ErrorHandler, ErrorSubscriber, HandlerOutcome, HandlerResult};
pub use event::{ErrorEvent, ErrorReport, SourceLocation};
pub use impact::{ImpactAnalyzer, ImpactEvent, ImpactMetrics};

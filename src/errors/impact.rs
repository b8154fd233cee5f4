//! Blast-radius analysis over a registered component dependency graph.
//!
//! Components register the components they depend on. When an error is attributed to a component, every component
//! that transitively depends on it is affected: if `A` depends on `B` and `B` fails, `A` is affected too.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::{Mutex, PoisonError, RwLock};

use proctor_core::{CategorySeverity, ErrorCategory};
use serde::Serialize;

use super::bus::{DEFAULT_HISTORY_CAPACITY, ErrorEnricher};
use super::event::ErrorEvent;
use super::recovery;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpactMetrics {
    pub severity: CategorySeverity,
    pub affected_components: Vec<String>,
    pub cascading_effects: Vec<String>,
    pub recovery_steps: Vec<String>,
    pub estimated_recovery_minutes: u64,
}

/// A recorded analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpactEvent {
    pub error_id: u64,
    pub category: ErrorCategory,
    pub source: String,
    pub timestamp: u64,
    pub metrics: ImpactMetrics,
}

/// Dependency graph plus a bounded log of past analyses (oldest dropped first).
#[derive(Debug)]
pub struct ImpactAnalyzer {
    /// component -> components it depends on
    dependencies: RwLock<BTreeMap<String, BTreeSet<String>>>,
    events: Mutex<VecDeque<ImpactEvent>>,
    capacity: usize,
}

impl Default for ImpactAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl ImpactAnalyzer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    /// Keep at most `capacity` impact events.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            dependencies: RwLock::new(BTreeMap::new()),
            events: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Register (or replace) a component and its direct dependencies.
    pub fn register_component<I, S>(&self, component: impl Into<String>, dependencies: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let deps = dependencies.into_iter().map(Into::into).collect();
        self.dependencies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(component.into(), deps);
    }

    /// The source plus every component that transitively depends on it, in discovery order.
    pub fn find_affected_components(&self, source: &str) -> Vec<String> {
        let graph = self.dependencies.read().unwrap_or_else(PoisonError::into_inner);
        let mut affected = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue = VecDeque::from([source.to_string()]);
        visited.insert(source.to_string());

        while let Some(component) = queue.pop_front() {
            for (dependent, deps) in graph.iter() {
                if deps.contains(&component) && visited.insert(dependent.clone()) {
                    queue.push_back(dependent.clone());
                }
            }
            affected.push(component);
        }
        affected
    }

    /// Severity from category and blast radius.
    ///
    /// ## Notes
    /// - runtime with more than 5 affected is critical, network with more than 3 is high, any category with more
    ///   than 2 is medium, everything else is low.
    pub fn calculate_severity(category: ErrorCategory, affected: usize) -> CategorySeverity {
        match category {
            ErrorCategory::Runtime if affected > 5 => CategorySeverity::Critical,
            ErrorCategory::Network if affected > 3 => CategorySeverity::High,
            _ if affected > 2 => CategorySeverity::Medium,
            _ => CategorySeverity::Low,
        }
    }

    /// `"<component> affects <deps>"` for each affected component that has dependencies.
    pub fn cascading_effects(&self, affected: &[String]) -> Vec<String> {
        let graph = self.dependencies.read().unwrap_or_else(PoisonError::into_inner);
        affected
            .iter()
            .filter_map(|component| {
                let deps = graph.get(component).filter(|deps| !deps.is_empty())?;
                let deps: Vec<&str> = deps.iter().map(String::as_str).collect();
                Some(format!("{component} affects {}", deps.join(", ")))
            })
            .collect()
    }

    pub fn analyze(&self, category: ErrorCategory, source: &str) -> ImpactMetrics {
        let affected_components = self.find_affected_components(source);
        let severity = Self::calculate_severity(category, affected_components.len());
        ImpactMetrics {
            severity,
            cascading_effects: self.cascading_effects(&affected_components),
            recovery_steps: recovery::steps_for(category).iter().map(|s| s.to_string()).collect(),
            estimated_recovery_minutes: recovery::estimate_minutes(severity, affected_components.len()),
            affected_components,
        }
    }

    pub fn events(&self) -> Vec<ImpactEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).iter().cloned().collect()
    }

    pub fn events_for_component(&self, component: &str) -> Vec<ImpactEvent> {
        self.filter_events(|e| e.metrics.affected_components.iter().any(|c| c == component))
    }

    pub fn high_severity_events(&self) -> Vec<ImpactEvent> {
        self.filter_events(|e| e.metrics.severity.is_high_or_critical())
    }

    pub fn clear_events(&self) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    fn filter_events(&self, keep: impl Fn(&ImpactEvent) -> bool) -> Vec<ImpactEvent> {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        events.iter().filter(|e| keep(e)).cloned().collect()
    }
}

impl ErrorEnricher for ImpactAnalyzer {
    fn enrich(&self, event: &mut ErrorEvent) {
        let source = event.component();
        let metrics = self.analyze(event.category, &source);
        tracing::debug!(
            %source,
            severity = %metrics.severity,
            affected = metrics.affected_components.len(),
            minutes = metrics.estimated_recovery_minutes,
            "impact analysis"
        );
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(ImpactEvent {
            error_id: event.id,
            category: event.category,
            source,
            timestamp: event.timestamp,
            metrics: metrics.clone(),
        });
        drop(events);
        event.impact = Some(metrics);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorReport;

    #[test]
    fn test_reverse_dependency_closure() {
        let analyzer = ImpactAnalyzer::new();
        analyzer.register_component("A", ["B"]);
        analyzer.register_component("B", Vec::<String>::new());
        analyzer.register_component("C", ["A"]);
        analyzer.register_component("D", ["X"]);

        assert_eq!(analyzer.find_affected_components("B"), vec!["B", "A", "C"]);
        assert_eq!(analyzer.find_affected_components("C"), vec!["C"]);
    }

    #[test]
    fn test_cycles_terminate() {
        let analyzer = ImpactAnalyzer::new();
        analyzer.register_component("A", ["B"]);
        analyzer.register_component("B", ["A"]);
        let mut affected = analyzer.find_affected_components("A");
        affected.sort();
        assert_eq!(affected, vec!["A", "B"]);
    }

    #[test]
    fn test_severity_thresholds() {
        use ErrorCategory::*;
        assert_eq!(ImpactAnalyzer::calculate_severity(Runtime, 6), CategorySeverity::Critical);
        assert_eq!(ImpactAnalyzer::calculate_severity(Runtime, 5), CategorySeverity::Medium);
        assert_eq!(ImpactAnalyzer::calculate_severity(Network, 4), CategorySeverity::High);
        assert_eq!(ImpactAnalyzer::calculate_severity(Build, 3), CategorySeverity::Medium);
        assert_eq!(ImpactAnalyzer::calculate_severity(Build, 2), CategorySeverity::Low);
    }

    #[test]
    fn test_analyze_fills_effects_and_recovery() {
        let analyzer = ImpactAnalyzer::new();
        analyzer.register_component("api", ["db"]);
        analyzer.register_component("web", ["api", "cdn"]);

        let metrics = analyzer.analyze(ErrorCategory::Network, "db");
        assert_eq!(metrics.affected_components, vec!["db", "api", "web"]);
        assert_eq!(metrics.cascading_effects, vec!["api affects db", "web affects api, cdn"]);
        assert_eq!(metrics.recovery_steps[0], "Check network connectivity");
        assert_eq!(metrics.severity, CategorySeverity::Medium);
        assert_eq!(metrics.estimated_recovery_minutes, 30);
    }

    #[test]
    fn test_event_log_drops_oldest_past_capacity() {
        let analyzer = ImpactAnalyzer::with_capacity(2);
        analyzer.register_component("api", ["db"]);
        for id in 1..=3 {
            let report = ErrorReport::new("down").with_component("db");
            let mut event = ErrorEvent::from_report(id, ErrorCategory::Network, report, id);
            analyzer.enrich(&mut event);
            assert!(event.impact.is_some());
        }
        let ids: Vec<u64> = analyzer.events().iter().map(|e| e.error_id).collect();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(analyzer.events_for_component("api").len(), 2);
    }
}

//! Shared test-file naming conventions.
//!
//! These are plain string rules with no regex or filesystem access, so the worker side and the orchestrator side
//! agree on them without sharing any runtime state.

use serde::{Deserialize, Serialize};

/// Filename marker for frontend tests (`button.frontend.test.tsx`).
pub const FRONTEND_MARKER: &str = ".frontend.";
/// Filename marker for backend tests (`api.backend.spec.ts`).
pub const BACKEND_MARKER: &str = ".backend.";
/// Filename marker for integration tests (`db.integration.test.ts`).
pub const INTEGRATION_MARKER: &str = ".integration.";

/// Directory names that mark their contents as integration tests.
pub const INTEGRATION_DIRS: &[&str] = &["integration", "e2e"];
/// Directory names that mark their contents as self-tests of the orchestrator.
pub const SELF_DIRS: &[&str] = &["self"];

/// Default test filename regex used when none is configured.
pub const DEFAULT_TEST_PATTERN: &str = r"\.(test|spec)\.(ts|tsx|js|jsx)$";

/// Which slice of the test suite a run selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestType {
    Frontend,
    Backend,
    #[serde(rename = "self")]
    SelfTests,
    #[default]
    All,
}

impl TestType {
    pub fn as_str(self) -> &'static str {
        match self {
            TestType::Frontend => "frontend",
            TestType::Backend => "backend",
            TestType::SelfTests => "self",
            TestType::All => "all",
        }
    }

    /// Whether a path that already matched the test pattern belongs to this slice.
    ///
    /// ## Notes
    /// - `frontend`/`backend` require the marker directly before the `test`/`spec` segment.
    /// - `self` selects files carrying neither marker anywhere in the path.
    pub fn selects(self, path: &str) -> bool {
        match self {
            TestType::All => true,
            TestType::Frontend => has_marker_before_test_segment(file_name(path), FRONTEND_MARKER),
            TestType::Backend => has_marker_before_test_segment(file_name(path), BACKEND_MARKER),
            TestType::SelfTests => !path.contains(FRONTEND_MARKER) && !path.contains(BACKEND_MARKER),
        }
    }
}

impl std::fmt::Display for TestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category inferred for a single test file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestCategory {
    Unit,
    Integration,
    #[serde(rename = "self")]
    SelfTest,
    Frontend,
    Backend,
}

impl TestCategory {
    /// Infer the category from filename markers first, then from directory names.
    pub fn infer(path: &str) -> Self {
        let name = file_name(path);
        if name.contains(FRONTEND_MARKER) {
            return TestCategory::Frontend;
        }
        if name.contains(BACKEND_MARKER) {
            return TestCategory::Backend;
        }
        if name.contains(INTEGRATION_MARKER) {
            return TestCategory::Integration;
        }
        let mut dirs = path.split(['/', '\\']).rev().skip(1);
        if dirs.clone().any(|d| INTEGRATION_DIRS.contains(&d)) {
            return TestCategory::Integration;
        }
        if dirs.any(|d| SELF_DIRS.contains(&d)) {
            return TestCategory::SelfTest;
        }
        TestCategory::Unit
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TestCategory::Unit => "unit",
            TestCategory::Integration => "integration",
            TestCategory::SelfTest => "self",
            TestCategory::Frontend => "frontend",
            TestCategory::Backend => "backend",
        }
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

fn has_marker_before_test_segment(name: &str, marker: &str) -> bool {
    ["test.", "spec."].iter().any(|segment| name.contains(&format!("{marker}{segment}")))
}

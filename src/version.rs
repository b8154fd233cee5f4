//! Proctor version information.
//!
//! The value is taken from Cargo metadata (`CARGO_PKG_VERSION`) at compile time. Both binaries and the CLI
//! `--version` flag read it from here.

/// The proctor version string (for example, `0.1.0-alpha.1`).
pub const PROCTOR_VERSION: &str = env!("CARGO_PKG_VERSION");

//! Layering guardrails to keep the vocabulary crate free of runtime dependencies.
//!
//! `proctor_core` is shared with executor implementations and the fuzz target, so it may only depend on `serde` and
//! `serde_json`. This test scans its `Cargo.toml` and fails if anything else appears in `[dependencies]`.

const ALLOWED: &[&str] = &["serde", "serde_json"];

#[test]
fn core_crate_depends_only_on_serde() {
    let manifest = include_str!("../crates/proctor_core/Cargo.toml");
    let mut in_dependencies = false;

    for raw_line in manifest.lines() {
        let line = raw_line.trim();
        if line.starts_with('[') {
            in_dependencies = line == "[dependencies]";
            continue;
        }

        if !in_dependencies || line.is_empty() || line.starts_with('#') {
            continue;
        }

        let name = line.split(['=', ' ']).next().unwrap_or("").trim();
        assert!(
            ALLOWED.contains(&name),
            "`{name}` must not appear in proctor_core's [dependencies]; keep IO and async in the root crate"
        );
    }
}

#[test]
fn root_crate_uses_core_as_a_path_dependency() {
    let manifest = include_str!("../Cargo.toml");
    assert!(
        manifest
            .lines()
            .any(|line| line.trim_start().starts_with("proctor_core") && line.contains("path = \"crates/proctor_core\"")),
        "the root crate must depend on the in-tree proctor_core"
    );
}

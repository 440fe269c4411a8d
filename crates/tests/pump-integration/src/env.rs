//! Test gating.

/// Whether the Docker-backed integration tests are enabled.
///
/// Gated behind `MAILPUMP_INTEGRATION_TESTS=1` so plain `cargo test` passes
/// on machines without Docker.
pub fn integration_tests_enabled() -> bool {
    std::env::var("MAILPUMP_INTEGRATION_TESTS")
        .map(|value| value == "1")
        .unwrap_or(false)
}

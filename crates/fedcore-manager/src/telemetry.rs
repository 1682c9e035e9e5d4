//! A `tracing_subscriber` initializer for this workspace's own tests and
//! examples, gated behind the `test-util` feature.
//!
//! Grounded in `cmd/operator/src/main.rs`'s `log_filter` CLI flag (an
//! `EnvFilter` directive string, default `"info"`) — the teacher's own
//! `telemetry` crate builds a fuller `LogFormat`-driven subscriber (JSON or
//! text, optionally exporting to an OpenTelemetry collector) for production
//! use, but that file wasn't retrieved into this pack and process bootstrap
//! is explicitly out of scope here (§1). This is a plain `fmt` layer with an
//! `EnvFilter`, the minimum needed so this workspace's own tests can assert
//! on or eyeball `tracing` output without every test writing its own
//! subscriber setup.
//!
//! The host gateway process installs its own production subscriber; nothing
//! in this module is meant to run inside it.

use tracing_subscriber::EnvFilter;

/// Install a `fmt` subscriber filtered by `RUST_LOG` (falling back to
/// `default_directive` when unset), for the current test binary only.
/// Safe to call more than once per process — a subscriber already installed
/// by an earlier test is left in place.
pub fn init_test_tracing(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

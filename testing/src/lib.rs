//! # Courier Testing
//!
//! Test support for the Courier messaging stack: the synchronous
//! [`DirectTransporter`] with its explicit [`DirectHub`] registry, and a
//! logging helper for test binaries.
//!
//! The direct transporter exists to make end-to-end protocol tests
//! deterministic and free of networked I/O — a full request/reply exchange,
//! forwards included, completes inside a single `send_request` call.

mod direct;

pub use direct::{DirectHub, DirectTransporter};

/// Install a test-friendly tracing subscriber, once.
///
/// Respects `RUST_LOG` and writes through the test capture writer; calling
/// it from every test is fine, later calls are no-ops.
pub fn init_test_logging() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

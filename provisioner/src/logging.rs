//! Diagnostic tracing for the orchestrator.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: operator diagnostics via `RUST_LOG`, output to
//!   stderr. Not persisted, not part of any job's output.
//!
//! - **Job output (`broadcast`, `io/job_store`)**: product data. Every tool
//!   line lands in the job's event log and `jobs/<id>.log`, unaffected by
//!   `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; falls back to `default_directive` when unset or invalid.
/// Output: stderr, compact format. Calling it twice is harmless.
///
/// # Example
/// ```bash
/// RUST_LOG=provisioner=debug provisioner run plan --workspace dev
/// ```
pub fn init(default_directive: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}

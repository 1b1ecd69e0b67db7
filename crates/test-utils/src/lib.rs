pub mod builders;
pub mod control;
pub mod recorder;

use std::sync::Once;

use planloop::engine::{CycleReport, ExecutionEngine};
use planloop::errors::PlanError;
use tracing_subscriber::{fmt, EnvFilter};

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// - Uses `with_test_writer()`, so logs are captured per-test.
/// - The Rust test harness only prints captured output for **failing** tests
///   (unless you run with `-- --nocapture`).
///
/// Enable levels with e.g.:
/// `RUST_LOG=planloop=debug cargo test`
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer() // print only for failing tests unless --nocapture
            .with_target(true)
            .init();
    });
}

/// Run a future with a 5-second timeout.
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(std::time::Duration::from_secs(5), f)
        .await
        .expect("Test timed out after 5 seconds")
}

/// Run `cycles` engine cycles, stopping at the first error.
pub fn run_cycles(engine: &mut ExecutionEngine, cycles: usize) -> Result<Vec<CycleReport>, PlanError> {
    (0..cycles).map(|_| engine.process_events()).collect()
}

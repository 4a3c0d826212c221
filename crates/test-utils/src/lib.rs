//! Shared fixtures for the jobgraph test suites.
//!
//! - [`builders`] holds scripted work, a name-addressed `GraphBuilder` and a
//!   config builder.
//! - [`fake_executor`] holds an `ExecutorBackend` that records dispatch order
//!   and reports outcomes inline.

pub mod builders;
pub mod fake_executor;

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Bound on any single runtime test; a scheduler that stops making progress
/// fails the test instead of hanging it.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Install a tracing subscriber for tests, once per test binary.
///
/// The filter comes from `RUST_LOG` (e.g. `RUST_LOG=jobgraph=debug`) and
/// falls back to `info`. Output goes through the test writer, so it only
/// shows for failing tests unless `--nocapture` is passed. The binary's own
/// `JOBGRAPH_LOG` variable is not consulted here.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .init();
    });
}

/// Await `f`, panicking if it does not finish within [`TEST_TIMEOUT`].
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: Future<Output = T>,
{
    tokio::time::timeout(TEST_TIMEOUT, f)
        .await
        .unwrap_or_else(|_| panic!("test timed out after {TEST_TIMEOUT:?}"))
}

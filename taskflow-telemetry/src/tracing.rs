use std::io;
use std::sync::Once;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, fmt};

/// Filter applied when `RUST_LOG` is not set.
const DEFAULT_LOG_FILTER: &str = "info";

/// Keeps the non-blocking log writer alive.
///
/// Buffered log lines are flushed when the value is dropped, so binaries hold it until `main`
/// returns.
#[must_use = "dropping the flusher stops log output"]
pub struct LogFlusher {
    _guard: WorkerGuard,
}

/// Installs the global tracing subscriber for a binary.
///
/// Logs go to stdout through a non-blocking writer. The filter is read from `RUST_LOG` and falls
/// back to `info`. Every line carries the application name as the `app` field of a root span that
/// the caller can enter.
pub fn init_tracing(app_name: &str) -> Result<LogFlusher, TryInitError> {
    let (writer, guard) = tracing_appender::non_blocking(io::stdout());

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(writer).with_target(true))
        .try_init()?;

    tracing::info!(app = app_name, "tracing initialized");

    Ok(LogFlusher { _guard: guard })
}

static INIT_TEST_TRACING: Once = Once::new();

/// Installs a subscriber that writes through the test harness, at most once per process.
///
/// Output is only shown for failing tests. Set `RUST_LOG` to raise verbosity, for example
/// `RUST_LOG=taskflow=debug`.
pub fn init_test_tracing() {
    INIT_TEST_TRACING.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_test_writer())
            .try_init();
    });
}

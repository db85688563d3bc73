//! `tracing`/`tracing-subscriber` setup for the `igvm` CLI: a colored,
//! human-readable layer by default, or single-line JSON when stderr isn't
//! a TTY or `--log-format json` is passed.

use anyhow::Result;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Initialize human-readable logging at `level` (one of `error`, `warn`,
/// `info`, `debug`, `trace`), honouring `RUST_LOG` if set.
pub fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_timer(ChronoLocal::new("%H:%M:%S%.3f".to_string())),
        )
        .init();

    Ok(())
}

/// Initialize single-line JSON logging at `level`, for piping to a log
/// aggregator instead of a terminal.
pub fn init_logging_json(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().with_target(true).with_current_span(true))
        .init();

    Ok(())
}

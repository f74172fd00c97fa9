//! Minimal `tracing`/`tracing-subscriber` wiring shared by every binary and
//! test harness in this workspace. Trimmed from
//! `firezone-firezone/rust/libs/logging`: no Sentry layer, no Windows event
//! log, no log-file rotation — those belong to the GUI/mobile app shells,
//! which are out of scope here (§1).

use anyhow::{Context, Result};
use tracing::Subscriber;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _};

/// Registers a global subscriber: an `EnvFilter` parsed from `directives`
/// (e.g. `RUST_LOG`-style) plus a plain stdout `fmt` layer.
pub fn init(directives: &str) -> Result<()> {
    let filter = parse_filter(directives)?;
    let subscriber = Registry::default().with(filter).with(fmt::layer().with_target(true));

    set_global(subscriber)
}

/// A scoped subscriber for a single test: dropped at the end of the guard's
/// lifetime rather than installed process-wide, so parallel `#[tokio::test]`
/// runs don't fight over the global dispatcher.
pub fn test_subscriber(directives: &str) -> Result<DefaultGuard> {
    let filter = parse_filter(directives)?;
    let subscriber = Registry::default().with(filter).with(fmt::layer().with_test_writer());

    Ok(tracing::dispatcher::set_default(&subscriber.into()))
}

fn parse_filter(directives: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(directives).with_context(|| format!("invalid filter directives: {directives}"))
}

fn set_global(subscriber: impl Subscriber + Send + Sync + 'static) -> Result<()> {
    tracing::subscriber::set_global_default(subscriber).context("could not install global tracing subscriber")
}

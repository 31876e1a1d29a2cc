use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// Directives come from `RUST_LOG`; the default level is `info`. Call once,
/// before anything else logs.
pub fn configure_tracing() {
    let timer = tracing_subscriber::fmt::time();
    let format = tracing_subscriber::fmt::format::Format::default()
        .with_timer(timer)
        .with_target(false)
        .compact();

    let fmt_layer = tracing_subscriber::fmt::Layer::default()
        .with_writer(std::io::stdout)
        .event_format(format);

    let env_filter_layer = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::Registry::default()
        .with(fmt_layer)
        .with(env_filter_layer)
        .init();
}

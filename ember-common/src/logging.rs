use std::str::FromStr;

use serde::Deserialize;
use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    Layer, filter::FilterFn, prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt,
};

#[macro_export]
macro_rules! log {
    ($level:expr, $span:expr, $($msg:tt)*) => {{
        let span = $crate::tracing::span!($level, $span);
        let _enter = span.enter();

        $crate::tracing::event!($level, $($msg)*)
    }};
}

/// Lifecycle logging for the engine itself (startup, shutdown, state changes)
#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($msg:tt)*) => {
        $crate::log!($crate::tracing::Level::$level, "internal", $($msg)*)
    };

    ($($msg:tt)*) => {
        $crate::internal!(level = TRACE, $($msg)*)
    };
}

/// Output format for the log layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

fn level_from_env() -> LevelFilter {
    let default = if cfg!(debug_assertions) {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    };

    std::env::var("LOG_LEVEL").map_or(default, |level| {
        LevelFilter::from_str(level.as_str()).unwrap_or_else(|_| {
            eprintln!("Invalid log level specified {level}, defaulting to {default}");
            default
        })
    })
}

fn ember_only() -> FilterFn {
    FilterFn::new(|metadata| metadata.target().starts_with("ember"))
}

pub fn init() {
    init_with(LogFormat::default());
}

pub fn init_with(format: LogFormat) {
    let level = level_from_env();

    let layer = match format {
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .with_file(false)
            .with_line_number(false)
            .compact()
            .with_ansi(true)
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
            .with_filter(level)
            .with_filter(ember_only())
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
            .with_filter(level)
            .with_filter(ember_only())
            .boxed(),
    };

    // A second init (tests, embedded use) keeps the first subscriber.
    let _ = tracing_subscriber::Registry::default().with(layer).try_init();
}

//! Tracing setup for both sides of a link.
//!
//! Output always goes to stderr: a child's stdout carries the channel, so a
//! single stray log line on stdout would corrupt the framing.
//!
//! - `RUST_LOG` wins when set.
//! - Otherwise `PROCLINK_LOG` (`debug`, `info`, `warn`, `error`) sets the level
//!   for this crate, default `info`.
//! - `LOG_FORMAT=json` switches to JSON lines.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_LEVEL_ENV: &str = "PROCLINK_LOG";
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

fn base_level(value: Option<&str>) -> &'static str {
    match value {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

fn filter_directive(value: Option<&str>) -> String {
    let level = base_level(value);
    format!("proclink={level},proclink_fixture={level}")
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = std::env::var(LOG_LEVEL_ENV).ok();
        EnvFilter::new(filter_directive(level.as_deref()))
    };

    let use_json = std::env::var(LOG_FORMAT_ENV).as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

//! Tracing setup.
//!
//! Output always goes to stderr: in stdio transport mode stdout carries the
//! protocol stream.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn filter_for_level(level: Option<&str>) -> EnvFilter {
    let base_level = match level {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    EnvFilter::new(format!(
        "unity_bridge={level},unity_bridge::bridge::codec=warn",
        level = base_level
    ))
}

/// Initialize tracing with `RUST_LOG`, `UNITY_BRIDGE_LOG` and `LOG_FORMAT`
/// support. Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        filter_for_level(std::env::var("UNITY_BRIDGE_LOG").ok().as_deref())
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

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

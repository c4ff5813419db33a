//! Tracing initialisation
//!
//! Log lines go to stderr so command output on stdout stays clean. The
//! daemon and watchdog are started with stderr redirected into
//! `service/daemon.log` and `service/watchdog.log`.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter applied to one-shot CLI commands when `RUST_LOG` is unset
pub const CLI_FILTER: &str = "nightshift=warn";

/// Install the global subscriber.
///
/// `default_filter` applies when `RUST_LOG` is not set; a bare level such as
/// `"info"` is scoped to this crate. `json` switches to one JSON object per
/// line. Calling this twice is harmless; the second call is ignored.
pub fn init_tracing(default_filter: &str, json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(scoped_filter(default_filter)));
    let fmt = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let result = if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt.json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt)
            .try_init()
    };
    if result.is_err() {
        tracing::debug!("tracing already initialised");
    }
}

fn scoped_filter(filter: &str) -> String {
    match filter {
        "trace" | "debug" | "info" | "warn" | "error" | "off" => format!("nightshift={}", filter),
        other => other.to_string(),
    }
}

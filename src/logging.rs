//! Structured logging setup (§1 ambient stack).
//!
//! Console or JSON output over `tracing-subscriber`'s `fmt` layer, filtered
//! by an `EnvFilter` directive string. Grounded on the teacher's
//! `telemetry.rs::init_tracing`, stripped down to the console/JSON `fmt`
//! layer only — the OpenTelemetry OTLP exporter the teacher wires in
//! alongside it is a logging/metrics *transport*, which §1's Non-goals
//! explicitly exclude.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initializes the global `tracing` subscriber. `directive` is an
/// `EnvFilter` string (e.g. `"info"`, `"kaosnet=debug,tower=warn"`);
/// `json` selects structured JSON records over human-readable ones.
///
/// Call once at process startup, before constructing a [`crate::server::Runtime`].
pub fn init(directive: &str, json: bool) {
    let filter = EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

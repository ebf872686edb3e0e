// =============================================================================
// Error Policy — per-component failure severity
// =============================================================================
//
// A central map from component name to how its failures are handled:
//
//   Critical   abort startup / restart the engine with backoff
//   Degraded   log, disable the feature for the session, keep trading
//   Transient  retry with exponential backoff
//   LocalData  log and keep trading (bad bar, stale book, NaN indicator)

use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Critical,
    Degraded,
    Transient,
    LocalData,
}

/// Default severity for a named component.
pub fn classify(component: &str) -> Severity {
    match component {
        "database" | "instance_lock" | "venue_rest_startup" => Severity::Critical,
        "websocket" | "venue_rest" | "candle_poll" => Severity::Transient,
        "market_data" | "indicators" | "order_book" => Severity::LocalData,
        // Everything optional: mirror, ML, notifier, billing, chat surfaces.
        _ => Severity::Degraded,
    }
}

/// Handle a subsystem initialization error according to its severity.
/// Critical errors propagate; everything else is logged and swallowed so
/// the engine starts without the feature.
pub fn handle_init_error(component: &str, error: anyhow::Error) -> anyhow::Result<()> {
    match classify(component) {
        Severity::Critical => {
            error!(component, error = %error, "critical subsystem failed to initialize");
            Err(error.context(format!("critical subsystem '{component}' failed")))
        }
        severity => {
            warn!(
                component,
                ?severity,
                error = %error,
                "subsystem degraded; continuing without it"
            );
            Ok(())
        }
    }
}

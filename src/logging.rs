use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is not set. While the step display owns the
/// terminal only warnings are printed.
pub fn default_filter(debug: bool, tui_active: bool) -> &'static str {
    match (debug, tui_active) {
        (true, _) => "skiptracer=debug,info",
        (false, true) => "warn",
        (false, false) => "info",
    }
}

/// Installs the global subscriber. Logs go to stderr so they never mix with
/// CSV or progress output on stdout.
pub fn init(debug: bool, tui_active: bool) {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(debug, tui_active).into()))
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_wins_over_tui_quiet() {
        assert_eq!(default_filter(true, true), "skiptracer=debug,info");
        assert_eq!(default_filter(false, true), "warn");
        assert_eq!(default_filter(false, false), "info");
    }
}

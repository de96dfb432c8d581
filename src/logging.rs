use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initializes the tracing subscriber with a JSON formatter.
///
/// The configured level applies to this crate only; the webrtc stack and
/// other dependencies stay at `warn` so media loops do not flood the log.
/// A `RUST_LOG` value replaces the whole filter.
pub fn init(level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

    // Events carry their context as fields (`call`, `participant`, `track`);
    // flattening puts those at the top level of each JSON line.
    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn default_directives(level: &str) -> String {
    format!("warn,sfu={level}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_scope_crate_level() {
        assert_eq!(default_directives("debug"), "warn,sfu=debug");
        // The directive string must parse as a filter.
        assert!(EnvFilter::try_new(default_directives("trace")).is_ok());
    }
}

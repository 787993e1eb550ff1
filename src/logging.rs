//! Tracing initialization. Verbosity is driven by `DEBUG` rather than
//! `RUST_LOG` so operators only have one knob to reach for, matching the
//! deployment's existing environment contract.

/// Even with `DEBUG=1`, the vendored driver crates are noisy enough to
/// drown out the controller's own lines, so they're quieted the same way
/// `pymongo`/`urllib3` are held at `WARNING` regardless of the
/// deployment's own log level.
const NOISY_TARGETS: &[&str] = &["mongodb", "bollard"];

fn filter_directive(debug: bool) -> String {
    let own_level = if debug { "debug" } else { "info" };
    let mut directive = own_level.to_string();
    for target in NOISY_TARGETS {
        directive.push_str(&format!(",{target}=warn"));
    }
    directive
}

pub fn init(debug: bool) {
    let filter = tracing_subscriber::EnvFilter::new(filter_directive(debug));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_directive_raises_own_level_but_keeps_drivers_quiet() {
        let directive = filter_directive(true);
        assert!(directive.starts_with("debug"));
        assert!(directive.contains("mongodb=warn"));
        assert!(directive.contains("bollard=warn"));
    }

    #[test]
    fn default_directive_is_info() {
        assert!(filter_directive(false).starts_with("info"));
    }
}

use tracing_subscriber::EnvFilter;

/// Quiet dependencies unless `RUST_LOG` asks for them.
const NOISY_TARGETS: &[(&str, &str)] = &[
    ("sqlx", "warn"),
    ("sqlparser", "warn"),
    ("hyper", "warn"),
    ("reqwest", "warn"),
    ("h2", "warn"),
    ("tower_http", "info"),
];

fn build_env_filter(default_level: &str) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let mut directives = vec![default_level.to_string()];
    for (target, level) in NOISY_TARGETS {
        directives.push(format!("{}={}", target, level));
    }
    EnvFilter::try_new(directives.join(",")).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber. `RUST_LOG` overrides `default_level`.
/// Calling it again is a no-op.
pub fn init_logging(default_level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(build_env_filter(default_level))
        .with_target(true)
        .with_ansi(true)
        .try_init();
}

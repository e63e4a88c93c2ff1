use conveyor_core::config::ObservabilityConfig;
use tracing_subscriber::EnvFilter;

/// Filter directive: `RUST_LOG` wins, then `--dev`, then the config level.
pub fn filter_directive(config: &ObservabilityConfig, dev: bool) -> String {
    if let Ok(directive) = std::env::var("RUST_LOG") {
        if !directive.is_empty() {
            return directive;
        }
    }
    if dev {
        "debug".to_string()
    } else {
        config.level.clone()
    }
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init(config: &ObservabilityConfig, dev: bool) {
    let filter = EnvFilter::new(filter_directive(config, dev));
    let result = if config.json_format && !dev {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };
    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

//! Tracing subscriber setup.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogConfig;

/// `RUST_LOG` wins over the config file when set.
pub fn init_tracing(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(directives(config)).unwrap_or_else(|_| EnvFilter::new("info"))
    });

    if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

/// `"info,chainpoll_core=debug"` style directive string.
fn directives(config: &LogConfig) -> String {
    let mut components: Vec<_> = config.components.iter().collect();
    components.sort();
    let mut out = config.level.clone();
    for (component, level) in components {
        out.push_str(&format!(",{}={}", component.replace('-', "_"), level));
    }
    out
}

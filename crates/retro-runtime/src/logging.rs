//! Tracing subscriber setup

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Filter directives used when `RUST_LOG` is unset
    pub filter: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            filter: "info,retro_runtime=info,retro_transport=warn".to_string(),
            json: false,
        }
    }
}

impl LoggingConfig {
    pub fn json() -> Self {
        LoggingConfig {
            json: true,
            ..Default::default()
        }
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.filter))
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), TryInitError> {
    let json = config.json.then(|| fmt::layer().json().with_current_span(false));
    let text = (!config.json).then(|| fmt::layer().compact());

    tracing_subscriber::registry()
        .with(config.env_filter())
        .with(json)
        .with(text)
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_an_error() {
        let _ = init_logging(&LoggingConfig::default());
        assert!(init_logging(&LoggingConfig::json()).is_err());
    }
}

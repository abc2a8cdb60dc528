//! Tracing setup

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

pub type InitError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Install a global subscriber filtered by `RUST_LOG` (default `info`)
///
/// Fails if a global subscriber is already set.
pub fn init_tracing(format: LogFormat) -> Result<(), InitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    match format {
        LogFormat::Plain => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_subscriber_installs_once() {
        let _ = init_tracing(LogFormat::Json);
        assert!(init_tracing(LogFormat::Plain).is_err());
    }
}

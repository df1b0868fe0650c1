use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::TryInitError;

/// Installs a global subscriber: formatted events on stderr, and progress
/// bars for visual tasks. The filter is read from `RUST_LOG` and defaults to
/// `info`.
pub fn init_logging() -> Result<(), TryInitError> {
    let indicatif_layer = IndicatifLayer::new();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_writer(indicatif_layer.get_stderr_writer())
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(indicatif_layer)
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        // another test may have installed a subscriber first
        let _ = init_logging();
        assert!(init_logging().is_err());
    }
}

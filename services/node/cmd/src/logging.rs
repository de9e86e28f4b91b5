//! Log output setup.

use clap::ValueEnum;
use tracing_subscriber::EnvFilter;

/// Console log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable single-line output
    Simple,
    /// JSON lines for log shippers
    Structured,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "simple" => Ok(Self::Simple),
            "structured" => Ok(Self::Structured),
            other => Err(format!("unknown log format {other:?}")),
        }
    }
}

/// Initialize tracing. `RUST_LOG` overrides the level picked by `debug`.
pub fn init(format: LogFormat, debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match format {
        LogFormat::Simple => builder.init(),
        LogFormat::Structured => builder.json().init(),
    }
}

use std::fmt;

use log::{debug, LevelFilter};

const LOG_TARGET: &str = "comfyui_gen";

/// Debug context handed to each component at construction.
///
/// Routine progress is always logged at `debug` level through the `log`
/// facade. Payload dumps (merged parameters, full workflow bodies, resolved
/// configuration) are large, so they are only emitted when the plugin runs
/// with `DEBUG_MODE=true`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Diagnostics {
    verbose: bool,
}

impl Diagnostics {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    pub fn quiet() -> Self {
        Self { verbose: false }
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    pub fn dump(&self, label: &str, payload: impl fmt::Display) {
        if self.verbose {
            debug!(target: LOG_TARGET, "{}: {}", label, payload);
        }
    }

    pub fn dump_json(&self, label: &str, payload: &serde_json::Value) {
        if self.verbose {
            let rendered = serde_json::to_string_pretty(payload).unwrap_or_default();
            debug!(target: LOG_TARGET, "{}: {}", label, rendered);
        }
    }
}

/// Installs the stderr logger. `RUST_LOG` wins when set; otherwise the crate
/// logs at `debug` in verbose mode and everything else stays at `warn`.
pub fn init_logging(verbose: bool) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(LevelFilter::Warn);
    if verbose {
        builder.filter_module(LOG_TARGET, LevelFilter::Debug);
    }
    if let Ok(spec) = std::env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    }
    builder.target(env_logger::Target::Stderr);
    let _ = builder.try_init();
}

/// Interprets a `DEBUG_MODE`-style flag.
pub fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

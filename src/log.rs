//! `SRM_DEBUG`-driven log verbosity, layered on top of [`tracing`].
//!
//! This crate never installs a global `tracing` subscriber — that is the host application's job,
//! exactly as the teacher crate leaves subscriber setup to `anvil`/`smallvil`. What it does own is
//! translating the `SRM_DEBUG` environment variable into a verbosity floor that callers can consult
//! before doing expensive formatting work, and exposing it as a process-wide constant once read.

use std::sync::OnceLock;

/// Verbosity levels, ordered from quietest to loudest, matching `SRM_DEBUG`'s 0..4 range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// `SRM_DEBUG=0`: no logging at all.
    Silent = 0,
    /// `SRM_DEBUG=1`: unrecoverable errors only.
    Fatal = 1,
    /// `SRM_DEBUG=2`: fatal + recoverable errors.
    Error = 2,
    /// `SRM_DEBUG=3`: fatal + error + warnings.
    Warning = 3,
    /// `SRM_DEBUG=4`: everything, including debug traces.
    Debug = 4,
}

impl Verbosity {
    fn from_raw(v: u8) -> Verbosity {
        match v {
            0 => Verbosity::Silent,
            1 => Verbosity::Fatal,
            2 => Verbosity::Error,
            3 => Verbosity::Warning,
            // Unknown values (>=4) clamp to the loudest level.
            _ => Verbosity::Debug,
        }
    }

    /// The `tracing::Level` floor this verbosity corresponds to.
    pub fn tracing_level(&self) -> Option<tracing::Level> {
        match self {
            Verbosity::Silent => None,
            Verbosity::Fatal => Some(tracing::Level::ERROR),
            Verbosity::Error => Some(tracing::Level::ERROR),
            Verbosity::Warning => Some(tracing::Level::WARN),
            Verbosity::Debug => Some(tracing::Level::DEBUG),
        }
    }
}

static VERBOSITY: OnceLock<Verbosity> = OnceLock::new();

/// Reads and clamps `SRM_DEBUG`, caching the result for the lifetime of the process.
///
/// Per spec this is global mutable state initialized once; treat the return value as a constant.
pub fn verbosity() -> Verbosity {
    *VERBOSITY.get_or_init(|| {
        let raw = std::env::var("SRM_DEBUG")
            .ok()
            .and_then(|s| s.parse::<u8>().ok())
            .unwrap_or(0);
        Verbosity::from_raw(raw)
    })
}

/// True if messages at or above `level` should be emitted given the current `SRM_DEBUG` setting.
pub fn enabled(level: Verbosity) -> bool {
    verbosity() >= level
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_values_clamp_to_debug() {
        assert_eq!(Verbosity::from_raw(9), Verbosity::Debug);
        assert_eq!(Verbosity::from_raw(4), Verbosity::Debug);
    }

    #[test]
    fn ordering_matches_increasing_verbosity() {
        assert!(Verbosity::Silent < Verbosity::Fatal);
        assert!(Verbosity::Fatal < Verbosity::Error);
        assert!(Verbosity::Error < Verbosity::Warning);
        assert!(Verbosity::Warning < Verbosity::Debug);
    }
}

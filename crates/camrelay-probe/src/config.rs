//! Probe configuration.

use serde::{Deserialize, Serialize};

/// Bounds and program selection for reachability probes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Smallest timeout a caller may request (ms).
    pub min_timeout_ms: u64,
    /// Largest timeout a caller may request (ms).
    pub max_timeout_ms: u64,
    /// Timeout used when the caller gives none or an unusable value (ms).
    pub default_timeout_ms: u64,
    /// Extra time past the requested timeout before the process is killed (ms).
    pub kill_grace_ms: u64,
    /// Ping executable. A bare name is resolved through `PATH`.
    pub program: String,
    /// Arguments placed before the generated ping arguments.
    pub program_args: Vec<String>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            min_timeout_ms: 500,
            max_timeout_ms: 10_000,
            default_timeout_ms: 2_000,
            kill_grace_ms: 500,
            program: "ping".into(),
            program_args: Vec::new(),
        }
    }
}

impl ProbeConfig {
    /// Clamp a requested timeout into `[min_timeout_ms, max_timeout_ms]`.
    pub fn clamp_timeout(&self, requested_ms: u64) -> u64 {
        let (lo, hi) = self.bounds();
        requested_ms.clamp(lo, hi)
    }

    /// Resolve an optional, possibly non-numeric request value.
    ///
    /// Missing, `NaN` and zero fall back to `default_timeout_ms`. Every other
    /// value, infinities and negatives included, is truncated and clamped.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn resolve_timeout(&self, requested_ms: Option<f64>) -> u64 {
        match requested_ms {
            // `as` saturates: -inf and negatives become 0, +inf becomes u64::MAX.
            Some(ms) if ms.abs() > 0.0 => self.clamp_timeout(ms as u64),
            _ => self.clamp_timeout(self.default_timeout_ms),
        }
    }

    fn bounds(&self) -> (u64, u64) {
        if self.min_timeout_ms <= self.max_timeout_ms {
            (self.min_timeout_ms, self.max_timeout_ms)
        } else {
            (self.max_timeout_ms, self.min_timeout_ms)
        }
    }
}

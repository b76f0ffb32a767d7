//! Probe target classification.
//!
//! This is the only gate between a query-string value and the argument
//! vector of a subprocess, so it accepts a deliberately narrow grammar:
//!
//! - IPv4 dotted quad, each octet 0-255
//! - coarse IPv6: at least one `:` and nothing but hex digits and colons
//! - DNS hostname: dot-separated labels of 1-63 ASCII letters, digits and
//!   hyphens, no hyphen at either end of a label, 253 characters total
//!
//! The IPv6 rule is not an RFC 4291 validator; it only guarantees the
//! string is inert on a command line.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::errors::ProbeError;

/// Longest raw input considered at all, before trimming.
pub const MAX_INPUT_LEN: usize = 255;

/// Longest accepted hostname.
pub const MAX_HOSTNAME_LEN: usize = 253;

/// Longest accepted hostname label.
pub const MAX_LABEL_LEN: usize = 63;

static IPV4: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(25[0-5]|2[0-4][0-9]|1?[0-9]?[0-9])(\.(25[0-5]|2[0-4][0-9]|1?[0-9]?[0-9])){3}$")
        .expect("IPv4 pattern is valid")
});

static IPV6_COARSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-fA-F:]+$").expect("IPv6 pattern is valid"));

/// Result of classifying a candidate target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetClass {
    /// Dotted-quad IPv4 literal.
    Ipv4,
    /// Hex-and-colon IPv6 literal (coarse check).
    Ipv6,
    /// DNS hostname.
    Hostname,
    /// Anything else.
    Invalid,
}

impl TargetClass {
    /// Whether the input may be handed to a probe.
    pub fn is_valid(self) -> bool {
        !matches!(self, Self::Invalid)
    }
}

/// Classify a candidate probe target.
///
/// Length is checked on the raw input; the grammar is matched against the
/// trimmed input.
pub fn classify(input: &str) -> TargetClass {
    if input.chars().count() > MAX_INPUT_LEN {
        return TargetClass::Invalid;
    }
    let s = input.trim();
    if s.is_empty() {
        return TargetClass::Invalid;
    }
    if IPV4.is_match(s) {
        return TargetClass::Ipv4;
    }
    if s.contains(':') && IPV6_COARSE.is_match(s) {
        return TargetClass::Ipv6;
    }
    if is_hostname(s) {
        return TargetClass::Hostname;
    }
    TargetClass::Invalid
}

fn is_hostname(s: &str) -> bool {
    if s.is_empty() || s.len() > MAX_HOSTNAME_LEN {
        return false;
    }
    let mut last_label = "";
    for label in s.split('.') {
        if !is_label(label) {
            return false;
        }
        last_label = label;
    }
    // A numeric top-level label means a dotted quad that failed the IPv4
    // check (e.g. `999.1.1.1`); never reinterpret it as a name.
    !last_label.bytes().all(|b| b.is_ascii_digit())
}

fn is_label(label: &str) -> bool {
    let bytes = label.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_LABEL_LEN {
        return false;
    }
    if bytes[0] == b'-' || bytes[bytes.len() - 1] == b'-' {
        return false;
    }
    bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-')
}

/// A target string that passed [`classify`].
///
/// Probes only accept this type, so an unvalidated string cannot reach a
/// subprocess argument list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatedTarget {
    value: String,
    class: TargetClass,
}

impl ValidatedTarget {
    /// Validate and trim `input`.
    pub fn parse(input: &str) -> Result<Self, ProbeError> {
        match classify(input) {
            TargetClass::Invalid => Err(ProbeError::InvalidTarget),
            class => Ok(Self {
                value: input.trim().to_string(),
                class,
            }),
        }
    }

    /// The trimmed target string.
    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// Which grammar the target matched.
    pub fn class(&self) -> TargetClass {
        self.class
    }
}

impl fmt::Display for ValidatedTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl AsRef<str> for ValidatedTarget {
    fn as_ref(&self) -> &str {
        &self.value
    }
}

//! # camrelay-probe
//!
//! Diagnostic reachability probes for arbitrary network targets.
//!
//! - [`target`]: classifies untrusted strings as IPv4, IPv6 or hostname and
//!   produces a [`ValidatedTarget`], the only value a probe accepts
//! - [`runner`]: the [`Pinger`] trait and [`SystemPinger`], which runs the
//!   platform `ping` utility with an argument vector (never a shell) under a
//!   hard wall-clock kill
//! - [`config`]: timeout bounds and program selection

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod runner;
pub mod target;

pub use config::ProbeConfig;
pub use errors::ProbeError;
pub use runner::{Pinger, Platform, ProbeResult, SystemPinger, ping_args};
pub use target::{TargetClass, ValidatedTarget, classify};

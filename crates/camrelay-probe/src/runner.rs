//! Ping subprocess runner.
//!
//! The target is passed as a discrete argv element to the configured
//! program. No shell is involved at any point, and the child is killed once
//! `timeout + kill_grace` elapses or when the probing future is dropped.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::ProbeConfig;
use crate::errors::ProbeError;
use crate::target::ValidatedTarget;

/// How long to wait for output readers once the child is gone.
///
/// Anything the child forked may still hold the pipes open after a kill.
const OUTPUT_DRAIN: Duration = Duration::from_millis(250);

/// Argument dialect of the host `ping` utility.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Platform {
    /// BSD / iputils style: `-c <count> -W <seconds>`.
    Unix,
    /// Windows style: `-n <count> -w <milliseconds>`.
    Windows,
}

impl Platform {
    /// Dialect for the platform this binary was built for.
    pub fn current() -> Self {
        if cfg!(windows) { Self::Windows } else { Self::Unix }
    }
}

/// Build the argument vector for a single echo request.
///
/// Unix `-W` takes whole seconds, so the timeout is rounded up.
pub fn ping_args(platform: Platform, target: &ValidatedTarget, timeout_ms: u64) -> Vec<String> {
    match platform {
        Platform::Windows => vec![
            "-n".into(),
            "1".into(),
            "-w".into(),
            timeout_ms.to_string(),
            target.as_str().to_string(),
        ],
        Platform::Unix => vec![
            "-c".into(),
            "1".into(),
            "-W".into(),
            timeout_ms.div_ceil(1000).max(1).to_string(),
            target.as_str().to_string(),
        ],
    }
}

/// Outcome of one probe.
///
/// A timeout or non-zero exit is still a result, not an error.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    /// The utility exited with status 0.
    pub succeeded: bool,
    /// Wall-clock duration of the whole invocation.
    pub round_trip_ms: u64,
    /// Exit status, or `-1` when killed or terminated by a signal.
    pub exit_code: i32,
    /// Captured standard output (lossy UTF-8).
    pub stdout: String,
    /// Captured standard error (lossy UTF-8).
    pub stderr: String,
    /// The hard kill fired before the utility exited.
    pub timed_out: bool,
}

/// Runs a reachability probe against a validated target.
#[async_trait]
pub trait Pinger: Send + Sync {
    /// Probe `target`, allowing roughly `timeout_ms` for a reply.
    async fn probe(&self, target: &ValidatedTarget, timeout_ms: u64)
    -> Result<ProbeResult, ProbeError>;
}

/// [`Pinger`] backed by the host `ping` executable.
#[derive(Clone, Debug)]
pub struct SystemPinger {
    config: ProbeConfig,
    platform: Platform,
}

impl SystemPinger {
    /// Create a pinger for the current platform.
    pub fn new(config: ProbeConfig) -> Self {
        Self {
            config,
            platform: Platform::current(),
        }
    }

    /// Override the argument dialect.
    #[must_use]
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Active configuration.
    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.config.program);
        let _ = cmd
            .args(&self.config.program_args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Pinger for SystemPinger {
    async fn probe(
        &self,
        target: &ValidatedTarget,
        timeout_ms: u64,
    ) -> Result<ProbeResult, ProbeError> {
        let timeout_ms = self.config.clamp_timeout(timeout_ms);
        let args = ping_args(self.platform, target, timeout_ms);
        let start = Instant::now();

        debug!(program = %self.config.program, probe_target = %target, timeout_ms, "spawning probe");

        let mut child = self
            .command(&args)
            .spawn()
            .map_err(|source| ProbeError::Spawn {
                program: self.config.program.clone(),
                source,
            })?;

        let stdout_reader = OutputReader::spawn(child.stdout.take());
        let stderr_reader = OutputReader::spawn(child.stderr.take());

        let deadline = Duration::from_millis(timeout_ms.saturating_add(self.config.kill_grace_ms));

        let (exit_code, timed_out) = tokio::select! {
            status = child.wait() => {
                let status = status.map_err(ProbeError::Wait)?;
                (status.code().unwrap_or(-1), false)
            }
            () = tokio::time::sleep(deadline) => {
                let _ = child.kill().await;
                (-1, true)
            }
        };

        let stdout = stdout_reader.drain().await;
        let stderr = stderr_reader.drain().await;
        let round_trip_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        if timed_out {
            warn!(probe_target = %target, timeout_ms, round_trip_ms, "probe killed after deadline");
        } else {
            debug!(probe_target = %target, exit_code, round_trip_ms, "probe completed");
        }

        Ok(ProbeResult {
            succeeded: exit_code == 0,
            round_trip_ms,
            exit_code,
            stdout,
            stderr,
            timed_out,
        })
    }
}

/// Collects one output pipe on its own task.
///
/// Bytes land in the shared buffer as they are read, so output captured
/// before a drain timeout is kept.
struct OutputReader {
    buf: Arc<Mutex<Vec<u8>>>,
    handle: JoinHandle<()>,
}

impl OutputReader {
    fn spawn<R>(pipe: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = buf.clone();
        let handle = tokio::spawn(async move {
            let Some(mut pipe) = pipe else { return };
            let mut chunk = [0u8; 4096];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => sink.lock().extend_from_slice(&chunk[..n]),
                }
            }
        });
        Self { buf, handle }
    }

    /// Wait up to [`OUTPUT_DRAIN`] for EOF, then return what was read.
    async fn drain(mut self) -> String {
        if tokio::time::timeout(OUTPUT_DRAIN, &mut self.handle).await.is_err() {
            self.handle.abort();
        }
        let bytes = std::mem::take(&mut *self.buf.lock());
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(s: &str) -> ValidatedTarget {
        ValidatedTarget::parse(s).unwrap()
    }

    #[test]
    fn unix_args() {
        let args = ping_args(Platform::Unix, &target("192.168.1.64"), 2_000);
        assert_eq!(args, ["-c", "1", "-W", "2", "192.168.1.64"]);
    }

    #[test]
    fn unix_timeout_rounds_up_to_seconds() {
        let t = target("example.com");
        assert_eq!(ping_args(Platform::Unix, &t, 500)[3], "1");
        assert_eq!(ping_args(Platform::Unix, &t, 1_000)[3], "1");
        assert_eq!(ping_args(Platform::Unix, &t, 1_001)[3], "2");
        assert_eq!(ping_args(Platform::Unix, &t, 0)[3], "1");
    }

    #[test]
    fn windows_args() {
        let args = ping_args(Platform::Windows, &target("example.com"), 1_500);
        assert_eq!(args, ["-n", "1", "-w", "1500", "example.com"]);
    }

    #[test]
    fn target_is_last_and_single_argument() {
        let args = ping_args(Platform::Unix, &target("  nvr-01.local "), 2_000);
        assert_eq!(args.last().map(String::as_str), Some("nvr-01.local"));
        assert_eq!(args.len(), 5);
    }

    #[test]
    fn current_platform_matches_build() {
        let expected = if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Unix
        };
        assert_eq!(Platform::current(), expected);
    }

    #[test]
    fn probe_result_serializes() {
        let result = ProbeResult {
            succeeded: true,
            round_trip_ms: 12,
            exit_code: 0,
            stdout: "ok".into(),
            stderr: String::new(),
            timed_out: false,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["succeeded"], true);
        assert_eq!(json["round_trip_ms"], 12);
        assert_eq!(json["exit_code"], 0);
        assert_eq!(json["timed_out"], false);
    }

    #[tokio::test]
    async fn spawn_failure_is_error() {
        let pinger = SystemPinger::new(ProbeConfig {
            program: "/nonexistent/camrelay-ping".into(),
            ..ProbeConfig::default()
        });
        let err = pinger.probe(&target("127.0.0.1"), 1_000).await.unwrap_err();
        assert!(matches!(err, ProbeError::Spawn { .. }));
        assert!(!err.is_client_error());
    }

    /// Stand-in for `ping`: `sh -c <script> sh <ping args...>`, so the
    /// generated arguments arrive as `$1..$5` and the target is `$5`.
    #[cfg(unix)]
    fn scripted(script: &str) -> SystemPinger {
        SystemPinger::new(ProbeConfig {
            program: "sh".into(),
            program_args: vec!["-c".into(), script.into(), "sh".into()],
            min_timeout_ms: 50,
            kill_grace_ms: 50,
            ..ProbeConfig::default()
        })
        .with_platform(Platform::Unix)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn zero_exit_succeeds() {
        let pinger = scripted(r#"echo "reply from $5""#);
        let result = pinger.probe(&target("127.0.0.1"), 1_000).await.unwrap();
        assert!(result.succeeded);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout.trim(), "reply from 127.0.0.1");
        assert!(!result.timed_out);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn arguments_are_not_shell_interpreted() {
        // The script only echoes its positional args; none are evaluated.
        let pinger = scripted(r#"printf '%s|' "$@""#);
        let result = pinger.probe(&target("example.com"), 3_000).await.unwrap();
        assert_eq!(result.stdout, "-c|1|-W|3|example.com|");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_is_a_result() {
        let pinger = scripted("echo unreachable >&2; exit 3");
        let result = pinger.probe(&target("10.255.255.1"), 1_000).await.unwrap();
        assert!(!result.succeeded);
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stderr.trim(), "unreachable");
        assert!(!result.timed_out);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hung_probe_is_killed() {
        let pinger = scripted("sleep 30");
        let start = Instant::now();
        let result = pinger.probe(&target("127.0.0.1"), 100).await.unwrap();
        let elapsed = start.elapsed();

        assert!(result.timed_out);
        assert!(!result.succeeded);
        assert_eq!(result.exit_code, -1);
        assert!(
            elapsed < Duration::from_secs(5),
            "probe should be killed near its deadline, took {elapsed:?}"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn output_kept_when_pipe_outlives_child() {
        // The background sleep inherits stdout and holds it open past the drain window.
        let pinger = scripted("printf 'partial reply'; sleep 3 & exit 0");
        let result = pinger.probe(&target("127.0.0.1"), 1_000).await.unwrap();
        assert!(result.succeeded);
        assert_eq!(result.stdout, "partial reply");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn requested_timeout_is_clamped() {
        // 60s requested, clamped to 10s; the script reports the -W value.
        let pinger = scripted(r#"echo "$4""#);
        let result = pinger.probe(&target("127.0.0.1"), 60_000).await.unwrap();
        assert_eq!(result.stdout.trim(), "10");
    }

    #[tokio::test]
    #[ignore = "needs a ping binary with ICMP permissions"]
    async fn real_loopback_ping() {
        let pinger = SystemPinger::new(ProbeConfig::default());
        let result = pinger.probe(&target("127.0.0.1"), 2_000).await.unwrap();
        assert!(result.succeeded, "stderr: {}", result.stderr);
    }
}

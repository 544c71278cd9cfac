use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt as _, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::engine::EngineInner;

/// Exit code recorded for timed-out or shutdown-interrupted runs; the worker
/// re-queues these jobs as `pending`.
pub(crate) const RETRY_EXIT_CODE: i32 = -2;

/// Exit code synthesized when the child could not be spawned or waited on.
const SPAWN_FAILED_EXIT_CODE: i32 = -1;

/// Cancellation granularity of the supervision loop.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Grace period between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// How long the output pumps get to drain after the child exits.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub(crate) struct RunOutcome {
    pub(crate) exit_code: i32,
    pub(crate) elapsed_seconds: f64,
    pub(crate) error_message: Option<String>,
}

/// Run one claimed job as a subprocess, streaming its output into the log
/// and enforcing the deadline and the engine stop flag at every poll tick.
pub(crate) async fn run_job(
    inner: &EngineInner,
    job_id: &str,
    argv: &[String],
    deadline: Duration,
) -> RunOutcome {
    info!("Job {job_id} starting: {}", argv.join(" "));
    let start = Instant::now();

    let mut command = Command::new(&argv[0]);
    command
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            let message = format!("Exception: {err}");
            warn!("Job {job_id} failed to start: {message}");
            return RunOutcome {
                exit_code: SPAWN_FAILED_EXIT_CODE,
                elapsed_seconds: start.elapsed().as_secs_f64(),
                error_message: Some(message),
            };
        }
    };

    let mut pumps = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        pumps.push(spawn_line_pump(job_id.to_string(), "stdout", stdout));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(spawn_line_pump(job_id.to_string(), "stderr", stderr));
    }

    let mut exit_code = None;
    let mut error_message = None;
    loop {
        if inner.should_stop() {
            warn!("Job {job_id} interrupted by shutdown signal. Terminating.");
            terminate(&mut child, job_id).await;
            exit_code = Some(RETRY_EXIT_CODE);
            error_message = Some("Interrupted by shutdown signal".to_string());
            break;
        }
        if start.elapsed() >= deadline {
            warn!("Job {job_id} exceeded maximum runtime. Terminating.");
            terminate(&mut child, job_id).await;
            exit_code = Some(RETRY_EXIT_CODE);
            error_message = Some("Timeout: exceeded maximum runtime".to_string());
            break;
        }
        match tokio::time::timeout(POLL_INTERVAL, child.wait()).await {
            Ok(Ok(status)) => {
                exit_code = Some(exit_code_of(status));
                break;
            }
            Ok(Err(err)) => {
                exit_code = Some(SPAWN_FAILED_EXIT_CODE);
                error_message = Some(format!("Exception: {err}"));
                break;
            }
            // Still running; check the flags again.
            Err(_) => {}
        }
    }
    let exit_code = exit_code.unwrap_or(SPAWN_FAILED_EXIT_CODE);
    let elapsed_seconds = start.elapsed().as_secs_f64();

    // Give the pumps a moment to flush buffered lines; anything left after
    // the drain window is dropped.
    for mut pump in pumps {
        if tokio::time::timeout(DRAIN_TIMEOUT, &mut pump).await.is_err() {
            pump.abort();
        }
    }

    let error_message = match error_message {
        Some(message) => Some(message),
        None if exit_code != 0 => Some(format!("Process exited with code {exit_code}")),
        None => None,
    };

    info!("Job {job_id} finished with exit code {exit_code} in {elapsed_seconds:.2}s");
    RunOutcome {
        exit_code,
        elapsed_seconds,
        error_message,
    }
}

fn spawn_line_pump<R>(job_id: String, stream: &'static str, reader: R) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!("Job {job_id} {stream}: {line}");
        }
    })
}

fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt as _;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    SPAWN_FAILED_EXIT_CODE
}

/// SIGTERM, wait up to [`TERM_GRACE`], then SIGKILL.
async fn terminate(child: &mut Child, job_id: &str) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_ok() {
            return;
        }
        warn!("Job {job_id} did not terminate gracefully. Killing.");
    }
    let _ = child.kill().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    #[tokio::test]
    async fn successful_child_reports_exit_zero() {
        let inner = EngineInner::new();
        let outcome = run_job(
            &inner,
            "a",
            &argv(&["echo", "hello"]),
            Duration::from_secs(30),
        )
        .await;
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.elapsed_seconds > 0.0);
        assert_eq!(outcome.error_message, None);
    }

    #[tokio::test]
    async fn nonzero_exit_yields_error_message() {
        let inner = EngineInner::new();
        let outcome = run_job(
            &inner,
            "a",
            &argv(&["sh", "-c", "exit 3"]),
            Duration::from_secs(30),
        )
        .await;
        assert_eq!(outcome.exit_code, 3);
        assert_eq!(
            outcome.error_message.as_deref(),
            Some("Process exited with code 3")
        );
    }

    #[tokio::test]
    async fn spawn_failure_synthesizes_exception_outcome() {
        let inner = EngineInner::new();
        let outcome = run_job(
            &inner,
            "a",
            &argv(&["jobmill-test-no-such-binary"]),
            Duration::from_secs(30),
        )
        .await;
        assert_eq!(outcome.exit_code, -1);
        let message = outcome.error_message.unwrap();
        assert!(message.starts_with("Exception: "), "got {message}");
    }

    #[tokio::test]
    async fn deadline_kills_and_marks_timeout() {
        let inner = EngineInner::new();
        let started = Instant::now();
        let outcome = run_job(
            &inner,
            "a",
            &argv(&["sleep", "10"]),
            Duration::from_millis(300),
        )
        .await;
        assert_eq!(outcome.exit_code, RETRY_EXIT_CODE);
        assert_eq!(
            outcome.error_message.as_deref(),
            Some("Timeout: exceeded maximum runtime")
        );
        // SIGTERM ends `sleep` immediately; nowhere near the 5s kill grace.
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn stop_flag_kills_and_marks_interrupt() {
        let inner = EngineInner::new();
        inner.request_stop();
        let outcome = run_job(
            &inner,
            "a",
            &argv(&["sleep", "10"]),
            Duration::from_secs(30),
        )
        .await;
        assert_eq!(outcome.exit_code, RETRY_EXIT_CODE);
        assert_eq!(
            outcome.error_message.as_deref(),
            Some("Interrupted by shutdown signal")
        );
    }

    #[cfg(unix)]
    #[test]
    fn exit_code_prefers_code_over_signal() {
        use std::os::unix::process::ExitStatusExt as _;
        assert_eq!(exit_code_of(ExitStatus::from_raw(0)), 0);
        // Raw wait status 9 means "killed by signal 9".
        assert_eq!(exit_code_of(ExitStatus::from_raw(9)), -9);
    }
}

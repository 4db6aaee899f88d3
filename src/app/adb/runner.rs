use std::io::Read;
use std::process::{Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::app::error::AppError;

pub const DEFAULT_HOST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct HostOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl HostOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr, trimmed.
    pub fn combined(&self) -> String {
        let stdout = self.stdout.trim();
        let stderr = self.stderr.trim();
        match (stdout.is_empty(), stderr.is_empty()) {
            (false, false) => format!("{stdout}\n{stderr}"),
            (false, true) => stdout.to_string(),
            _ => stderr.to_string(),
        }
    }
}

/// Reads a pipe to the end on its own thread so a chatty child never blocks on a full buffer.
pub fn drain_pipe<R>(mut reader: R) -> JoinHandle<Vec<u8>>
where
    R: Read + Send + 'static,
{
    std::thread::spawn(move || {
        let mut buffer = Vec::<u8>::new();
        let mut temp = [0u8; 4096];
        loop {
            match reader.read(&mut temp) {
                Ok(0) => break,
                Ok(count) => buffer.extend_from_slice(&temp[..count]),
                Err(_) => break,
            }
        }
        buffer
    })
}

pub fn run_host_command(
    program: &str,
    args: &[String],
    trace_id: &str,
) -> Result<HostOutput, AppError> {
    run_host_command_with_timeout(program, args, DEFAULT_HOST_TIMEOUT, trace_id)
}

pub fn run_host_command_with_timeout(
    program: &str,
    args: &[String],
    timeout: Duration,
    trace_id: &str,
) -> Result<HostOutput, AppError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| AppError::system(format!("Failed to spawn {program}: {err}"), trace_id))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::system("Failed to capture stdout", trace_id))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::system("Failed to capture stderr", trace_id))?;
    let stdout_handle = drain_pipe(stdout);
    let stderr_handle = drain_pipe(stderr);

    let start = Instant::now();
    let exit_code = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status.code(),
            Ok(None) => {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = stdout_handle.join();
                    let _ = stderr_handle.join();
                    return Err(AppError::transport(
                        format!("{program} timed out after {}s", timeout.as_secs()),
                        trace_id,
                    ));
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(err) => {
                let _ = stdout_handle.join();
                let _ = stderr_handle.join();
                return Err(AppError::system(
                    format!("Failed to poll {program}: {err}"),
                    trace_id,
                ));
            }
        }
    };

    let stdout_bytes = stdout_handle.join().unwrap_or_default();
    let stderr_bytes = stderr_handle.join().unwrap_or_default();

    Ok(HostOutput {
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        exit_code,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[test]
    fn does_not_deadlock_on_large_stdout() {
        // A child that fills the pipe buffer must still finish well before the timeout.
        let output = run_host_command_with_timeout(
            "sh",
            &sh("i=0; while [ $i -lt 100000 ]; do echo 1234567890; i=$((i+1)); done"),
            Duration::from_secs(10),
            "trace-large",
        )
        .expect("large output");
        assert!(output.success());
        assert!(output.stdout.len() >= 1_000_000);
    }

    #[test]
    fn kills_commands_that_exceed_the_timeout() {
        let err = run_host_command_with_timeout(
            "sh",
            &sh("sleep 5"),
            Duration::from_millis(200),
            "trace-timeout",
        )
        .expect_err("expected timeout");
        assert_eq!(err.code, "ERR_TRANSPORT");
        assert_eq!(err.trace_id, "trace-timeout");
    }

    #[test]
    fn combines_stdout_and_stderr() {
        let output = run_host_command("sh", &sh("echo out; echo err 1>&2; exit 3"), "t")
            .expect("command");
        assert_eq!(output.exit_code, Some(3));
        assert!(!output.success());
        assert_eq!(output.combined(), "out\nerr");
    }

    #[test]
    fn missing_program_is_a_system_error() {
        let err = run_host_command("/this/program/does/not/exist", &[], "t")
            .expect_err("expected spawn failure");
        assert_eq!(err.code, "ERR_SYSTEM");
    }
}

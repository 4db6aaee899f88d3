//! Transport backed by the host `adb` executable.
//!
//! Each shell command is one `adb shell` child process: its stdout is cut into
//! data frames, stderr is delivered as a final data frame, and process exit is
//! the close frame. Pushes go through `adb push -p`.

use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::app::adb::classify::{classify_response, CommandOutcome, FailureKind};
use crate::app::adb::parse::{parse_adb_devices, pick_online_serial};
use crate::app::adb::runner::{drain_pipe, run_host_command};
use crate::app::adb::transfer::{parse_progress_percent, percent_to_bytes, ProgressLineSplitter};
use crate::app::adb::transport::{
    Connection, DeviceHandle, Frame, ShellStream, SyncSession, Transport,
};
use crate::app::config::AdbSettings;
use crate::app::error::AppError;
use crate::app::models::ApkArtifact;

const FRAME_SIZE: usize = 4096;
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Waits up to `poll` for the next message. A closed channel still waits, so
/// the caller's `try_wait` loop does not spin while the child is exiting.
fn wait_for_message<T>(rx: &mpsc::Receiver<T>, poll: Duration) -> Option<T> {
    match rx.recv_timeout(poll) {
        Ok(message) => Some(message),
        Err(mpsc::RecvTimeoutError::Timeout) => None,
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            thread::sleep(poll);
            None
        }
    }
}

pub fn normalize_command_path(value: &str) -> String {
    let trimmed = value.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = trimmed
            .strip_prefix(quote)
            .and_then(|candidate| candidate.strip_suffix(quote))
        {
            return inner.trim().to_string();
        }
    }
    trimmed.to_string()
}

pub fn resolve_adb_program(command_path: &str) -> String {
    let normalized = normalize_command_path(command_path);
    if normalized.is_empty() {
        "adb".to_string()
    } else {
        normalized
    }
}

pub fn validate_adb_program(program: &str) -> Result<(), String> {
    if program.trim().is_empty() {
        return Err("ADB command is empty".to_string());
    }
    if program == "adb" {
        return Ok(());
    }
    let path = Path::new(program);
    if path.is_dir() {
        return Err("ADB path must point to an executable file".to_string());
    }
    if !path.exists() {
        return Err("ADB executable not found at the configured path".to_string());
    }
    Ok(())
}

/// Turns a failed host command into the same verdicts the shell layer produces.
fn host_failure(output: &str, fallback: impl FnOnce(String) -> AppError, trace_id: &str) -> AppError {
    match classify_response(output) {
        CommandOutcome::Failure {
            kind: FailureKind::Known,
            message,
            pattern,
        } => AppError::known_command(message, pattern.unwrap_or_default(), trace_id),
        _ => fallback(output.to_string()),
    }
}

#[derive(Debug, Clone)]
pub struct AdbProcessTransport {
    program: String,
    serial: Option<String>,
    transfer_timeout: Duration,
}

impl AdbProcessTransport {
    pub fn from_settings(
        settings: &AdbSettings,
        transfer_timeout: Duration,
        trace_id: &str,
    ) -> Result<Self, AppError> {
        let program = resolve_adb_program(&settings.command_path);
        validate_adb_program(&program).map_err(|message| AppError::validation(message, trace_id))?;
        let serial = Some(settings.serial.trim().to_string()).filter(|s| !s.is_empty());
        Ok(Self {
            program,
            serial,
            transfer_timeout,
        })
    }

    pub fn with_serial(mut self, serial: Option<String>) -> Self {
        if let Some(serial) = serial.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()) {
            self.serial = Some(serial);
        }
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl Transport for AdbProcessTransport {
    fn open(&self, trace_id: &str) -> Result<Box<dyn DeviceHandle>, AppError> {
        let args = vec!["devices".to_string(), "-l".to_string()];
        let output = run_host_command(&self.program, &args, trace_id)?;
        if !output.success() {
            return Err(AppError::transport(
                format!("adb devices failed: {}", output.combined()),
                trace_id,
            ));
        }
        let devices = parse_adb_devices(&output.stdout);
        let serial = pick_online_serial(&devices, self.serial.as_deref())
            .map_err(|message| host_failure(&message, |m| AppError::transport(m, trace_id), trace_id))?;
        debug!(trace_id = %trace_id, serial = %serial, "selected device");
        Ok(Box::new(ProcessDevice {
            program: self.program.clone(),
            serial,
            transfer_timeout: self.transfer_timeout,
            trace_id: trace_id.to_string(),
        }))
    }
}

struct ProcessDevice {
    program: String,
    serial: String,
    transfer_timeout: Duration,
    trace_id: String,
}

impl DeviceHandle for ProcessDevice {
    fn connect(self: Box<Self>, role: &str) -> Result<Box<dyn Connection>, AppError> {
        let args = vec!["-s".to_string(), self.serial.clone(), "get-state".to_string()];
        let output = run_host_command(&self.program, &args, &self.trace_id)?;
        let state = output.stdout.trim();
        if !output.success() || state != "device" {
            let combined = output.combined();
            let serial = self.serial.clone();
            return Err(host_failure(
                &combined,
                |text| AppError::transport(format!("Device {serial} is not ready: {text}"), &self.trace_id),
                &self.trace_id,
            ));
        }
        info!(trace_id = %self.trace_id, serial = %self.serial, role = %role, "device connected");
        Ok(Box::new(ProcessConnection {
            program: self.program,
            serial: self.serial,
            transfer_timeout: self.transfer_timeout,
            trace_id: self.trace_id,
        }))
    }
}

pub struct ProcessConnection {
    program: String,
    serial: String,
    transfer_timeout: Duration,
    trace_id: String,
}

impl Connection for ProcessConnection {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn shell<'a>(&'a mut self, command: &str) -> Result<Box<dyn ShellStream + 'a>, AppError> {
        debug!(trace_id = %self.trace_id, serial = %self.serial, command = %command, "adb shell");
        let mut child = Command::new(&self.program)
            .args(["-s", self.serial.as_str(), "shell", command])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| AppError::transport(format!("Failed to open shell: {err}"), &self.trace_id))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::transport("Failed to capture shell stdout", &self.trace_id))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::transport("Failed to capture shell stderr", &self.trace_id))?;
        Ok(Box::new(ProcessShellStream {
            child,
            stdout,
            stderr: Some(drain_pipe(stderr)),
            awaiting_ack: false,
            finished: false,
            trace_id: self.trace_id.clone(),
        }))
    }

    fn sync<'a>(&'a mut self) -> Result<Box<dyn SyncSession + 'a>, AppError> {
        Ok(Box::new(ProcessSyncSession { connection: self }))
    }
}

struct ProcessShellStream {
    child: Child,
    stdout: ChildStdout,
    stderr: Option<JoinHandle<Vec<u8>>>,
    awaiting_ack: bool,
    finished: bool,
    trace_id: String,
}

impl ProcessShellStream {
    fn finish(&mut self) -> Vec<u8> {
        self.finished = true;
        let stderr = self
            .stderr
            .take()
            .map(|handle| handle.join().unwrap_or_default())
            .unwrap_or_default();
        let _ = self.child.wait();
        stderr
    }
}

impl ShellStream for ProcessShellStream {
    fn receive(&mut self) -> Result<Frame, AppError> {
        if self.awaiting_ack {
            return Err(AppError::transport(
                "Next frame requested before the previous one was acknowledged",
                &self.trace_id,
            ));
        }
        if self.finished {
            return Ok(Frame::Close);
        }
        let mut chunk = [0u8; FRAME_SIZE];
        match self.stdout.read(&mut chunk) {
            Ok(0) => {
                let stderr = self.finish();
                if stderr.is_empty() {
                    Ok(Frame::Close)
                } else {
                    self.awaiting_ack = true;
                    Ok(Frame::Data(stderr))
                }
            }
            Ok(count) => {
                self.awaiting_ack = true;
                Ok(Frame::Data(chunk[..count].to_vec()))
            }
            Err(err) => Err(AppError::transport(
                format!("Failed to read shell output: {err}"),
                &self.trace_id,
            )),
        }
    }

    fn acknowledge(&mut self) -> Result<(), AppError> {
        self.awaiting_ack = false;
        Ok(())
    }
}

impl Drop for ProcessShellStream {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

struct ProcessSyncSession<'a> {
    connection: &'a mut ProcessConnection,
}

impl ProcessSyncSession<'_> {
    fn adb_args(&self, rest: &[&str]) -> Vec<String> {
        let mut args = vec!["-s".to_string(), self.connection.serial.clone()];
        args.extend(rest.iter().map(|item| item.to_string()));
        args
    }

    /// Runs `adb push` and returns whether it succeeded along with its non-progress output.
    fn run_push(
        &self,
        local: &Path,
        remote_path: &str,
        with_progress_flag: bool,
        total: u64,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> Result<(bool, String), AppError> {
        let trace_id = self.connection.trace_id.as_str();
        let local = local.to_string_lossy().to_string();
        let args = if with_progress_flag {
            self.adb_args(&["push", "-p", &local, remote_path])
        } else {
            self.adb_args(&["push", &local, remote_path])
        };
        let mut child = Command::new(&self.connection.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| AppError::transfer(format!("Failed to start adb push: {err}"), trace_id))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::transfer("Failed to capture push stdout", trace_id))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::transfer("Failed to capture push stderr", trace_id))?;
        let stderr_handle = drain_pipe(stderr);

        // Progress lines are parsed off-thread; the callback runs here.
        let (tx, rx) = mpsc::channel::<Result<u8, String>>();
        let stdout_handle = thread::spawn(move || {
            let mut splitter = ProgressLineSplitter::new();
            let mut temp = [0u8; FRAME_SIZE];
            loop {
                let count = match stdout.read(&mut temp) {
                    Ok(0) | Err(_) => break,
                    Ok(count) => count,
                };
                for line in splitter.push_chunk(&temp[..count]) {
                    let message = parse_progress_percent(&line).ok_or(line);
                    if tx.send(message).is_err() {
                        return;
                    }
                }
            }
            if let Some(line) = splitter.finish() {
                let _ = tx.send(Err(line));
            }
        });

        let mut last_percent = None;
        let mut plain_lines = Vec::new();
        let mut handle_message = |message: Result<u8, String>| match message {
            Ok(percent) => {
                if last_percent != Some(percent) {
                    last_percent = Some(percent);
                    on_progress(percent_to_bytes(percent, total), total);
                }
            }
            Err(line) => plain_lines.push(line),
        };

        let timeout = self.connection.transfer_timeout;
        let start = Instant::now();
        let status = loop {
            while let Ok(message) = rx.try_recv() {
                handle_message(message);
            }
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if start.elapsed() > timeout {
                        let _ = child.kill();
                        let _ = child.wait();
                        let _ = stdout_handle.join();
                        let _ = stderr_handle.join();
                        return Err(AppError::transfer(
                            format!("adb push timed out after {}s", timeout.as_secs()),
                            trace_id,
                        ));
                    }
                    if let Some(message) = wait_for_message(&rx, POLL_INTERVAL) {
                        handle_message(message);
                    }
                }
                Err(err) => {
                    let _ = stdout_handle.join();
                    let _ = stderr_handle.join();
                    return Err(AppError::transfer(
                        format!("Failed to poll adb push: {err}"),
                        trace_id,
                    ));
                }
            }
        };
        let _ = stdout_handle.join();
        for message in rx.try_iter() {
            handle_message(message);
        }
        let stderr_text = String::from_utf8_lossy(&stderr_handle.join().unwrap_or_default()).to_string();

        let mut output = plain_lines.join("\n");
        if !stderr_text.trim().is_empty() {
            if !output.is_empty() {
                output.push('\n');
            }
            output.push_str(stderr_text.trim());
        }
        if !status.success() {
            warn!(trace_id = %trace_id, code = ?status.code(), output = %output, "adb push failed");
        }
        Ok((status.success(), output))
    }
}

impl SyncSession for ProcessSyncSession<'_> {
    fn push(
        &mut self,
        artifact: &ApkArtifact,
        remote_path: &str,
        mode: u32,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> Result<(), AppError> {
        let trace_id = self.connection.trace_id.clone();
        let mut staged = tempfile::Builder::new()
            .prefix("provision-")
            .suffix(".apk")
            .tempfile()
            .map_err(|err| AppError::system(format!("Failed to stage artifact: {err}"), &trace_id))?;
        staged
            .write_all(&artifact.bytes)
            .and_then(|_| staged.flush())
            .map_err(|err| AppError::system(format!("Failed to stage artifact: {err}"), &trace_id))?;

        let total = artifact.len();
        on_progress(0, total);
        let (mut pushed, mut output) =
            self.run_push(staged.path(), remote_path, true, total, on_progress)?;
        let lower = output.to_lowercase();
        if !pushed && lower.contains("unknown option") && lower.contains("-p") {
            // Older adb builds reject the progress flag.
            (pushed, output) = self.run_push(staged.path(), remote_path, false, total, on_progress)?;
        }
        if !pushed {
            return Err(host_failure(
                &output,
                |text| AppError::transfer(format!("adb push failed: {text}"), &trace_id),
                &trace_id,
            ));
        }

        let mode = format!("{mode:o}");
        let args = self.adb_args(&["shell", "chmod", &mode, remote_path]);
        let output = run_host_command(&self.connection.program, &args, &trace_id)?;
        let combined = output.combined();
        if !output.success() || !combined.is_empty() {
            return Err(host_failure(
                &combined,
                |text| AppError::transfer(format!("chmod {mode} {remote_path} failed: {text}"), &trace_id),
                &trace_id,
            ));
        }
        on_progress(total, total);
        Ok(())
    }

    fn quit(self: Box<Self>) -> Result<(), AppError> {
        debug!(trace_id = %self.connection.trace_id, "sync session closed");
        Ok(())
    }
}

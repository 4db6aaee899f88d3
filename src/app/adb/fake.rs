//! Scripted in-memory transport for protocol and workflow tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::app::adb::transport::{Connection, DeviceHandle, Frame, ShellStream, SyncSession, Transport};
use crate::app::error::AppError;
use crate::app::models::ApkArtifact;

/// Replays a fixed list of frames and checks the ack-before-next rule.
pub(crate) struct ScriptedStream {
    frames: VecDeque<Result<Frame, AppError>>,
    awaiting_ack: bool,
    pub acks: usize,
    pub receives: usize,
    /// The n-th acknowledgment (1-based) and every later one fail.
    pub fail_ack_after: Option<usize>,
}

impl ScriptedStream {
    pub fn new(frames: Vec<Result<Frame, AppError>>) -> Self {
        Self {
            frames: frames.into(),
            awaiting_ack: false,
            acks: 0,
            receives: 0,
            fail_ack_after: None,
        }
    }
}

impl ShellStream for ScriptedStream {
    fn receive(&mut self) -> Result<Frame, AppError> {
        if self.awaiting_ack {
            return Err(AppError::transport("frame requested before ack", "fake"));
        }
        self.receives += 1;
        let frame = self.frames.pop_front().unwrap_or(Ok(Frame::Close))?;
        if matches!(frame, Frame::Data(_)) {
            self.awaiting_ack = true;
        }
        Ok(frame)
    }

    fn acknowledge(&mut self) -> Result<(), AppError> {
        if self.fail_ack_after.is_some_and(|limit| self.acks + 1 >= limit) {
            return Err(AppError::transport("ack failed", "fake"));
        }
        self.acks += 1;
        self.awaiting_ack = false;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PushRecord {
    pub name: String,
    pub remote_path: String,
    pub mode: u32,
    pub len: u64,
}

#[derive(Debug, Default)]
pub(crate) struct FakeLog {
    pub commands: Vec<String>,
    pub pushes: Vec<PushRecord>,
    pub roles: Vec<String>,
    pub quits: usize,
}

#[derive(Clone)]
pub(crate) enum Reply {
    Text(String),
    Frames(Vec<Result<Frame, AppError>>),
    OpenError(AppError),
}

/// Device behaviour shared by the transport, its handles and connections.
#[derive(Clone)]
pub(crate) struct FakeDevice {
    serial: String,
    rules: Vec<(String, Reply)>,
    push_steps: Vec<u64>,
    push_error: Option<AppError>,
    log: Arc<Mutex<FakeLog>>,
}

impl FakeDevice {
    pub fn new(serial: &str) -> Self {
        Self {
            serial: serial.to_string(),
            rules: Vec::new(),
            push_steps: Vec::new(),
            push_error: None,
            log: Arc::new(Mutex::new(FakeLog::default())),
        }
    }

    /// Commands starting with `prefix` answer `text`; the first matching rule wins.
    pub fn reply(mut self, prefix: &str, text: &str) -> Self {
        self.rules
            .push((prefix.to_string(), Reply::Text(text.to_string())));
        self
    }

    pub fn reply_frames(mut self, prefix: &str, frames: Vec<Result<Frame, AppError>>) -> Self {
        self.rules.push((prefix.to_string(), Reply::Frames(frames)));
        self
    }

    pub fn fail_open(mut self, prefix: &str, err: AppError) -> Self {
        self.rules.push((prefix.to_string(), Reply::OpenError(err)));
        self
    }

    /// Byte counts reported through the push callback before the final `(total, total)`.
    pub fn push_progress(mut self, steps: Vec<u64>) -> Self {
        self.push_steps = steps;
        self
    }

    pub fn fail_push(mut self, err: AppError) -> Self {
        self.push_error = Some(err);
        self
    }

    pub fn log(&self) -> Arc<Mutex<FakeLog>> {
        Arc::clone(&self.log)
    }

    pub fn commands(&self) -> Vec<String> {
        self.log.lock().map(|log| log.commands.clone()).unwrap_or_default()
    }

    pub fn pushes(&self) -> Vec<PushRecord> {
        self.log.lock().map(|log| log.pushes.clone()).unwrap_or_default()
    }

    pub fn connection(&self) -> FakeConnection {
        FakeConnection {
            device: self.clone(),
        }
    }

    fn reply_for(&self, command: &str) -> Option<Reply> {
        self.rules
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, reply)| reply.clone())
    }
}

pub(crate) struct FakeConnection {
    device: FakeDevice,
}

impl Connection for FakeConnection {
    fn serial(&self) -> &str {
        &self.device.serial
    }

    fn shell<'a>(&'a mut self, command: &str) -> Result<Box<dyn ShellStream + 'a>, AppError> {
        if let Ok(mut log) = self.device.log.lock() {
            log.commands.push(command.to_string());
        }
        let frames = match self.device.reply_for(command) {
            Some(Reply::Text(text)) if text.is_empty() => vec![Ok(Frame::Close)],
            Some(Reply::Text(text)) => vec![Ok(Frame::Data(text.into_bytes())), Ok(Frame::Close)],
            Some(Reply::Frames(frames)) => frames,
            Some(Reply::OpenError(err)) => return Err(err),
            None => vec![Ok(Frame::Close)],
        };
        Ok(Box::new(ScriptedStream::new(frames)))
    }

    fn sync<'a>(&'a mut self) -> Result<Box<dyn SyncSession + 'a>, AppError> {
        Ok(Box::new(FakeSync {
            device: &self.device,
        }))
    }
}

struct FakeSync<'a> {
    device: &'a FakeDevice,
}

impl SyncSession for FakeSync<'_> {
    fn push(
        &mut self,
        artifact: &ApkArtifact,
        remote_path: &str,
        mode: u32,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> Result<(), AppError> {
        if let Ok(mut log) = self.device.log.lock() {
            log.pushes.push(PushRecord {
                name: artifact.name.clone(),
                remote_path: remote_path.to_string(),
                mode,
                len: artifact.len(),
            });
        }
        let total = artifact.len();
        for sent in &self.device.push_steps {
            on_progress((*sent).min(total), total);
        }
        if let Some(err) = &self.device.push_error {
            return Err(err.clone());
        }
        on_progress(total, total);
        Ok(())
    }

    fn quit(self: Box<Self>) -> Result<(), AppError> {
        if let Ok(mut log) = self.device.log.lock() {
            log.quits += 1;
        }
        Ok(())
    }
}

pub(crate) struct FakeDeviceHandle {
    device: FakeDevice,
    connect_error: Option<AppError>,
}

impl DeviceHandle for FakeDeviceHandle {
    fn connect(self: Box<Self>, role: &str) -> Result<Box<dyn Connection>, AppError> {
        if let Ok(mut log) = self.device.log.lock() {
            log.roles.push(role.to_string());
        }
        if let Some(err) = self.connect_error {
            return Err(err);
        }
        Ok(Box::new(self.device.connection()))
    }
}

pub(crate) struct FakeTransport {
    device: FakeDevice,
    open_error: Option<AppError>,
    connect_error: Option<AppError>,
}

impl FakeTransport {
    pub fn new(device: FakeDevice) -> Self {
        Self {
            device,
            open_error: None,
            connect_error: None,
        }
    }

    pub fn failing_open(device: FakeDevice, err: AppError) -> Self {
        Self {
            open_error: Some(err),
            ..Self::new(device)
        }
    }

    pub fn failing_connect(device: FakeDevice, err: AppError) -> Self {
        Self {
            connect_error: Some(err),
            ..Self::new(device)
        }
    }
}

impl Transport for FakeTransport {
    fn open(&self, _trace_id: &str) -> Result<Box<dyn DeviceHandle>, AppError> {
        if let Some(err) = &self.open_error {
            return Err(err.clone());
        }
        Ok(Box::new(FakeDeviceHandle {
            device: self.device.clone(),
            connect_error: self.connect_error.clone(),
        }))
    }
}

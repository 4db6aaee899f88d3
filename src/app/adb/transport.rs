//! Transport capability consumed by the command layer.
//!
//! Every call here blocks until the device side answers; the provisioning core
//! drives exactly one of them at a time. Streams and sync sessions borrow their
//! connection mutably, so a second shell cannot be opened while one is in flight.

use crate::app::error::AppError;
use crate::app::models::ApkArtifact;

/// Connection role requested from the device during the handshake.
pub const HOST_ROLE: &str = "host::";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(Vec<u8>),
    Close,
}

pub trait ShellStream {
    /// Blocks until the next frame arrives.
    fn receive(&mut self) -> Result<Frame, AppError>;

    /// Acknowledges the last data frame so the peer may send the next one.
    fn acknowledge(&mut self) -> Result<(), AppError>;
}

pub trait SyncSession {
    fn push(
        &mut self,
        artifact: &ApkArtifact,
        remote_path: &str,
        mode: u32,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> Result<(), AppError>;

    fn quit(self: Box<Self>) -> Result<(), AppError>;
}

pub trait Connection {
    fn serial(&self) -> &str;

    fn shell<'a>(&'a mut self, command: &str) -> Result<Box<dyn ShellStream + 'a>, AppError>;

    fn sync<'a>(&'a mut self) -> Result<Box<dyn SyncSession + 'a>, AppError>;
}

pub trait DeviceHandle {
    fn connect(self: Box<Self>, role: &str) -> Result<Box<dyn Connection>, AppError>;
}

pub trait Transport {
    fn open(&self, trace_id: &str) -> Result<Box<dyn DeviceHandle>, AppError>;
}

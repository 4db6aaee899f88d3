pub mod apk;
pub mod classify;
pub mod download;
pub mod executor;
pub mod frame;
pub mod parse;
pub mod paths;
pub mod process;
pub mod runner;
pub mod transfer;
pub mod transport;

#[cfg(test)]
pub(crate) mod fake;

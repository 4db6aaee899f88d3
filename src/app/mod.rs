pub mod accounts;
pub mod adb;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod provision;
pub mod state;
pub mod storage;

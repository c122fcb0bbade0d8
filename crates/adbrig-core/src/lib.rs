//! Async execution engine for the Android Debug Bridge.
//!
//! One [`runner::AdbRunner`] supervises one adb invocation at a time and
//! reports it as typed events on an ordered channel: a started notice, raw
//! log increments, deduplicated transfer progress, and a final outcome.
//! Progress is derived from adb's unstructured output by
//! [`progress::TransferTracker`], which copes with the three incompatible
//! encodings adb ships.

pub mod config;
pub mod event;
pub mod parse;
pub mod progress;
pub mod runner;

pub use config::AdbConfig;
pub use event::{AdbEvent, ExecOutcome, TransferDirection};
pub use progress::{ProgressUpdate, TransferTracker};
pub use runner::{list_remote_files, AdbError, AdbEvents, AdbRunner};

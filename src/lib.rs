#![allow(clippy::uninlined_format_args)]

pub mod app;
pub mod card;
pub mod config;
pub mod error;
pub mod media;
pub mod net;
pub mod queue;
pub mod services;
pub mod source;
pub mod storage;
pub mod swapper;
pub mod ui;
pub mod virtualizer;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::{run, RunOptions};

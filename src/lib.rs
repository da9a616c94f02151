//! Headless client for a log-classification backend: live log and statistics
//! streams over Server-Sent Events, periodic REST polling, and remote test runs.

pub mod api;
pub mod buffer;
pub mod config;
pub mod error;
pub mod hdfs;
pub mod logging;
pub mod orchestrator;
pub mod poller;
pub mod sse;
pub mod stats;
pub mod types;
pub mod view;

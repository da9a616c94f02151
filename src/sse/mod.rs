//! Server-Sent Events client: wire parsing, payload decoding and managed
//! connections with reconnect.

pub mod connection;
pub mod decoder;
pub mod parser;
pub mod transport;

pub use connection::{
    ErrorHandler, FixedDelay, Listeners, OnError, ReadyState, ReconnectPolicy, StreamClient,
    StreamHandle,
};
pub use decoder::{decode, decode_ping, Decoded, LOG_EVENT, PING_EVENT, STATISTICS_EVENT};
pub use parser::{SseEvent, SseParser};
pub use transport::{EventTransport, HttpTransport, ScriptedTransport, StreamError};

pub const LOGS_STREAM: &str = "/api/logs/stream";
pub const STATISTICS_STREAM: &str = "/api/statistics/stream";

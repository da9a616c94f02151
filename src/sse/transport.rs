use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::Client;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub type ByteStream = BoxStream<'static, Result<Bytes, StreamError>>;

/// Why a server-push connection is not (or no longer) delivering events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Could not reach the server at all
    Connect(String),
    /// Server answered with a non-success status
    Status(u16),
    /// Server answered, but not with `text/event-stream`
    ContentType(String),
    /// An open stream failed mid-read
    Interrupted(String),
    /// An open stream was closed by the server
    Ended,
}

impl StreamError {
    /// Failures that happen after the stream was open; the transport
    /// re-establishes these itself, as a browser EventSource does.
    pub fn is_interruption(&self) -> bool {
        matches!(self, StreamError::Interrupted(_) | StreamError::Ended)
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::Connect(msg) => write!(f, "connect failed: {}", msg),
            StreamError::Status(code) => write!(f, "unexpected HTTP status {}", code),
            StreamError::ContentType(ct) => write!(f, "unexpected content type '{}'", ct),
            StreamError::Interrupted(msg) => write!(f, "stream interrupted: {}", msg),
            StreamError::Ended => write!(f, "stream closed by server"),
        }
    }
}

impl std::error::Error for StreamError {}

#[async_trait]
pub trait EventTransport: Send + Sync + 'static {
    /// Open a server-push response and return its body as a byte stream.
    async fn connect(&self, url: &str, last_event_id: Option<&str>) -> Result<ByteStream, StreamError>;
}

/// `text/event-stream` over reqwest.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration) -> Result<Self, StreamError> {
        // No overall timeout: the response body is meant to stay open.
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| StreamError::Connect(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl EventTransport for HttpTransport {
    async fn connect(&self, url: &str, last_event_id: Option<&str>) -> Result<ByteStream, StreamError> {
        let mut req = self
            .client
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        if let Some(id) = last_event_id {
            req = req.header("Last-Event-ID", id);
        }
        let resp = req.send().await.map_err(|e| StreamError::Connect(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(StreamError::Status(status.as_u16()));
        }
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !content_type.starts_with("text/event-stream") {
            return Err(StreamError::ContentType(content_type));
        }

        Ok(resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| StreamError::Interrupted(e.to_string())))
            .boxed())
    }
}

/// One recorded `connect` call.
#[derive(Debug, Clone)]
pub struct ConnectCall {
    pub url: String,
    pub last_event_id: Option<String>,
    pub at: Instant,
}

enum Scripted {
    Fail(StreamError),
    Chunks(Vec<Result<Bytes, StreamError>>, bool),
}

/// In-memory transport that replays a script of connection outcomes.
/// Once the script runs out, every connect fails with `Connect`.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<VecDeque<Scripted>>>,
    calls: Arc<Mutex<Vec<ConnectCall>>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_failure(&self, err: StreamError) -> &Self {
        self.push(Scripted::Fail(err))
    }

    /// Connection that delivers `body` and then is closed by the server.
    pub fn push_body(&self, body: &str) -> &Self {
        self.push(Scripted::Chunks(vec![Ok(Bytes::from(body.to_string()))], false))
    }

    /// Connection that delivers `body` and then stays open without further data.
    pub fn push_open_body(&self, body: &str) -> &Self {
        self.push(Scripted::Chunks(vec![Ok(Bytes::from(body.to_string()))], true))
    }

    pub fn push_chunks(&self, chunks: Vec<Result<Bytes, StreamError>>) -> &Self {
        self.push(Scripted::Chunks(chunks, false))
    }

    fn push(&self, item: Scripted) -> &Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(item);
        }
        self
    }

    pub fn calls(&self) -> Vec<ConnectCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl EventTransport for ScriptedTransport {
    async fn connect(&self, url: &str, last_event_id: Option<&str>) -> Result<ByteStream, StreamError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(ConnectCall {
                url: url.to_string(),
                last_event_id: last_event_id.map(str::to_string),
                at: Instant::now(),
            });
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match next {
            Some(Scripted::Fail(err)) => Err(err),
            Some(Scripted::Chunks(chunks, stay_open)) => {
                let body = stream::iter(chunks);
                if stay_open {
                    Ok(body.chain(stream::pending()).boxed())
                } else {
                    Ok(body.boxed())
                }
            }
            None => Err(StreamError::Connect("connection refused".to_string())),
        }
    }
}

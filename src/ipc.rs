//! Coordinator/worker message protocol
//!
//! Messages travel as newline-delimited JSON over the worker's stdin (requests)
//! and stdout (events). Every request carries a correlation id that the worker
//! echoes in its reply, so replies are matched by id and never by arrival order.

use dashmap::DashMap;
use hyper::body::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex, MutexGuard};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("channel I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("channel is closed")]
    Closed,
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("worker exited before replying")]
    WorkerLost,
}

/// Scheme of the original client request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestType {
    #[default]
    Http,
    Https,
}

/// Coordinator -> worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutedRequest {
    /// Correlation id, assigned by [`WorkerChannel::request`]
    pub id: u64,
    pub request_type: RequestType,
    pub method: String,
    /// Path and query of the original request
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
}

impl RoutedRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: 0,
            request_type: RequestType::Http,
            method: method.into(),
            url: url.into(),
            headers: HashMap::new(),
            body: String::new(),
        }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }
}

/// Worker -> coordinator reply
///
/// Exactly one of `data` or (`error_code`, `error_message`) is set on a
/// well-formed reply; use [`RoutedReply::outcome`] to read it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutedReply {
    /// Correlation id of the request; `None` when the request was unreadable
    pub id: Option<u64>,
    #[serde(default, with = "base64_body", skip_serializing_if = "Option::is_none")]
    pub data: Option<Bytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Validated content of a reply
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyOutcome {
    Data(Bytes),
    Error { code: u16, message: String },
}

impl RoutedReply {
    pub fn success(id: u64, data: Bytes) -> Self {
        Self {
            id: Some(id),
            data: Some(data),
            error_code: None,
            error_message: None,
        }
    }

    pub fn error(id: Option<u64>, code: u16, message: impl Into<String>) -> Self {
        Self {
            id,
            data: None,
            error_code: Some(code),
            error_message: Some(message.into()),
        }
    }

    pub fn outcome(self) -> Result<ReplyOutcome, IpcError> {
        match (self.data, self.error_code, self.error_message) {
            (Some(data), None, None) => Ok(ReplyOutcome::Data(data)),
            (None, Some(code), Some(message)) => Ok(ReplyOutcome::Error { code, message }),
            _ => Err(IpcError::Malformed(
                "reply must carry either data or an error code and message".to_string(),
            )),
        }
    }
}

/// Everything a worker writes to its stdout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// Startup context accepted; the worker is reading requests
    Ready { pid: u32 },
    Reply(RoutedReply),
}

mod base64_body {
    use base64::Engine;
    use hyper::body::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Option<Bytes>, s: S) -> Result<S::Ok, S::Error> {
        match data {
            Some(bytes) => s.serialize_some(&base64::engine::general_purpose::STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Bytes>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|encoded| {
                base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map(Bytes::from)
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
    }
}

/// Serialize a message as one JSON line
pub fn encode_line<T: Serialize>(message: &T) -> Result<Vec<u8>, IpcError> {
    let mut line = serde_json::to_vec(message).map_err(IpcError::Encode)?;
    line.push(b'\n');
    Ok(line)
}

/// Parse one JSON line, rejecting anything that does not match the schema
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T, IpcError> {
    serde_json::from_str(line.trim()).map_err(|e| IpcError::Malformed(e.to_string()))
}

/// Best-effort recovery of the correlation id from an otherwise invalid line
pub fn salvage_id(line: &str) -> Option<u64> {
    serde_json::from_str::<serde_json::Value>(line.trim())
        .ok()?
        .get("id")?
        .as_u64()
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let line = encode_line(message)?;
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;
type PendingReplies = DashMap<u64, oneshot::Sender<RoutedReply>>;

/// Coordinator side of one worker's channel
pub struct WorkerChannel {
    writer: Mutex<Option<BoxWriter>>,
    pending: PendingReplies,
    next_id: AtomicU64,
}

/// Removes a pending entry when the waiting request finishes or is dropped
struct PendingGuard<'a> {
    pending: &'a PendingReplies,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// Holds the writer while one line goes out. A write that does not finish
/// leaves a partial line on the pipe, so the writer is discarded and the
/// worker sees EOF instead of a corrupted request.
struct LineWrite<'a> {
    writer: MutexGuard<'a, Option<BoxWriter>>,
    complete: bool,
}

impl Drop for LineWrite<'_> {
    fn drop(&mut self) {
        if !self.complete && self.writer.take().is_some() {
            warn!("Closing worker channel after an incomplete write");
        }
    }
}

impl WorkerChannel {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: Mutex::new(Some(Box::new(writer))),
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Send a request and wait for the reply carrying the same id
    pub async fn request(
        &self,
        mut request: RoutedRequest,
        timeout: Duration,
    ) -> Result<RoutedReply, IpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        request.id = id;
        let line = encode_line(&request)?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        // The timeout covers waiting for the writer and the write itself, so a
        // worker that stops reading stdin cannot hold a request past it
        let exchange = async move {
            let mut write = LineWrite {
                writer: self.writer.lock().await,
                complete: false,
            };
            let writer = write.writer.as_mut().ok_or(IpcError::Closed)?;
            writer.write_all(&line).await?;
            writer.flush().await?;
            write.complete = true;
            drop(write);

            debug!(id, url = %request.url, "Request sent to worker");
            rx.await.map_err(|_| IpcError::WorkerLost)
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(IpcError::Timeout(timeout)),
        }
    }

    /// Hand a reply to the request waiting on its id
    pub fn deliver(&self, reply: RoutedReply) -> bool {
        let Some(id) = reply.id else {
            warn!("Discarding worker reply without a correlation id");
            return false;
        };
        match self.pending.remove(&id) {
            Some((_, tx)) => tx.send(reply).is_ok(),
            None => {
                warn!(id, "Discarding reply for unknown or abandoned request");
                false
            }
        }
    }

    /// Read worker events until EOF, delivering replies and reporting readiness
    pub async fn read_events<R, F>(&self, reader: R, mut on_ready: F) -> Result<(), IpcError>
    where
        R: AsyncRead + Unpin,
        F: FnMut(u32),
    {
        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match decode_line::<WorkerEvent>(&line) {
                Ok(WorkerEvent::Ready { pid }) => on_ready(pid),
                Ok(WorkerEvent::Reply(reply)) => {
                    self.deliver(reply);
                }
                Err(e) => warn!(error = %e, "Discarding malformed worker message"),
            }
        }
        Ok(())
    }

    /// Fail every waiting request; returns how many were waiting
    pub fn fail_pending(&self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    /// Stop accepting requests and fail the ones in flight
    pub async fn close(&self) {
        self.writer.lock().await.take();
        self.fail_pending();
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

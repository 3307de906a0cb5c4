// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Line-delimited JSON request/response frames.
//!
//! Requests look like `{"id": 1, "method": "Fetch", "args": {...}}`, replies
//! carry the same `id` and either a `result` or an `error`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use crate::protocol::{BAD_REQUEST, NOT_FOUND};

pub const METHOD_FETCH: &str = "Fetch";
pub const METHOD_RELAY: &str = "SAM3XDL";

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct Frame {
    #[serde(default)]
    id: Option<u64>,
    method: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("error {code}{}", .message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
pub struct RpcError {
    pub code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RpcError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        RpcError { code, message: Some(message.into()) }
    }

    /// Error that carries only a status code, e.g. a remote HTTP status.
    pub fn code(code: u16) -> Self {
        RpcError { code, message: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FetchArgs {
    pub url: Option<String>,
    pub file: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RelayArgs {
    pub file: Option<String>,
}

#[derive(Debug)]
pub enum Request {
    Fetch(FetchArgs),
    Relay(RelayArgs),
}

impl Request {
    /// Arguments that do not fit the method's shape count as missing.
    pub fn from_method(method: &str, args: Value) -> Result<Request, RpcError> {
        match method {
            METHOD_FETCH => Ok(Request::Fetch(serde_json::from_value(args).unwrap_or_default())),
            METHOD_RELAY => Ok(Request::Relay(serde_json::from_value(args).unwrap_or_default())),
            other => Err(RpcError::new(NOT_FOUND, format!("No handler for {other}"))),
        }
    }
}

/// Decodes one frame into its id and request.
pub fn decode(line: &str) -> Result<(Option<u64>, Request), (Option<u64>, RpcError)> {
    let frame: Frame = serde_json::from_str(line)
        .map_err(|e| (None, RpcError::new(BAD_REQUEST, format!("malformed frame: {e}"))))?;
    let request = Request::from_method(&frame.method, frame.args).map_err(|e| (frame.id, e))?;
    Ok((frame.id, request))
}

// ============================================================================
// Reply Handle
// ============================================================================

/// The caller of one request. Consumed by the reply, so each request is
/// answered at most once.
#[derive(Debug)]
pub struct ReplyHandle {
    id: Option<u64>,
    tx: mpsc::UnboundedSender<Response>,
}

impl ReplyHandle {
    pub fn new(id: Option<u64>, tx: mpsc::UnboundedSender<Response>) -> Self {
        ReplyHandle { id, tx }
    }

    pub fn ok(self, result: Value) {
        let response = Response { id: self.id, result: Some(result), error: None };
        self.send(response);
    }

    pub fn error(self, error: RpcError) {
        let response = Response { id: self.id, result: None, error: Some(error) };
        self.send(response);
    }

    fn send(self, response: Response) {
        if self.tx.send(response).is_err() {
            debug!("Caller went away before request {:?} was answered", self.id);
        }
    }
}

/// A decoded request together with the handle that answers it.
#[derive(Debug)]
pub struct Incoming {
    pub request: Request,
    pub reply: ReplyHandle,
}

// ============================================================================
// Stream Transport
// ============================================================================

/// Reads frames until end of input. Undecodable frames are answered here and
/// never reach the service.
pub async fn read_frames<R>(
    input: R,
    requests: mpsc::Sender<Incoming>,
    responses: mpsc::UnboundedSender<Response>,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match decode(line) {
            Ok((id, request)) => {
                debug!("Request {:?}: {:?}", id, request);
                let incoming = Incoming { request, reply: ReplyHandle::new(id, responses.clone()) };
                if requests.send(incoming).await.is_err() {
                    break;
                }
            }
            Err((id, error)) => {
                warn!("Rejected frame: {}", error);
                ReplyHandle::new(id, responses.clone()).error(error);
            }
        }
    }
    Ok(())
}

/// Writes one JSON line per response until every reply handle is gone.
pub async fn write_responses<W>(mut output: W, mut responses: mpsc::UnboundedReceiver<Response>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = responses.recv().await {
        let mut line = serde_json::to_vec(&response)?;
        line.push(b'\n');
        output.write_all(&line).await?;
        output.flush().await?;
    }
    Ok(())
}

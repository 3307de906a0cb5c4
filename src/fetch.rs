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

//! Downloads a file over HTTP straight into local storage.
//!
//! Each request gets its own [`FetchSession`]; connection close is the one
//! place where the outcome is reported and the destination is closed.

use reqwest::{Client, Url};
use serde_json::json;
use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use crate::protocol::{HTTP_OK, INTERNAL_ERROR};
use crate::rpc::{FetchArgs, ReplyHandle, RpcError};

// ============================================================================
// Error Types
// ============================================================================

/// Failures detected before any network activity.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("expecting url or file")]
    MissingArgs,
    #[error("malformed URL")]
    MalformedUrl,
    #[error("cannot open {path}")]
    Open { path: String, source: std::io::Error },
}

// ============================================================================
// Session
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStatus {
    InProgress,
    Connected,
    ConnectFailed(String),
    Reply(u16),
    WriteFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    Continue,
    /// Drop the connection now
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Written(u64),
    Failed(RpcError),
}

pub struct FetchSession<W: AsyncWrite + Unpin> {
    reply: ReplyHandle,
    path: String,
    status: FetchStatus,
    written: u64,
    sink: Option<W>,
}

impl<W: AsyncWrite + Unpin> FetchSession<W> {
    pub fn new(reply: ReplyHandle, path: String, sink: W) -> Self {
        FetchSession {
            reply,
            path,
            status: FetchStatus::InProgress,
            written: 0,
            sink: Some(sink),
        }
    }

    pub fn status(&self) -> &FetchStatus {
        &self.status
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn on_connect(&mut self, result: Result<(), String>) {
        match result {
            Ok(()) => {
                debug!("Connected, streaming to {}", self.path);
                self.status = FetchStatus::Connected;
            }
            Err(e) => {
                warn!("Connection failed: {}", e);
                self.status = FetchStatus::ConnectFailed(e);
            }
        }
    }

    pub async fn on_chunk(&mut self, chunk: &[u8]) -> ChunkOutcome {
        let Some(sink) = self.sink.as_mut() else {
            return ChunkOutcome::Abort;
        };

        match sink.write_all(chunk).await {
            Ok(()) => {
                self.written += chunk.len() as u64;
                ChunkOutcome::Continue
            }
            Err(e) => {
                warn!("Writing {} failed after {} bytes: {}", self.path, self.written, e);
                self.status = FetchStatus::WriteFailed(e.to_string());
                ChunkOutcome::Abort
            }
        }
    }

    /// Records the final status once the whole reply has arrived.
    pub fn on_reply(&mut self, code: u16) {
        if matches!(self.status, FetchStatus::WriteFailed(_)) {
            return;
        }
        info!("Finished fetching");
        self.status = FetchStatus::Reply(code);
    }

    /// Closes the destination and answers the caller.
    pub async fn on_close(mut self) -> FetchOutcome {
        if let Some(mut sink) = self.sink.take() {
            let closed = match sink.flush().await {
                Ok(()) => sink.shutdown().await,
                Err(e) => Err(e),
            };
            if let Err(e) = closed {
                warn!("Closing {} failed: {}", self.path, e);
                if !matches!(self.status, FetchStatus::WriteFailed(_)) {
                    self.status = FetchStatus::WriteFailed(e.to_string());
                }
            }
        }

        info!("status {:?} bytes {}", self.status, self.written);
        let outcome = match self.status {
            FetchStatus::Reply(HTTP_OK) => FetchOutcome::Written(self.written),
            FetchStatus::Reply(code) => FetchOutcome::Failed(RpcError::code(code)),
            FetchStatus::WriteFailed(e) => FetchOutcome::Failed(RpcError::new(
                INTERNAL_ERROR,
                format!("write to {} failed: {}", self.path, e),
            )),
            FetchStatus::ConnectFailed(e) => FetchOutcome::Failed(RpcError::new(INTERNAL_ERROR, e)),
            FetchStatus::InProgress | FetchStatus::Connected => FetchOutcome::Failed(RpcError::new(
                INTERNAL_ERROR,
                "connection closed before reply completed",
            )),
        };

        match &outcome {
            FetchOutcome::Written(written) => self.reply.ok(json!({ "written": written })),
            FetchOutcome::Failed(error) => self.reply.error(error.clone()),
        }
        outcome
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Validates the request, opens the destination and starts the download.
///
/// Validation failures are answered before returning and no task is spawned.
/// Must be called from within a tokio runtime.
pub fn start_fetch(client: &Client, args: FetchArgs, reply: ReplyHandle) -> Option<JoinHandle<FetchOutcome>> {
    let (url, path, sink) = match prepare(args) {
        Ok(prepared) => prepared,
        Err(e) => {
            warn!("Fetch rejected: {}", e);
            reply.error(RpcError::new(INTERNAL_ERROR, e.to_string()));
            return None;
        }
    };

    info!("Fetching {} to {}", url, path);
    let session = FetchSession::new(reply, path, sink);
    Some(tokio::spawn(drive(client.clone(), url, session)))
}

/// The destination is created here so a failure is answered before any
/// network activity; writes to it go through tokio's blocking pool.
fn prepare(args: FetchArgs) -> Result<(Url, String, File), FetchError> {
    let (Some(url), Some(path)) = (args.url, args.file) else {
        return Err(FetchError::MissingArgs);
    };

    let url = Url::parse(&url).map_err(|_| FetchError::MalformedUrl)?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(FetchError::MalformedUrl);
    }

    let sink = std::fs::File::create(&path)
        .map_err(|source| FetchError::Open { path: path.clone(), source })?;
    Ok((url, path, File::from_std(sink)))
}

/// Feeds the HTTP exchange into the session, chunk by chunk.
pub async fn drive<W: AsyncWrite + Unpin>(client: Client, url: Url, mut session: FetchSession<W>) -> FetchOutcome {
    let mut response = match client.get(url).send().await {
        Ok(response) => {
            session.on_connect(Ok(()));
            response
        }
        Err(e) => {
            session.on_connect(Err(e.to_string()));
            return session.on_close().await;
        }
    };

    let code = response.status().as_u16();
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                if session.on_chunk(&chunk).await == ChunkOutcome::Abort {
                    debug!("Dropping connection: {:?}", session.status());
                    break;
                }
            }
            Ok(None) => {
                session.on_reply(code);
                break;
            }
            Err(e) => {
                warn!("Transfer interrupted after {} bytes: {}", session.written(), e);
                break;
            }
        }
    }
    drop(response);

    session.on_close().await
}

// ============================================================================
// Tests
// ============================================================================

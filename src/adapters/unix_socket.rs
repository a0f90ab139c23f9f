//! Unix Socket Transport
//!
//! Implements the `BackendTransport` port over the newline-delimited JSON
//! protocol in [`crate::plugin::protocol`]. One connection per exchange;
//! the registrar applies its own timeouts around each call.

use std::path::Path;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use tokio::net::UnixStream;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::debug;

use crate::domain::ports::BackendTransport;
use crate::error::{Error, Result};
use crate::plugin::protocol::{BackendInfo, ProbeResponse, RegistrarRequest, MAX_FRAME_BYTES};

/// Client for backend registration sockets.
#[derive(Debug, Clone, Default)]
pub struct UnixSocketTransport;

impl UnixSocketTransport {
    pub fn new() -> Self {
        Self
    }

    async fn exchange<T: DeserializeOwned>(
        &self,
        socket: &Path,
        request: RegistrarRequest,
    ) -> Result<T> {
        let failed = |reason: String| Error::HandshakeFailed {
            socket: socket.to_path_buf(),
            reason,
        };

        let stream = UnixStream::connect(socket)
            .await
            .map_err(|e| failed(format!("connect: {}", e)))?;
        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));

        let line = serde_json::to_string(&request)?;
        debug!(socket = %socket.display(), request = %line, "Sending plugin request");
        framed
            .send(line)
            .await
            .map_err(|e| failed(format!("send: {}", e)))?;

        let response = framed
            .next()
            .await
            .ok_or_else(|| failed("connection closed before response".to_string()))?
            .map_err(|e| failed(format!("receive: {}", e)))?;

        serde_json::from_str(&response).map_err(|e| failed(format!("malformed response: {}", e)))
    }
}

#[async_trait]
impl BackendTransport for UnixSocketTransport {
    async fn get_info(&self, socket: &Path) -> Result<BackendInfo> {
        self.exchange(socket, RegistrarRequest::GetInfo).await
    }

    async fn probe(&self, socket: &Path) -> Result<bool> {
        let response: ProbeResponse = self.exchange(socket, RegistrarRequest::Probe).await?;
        Ok(response.ready)
    }
}

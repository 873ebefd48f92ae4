//! TCP listener with newline-delimited JSON framing. One task per
//! connection; requests on a connection are answered in order.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::methods::MethodHandler;
use super::protocol::{Request, Response};

const MAX_LINE_BYTES: usize = 1024 * 1024;

pub struct Transport {
    listener: TcpListener,
    handler: Arc<MethodHandler>,
}

impl Transport {
    pub async fn bind(bind_addr: SocketAddr, handler: MethodHandler) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Self {
            listener,
            handler: Arc::new(handler),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` is cancelled.
    pub async fn listen(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(addr = ?self.local_addr().ok(), "RPC server listening");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Client connected");
                        let handler = self.handler.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                result = serve(stream, peer, handler) => {
                                    if let Err(e) = result {
                                        debug!(%peer, error = %e, "Connection error");
                                    }
                                }
                                _ = shutdown.cancelled() => {}
                            }
                            debug!(%peer, "Client disconnected");
                        });
                    }
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                },
                _ = shutdown.cancelled() => {
                    info!("RPC server shutting down");
                    break;
                }
            }
        }
        Ok(())
    }
}

async fn respond(line: &str, peer: SocketAddr, handler: &MethodHandler) -> Option<Response> {
    let request = match serde_json::from_str::<Request>(line) {
        Ok(request) => request,
        Err(e) => {
            warn!(%peer, error = %e, "Unparseable request");
            return Some(Response::parse_error());
        }
    };
    if let Err(reason) = request.validate() {
        warn!(%peer, reason, "Invalid request");
        return Some(Response::invalid_request(
            request.id.clone().unwrap_or(serde_json::Value::Null),
            reason,
        ));
    }
    debug!(%peer, method = %request.method, "Request");
    if request.is_notification() {
        handler.handle(request).await;
        return None;
    }
    Some(handler.handle(request).await)
}

async fn serve(stream: TcpStream, peer: SocketAddr, handler: Arc<MethodHandler>) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        // Never buffer more than one byte past the limit.
        let read = (&mut reader)
            .take(MAX_LINE_BYTES as u64 + 1)
            .read_line(&mut line)
            .await?;
        if read == 0 {
            return Ok(());
        }
        if line.len() > MAX_LINE_BYTES {
            warn!(%peer, limit = MAX_LINE_BYTES, "Request too large; closing connection");
            return Ok(());
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(response) = respond(trimmed, peer, &handler).await {
            let mut encoded = serde_json::to_string(&response)?;
            encoded.push('\n');
            writer.write_all(encoded.as_bytes()).await?;
        }
    }
}

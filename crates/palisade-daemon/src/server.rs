//! Localhost RPC server

use crate::session::RemoteSession;
use anyhow::Result;
use palisade_core::protocol::{self, Request, Response};
use palisade_core::PalisadeError;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

/// Serve connections until a client sends `Shutdown` or the process is
/// interrupted.
pub async fn run(listener: TcpListener, session: Arc<RemoteSession>) -> Result<()> {
    let shutdown = Arc::new(Notify::new());

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                tracing::debug!(%peer, "connection accepted");
                let session = Arc::clone(&session);
                let shutdown = Arc::clone(&shutdown);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, session, shutdown).await {
                        tracing::error!(error = %e, "connection error");
                    }
                });
            }
            () = shutdown.notified() => {
                tracing::info!(process = session.name(), "shutdown requested");
                break;
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                tracing::info!(process = session.name(), "interrupted");
                break;
            }
        }
    }

    session.coordinator().shutdown();
    Ok(())
}

/// Handle one client connection
async fn handle_connection(mut stream: TcpStream, session: Arc<RemoteSession>, shutdown: Arc<Notify>) -> Result<()> {
    stream.set_nodelay(true)?;
    let mut buf = Vec::new();

    loop {
        // Length prefix (4 bytes, big-endian)
        let mut header = [0u8; 4];
        if stream.read_exact(&mut header).await.is_err() {
            break; // Client disconnected
        }
        let len = protocol::frame_len(header)?;
        buf.resize(len, 0);
        stream.read_exact(&mut buf).await?;

        let request: Request = protocol::decode(&buf)?;
        let stop = matches!(request, Request::Shutdown);
        tracing::debug!(request = request.kind(), "received request");

        // Executions block; keep them off the reactor.
        let handler = Arc::clone(&session);
        let response = tokio::task::spawn_blocking(move || handler.handle(request))
            .await
            .unwrap_or_else(|e| {
                Response::failure(&PalisadeError::ExecutionFailure {
                    unit: String::new(),
                    message: format!("request handler failed: {e}"),
                })
            });

        let bytes = protocol::encode(&response)?;
        stream.write_all(&protocol::frame_header(bytes.len())?).await?;
        stream.write_all(&bytes).await?;
        stream.flush().await?;

        if stop {
            shutdown.notify_one();
            break;
        }
    }

    Ok(())
}

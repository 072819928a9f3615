use crate::error::{Result, TransportError};
use crate::service::connection::{ClientConnection, ReadStatus, ServerContext, Transport};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

const READ_CHUNK: usize = 8 * 1024;

/// Outgoing buffer of one socket. The driver drains it after every call into
/// the connection.
#[derive(Debug)]
pub struct SocketTransport {
    peer: SocketAddr,
    out: BytesMut,
    capacity: usize,
    connected: bool,
}

impl SocketTransport {
    pub fn new(peer: SocketAddr, capacity: usize) -> Self {
        Self {
            peer,
            out: BytesMut::with_capacity(capacity.min(64 * 1024)),
            capacity,
            connected: true,
        }
    }

    /// Take everything written so far.
    pub fn take_output(&mut self) -> BytesMut {
        self.out.split()
    }

    pub fn has_output(&self) -> bool {
        !self.out.is_empty()
    }
}

impl Transport for SocketTransport {
    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn available(&self) -> usize {
        self.capacity.saturating_sub(self.out.len())
    }

    fn write(&mut self, data: &[u8]) -> std::result::Result<usize, TransportError> {
        if !self.connected {
            return Err(TransportError::Closed);
        }
        // an empty buffer takes any frame so oversized replies still make progress
        if !self.out.is_empty() && data.len() > self.available() {
            return Err(TransportError::WouldBlock);
        }
        self.out.extend_from_slice(data);
        Ok(data.len())
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }
}

/// Start a server bound to `config.server.address` that stops on CTRL+C.
#[instrument(skip(ctx), fields(address = %ctx.config.server.address))]
pub async fn start_server(ctx: ServerContext) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            info!("Received CTRL+C signal, shutting down");
            let _ = shutdown_tx.send(()).await;
        }
    });

    start_server_with_shutdown(ctx, shutdown_rx).await
}

/// Start a server bound to `config.server.address` with an external shutdown channel.
#[instrument(skip(ctx, shutdown_rx), fields(address = %ctx.config.server.address))]
pub async fn start_server_with_shutdown(ctx: ServerContext, shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
    let listener = TcpListener::bind(&ctx.config.server.address).await?;
    serve(listener, ctx, shutdown_rx).await
}

/// Accept clients on `listener` until `shutdown_rx` fires, then wait for open
/// connections to finish (bounded by `server.shutdown_timeout`).
pub async fn serve(listener: TcpListener, ctx: ServerContext, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
    info!(address = %listener.local_addr()?, "Listening for clients");

    let (close_tx, close_rx) = watch::channel(false);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Shutting down server. Waiting for connections to close...");
                let _ = close_tx.send(true);
                wait_for_connections(&ctx).await;
                ctx.metrics.log_metrics();
                return Ok(());
            }

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer)) => {
                        // counted before spawning so back-to-back accepts see it
                        if !ctx.registry.try_increment_connected(ctx.config.server.max_connections) {
                            warn!(peer = %peer, "Connection limit reached, rejecting client");
                            ctx.metrics.connection_rejected();
                            drop(stream);
                        } else {
                            let ctx = ctx.clone();
                            let close_rx = close_rx.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer, ctx, close_rx).await {
                                    debug!(peer = %peer, error = %e, "Connection ended with error");
                                }
                            });
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Error accepting connection");
                    }
                }
            }
        }
    }
}

async fn wait_for_connections(ctx: &ServerContext) {
    let timeout = tokio::time::sleep(ctx.config.server.shutdown_timeout);
    tokio::pin!(timeout);

    loop {
        let connections = ctx.registry.connected_count();
        if connections == 0 {
            info!("All connections closed, shutting down");
            return;
        }
        tokio::select! {
            _ = &mut timeout => {
                warn!(connections, "Shutdown timeout reached, forcing exit");
                return;
            }
            _ = tokio::time::sleep(Duration::from_millis(50)) => {
                debug!(connections, "Waiting for connections to close");
            }
        }
    }
}

async fn flush(conn: &mut ClientConnection<SocketTransport>, writer: &mut OwnedWriteHalf) -> Result<()> {
    while conn.transport().has_output() {
        let chunk = conn.transport_mut().take_output();
        writer.write_all(&chunk).await?;
    }
    Ok(())
}

/// Drive one client: read, feed the connection, write what it produced.
///
/// The caller has already reserved the client's connection slot.
#[instrument(skip(stream, ctx, close_rx), fields(peer = %peer))]
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: ServerContext,
    mut close_rx: watch::Receiver<bool>,
) -> Result<()> {
    let capacity = ctx.config.transport.send_buffer_size;
    let mut conn = ClientConnection::with_reserved_slot(SocketTransport::new(peer, capacity), ctx);

    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();
    conn.on_connect()?;
    flush(&mut conn, &mut writer).await?;

    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    loop {
        buf.clear();
        let n = tokio::select! {
            read = reader.read_buf(&mut buf) => read?,
            _ = close_rx.changed() => {
                debug!("Server shutting down, closing client");
                break;
            }
        };
        if n == 0 {
            debug!("Client closed the connection");
            break;
        }

        let mut status = conn.on_read(&buf);
        loop {
            flush(&mut conn, &mut writer).await?;
            match status {
                ReadStatus::Blocked => status = conn.resume(),
                ReadStatus::Idle | ReadStatus::Closed => break,
            }
        }

        if status == ReadStatus::Closed {
            break;
        }
    }

    conn.on_disconnect();
    let _ = writer.shutdown().await;
    Ok(())
}

//! TCP server implementation.
//!
//! Each accepted connection gets its own task. That task negotiates the codec,
//! then reads requests strictly in order and spawns one worker per request.
//! Workers dispatch concurrently and write their responses through a shared
//! writer lock, so frames never interleave. The connection task waits for
//! every worker before shutting the stream down.

use crate::dispatch::Dispatcher;
use crate::error::ServerError;
use rpcmux_protocol::{
    read_descriptor, CodecRegistry, CodecType, FrameReader, FrameWriter, Header, ProtocolError,
};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Mutex};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Codecs accepted during negotiation.
    pub registry: Arc<CodecRegistry>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 7700)),
            max_connections: 1000,
            registry: Arc::new(CodecRegistry::with_defaults()),
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_registry(mut self, registry: Arc<CodecRegistry>) -> Self {
        self.registry = registry;
        self
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
}

impl ServerStats {
    fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// TCP server for rpcmux.
pub struct Server<D> {
    config: ServerConfig,
    dispatcher: Arc<D>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl<D: Dispatcher> Server<D> {
    /// Creates a new server.
    pub fn new(config: ServerConfig, dispatcher: D) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            dispatcher: Arc::new(dispatcher),
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accepts connections from `listener` until shutdown or a listener error.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let mut shutdown_rx = self.shutdown.subscribe();
        self.running.store(true, Ordering::SeqCst);

        match listener.local_addr() {
            Ok(addr) => tracing::info!("Server listening on {}", addr),
            Err(_) => tracing::info!("Server listening"),
        }

        let result = loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }
                            tcp_stream.set_nodelay(true).ok();

                            self.stats.connection_opened();
                            let conn = self.connection(addr);
                            tokio::spawn(async move {
                                let _ = conn.run(tcp_stream).await;
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                            break Err(ServerError::Io(e));
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break Ok(());
                }
            }
        };

        self.running.store(false, Ordering::SeqCst);
        result
    }

    /// Serves one already-established connection until the peer disconnects.
    ///
    /// Works over any duplex byte stream, not just TCP.
    pub async fn serve_connection<S>(
        &self,
        stream: S,
        peer: impl fmt::Display,
    ) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.stats.connection_opened();
        self.connection(peer).run(stream).await
    }

    fn connection(&self, peer: impl fmt::Display) -> Connection<D> {
        Connection {
            peer: peer.to_string(),
            dispatcher: self.dispatcher.clone(),
            registry: self.config.registry.clone(),
            stats: self.stats.clone(),
            shutdown: self.shutdown.subscribe(),
        }
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

type SharedWriter<W> = Arc<Mutex<FrameWriter<W>>>;

/// Per-connection state handed to the connection task.
struct Connection<D> {
    peer: String,
    dispatcher: Arc<D>,
    registry: Arc<CodecRegistry>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Receiver<()>,
}

impl<D: Dispatcher> Connection<D> {
    async fn run<S>(mut self, stream: S) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        tracing::info!("Client connected: {}", self.peer);

        let result = self.handle(stream).await;
        if let Err(ref e) = result {
            if !e.is_disconnect() {
                tracing::debug!("Connection {} error: {}", self.peer, e);
                self.stats.errors_total.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.stats.connection_closed();
        tracing::info!("Client disconnected: {}", self.peer);
        result
    }

    async fn handle<S>(&mut self, stream: S) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut buffered = BufReader::new(read_half);

        let negotiated = read_descriptor(&mut buffered)
            .await
            .and_then(|descriptor| descriptor.validate(&self.registry));
        let codec = match negotiated {
            Ok(codec) => codec,
            Err(e) => {
                tracing::warn!("[{}] Negotiation failed: {}", self.peer, e);
                return Err(e.into());
            }
        };
        tracing::debug!("[{}] Negotiated codec {}", self.peer, codec);

        let mut reader = FrameReader::from_buffered(buffered, codec);
        let writer = Arc::new(Mutex::new(FrameWriter::new(write_half, codec)));
        let (workers, mut workers_done) = mpsc::channel::<()>(1);

        let result = self.read_requests(&mut reader, &writer, &workers).await;

        // recv yields None once every worker has dropped its sender.
        drop(workers);
        let _ = workers_done.recv().await;

        if let Err(e) = writer.lock().await.shutdown().await {
            tracing::debug!("[{}] Shutdown error: {}", self.peer, e);
        }
        result
    }

    async fn read_requests<R, W>(
        &mut self,
        reader: &mut FrameReader<R>,
        writer: &SharedWriter<W>,
        workers: &mpsc::Sender<()>,
    ) -> Result<(), ServerError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let codec = reader.codec();
        loop {
            let header = tokio::select! {
                biased;
                _ = self.shutdown.recv() => {
                    tracing::debug!("[{}] Shutdown signal received", self.peer);
                    return Err(ServerError::ShuttingDown);
                }
                result = reader.read_header() => result,
            };
            let header = match header {
                Ok(header) => header,
                Err(ProtocolError::ConnectionClosed) => {
                    tracing::debug!("[{}] Connection closed by client", self.peer);
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!("[{}] Read header error: {}", self.peer, e);
                    return Err(e.into());
                }
            };
            self.stats.requests_total.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                "[{}] Request: {} (seq={})",
                self.peer,
                header.service_method,
                header.seq
            );

            let body = reader.read_body_bytes().await?;
            let args = match codec.decode::<D::Args>(&body) {
                Ok(args) => args,
                Err(e) => {
                    tracing::warn!(
                        "[{}] Invalid arguments for {} (seq={}): {}",
                        self.peer,
                        header.service_method,
                        header.seq,
                        e
                    );
                    self.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                    let header = header.with_error(format!("rpc server: read argv err: {}", e));
                    send_response(writer, &header, None).await;
                    continue;
                }
            };

            let worker = Worker {
                codec,
                dispatcher: self.dispatcher.clone(),
                writer: writer.clone(),
                stats: self.stats.clone(),
                _done: workers.clone(),
            };
            tokio::spawn(worker.handle(header, args));
        }
    }
}

/// Handles one request. Dropping it signals the connection task.
struct Worker<D, W> {
    codec: CodecType,
    dispatcher: Arc<D>,
    writer: SharedWriter<W>,
    stats: Arc<ServerStats>,
    _done: mpsc::Sender<()>,
}

impl<D, W> Worker<D, W>
where
    D: Dispatcher,
    W: AsyncWrite + Send + Unpin,
{
    async fn handle(self, header: Header, args: D::Args) {
        // Dispatchers are synchronous and may block; keep them off the
        // runtime threads that drive every other connection.
        let dispatcher = self.dispatcher.clone();
        let codec = self.codec;
        let request = header.clone();
        let response = tokio::task::spawn_blocking(move || {
            match dispatcher.dispatch(&request, args) {
                Ok(reply) => codec.encode(&reply).map_err(|e| {
                    tracing::warn!("Failed to encode reply for {}: {}", request.service_method, e);
                    format!("rpc server: encode reply err: {}", e)
                }),
                Err(e) => {
                    tracing::debug!(
                        "{} (seq={}) failed: {}",
                        request.service_method,
                        request.seq,
                        e
                    );
                    Err(e.to_string())
                }
            }
        })
        .await
        .unwrap_or_else(|e| {
            tracing::error!(
                "Dispatch of {} (seq={}) panicked: {}",
                header.service_method,
                header.seq,
                e
            );
            Err(format!("rpc server: dispatch failed: {}", e))
        });

        match response {
            Ok(body) => send_response(&self.writer, &header, Some(&body)).await,
            Err(text) => {
                self.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                send_response(&self.writer, &header.with_error(text), None).await;
            }
        }
    }
}

/// Writes one response frame under the writer lock. A missing body is sent as
/// the invalid-request marker.
async fn send_response<W>(writer: &SharedWriter<W>, header: &Header, body: Option<&[u8]>)
where
    W: AsyncWrite + Unpin,
{
    let mut writer = writer.lock().await;
    let result = match body {
        Some(body) => writer.write_encoded(header, body).await,
        None => writer.write_frame(header, &()).await,
    };
    if let Err(e) = result {
        tracing::debug!(
            "Failed to write response for {} (seq={}): {}",
            header.service_method,
            header.seq,
            e
        );
    }
}

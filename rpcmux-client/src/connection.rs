//! Connection management and call multiplexing.
//!
//! A [`Connection`] owns one negotiated stream. Outbound calls are serialized
//! through the write lock; inbound frames are read by a single background
//! task that matches each response to its pending call by sequence number.
//!
//! Two locks guard the shared state:
//! - `writer` (async) orders whole-frame writes and is held across I/O.
//! - `state` (sync) guards the pending table and the closing/shutdown flags
//!   and is never held across an `.await`.
//!
//! When both are needed the writer is always taken first.
//!
//! Closing never waits behind a stalled write: `cancel` interrupts any write
//! in progress, and the interrupted call is failed by the shutdown sweep.

use crate::error::ClientError;
use bytes::Bytes;
use rpcmux_protocol::{
    write_descriptor, CodecRegistry, CodecType, Descriptor, FrameReader, FrameWriter, Header,
    ProtocolError,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, Notify};

/// Default TCP connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Codec tag sent in the negotiation descriptor. Empty selects the default codec.
    pub codec_type: String,
    /// Timeout for establishing the TCP connection in [`Client::dial`](crate::Client::dial).
    pub connect_timeout: Duration,
    /// Deadline applied by [`Client::call`](crate::Client::call). `None` waits forever.
    pub call_timeout: Option<Duration>,
    /// Codecs this client is able to speak.
    pub registry: Arc<CodecRegistry>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            codec_type: CodecType::default().tag().to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            call_timeout: None,
            registry: Arc::new(CodecRegistry::with_defaults()),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_codec(mut self, codec_type: impl Into<String>) -> Self {
        self.codec_type = codec_type.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn with_registry(mut self, registry: CodecRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Builds the descriptor sent at connection start.
    pub fn descriptor(&self) -> Descriptor {
        if self.codec_type.is_empty() {
            Descriptor::default()
        } else {
            Descriptor::new(self.codec_type.clone())
        }
    }
}

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How a pending call ended.
pub(crate) enum Outcome {
    /// Raw reply body, still to be decoded into the caller's reply type.
    Reply(Bytes),
    Failed(ClientError),
}

/// Finishes a call: receives the sequence number and outcome, fills in the
/// call record and pushes it onto its completion queue.
pub(crate) type Completer = Box<dyn FnOnce(u64, Outcome) + Send>;

struct PendingCall {
    service_method: String,
    complete: Completer,
}

struct State {
    next_seq: u64,
    pending: HashMap<u64, PendingCall>,
    /// Set by the user through `close`.
    closing: bool,
    /// Set when the receive loop stops.
    shutdown: bool,
}

/// A negotiated connection shared by the client and its receive task.
pub(crate) struct Connection {
    codec: CodecType,
    writer: Mutex<FrameWriter<BoxedWriter>>,
    state: parking_lot::Mutex<State>,
    /// Wakes the receive task on `close` or drop.
    closed: Notify,
    /// Interrupts in-flight writes once the connection stops accepting calls.
    cancel: Notify,
}

impl Connection {
    /// Negotiates over `stream` and starts the receive task.
    pub(crate) async fn establish<S>(
        stream: S,
        config: &ClientConfig,
    ) -> Result<Arc<Self>, ClientError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let descriptor = config.descriptor();
        let codec = config.registry.resolve(&descriptor.codec_type)?;

        let (read_half, mut write_half) = tokio::io::split(stream);
        write_descriptor(&mut write_half, &descriptor).await?;
        tracing::debug!("Negotiated codec {}", codec);

        let reader = FrameReader::new(Box::new(read_half) as BoxedReader, codec);
        let writer = FrameWriter::new(Box::new(write_half) as BoxedWriter, codec);
        let conn = Arc::new(Self {
            codec,
            writer: Mutex::new(writer),
            state: parking_lot::Mutex::new(State {
                next_seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
            closed: Notify::new(),
            cancel: Notify::new(),
        });

        tokio::spawn(conn.clone().receive_loop(reader));
        Ok(conn)
    }

    pub(crate) fn codec(&self) -> CodecType {
        self.codec
    }

    /// Assigns a sequence number and records the call as pending.
    ///
    /// Hands the completer back if the connection no longer accepts calls.
    fn register(&self, service_method: &str, complete: Completer) -> Result<u64, Completer> {
        let mut state = self.state.lock();
        if state.closing || state.shutdown {
            return Err(complete);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.pending.insert(
            seq,
            PendingCall {
                service_method: service_method.to_string(),
                complete,
            },
        );
        Ok(seq)
    }

    fn remove(&self, seq: u64) -> Option<PendingCall> {
        self.state.lock().pending.remove(&seq)
    }

    /// Drops a pending call without completing it. Returns whether it was
    /// still pending.
    pub(crate) fn forget(&self, seq: u64) -> bool {
        self.remove(seq).is_some()
    }

    /// Registers and writes one call.
    ///
    /// Returns the assigned sequence number, or `None` if the call was failed
    /// before reaching the wire. On a write error the call is removed from the
    /// pending table and completed with that error. A write interrupted by
    /// `close` or connection loss leaves the call pending for the shutdown
    /// sweep.
    pub(crate) async fn send(
        &self,
        service_method: &str,
        body: &[u8],
        complete: Completer,
    ) -> Option<u64> {
        // Armed before `register` checks the flags, so a cancel issued after
        // registration is never missed.
        let cancelled = self.cancel.notified();
        tokio::pin!(cancelled);
        cancelled.as_mut().enable();

        let mut writer = self.writer.lock().await;

        let seq = match self.register(service_method, complete) {
            Ok(seq) => seq,
            Err(complete) => {
                drop(writer);
                complete(0, Outcome::Failed(ClientError::Shutdown));
                return None;
            }
        };

        let header = Header::request(service_method, seq);
        let result = tokio::select! {
            biased;
            _ = &mut cancelled => {
                tracing::debug!("Send of {} (seq={}) interrupted", service_method, seq);
                return Some(seq);
            }
            result = writer.write_encoded(&header, body) => result,
        };
        if let Err(e) = result {
            tracing::debug!("Failed to send {} (seq={}): {}", service_method, seq, e);
            if let Some(call) = self.remove(seq) {
                (call.complete)(seq, Outcome::Failed(ClientError::Protocol(e)));
            }
        }
        Some(seq)
    }

    pub(crate) fn is_available(&self) -> bool {
        let state = self.state.lock();
        !state.closing && !state.shutdown
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Marks the connection closing and shuts the stream down.
    ///
    /// Only the first call does any I/O; later calls report
    /// [`ClientError::Shutdown`].
    pub(crate) async fn close(&self) -> Result<(), ClientError> {
        {
            let mut state = self.state.lock();
            if state.closing {
                return Err(ClientError::Shutdown);
            }
            state.closing = true;
        }
        self.cancel.notify_waiters();
        self.closed.notify_one();
        self.writer.lock().await.shutdown().await?;
        Ok(())
    }

    /// Stops the receive task without touching the stream.
    pub(crate) fn stop(&self) {
        self.closed.notify_one();
    }

    async fn receive_loop(self: Arc<Self>, mut reader: FrameReader<BoxedReader>) {
        let cause = loop {
            let frame = tokio::select! {
                biased;
                _ = self.closed.notified() => break None,
                result = read_frame(&mut reader) => result,
            };
            let (header, body) = match frame {
                Ok(frame) => frame,
                Err(e) => break Some(Arc::new(e)),
            };

            match self.remove(header.seq) {
                None => {
                    tracing::debug!("Discarding response for unknown seq={}", header.seq);
                }
                Some(call) if header.is_error() => {
                    tracing::debug!(
                        "{} (seq={}) failed remotely: {}",
                        call.service_method,
                        header.seq,
                        header.error
                    );
                    (call.complete)(header.seq, Outcome::Failed(ClientError::Server(header.error)));
                }
                Some(call) => {
                    (call.complete)(header.seq, Outcome::Reply(body));
                }
            }
        };

        self.terminate(cause).await;
    }

    /// Fails every pending call with the terminal error and refuses new ones.
    async fn terminate(&self, cause: Option<Arc<ProtocolError>>) {
        match cause {
            Some(ref e) => tracing::debug!("Receive loop stopped: {}", e),
            None => tracing::debug!("Receive loop stopped: client closed"),
        }

        self.state.lock().shutdown = true;
        self.cancel.notify_waiters();

        let _writer = self.writer.lock().await;
        let pending = std::mem::take(&mut self.state.lock().pending);

        if !pending.is_empty() {
            tracing::debug!("Terminating {} pending call(s)", pending.len());
        }
        for (seq, call) in pending {
            let err = match cause {
                Some(ref e) => ClientError::ConnectionLost(e.clone()),
                None => ClientError::Shutdown,
            };
            (call.complete)(seq, Outcome::Failed(err));
        }
    }
}

async fn read_frame(
    reader: &mut FrameReader<BoxedReader>,
) -> Result<(Header, Bytes), ProtocolError> {
    let header = reader.read_header().await?;
    let body = reader.read_body_bytes().await?;
    Ok((header, body))
}

//! High-level client API.

use crate::call::{
    completion_queue, deliver, Call, CompletionSender, Done, DEFAULT_COMPLETION_CAPACITY,
};
use crate::connection::{ClientConfig, Completer, Connection, Outcome};
use crate::error::ClientError;
use rpcmux_protocol::CodecType;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};

/// An RPC client bound to one connection.
///
/// A client may be shared between tasks (for example behind an `Arc`); calls
/// issued concurrently are multiplexed over the same stream.
pub struct Client {
    conn: Arc<Connection>,
    config: ClientConfig,
}

impl Client {
    /// Negotiates over an established stream and starts the receive task.
    ///
    /// Fails without writing anything if the configured codec is not in the
    /// client's registry.
    pub async fn new<S>(stream: S, config: ClientConfig) -> Result<Self, ClientError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let conn = Connection::establish(stream, &config).await?;
        Ok(Self { conn, config })
    }

    /// Connects over TCP and negotiates.
    pub async fn dial(addr: impl ToSocketAddrs, config: ClientConfig) -> Result<Self, ClientError> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                tracing::debug!("Connection timeout");
                ClientError::Timeout
            })??;

        // Latency matters more than throughput for small frames.
        stream.set_nodelay(true).ok();

        Self::new(stream, config).await
    }

    /// Returns the negotiated codec.
    pub fn codec(&self) -> CodecType {
        self.conn.codec()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns true while the client is neither closed nor shut down.
    pub fn is_available(&self) -> bool {
        self.conn.is_available()
    }

    /// Returns the number of calls awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.conn.pending_count()
    }

    /// Closes the connection. Every pending call completes with
    /// [`ClientError::Shutdown`].
    ///
    /// Closing an already-closed client returns [`ClientError::Shutdown`].
    pub async fn close(&self) -> Result<(), ClientError> {
        self.conn.close().await
    }

    /// Issues a call asynchronously and returns its completion queue.
    pub async fn go<A, R>(&self, service_method: &str, args: A, reply: R) -> Done<A, R>
    where
        A: Serialize + Send + 'static,
        R: DeserializeOwned + Send + 'static,
    {
        let (tx, rx) = completion_queue(DEFAULT_COMPLETION_CAPACITY);
        self.go_with(service_method, args, reply, tx).await;
        rx
    }

    /// Issues a call asynchronously, completing it onto `done`.
    ///
    /// One queue may collect many calls. The call is pushed onto the queue
    /// exactly once, whether it succeeds, fails remotely or is swept up by
    /// connection shutdown.
    pub async fn go_with<A, R>(
        &self,
        service_method: &str,
        args: A,
        reply: R,
        done: CompletionSender<A, R>,
    ) where
        A: Serialize + Send + 'static,
        R: DeserializeOwned + Send + 'static,
    {
        self.start(service_method, args, reply, done).await;
    }

    /// Issues a call and waits for its reply.
    ///
    /// Applies [`ClientConfig::call_timeout`] when set.
    pub async fn call<A, R>(
        &self,
        service_method: &str,
        args: A,
        reply: R,
    ) -> Result<R, ClientError>
    where
        A: Serialize + Send + 'static,
        R: DeserializeOwned + Send + 'static,
    {
        if let Some(timeout) = self.config.call_timeout {
            return self.call_timeout(service_method, args, reply, timeout).await;
        }

        let (tx, mut rx) = completion_queue(1);
        self.start(service_method, args, reply, tx).await;
        match rx.recv().await {
            Some(call) => call.into_result(),
            None => Err(ClientError::Shutdown),
        }
    }

    /// Issues a call and waits at most `timeout` for its reply.
    ///
    /// On expiry the call stops being tracked; a response arriving later is
    /// discarded.
    pub async fn call_timeout<A, R>(
        &self,
        service_method: &str,
        args: A,
        reply: R,
        timeout: Duration,
    ) -> Result<R, ClientError>
    where
        A: Serialize + Send + 'static,
        R: DeserializeOwned + Send + 'static,
    {
        let (tx, mut rx) = completion_queue(1);
        let seq = self.start(service_method, args, reply, tx).await;

        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(call)) => call.into_result(),
            Ok(None) => Err(ClientError::Shutdown),
            Err(_) => {
                if let Some(seq) = seq {
                    if self.conn.forget(seq) {
                        tracing::debug!("{} (seq={}) timed out", service_method, seq);
                    }
                }
                Err(ClientError::Timeout)
            }
        }
    }

    /// Encodes the arguments, registers the call and writes it.
    async fn start<A, R>(
        &self,
        service_method: &str,
        args: A,
        reply: R,
        done: CompletionSender<A, R>,
    ) -> Option<u64>
    where
        A: Serialize + Send + 'static,
        R: DeserializeOwned + Send + 'static,
    {
        let codec = self.conn.codec();
        let mut call = Call::new(service_method, args, reply);

        let body = match codec.encode(&call.args) {
            Ok(body) => body,
            Err(e) => {
                call.error = Some(ClientError::Protocol(e));
                deliver(&done, call);
                return None;
            }
        };

        let complete: Completer = Box::new(move |seq, outcome| {
            call.seq = seq;
            match outcome {
                Outcome::Reply(body) => match codec.decode::<R>(&body) {
                    Ok(reply) => call.reply = reply,
                    Err(e) => call.error = Some(ClientError::Protocol(e)),
                },
                Outcome::Failed(err) => call.error = Some(err),
            }
            deliver(&done, call);
        });

        self.conn.send(service_method, &body, complete).await
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // The receive task holds its own reference to the connection; wake it
        // so it fails any stragglers and releases the stream.
        self.conn.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rpcmux_protocol::{
        read_descriptor, CodecRegistry, FrameReader, FrameWriter, Header, ProtocolError, RawFrame,
        JSON_TYPE,
    };
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::task::{Context, Poll};
    use tokio::io::{AsyncReadExt, BufReader, DuplexStream, ReadBuf, ReadHalf, WriteHalf};
    use tokio::task::JoinHandle;

    type ServerReader = FrameReader<ReadHalf<DuplexStream>>;
    type ServerWriter = FrameWriter<WriteHalf<DuplexStream>>;

    async fn accept(stream: DuplexStream) -> (ServerReader, ServerWriter) {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut buffered = BufReader::new(read_half);
        let descriptor = read_descriptor(&mut buffered).await.unwrap();
        let codec = descriptor
            .validate(&CodecRegistry::with_defaults())
            .unwrap();
        (
            FrameReader::from_buffered(buffered, codec),
            FrameWriter::new(write_half, codec),
        )
    }

    /// Answers every request with `"resp <seq>"`, or with an error header
    /// for the sequence number in `fail_seq`.
    fn spawn_echo_server(stream: DuplexStream, fail_seq: Option<u64>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let (mut reader, mut writer) = accept(stream).await;
            while let Ok(header) = reader.read_header().await {
                if reader.discard_body().await.is_err() {
                    break;
                }
                let result = if Some(header.seq) == fail_seq {
                    let header = header.with_error("method not found");
                    writer.write_frame(&header, &()).await
                } else {
                    let reply = format!("resp {}", header.seq);
                    writer.write_frame(&header, &reply).await
                };
                if result.is_err() {
                    break;
                }
            }
        })
    }

    async fn client_pair(config: ClientConfig) -> (Client, DuplexStream) {
        let (client_end, server_end) = tokio::io::duplex(64 * 1024);
        let client = Client::new(client_end, config).await.unwrap();
        (client, server_end)
    }

    #[tokio::test]
    async fn test_sync_call_returns_reply() {
        for codec in [JSON_TYPE, rpcmux_protocol::BINCODE_TYPE] {
            let (client, server_end) = client_pair(ClientConfig::new().with_codec(codec)).await;
            let _server = spawn_echo_server(server_end, None);

            let reply: String = client
                .call("Foo.Sum", "rpcmux req 1".to_string(), String::new())
                .await
                .unwrap();
            assert_eq!(reply, "resp 1");
            assert_eq!(client.pending_count(), 0);
        }
    }

    #[tokio::test]
    async fn test_remote_error_leaves_reply_untouched() {
        let (client, server_end) = client_pair(ClientConfig::new()).await;
        let _server = spawn_echo_server(server_end, Some(7));

        for seq in 1..7u64 {
            let reply: String = client.call("Foo.Sum", seq, String::new()).await.unwrap();
            assert_eq!(reply, format!("resp {}", seq));
        }

        let mut done = client
            .go("Foo.Sum", 7u64, "untouched".to_string())
            .await;
        let call = done.recv().await.unwrap();
        assert_eq!(call.seq, 7);
        assert_eq!(call.reply, "untouched");
        match call.error {
            Some(ClientError::Server(ref text)) => assert_eq!(text, "method not found"),
            ref other => panic!("unexpected error: {:?}", other),
        }

        // The connection survives a per-call failure.
        let reply: String = client.call("Foo.Sum", 8u64, String::new()).await.unwrap();
        assert_eq!(reply, "resp 8");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_calls_are_matched() {
        let (client, server_end) = client_pair(ClientConfig::new()).await;
        let _server = spawn_echo_server(server_end, None);
        let client = Arc::new(client);

        let mut tasks = Vec::new();
        for i in 0..64u32 {
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                let mut done = client.go("Foo.Sum", i, String::new()).await;
                let call = done.recv().await.unwrap();
                assert!(done.try_recv().is_err(), "call completed more than once");
                (i, call)
            }));
        }

        let mut seqs = Vec::new();
        for task in tasks {
            let (i, call) = task.await.unwrap();
            assert_eq!(call.args, i);
            assert!(call.is_ok());
            assert_eq!(call.reply, format!("resp {}", call.seq));
            seqs.push(call.seq);
        }
        seqs.sort_unstable();
        seqs.dedup();
        assert_eq!(seqs.len(), 64);
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_responses() {
        let (client, server_end) = client_pair(ClientConfig::new()).await;

        // Collect every request first, then answer in reverse.
        let server = tokio::spawn(async move {
            let (mut reader, mut writer) = accept(server_end).await;
            let mut headers = Vec::new();
            for _ in 0..5 {
                let header = reader.read_header().await.unwrap();
                let args: u32 = reader.read_body().await.unwrap();
                headers.push((header, args));
            }
            for (header, args) in headers.into_iter().rev() {
                writer.write_frame(&header, &(args * 10)).await.unwrap();
            }
        });

        let (tx, mut done) = completion_queue(5);
        for i in 0..5u32 {
            client.go_with("Math.Times10", i, 0u32, tx.clone()).await;
        }
        server.await.unwrap();

        let mut completed = Vec::new();
        for _ in 0..5 {
            completed.push(done.recv().await.unwrap());
        }
        // Reverse order of arrival, each matched to its own request.
        assert_eq!(completed[0].args, 4);
        for call in completed {
            assert!(call.is_ok());
            assert_eq!(call.reply, call.args * 10);
            assert_eq!(call.seq, u64::from(call.args) + 1);
        }
    }

    #[tokio::test]
    async fn test_connection_loss_fails_all_pending() {
        let (client, server_end) = client_pair(ClientConfig::new()).await;

        let server = tokio::spawn(async move {
            let (mut reader, _writer) = accept(server_end).await;
            for _ in 0..3 {
                reader.read_header().await.unwrap();
                reader.discard_body().await.unwrap();
            }
            // Dropping both halves closes the stream.
        });

        let (tx, mut done) = completion_queue::<u32, String>(3);
        for i in 0..3u32 {
            client.go_with("Foo.Sum", i, String::new(), tx.clone()).await;
        }
        server.await.unwrap();

        let mut seqs = Vec::new();
        for _ in 0..3 {
            let call = done.recv().await.unwrap();
            match call.error {
                Some(ClientError::ConnectionLost(ref cause)) => {
                    assert!(matches!(**cause, ProtocolError::ConnectionClosed));
                }
                ref other => panic!("unexpected error: {:?}", other),
            }
            seqs.push(call.seq);
        }
        seqs.sort_unstable();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(client.pending_count(), 0);
        assert!(!client.is_available());

        let result: Result<String, _> = client.call("Foo.Sum", 4u32, String::new()).await;
        assert!(matches!(result, Err(ClientError::Shutdown)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_fails_pending() {
        let (client, server_end) = client_pair(ClientConfig::new()).await;
        let (mut reader, _writer) = accept(server_end).await;

        let mut done = client.go("Foo.Sum", 1u32, String::new()).await;
        reader.read_header().await.unwrap();
        reader.discard_body().await.unwrap();
        assert_eq!(client.pending_count(), 1);

        client.close().await.unwrap();
        assert!(!client.is_available());

        let call = done.recv().await.unwrap();
        assert!(matches!(call.error, Some(ClientError::Shutdown)));
        assert_eq!(client.pending_count(), 0);

        assert!(matches!(client.close().await, Err(ClientError::Shutdown)));

        // The stream was shut down exactly once; nothing further arrives.
        assert!(matches!(
            reader.read_header().await,
            Err(ProtocolError::ConnectionClosed)
        ));

        let result: Result<String, _> = client.call("Foo.Sum", 2u32, String::new()).await;
        assert!(matches!(result, Err(ClientError::Shutdown)));
    }

    #[tokio::test]
    async fn test_unknown_seq_is_discarded() {
        let (client, server_end) = client_pair(ClientConfig::new()).await;

        let _server = tokio::spawn(async move {
            let (mut reader, mut writer) = accept(server_end).await;
            let header = reader.read_header().await.unwrap();
            reader.discard_body().await.unwrap();

            let stray = Header::request("Foo.Sum", 999);
            writer.write_frame(&stray, "stray body").await.unwrap();
            writer.write_frame(&header, "real reply").await.unwrap();
            // Keep the stream open until the client is done.
            let _ = reader.read_header().await;
        });

        let reply: String = client.call("Foo.Sum", (), String::new()).await.unwrap();
        assert_eq!(reply, "real reply");
        assert!(client.is_available());
    }

    #[tokio::test]
    async fn test_reply_decode_failure_is_per_call() {
        let (client, server_end) = client_pair(ClientConfig::new().with_codec(JSON_TYPE)).await;

        let _server = tokio::spawn(async move {
            let (mut reader, mut writer) = accept(server_end).await;
            while let Ok(header) = reader.read_header().await {
                reader.discard_body().await.unwrap();
                if header.seq == 1 {
                    writer.write_frame(&header, "not a number").await.unwrap();
                } else {
                    writer.write_frame(&header, &42u64).await.unwrap();
                }
            }
        });

        let result: Result<u64, _> = client.call("Foo.Count", (), 0u64).await;
        assert!(matches!(result, Err(ClientError::Protocol(ProtocolError::Json(_)))));

        let value: u64 = client.call("Foo.Count", (), 0u64).await.unwrap();
        assert_eq!(value, 42);
        assert!(client.is_available());
    }

    #[tokio::test]
    async fn test_frames_are_written_contiguously() {
        const CALLERS: usize = 8;
        const ARG_LEN: usize = 32 * 1024;

        // A small pipe forces every frame write to be split into many chunks.
        let (client_end, mut server_end) = tokio::io::duplex(512);
        let client = Arc::new(
            Client::new(client_end, ClientConfig::new().with_codec(JSON_TYPE))
                .await
                .unwrap(),
        );

        let capture = tokio::spawn(async move {
            let mut raw = Vec::new();
            server_end.read_to_end(&mut raw).await.unwrap();
            raw
        });

        let (tx, _done) = completion_queue::<String, ()>(CALLERS);
        let mut senders = Vec::new();
        for i in 0..CALLERS {
            let client = client.clone();
            let tx = tx.clone();
            senders.push(tokio::spawn(async move {
                let fill = char::from(b'a' + i as u8);
                let args: String = std::iter::repeat(fill).take(ARG_LEN).collect();
                client.go_with("Blob.Put", args, (), tx).await;
            }));
        }
        for sender in senders {
            sender.await.unwrap();
        }
        client.close().await.unwrap();

        let raw = capture.await.unwrap();
        let newline = raw.iter().position(|&b| b == b'\n').unwrap();
        let mut buf = BytesMut::from(&raw[newline + 1..]);

        let mut seen = Vec::new();
        while let Some(frame) = RawFrame::decode(&mut buf).unwrap() {
            let header = frame.header(CodecType::Json).unwrap();
            let body: String = frame.body(CodecType::Json).unwrap();
            assert_eq!(body.len(), ARG_LEN);
            let first = body.chars().next().unwrap();
            assert!(body.chars().all(|c| c == first), "frame bytes interleaved");
            seen.push(header.seq);
        }
        assert!(buf.is_empty());
        seen.sort_unstable();
        assert_eq!(seen, (1..=CALLERS as u64).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_unknown_codec_fails_before_writing() {
        let (client_end, mut server_end) = tokio::io::duplex(1024);
        let config = ClientConfig::new().with_codec("application/xml");
        let result = Client::new(client_end, config).await;
        assert!(matches!(
            result,
            Err(ClientError::Protocol(ProtocolError::UnknownCodec(_)))
        ));

        let mut raw = Vec::new();
        server_end.read_to_end(&mut raw).await.unwrap();
        assert!(raw.is_empty());
    }

    #[tokio::test]
    async fn test_call_timeout_forgets_call() {
        let (client, server_end) =
            client_pair(ClientConfig::new().with_call_timeout(Duration::from_millis(50))).await;
        let (mut reader, mut writer) = accept(server_end).await;

        let result: Result<String, _> = client.call("Slow.Op", (), String::new()).await;
        assert!(matches!(result, Err(ClientError::Timeout)));
        assert_eq!(client.pending_count(), 0);

        // A late reply is discarded and the client keeps working.
        let header = reader.read_header().await.unwrap();
        reader.discard_body().await.unwrap();
        writer.write_frame(&header, "late").await.unwrap();

        let mut done = client.go("Fast.Op", (), String::new()).await;
        let header = reader.read_header().await.unwrap();
        reader.discard_body().await.unwrap();
        writer.write_frame(&header, "on time").await.unwrap();
        let call = done.recv().await.unwrap();
        assert_eq!(call.into_result().unwrap(), "on time");
    }

    #[tokio::test]
    async fn test_small_completion_queue_receives_every_call() {
        let (client, server_end) = client_pair(ClientConfig::new()).await;
        let _server = spawn_echo_server(server_end, None);

        let (tx, mut done) = completion_queue::<u32, String>(2);
        for i in 1..=5u32 {
            client.go_with("Foo.Sum", i, String::new(), tx.clone()).await;
        }
        drop(tx);

        // Responses are processed in order, so once this returns every
        // earlier call has been completed.
        let _: String = client.call("Foo.Sum", 6u32, String::new()).await.unwrap();
        assert_eq!(client.pending_count(), 0);

        let mut seqs = Vec::new();
        while let Some(call) = done.recv().await {
            assert_eq!(call.reply, format!("resp {}", call.seq));
            seqs.push(call.seq);
        }
        seqs.sort_unstable();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_close_interrupts_blocked_write() {
        // The peer reads the descriptor and then stops reading.
        let (client_end, server_end) = tokio::io::duplex(1024);
        let client = Arc::new(Client::new(client_end, ClientConfig::new()).await.unwrap());
        let (_reader, _writer) = accept(server_end).await;

        let mut first = client.go("Foo.Sum", 1u32, String::new()).await;
        let blocked = {
            let client = client.clone();
            tokio::spawn(async move {
                let args = vec![7u8; 64 * 1024];
                client.go("Blob.Put", args, ()).await
            })
        };
        while client.pending_count() < 2 {
            tokio::task::yield_now().await;
        }

        let closed = tokio::time::timeout(Duration::from_secs(2), client.close()).await;
        assert!(matches!(closed, Ok(Ok(()))));

        let call = first.recv().await.unwrap();
        assert!(matches!(call.error, Some(ClientError::Shutdown)));

        let mut second = blocked.await.unwrap();
        let call = second.recv().await.unwrap();
        assert_eq!(call.seq, 2);
        assert!(matches!(call.error, Some(ClientError::Shutdown)));
        assert_eq!(client.pending_count(), 0);
    }

    /// Delegates reads; fails every write once `broken` is set.
    struct BrokenWrites {
        inner: DuplexStream,
        broken: Arc<AtomicBool>,
    }

    impl tokio::io::AsyncRead for BrokenWrites {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl tokio::io::AsyncWrite for BrokenWrites {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.broken.load(Ordering::SeqCst) {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken")));
            }
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    #[tokio::test]
    async fn test_write_failure_completes_call_once() {
        let (client_end, server_end) = tokio::io::duplex(64 * 1024);
        let broken = Arc::new(AtomicBool::new(false));
        let stream = BrokenWrites {
            inner: client_end,
            broken: broken.clone(),
        };
        let client = Client::new(stream, ClientConfig::new()).await.unwrap();
        let (_reader, _writer) = accept(server_end).await;

        broken.store(true, Ordering::SeqCst);
        let mut done = client.go("Foo.Sum", 1u32, String::new()).await;
        let call = done.recv().await.unwrap();
        assert_eq!(call.seq, 1);
        match call.error {
            Some(ClientError::Protocol(ProtocolError::Io(ref e))) => {
                assert_eq!(e.kind(), io::ErrorKind::BrokenPipe)
            }
            ref other => panic!("unexpected error: {:?}", other),
        }
        assert!(done.try_recv().is_err(), "call completed more than once");
        assert_eq!(client.pending_count(), 0);

        // A failed write fails only that call.
        assert!(client.is_available());
    }

    #[tokio::test]
    async fn test_dial_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut read_half, _write_half) = stream.into_split();
            let mut byte = [0u8; 1];
            // Wait for the descriptor to arrive.
            read_half.read_exact(&mut byte).await.unwrap();
            byte[0]
        });

        let client = Client::dial(addr, ClientConfig::new()).await.unwrap();
        assert_eq!(client.codec(), CodecType::Bincode);
        assert!(client.is_available());
        assert_eq!(accept_task.await.unwrap(), b'{');
    }
}

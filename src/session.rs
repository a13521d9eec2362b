//! Session loop
//!
//! One session per accepted tunnel connection:
//! `HANDSHAKING -> ACTIVE -> CLOSED`. While active the loop decodes frames
//! and dispatches them: CONNECT dials the destination, DATA is written to the
//! channel's outbound connection, CLOSE tears the channel down. Every frame
//! going back to the client, whether a control reply or forwarded data, goes
//! through the session's single [`FrameWriter`].

use crate::channel::{Channel, ChannelTable};
use crate::config::ServerConfig;
use crate::crypto::Authenticator;
use crate::forwarder::Forwarder;
use crate::handshake;
use crate::proto::{Frame, FrameCodec, FrameType};
use crate::{Error, Result};
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::Mutex;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Handshaking,
    Active,
    Closed,
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How long teardown waits for the tunnel's write half to shut down
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Write half of a tunnel connection, shared by the session loop and every
/// forwarder. Each call writes one whole frame while holding the lock, so
/// frames never interleave on the wire.
///
/// Once [`close`](Self::close) is called, pending and future writes fail
/// instead of waiting on a peer that stopped reading.
#[derive(Clone)]
pub struct FrameWriter {
    inner: Arc<Mutex<BoxedWriter>>,
    closed: CancellationToken,
}

impl FrameWriter {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
            closed: CancellationToken::new(),
        }
    }

    /// Write one frame
    pub async fn send(&self, frame: &Frame) -> Result<()> {
        let bytes = frame.serialize()?;
        let mut writer = tokio::select! {
            _ = self.closed.cancelled() => return Err(writer_closed()),
            writer = self.inner.lock() => writer,
        };
        self.write_frame(&mut writer, &bytes).await
    }

    /// Write one frame on behalf of `channel`, unless the channel has been
    /// closed by the time the lock is held. Returns whether it was written.
    pub async fn send_for(&self, channel: &Channel, frame: &Frame) -> Result<bool> {
        let bytes = frame.serialize()?;
        let mut writer = tokio::select! {
            _ = self.closed.cancelled() => return Err(writer_closed()),
            _ = channel.stop_token().cancelled() => return Ok(false),
            writer = self.inner.lock() => writer,
        };
        if channel.is_closed() {
            return Ok(false);
        }
        self.write_frame(&mut writer, &bytes).await?;
        Ok(true)
    }

    // a started frame is only abandoned when the whole writer is closed,
    // never for a single channel, so the stream stays in sync
    async fn write_frame(&self, writer: &mut BoxedWriter, bytes: &[u8]) -> Result<()> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(writer_closed()),
            written = async {
                writer.write_all(bytes).await?;
                writer.flush().await
            } => Ok(written?),
        }
    }

    /// Fail every pending and future write
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Close, then shut the write half down, giving up after
    /// [`SHUTDOWN_GRACE`]
    pub async fn shutdown(&self) {
        self.close();
        let shutdown = async { self.inner.lock().await.shutdown().await };
        if tokio::time::timeout(SHUTDOWN_GRACE, shutdown).await.is_err() {
            debug!("Tunnel write half did not shut down in time");
        }
    }
}

fn writer_closed() -> Error {
    Error::Transport(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "tunnel writer closed",
    ))
}

/// Read half of a tunnel connection; buffers partial frames across reads
pub struct FrameReader<R> {
    reader: R,
    codec: FrameCodec,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// `leftover` holds bytes already read past the handshake
    pub fn new(reader: R, codec: FrameCodec, leftover: BytesMut) -> Self {
        Self {
            reader,
            codec,
            buf: leftover,
        }
    }

    /// Next complete frame, or `None` on a clean end of stream.
    ///
    /// Cancel safe: nothing is lost if the future is dropped mid-read.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buf)? {
                return Ok(Some(frame));
            }
            if self.reader.read_buf(&mut self.buf).await? == 0 {
                return Ok(self.codec.decode_eof(&mut self.buf)?);
            }
        }
    }
}

/// Channel state shared by a session's read loop, its forwarders and its
/// pending dials. Used by both ends of the tunnel.
pub struct Mux {
    table: Arc<ChannelTable>,
    writer: FrameWriter,
    shutdown: CancellationToken,
}

impl Mux {
    pub fn new(writer: FrameWriter, shutdown: CancellationToken) -> Self {
        Self {
            table: Arc::new(ChannelTable::new()),
            writer,
            shutdown,
        }
    }

    pub fn table(&self) -> &Arc<ChannelTable> {
        &self.table
    }

    pub fn writer(&self) -> &FrameWriter {
        &self.writer
    }

    /// Cancelled when the session ends
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Register `stream` as channel `id`.
    ///
    /// Returns `None` if `id` is already open; the stream is dropped.
    pub fn register(
        &self,
        id: u16,
        target: String,
        stream: TcpStream,
    ) -> Option<(Arc<Channel>, OwnedReadHalf)> {
        let (reader, writer) = stream.into_split();
        let channel = Arc::new(Channel::new(id, target, writer, self.shutdown.child_token()));
        self.table
            .insert(id, channel.clone())
            .then_some((channel, reader))
    }

    pub fn start_forwarder(&self, channel: Arc<Channel>, reader: OwnedReadHalf, notify_peer: bool) {
        Forwarder::new(channel, reader, self.table.clone(), self.writer.clone())
            .notify_peer(notify_peer)
            .spawn();
    }

    /// Hand a DATA payload to its channel; unknown channels drop it
    pub async fn deliver(&self, id: u16, payload: Bytes) {
        let Some(channel) = self.table.get(id) else {
            debug!("Dropping {} bytes for closed channel {}", payload.len(), id);
            return;
        };
        if let Err(e) = channel.write(&payload).await {
            debug!("Channel {} write failed: {}", id, e);
            if self.table.release(&channel) {
                channel.close().await;
            }
        }
    }

    /// Close channel `id` if it is open
    pub async fn close_channel(&self, id: u16) -> bool {
        match self.table.remove(id) {
            Some(channel) => {
                channel.close().await;
                debug!(
                    "Channel {} closed after {:?}",
                    id,
                    channel.created_at().elapsed()
                );
                true
            }
            None => false,
        }
    }

    /// Stop every forwarder and pending dial, close every channel
    pub async fn teardown(&self) {
        self.shutdown.cancel();
        // releases the write lock if a forwarder is stuck on a full tunnel
        self.writer.close();
        for channel in self.table.remove_all() {
            channel.close().await;
        }
        self.writer.shutdown().await;
    }
}

/// Dial a CONNECT destination
pub async fn dial(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let target = format!("{host}:{port}");
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Err(_) => Err(Error::DialTimeout(target)),
        Ok(Err(source)) => Err(Error::DialFailure { target, source }),
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
    }
}

/// Server side of one tunnel connection
pub struct Session {
    peer: SocketAddr,
    username: String,
    mux: Arc<Mux>,
    dial_timeout: Duration,
    log_destinations: bool,
    state: State,
}

impl Session {
    /// Run a session to completion over an accepted (TLS) stream.
    ///
    /// `shutdown` ends the session early when cancelled.
    pub async fn serve<S>(
        mut stream: S,
        peer: SocketAddr,
        config: &ServerConfig,
        authenticator: &dyn Authenticator,
        shutdown: CancellationToken,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let accepted = tokio::time::timeout(
            config.handshake_timeout(),
            handshake::accept(
                &mut stream,
                &config.hostname,
                &config.banner,
                authenticator,
                peer.ip(),
            ),
        )
        .await
        .map_err(|_| Error::HandshakeMismatch("handshake timed out".into()))??;

        info!("User {} authenticated from {}", accepted.username, peer);

        let (reader, writer) = tokio::io::split(stream);
        let frames = FrameReader::new(
            reader,
            FrameCodec::with_max_payload(config.max_frame_payload),
            accepted.leftover,
        );
        let mut session = Session {
            peer,
            log_destinations: config.log_users
                && authenticator.logging_enabled(&accepted.username),
            username: accepted.username,
            mux: Arc::new(Mux::new(FrameWriter::new(writer), shutdown)),
            dial_timeout: config.dial_timeout(),
            state: State::Handshaking,
        };

        session.run(frames).await
    }

    fn transition(&mut self, next: State) {
        trace!("Session {}: {:?} -> {:?}", self.peer, self.state, next);
        self.state = next;
    }

    async fn run<R: AsyncRead + Unpin>(&mut self, mut frames: FrameReader<R>) -> Result<()> {
        self.transition(State::Active);
        let shutdown = self.mux.shutdown_token().clone();

        let result = loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                frame = frames.next_frame() => frame,
            };
            let frame = match frame {
                Ok(Some(frame)) => frame,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };
            // a control reply can block on a peer that stopped reading
            let dispatched = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                dispatched = self.dispatch(frame) => dispatched,
            };
            if let Err(e) = dispatched {
                break Err(e);
            }
        };

        self.transition(State::Closed);
        let open = self.mux.table().len();
        self.mux.teardown().await;
        info!(
            "Session for {} from {} ended ({} channels torn down)",
            self.username, self.peer, open
        );
        result
    }

    async fn dispatch(&self, frame: Frame) -> Result<()> {
        let id = frame.channel_id;
        match frame.frame_type {
            FrameType::Connect => self.handle_connect(frame).await,
            FrameType::Data => {
                self.mux.deliver(id, frame.payload).await;
                Ok(())
            }
            FrameType::Close => {
                self.mux.close_channel(id).await;
                Ok(())
            }
            FrameType::ConnectOk | FrameType::ConnectFail => {
                debug!("Ignoring {:?} for channel {} from client", frame.frame_type, id);
                Ok(())
            }
            FrameType::Unknown(ty) => {
                trace!("Ignoring unknown frame type {:#04x} on channel {}", ty, id);
                Ok(())
            }
        }
    }

    /// Validate a CONNECT and dial it in the background so other channels
    /// keep flowing while the destination answers.
    async fn handle_connect(&self, frame: Frame) -> Result<()> {
        let id = frame.channel_id;
        let (host, port) = match frame.parse_connect() {
            Ok(dest) => dest,
            Err(e) => {
                debug!("Channel {}: bad CONNECT payload: {}", id, e);
                return self.mux.writer().send(&Frame::connect_fail(id)).await;
            }
        };

        if self.mux.table().contains(id) {
            warn!("{}", Error::DuplicateChannel(id));
            return self.mux.writer().send(&Frame::connect_fail(id)).await;
        }

        let target = format!("{host}:{port}");
        if self.log_destinations {
            info!("Channel {}: {} connecting to {}", id, self.username, target);
        } else {
            debug!("Channel {}: connecting", id);
        }

        let mux = self.mux.clone();
        let timeout = self.dial_timeout;
        tokio::spawn(async move {
            let dialed = tokio::select! {
                _ = mux.shutdown_token().cancelled() => return,
                dialed = dial(&host, port, timeout) => dialed,
            };
            open_channel(&mux, id, target, dialed).await;
        });
        Ok(())
    }
}

/// Finish a CONNECT: register the channel and answer the client
async fn open_channel(mux: &Mux, id: u16, target: String, dialed: Result<TcpStream>) {
    let stream = match dialed {
        Ok(stream) => stream,
        Err(e) => {
            info!("Channel {}: {}", id, e);
            let _ = mux.writer().send(&Frame::connect_fail(id)).await;
            return;
        }
    };

    let Some((channel, reader)) = mux.register(id, target, stream) else {
        warn!("{}", Error::DuplicateChannel(id));
        let _ = mux.writer().send(&Frame::connect_fail(id)).await;
        return;
    };

    // CONNECT_OK must precede the first DATA frame of the channel
    if let Err(e) = mux.writer().send(&Frame::connect_ok(id)).await {
        debug!("Channel {}: could not confirm: {}", id, e);
        if mux.table().release(&channel) {
            channel.close().await;
        }
        return;
    }
    mux.start_forwarder(channel, reader, false);
}

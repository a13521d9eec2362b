//! SMTP Mux Client
//!
//! Connects to a tunnel server, performs the client half of the disguise
//! handshake and opens channels on behalf of local TCP connections.

use crate::config::ClientConfig;
use crate::crypto::AuthToken;
use crate::handshake;
use crate::proto::{Frame, FrameCodec, FrameType};
use crate::session::{FrameReader, FrameWriter, Mux};
use crate::{Error, Result};
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// What the client presents during the handshake
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
    /// Name sent with EHLO
    pub client_name: String,
}

impl Credentials {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            username: config.username.clone(),
            secret: config.secret.clone(),
            client_name: config.client_name.clone(),
        }
    }

    fn token(&self) -> String {
        AuthToken::generate_now(&self.secret, &self.username)
    }
}

/// SMTP Mux Client
pub struct Client {
    config: ClientConfig,
    connector: TlsConnector,
}

impl Client {
    /// Create a client that trusts only `config.ca_cert`
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let ca_path = config
            .ca_cert
            .as_deref()
            .ok_or_else(|| Error::InvalidConfig("ca_cert is required".into()))?;

        let pem = std::fs::read(ca_path)?;
        let mut roots = rustls::RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            roots.add(cert?).map_err(|e| Error::Tls(e.to_string()))?;
        }
        if roots.is_empty() {
            return Err(Error::InvalidConfig(format!("no certificates in {ca_path}")));
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self::with_tls_config(config, Arc::new(tls_config)))
    }

    /// Create a client with a prepared rustls configuration
    pub fn with_tls_config(config: ClientConfig, tls_config: Arc<rustls::ClientConfig>) -> Self {
        Self {
            config,
            connector: TlsConnector::from(tls_config),
        }
    }

    /// Connect, handshake and start the tunnel
    pub async fn connect(&self) -> Result<Tunnel> {
        let addr = self.config.server_addr();
        let timeout = self.config.connect_timeout();
        info!("Connecting to {}...", addr);

        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::DialTimeout(addr.clone()))?
            .map_err(|source| Error::DialFailure {
                target: addr.clone(),
                source,
            })?;
        let _ = stream.set_nodelay(true);

        let server_name = ServerName::try_from(self.config.server_host.clone())
            .map_err(|e| Error::Tls(e.to_string()))?;
        let tls = tokio::time::timeout(timeout, self.connector.connect(server_name, stream))
            .await
            .map_err(|_| Error::Tls("TLS handshake timed out".into()))?
            .map_err(|e| Error::Tls(e.to_string()))?;
        debug!("TLS established with {}", addr);

        let credentials = Credentials::from_config(&self.config);
        tokio::time::timeout(timeout, Tunnel::establish(tls, &credentials, timeout))
            .await
            .map_err(|_| Error::HandshakeMismatch("handshake timed out".into()))?
    }
}

/// A CONNECT the client is still expecting an answer for
enum Pending {
    /// `open()` waits for CONNECT_OK (`true`) or CONNECT_FAIL (`false`)
    Waiting(oneshot::Sender<bool>),
    /// `open()` gave up; the id stays reserved until the server answers
    Abandoned,
}

/// State shared between a tunnel handle and its read loop
struct Shared {
    mux: Mux,
    pending: Mutex<HashMap<u16, Pending>>,
    next_id: Mutex<u16>,
}

impl Shared {
    fn new(mux: Mux) -> Self {
        Self {
            mux,
            pending: Mutex::new(HashMap::new()),
            next_id: Mutex::new(1),
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u16, Pending>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pick an id that is neither open nor awaiting an answer and mark it
    /// pending
    fn allocate(&self) -> Result<(u16, oneshot::Receiver<bool>)> {
        let mut pending = self.pending();
        let mut next = self.next_id.lock().unwrap_or_else(|e| e.into_inner());

        for _ in 0..=u16::MAX {
            let id = *next;
            *next = next.wrapping_add(1);
            if pending.contains_key(&id) || self.mux.table().contains(id) {
                continue;
            }
            let (tx, rx) = oneshot::channel();
            pending.insert(id, Pending::Waiting(tx));
            return Ok((id, rx));
        }
        Err(Error::Transport(io::Error::new(
            io::ErrorKind::AddrInUse,
            "no free channel id",
        )))
    }

    /// Deliver a CONNECT answer; `false` if nobody is waiting for it.
    /// Either way the id is free again afterwards.
    fn answer(&self, id: u16, ok: bool) -> bool {
        match self.pending().remove(&id) {
            Some(Pending::Waiting(tx)) => tx.send(ok).is_ok(),
            Some(Pending::Abandoned) | None => false,
        }
    }

    /// Keep the id of a timed-out CONNECT reserved until its answer arrives
    fn abandon(&self, id: u16) {
        if let Some(entry) = self.pending().get_mut(&id) {
            *entry = Pending::Abandoned;
        }
    }

    /// Release an id whose CONNECT never reached the server
    fn forget(&self, id: u16) {
        self.pending().remove(&id);
    }
}

/// An established tunnel. Dropping it ends the session.
pub struct Tunnel {
    shared: Arc<Shared>,
    connect_timeout: Duration,
}

impl Tunnel {
    /// Run the client handshake over `stream` and start the read loop
    pub async fn establish<S>(
        mut stream: S,
        credentials: &Credentials,
        connect_timeout: Duration,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let leftover =
            handshake::connect(&mut stream, &credentials.client_name, &credentials.token()).await?;
        info!("Authenticated as {}, tunnel active", credentials.username);

        let (reader, writer) = tokio::io::split(stream);
        let frames = FrameReader::new(reader, FrameCodec::new(), leftover);
        let mux = Mux::new(FrameWriter::new(writer), CancellationToken::new());
        let shared = Arc::new(Shared::new(mux));

        tokio::spawn(read_loop(shared.clone(), frames));

        Ok(Self {
            shared,
            connect_timeout,
        })
    }

    /// Open a channel to `host:port` carrying `local`.
    ///
    /// Resolves once the server answers. On success the local connection is
    /// relayed until either side closes it.
    pub async fn open(&self, host: &str, port: u16, local: TcpStream) -> Result<u16> {
        let mux = &self.shared.mux;
        if mux.shutdown_token().is_cancelled() {
            return Err(tunnel_closed());
        }

        let (id, answer) = self.shared.allocate()?;
        let target = format!("{host}:{port}");

        let frame = match Frame::connect(id, host, port) {
            Ok(frame) => frame,
            Err(e) => {
                self.shared.forget(id);
                return Err(e.into());
            }
        };

        // registered before CONNECT so DATA right after CONNECT_OK has a home
        let local_name = local
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| target.clone());
        let Some((channel, reader)) = mux.register(id, local_name, local) else {
            self.shared.forget(id);
            return Err(Error::DuplicateChannel(id));
        };

        if let Err(e) = mux.writer().send(&frame).await {
            self.shared.forget(id);
            mux.close_channel(id).await;
            return Err(e);
        }
        debug!("Channel {}: CONNECT {}", id, target);

        match tokio::time::timeout(self.connect_timeout, answer).await {
            Ok(Ok(true)) => {
                info!("Channel {}: open to {}", id, target);
                mux.start_forwarder(channel, reader, true);
                Ok(id)
            }
            Ok(Ok(false)) => {
                mux.close_channel(id).await;
                Err(Error::ConnectRejected(id))
            }
            Ok(Err(_)) => Err(tunnel_closed()),
            Err(_) => {
                self.shared.abandon(id);
                mux.close_channel(id).await;
                Err(Error::DialTimeout(target))
            }
        }
    }

    /// Close channel `id` on both ends
    pub async fn close(&self, id: u16) -> Result<()> {
        let mux = &self.shared.mux;
        // closed locally first so its forwarder cannot send after CLOSE
        if !mux.close_channel(id).await {
            return Err(Error::ChannelNotFound(id));
        }
        mux.writer().send(&Frame::close(id)).await
    }

    /// Number of open channels
    pub fn active_channels(&self) -> usize {
        self.shared.mux.table().len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.mux.shutdown_token().is_cancelled()
    }

    /// Resolves when the session has ended
    pub async fn closed(&self) {
        self.shared.mux.shutdown_token().cancelled().await
    }

    /// End the session, closing every channel
    pub async fn shutdown(&self) {
        self.shared.mux.teardown().await;
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.shared.mux.shutdown_token().cancel();
    }
}

fn tunnel_closed() -> Error {
    Error::Transport(io::Error::new(
        io::ErrorKind::NotConnected,
        "tunnel closed",
    ))
}

async fn read_loop<R: AsyncRead + Unpin>(shared: Arc<Shared>, mut frames: FrameReader<R>) {
    let shutdown = shared.mux.shutdown_token().clone();

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
        let dispatched = tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            dispatched = dispatch(&shared, frame) => dispatched,
        };
        if let Err(e) = dispatched {
            break Err(e);
        }
    };

    match result {
        Ok(()) => info!("Tunnel closed"),
        Err(e) => warn!("Tunnel failed: {}", e),
    }
    // waiting open() calls see their sender dropped
    shared.pending().clear();
    shared.mux.teardown().await;
}

async fn dispatch(shared: &Shared, frame: Frame) -> Result<()> {
    let id = frame.channel_id;
    let mux = &shared.mux;
    match frame.frame_type {
        FrameType::Data => {
            mux.deliver(id, frame.payload).await;
            Ok(())
        }
        FrameType::Close => {
            if mux.close_channel(id).await {
                debug!("Channel {}: closed by server", id);
            }
            Ok(())
        }
        FrameType::ConnectOk => {
            if !shared.answer(id, true) {
                // nobody is waiting any more, so the server end is an orphan
                debug!("Channel {}: late CONNECT_OK, closing", id);
                mux.close_channel(id).await;
                mux.writer().send(&Frame::close(id)).await?;
            }
            Ok(())
        }
        FrameType::ConnectFail => {
            if !shared.answer(id, false) {
                debug!("Channel {}: late CONNECT_FAIL", id);
                mux.close_channel(id).await;
            }
            Ok(())
        }
        FrameType::Connect => {
            debug!("Refusing server-initiated CONNECT on channel {}", id);
            mux.writer().send(&Frame::connect_fail(id)).await
        }
        FrameType::Unknown(ty) => {
            trace!("Ignoring unknown frame type {:#04x} on channel {}", ty, id);
            Ok(())
        }
    }
}

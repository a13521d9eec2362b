//! SMTP Mux Server
//!
//! Accepts TLS connections, runs the disguise handshake and hands each
//! authenticated connection to a session loop.

use crate::config::{ServerConfig, UsersConfig};
use crate::crypto::Authenticator;
use crate::session::Session;
use crate::{Error, Result};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

/// Reloadable user database
#[derive(Debug, Default)]
pub struct Users {
    inner: RwLock<UsersConfig>,
}

impl Users {
    pub fn new(users: UsersConfig) -> Self {
        Self {
            inner: RwLock::new(users),
        }
    }

    pub fn replace(&self, users: UsersConfig) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = users;
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Authenticator for Users {
    fn authenticate(&self, token: &str, peer: IpAddr) -> Option<String> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .authenticate(token, peer)
    }

    fn logging_enabled(&self, username: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .logging_enabled(username)
    }
}

/// Server state
#[derive(Clone)]
pub struct Server {
    config: Arc<ServerConfig>,
    users: Arc<Users>,
    tls_acceptor: TlsAcceptor,
    shutdown: CancellationToken,
}

impl Server {
    /// Create a new server, loading the certificate and key named in `config`
    pub fn new(config: ServerConfig, users: UsersConfig) -> Result<Self> {
        config.validate()?;
        let tls_config = load_tls_config(&config.cert_file, &config.key_file)?;
        Ok(Self::from_parts(config, users, Arc::new(tls_config)))
    }

    /// Create a server with a prepared rustls configuration
    pub fn from_parts(
        config: ServerConfig,
        users: UsersConfig,
        tls_config: Arc<rustls::ServerConfig>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            users: Arc::new(Users::new(users)),
            tls_acceptor: TlsAcceptor::from(tls_config),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Reload users from the configured users file
    pub fn reload_users(&self) -> anyhow::Result<()> {
        let users = UsersConfig::from_file(&self.config.users_file)?;
        let count = users.users.len();
        self.users.replace(users);
        info!("Reloaded users configuration ({} users)", count);
        Ok(())
    }

    /// Bind the configured address and serve until shut down
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.bind_addr()?;
        let listener = TcpListener::bind(&addr).await?;
        self.run_on(listener).await?;
        Ok(())
    }

    /// Serve connections from an already bound listener
    pub async fn run_on(&self, listener: TcpListener) -> Result<()> {
        info!("SMTP Mux Server listening on {}", listener.local_addr()?);
        info!("Hostname: {}", self.config.hostname);

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let (stream, addr) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    // usually fd exhaustion, back off instead of spinning
                    error!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            trace!("Connection from {}", addr);

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_client(stream, addr).await {
                    debug!("Client error from {}: {}", addr, e);
                }
            });
        }

        info!("Server stopped");
        Ok(())
    }

    /// Stop accepting and end every running session
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Handle a client connection
    async fn handle_client(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let _ = stream.set_nodelay(true);

        let tls_stream = tokio::time::timeout(
            self.config.handshake_timeout(),
            self.tls_acceptor.accept(stream),
        )
        .await
        .map_err(|_| Error::Tls("TLS handshake timed out".into()))?
        .map_err(|e| Error::Tls(e.to_string()))?;
        debug!("TLS established with {}", addr);

        Session::serve(
            tls_stream,
            addr,
            &self.config,
            self.users.as_ref(),
            self.shutdown.child_token(),
        )
        .await
    }
}

/// Build a rustls server configuration from PEM files
pub fn load_tls_config(
    cert_file: impl AsRef<Path>,
    key_file: impl AsRef<Path>,
) -> Result<rustls::ServerConfig> {
    let cert_pem = std::fs::read(cert_file)?;
    let key_pem = std::fs::read(key_file)?;

    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_pem.as_slice()).collect::<std::io::Result<_>>()?;
    if certs.is_empty() {
        return Err(Error::Tls("no certificate found".into()));
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_slice())?
        .ok_or_else(|| Error::Tls("no private key found".into()))?;

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(e.to_string()))
}

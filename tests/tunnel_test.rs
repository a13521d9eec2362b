//! End-to-end tests: local application -> Tunnel -> Session -> destination

use smtp_mux::session::Session;
use smtp_mux::{
    Client, ClientConfig, Credentials, Error, Server, ServerConfig, Tunnel, UserEntry, UsersConfig,
};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

const SECRET: &str = "correct horse battery staple";

fn users() -> UsersConfig {
    UsersConfig {
        users: HashMap::from([(
            "alice".to_string(),
            UserEntry {
                secret: SECRET.to_string(),
                whitelist: vec!["127.0.0.0/8".to_string()],
                logging: true,
            },
        )]),
    }
}

fn credentials(secret: &str) -> Credentials {
    Credentials {
        username: "alice".into(),
        secret: secret.into(),
        client_name: "laptop.local".into(),
    }
}

/// A connected loopback pair standing in for a local application
async fn app_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (app, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (accepted.unwrap().0, app.unwrap())
}

async fn echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    port
}

async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Tunnel connected to a session over an in-memory stream
async fn in_memory_tunnel(secret: &str) -> smtp_mux::Result<Tunnel> {
    let (client, server) = duplex(256 * 1024);
    tokio::spawn(async move {
        let config = ServerConfig::default();
        let users = users();
        let peer = "127.0.0.1:50000".parse().unwrap();
        let _ = Session::serve(server, peer, &config, &users, CancellationToken::new()).await;
    });
    Tunnel::establish(client, &credentials(secret), Duration::from_secs(5)).await
}

async fn roundtrip(app: &mut TcpStream, message: &[u8]) -> Vec<u8> {
    let mut echoed = vec![0u8; message.len()];
    let (mut reader, mut writer) = app.split();
    let (written, read) = tokio::time::timeout(
        Duration::from_secs(5),
        async { tokio::join!(writer.write_all(message), reader.read_exact(&mut echoed)) },
    )
    .await
    .expect("timed out waiting for echo");
    written.unwrap();
    read.unwrap();
    echoed
}

#[tokio::test]
async fn test_echo_over_several_channels() {
    let port = echo_server().await;
    let tunnel = in_memory_tunnel(SECRET).await.unwrap();

    let mut apps = Vec::new();
    let mut ids = Vec::new();
    for _ in 0..3 {
        let (local, app) = app_pair().await;
        ids.push(tunnel.open("127.0.0.1", port, local).await.unwrap());
        apps.push(app);
    }
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 3);
    assert_eq!(tunnel.active_channels(), 3);

    for (i, app) in apps.iter_mut().enumerate() {
        let message = format!("hello from channel {i}").into_bytes();
        assert_eq!(roundtrip(app, &message).await, message);
    }

    // larger than one frame payload
    let big: Vec<u8> = (0..200_000u32).map(|n| (n % 251) as u8).collect();
    assert_eq!(roundtrip(&mut apps[1], &big).await, big);
}

#[tokio::test]
async fn test_unreachable_destination_is_rejected() {
    let port = unused_port().await;
    let tunnel = in_memory_tunnel(SECRET).await.unwrap();

    let (local, _app) = app_pair().await;
    let result = tunnel.open("127.0.0.1", port, local).await;
    assert!(matches!(result, Err(Error::ConnectRejected(_))));
    assert_eq!(tunnel.active_channels(), 0);

    // the tunnel is still usable
    let echo = echo_server().await;
    let (local, mut app) = app_pair().await;
    tunnel.open("127.0.0.1", echo, local).await.unwrap();
    assert_eq!(roundtrip(&mut app, b"still alive").await, b"still alive");
}

#[tokio::test]
async fn test_close_reaches_destination_and_app() {
    let destination = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = destination.local_addr().unwrap().port();
    let tunnel = in_memory_tunnel(SECRET).await.unwrap();

    let (local, mut app) = app_pair().await;
    let id = tunnel.open("127.0.0.1", port, local).await.unwrap();
    let (mut remote, _) = destination.accept().await.unwrap();

    tunnel.close(id).await.unwrap();

    let mut rest = Vec::new();
    remote.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
    app.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
    assert_eq!(tunnel.active_channels(), 0);
}

#[tokio::test]
async fn test_app_hangup_closes_destination() {
    let destination = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = destination.local_addr().unwrap().port();
    let tunnel = in_memory_tunnel(SECRET).await.unwrap();

    let (local, app) = app_pair().await;
    tunnel.open("127.0.0.1", port, local).await.unwrap();
    let (mut remote, _) = destination.accept().await.unwrap();

    drop(app);
    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), remote.read_to_end(&mut rest))
        .await
        .expect("destination was not closed")
        .unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_wrong_secret_fails_handshake() {
    let result = in_memory_tunnel("not the secret").await;
    assert!(matches!(result, Err(Error::AuthFailed)));
}

#[tokio::test]
async fn test_shutdown_closes_local_connections() {
    let port = echo_server().await;
    let tunnel = in_memory_tunnel(SECRET).await.unwrap();

    let (local, mut app) = app_pair().await;
    tunnel.open("127.0.0.1", port, local).await.unwrap();

    tunnel.shutdown().await;
    assert!(tunnel.is_closed());

    let mut rest = Vec::new();
    app.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

fn write_certificate(dir: &Path, name: &str) -> (String, String) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_path = dir.join(format!("{name}.crt"));
    let key_path = dir.join(format!("{name}.key"));
    std::fs::write(&cert_path, cert.serialize_pem().unwrap()).unwrap();
    std::fs::write(&key_path, cert.serialize_private_key_pem()).unwrap();
    (
        cert_path.display().to_string(),
        key_path.display().to_string(),
    )
}

async fn start_tls_server(cert_file: String, key_file: String) -> (Server, u16) {
    let config = ServerConfig {
        host: "127.0.0.1".into(),
        hostname: "mx.example.net".into(),
        cert_file,
        key_file,
        ..ServerConfig::default()
    };
    let server = Server::new(config, users()).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let running = server.clone();
    tokio::spawn(async move { running.run_on(listener).await });
    (server, port)
}

fn client_config(port: u16, ca_cert: String) -> ClientConfig {
    ClientConfig {
        server_host: "localhost".into(),
        server_port: port,
        username: "alice".into(),
        secret: SECRET.into(),
        ca_cert: Some(ca_cert),
        connect_timeout_secs: 5,
        ..ClientConfig::default()
    }
}

#[tokio::test]
async fn test_tls_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let (cert, key) = write_certificate(dir.path(), "server");
    let (server, port) = start_tls_server(cert.clone(), key).await;
    let echo = echo_server().await;

    let client = Client::new(client_config(port, cert)).unwrap();
    let tunnel = client.connect().await.unwrap();

    let (local, mut app) = app_pair().await;
    tunnel.open("127.0.0.1", echo, local).await.unwrap();
    assert_eq!(roundtrip(&mut app, b"over tls").await, b"over tls");

    // stopping the server ends the session
    server.shutdown();
    tokio::time::timeout(Duration::from_secs(5), tunnel.closed())
        .await
        .expect("tunnel outlived the server");
}

#[tokio::test]
async fn test_untrusted_certificate_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let (cert, key) = write_certificate(dir.path(), "server");
    let (other_cert, _) = write_certificate(dir.path(), "other");
    let (_server, port) = start_tls_server(cert, key).await;

    let client = Client::new(client_config(port, other_cert)).unwrap();
    assert!(matches!(client.connect().await, Err(Error::Tls(_))));
}

#[test]
fn test_client_requires_ca_cert() {
    let config = ClientConfig {
        ca_cert: None,
        ..client_config(587, String::new())
    };
    assert!(matches!(Client::new(config), Err(Error::InvalidConfig(_))));
}

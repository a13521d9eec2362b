//! Disguise handshake
//!
//! The first bytes of every tunnel connection look like an ESMTP submission
//! dialogue: greeting, EHLO, capability list, STARTTLS, then AUTH PLAIN. The
//! connection is already TLS from the listener, so STARTTLS only gets its
//! "ready" reply. After the `235` reply both sides switch to binary frames.
//!
//! Any bytes the peer pipelined after its last handshake line are returned to
//! the caller so the frame decoder starts with them.

use crate::crypto::Authenticator;
use crate::proto::smtp::{self, Command, Response, ResponseCode};
use crate::{Error, Result};
use bytes::{Buf, BytesMut};
use std::net::IpAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{trace, warn};

/// Longest handshake line either side accepts, CRLF excluded
pub const MAX_LINE_LEN: usize = 1024;

/// Result of a successful server-side handshake
#[derive(Debug)]
pub struct Accepted {
    pub username: String,
    /// Bytes received after the AUTH line
    pub leftover: BytesMut,
}

/// Server half: greeting, EHLO, STARTTLS, AUTH
pub async fn accept<S>(
    stream: &mut S,
    hostname: &str,
    banner: &str,
    authenticator: &dyn Authenticator,
    peer: IpAddr,
) -> Result<Accepted>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);

    send(stream, &Response::greeting(hostname, banner)).await?;

    expect_command(stream, &mut buf, Command::Ehlo).await?;
    send(stream, &Response::ehlo(hostname)).await?;

    expect_command(stream, &mut buf, Command::StartTls).await?;
    send(stream, &Response::starttls()).await?;

    let arg = expect_command(stream, &mut buf, Command::Auth).await?;
    let token = match arg.split_once(' ') {
        Some((mechanism, token)) if mechanism.eq_ignore_ascii_case("PLAIN") => token.trim(),
        _ => "",
    };

    match authenticator.authenticate(token, peer) {
        Some(username) => {
            send(stream, &Response::auth_success()).await?;
            Ok(Accepted {
                username,
                leftover: buf,
            })
        }
        None => {
            warn!("Authentication failed from {}", peer);
            send(stream, &Response::auth_failed()).await?;
            Err(Error::AuthFailed)
        }
    }
}

/// Client half; returns bytes the server sent after its `235` reply
pub async fn connect<S>(stream: &mut S, client_name: &str, token: &str) -> Result<BytesMut>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);

    expect_reply(stream, &mut buf, ResponseCode::READY).await?;

    send(stream, &format!("EHLO {client_name}\r\n")).await?;
    expect_reply(stream, &mut buf, ResponseCode::OK).await?;

    send(stream, "STARTTLS\r\n").await?;
    expect_reply(stream, &mut buf, ResponseCode::READY).await?;

    send(stream, &format!("AUTH PLAIN {token}\r\n")).await?;
    let code = read_reply(stream, &mut buf).await?;
    if code == ResponseCode::AUTH_FAILED {
        return Err(Error::AuthFailed);
    }
    if code != ResponseCode::AUTH_SUCCESS {
        return Err(Error::HandshakeMismatch(format!(
            "expected {} after AUTH, got {code}",
            ResponseCode::AUTH_SUCCESS
        )));
    }

    Ok(buf)
}

async fn send<S: AsyncWrite + Unpin>(stream: &mut S, text: &str) -> Result<()> {
    stream.write_all(text.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one command line and insist on `expected`; returns its argument
async fn expect_command<S>(stream: &mut S, buf: &mut BytesMut, expected: Command) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let line = read_line(stream, buf).await?;
    trace!("handshake <- {}", line);

    match smtp::parse_line(&line) {
        Some((cmd, arg)) if cmd == expected => Ok(arg),
        Some((Command::Quit, _)) => {
            // a polite goodbye is what a real MTA would do
            send(stream, &Response::goodbye()).await?;
            Err(Error::HandshakeMismatch("client sent QUIT".into()))
        }
        _ => Err(Error::HandshakeMismatch(format!(
            "expected {expected:?}, got {line:?}"
        ))),
    }
}

/// Read a (possibly multi-line) reply and insist on `expected`
async fn expect_reply<S>(stream: &mut S, buf: &mut BytesMut, expected: ResponseCode) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let code = read_reply(stream, buf).await?;
    if code != expected {
        return Err(Error::HandshakeMismatch(format!(
            "expected {expected}, got {code}"
        )));
    }
    Ok(())
}

async fn read_reply<S>(stream: &mut S, buf: &mut BytesMut) -> Result<ResponseCode>
where
    S: AsyncRead + Unpin,
{
    loop {
        let line = read_line(stream, buf).await?;
        trace!("handshake <- {}", line);

        let reply = smtp::parse_reply(&line)
            .ok_or_else(|| Error::HandshakeMismatch(format!("not an SMTP reply: {line:?}")))?;
        if reply.last {
            return Ok(reply.code);
        }
    }
}

/// Read one LF-terminated line (a preceding CR is stripped)
async fn read_line<S>(stream: &mut S, buf: &mut BytesMut) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let mut line = buf.split_to(pos);
            buf.advance(1);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            if line.len() > MAX_LINE_LEN {
                return Err(Error::HandshakeMismatch("line too long".into()));
            }
            return Ok(String::from_utf8_lossy(&line).into_owned());
        }

        if buf.len() > MAX_LINE_LEN + 1 {
            return Err(Error::HandshakeMismatch("line too long".into()));
        }

        if stream.read_buf(buf).await? == 0 {
            return Err(Error::HandshakeMismatch(
                "connection closed during handshake".into(),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::AuthToken;
    use tokio::io::{duplex, AsyncBufReadExt, BufReader};

    struct OnlyAlice;

    impl Authenticator for OnlyAlice {
        fn authenticate(&self, token: &str, _peer: IpAddr) -> Option<String> {
            AuthToken::verify(token, "s3cret", 300)
        }
    }

    fn localhost() -> IpAddr {
        IpAddr::from([127, 0, 0, 1])
    }

    #[tokio::test]
    async fn test_full_exchange() {
        let (mut client, mut server) = duplex(4096);
        let token = AuthToken::generate_now("s3cret", "alice");

        let server_side = tokio::spawn(async move {
            accept(&mut server, "mx.test", "Postfix", &OnlyAlice, localhost()).await
        });

        let leftover = connect(&mut client, "laptop", &token).await.unwrap();
        assert!(leftover.is_empty());

        let accepted = server_side.await.unwrap().unwrap();
        assert_eq!(accepted.username, "alice");
        assert!(accepted.leftover.is_empty());
    }

    #[tokio::test]
    async fn test_server_transcript() {
        let (client, mut server) = duplex(4096);
        let token = AuthToken::generate_now("s3cret", "alice");

        let server_side = tokio::spawn(async move {
            accept(&mut server, "mx.test", "Postfix", &OnlyAlice, localhost()).await
        });

        let (read, mut write) = tokio::io::split(client);
        let mut lines = BufReader::new(read).lines();

        assert_eq!(lines.next_line().await.unwrap().unwrap(), "220 mx.test ESMTP Postfix");
        write.write_all(b"EHLO laptop\r\n").await.unwrap();
        for expected in ["250-mx.test", "250-STARTTLS", "250-AUTH PLAIN LOGIN", "250 8BITMIME"] {
            assert_eq!(lines.next_line().await.unwrap().unwrap(), expected);
        }
        write.write_all(b"STARTTLS\r\n").await.unwrap();
        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            "220 2.0.0 Ready to start TLS"
        );

        // AUTH line and the first frame in a single write
        let mut pipelined = format!("AUTH PLAIN {token}\r\n").into_bytes();
        pipelined.extend_from_slice(&[0x05, 0x00, 0x01, 0x00, 0x00]);
        write.write_all(&pipelined).await.unwrap();

        assert!(lines.next_line().await.unwrap().unwrap().starts_with("235 "));
        let accepted = server_side.await.unwrap().unwrap();
        assert_eq!(&accepted.leftover[..], &[0x05, 0x00, 0x01, 0x00, 0x00]);
    }

    #[tokio::test]
    async fn test_missing_ehlo_is_mismatch() {
        let (mut client, mut server) = duplex(4096);

        let server_side = tokio::spawn(async move {
            accept(&mut server, "mx.test", "Postfix", &OnlyAlice, localhost()).await
        });

        let mut greeting = [0u8; 64];
        let _ = client.read(&mut greeting).await.unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

        let err = server_side.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::HandshakeMismatch(_)));

        // nothing after the greeting
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_eof_is_mismatch() {
        let (client, mut server) = duplex(4096);
        drop(client);

        let err = accept(&mut server, "mx.test", "Postfix", &OnlyAlice, localhost())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HandshakeMismatch(_) | Error::Transport(_)));
    }

    #[tokio::test]
    async fn test_bad_token_fails_both_sides() {
        let (mut client, mut server) = duplex(4096);
        let token = AuthToken::generate_now("wrong", "alice");

        let server_side = tokio::spawn(async move {
            accept(&mut server, "mx.test", "Postfix", &OnlyAlice, localhost()).await
        });

        let err = connect(&mut client, "laptop", &token).await.unwrap_err();
        assert!(matches!(err, Error::AuthFailed));
        assert!(matches!(server_side.await.unwrap(), Err(Error::AuthFailed)));
    }

    #[tokio::test]
    async fn test_overlong_line() {
        let (mut client, mut server) = duplex(8192);

        let server_side = tokio::spawn(async move {
            accept(&mut server, "mx.test", "Postfix", &OnlyAlice, localhost()).await
        });

        client.write_all(&vec![b'A'; MAX_LINE_LEN + 10]).await.unwrap();
        let err = server_side.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::HandshakeMismatch(_)));
    }
}

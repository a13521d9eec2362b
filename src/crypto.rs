//! Authentication tokens and the authentication hook used by the handshake

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Type alias for HMAC-SHA256
type HmacSha256 = Hmac<Sha256>;

/// Tokens older than this are refused (5 minutes)
pub const TOKEN_MAX_AGE_SECS: u64 = 300;

/// Decides whether a handshake's `AUTH PLAIN` token may open a session.
///
/// Called once per connection, after the disguise exchange and before any
/// frame is read. Returns the authenticated user name.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str, peer: IpAddr) -> Option<String>;

    /// Whether channel destinations opened by `username` may be logged
    fn logging_enabled(&self, _username: &str) -> bool {
        true
    }
}

/// Authentication token manager
pub struct AuthToken;

impl AuthToken {
    fn mac(secret: &str, username: &str, timestamp: u64) -> HmacSha256 {
        let message = format!("smtp-tunnel-auth:{username}:{timestamp}");
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
        mac.update(message.as_bytes());
        mac
    }

    /// Generate an authentication token
    /// Format: base64(username:timestamp:base64(hmac))
    pub fn generate(secret: &str, username: &str, timestamp: u64) -> String {
        let hmac_b64 = BASE64.encode(Self::mac(secret, username, timestamp).finalize().into_bytes());
        BASE64.encode(format!("{username}:{timestamp}:{hmac_b64}").as_bytes())
    }

    /// Generate with current timestamp
    pub fn generate_now(secret: &str, username: &str) -> String {
        Self::generate(secret, username, unix_now())
    }

    /// Split a token into (username, timestamp, hmac) if it is fresh
    fn unpack(token_b64: &str, max_age_secs: u64) -> Option<(String, u64, Vec<u8>)> {
        let decoded = String::from_utf8(BASE64.decode(token_b64.as_bytes()).ok()?).ok()?;

        let mut parts = decoded.splitn(3, ':');
        let username = parts.next()?.to_string();
        let timestamp: u64 = parts.next()?.parse().ok()?;
        let signature = BASE64.decode(parts.next()?.as_bytes()).ok()?;

        if username.is_empty() || unix_now().saturating_sub(timestamp) > max_age_secs {
            return None;
        }
        Some((username, timestamp, signature))
    }

    /// Verify an authentication token against one secret
    /// Returns the username if valid
    pub fn verify(token_b64: &str, secret: &str, max_age_secs: u64) -> Option<String> {
        let (username, timestamp, signature) = Self::unpack(token_b64, max_age_secs)?;
        Self::mac(secret, &username, timestamp)
            .verify_slice(&signature)
            .ok()
            .map(|()| username)
    }

    /// Verify against multiple users
    pub fn verify_multi_user(
        token_b64: &str,
        users: &HashMap<String, String>,
        max_age_secs: u64,
    ) -> Option<String> {
        let (username, timestamp, signature) = Self::unpack(token_b64, max_age_secs)?;
        let secret = users.get(&username)?;
        Self::mac(secret, &username, timestamp)
            .verify_slice(&signature)
            .ok()
            .map(|()| username)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

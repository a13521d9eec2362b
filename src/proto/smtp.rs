//! SMTP vocabulary for the disguise handshake
use std::fmt;

/// SMTP response codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseCode(pub u16);

impl ResponseCode {
    pub const READY: Self = Self(220);
    pub const CLOSING: Self = Self(221);
    pub const AUTH_SUCCESS: Self = Self(235);
    pub const OK: Self = Self(250);
    pub const AUTH_FAILED: Self = Self(535);
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SMTP commands the handshake understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Ehlo,
    StartTls,
    Auth,
    Quit,
    Unknown,
}

impl Command {
    pub fn parse(s: &str) -> (Self, &str) {
        let s = s.trim();
        let (cmd, rest) = s.split_once(' ').unwrap_or((s, ""));

        let command = match cmd.to_ascii_uppercase().as_str() {
            "EHLO" => Self::Ehlo,
            "STARTTLS" => Self::StartTls,
            "AUTH" => Self::Auth,
            "QUIT" => Self::Quit,
            _ => Self::Unknown,
        };

        (command, rest.trim())
    }
}

/// SMTP response builder
pub struct Response;

impl Response {
    /// Create a simple response
    pub fn new(code: ResponseCode, message: &str) -> String {
        format!("{} {}\r\n", code, message)
    }

    /// Create a multi-line response (last line has space after code)
    pub fn multi_line(code: ResponseCode, lines: &[&str]) -> String {
        match lines {
            [] => Self::new(code, ""),
            [only] => Self::new(code, only),
            [init @ .., last] => {
                let mut result = String::new();
                for line in init {
                    result.push_str(&format!("{code}-{line}\r\n"));
                }
                result.push_str(&format!("{code} {last}\r\n"));
                result
            }
        }
    }

    /// Greeting response
    pub fn greeting(hostname: &str, banner: &str) -> String {
        Self::new(ResponseCode::READY, &format!("{hostname} ESMTP {banner}"))
    }

    /// EHLO response; STARTTLS and AUTH are advertised for show only
    pub fn ehlo(hostname: &str) -> String {
        Self::multi_line(
            ResponseCode::OK,
            &[hostname, "STARTTLS", "AUTH PLAIN LOGIN", "8BITMIME"],
        )
    }

    /// STARTTLS response
    pub fn starttls() -> String {
        Self::new(ResponseCode::READY, "2.0.0 Ready to start TLS")
    }

    /// Auth success
    pub fn auth_success() -> String {
        Self::new(ResponseCode::AUTH_SUCCESS, "2.7.0 Authentication successful")
    }

    /// Auth failed
    pub fn auth_failed() -> String {
        Self::new(ResponseCode::AUTH_FAILED, "5.7.8 Authentication failed")
    }

    /// Goodbye
    pub fn goodbye() -> String {
        Self::new(ResponseCode::CLOSING, "2.0.0 Bye")
    }
}

/// One server reply line, split into its code and continuation marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine<'a> {
    pub code: ResponseCode,
    /// `true` for `250 text`, `false` for `250-text`
    pub last: bool,
    pub text: &'a str,
}

/// Parse a server reply line such as `250-STARTTLS`
pub fn parse_reply(line: &str) -> Option<ReplyLine<'_>> {
    let code = line.get(..3)?.parse::<u16>().ok()?;
    let (last, text) = match line.as_bytes().get(3) {
        None => (true, ""),
        Some(b' ') => (true, &line[4..]),
        Some(b'-') => (false, &line[4..]),
        Some(_) => return None,
    };
    Some(ReplyLine {
        code: ResponseCode(code),
        last,
        text,
    })
}

/// Parse an SMTP line, returning (command, arg) or None if empty
pub fn parse_line(line: &str) -> Option<(Command, String)> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let (cmd, arg) = Command::parse(line);
    Some((cmd, arg.to_string()))
}

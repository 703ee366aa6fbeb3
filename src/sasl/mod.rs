//! # SASL Authentication Sub-Protocol
//!
//! Before any framed message may flow, a line-oriented ASCII exchange runs
//! over the same byte stream: one NUL octet, then `CMD[ ARG]\r\n` lines.
//! This module implements the client side of that exchange for the
//! EXTERNAL, DBUS_COOKIE_SHA1, and ANONYMOUS mechanisms, trying each in
//! order and falling back on `REJECTED`.
//!
//! Hex arguments are emitted in lowercase; inbound hex is accepted in
//! either case. A single line may not exceed 16 KiB. After the server's
//! `OK <guid>` the client sends `BEGIN` and the next octet on the stream
//! belongs to the first D-Bus frame, so any bytes over-read during the
//! handshake are handed back to the caller in [`SaslOutcome::leftover`].

pub mod cookie;

use rand::RngCore;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use cookie::CookieKeyring;

/// Upper bound on one SASL line, terminator included.
pub const MAX_LINE_LEN: usize = 16 * 1024;

/// The supported mechanisms, in client preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    /// Out-of-band credentials (Unix uid), no challenge round.
    External,
    /// Challenge/response over a cookie shared through the filesystem.
    DbusCookieSha1,
    /// No authentication; an opaque trace string may be sent.
    Anonymous,
}

impl Mechanism {
    pub fn name(self) -> &'static str {
        match self {
            Mechanism::External => "EXTERNAL",
            Mechanism::DbusCookieSha1 => "DBUS_COOKIE_SHA1",
            Mechanism::Anonymous => "ANONYMOUS",
        }
    }

    /// The default preference order.
    pub fn preference() -> Vec<Mechanism> {
        vec![
            Mechanism::External,
            Mechanism::DbusCookieSha1,
            Mechanism::Anonymous,
        ]
    }
}

/// A server response line, decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerResponse {
    /// `REJECTED <mech-list>`: the current exchange is over; the listed
    /// mechanisms are what the server would accept.
    Rejected(Vec<String>),
    /// `DATA <hex>`: mechanism payload.
    Data(Vec<u8>),
    /// `OK <guid-hex>`: authenticated; the argument is the server GUID.
    Ok(String),
    /// `ERROR [msg]`.
    Error(String),
    /// `AGREE_UNIX_FD` (never solicited by this client).
    AgreeUnixFd,
}

impl ServerResponse {
    /// Parse one line with the terminator already stripped.
    pub fn parse(line: &str) -> Result<Self> {
        if !line.is_ascii() {
            return Err(Error::SaslProtocol("non-ASCII byte in response".into()));
        }
        let (command, rest) = match line.split_once(' ') {
            Some((c, r)) => (c, r),
            None => (line, ""),
        };
        match command {
            "REJECTED" => Ok(ServerResponse::Rejected(
                rest.split_whitespace().map(str::to_owned).collect(),
            )),
            "DATA" => {
                let payload = hex::decode(rest.trim())
                    .map_err(|_| Error::SaslProtocol(format!("bad hex in DATA: {rest:?}")))?;
                Ok(ServerResponse::Data(payload))
            }
            "OK" => {
                let guid = rest.trim();
                if guid.is_empty() || hex::decode(guid).is_err() {
                    return Err(Error::SaslProtocol(format!("bad GUID in OK: {guid:?}")));
                }
                Ok(ServerResponse::Ok(guid.to_ascii_lowercase()))
            }
            "ERROR" => Ok(ServerResponse::Error(rest.to_owned())),
            "AGREE_UNIX_FD" => Ok(ServerResponse::AgreeUnixFd),
            other => Err(Error::SaslProtocol(format!("unknown response {other:?}"))),
        }
    }
}

/// Reads CRLF-terminated lines from the stream while retaining anything
/// read past the final line consumed.
struct LineReader {
    buf: Vec<u8>,
}

impl LineReader {
    fn new() -> Self {
        LineReader { buf: Vec::new() }
    }

    async fn read_line<S>(&mut self, stream: &mut S) -> Result<String>
    where
        S: AsyncRead + Unpin,
    {
        loop {
            if let Some(pos) = find_crlf(&self.buf) {
                if pos + 2 > MAX_LINE_LEN {
                    return Err(Error::SaslProtocol("line exceeds 16 KiB".into()));
                }
                let line: Vec<u8> = self.buf.drain(..pos + 2).collect();
                let text = std::str::from_utf8(&line[..pos])
                    .map_err(|_| Error::SaslProtocol("non-UTF-8 byte in line".into()))?;
                trace!(line = text, "sasl <-");
                return Ok(text.to_owned());
            }
            if self.buf.len() >= MAX_LINE_LEN {
                return Err(Error::SaslProtocol("line exceeds 16 KiB".into()));
            }
            let mut chunk = [0u8; 256];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(Error::SaslProtocol(
                    "stream closed during authentication".into(),
                ));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn into_leftover(self) -> Vec<u8> {
        self.buf
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Result of a successful handshake.
#[derive(Debug)]
pub struct SaslOutcome {
    /// The server GUID from the `OK` line, lowercase hex.
    pub guid: String,
    /// Bytes read past `OK`; they belong to the message stream.
    pub leftover: Vec<u8>,
}

/// The client side of the handshake.
///
/// The identity and keyring directory are injected so tests can run the
/// exchange without touching the real uid or home directory.
pub struct Authenticator {
    mechanisms: Vec<Mechanism>,
    identity: String,
    keyring: CookieKeyring,
}

impl Default for Authenticator {
    fn default() -> Self {
        Self::new()
    }
}

impl Authenticator {
    pub fn new() -> Self {
        Authenticator {
            mechanisms: Mechanism::preference(),
            identity: current_uid_string(),
            keyring: CookieKeyring::default_location(),
        }
    }

    /// Override the identity sent to EXTERNAL and DBUS_COOKIE_SHA1.
    pub fn with_identity(mut self, identity: &str) -> Self {
        self.identity = identity.to_owned();
        self
    }

    /// Override the cookie keyring directory.
    pub fn with_keyring(mut self, keyring: CookieKeyring) -> Self {
        self.keyring = keyring;
        self
    }

    /// Restrict or reorder the mechanisms to try.
    pub fn with_mechanisms(mut self, mechanisms: Vec<Mechanism>) -> Self {
        self.mechanisms = mechanisms;
        self
    }

    /// Run the handshake to completion: NUL byte, mechanism walk, `BEGIN`.
    pub async fn authenticate<S>(&self, stream: &mut S) -> Result<SaslOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        stream.write_all(&[0]).await?;

        let mut reader = LineReader::new();
        let mut last_offer = String::new();

        for mechanism in &self.mechanisms {
            debug!(mechanism = mechanism.name(), "attempting SASL mechanism");
            let outcome = self
                .try_mechanism(*mechanism, stream, &mut reader)
                .await?;
            match outcome {
                Attempt::Authenticated(guid) => {
                    send_line(stream, "BEGIN").await?;
                    debug!(guid = guid.as_str(), "authentication complete");
                    return Ok(SaslOutcome {
                        guid,
                        leftover: reader.into_leftover(),
                    });
                }
                Attempt::Rejected(offered) => {
                    warn!(
                        mechanism = mechanism.name(),
                        offered = offered.as_str(),
                        "mechanism rejected"
                    );
                    last_offer = offered;
                }
            }
        }

        Err(Error::SaslRejected { offered: last_offer })
    }

    async fn try_mechanism<S>(
        &self,
        mechanism: Mechanism,
        stream: &mut S,
        reader: &mut LineReader,
    ) -> Result<Attempt>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let initial = match mechanism {
            Mechanism::External | Mechanism::DbusCookieSha1 => hex::encode(&self.identity),
            Mechanism::Anonymous => hex::encode(format!("dbus-client {}", crate::VERSION)),
        };
        send_line(stream, &format!("AUTH {} {}", mechanism.name(), initial)).await?;

        loop {
            let line = reader.read_line(stream).await?;
            match ServerResponse::parse(&line)? {
                ServerResponse::Ok(guid) => return Ok(Attempt::Authenticated(guid)),
                ServerResponse::Rejected(mechs) => {
                    return Ok(Attempt::Rejected(mechs.join(" ")))
                }
                ServerResponse::Data(payload) if mechanism == Mechanism::DbusCookieSha1 => {
                    let reply = self.cookie_response(&payload)?;
                    send_line(stream, &format!("DATA {}", hex::encode(reply))).await?;
                }
                ServerResponse::Data(_) => {
                    return Err(Error::SaslProtocol(format!(
                        "unexpected DATA during {}",
                        mechanism.name()
                    )))
                }
                ServerResponse::Error(msg) => {
                    return Err(Error::SaslProtocol(format!("server error: {msg}")))
                }
                ServerResponse::AgreeUnixFd => {
                    return Err(Error::SaslProtocol(
                        "unsolicited AGREE_UNIX_FD".into(),
                    ))
                }
            }
        }
    }

    /// Compute the DBUS_COOKIE_SHA1 response for a server challenge of the
    /// form `<context> <cookie-id> <server-challenge>`.
    fn cookie_response(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| Error::SaslProtocol("non-UTF-8 cookie challenge".into()))?;
        let mut parts = text.split(' ');
        let (context, cookie_id, server_challenge) =
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(c), Some(i), Some(s), None) => (c, i, s),
                _ => {
                    return Err(Error::SaslProtocol(format!(
                        "malformed cookie challenge {text:?}"
                    )))
                }
            };

        let cookie = self.keyring.lookup(context, cookie_id)?;

        let mut challenge_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut challenge_bytes);
        let client_challenge = hex::encode(challenge_bytes);

        let digest = compute_cookie_digest(server_challenge, &client_challenge, &cookie);
        Ok(format!("{client_challenge} {digest}").into_bytes())
    }
}

enum Attempt {
    Authenticated(String),
    Rejected(String),
}

/// `sha1(server-challenge ":" client-challenge ":" cookie)`, lowercase hex.
pub(crate) fn compute_cookie_digest(
    server_challenge: &str,
    client_challenge: &str,
    cookie: &str,
) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("{server_challenge}:{client_challenge}:{cookie}"));
    hex::encode(hasher.finalize())
}

async fn send_line<S>(stream: &mut S, line: &str) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    trace!(line, "sasl ->");
    stream.write_all(line.as_bytes()).await?;
    stream.write_all(b"\r\n").await?;
    stream.flush().await?;
    Ok(())
}

/// The current uid as a decimal string; the EXTERNAL identity.
fn current_uid_string() -> String {
    #[cfg(unix)]
    {
        // Safety: getuid has no failure modes and touches no memory.
        let uid = unsafe { libc::getuid() };
        uid.to_string()
    }
    #[cfg(not(unix))]
    {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn responses_parse() {
        assert_eq!(
            ServerResponse::parse("REJECTED EXTERNAL DBUS_COOKIE_SHA1").unwrap(),
            ServerResponse::Rejected(vec!["EXTERNAL".into(), "DBUS_COOKIE_SHA1".into()])
        );
        assert_eq!(
            ServerResponse::parse("OK 1234deadbeef").unwrap(),
            ServerResponse::Ok("1234deadbeef".into())
        );
        assert_eq!(
            ServerResponse::parse("DATA 6869").unwrap(),
            ServerResponse::Data(b"hi".to_vec())
        );
        assert_eq!(
            ServerResponse::parse("ERROR not today").unwrap(),
            ServerResponse::Error("not today".into())
        );
    }

    #[test]
    fn decoder_accepts_uppercase_hex() {
        assert_eq!(
            ServerResponse::parse("DATA 6A6B").unwrap(),
            ServerResponse::Data(b"jk".to_vec())
        );
        assert_eq!(
            ServerResponse::parse("OK ABCDEF01").unwrap(),
            ServerResponse::Ok("abcdef01".into())
        );
    }

    #[test]
    fn malformed_responses_are_protocol_errors() {
        assert!(matches!(
            ServerResponse::parse("DATA xyz"),
            Err(Error::SaslProtocol(_))
        ));
        assert!(matches!(
            ServerResponse::parse("WHAT"),
            Err(Error::SaslProtocol(_))
        ));
        assert!(matches!(
            ServerResponse::parse("OK"),
            Err(Error::SaslProtocol(_))
        ));
    }

    #[test]
    fn cookie_digest_matches_reference_shape() {
        let digest = compute_cookie_digest("abc", "def", "s3cr3t");
        assert_eq!(digest.len(), 40);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(digest, digest.to_ascii_lowercase());
        // Deterministic for fixed inputs.
        assert_eq!(digest, compute_cookie_digest("abc", "def", "s3cr3t"));
    }

    async fn expect_line(stream: &mut tokio::io::DuplexStream, expected: &str) {
        let mut reader = LineReader::new();
        let line = reader.read_line(stream).await.unwrap();
        assert_eq!(line, expected);
    }

    #[tokio::test]
    async fn external_happy_path() {
        let (mut server, mut client) = duplex(4096);
        let auth = Authenticator::new().with_identity("1000");

        let server_task = tokio::spawn(async move {
            let mut nul = [0u8; 1];
            server.read_exact(&mut nul).await.unwrap();
            assert_eq!(nul[0], 0);
            expect_line(&mut server, "AUTH EXTERNAL 31303030").await;
            server.write_all(b"OK 1234deadbeef\r\n").await.unwrap();
            expect_line(&mut server, "BEGIN").await;
        });

        let outcome = auth.authenticate(&mut client).await.unwrap();
        assert_eq!(outcome.guid, "1234deadbeef");
        assert!(outcome.leftover.is_empty());
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn rejected_walks_preference_order() {
        let (mut server, mut client) = duplex(4096);
        let auth = Authenticator::new()
            .with_identity("1000")
            .with_mechanisms(vec![Mechanism::External, Mechanism::Anonymous]);

        let server_task = tokio::spawn(async move {
            let mut nul = [0u8; 1];
            server.read_exact(&mut nul).await.unwrap();
            expect_line(&mut server, "AUTH EXTERNAL 31303030").await;
            server
                .write_all(b"REJECTED ANONYMOUS\r\n")
                .await
                .unwrap();
            let mut reader = LineReader::new();
            let line = reader.read_line(&mut server).await.unwrap();
            assert!(line.starts_with("AUTH ANONYMOUS "));
            server.write_all(b"OK 00ff\r\n").await.unwrap();
            expect_line(&mut server, "BEGIN").await;
        });

        let outcome = auth.authenticate(&mut client).await.unwrap();
        assert_eq!(outcome.guid, "00ff");
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn exhausted_mechanisms_surface_rejection() {
        let (mut server, mut client) = duplex(4096);
        let auth = Authenticator::new()
            .with_identity("1000")
            .with_mechanisms(vec![Mechanism::External]);

        let server_task = tokio::spawn(async move {
            let mut nul = [0u8; 1];
            server.read_exact(&mut nul).await.unwrap();
            let mut reader = LineReader::new();
            reader.read_line(&mut server).await.unwrap();
            server
                .write_all(b"REJECTED KERBEROS_V4\r\n")
                .await
                .unwrap();
        });

        let err = auth.authenticate(&mut client).await.unwrap_err();
        match err {
            Error::SaslRejected { offered } => assert_eq!(offered, "KERBEROS_V4"),
            other => panic!("unexpected error {other:?}"),
        }
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn oversized_line_is_rejected() {
        let (mut server, mut client) = duplex(64 * 1024);
        let auth = Authenticator::new().with_identity("1000");

        let server_task = tokio::spawn(async move {
            let mut nul = [0u8; 1];
            server.read_exact(&mut nul).await.unwrap();
            let mut reader = LineReader::new();
            reader.read_line(&mut server).await.unwrap();
            let long = vec![b'A'; MAX_LINE_LEN + 16];
            server.write_all(&long).await.unwrap();
        });

        let err = auth.authenticate(&mut client).await.unwrap_err();
        assert!(matches!(err, Error::SaslProtocol(_)));
        server_task.await.unwrap();
    }
}

//! # Test Double
//!
//! [`StubBus`] is an in-memory peer speaking just enough of the server
//! side of the protocol to exercise the whole client stack: it accepts a
//! configurable set of SASL mechanisms, answers `Hello` with a
//! configurable unique name, then serves programmed replies per
//! `(interface, member)` key. Every decoded inbound frame (and its exact
//! wire size) is recorded for assertions.
//!
//! The stub hands out a [`Connector`], so reconnection is exercised
//! naturally: every connect yields a fresh loopback pair served by a fresh
//! task. Failure injection covers refused connects and mid-session drops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::frame::{self, FrameDecoder};
use crate::message::{Message, MessageType};
use crate::sasl::compute_cookie_digest;
use crate::transport::{memory, BoxedByteStream, Connector};
use crate::types::Value;

/// What the stub does with a programmed method call.
#[derive(Debug, Clone)]
pub enum StubReply {
    /// Answer with a method return carrying this body.
    Return(Vec<Value>),
    /// Answer with an error message.
    Error { name: String, body: Vec<Value> },
    /// Never answer; for timeout tests.
    Silence,
    /// Drop the connection upon receipt; for recovery tests.
    Disconnect,
    /// Write these bytes verbatim; for malformed-frame tests.
    Raw(Vec<u8>),
}

/// Cookie material for exercising DBUS_COOKIE_SHA1 end to end.
#[derive(Debug, Clone)]
pub struct StubCookie {
    pub context: String,
    pub id: String,
    pub value: String,
    pub server_challenge: String,
}

struct StubInner {
    bus_name: String,
    guid: String,
    accepted_mechanisms: Vec<String>,
    cookie: Option<StubCookie>,
    replies: Mutex<HashMap<(Option<String>, String), StubReply>>,
    received: Mutex<Vec<Message>>,
    frame_sizes: Mutex<Vec<usize>>,
    connections: AtomicUsize,
    fail_next_connects: AtomicUsize,
    kill: Notify,
    reply_serial: AtomicUsize,
}

/// A scripted in-memory bus daemon.
pub struct StubBus {
    inner: Arc<StubInner>,
}

impl Default for StubBus {
    fn default() -> Self {
        Self::new()
    }
}

impl StubBus {
    pub fn new() -> Self {
        StubBus {
            inner: Arc::new(StubInner {
                bus_name: ":1.42".to_owned(),
                guid: "1234deadbeef".to_owned(),
                accepted_mechanisms: vec!["EXTERNAL".to_owned()],
                cookie: None,
                replies: Mutex::new(HashMap::new()),
                received: Mutex::new(Vec::new()),
                frame_sizes: Mutex::new(Vec::new()),
                connections: AtomicUsize::new(0),
                fail_next_connects: AtomicUsize::new(0),
                kill: Notify::new(),
                reply_serial: AtomicUsize::new(1),
            }),
        }
    }

    /// The unique name handed out on Hello.
    pub fn with_bus_name(self, name: &str) -> Self {
        self.mutate(|inner| inner.bus_name = name.to_owned())
    }

    pub fn with_guid(self, guid: &str) -> Self {
        self.mutate(|inner| inner.guid = guid.to_owned())
    }

    /// Restrict the accepted SASL mechanisms (upper-case names).
    pub fn accept_mechanisms(self, mechanisms: &[&str]) -> Self {
        self.mutate(|inner| {
            inner.accepted_mechanisms = mechanisms.iter().map(|m| (*m).to_owned()).collect()
        })
    }

    /// Provide cookie material; implies accepting DBUS_COOKIE_SHA1.
    pub fn with_cookie(self, cookie: StubCookie) -> Self {
        self.mutate(|inner| inner.cookie = Some(cookie))
    }

    fn mutate(mut self, f: impl FnOnce(&mut StubInner)) -> Self {
        let inner = Arc::get_mut(&mut self.inner).expect("configure before connecting");
        f(inner);
        self
    }

    /// Program the reply for calls to `(interface, member)`. A `None`
    /// interface matches calls regardless of their INTERFACE field.
    pub fn program_reply(&self, interface: Option<&str>, member: &str, reply: StubReply) {
        self.inner
            .replies
            .lock()
            .expect("replies lock")
            .insert((interface.map(str::to_owned), member.to_owned()), reply);
    }

    /// The connector to hand to a [`crate::Connection`] builder.
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(StubConnector {
            inner: self.inner.clone(),
        })
    }

    /// All decoded inbound messages, in arrival order.
    pub fn received(&self) -> Vec<Message> {
        self.inner.received.lock().expect("received lock").clone()
    }

    /// Exact wire size of each received frame.
    pub fn received_frame_sizes(&self) -> Vec<usize> {
        self.inner
            .frame_sizes
            .lock()
            .expect("frame sizes lock")
            .clone()
    }

    /// How many connections have been served.
    pub fn connections_served(&self) -> usize {
        self.inner.connections.load(Ordering::SeqCst)
    }

    /// Refuse the next `n` connect attempts at the socket layer.
    pub fn fail_next_connects(&self, n: usize) {
        self.inner.fail_next_connects.store(n, Ordering::SeqCst);
    }

    /// Drop every live connection, as a daemon crash would.
    pub fn drop_connections(&self) {
        self.inner.kill.notify_waiters();
    }

    /// Wait until at least `count` messages have been received.
    pub async fn wait_for_messages(&self, count: usize) {
        loop {
            if self.inner.received.lock().expect("received lock").len() >= count {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
    }
}

struct StubConnector {
    inner: Arc<StubInner>,
}

#[async_trait]
impl Connector for StubConnector {
    async fn connect(&self) -> Result<BoxedByteStream> {
        let failures = self.inner.fail_next_connects.load(Ordering::SeqCst);
        if failures > 0 {
            self.inner
                .fail_next_connects
                .store(failures - 1, Ordering::SeqCst);
            return Err(Error::TransportIo(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "stub bus refused the connection",
            )));
        }
        let (client, server) = memory::pair();
        self.inner.connections.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Err(error) = serve(inner, server).await {
                debug!(%error, "stub connection ended");
            }
        });
        Ok(Box::new(client))
    }

    fn describe(&self) -> String {
        "stub-bus".to_owned()
    }
}

/// Read one CRLF line from the handshake phase, retaining overrun bytes.
async fn read_line(stream: &mut DuplexStream, buf: &mut Vec<u8>) -> Result<String> {
    loop {
        if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
            let line: Vec<u8> = buf.drain(..pos + 2).collect();
            return String::from_utf8(line[..pos].to_vec())
                .map_err(|_| Error::SaslProtocol("non-UTF-8 line".into()));
        }
        let mut chunk = [0u8; 512];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::SaslProtocol("client hung up mid-handshake".into()));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn write_line(stream: &mut DuplexStream, line: &str) -> Result<()> {
    stream.write_all(line.as_bytes()).await?;
    stream.write_all(b"\r\n").await?;
    stream.flush().await?;
    Ok(())
}

/// The server side of the SASL exchange. Returns bytes read past BEGIN.
async fn sasl_server(inner: &StubInner, stream: &mut DuplexStream) -> Result<Vec<u8>> {
    let mut nul = [0u8; 1];
    stream.read_exact(&mut nul).await?;
    if nul[0] != 0 {
        return Err(Error::SaslProtocol("missing leading NUL byte".into()));
    }

    let mut buf = Vec::new();
    loop {
        let line = read_line(stream, &mut buf).await?;
        let mut words = line.split(' ');
        match words.next() {
            Some("AUTH") => {
                let mechanism = words.next().unwrap_or("");
                if mechanism == "DBUS_COOKIE_SHA1" {
                    if let Some(cookie) = &inner.cookie {
                        run_cookie_exchange(inner, stream, &mut buf, cookie).await?;
                        continue;
                    }
                }
                if inner.accepted_mechanisms.iter().any(|m| m == mechanism) {
                    write_line(stream, &format!("OK {}", inner.guid)).await?;
                } else {
                    let mut offer = inner.accepted_mechanisms.clone();
                    if inner.cookie.is_some() {
                        offer.push("DBUS_COOKIE_SHA1".to_owned());
                    }
                    write_line(stream, &format!("REJECTED {}", offer.join(" "))).await?;
                }
            }
            Some("BEGIN") => return Ok(buf),
            Some("CANCEL") => {
                write_line(stream, "REJECTED").await?;
            }
            Some("NEGOTIATE_UNIX_FD") => {
                write_line(stream, "ERROR fd passing not supported").await?;
            }
            other => {
                warn!(?other, "stub received unknown SASL command");
                write_line(stream, "ERROR unknown command").await?;
            }
        }
    }
}

async fn run_cookie_exchange(
    inner: &StubInner,
    stream: &mut DuplexStream,
    buf: &mut Vec<u8>,
    cookie: &StubCookie,
) -> Result<()> {
    let challenge = format!(
        "{} {} {}",
        cookie.context, cookie.id, cookie.server_challenge
    );
    write_line(stream, &format!("DATA {}", hex::encode(challenge))).await?;

    let line = read_line(stream, buf).await?;
    let payload = line
        .strip_prefix("DATA ")
        .ok_or_else(|| Error::SaslProtocol(format!("expected DATA, got {line:?}")))?;
    let decoded = hex::decode(payload.trim())
        .map_err(|_| Error::SaslProtocol("bad hex in cookie response".into()))?;
    let text = String::from_utf8(decoded)
        .map_err(|_| Error::SaslProtocol("non-UTF-8 cookie response".into()))?;
    let (client_challenge, digest) = text
        .split_once(' ')
        .ok_or_else(|| Error::SaslProtocol("malformed cookie response".into()))?;

    let expected =
        compute_cookie_digest(&cookie.server_challenge, client_challenge, &cookie.value);
    if digest == expected {
        write_line(stream, &format!("OK {}", inner.guid)).await?;
    } else {
        write_line(stream, "REJECTED EXTERNAL").await?;
    }
    Ok(())
}

async fn serve(inner: Arc<StubInner>, mut stream: DuplexStream) -> Result<()> {
    let leftover = sasl_server(&inner, &mut stream).await?;

    let mut decoder = FrameDecoder::new();
    decoder.extend(&leftover);
    let mut buf = [0u8; 16 * 1024];
    loop {
        // Drain complete frames before reading again.
        loop {
            let before = decoder.buffered();
            let Some(message) = decoder.next_frame()? else {
                break;
            };
            let size = before - decoder.buffered();
            inner
                .frame_sizes
                .lock()
                .expect("frame sizes lock")
                .push(size);
            if !handle_message(&inner, &mut stream, message).await? {
                return Ok(());
            }
        }
        tokio::select! {
            _ = inner.kill.notified() => {
                debug!("stub dropping connection on request");
                return Ok(());
            }
            read = stream.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    return Ok(());
                }
                decoder.extend(&buf[..n]);
            }
        }
    }
}

/// Dispatch one inbound message; `Ok(false)` ends the connection.
async fn handle_message(
    inner: &Arc<StubInner>,
    stream: &mut DuplexStream,
    message: Message,
) -> Result<bool> {
    inner
        .received
        .lock()
        .expect("received lock")
        .push(message.clone());

    if message.message_type() != MessageType::MethodCall {
        return Ok(true);
    }
    let serial = message.serial();
    let wants_reply = message.wants_reply();

    // Hello is implicit unless a test overrides it.
    let programmed = {
        let replies = inner.replies.lock().expect("replies lock");
        replies
            .get(&(
                message.interface().map(str::to_owned),
                message.member().unwrap_or("").to_owned(),
            ))
            .or_else(|| replies.get(&(None, message.member().unwrap_or("").to_owned())))
            .cloned()
    };
    let reply = match programmed {
        Some(reply) => reply,
        None if message.member() == Some("Hello") => {
            StubReply::Return(vec![Value::Str(inner.bus_name.clone())])
        }
        None => StubReply::Error {
            name: "org.freedesktop.DBus.Error.UnknownMethod".to_owned(),
            body: Vec::new(),
        },
    };

    match reply {
        StubReply::Silence => Ok(true),
        StubReply::Disconnect => Ok(false),
        StubReply::Raw(bytes) => {
            stream.write_all(&bytes).await?;
            stream.flush().await?;
            Ok(true)
        }
        _ if !wants_reply => Ok(true),
        StubReply::Return(body) => {
            let reply = Message::method_return(serial)
                .body(body)
                .serial(inner.reply_serial.fetch_add(1, Ordering::SeqCst) as u32)
                .build()?;
            stream.write_all(&frame::encode(&reply)?).await?;
            stream.flush().await?;
            Ok(true)
        }
        StubReply::Error { name, body } => {
            let reply = Message::error(&name, serial)
                .body(body)
                .serial(inner.reply_serial.fetch_add(1, Ordering::SeqCst) as u32)
                .build()?;
            stream.write_all(&frame::encode(&reply)?).await?;
            stream.flush().await?;
            Ok(true)
        }
    }
}

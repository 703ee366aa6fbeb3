//! The per-connection event loop.
//!
//! One spawned task owns everything single-threaded the design relies on:
//! the socket halves, the frame decoder, the pipeline, and the pending
//! table. User-facing calls reach it as [`Command`]s over an unbounded
//! channel and are answered through oneshot sinks; completions therefore
//! always happen on the loop, and the serial counter and pending table
//! need no locks.
//!
//! Ordering guarantees kept here:
//!
//! - outbound writes are issued in command order, straight to the socket,
//!   never reordered;
//! - inbound messages are dispatched in wire order;
//! - `connection_active` is fired before any buffered application-level
//!   inbound message, and `connection_inactive` after the last one.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::frame::{self, FrameDecoder};
use crate::message::{Message, MessageType};
use crate::pipeline::{Handler, Pipeline, UserEvent};
use crate::transport::BoxedByteStream;

use super::pending::{PendingCompletion, PendingTable, SerialAllocator};

/// Error name synthesized for inbound calls nothing consumed.
const NOT_SUPPORTED: &str = "org.freedesktop.DBus.Error.NotSupported";

/// Requests from connection handles to the loop.
pub(crate) enum Command {
    /// Fire-and-forget send; `done` completes once the transport took the
    /// bytes.
    Send {
        message: Message,
        done: oneshot::Sender<Result<()>>,
    },
    /// Correlated send; `reply` completes with the matching reply, a
    /// timeout, or `closed`.
    SendRequest {
        message: Message,
        reply: oneshot::Sender<Result<Message>>,
    },
    /// Correlated send whose reply is delivered through the pipeline;
    /// `done` acknowledges the write.
    SendRouted {
        message: Message,
        done: oneshot::Sender<Result<()>>,
    },
    AddHandler {
        name: String,
        handler: Box<dyn Handler>,
        done: oneshot::Sender<Result<()>>,
    },
    RemoveHandler {
        name: String,
        done: oneshot::Sender<Result<()>>,
    },
    FireUserEvent {
        event: UserEvent,
    },
    /// SASL and Hello are done: fire `connection_active` and release any
    /// buffered inbound traffic to the pipeline.
    Activate,
    /// Graceful shutdown; acknowledged after the pending table is drained.
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Why the loop ended.
pub(crate) enum EngineExit {
    /// `close()` or every handle dropped.
    Closed,
    /// Transport or protocol failure; feeds the reconnect path.
    Fatal(Error),
}

enum LoopExit {
    Close(Option<oneshot::Sender<()>>),
    Fatal(Error),
}

pub(crate) struct Engine {
    reader: ReadHalf<BoxedByteStream>,
    writer: WriteHalf<BoxedByteStream>,
    decoder: FrameDecoder,
    pipeline: Pipeline,
    pending: PendingTable,
    serials: Arc<SerialAllocator>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    method_call_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
    /// False until `Activate`; pipeline-bound inbound traffic is buffered
    /// so `connection_active` precedes it.
    active: bool,
    held_inbound: Vec<Message>,
    /// Armed while a partial frame is buffered.
    read_deadline: Option<Instant>,
}

impl Engine {
    pub(crate) fn new(
        stream: BoxedByteStream,
        leftover: Vec<u8>,
        serials: Arc<SerialAllocator>,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
        config: &ConnectionConfig,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let mut decoder = FrameDecoder::new();
        decoder.extend(&leftover);
        Engine {
            reader,
            writer,
            decoder,
            pipeline: Pipeline::new(),
            pending: PendingTable::new(),
            serials,
            cmd_rx,
            method_call_timeout: config.method_call_timeout,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            active: false,
            held_inbound: Vec::new(),
            read_deadline: None,
        }
    }

    /// Drive the loop until close or a fatal error, then drain: every
    /// remaining pending call fails with `closed` and the pipeline sees
    /// `connection_inactive` after the last delivered message.
    pub(crate) async fn run(mut self) -> EngineExit {
        let exit = self.run_loop().await;
        self.pending.drain_with_closed();
        debug_assert!(self.pending.is_empty());
        if let Err(error) = self.pipeline.fire_connection_inactive() {
            warn!(%error, "pipeline failure during deactivation");
        }
        match exit {
            LoopExit::Close(ack) => {
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
                EngineExit::Closed
            }
            LoopExit::Fatal(error) => EngineExit::Fatal(error),
        }
    }

    async fn run_loop(&mut self) -> LoopExit {
        let mut read_buf = vec![0u8; 16 * 1024];
        loop {
            let pending_deadline = self.pending.next_deadline();
            let stall_deadline = self.read_deadline;
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    None => return LoopExit::Close(None),
                    Some(Command::Close { done }) => return LoopExit::Close(Some(done)),
                    Some(cmd) => {
                        if let Err(error) = self.handle_command(cmd).await {
                            return LoopExit::Fatal(error);
                        }
                    }
                },
                read = self.reader.read(&mut read_buf) => match read {
                    Ok(0) => {
                        return LoopExit::Fatal(Error::TransportIo(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "peer closed the stream",
                        )))
                    }
                    Ok(n) => {
                        if let Err(error) = self.process_bytes(&read_buf[..n]).await {
                            return LoopExit::Fatal(error);
                        }
                    }
                    Err(error) => return LoopExit::Fatal(error.into()),
                },
                _ = tokio::time::sleep_until(pending_deadline.unwrap_or_else(Instant::now)),
                    if pending_deadline.is_some() =>
                {
                    if let Err(error) = self.expire_pending() {
                        return LoopExit::Fatal(error);
                    }
                }
                _ = tokio::time::sleep_until(stall_deadline.unwrap_or_else(Instant::now)),
                    if stall_deadline.is_some() =>
                {
                    return LoopExit::Fatal(Error::TransportIo(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "read stalled inside a partial frame",
                    )));
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) -> Result<()> {
        match cmd {
            Command::Send { message, done } => {
                match self.write_outbound(message).await {
                    Ok(()) => {
                        let _ = done.send(Ok(()));
                        Ok(())
                    }
                    Err(error) => self.fail_send(error, |e| {
                        let _ = done.send(Err(e));
                    }),
                }
            }
            Command::SendRequest { message, reply } => {
                let serial = message.serial();
                // Install before the write is flushed so a reply cannot
                // race the table.
                self.pending.insert(
                    serial,
                    self.method_call_timeout,
                    PendingCompletion::Sink(reply),
                );
                match self.write_outbound(message).await {
                    Ok(()) => Ok(()),
                    Err(error) => {
                        let completion = self.pending.complete(serial);
                        self.fail_send(error, |e| {
                            if let Some(PendingCompletion::Sink(sink)) = completion {
                                let _ = sink.send(Err(e));
                            }
                        })
                    }
                }
            }
            Command::SendRouted { message, done } => {
                let serial = message.serial();
                self.pending
                    .insert(serial, self.method_call_timeout, PendingCompletion::Route);
                match self.write_outbound(message).await {
                    Ok(()) => {
                        let _ = done.send(Ok(()));
                        Ok(())
                    }
                    Err(error) => {
                        self.pending.forget(serial);
                        self.fail_send(error, |e| {
                            let _ = done.send(Err(e));
                        })
                    }
                }
            }
            Command::AddHandler { name, handler, done } => {
                let _ = done.send(self.pipeline.add_last(&name, handler));
                self.flush_pipeline_outbound().await
            }
            Command::RemoveHandler { name, done } => {
                let _ = done.send(self.pipeline.remove(&name));
                self.flush_pipeline_outbound().await
            }
            Command::FireUserEvent { event } => {
                self.pipeline.fire_user_event(event)?;
                self.flush_pipeline_outbound().await
            }
            Command::Activate => {
                self.pipeline.fire_connection_active()?;
                self.active = true;
                let held = std::mem::take(&mut self.held_inbound);
                for message in held {
                    self.dispatch_to_pipeline(message).await?;
                }
                self.flush_pipeline_outbound().await
            }
            Command::Close { .. } => unreachable!("close is handled by the loop"),
        }
    }

    /// Route a send failure: per-call errors complete only the caller's
    /// sink; transport and pipeline failures also kill the connection.
    fn fail_send(&mut self, error: Error, complete: impl FnOnce(Error)) -> Result<()> {
        if error.is_connection_fatal() {
            let fatal = Error::TransportIo(io::Error::new(
                io::ErrorKind::BrokenPipe,
                error.to_string(),
            ));
            complete(error);
            Err(fatal)
        } else {
            complete(error);
            Ok(())
        }
    }

    /// Run a message through the outbound pipeline, encode it, and write
    /// it. `Ok` when the bytes are with the transport or a handler
    /// consumed the message.
    async fn write_outbound(&mut self, message: Message) -> Result<()> {
        let message = match self.pipeline.fire_outbound_message(message) {
            Ok(Some(message)) => message,
            // Consumed by a handler: nothing to write.
            Ok(None) => {
                return self.flush_pipeline_outbound().await;
            }
            // Outbound handler failures terminate the connection.
            Err(error) => {
                return Err(Error::TransportIo(io::Error::new(
                    io::ErrorKind::Other,
                    format!("outbound handler failed: {error}"),
                )))
            }
        };
        let bytes = frame::encode(&message)?;
        self.write_frame(&bytes).await?;
        self.flush_pipeline_outbound().await
    }

    /// Write handler-originated messages that reached the head during the
    /// last dispatch.
    async fn flush_pipeline_outbound(&mut self) -> Result<()> {
        for message in self.pipeline.drain_outbound() {
            let mut message = message;
            if message.serial() == 0 {
                message.serial = self.serials.next();
            }
            let bytes = frame::encode(&message)?;
            self.write_frame(&bytes).await?;
        }
        Ok(())
    }

    async fn write_frame(&mut self, bytes: &[u8]) -> Result<()> {
        trace!(len = bytes.len(), "writing frame");
        let write = async {
            self.writer.write_all(bytes).await?;
            self.writer.flush().await?;
            Ok::<(), io::Error>(())
        };
        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(error.into()),
            Err(_) => Err(Error::TransportIo(io::Error::new(
                io::ErrorKind::TimedOut,
                "write timed out",
            ))),
        }
    }

    async fn process_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.decoder.extend(bytes);
        while let Some(message) = self.decoder.next_frame()? {
            self.route_inbound(message).await?;
        }
        // Arm the stall timer only while a partial frame sits in the
        // buffer; an idle connection may stay quiet indefinitely.
        self.read_deadline = if self.decoder.buffered() > 0 {
            Some(Instant::now() + self.read_timeout)
        } else {
            None
        };
        Ok(())
    }

    async fn route_inbound(&mut self, message: Message) -> Result<()> {
        trace!(
            message_type = ?message.message_type(),
            serial = message.serial(),
            "inbound frame"
        );
        match message.message_type() {
            MessageType::MethodReturn | MessageType::Error => {
                let reply_serial = message
                    .reply_serial()
                    .expect("decoder enforces REPLY_SERIAL");
                match self.pending.complete(reply_serial) {
                    Some(PendingCompletion::Sink(sink)) => {
                        let result = if message.message_type() == MessageType::Error {
                            Err(Error::Remote {
                                name: message.error_name().unwrap_or_default().to_owned(),
                                message: message.error_message_text().to_owned(),
                                body: message.body().to_vec(),
                            })
                        } else {
                            Ok(message)
                        };
                        // A dropped receiver means the caller cancelled;
                        // the reply is simply discarded.
                        let _ = sink.send(result);
                        Ok(())
                    }
                    Some(PendingCompletion::Route) | None => {
                        // Routed replies and unsolicited replies both go to
                        // the pipeline; the user may have subscribed.
                        self.dispatch_to_pipeline(message).await
                    }
                }
            }
            MessageType::MethodCall => {
                if !self.active {
                    self.held_inbound.push(message);
                    return Ok(());
                }
                let wants_reply = message.wants_reply();
                let sender = message.sender().map(str::to_owned);
                let serial = message.serial();
                if let Some(_unconsumed) = self.pipeline.fire_inbound_message(message)? {
                    if wants_reply {
                        debug!(serial, "synthesizing NotSupported for unhandled call");
                        let mut builder = Message::error(NOT_SUPPORTED, serial)
                            .serial(self.serials.next());
                        if let Some(sender) = sender {
                            builder = builder.destination(&sender);
                        }
                        let bytes = frame::encode(&builder.build()?)?;
                        self.write_frame(&bytes).await?;
                    }
                }
                self.flush_pipeline_outbound().await
            }
            MessageType::Signal => self.dispatch_to_pipeline(message).await,
        }
    }

    async fn dispatch_to_pipeline(&mut self, message: Message) -> Result<()> {
        if !self.active {
            self.held_inbound.push(message);
            return Ok(());
        }
        // Unconsumed messages fall off the tail and are discarded; the
        // engine acts only on unconsumed method calls.
        let _ = self.pipeline.fire_inbound_message(message)?;
        self.flush_pipeline_outbound().await
    }

    fn expire_pending(&mut self) -> Result<()> {
        for (serial, completion) in self.pending.take_expired(Instant::now()) {
            debug!(serial, "pending call timed out");
            match completion {
                PendingCompletion::Sink(sink) => {
                    let _ = sink.send(Err(Error::Timeout));
                }
                PendingCompletion::Route => {
                    self.pipeline.fire_inbound_failure(Error::Timeout)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory;
    use tokio::io::DuplexStream;

    struct TestRig {
        cmd_tx: mpsc::UnboundedSender<Command>,
        peer: DuplexStream,
        serials: Arc<SerialAllocator>,
        engine: tokio::task::JoinHandle<EngineExit>,
    }

    fn rig(config: ConnectionConfig) -> TestRig {
        let (local, peer) = memory::pair();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let serials = Arc::new(SerialAllocator::new());
        let engine = Engine::new(Box::new(local), Vec::new(), serials.clone(), cmd_rx, &config);
        let engine = tokio::spawn(engine.run());
        TestRig {
            cmd_tx,
            peer,
            serials,
            engine,
        }
    }

    async fn read_frame(peer: &mut DuplexStream) -> Message {
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 4096];
        loop {
            if let Some(msg) = decoder.next_frame().unwrap() {
                return msg;
            }
            let n = peer.read(&mut buf).await.unwrap();
            assert_ne!(n, 0, "peer saw EOF while waiting for a frame");
            decoder.extend(&buf[..n]);
        }
    }

    fn activate(rig: &TestRig) {
        rig.cmd_tx.send(Command::Activate).unwrap();
    }

    #[tokio::test]
    async fn request_reply_correlation() {
        let mut r = rig(ConnectionConfig::default());
        activate(&r);

        let call = Message::method_call("/org/freedesktop/DBus", "Ping")
            .interface("org.freedesktop.DBus.Peer")
            .serial(r.serials.next())
            .build()
            .unwrap();
        let serial = call.serial();
        let (reply_tx, reply_rx) = oneshot::channel();
        r.cmd_tx
            .send(Command::SendRequest {
                message: call,
                reply: reply_tx,
            })
            .unwrap();

        let seen = read_frame(&mut r.peer).await;
        assert_eq!(seen.member(), Some("Ping"));
        assert_eq!(seen.serial(), serial);

        let reply = Message::method_return(serial).serial(1).build().unwrap();
        r.peer
            .write_all(&frame::encode(&reply).unwrap())
            .await
            .unwrap();

        let got = reply_rx.await.unwrap().unwrap();
        assert_eq!(got.reply_serial(), Some(serial));

        drop(r.cmd_tx);
        assert!(matches!(r.engine.await.unwrap(), EngineExit::Closed));
    }

    #[tokio::test]
    async fn error_reply_preserves_remote_name() {
        let mut r = rig(ConnectionConfig::default());
        activate(&r);

        let call = Message::method_call("/x", "Will_Fail")
            .serial(r.serials.next())
            .build()
            .unwrap();
        let serial = call.serial();
        let (reply_tx, reply_rx) = oneshot::channel();
        r.cmd_tx
            .send(Command::SendRequest {
                message: call,
                reply: reply_tx,
            })
            .unwrap();
        let _ = read_frame(&mut r.peer).await;

        let error = Message::error("com.example.Weird.Error", serial)
            .body(vec![crate::types::Value::Str("nope".into())])
            .serial(1)
            .build()
            .unwrap();
        r.peer
            .write_all(&frame::encode(&error).unwrap())
            .await
            .unwrap();

        match reply_rx.await.unwrap() {
            Err(Error::Remote { name, message, .. }) => {
                assert_eq!(name, "com.example.Weird.Error");
                assert_eq!(message, "nope");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pending_call_times_out() {
        let config = ConnectionConfig::builder()
            .method_call_timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        let r = rig(config);
        activate(&r);

        let call = Message::method_call("/x", "Never")
            .serial(r.serials.next())
            .build()
            .unwrap();
        let (reply_tx, reply_rx) = oneshot::channel();
        r.cmd_tx
            .send(Command::SendRequest {
                message: call,
                reply: reply_tx,
            })
            .unwrap();

        // Nothing answers; the deadline must fire.
        let result = reply_rx.await.unwrap();
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn unhandled_inbound_call_gets_not_supported() {
        let mut r = rig(ConnectionConfig::default());
        activate(&r);

        let call = Message::method_call("/org/example", "Unknown")
            .sender(":1.7")
            .serial(42)
            .build()
            .unwrap();
        r.peer
            .write_all(&frame::encode(&call).unwrap())
            .await
            .unwrap();

        let reply = read_frame(&mut r.peer).await;
        assert_eq!(reply.message_type(), MessageType::Error);
        assert_eq!(reply.error_name(), Some(NOT_SUPPORTED));
        assert_eq!(reply.reply_serial(), Some(42));
        assert_eq!(reply.destination(), Some(":1.7"));
    }

    #[tokio::test]
    async fn malformed_frame_is_fatal() {
        let mut r = rig(ConnectionConfig::default());
        activate(&r);

        // Frame with an oversized declared body.
        let call = Message::method_call("/x", "M").serial(1).build().unwrap();
        let mut bytes = frame::encode(&call).unwrap();
        bytes[4..8].copy_from_slice(&(1u32 << 30).to_le_bytes());
        r.peer.write_all(&bytes).await.unwrap();

        match r.engine.await.unwrap() {
            EngineExit::Fatal(Error::CodecDecode(_)) => {}
            other => panic!(
                "expected codec failure, got {:?}",
                match other {
                    EngineExit::Closed => "closed".to_owned(),
                    EngineExit::Fatal(e) => e.to_string(),
                }
            ),
        }
    }

    #[tokio::test]
    async fn peer_drop_is_fatal_and_drains_pending() {
        let r = rig(ConnectionConfig::default());
        activate(&r);

        let call = Message::method_call("/x", "M")
            .serial(r.serials.next())
            .build()
            .unwrap();
        let (reply_tx, reply_rx) = oneshot::channel();
        r.cmd_tx
            .send(Command::SendRequest {
                message: call,
                reply: reply_tx,
            })
            .unwrap();

        drop(r.peer);
        match r.engine.await.unwrap() {
            EngineExit::Fatal(Error::TransportIo(_)) => {}
            _ => panic!("expected transport failure"),
        }
        // The pending sink was drained with `closed`.
        assert!(matches!(reply_rx.await.unwrap(), Err(Error::Closed)));
    }

    #[tokio::test]
    async fn close_acknowledges_after_drain() {
        let r = rig(ConnectionConfig::default());
        activate(&r);
        let (done_tx, done_rx) = oneshot::channel();
        r.cmd_tx.send(Command::Close { done: done_tx }).unwrap();
        done_rx.await.unwrap();
        assert!(matches!(r.engine.await.unwrap(), EngineExit::Closed));
    }
}

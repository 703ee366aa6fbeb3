//! Failure handling: per-call timeouts, reconnection with exponential
//! backoff, malformed inbound frames, and close semantics.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dbus_client::testing::{StubBus, StubReply};
use dbus_client::{
    Connection, ConnectionConfig, ConnectionEvent, ConnectionState, Error, Handler,
    HandlerContext, Message,
};

async fn connect(stub: &StubBus, config: ConnectionConfig) -> Connection {
    let connection = Connection::builder()
        .connector(stub.connector())
        .config(config)
        .build()
        .unwrap();
    connection.connect().await.unwrap();
    connection
}

#[tokio::test(start_paused = true)]
async fn pending_call_timeout_leaves_connection_up() {
    let stub = StubBus::new();
    stub.program_reply(None, "Never", StubReply::Silence);
    stub.program_reply(None, "Echo", StubReply::Return(vec![]));
    let config = ConnectionConfig::builder()
        .method_call_timeout(Duration::from_millis(50))
        .health_check_enabled(false)
        .auto_reconnect_enabled(false)
        .build()
        .unwrap();
    let connection = connect(&stub, config).await;

    let started = tokio::time::Instant::now();
    let err = connection
        .send_request(Message::method_call("/x", "Never").build().unwrap())
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, Error::Timeout));
    assert!(
        elapsed >= Duration::from_millis(40) && elapsed <= Duration::from_millis(60),
        "timeout fired at {elapsed:?}"
    );
    // The connection survived and still serves requests.
    assert_eq!(connection.state(), ConnectionState::Connected);
    connection
        .send_request(Message::method_call("/x", "Echo").build().unwrap())
        .await
        .unwrap();

    connection.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn reconnect_backs_off_then_exhausts() {
    let stub = StubBus::new();
    let config = ConnectionConfig::builder()
        .reconnect_initial_delay(Duration::from_millis(10))
        .reconnect_backoff_multiplier(2.0)
        .max_reconnect_attempts(3)
        .health_check_enabled(false)
        .build()
        .unwrap();
    let connection = connect(&stub, config).await;
    let mut events = connection.subscribe_events();

    // Every further connect is refused, then the live socket is dropped.
    stub.fail_next_connects(usize::MAX);
    stub.drop_connections();

    // Expected sequence: state(connected→reconnecting), then per attempt
    // (attempt, failure) x3, then exhausted, then state(→failed).
    let mut attempts = Vec::new();
    let mut state_changes = Vec::new();
    let mut exhausted = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    while !exhausted {
        let event = tokio::select! {
            event = events.recv() => event.unwrap(),
            _ = tokio::time::sleep_until(deadline) => panic!("exhaustion never happened"),
        };
        match event {
            ConnectionEvent::ReconnectionAttempt { attempt } => {
                attempts.push((attempt, tokio::time::Instant::now()));
            }
            ConnectionEvent::StateChanged { old, new } => state_changes.push((old, new)),
            ConnectionEvent::ReconnectionExhausted => exhausted = true,
            _ => {}
        }
    }
    // Final failed transition.
    let final_change = loop {
        match events.recv().await.unwrap() {
            ConnectionEvent::StateChanged { old, new } => break (old, new),
            _ => continue,
        }
    };

    assert_eq!(
        attempts.iter().map(|(n, _)| *n).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    // Backoff spacing: ~10ms, then ~20ms, then ~40ms between attempts.
    let gap12 = attempts[1].1 - attempts[0].1;
    let gap23 = attempts[2].1 - attempts[1].1;
    assert!(gap12 >= Duration::from_millis(15) && gap12 <= Duration::from_millis(30));
    assert!(gap23 >= Duration::from_millis(35) && gap23 <= Duration::from_millis(60));

    assert!(state_changes
        .contains(&(ConnectionState::Connected, ConnectionState::Reconnecting)));
    assert_eq!(
        final_change,
        (ConnectionState::Reconnecting, ConnectionState::Failed)
    );
    assert_eq!(connection.state(), ConnectionState::Failed);
}

#[tokio::test]
async fn reconnect_succeeds_when_the_bus_returns() {
    let stub = StubBus::new();
    let config = ConnectionConfig::builder()
        .reconnect_initial_delay(Duration::from_millis(5))
        .max_reconnect_attempts(10)
        .health_check_enabled(false)
        .build()
        .unwrap();
    let connection = connect(&stub, config).await;
    let mut events = connection.subscribe_events();

    stub.drop_connections();

    // Wait for the success event; the stub accepts the new connection.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let event = tokio::select! {
            event = events.recv() => event.unwrap(),
            _ = tokio::time::sleep_until(deadline) => panic!("never reconnected"),
        };
        if event == ConnectionEvent::ReconnectionSuccess {
            break;
        }
    }
    assert_eq!(connection.state(), ConnectionState::Connected);
    assert!(stub.connections_served() >= 2);
    assert_eq!(connection.reconnect_attempts(), 0);

    connection.close().await.unwrap();
}

/// Records every message the pipeline delivers.
struct InboundSpy {
    seen: Arc<Mutex<Vec<Message>>>,
}

impl Handler for InboundSpy {
    fn handle_inbound_message(
        &mut self,
        _ctx: &mut HandlerContext<'_>,
        msg: Message,
    ) -> dbus_client::Result<()> {
        self.seen.lock().unwrap().push(msg);
        Ok(())
    }
}

#[tokio::test]
async fn malformed_inbound_frame_fails_the_connection() {
    let stub = StubBus::new();
    // A reply frame declaring a body far beyond the 128 MiB cap.
    let call = Message::method_call("/x", "M").serial(1).build().unwrap();
    let mut evil = dbus_client::frame::encode(&call).unwrap();
    evil[4..8].copy_from_slice(&(1u32 << 30).to_le_bytes());
    stub.program_reply(None, "Evil", StubReply::Raw(evil));

    let config = ConnectionConfig::builder()
        .health_check_enabled(false)
        .auto_reconnect_enabled(false)
        .build()
        .unwrap();
    let connection = connect(&stub, config).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    connection
        .add_handler("spy", Box::new(InboundSpy { seen: seen.clone() }))
        .await
        .unwrap();

    // Fire-and-forget so the failure surfaces through the state machine.
    connection
        .send(Message::method_call("/x", "Evil").build().unwrap())
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while connection.state() != ConnectionState::Failed {
        assert!(
            tokio::time::Instant::now() < deadline,
            "connection never failed"
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    // The malformed frame never reached the pipeline.
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn close_drains_pending_calls_with_closed() {
    let stub = StubBus::new();
    stub.program_reply(None, "Never", StubReply::Silence);
    let config = ConnectionConfig::builder()
        .health_check_enabled(false)
        .auto_reconnect_enabled(false)
        .build()
        .unwrap();
    let connection = connect(&stub, config).await;

    let pending = {
        let connection = connection.clone();
        tokio::spawn(async move {
            connection
                .send_request(Message::method_call("/x", "Never").build().unwrap())
                .await
        })
    };
    // Let the request reach the engine before closing.
    stub.wait_for_messages(2).await;

    connection.close().await.unwrap();
    assert!(matches!(pending.await.unwrap(), Err(Error::Closed)));
    assert_eq!(connection.state(), ConnectionState::Disconnected);

    // close() is idempotent.
    connection.close().await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn requests_against_a_closed_connection_are_rejected() {
    let stub = StubBus::new();
    let config = ConnectionConfig::builder()
        .health_check_enabled(false)
        .auto_reconnect_enabled(false)
        .build()
        .unwrap();
    let connection = connect(&stub, config).await;
    connection.close().await.unwrap();

    let err = connection
        .send_request(Message::method_call("/x", "M").build().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotActive));
}

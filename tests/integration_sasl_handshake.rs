//! Authentication flows against the scripted stub: EXTERNAL happy path,
//! REJECTED fallback into DBUS_COOKIE_SHA1, and exhaustion.

use dbus_client::sasl::cookie::CookieKeyring;
use dbus_client::sasl::{Authenticator, Mechanism};
use dbus_client::testing::{StubBus, StubCookie};
use dbus_client::{Connection, ConnectionConfig, ConnectionEvent, ConnectionState, Error};

fn quiet_config() -> ConnectionConfig {
    ConnectionConfig::builder()
        .health_check_enabled(false)
        .auto_reconnect_enabled(false)
        .build()
        .unwrap()
}

fn drain_state_changes(
    rx: &mut tokio::sync::broadcast::Receiver<ConnectionEvent>,
) -> Vec<(ConnectionState, ConnectionState)> {
    let mut changes = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let ConnectionEvent::StateChanged { old, new } = event {
            changes.push((old, new));
        }
    }
    changes
}

#[tokio::test]
async fn external_happy_path_acquires_bus_name() {
    let stub = StubBus::new().with_bus_name(":1.42").with_guid("1234deadbeef");
    let connection = Connection::builder()
        .connector(stub.connector())
        .config(quiet_config())
        .authenticator(Authenticator::new().with_identity("1000"))
        .build()
        .unwrap();
    let mut events = connection.subscribe_events();

    connection.connect().await.unwrap();

    assert_eq!(connection.state(), ConnectionState::Connected);
    assert_eq!(connection.assigned_bus_name().as_deref(), Some(":1.42"));
    assert_eq!(connection.server_guid().as_deref(), Some("1234deadbeef"));

    // State trace: disconnected → connecting → authenticating → connected.
    let changes = drain_state_changes(&mut events);
    assert_eq!(
        changes,
        vec![
            (ConnectionState::Disconnected, ConnectionState::Connecting),
            (ConnectionState::Connecting, ConnectionState::Authenticating),
            (ConnectionState::Authenticating, ConnectionState::Connected),
        ]
    );

    // The first framed message is the mandatory Hello.
    let received = stub.received();
    assert_eq!(received[0].member(), Some("Hello"));
    assert_eq!(received[0].destination(), Some("org.freedesktop.DBus"));
    assert_eq!(received[0].interface(), Some("org.freedesktop.DBus"));

    connection.close().await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}

#[cfg(unix)]
#[tokio::test]
async fn rejected_falls_back_to_cookie_sha1() {
    use std::os::unix::fs::PermissionsExt;

    // Keyring fixture the client will read, private to the user.
    let tmp = tempfile::tempdir().unwrap();
    let keyring_dir = tmp.path().join("keyrings");
    std::fs::create_dir(&keyring_dir).unwrap();
    std::fs::write(
        keyring_dir.join("org_freedesktop_general"),
        "21 1700000000 5f7ac0ffee\n",
    )
    .unwrap();
    std::fs::set_permissions(&keyring_dir, std::fs::Permissions::from_mode(0o700)).unwrap();

    // The stub rejects EXTERNAL and offers only the cookie mechanism.
    let stub = StubBus::new().accept_mechanisms(&[]).with_cookie(StubCookie {
        context: "org_freedesktop_general".into(),
        id: "21".into(),
        value: "5f7ac0ffee".into(),
        server_challenge: "a1b2c3d4".into(),
    });

    let connection = Connection::builder()
        .connector(stub.connector())
        .config(quiet_config())
        .authenticator(
            Authenticator::new()
                .with_identity("1000")
                .with_keyring(CookieKeyring::at(&keyring_dir)),
        )
        .build()
        .unwrap();

    connection.connect().await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Connected);
    assert_eq!(connection.assigned_bus_name().as_deref(), Some(":1.42"));

    connection.close().await.unwrap();
}

#[tokio::test]
async fn exhausted_mechanisms_fail_the_connect() {
    // Stub accepts nothing; the client has no cookie material either.
    let stub = StubBus::new().accept_mechanisms(&[]);
    let connection = Connection::builder()
        .connector(stub.connector())
        .config(quiet_config())
        .authenticator(
            Authenticator::new()
                .with_identity("1000")
                .with_mechanisms(vec![Mechanism::External, Mechanism::Anonymous]),
        )
        .build()
        .unwrap();

    let err = connection.connect().await.unwrap_err();
    assert!(matches!(err, Error::SaslRejected { .. }));
    assert_eq!(connection.state(), ConnectionState::Failed);
}

#[tokio::test]
async fn second_connect_while_connected_is_rejected() {
    let stub = StubBus::new();
    let connection = Connection::builder()
        .connector(stub.connector())
        .config(quiet_config())
        .build()
        .unwrap();

    connection.connect().await.unwrap();
    assert!(matches!(
        connection.connect().await,
        Err(Error::AlreadyConnected)
    ));
    connection.close().await.unwrap();
}

#[tokio::test]
async fn connect_after_close_works_again() {
    let stub = StubBus::new();
    let connection = Connection::builder()
        .connector(stub.connector())
        .config(quiet_config())
        .build()
        .unwrap();

    connection.connect().await.unwrap();
    connection.close().await.unwrap();
    connection.connect().await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Connected);
    assert_eq!(stub.connections_served(), 2);
    connection.close().await.unwrap();
}

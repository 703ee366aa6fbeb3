//! # Health Monitoring
//!
//! A dedicated timer, independent of user traffic, probes the peer with
//! `Ping` on `org.freedesktop.DBus.Peer` every `health_check_interval`.
//! One failed probe is tolerated; two consecutive failures move the
//! connection to `unhealthy` (requests still flow), and the next success
//! moves it back to `connected`. Socket-level failures are not handled
//! here; the engine observes those directly.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::connection::engine::Command;
use crate::connection::{ConnectionInner, ConnectionState};
use crate::error::{Error, Result};
use crate::events::ConnectionEvent;
use crate::message::Message;

/// Consecutive probe failures that mark the connection unhealthy.
const FAILURE_THRESHOLD: u32 = 2;

/// One liveness probe, bounded by `health_check_timeout`.
pub(crate) async fn probe(inner: &Arc<ConnectionInner>) -> Result<()> {
    let cmd_tx = inner.command_channel()?;
    let ping = Message::method_call("/", "Ping")
        .interface("org.freedesktop.DBus.Peer")
        .serial(inner.serials.next())
        .build()?;
    let (reply_tx, reply_rx) = oneshot::channel();
    cmd_tx
        .send(Command::SendRequest {
            message: ping,
            reply: reply_tx,
        })
        .map_err(|_| Error::NotActive)?;
    match tokio::time::timeout(inner.config.health_check_timeout, reply_rx).await {
        Ok(Ok(Ok(_reply))) => Ok(()),
        Ok(Ok(Err(error))) => Err(error),
        Ok(Err(_)) => Err(Error::Closed),
        Err(_) => Err(Error::Timeout),
    }
}

/// Start the periodic monitor; the task is aborted when the session it
/// belongs to is torn down.
pub(crate) fn spawn(inner: Arc<ConnectionInner>) -> JoinHandle<()> {
    tokio::spawn(run(inner))
}

async fn run(inner: Arc<ConnectionInner>) {
    let mut interval = tokio::time::interval(inner.config.health_check_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; the probe cycle starts one full
    // interval after activation.
    interval.tick().await;

    let mut consecutive_failures = 0u32;
    loop {
        interval.tick().await;
        match probe(&inner).await {
            Ok(()) => {
                consecutive_failures = 0;
                inner.events.emit(ConnectionEvent::HealthCheckSuccess);
                if inner.state() == ConnectionState::Unhealthy {
                    debug!("health restored");
                    inner.set_state(ConnectionState::Connected);
                }
            }
            Err(error) => {
                consecutive_failures += 1;
                warn!(%error, consecutive_failures, "health probe failed");
                inner.events.emit(ConnectionEvent::HealthCheckFailure {
                    cause: error.to_string(),
                });
                if consecutive_failures >= FAILURE_THRESHOLD
                    && inner.state() == ConnectionState::Connected
                {
                    inner.set_state(ConnectionState::Unhealthy);
                }
            }
        }
    }
}

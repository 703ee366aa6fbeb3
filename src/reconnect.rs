//! # Reconnect Controller
//!
//! Drives recovery after a connection drop: exponential backoff between
//! attempts (`min(max_delay, initial_delay * multiplier^n)`), an attempt
//! counter surfaced on the event bus, and a hard stop into `failed` when
//! the configured attempt budget is spent. Each attempt re-runs the full
//! establishment (socket, SASL, Hello) through the circuit breaker.
//!
//! `cancel_reconnection()` stops the pending timer and parks the
//! connection in `failed`; `reset_reconnection_state()` zeroes the
//! counter.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::connection::{ConnectionInner, ConnectionState};
use crate::error::Error;
use crate::events::ConnectionEvent;

/// Delay before attempt `attempt_index` (zero-based).
pub(crate) fn backoff_delay(config: &ConnectionConfig, attempt_index: u32) -> Duration {
    let initial = config.reconnect_initial_delay.as_secs_f64();
    let cap = config.reconnect_max_delay.as_secs_f64();
    // Exponent clamp keeps powi finite long before the cap applies.
    let factor = config
        .reconnect_backoff_multiplier
        .powi(attempt_index.min(64) as i32);
    Duration::from_secs_f64((initial * factor).min(cap))
}

/// Start the reconnect loop for a lost connection. The cancel handle is
/// parked on the connection so `cancel_reconnection()` can stop it.
pub(crate) fn spawn(inner: Arc<ConnectionInner>) -> JoinHandle<()> {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    *inner
        .reconnect_cancel
        .lock()
        .expect("reconnect cancel lock") = Some(cancel_tx);
    tokio::spawn(run(inner, cancel_rx))
}

async fn run(inner: Arc<ConnectionInner>, mut cancel_rx: watch::Receiver<bool>) {
    loop {
        let attempt_index = inner.reconnect_attempts.load(Ordering::SeqCst);
        let delay = backoff_delay(&inner.config, attempt_index);
        debug!(?delay, attempt_index, "reconnect backoff");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel_rx.changed() => {
                info!("reconnection cancelled");
                // close() also cancels; it owns the state in that case.
                if inner.state() == ConnectionState::Reconnecting && !inner.is_closing() {
                    inner.set_state(ConnectionState::Failed);
                }
                return;
            }
        }

        let attempt = inner.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        inner
            .events
            .emit(ConnectionEvent::ReconnectionAttempt { attempt });

        let result = match inner.circuit.check() {
            Ok(()) => inner.establish(true).await,
            Err(error) => Err(error),
        };
        match result {
            Ok(()) => {
                inner.circuit.record_success();
                inner.reconnect_attempts.store(0, Ordering::SeqCst);
                inner.events.emit(ConnectionEvent::ReconnectionSuccess);
                clear_cancel(&inner);
                info!("reconnected");
                return;
            }
            Err(error) => {
                if !matches!(error, Error::CircuitOpen) {
                    inner.circuit.record_failure();
                }
                warn!(%error, attempt, "reconnection attempt failed");
                inner.events.emit(ConnectionEvent::ReconnectionFailure {
                    cause: error.to_string(),
                });
                let max = inner.config.max_reconnect_attempts;
                if max != 0 && attempt >= max {
                    inner.events.emit(ConnectionEvent::ReconnectionExhausted);
                    inner.set_state(ConnectionState::Failed);
                    clear_cancel(&inner);
                    return;
                }
            }
        }
    }
}

fn clear_cancel(inner: &ConnectionInner) {
    *inner
        .reconnect_cancel
        .lock()
        .expect("reconnect cancel lock") = None;
}

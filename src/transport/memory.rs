//! In-process byte pair.
//!
//! A loopback transport for tests and the stub bus: both ends implement the
//! same stream interface as the socket transports, so the whole engine can
//! run against a scripted peer without touching the network.

use tokio::io::DuplexStream;

/// Default buffer capacity of a loopback pair.
pub const DEFAULT_CAPACITY: usize = 256 * 1024;

/// Create a connected pair of in-memory streams.
pub fn pair() -> (DuplexStream, DuplexStream) {
    tokio::io::duplex(DEFAULT_CAPACITY)
}

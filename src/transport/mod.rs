//! # Byte-Stream Transports
//!
//! The connection engine is written against a plain byte stream: reliable,
//! ordered, full-duplex, with a close signal. This module provides the two
//! socket shapes a bus address can name (Unix domain, TCP), an in-process
//! duplex pair for tests, and the [`Connector`] seam through which the
//! engine obtains a fresh stream for every connect or reconnect attempt.
//!
//! No framing is assumed at this layer; SASL and the frame codec run on
//! top of whatever stream the connector yields.

pub mod memory;
pub mod tcp;
#[cfg(unix)]
pub mod unix;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::address::BusAddress;
use crate::error::Result;

/// Object-safe alias for the streams the engine drives.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// A boxed stream, as handed to the engine.
pub type BoxedByteStream = Box<dyn ByteStream>;

/// Produces a fresh byte stream per connection attempt.
///
/// Reconnection calls this again; implementations must not hand out a
/// stream that was already used.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<BoxedByteStream>;

    /// Human-readable endpoint description for logs.
    fn describe(&self) -> String;
}

/// Connector for a parsed bus address.
pub struct AddressConnector {
    address: BusAddress,
}

impl AddressConnector {
    pub fn new(address: BusAddress) -> Self {
        AddressConnector { address }
    }
}

#[async_trait]
impl Connector for AddressConnector {
    async fn connect(&self) -> Result<BoxedByteStream> {
        match &self.address {
            #[cfg(unix)]
            BusAddress::Unix { path } => {
                let stream = unix::connect(path).await?;
                Ok(Box::new(stream))
            }
            #[cfg(not(unix))]
            BusAddress::Unix { .. } => Err(crate::error::Error::Address(
                "unix transport is not available on this platform".into(),
            )),
            BusAddress::Tcp { host, port } => {
                let stream = tcp::connect(host, *port).await?;
                Ok(Box::new(stream))
            }
        }
    }

    fn describe(&self) -> String {
        self.address.to_string()
    }
}

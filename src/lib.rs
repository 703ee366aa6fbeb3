//! # D-Bus Client
//!
//! An asynchronous client-side D-Bus transport library built on Tokio.
//! It establishes a point-to-point connection to a message bus, runs the
//! SASL handshake, acquires a unique bus name via `Hello`, and then
//! exchanges framed binary messages with the peer.
//!
//! ## Layering
//!
//! - [`types`], [`signature`], [`codec`], [`frame`]: the pure wire layer —
//!   the sixteen-type data model, signature grammar, alignment-correct
//!   marshalling, and frame reassembly;
//! - [`sasl`], [`address`], [`transport`]: getting a byte stream up and
//!   authenticated;
//! - [`pipeline`]: the user-extensible chain of inbound/outbound handlers;
//! - [`connection`]: the lifecycle state machine, serial allocation,
//!   pending-call correlation, health monitoring, and reconnection;
//! - [`testing`]: an in-memory scripted bus for exercising all of the
//!   above without a daemon.
//!
//! ## A round trip
//!
//! ```no_run
//! use dbus_client::{BusAddress, Connection, Message};
//!
//! # async fn demo() -> dbus_client::Result<()> {
//! let connection = Connection::builder()
//!     .address(BusAddress::session()?)
//!     .build()?;
//! connection.connect().await?;
//!
//! let reply = connection
//!     .send_request(
//!         Message::method_call("/org/freedesktop/DBus", "ListNames")
//!             .interface("org.freedesktop.DBus")
//!             .destination("org.freedesktop.DBus")
//!             .build()?,
//!     )
//!     .await?;
//! println!("names: {:?}", reply.body());
//! connection.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod circuit;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod frame;
pub mod message;
pub mod names;
pub mod pipeline;
pub mod sasl;
pub mod signature;
pub mod testing;
pub mod transport;
pub mod types;

mod health;
mod reconnect;

pub use address::BusAddress;
pub use codec::Endianness;
pub use config::{ConnectionConfig, ConnectionConfigBuilder};
pub use connection::{Connection, ConnectionBuilder, ConnectionState};
pub use error::{Error, Result};
pub use events::{ConnectionEvent, EventBus};
pub use message::{Message, MessageBuilder, MessageFlags, MessageType};
pub use pipeline::{Handler, HandlerContext, Pipeline, UserEvent};
pub use signature::Signature;
pub use types::{Array, ObjectPath, Value};

/// The current version of the library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

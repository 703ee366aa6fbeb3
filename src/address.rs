//! # Bus Addresses
//!
//! Parsing for the standard D-Bus address syntax and the well-known
//! environment lookups. An address string is a `;`-separated list of
//! `transport:key=value,key=value` entries; the first entry naming a
//! transport this library supports wins.
//!
//! The session bus address comes from `DBUS_SESSION_BUS_ADDRESS`. The
//! system bus address comes from `DBUS_SYSTEM_BUS_ADDRESS`, falling back to
//! `unix:path=/var/run/dbus/system_bus_socket` when unset.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Error, Result};

/// The session bus environment variable.
pub const SESSION_BUS_ENV: &str = "DBUS_SESSION_BUS_ADDRESS";

/// The system bus environment variable.
pub const SYSTEM_BUS_ENV: &str = "DBUS_SYSTEM_BUS_ADDRESS";

/// Fallback system bus address when the environment does not provide one.
pub const DEFAULT_SYSTEM_BUS_ADDRESS: &str = "unix:path=/var/run/dbus/system_bus_socket";

/// A parsed, connectable bus endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusAddress {
    /// A filesystem Unix-domain endpoint.
    Unix { path: PathBuf },
    /// A TCP endpoint.
    Tcp { host: String, port: u16 },
}

impl BusAddress {
    /// The session bus, from the environment.
    pub fn session() -> Result<Self> {
        match std::env::var(SESSION_BUS_ENV) {
            Ok(value) => value.parse(),
            Err(_) => Err(Error::Address(format!("{SESSION_BUS_ENV} is not set"))),
        }
    }

    /// The system bus, from the environment or the well-known default.
    pub fn system() -> Result<Self> {
        match std::env::var(SYSTEM_BUS_ENV) {
            Ok(value) => value.parse(),
            Err(_) => DEFAULT_SYSTEM_BUS_ADDRESS.parse(),
        }
    }

    fn parse_entry(entry: &str) -> Result<Option<Self>> {
        let (transport, rest) = entry
            .split_once(':')
            .ok_or_else(|| Error::Address(format!("missing transport prefix in {entry:?}")))?;

        let mut pairs = Vec::new();
        if !rest.is_empty() {
            for pair in rest.split(',') {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| Error::Address(format!("malformed key/value {pair:?}")))?;
                pairs.push((key, value));
            }
        }
        let get = |key: &str| pairs.iter().find(|(k, _)| *k == key).map(|(_, v)| *v);

        match transport {
            "unix" => {
                let path = get("path")
                    .ok_or_else(|| Error::Address("unix address needs a path key".into()))?;
                Ok(Some(BusAddress::Unix {
                    path: PathBuf::from(path),
                }))
            }
            "tcp" => {
                let host = get("host")
                    .ok_or_else(|| Error::Address("tcp address needs a host key".into()))?;
                let port = get("port")
                    .ok_or_else(|| Error::Address("tcp address needs a port key".into()))?;
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::Address(format!("invalid port {port:?}")))?;
                Ok(Some(BusAddress::Tcp {
                    host: host.to_owned(),
                    port,
                }))
            }
            // Entries for transports we do not speak are skipped so that
            // fallback lists like "unixexec:...;unix:path=..." still work.
            _ => Ok(None),
        }
    }
}

impl FromStr for BusAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::Address("empty address".into()));
        }
        let mut last_err = None;
        for entry in s.split(';').filter(|e| !e.is_empty()) {
            match Self::parse_entry(entry) {
                Ok(Some(address)) => return Ok(address),
                Ok(None) => {}
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err
            .unwrap_or_else(|| Error::Address(format!("no supported transport in {s:?}"))))
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusAddress::Unix { path } => write!(f, "unix:path={}", path.display()),
            BusAddress::Tcp { host, port } => write!(f, "tcp:host={host},port={port}"),
        }
    }
}

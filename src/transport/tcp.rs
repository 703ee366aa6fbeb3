//! TCP socket transport.

use tokio::net::TcpStream;
use tracing::debug;

use crate::error::Result;

/// Connect to a host/port endpoint.
///
/// Nagle's algorithm is disabled: bus traffic is dominated by small
/// request/reply frames where coalescing only adds latency.
pub async fn connect(host: &str, port: u16) -> Result<TcpStream> {
    debug!(host, port, "connecting tcp socket");
    let stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;
    debug!(host, port, "tcp socket connected");
    Ok(stream)
}

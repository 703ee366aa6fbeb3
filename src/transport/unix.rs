//! Unix domain socket transport.

use std::path::Path;

use tokio::net::UnixStream;
use tracing::debug;

use crate::error::Result;

/// Connect to a filesystem socket endpoint.
pub async fn connect(path: &Path) -> Result<UnixStream> {
    debug!(path = %path.display(), "connecting unix domain socket");
    let stream = UnixStream::connect(path).await?;
    debug!(path = %path.display(), "unix domain socket connected");
    Ok(stream)
}

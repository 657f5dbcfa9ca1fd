//! Timeout constants and helpers shared by the connection engine.

use std::future::Future;
use std::time::Duration;

use crate::error::{ProtocolError, Result};

/// Receive timeout and default request/response timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Minimum delay between two keepalive pings
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Bound on flushing queued packets during a graceful close
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Grace period a server gives its connections when it shuts down
pub const SERVER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for establishing a TCP connection
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay before an unanswered type-sync request is re-sent over UDP
pub const SYNC_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Run `fut`, failing with [`ProtocolError::Timeout`] once `limit` elapses
pub async fn with_timeout_error<F, T>(fut: F, limit: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}

//! # Timeouts
//!
//! Default deadlines and a helper that maps an elapsed deadline to
//! [`ProtocolError::Timeout`].

use std::future::Future;
use std::time::Duration;

use crate::error::{ProtocolError, Result};

/// Idle read deadline for stream sessions and the datagram socket
pub const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// How long shutdown waits for in-flight handlers
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// QUIC connection idle timeout
pub const QUIC_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// QUIC keep-alive period
pub const QUIC_KEEP_ALIVE: Duration = Duration::from_secs(15);

/// Deadline for completing a QUIC or TLS handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Await `fut`, failing with [`ProtocolError::Timeout`] once `duration` elapses.
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timeout_elapses() {
        let result: Result<()> = with_timeout_error(
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(ProtocolError::Timeout)));
    }

    #[tokio::test]
    async fn test_inner_error_passes_through() {
        let result: Result<()> =
            with_timeout_error(async { Err(ProtocolError::ConnectionClosed) }, SHUTDOWN_GRACE)
                .await;
        assert!(matches!(result, Err(ProtocolError::ConnectionClosed)));
    }
}

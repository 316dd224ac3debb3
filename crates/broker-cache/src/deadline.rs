//! Optional deadlines around broker calls.

use std::future::Future;
use std::time::Duration;

use crate::error::{CacheError, TransportError};

/// Await `fut`, failing with `CacheError::Timeout` if `deadline` elapses first.
pub(crate) async fn with_deadline<T, F>(
    deadline: Option<Duration>,
    operation: &'static str,
    fut: F,
) -> Result<T, CacheError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    match deadline {
        None => Ok(fut.await?),
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(CacheError::Timeout {
                operation,
                elapsed: limit,
            }),
        },
    }
}

/// Await a disposal call, turning an elapsed deadline into a transport error
/// so it is tallied like any other failed close.
pub(crate) async fn close_within<F>(
    deadline: Option<Duration>,
    what: &str,
    fut: F,
) -> Result<(), TransportError>
where
    F: Future<Output = Result<(), TransportError>>,
{
    match deadline {
        None => fut.await,
        Some(limit) => tokio::time::timeout(limit, fut).await.unwrap_or_else(|_| {
            Err(TransportError::other(format!(
                "closing {} timed out after {:?}",
                what, limit
            )))
        }),
    }
}

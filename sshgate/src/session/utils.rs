//! Small helpers shared across the session actor modules, carried over from
//! the teacher's `ssh::utils` (the EAGAIN retry loop and the blocking-bridge).

use crate::error::GatewayError;
use std::time::Duration;

/// Retry an ssh2 call that may return `EAGAIN` under non-blocking mode.
/// ssh2's non-blocking session surfaces "would block" as a session-level
/// error code rather than `io::ErrorKind::WouldBlock`; this is the same
/// retry wrapper the teacher applies to every libssh2 call.
pub fn ssh2_retry<F, T>(mut f: F) -> Result<T, ssh2::Error>
where
    F: FnMut() -> Result<T, ssh2::Error>,
{
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) => {
                if e.code() == ssh2::ErrorCode::Session(-37) {
                    std::thread::sleep(Duration::from_millis(10));
                    continue;
                }
                return Err(e);
            }
        }
    }
}

/// Run a blocking ssh2 operation on the blocking thread pool so the async
/// Router never stalls waiting on libssh2. Every SFTP/exec/transport call in
/// this crate is wrapped this way, generalizing the teacher's
/// `execute_ssh_operation`.
pub async fn run_blocking<F, T>(operation: F) -> Result<T, GatewayError>
where
    F: FnOnce() -> Result<T, GatewayError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(operation)
        .await
        .map_err(|e| GatewayError::internal_src(format!("blocking task join error: {e}"), e))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssh2_retry_returns_first_success() {
        let mut calls = 0;
        let result = ssh2_retry(|| {
            calls += 1;
            Ok::<_, ssh2::Error>(42)
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn run_blocking_propagates_value() {
        let v = run_blocking(|| Ok::<_, GatewayError>(7)).await.unwrap();
        assert_eq!(v, 7);
    }
}

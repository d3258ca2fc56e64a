//! TCP liveness probes.

use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{SupervisorError, SupervisorResult};

/// Poll interval for [`wait_for_port`].
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Whether something accepts connections on `host:port` within `timeout`.
pub async fn is_port_open(host: &str, port: u16, timeout: Duration) -> bool {
    let addr = format!("{host}:{port}");
    match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!(%addr, error = %e, "port probe refused");
            false
        }
        Err(_) => {
            debug!(%addr, "port probe timed out");
            false
        }
    }
}

/// Poll until `host:port` accepts connections, giving up after `max_wait`.
pub async fn wait_for_port(
    host: &str,
    port: u16,
    max_wait: Duration,
    interval: Duration,
) -> SupervisorResult<()> {
    let started = Instant::now();
    loop {
        if is_port_open(host, port, PROBE_TIMEOUT).await {
            debug!(%host, port, waited_ms = started.elapsed().as_millis() as u64, "port is up");
            return Ok(());
        }
        if started.elapsed() >= max_wait {
            return Err(SupervisorError::PortTimeout {
                host: host.to_string(),
                port,
                waited_ms: started.elapsed().as_millis() as u64,
            });
        }
        tokio::time::sleep(interval.min(max_wait.saturating_sub(started.elapsed()))).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn open_and_closed_ports() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(is_port_open("127.0.0.1", port, Duration::from_millis(500)).await);
        drop(listener);
        assert!(!is_port_open("127.0.0.1", port, Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn wait_succeeds_once_listener_appears() {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let binder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            TcpListener::bind(("127.0.0.1", port)).await.unwrap()
        });
        wait_for_port("127.0.0.1", port, Duration::from_secs(5), Duration::from_millis(20))
            .await
            .unwrap();
        drop(binder.await.unwrap());
    }

    #[tokio::test]
    async fn wait_times_out_with_distinct_error() {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let err = wait_for_port("127.0.0.1", port, Duration::from_millis(100), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }
}

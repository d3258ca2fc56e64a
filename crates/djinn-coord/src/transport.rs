//! Minimal JSON-over-HTTP/1 request helper shared by the remote
//! coordination backend and the control-plane peer client.
//!
//! One connection per request, bounded end to end by a timeout.

use std::time::Duration;

use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },

    #[error("request to {addr} timed out after {}ms", .timeout.as_millis())]
    Timeout { addr: String, timeout: Duration },

    #[error("protocol error talking to {addr}: {reason}")]
    Protocol { addr: String, reason: String },
}

/// Send one request and collect the full response body.
pub async fn send(
    addr: &str,
    method: Method,
    path: &str,
    body: Vec<u8>,
    timeout: Duration,
) -> Result<(StatusCode, Bytes), TransportError> {
    let protocol = |reason: String| TransportError::Protocol {
        addr: addr.to_string(),
        reason,
    };

    let exchange = async {
        let stream = tokio::net::TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::Connect {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| protocol(e.to_string()))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method(method)
            .uri(path)
            .header("host", addr)
            .header("content-type", "application/json")
            .header("user-agent", "djinn/0.1")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| protocol(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| protocol(e.to_string()))?;
        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| protocol(e.to_string()))?
            .to_bytes();
        Ok((status, bytes))
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => {
            debug!(%addr, %path, "request timed out");
            Err(TransportError::Timeout {
                addr: addr.to_string(),
                timeout,
            })
        }
    }
}

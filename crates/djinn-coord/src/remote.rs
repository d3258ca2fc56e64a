//! RemoteBackend — talks to a `djinnd coordinator` over HTTP.
//!
//! Any transport failure is reported as a connection loss so the client's
//! reconnect loop takes over; the next call moves on to the next endpoint.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use http::Method;
use serde::de::DeserializeOwned;
use tracing::warn;

use djinn_core::BoxFuture;

use crate::backend::{CoordinationBackend, SessionId};
use crate::error::{CoordError, CoordResult};
use crate::op::{Op, OpReply, OpRequest, SessionOpened, Wire};
use crate::transport;

pub struct RemoteBackend {
    endpoints: Vec<String>,
    current: AtomicUsize,
    request_timeout: Duration,
}

impl RemoteBackend {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            current: AtomicUsize::new(0),
            request_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Vec<u8>,
    ) -> CoordResult<T> {
        if self.endpoints.is_empty() {
            return Err(CoordError::ConnectionLoss(
                "no coordination endpoints configured".to_string(),
            ));
        }
        let idx = self.current.load(Ordering::Relaxed) % self.endpoints.len();
        let addr = &self.endpoints[idx];

        match transport::send(addr, method, path, body, self.request_timeout).await {
            Ok((status, bytes)) => {
                let wire: Wire<T> = serde_json::from_slice(&bytes).map_err(|e| {
                    CoordError::System(format!("{addr} answered {status} with undecodable body: {e}"))
                })?;
                wire.into_result()
            }
            Err(e) => {
                warn!(%addr, error = %e, "coordination endpoint unreachable");
                self.current.fetch_add(1, Ordering::Relaxed);
                Err(CoordError::ConnectionLoss(e.to_string()))
            }
        }
    }
}

impl CoordinationBackend for RemoteBackend {
    fn open_session(&self) -> BoxFuture<'_, CoordResult<SessionId>> {
        Box::pin(async move {
            let opened: SessionOpened = self
                .call(Method::POST, "/coord/v1/sessions", Vec::new())
                .await?;
            Ok(opened.session)
        })
    }

    fn keepalive(&self, session: SessionId) -> BoxFuture<'_, CoordResult<()>> {
        Box::pin(async move {
            let path = format!("/coord/v1/sessions/{session}/keepalive");
            self.call(Method::POST, &path, Vec::new()).await
        })
    }

    fn close_session(&self, session: SessionId) -> BoxFuture<'_, CoordResult<()>> {
        Box::pin(async move {
            let path = format!("/coord/v1/sessions/{session}");
            self.call(Method::DELETE, &path, Vec::new()).await
        })
    }

    fn execute(&self, session: SessionId, op: Op) -> BoxFuture<'_, CoordResult<OpReply>> {
        Box::pin(async move {
            let body = serde_json::to_vec(&OpRequest { session, op })
                .map_err(|e| CoordError::Invalid(e.to_string()))?;
            self.call(Method::POST, "/coord/v1/ops", body).await
        })
    }
}

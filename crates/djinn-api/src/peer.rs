//! Calling other controllers.
//!
//! Same transport as [`crate::router`], one request per call, bounded by
//! the peer timeout. A slow or dead peer is reported, never retried.

use std::time::Duration;

use http::{Method, StatusCode};
use serde_json::{Value, json};
use tracing::{debug, warn};

use djinn_controller::{BoxFuture, ControllerError, ControllerResult, PeerNotifier};
use djinn_core::{DjinnConfig, Secret};
use djinn_coord::transport;
use djinn_state::Node;

use crate::error::{PeerError, PeerResult};
use crate::plane::Operation;
use crate::reply::{BAD_SECRET_MSG, OK};

#[derive(Debug, Clone)]
pub struct PeerClient {
    secret: Secret,
    port: u16,
    timeout: Duration,
}

impl PeerClient {
    pub fn new(secret: Secret, port: u16, timeout: Duration) -> Self {
        Self {
            secret,
            port,
            timeout,
        }
    }

    /// Peers listen on the same control port as this node.
    pub fn from_config(config: &DjinnConfig, secret: Secret) -> Self {
        Self::new(secret, config.control.port, config.control.peer_timeout())
    }

    /// Run `op` on `host` and return the raw reply.
    pub async fn call(&self, host: &str, op: Operation, mut args: Value) -> PeerResult<String> {
        if !args.is_object() {
            args = json!({});
        }
        args["secret"] = Value::String(self.secret.expose().to_string());
        let body = serde_json::to_vec(&args).map_err(|e| PeerError::Decode {
            node: host.to_string(),
            operation: op.to_string(),
            reason: e.to_string(),
        })?;

        let addr = format!("{host}:{}", self.port);
        let path = format!("/rpc/{op}");
        let (status, bytes) = transport::send(&addr, Method::POST, &path, body, self.timeout)
            .await
            .map_err(|e| {
                warn!(node = %host, operation = %op, error = %e, "peer unreachable");
                PeerError::Unreachable {
                    node: host.to_string(),
                    reason: e.to_string(),
                }
            })?;

        let reply = String::from_utf8_lossy(&bytes).into_owned();
        if status != StatusCode::OK {
            return Err(PeerError::Rejected {
                node: host.to_string(),
                operation: op.to_string(),
                reply,
            });
        }
        if reply == BAD_SECRET_MSG {
            return Err(PeerError::BadSecret {
                node: host.to_string(),
            });
        }
        debug!(node = %host, operation = %op, "peer call answered");
        Ok(reply)
    }

    pub async fn set_parameters(&self, host: &str, layout: &Value, options: &Value) -> PeerResult<()> {
        let args = json!({"layout": layout, "options": options});
        let reply = self.call(host, Operation::SetParameters, args).await?;
        expect_ok(host, Operation::SetParameters, reply)
    }

    pub async fn is_done_loading(&self, host: &str) -> PeerResult<bool> {
        let reply = self.call(host, Operation::IsDoneLoading, json!({})).await?;
        match reply.as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(PeerError::Rejected {
                node: host.to_string(),
                operation: Operation::IsDoneLoading.to_string(),
                reply,
            }),
        }
    }

    pub async fn get_role_info(&self, host: &str) -> PeerResult<Vec<Node>> {
        let reply = self.call(host, Operation::GetRoleInfo, json!({})).await?;
        serde_json::from_str(&reply).map_err(|e| PeerError::Decode {
            node: host.to_string(),
            operation: Operation::GetRoleInfo.to_string(),
            reason: e.to_string(),
        })
    }
}

fn expect_ok(host: &str, op: Operation, reply: String) -> PeerResult<()> {
    if reply == OK {
        Ok(())
    } else {
        Err(PeerError::Rejected {
            node: host.to_string(),
            operation: op.to_string(),
            reply,
        })
    }
}

impl PeerNotifier for PeerClient {
    fn push_parameters<'a>(
        &'a self,
        node: &'a Node,
        layout: &'a Value,
        options: &'a Value,
    ) -> BoxFuture<'a, ControllerResult<()>> {
        Box::pin(async move {
            self.set_parameters(&node.private_ip, layout, options)
                .await
                .map_err(|e| ControllerError::PeerUnreachable {
                    node: node.private_ip.clone(),
                    reason: e.to_string(),
                })
        })
    }
}

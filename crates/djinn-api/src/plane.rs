//! The secret-checked operations.
//!
//! Every call goes through [`ControlPlane::call`]: the secret is checked
//! before anything else is looked at, then the named arguments are
//! decoded, then the controller does the work.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use djinn_controller::Djinn;

use crate::reply::Reply;

macro_rules! operations {
    ($($variant:ident => $name:literal,)+) => {
        /// Every operation the control plane answers.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Operation {
            $($variant,)+
        }

        impl Operation {
            pub const ALL: &'static [Operation] = &[$(Operation::$variant,)+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Operation::$variant => $name,)+
                }
            }
        }

        impl FromStr for Operation {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(Operation::$variant),)+
                    other => Err(format!("unknown operation {other:?}")),
                }
            }
        }
    };
}

operations! {
    SetParameters => "set_parameters",
    GetRoleInfo => "get_role_info",
    GetAllPublicIps => "get_all_public_ips",
    Status => "status",
    IsDoneInitializing => "is_done_initializing",
    IsDoneLoading => "is_done_loading",
    GetDatabaseInformation => "get_database_information",
    GetProperty => "get_property",
    SetProperty => "set_property",
    StartApp => "start_app",
    StopApp => "stop_app",
    IsAppRunning => "is_app_running",
    RelocateApp => "relocate_app",
    AddRoutingForAppserver => "add_routing_for_appserver",
    RemoveAppserverFromHaproxy => "remove_appserver_from_haproxy",
    RequestScaling => "request_scaling",
    StartRolesOnNodes => "start_roles_on_nodes",
    RemoveRole => "remove_role",
    GetDeploymentId => "get_deployment_id",
    DeploymentIdExists => "deployment_id_exists",
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The control plane of one controller.
#[derive(Clone)]
pub struct ControlPlane {
    djinn: Arc<Djinn>,
}

impl ControlPlane {
    pub fn new(djinn: Arc<Djinn>) -> Self {
        Self { djinn }
    }

    pub fn djinn(&self) -> &Arc<Djinn> {
        &self.djinn
    }

    /// Run one operation. `args` is the JSON object of named arguments,
    /// `secret` among them. A body that is not an object carries no
    /// secret and is rejected as such.
    pub async fn call(&self, op: Operation, args: &Value) -> Reply {
        let secret = args
            .as_object()
            .and_then(|m| m.get("secret"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        if !self.djinn.secret().verify(secret) {
            warn!(operation = %op, "rejected call with a bad secret");
            return Reply::BadSecret;
        }
        let Some(args) = args.as_object() else {
            return Reply::BadSecret;
        };

        debug!(operation = %op, "control call");
        match self.dispatch(op, Args(args)).await {
            Ok(reply) | Err(reply) => reply,
        }
    }

    async fn dispatch(&self, op: Operation, args: Args<'_>) -> Result<Reply, Reply> {
        let djinn = &self.djinn;
        let reply = match op {
            Operation::SetParameters => {
                let layout = args.value("layout")?;
                let options = args.value("options")?;
                djinn.set_parameters(layout, options).await?;
                Reply::Ok
            }
            Operation::GetRoleInfo => Reply::json(&djinn.role_info().await),
            Operation::GetAllPublicIps => Reply::json(&djinn.public_ips().await),
            Operation::Status => Reply::Text(djinn.status().await),
            Operation::IsDoneInitializing => Reply::Bool(djinn.is_done_initializing()),
            Operation::IsDoneLoading => Reply::Bool(djinn.is_done_loading()),
            Operation::GetDatabaseInformation => Reply::json(&djinn.database_info().await?),
            Operation::GetProperty => {
                let pattern = Regex::new(args.str("property_regex")?).map_err(|_| Reply::BadInput)?;
                let matching: BTreeMap<String, String> = djinn
                    .properties()
                    .await?
                    .into_iter()
                    .filter(|(key, _)| pattern.is_match(key))
                    .collect();
                Reply::json(&matching)
            }
            Operation::SetProperty => {
                let key = args.str("property_name")?;
                let value = args.scalar("property_value")?;
                djinn.set_property(key, &value).await?;
                Reply::Ok
            }
            Operation::StartApp => {
                let app_id = args.str("app_id")?;
                let language = args.str("language")?;
                let threadsafe = args.bool_or("threadsafe", true)?;
                Reply::json(&djinn.start_app(app_id, language, threadsafe).await?)
            }
            Operation::StopApp => Reply::Bool(djinn.stop_app(args.str("app_id")?).await?),
            Operation::IsAppRunning => Reply::Bool(djinn.is_app_running(args.str("app_id")?).await?),
            Operation::RelocateApp => {
                let app_id = args.str("app_id")?;
                let http_port = args.port("http_port")?;
                let https_port = args.port("https_port")?;
                djinn.relocate_app(app_id, http_port, https_port).await?;
                Reply::Ok
            }
            Operation::AddRoutingForAppserver => {
                let (app_id, ip, port) = args.appserver()?;
                djinn.add_routing_for_appserver(app_id, ip, port).await?;
                Reply::Ok
            }
            Operation::RemoveAppserverFromHaproxy => {
                let (app_id, ip, port) = args.appserver()?;
                Reply::Bool(djinn.remove_appserver_from_haproxy(app_id, ip, port).await?)
            }
            Operation::RequestScaling => {
                let app_id = args.str("app_id")?;
                let direction = args.str("direction")?;
                Reply::Text(djinn.request_scaling(app_id, direction).await?)
            }
            Operation::StartRolesOnNodes => {
                let roles_to_nodes = args.roles_to_nodes("roles_to_nodes")?;
                djinn.start_roles_on_nodes(&roles_to_nodes).await?;
                Reply::Ok
            }
            Operation::RemoveRole => {
                let node_ip = args.str("node_ip")?;
                let role = args.str("role")?;
                djinn.remove_role(node_ip, role).await?;
                Reply::Ok
            }
            Operation::GetDeploymentId => match djinn.deployment_id().await? {
                Some(id) => Reply::Text(id),
                None => Reply::KeyNotFound,
            },
            Operation::DeploymentIdExists => Reply::Bool(djinn.deployment_id().await?.is_some()),
        };
        Ok(reply)
    }
}

// ── Argument decoding ──────────────────────────────────────────────

/// Named arguments. Every accessor fails with `BAD_INPUT`.
#[derive(Clone, Copy)]
struct Args<'a>(&'a Map<String, Value>);

impl<'a> Args<'a> {
    fn value(&self, key: &str) -> Result<&'a Value, Reply> {
        self.0.get(key).ok_or(Reply::BadInput)
    }

    fn str(&self, key: &str) -> Result<&'a str, Reply> {
        self.value(key)?.as_str().ok_or(Reply::BadInput)
    }

    /// A string, number or bool, as text.
    fn scalar(&self, key: &str) -> Result<String, Reply> {
        match self.value(key)? {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            _ => Err(Reply::BadInput),
        }
    }

    fn bool_or(&self, key: &str, default: bool) -> Result<bool, Reply> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(Value::String(s)) => s.parse().map_err(|_| Reply::BadInput),
            Some(_) => Err(Reply::BadInput),
        }
    }

    /// A port, as a number or a numeric string.
    fn port(&self, key: &str) -> Result<u16, Reply> {
        match self.value(key)? {
            Value::Number(n) => n
                .as_u64()
                .and_then(|p| u16::try_from(p).ok())
                .ok_or(Reply::BadInput),
            Value::String(s) => s.trim().parse().map_err(|_| Reply::BadInput),
            _ => Err(Reply::BadInput),
        }
    }

    fn appserver(&self) -> Result<(&'a str, &'a str, u16), Reply> {
        Ok((self.str("app_id")?, self.str("ip")?, self.port("port")?))
    }

    /// Role name to node addresses, as an object or a JSON-encoded string.
    fn roles_to_nodes(&self, key: &str) -> Result<BTreeMap<String, Vec<String>>, Reply> {
        let value = match self.value(key)? {
            Value::String(text) => serde_json::from_str(text).map_err(|_| Reply::BadInput)?,
            other => other.clone(),
        };
        serde_json::from_value(value).map_err(|_| Reply::BadInput)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::testutil::{SECRET, layout_one, node, options};

    fn with_secret(mut args: Value) -> Value {
        args["secret"] = json!(SECRET);
        args
    }

    #[test]
    fn operation_names_round_trip() {
        assert_eq!(Operation::ALL.len(), 20);
        for op in Operation::ALL {
            assert_eq!(op.as_str().parse::<Operation>().unwrap(), *op);
        }
        assert!("rm_rf".parse::<Operation>().is_err());
    }

    #[tokio::test]
    async fn bad_secret_is_checked_first() {
        let (_dir, plane) = node("10.0.0.1");
        // Missing arguments would be bad input, but the secret wins.
        let reply = plane.call(Operation::RelocateApp, &json!({"secret": "nope"})).await;
        assert_eq!(reply, Reply::BadSecret);
        assert_eq!(plane.call(Operation::Status, &json!({})).await, Reply::BadSecret);
        assert_eq!(plane.call(Operation::Status, &json!("x")).await, Reply::BadSecret);
    }

    #[tokio::test]
    async fn missing_or_mistyped_arguments_are_bad_input() {
        let (_dir, plane) = node("10.0.0.1");
        let reply = plane
            .call(Operation::SetParameters, &with_secret(json!({"layout": layout_one()})))
            .await;
        assert_eq!(reply, Reply::BadInput);

        let reply = plane
            .call(
                Operation::RelocateApp,
                &with_secret(json!({"app_id": "myapp", "http_port": "eighty", "https_port": 4380})),
            )
            .await;
        assert_eq!(reply, Reply::BadInput);

        let reply = plane
            .call(Operation::StopApp, &with_secret(json!({"app_id": 7})))
            .await;
        assert_eq!(reply, Reply::BadInput);
    }

    #[tokio::test]
    async fn queries_before_parameters() {
        let (_dir, plane) = node("10.0.0.1");
        let secret = with_secret(json!({}));
        assert_eq!(plane.call(Operation::GetRoleInfo, &secret).await, Reply::Json(json!([])));
        assert_eq!(plane.call(Operation::IsDoneInitializing, &secret).await, Reply::Bool(false));
        assert_eq!(plane.call(Operation::GetDatabaseInformation, &secret).await, Reply::NotReady);
        assert_eq!(plane.call(Operation::DeploymentIdExists, &secret).await, Reply::Bool(false));
        assert_eq!(plane.call(Operation::GetDeploymentId, &secret).await, Reply::KeyNotFound);
    }

    #[tokio::test]
    async fn set_parameters_then_query() {
        let (_dir, plane) = node("10.0.0.1");
        let reply = plane
            .call(
                Operation::SetParameters,
                &with_secret(json!({"layout": layout_one(), "options": options()})),
            )
            .await;
        assert_eq!(reply, Reply::Ok);

        let secret = with_secret(json!({}));
        let Reply::Json(info) = plane.call(Operation::GetRoleInfo, &secret).await else {
            panic!("expected json");
        };
        assert_eq!(
            info[0]["jobs"],
            json!(["database-master", "load-balancer", "application-host"])
        );
        assert_eq!(
            plane.call(Operation::GetAllPublicIps, &secret).await,
            Reply::Json(json!(["203.0.113.1"]))
        );
        assert_eq!(plane.call(Operation::IsDoneInitializing, &secret).await, Reply::Bool(true));
        assert_eq!(plane.call(Operation::DeploymentIdExists, &secret).await, Reply::Bool(true));
        let Reply::Text(id) = plane.call(Operation::GetDeploymentId, &secret).await else {
            panic!("expected an id");
        };
        assert_eq!(id.len(), 32);
        let Reply::Json(db) = plane.call(Operation::GetDatabaseInformation, &secret).await else {
            panic!("expected json");
        };
        assert_eq!(db["table"], "cassandra");
        assert_eq!(db["master"], "10.0.0.1");
    }

    #[tokio::test]
    async fn properties_by_regex_and_allow_list() {
        let (_dir, plane) = node("10.0.0.1");
        plane
            .call(
                Operation::SetParameters,
                &with_secret(json!({"layout": layout_one(), "options": options()})),
            )
            .await;

        let Reply::Json(props) = plane
            .call(Operation::GetProperty, &with_secret(json!({"property_regex": "machines"})))
            .await
        else {
            panic!("expected json");
        };
        assert_eq!(props["max_machines"], "3");
        assert!(props.get("autoscale").is_none());

        assert_eq!(
            plane
                .call(Operation::GetProperty, &with_secret(json!({"property_regex": "("})))
                .await,
            Reply::BadInput
        );

        let set = |name: &str, value: Value| {
            with_secret(json!({"property_name": name, "property_value": value}))
        };
        assert_eq!(plane.call(Operation::SetProperty, &set("max_machines", json!(5))).await, Reply::Ok);
        assert_eq!(
            plane.call(Operation::SetProperty, &set("flux_capacitor", json!("1"))).await,
            Reply::KeyNotFound
        );
        assert_eq!(
            plane.call(Operation::SetProperty, &set("autoscale", json!("maybe"))).await,
            Reply::BadInput
        );
        let Reply::Json(props) = plane
            .call(Operation::GetProperty, &with_secret(json!({"property_regex": "^max_machines$"})))
            .await
        else {
            panic!("expected json");
        };
        assert_eq!(props, json!({"max_machines": "5"}));
    }

    #[tokio::test]
    async fn app_lifecycle_through_the_plane() {
        let (_dir, plane) = node("10.0.0.1");
        plane
            .call(
                Operation::SetParameters,
                &with_secret(json!({"layout": layout_one(), "options": options()})),
            )
            .await;

        let Reply::Json(record) = plane
            .call(
                Operation::StartApp,
                &with_secret(json!({"app_id": "guestbook", "language": "python27"})),
            )
            .await
        else {
            panic!("expected the app record");
        };
        assert_eq!(record["app_id"], "guestbook");

        let app = with_secret(json!({"app_id": "guestbook"}));
        assert_eq!(plane.call(Operation::IsAppRunning, &app).await, Reply::Bool(true));

        let Reply::Text(id) = plane
            .call(
                Operation::RequestScaling,
                &with_secret(json!({"app_id": "guestbook", "direction": "up"})),
            )
            .await
        else {
            panic!("expected a request id");
        };
        assert!(!id.is_empty());

        let reply = plane
            .call(
                Operation::RelocateApp,
                &with_secret(json!({"app_id": "guestbook", "http_port": "8081", "https_port": 4381})),
            )
            .await;
        assert_eq!(reply, Reply::Ok);

        assert_eq!(plane.call(Operation::StopApp, &app).await, Reply::Bool(true));
        assert_eq!(plane.call(Operation::StopApp, &app).await, Reply::Bool(false));
        assert_eq!(plane.call(Operation::IsAppRunning, &app).await, Reply::Bool(false));
    }

    #[tokio::test]
    async fn roles_from_an_encoded_map() {
        let (_dir, plane) = node("10.0.0.1");
        plane
            .call(
                Operation::SetParameters,
                &with_secret(json!({"layout": layout_one(), "options": options()})),
            )
            .await;

        let reply = plane
            .call(
                Operation::StartRolesOnNodes,
                &with_secret(json!({"roles_to_nodes": r#"{"application-host": ["10.0.0.5"]}"#})),
            )
            .await;
        assert_eq!(reply, Reply::Ok);
        let reply = plane
            .call(
                Operation::StartRolesOnNodes,
                &with_secret(json!({"roles_to_nodes": ["10.0.0.5"]})),
            )
            .await;
        assert_eq!(reply, Reply::BadInput);

        let reply = plane
            .call(
                Operation::RemoveRole,
                &with_secret(json!({"node_ip": "10.0.0.5", "role": "application-host"})),
            )
            .await;
        assert_eq!(reply, Reply::Ok);
        let reply = plane
            .call(
                Operation::RemoveRole,
                &with_secret(json!({"node_ip": "10.0.0.99", "role": "application-host"})),
            )
            .await;
        assert!(matches!(reply, Reply::Error(_)));
    }
}

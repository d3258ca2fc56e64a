//! Where the controller keeps its state in the coordination store.

use crate::client::join;

pub const ROOT: &str = "/appcontroller";

pub fn ips_path() -> String {
    join(ROOT, "ips")
}

pub fn nodes_root() -> String {
    join(ROOT, "nodes")
}

/// Per-node placeholder; parent of `live`, `job_data` and `done_loading`.
pub fn node_path(ip: &str) -> String {
    join(&nodes_root(), ip)
}

pub fn live_path(ip: &str) -> String {
    join(&node_path(ip), "live")
}

pub fn job_data_path(ip: &str) -> String {
    join(&node_path(ip), "job_data")
}

pub fn done_loading_path(ip: &str) -> String {
    join(&node_path(ip), "done_loading")
}

pub fn params_path() -> String {
    join(ROOT, "params")
}

pub fn apps_root() -> String {
    join(ROOT, "apps")
}

pub fn app_path(app_id: &str) -> String {
    join(&apps_root(), app_id)
}

pub fn scale_root() -> String {
    join(ROOT, "scale")
}

pub fn scale_app_path(app_id: &str) -> String {
    join(&scale_root(), app_id)
}

pub fn scale_request_path(app_id: &str, request_id: &str) -> String {
    join(&scale_app_path(app_id), request_id)
}

pub fn deployment_id_path() -> String {
    join(ROOT, "deployment_id")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_under_root() {
        assert_eq!(ips_path(), "/appcontroller/ips");
        assert_eq!(live_path("10.0.0.1"), "/appcontroller/nodes/10.0.0.1/live");
        assert_eq!(
            scale_request_path("guestbook", "r1"),
            "/appcontroller/scale/guestbook/r1"
        );
        assert_eq!(crate::lock::DEFAULT_LOCK_PATH, join(ROOT, "lock"));
    }
}

//! Nginx site files, one per application.
//!
//! Nginx reads `sites-enabled` itself, so each site is a standalone file
//! with its own upstream pointing at the application's HAProxy listener.

use std::path::PathBuf;

/// Public front end of one application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NginxSite {
    pub app_id: String,
    /// Load balancer address where the app's HAProxy block listens.
    pub upstream_host: String,
    pub upstream_port: u16,
    pub http_port: u16,
    pub https_port: u16,
    pub ssl_certificate: PathBuf,
    pub ssl_certificate_key: PathBuf,
}

impl NginxSite {
    pub fn file_name(&self) -> String {
        site_file_name(&self.app_id)
    }

    pub fn render(&self) -> String {
        let upstream = format!("gae_{}", self.app_id);
        let location = location_block(&upstream);
        let mut out = String::new();
        out.push_str(&format!("upstream {upstream} {{\n"));
        out.push_str(&format!(
            "    server {}:{};\n",
            self.upstream_host, self.upstream_port
        ));
        out.push_str("    keepalive 16;\n");
        out.push_str("}\n\n");

        out.push_str("server {\n");
        out.push_str(&format!("    listen {};\n", self.http_port));
        out.push_str(&format!("    server_name {}-http;\n", self.app_id));
        out.push_str(&location);
        out.push_str("}\n\n");

        out.push_str("server {\n");
        out.push_str(&format!("    listen {} ssl;\n", self.https_port));
        out.push_str(&format!("    server_name {}-https;\n", self.app_id));
        out.push_str(&format!(
            "    ssl_certificate {};\n",
            self.ssl_certificate.display()
        ));
        out.push_str(&format!(
            "    ssl_certificate_key {};\n",
            self.ssl_certificate_key.display()
        ));
        out.push_str("    ssl_protocols TLSv1.2 TLSv1.3;\n");
        out.push_str(&location);
        out.push_str("}\n");
        out
    }
}

pub fn site_file_name(app_id: &str) -> String {
    format!("appscale-{app_id}.conf")
}

fn location_block(upstream: &str) -> String {
    let mut out = String::from("    location / {\n");
    for line in [
        format!("proxy_pass http://{upstream};"),
        "proxy_http_version 1.1;".to_string(),
        "proxy_set_header Connection \"\";".to_string(),
        "proxy_set_header Host $host:$server_port;".to_string(),
        "proxy_set_header X-Real-IP $remote_addr;".to_string(),
        "proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;".to_string(),
        "proxy_set_header X-Forwarded-Proto $scheme;".to_string(),
        "proxy_redirect off;".to_string(),
        "proxy_read_timeout 600;".to_string(),
        "client_max_body_size 2G;".to_string(),
    ] {
        out.push_str("        ");
        out.push_str(&line);
        out.push('\n');
    }
    out.push_str("    }\n");
    out
}

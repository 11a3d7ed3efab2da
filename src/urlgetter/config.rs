use std::sync::Arc;
use std::time::Duration;

use rustls::RootCertStore;
use serde::{Deserialize, Serialize};

/// Declarative configuration of one urlgetter measurement
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `"<domain> <ip>[ <ip>...]"` entries served without querying the resolver
    pub dns_cache: Option<String>,
    /// Host header for DNS-over-HTTPS requests
    pub dns_http_host: Option<String>,
    pub dns_tls_server_name: Option<String>,
    pub dns_tls_version: Option<String>,
    pub fail_on_http_error: bool,
    pub http3_enabled: bool,
    pub http_host: Option<String>,
    pub method: Option<String>,
    pub no_follow_redirects: bool,
    pub no_tls_verify: bool,
    /// `socks5://host:port`; a running tunnel takes precedence
    pub proxy_url: Option<String>,
    pub reject_dns_bogons: bool,
    pub resolver_url: Option<String>,
    pub tls_server_name: Option<String>,
    pub tls_version: Option<String>,
    pub tunnel: Option<String>,
    pub user_agent: Option<String>,
    pub max_body_snapshot_size: Option<usize>,

    #[serde(skip)]
    pub timeout: Option<Duration>,
    #[serde(skip)]
    pub root_certs: Option<Arc<RootCertStore>>,
}

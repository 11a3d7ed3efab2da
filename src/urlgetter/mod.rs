//! Single-target measurements (Configurer, Runner, Getter), the experiment
//! entry point (Measurer) and the concurrent multi-target orchestrator.

pub mod config;
pub mod configurer;
pub mod getter;
pub mod measurer;
pub mod multi;
pub mod runner;


use serde::{Deserialize, Serialize};

pub use config::Config;
pub use configurer::{ConfigError, Configurer};
pub use getter::Getter;
pub use measurer::Measurer;
pub use multi::{Multi, MultiInput, MultiOutput};
pub use runner::Runner;

use crate::archival::{DnsQueryEntry, NetworkEvent, RequestEntry, TcpConnectEntry, TlsHandshake};
use crate::errors::{ErrWrapper, HttpRequestFailed};
use crate::netx::HttpError;
use crate::session::TunnelError;

/// Per-target measurement result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestKeys {
    pub agent: String,
    #[serde(skip_serializing_if = "is_zero", default)]
    pub bootstrap_time: f64,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub dns_cache: Vec<String>,
    pub failed_operation: Option<String>,
    pub failure: Option<String>,
    pub network_events: Vec<NetworkEvent>,
    pub queries: Vec<DnsQueryEntry>,
    pub requests: Vec<RequestEntry>,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub socksproxy: String,
    pub tcp_connect: Vec<TcpConnectEntry>,
    pub tls_handshakes: Vec<TlsHandshake>,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub tunnel: String,

    #[serde(skip)]
    pub http_response_status: i64,
    #[serde(skip)]
    pub http_response_body: Vec<u8>,
    #[serde(skip)]
    pub http_response_locations: Vec<String>,
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("urlgetter: no input provided")]
    MissingInput,
    #[error("urlgetter: invalid target URL: {0}")]
    InvalidTarget(#[source] url::ParseError),
    #[error("unknown targetURL scheme")]
    UnknownScheme,
    #[error("stopped after {0} redirects")]
    TooManyRedirects(usize),
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Net(#[from] ErrWrapper),
    #[error("{0}")]
    Http(#[from] HttpError),
    #[error("{0}")]
    HttpRequestFailed(#[from] HttpRequestFailed),
    #[error("{0}")]
    Tunnel(#[from] TunnelError),
    #[error("urlgetter: {0}")]
    Io(#[from] std::io::Error),
}

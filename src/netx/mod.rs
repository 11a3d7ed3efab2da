//! Instrumented network primitives: every resolver, dialer, TLS handshaker
//! and HTTP transport here can write into a shared `Saver`.

pub mod bogon;
pub mod dialer;
pub mod dns;
pub mod http;
pub mod resolver;
pub mod socks5;
pub mod tls;

use std::sync::Arc;

pub use dialer::{BoxConn, Conn, Dialer, NetDialer};
pub use http::{HttpError, HttpRequest, HttpResponse, HttpTransport, NetHttpTransport};
pub use resolver::Resolver;
pub use tls::{TlsConfig, TlsDialer};

use crate::trace::Saver;

/// Fully wired network stack for one measurement
#[derive(Clone)]
pub struct Configuration {
    pub saver: Arc<Saver>,
    pub resolver: Arc<dyn Resolver>,
    pub dialer: Arc<dyn Dialer>,
    pub tls_dialer: Arc<TlsDialer>,
    pub http_transport: Arc<dyn HttpTransport>,
    /// `host:port` of the SOCKS5 proxy every dial goes through, if any
    pub proxy_address: Option<String>,
}

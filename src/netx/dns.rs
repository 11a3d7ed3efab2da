use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tracing::debug;
use url::Url;

use crate::context::Context;
use crate::errors::{ErrWrapper, Operation};
use crate::netx::dialer::{BoxConn, Dialer};
use crate::netx::http::{HttpRequest, HttpTransport, NetHttpTransport};
use crate::netx::tls::TlsDialer;
use crate::trace::{self, Event, Saver};

pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest DNS message we accept over UDP
const MAX_MESSAGE_SIZE: usize = 1 << 17;

/// Largest message the 16-bit DNS length field can describe
pub const MAX_DNS_MESSAGE_SIZE: usize = 65535;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DnsError {
    #[error("dns: no such host")]
    NoSuchHost,
    #[error("dns: query refused")]
    Refused,
    #[error("dns: server misbehaving: {0}")]
    ServerMisbehaving(String),
    #[error("dns: no answer")]
    NoAnswer,
    #[error("dns: bogon address in answer")]
    Bogon,
}

/// Carries one encoded DNS query to a server and returns its reply
#[async_trait]
pub trait DnsTransport: Send + Sync {
    async fn round_trip(&self, ctx: &Context, query: &[u8]) -> Result<Vec<u8>, ErrWrapper>;
    fn network(&self) -> &str;
    fn address(&self) -> &str;
}

/// Plain DNS over a connected UDP socket
pub struct DnsOverUdp {
    address: String,
    saver: Option<Arc<Saver>>,
    timeout: Duration,
}

impl DnsOverUdp {
    pub fn new(address: String, saver: Option<Arc<Saver>>) -> Self {
        Self {
            address,
            saver,
            timeout: DEFAULT_IO_TIMEOUT,
        }
    }

    fn record(&self, name: &str, num_bytes: usize, err: Option<&ErrWrapper>) {
        if let Some(saver) = &self.saver {
            let mut ev = Event::new(name);
            ev.address = self.address.clone();
            ev.proto = "udp".to_string();
            ev.num_bytes = num_bytes;
            ev.err = err.cloned();
            saver.write(ev);
        }
    }

    async fn connect(&self) -> std::io::Result<UdpSocket> {
        let bind = if self.address.starts_with('[') {
            "[::]:0"
        } else {
            "0.0.0.0:0"
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(&self.address).await?;
        Ok(socket)
    }

    async fn exchange(&self, ctx: &Context, query: &[u8]) -> Result<Vec<u8>, ErrWrapper> {
        let socket = match self.connect().await {
            Ok(socket) => {
                self.record(trace::CONNECT, 0, None);
                socket
            }
            Err(err) => {
                let err = ErrWrapper::new(Operation::Connect, err);
                self.record(trace::CONNECT, 0, Some(&err));
                return Err(err);
            }
        };
        match ctx.run(socket.send(query)).await {
            Ok(Ok(n)) => self.record(trace::WRITE, n, None),
            Ok(Err(err)) => {
                let err = ErrWrapper::new(Operation::Write, err);
                self.record(trace::WRITE, 0, Some(&err));
                return Err(err);
            }
            Err(ctx_err) => return Err(ErrWrapper::new(Operation::Write, ctx_err)),
        }
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        let outcome = ctx
            .run(tokio::time::timeout(self.timeout, socket.recv(&mut buf)))
            .await;
        let result = match outcome {
            Ok(Ok(Ok(n))) => Ok(n),
            Ok(Ok(Err(err))) => Err(ErrWrapper::new(Operation::Read, err)),
            Ok(Err(elapsed)) => Err(ErrWrapper::new(Operation::Read, elapsed)),
            Err(ctx_err) => Err(ErrWrapper::new(Operation::Read, ctx_err)),
        };
        match result {
            Ok(n) => {
                self.record(trace::READ, n, None);
                buf.truncate(n);
                Ok(buf)
            }
            Err(err) => {
                self.record(trace::READ, 0, Some(&err));
                Err(err)
            }
        }
    }
}

#[async_trait]
impl DnsTransport for DnsOverUdp {
    async fn round_trip(&self, ctx: &Context, query: &[u8]) -> Result<Vec<u8>, ErrWrapper> {
        debug!("dns over udp to {}", self.address);
        self.exchange(ctx, query).await
    }

    fn network(&self) -> &str {
        "udp"
    }

    fn address(&self) -> &str {
        &self.address
    }
}

enum StreamKind {
    Tcp(Arc<dyn Dialer>),
    Tls(Arc<TlsDialer>),
}

/// DNS over a length-prefixed stream: plain TCP or DNS-over-TLS
pub struct DnsOverStream {
    address: String,
    kind: StreamKind,
}

impl DnsOverStream {
    pub fn tcp(address: String, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            address,
            kind: StreamKind::Tcp(dialer),
        }
    }

    pub fn tls(address: String, dialer: Arc<TlsDialer>) -> Self {
        Self {
            address,
            kind: StreamKind::Tls(dialer),
        }
    }

    async fn dial(&self, ctx: &Context) -> Result<BoxConn, ErrWrapper> {
        match &self.kind {
            StreamKind::Tcp(dialer) => dialer.dial(ctx, "tcp", &self.address).await,
            StreamKind::Tls(dialer) => {
                let conn: BoxConn = Box::new(dialer.dial_tls(ctx, "tcp", &self.address).await?);
                Ok(conn)
            }
        }
    }
}

#[async_trait]
impl DnsTransport for DnsOverStream {
    async fn round_trip(&self, ctx: &Context, query: &[u8]) -> Result<Vec<u8>, ErrWrapper> {
        if query.len() > u16::MAX as usize {
            return Err(ErrWrapper::new(
                Operation::Write,
                DnsError::ServerMisbehaving("query too large".to_string()),
            ));
        }
        let mut conn = self.dial(ctx).await?;
        let mut framed = Vec::with_capacity(query.len() + 2);
        framed.extend_from_slice(&(query.len() as u16).to_be_bytes());
        framed.extend_from_slice(query);
        ctx.run(conn.write_all(&framed))
            .await
            .map_err(|e| ErrWrapper::new(Operation::Write, e))?
            .map_err(|e| ErrWrapper::new(Operation::Write, e))?;
        let reply = ctx
            .run(async {
                let mut header = [0u8; 2];
                conn.read_exact(&mut header).await?;
                let mut reply = vec![0u8; u16::from_be_bytes(header) as usize];
                conn.read_exact(&mut reply).await?;
                Ok::<_, std::io::Error>(reply)
            })
            .await
            .map_err(|e| ErrWrapper::new(Operation::Read, e))?
            .map_err(|e| ErrWrapper::new(Operation::Read, e))?;
        Ok(reply)
    }

    fn network(&self) -> &str {
        match self.kind {
            StreamKind::Tcp(_) => "tcp",
            StreamKind::Tls(_) => "dot",
        }
    }

    fn address(&self) -> &str {
        &self.address
    }
}

/// DNS-over-HTTPS (RFC 8484 POST)
pub struct DnsOverHttps {
    url: Url,
    url_string: String,
    host_override: Option<String>,
    transport: Arc<dyn HttpTransport>,
}

impl DnsOverHttps {
    pub fn new(url: Url, host_override: Option<String>, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            url_string: url.to_string(),
            url,
            host_override,
            transport,
        }
    }

    /// Unrecorded HTTP transport able to carry any DNS message in full
    pub fn transport(dialer: Arc<dyn Dialer>, tls_dialer: Arc<TlsDialer>) -> NetHttpTransport {
        NetHttpTransport::new(dialer, tls_dialer, None, MAX_DNS_MESSAGE_SIZE)
    }
}

#[async_trait]
impl DnsTransport for DnsOverHttps {
    async fn round_trip(&self, ctx: &Context, query: &[u8]) -> Result<Vec<u8>, ErrWrapper> {
        let request = HttpRequest {
            method: "POST".to_string(),
            url: self.url.clone(),
            headers: vec![
                ("content-type".to_string(), "application/dns-message".to_string()),
                ("accept".to_string(), "application/dns-message".to_string()),
            ],
            host: self.host_override.clone(),
            body: query.to_vec(),
        };
        let response = self
            .transport
            .round_trip(ctx, &request)
            .await
            .map_err(|e| ErrWrapper::new(Operation::Resolve, e))?;
        if response.status != 200 {
            return Err(ErrWrapper::new(
                Operation::Resolve,
                DnsError::ServerMisbehaving(format!("doh: status {}", response.status)),
            ));
        }
        if response.header("content-type") != Some("application/dns-message") {
            return Err(ErrWrapper::new(
                Operation::Resolve,
                DnsError::ServerMisbehaving("doh: invalid content-type".to_string()),
            ));
        }
        if response.body_is_truncated {
            return Err(ErrWrapper::new(
                Operation::Resolve,
                DnsError::ServerMisbehaving("doh: reply too large".to_string()),
            ));
        }
        Ok(response.body)
    }

    fn network(&self) -> &str {
        "doh"
    }

    fn address(&self) -> &str {
        &self.url_string
    }
}

#[cfg(test)]
mod dns_tests {
    use super::*;
    use crate::netx::resolver::{Resolver, SerialResolver, SystemResolver};
    use crate::netx::dialer::NetDialer;
    use crate::netx::tls::TlsConfig;
    use crate::testutil::{spawn_doh_server, spawn_tcp_dns_server, spawn_udp_dns_server};

    fn doh_dialers() -> (Arc<dyn Dialer>, Arc<TlsDialer>) {
        let dialer: Arc<dyn Dialer> = Arc::new(NetDialer::new(Arc::new(SystemResolver::new()), None));
        let tls = Arc::new(TlsDialer::new(dialer.clone(), TlsConfig::default(), None));
        (dialer, tls)
    }

    #[tokio::test]
    async fn test_doh_lookup_ignores_snapshot_limit() {
        let url = spawn_doh_server(vec!["93.184.216.34", "2001:db8::1"]).await;
        let (dialer, tls) = doh_dialers();
        let transport = Arc::new(DnsOverHttps::transport(dialer, tls));
        let resolver = SerialResolver::new(Arc::new(DnsOverHttps::new(url, None, transport)));
        let addrs = resolver
            .lookup_host(&Context::background(), "example.com")
            .await
            .unwrap();
        assert_eq!(addrs, vec!["93.184.216.34".to_string(), "2001:db8::1".to_string()]);
    }

    #[tokio::test]
    async fn test_doh_truncated_reply_is_misbehaving() {
        let url = spawn_doh_server(vec!["93.184.216.34"]).await;
        let (dialer, tls) = doh_dialers();
        let transport = Arc::new(NetHttpTransport::new(dialer, tls, None, 16));
        let doh = DnsOverHttps::new(url, None, transport);
        let mut query = hickory_proto::op::Message::new();
        query.set_id(7).add_query(hickory_proto::op::Query::query(
            hickory_proto::rr::Name::from_ascii("example.com.").unwrap(),
            hickory_proto::rr::RecordType::A,
        ));
        let query = query.to_vec().unwrap();
        let err = doh.round_trip(&Context::background(), &query).await.unwrap_err();
        assert_eq!(err.to_string(), "dns_server_misbehaving");
    }

    #[tokio::test]
    async fn test_udp_lookup_records_io() {
        let addr = spawn_udp_dns_server(vec!["1.2.3.4", "2001:db8::5"]).await;
        let saver = Arc::new(Saver::new());
        let transport = Arc::new(DnsOverUdp::new(addr.clone(), Some(saver.clone())));
        let resolver = SerialResolver::new(transport);
        let addrs = resolver
            .lookup_host(&Context::background(), "example.com")
            .await
            .unwrap();
        assert_eq!(addrs, vec!["1.2.3.4".to_string(), "2001:db8::5".to_string()]);
        assert_eq!(resolver.network(), "udp");
        assert_eq!(resolver.address(), addr);
        let names: Vec<_> = saver.read().into_iter().map(|e| e.name).collect();
        assert_eq!(
            names,
            vec!["connect", "write", "read", "connect", "write", "read"]
        );
    }

    #[tokio::test]
    async fn test_udp_lookup_canceled() {
        let addr = spawn_udp_dns_server(vec!["1.2.3.4"]).await;
        let ctx = Context::background().with_cancel();
        ctx.cancel();
        let resolver = SerialResolver::new(Arc::new(DnsOverUdp::new(addr, None)));
        let err = resolver.lookup_host(&ctx, "example.com").await.unwrap_err();
        assert_eq!(err.to_string(), "interrupted");
    }

    #[tokio::test]
    async fn test_tcp_lookup() {
        let addr = spawn_tcp_dns_server(vec!["5.6.7.8"]).await;
        let dialer = Arc::new(NetDialer::new(Arc::new(SystemResolver::new()), None));
        let transport = Arc::new(DnsOverStream::tcp(addr, dialer));
        let resolver = SerialResolver::new(transport);
        assert_eq!(resolver.network(), "tcp");
        let addrs = resolver
            .lookup_host(&Context::background(), "example.com")
            .await
            .unwrap();
        assert_eq!(addrs, vec!["5.6.7.8".to_string()]);
    }
}

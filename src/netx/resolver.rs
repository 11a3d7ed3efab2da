use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use hickory_proto::serialize::binary::BinEncodable;
use tracing::debug;

use crate::context::Context;
use crate::errors::{ErrWrapper, Operation};
use crate::netx::bogon::is_bogon;
use crate::netx::dns::{DnsError, DnsTransport};
use crate::trace::{self, Event, Saver};

/// Maps a hostname to its IP addresses
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn lookup_host(&self, ctx: &Context, hostname: &str) -> Result<Vec<String>, ErrWrapper>;

    /// Engine name reported in DNS entries ("system", "udp", "doh", ...)
    fn network(&self) -> String;

    /// Resolver endpoint reported in DNS entries
    fn address(&self) -> String;
}

/// getaddrinfo through tokio's blocking pool
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl SystemResolver {
    pub fn new() -> Self {
        Self
    }
}

fn system_lookup_error(err: io::Error) -> ErrWrapper {
    let message = err.to_string();
    let nxdomain = [
        "Name or service not known",
        "No address associated with hostname",
        "nodename nor servname provided",
        "no such host",
    ];
    if nxdomain.iter().any(|needle| message.contains(needle)) {
        return ErrWrapper::new(Operation::Resolve, DnsError::NoSuchHost);
    }
    ErrWrapper::new(Operation::Resolve, err)
}

#[async_trait]
impl Resolver for SystemResolver {
    async fn lookup_host(&self, ctx: &Context, hostname: &str) -> Result<Vec<String>, ErrWrapper> {
        let lookup = tokio::net::lookup_host((hostname, 0));
        let addrs = ctx
            .run(lookup)
            .await
            .map_err(|e| ErrWrapper::new(Operation::Resolve, e))?
            .map_err(system_lookup_error)?;
        let mut out: Vec<String> = Vec::new();
        for addr in addrs {
            let ip = addr.ip().to_string();
            if !out.contains(&ip) {
                out.push(ip);
            }
        }
        if out.is_empty() {
            return Err(ErrWrapper::new(Operation::Resolve, DnsError::NoAnswer));
        }
        Ok(out)
    }

    fn network(&self) -> String {
        "system".to_string()
    }

    fn address(&self) -> String {
        String::new()
    }
}

/// Sends an A query, then an AAAA query, over a DNS transport
pub struct SerialResolver {
    transport: Arc<dyn DnsTransport>,
}

impl SerialResolver {
    pub fn new(transport: Arc<dyn DnsTransport>) -> Self {
        Self { transport }
    }

    async fn lookup(&self, ctx: &Context, hostname: &str, qtype: RecordType) -> Result<Vec<String>, ErrWrapper> {
        let wrap = |e: DnsError| ErrWrapper::new(Operation::Resolve, e);
        let query = encode_query(hostname, qtype).map_err(wrap)?;
        let reply = self.transport.round_trip(ctx, &query.1).await?;
        decode_reply(query.0, qtype, &reply).map_err(wrap)
    }
}

/// Builds a recursive query, returning its id and wire bytes
pub fn encode_query(hostname: &str, qtype: RecordType) -> Result<(u16, Vec<u8>), DnsError> {
    let fqdn = if hostname.ends_with('.') {
        hostname.to_string()
    } else {
        format!("{}.", hostname)
    };
    let name = Name::from_ascii(&fqdn).map_err(|_| DnsError::NoSuchHost)?;
    let id: u16 = rand::random();
    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, qtype));
    let bytes = message
        .to_vec()
        .map_err(|e| DnsError::ServerMisbehaving(e.to_string()))?;
    Ok((id, bytes))
}

/// Extracts addresses of type `qtype` from a reply to query `id`
pub fn decode_reply(id: u16, qtype: RecordType, reply: &[u8]) -> Result<Vec<String>, DnsError> {
    let message =
        Message::from_vec(reply).map_err(|e| DnsError::ServerMisbehaving(e.to_string()))?;
    if message.id() != id {
        return Err(DnsError::ServerMisbehaving("reply id mismatch".to_string()));
    }
    match message.response_code() {
        ResponseCode::NoError => {}
        ResponseCode::NXDomain => return Err(DnsError::NoSuchHost),
        ResponseCode::Refused => return Err(DnsError::Refused),
        other => return Err(DnsError::ServerMisbehaving(other.to_string())),
    }
    let addrs: Vec<String> = message
        .answers()
        .iter()
        .filter_map(|record| match (qtype, record.data()) {
            (RecordType::A, Some(RData::A(a))) => Some(a.0.to_string()),
            (RecordType::AAAA, Some(RData::AAAA(aaaa))) => Some(aaaa.0.to_string()),
            _ => None,
        })
        .collect();
    if addrs.is_empty() {
        return Err(DnsError::NoAnswer);
    }
    Ok(addrs)
}

#[async_trait]
impl Resolver for SerialResolver {
    async fn lookup_host(&self, ctx: &Context, hostname: &str) -> Result<Vec<String>, ErrWrapper> {
        let a = self.lookup(ctx, hostname, RecordType::A).await;
        let aaaa = self.lookup(ctx, hostname, RecordType::AAAA).await;
        match (a, aaaa) {
            (Err(err), Err(_)) => Err(err),
            (a, aaaa) => {
                let mut out = a.unwrap_or_default();
                out.extend(aaaa.unwrap_or_default());
                Ok(out)
            }
        }
    }

    fn network(&self) -> String {
        self.transport.network().to_string()
    }

    fn address(&self) -> String {
        self.transport.address().to_string()
    }
}

/// Answers seeded hostnames from memory and delegates the rest
pub struct CacheResolver {
    entries: HashMap<String, Vec<String>>,
    inner: Arc<dyn Resolver>,
}

impl CacheResolver {
    pub fn new(entries: HashMap<String, Vec<String>>, inner: Arc<dyn Resolver>) -> Self {
        Self { entries, inner }
    }
}

#[async_trait]
impl Resolver for CacheResolver {
    async fn lookup_host(&self, ctx: &Context, hostname: &str) -> Result<Vec<String>, ErrWrapper> {
        if let Some(addrs) = self.entries.get(hostname) {
            debug!("dns cache hit for {}", hostname);
            return Ok(addrs.clone());
        }
        self.inner.lookup_host(ctx, hostname).await
    }

    fn network(&self) -> String {
        self.inner.network()
    }

    fn address(&self) -> String {
        self.inner.address()
    }
}

/// Fails lookups whose answers contain a bogon address
pub struct BogonResolver {
    inner: Arc<dyn Resolver>,
}

impl BogonResolver {
    pub fn new(inner: Arc<dyn Resolver>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Resolver for BogonResolver {
    async fn lookup_host(&self, ctx: &Context, hostname: &str) -> Result<Vec<String>, ErrWrapper> {
        let addrs = self.inner.lookup_host(ctx, hostname).await?;
        if addrs.iter().any(|a| is_bogon(a)) {
            return Err(ErrWrapper::new(Operation::Resolve, DnsError::Bogon));
        }
        Ok(addrs)
    }

    fn network(&self) -> String {
        self.inner.network()
    }

    fn address(&self) -> String {
        self.inner.address()
    }
}

/// Records resolve_start and resolve_done around the wrapped resolver
pub struct SaverResolver {
    inner: Arc<dyn Resolver>,
    saver: Arc<Saver>,
}

impl SaverResolver {
    pub fn new(inner: Arc<dyn Resolver>, saver: Arc<Saver>) -> Self {
        Self { inner, saver }
    }
}

#[async_trait]
impl Resolver for SaverResolver {
    async fn lookup_host(&self, ctx: &Context, hostname: &str) -> Result<Vec<String>, ErrWrapper> {
        let mut start = Event::new(trace::RESOLVE_START);
        start.address = self.inner.address();
        start.proto = self.inner.network();
        start.hostname = hostname.to_string();
        self.saver.write(start);

        let result = self.inner.lookup_host(ctx, hostname).await;

        let mut done = Event::new(trace::RESOLVE_DONE);
        done.address = self.inner.address();
        done.proto = self.inner.network();
        done.hostname = hostname.to_string();
        match &result {
            Ok(addrs) => done.addresses = addrs.clone(),
            Err(err) => done.err = Some(err.clone()),
        }
        self.saver.write(done);
        result
    }

    fn network(&self) -> String {
        self.inner.network()
    }

    fn address(&self) -> String {
        self.inner.address()
    }
}

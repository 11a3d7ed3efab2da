use std::error::Error;
use std::fmt;
use std::io;
use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;

use crate::context::ContextError;
use crate::netx::dns::DnsError;

pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Classified failure reported on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    ConnectionRefused,
    ConnectionReset,
    ConnectionAlreadyClosed,
    DnsBogonError,
    DnsNxdomainError,
    DnsRefusedError,
    DnsServerMisbehaving,
    DnsNoAnswer,
    EofError,
    GenericTimeoutError,
    HostUnreachable,
    Interrupted,
    SslFailedHandshake,
    SslInvalidHostname,
    SslUnknownAuthority,
    SslInvalidCertificate,
    HttpRequestFailed,
    Unknown(String),
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Failure::ConnectionRefused => "connection_refused",
            Failure::ConnectionReset => "connection_reset",
            Failure::ConnectionAlreadyClosed => "connection_already_closed",
            Failure::DnsBogonError => "dns_bogon_error",
            Failure::DnsNxdomainError => "dns_nxdomain_error",
            Failure::DnsRefusedError => "dns_refused_error",
            Failure::DnsServerMisbehaving => "dns_server_misbehaving",
            Failure::DnsNoAnswer => "dns_no_answer",
            Failure::EofError => "eof_error",
            Failure::GenericTimeoutError => "generic_timeout_error",
            Failure::HostUnreachable => "host_unreachable",
            Failure::Interrupted => "interrupted",
            Failure::SslFailedHandshake => "ssl_failed_handshake",
            Failure::SslInvalidHostname => "ssl_invalid_hostname",
            Failure::SslUnknownAuthority => "ssl_unknown_authority",
            Failure::SslInvalidCertificate => "ssl_invalid_certificate",
            Failure::HttpRequestFailed => "http_request_failed",
            Failure::Unknown(msg) => return write!(f, "unknown_failure: {}", msg),
        };
        f.write_str(s)
    }
}

/// Network operation during which a failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Resolve,
    Connect,
    TlsHandshake,
    QuicHandshake,
    HttpRoundTrip,
    Close,
    Read,
    Write,
    ReadFrom,
    WriteTo,
    Unknown,
    TopLevel,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Resolve => "resolve",
            Operation::Connect => "connect",
            Operation::TlsHandshake => "tls_handshake",
            Operation::QuicHandshake => "quic_handshake",
            Operation::HttpRoundTrip => "http_round_trip",
            Operation::Close => "close",
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::ReadFrom => "read_from",
            Operation::WriteTo => "write_to",
            Operation::Unknown => "unknown",
            Operation::TopLevel => "top_level",
        }
    }

    /// Major operations survive re-wrapping by outer layers
    pub fn is_major(&self) -> bool {
        matches!(
            self,
            Operation::Connect
                | Operation::HttpRoundTrip
                | Operation::Resolve
                | Operation::TlsHandshake
                | Operation::QuicHandshake
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when FailOnHTTPError is set and the final status is >= 400
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("http_request_failed")]
pub struct HttpRequestFailed;

/// An error tagged with its failure kind and the operation that produced it.
///
/// Built once, at the layer performing the operation. Wrapping an error that
/// already carries an `ErrWrapper` reuses its classification.
#[derive(Clone)]
pub struct ErrWrapper {
    failure: Failure,
    operation: Operation,
    source: Arc<dyn Error + Send + Sync + 'static>,
}

impl ErrWrapper {
    pub fn new(operation: Operation, err: impl Into<BoxError>) -> Self {
        let err: BoxError = err.into();
        if let Some(child) = find_wrapper(err.as_ref()) {
            let operation = if child.operation.is_major() {
                child.operation
            } else {
                operation
            };
            return Self {
                failure: child.failure.clone(),
                operation,
                source: Arc::clone(&child.source),
            };
        }
        Self {
            failure: classify(err.as_ref()),
            operation,
            source: Arc::from(err),
        }
    }

    pub fn top_level(err: impl Into<BoxError>) -> Self {
        Self::new(Operation::TopLevel, err)
    }

    pub fn failure(&self) -> &Failure {
        &self.failure
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn is_canceled(&self) -> bool {
        causes(self.source.as_ref())
            .into_iter()
            .any(|c| c.downcast_ref::<ContextError>() == Some(&ContextError::Canceled))
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        causes(self.source.as_ref())
            .into_iter()
            .any(|c| c.downcast_ref::<ContextError>() == Some(&ContextError::DeadlineExceeded))
    }
}

impl fmt::Display for ErrWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.failure, f)
    }
}

impl fmt::Debug for ErrWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrWrapper")
            .field("failure", &self.failure.to_string())
            .field("operation", &self.operation.as_str())
            .field("source", &self.source.to_string())
            .finish()
    }
}

impl Error for ErrWrapper {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Classifies `err` as if it were wrapped at the top level
pub fn failure_of(err: &(dyn Error + 'static)) -> Failure {
    match find_wrapper(err) {
        Some(wrapper) => wrapper.failure.clone(),
        None => classify(err),
    }
}

/// Operation of the outermost `ErrWrapper` in the chain, if any
pub fn operation_of(err: &(dyn Error + 'static)) -> Option<Operation> {
    find_wrapper(err).map(|w| w.operation)
}

fn find_wrapper<'a>(err: &'a (dyn Error + 'static)) -> Option<&'a ErrWrapper> {
    causes(err)
        .into_iter()
        .find_map(|c| c.downcast_ref::<ErrWrapper>())
}

/// Flattens the source chain, looking through the payload of `io::Error`
fn causes<'a>(err: &'a (dyn Error + 'static)) -> Vec<&'a (dyn Error + 'static)> {
    let mut out = Vec::new();
    let mut current = Some(err);
    while let Some(e) = current {
        if out.len() >= 32 {
            break;
        }
        out.push(e);
        current = match e.downcast_ref::<io::Error>().and_then(|io| io.get_ref()) {
            Some(inner) => Some(inner as &(dyn Error + 'static)),
            None => e.source(),
        };
    }
    out
}

fn classify(err: &(dyn Error + 'static)) -> Failure {
    let mut fallback = None;
    for cause in causes(err) {
        if let Some(w) = cause.downcast_ref::<ErrWrapper>() {
            return w.failure.clone();
        }
        if let Some(c) = cause.downcast_ref::<ContextError>() {
            return match c {
                ContextError::Canceled => Failure::Interrupted,
                ContextError::DeadlineExceeded => Failure::GenericTimeoutError,
            };
        }
        if let Some(d) = cause.downcast_ref::<DnsError>() {
            return classify_dns(d);
        }
        if let Some(t) = cause.downcast_ref::<rustls::Error>() {
            return classify_tls(t);
        }
        if cause.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            return Failure::GenericTimeoutError;
        }
        if cause.downcast_ref::<HttpRequestFailed>().is_some() {
            return Failure::HttpRequestFailed;
        }
        if fallback.is_none() {
            fallback = classify_weak(cause);
        }
    }
    if let Some(failure) = fallback {
        return failure;
    }
    let message = err.to_string();
    classify_message(&message).unwrap_or_else(|| Failure::Unknown(scrub(&message)))
}

fn classify_dns(err: &DnsError) -> Failure {
    match err {
        DnsError::NoSuchHost => Failure::DnsNxdomainError,
        DnsError::Refused => Failure::DnsRefusedError,
        DnsError::ServerMisbehaving(_) => Failure::DnsServerMisbehaving,
        DnsError::NoAnswer => Failure::DnsNoAnswer,
        DnsError::Bogon => Failure::DnsBogonError,
    }
}

fn classify_tls(err: &rustls::Error) -> Failure {
    use rustls::CertificateError;
    match err {
        rustls::Error::InvalidCertificate(CertificateError::NotValidForName) => {
            Failure::SslInvalidHostname
        }
        rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer) => {
            Failure::SslUnknownAuthority
        }
        rustls::Error::InvalidCertificate(_) => Failure::SslInvalidCertificate,
        _ => Failure::SslFailedHandshake,
    }
}

/// Hints that only apply when nothing more specific shows up deeper in the chain
fn classify_weak(cause: &(dyn Error + 'static)) -> Option<Failure> {
    if let Some(e) = cause.downcast_ref::<io::Error>() {
        return match e.kind() {
            io::ErrorKind::ConnectionRefused => Some(Failure::ConnectionRefused),
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                Some(Failure::ConnectionReset)
            }
            io::ErrorKind::TimedOut => Some(Failure::GenericTimeoutError),
            io::ErrorKind::UnexpectedEof => Some(Failure::EofError),
            io::ErrorKind::NotConnected => Some(Failure::ConnectionAlreadyClosed),
            _ => e
                .raw_os_error()
                .and_then(classify_errno)
                .or_else(|| classify_message(&e.to_string())),
        };
    }
    if let Some(e) = cause.downcast_ref::<hyper::Error>() {
        if e.is_timeout() {
            return Some(Failure::GenericTimeoutError);
        }
        if e.is_incomplete_message() {
            return Some(Failure::EofError);
        }
    }
    None
}

fn classify_errno(code: i32) -> Option<Failure> {
    // Linux errno values
    match code {
        101 | 113 => Some(Failure::HostUnreachable),
        104 => Some(Failure::ConnectionReset),
        110 => Some(Failure::GenericTimeoutError),
        111 => Some(Failure::ConnectionRefused),
        _ => None,
    }
}

const SUFFIXES: &[(&str, Failure)] = &[
    ("operation was canceled", Failure::Interrupted),
    ("context canceled", Failure::Interrupted),
    ("EOF", Failure::EofError),
    ("connection refused", Failure::ConnectionRefused),
    ("connection reset by peer", Failure::ConnectionReset),
    ("context deadline exceeded", Failure::GenericTimeoutError),
    ("transaction is timed out", Failure::GenericTimeoutError),
    ("i/o timeout", Failure::GenericTimeoutError),
    ("TLS handshake timeout", Failure::GenericTimeoutError),
    ("no such host", Failure::DnsNxdomainError),
    ("Name or service not known", Failure::DnsNxdomainError),
    ("No address associated with hostname", Failure::DnsNxdomainError),
    ("nodename nor servname provided, or not known", Failure::DnsNxdomainError),
    ("host unreachable", Failure::HostUnreachable),
    ("use of closed network connection", Failure::ConnectionAlreadyClosed),
];

fn classify_message(message: &str) -> Option<Failure> {
    let trimmed = strip_os_error(message);
    SUFFIXES
        .iter()
        .find(|(suffix, _)| trimmed.ends_with(suffix))
        .map(|(_, failure)| failure.clone())
}

/// Drops a trailing " (os error N)" so suffix matching sees the real message
fn strip_os_error(message: &str) -> &str {
    match message.rfind(" (os error ") {
        Some(idx) if message.ends_with(')') => &message[..idx],
        _ => message,
    }
}

lazy_static! {
    static ref IPV4_RE: Regex =
        Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}(?::\d{1,5})?\b").expect("valid ipv4 regex");
    static ref IPV6_RE: Regex =
        Regex::new(r"\[[0-9A-Fa-f:.]+\](?::\d{1,5})?|\b(?:[0-9A-Fa-f]{1,4}:){2,7}[0-9A-Fa-f]{1,4}\b")
            .expect("valid ipv6 regex");
}

/// Replaces IP addresses (and endpoints) in an error message
pub fn scrub(message: &str) -> String {
    let scrubbed = IPV6_RE.replace_all(message, "[scrubbed]");
    IPV4_RE.replace_all(&scrubbed, "[scrubbed]").into_owned()
}

use std::sync::Mutex;
use std::time::Instant;

use crate::errors::ErrWrapper;

pub const CONNECT: &str = "connect";
pub const READ: &str = "read";
pub const WRITE: &str = "write";
pub const READ_FROM: &str = "read_from";
pub const WRITE_TO: &str = "write_to";
pub const RESOLVE_START: &str = "resolve_start";
pub const RESOLVE_DONE: &str = "resolve_done";
pub const TLS_HANDSHAKE_START: &str = "tls_handshake_start";
pub const TLS_HANDSHAKE_DONE: &str = "tls_handshake_done";
pub const HTTP_TRANSACTION_START: &str = "http_transaction_start";
pub const HTTP_TRANSACTION_DONE: &str = "http_transaction_done";

/// One recorded network sub-operation
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub time: Instant,
    pub address: String,
    pub proto: String,
    pub err: Option<ErrWrapper>,

    pub hostname: String,
    pub addresses: Vec<String>,

    pub num_bytes: usize,
    pub data: Vec<u8>,
    pub data_is_truncated: bool,

    pub transaction_id: u64,
    pub http_method: String,
    pub http_url: String,
    pub http_request_headers: Vec<(String, Vec<u8>)>,
    pub http_response_headers: Vec<(String, Vec<u8>)>,
    pub http_status_code: i64,
    pub transport: String,

    pub tls_cipher_suite: String,
    pub tls_negotiated_proto: String,
    pub tls_next_protos: Vec<String>,
    pub tls_peer_certs: Vec<Vec<u8>>,
    pub tls_server_name: String,
    pub tls_version: String,
    pub no_tls_verify: bool,
}

impl Event {
    /// Event stamped with the current time
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            time: Instant::now(),
            address: String::new(),
            proto: String::new(),
            err: None,
            hostname: String::new(),
            addresses: Vec::new(),
            num_bytes: 0,
            data: Vec::new(),
            data_is_truncated: false,
            transaction_id: 0,
            http_method: String::new(),
            http_url: String::new(),
            http_request_headers: Vec::new(),
            http_response_headers: Vec::new(),
            http_status_code: 0,
            transport: String::new(),
            tls_cipher_suite: String::new(),
            tls_negotiated_proto: String::new(),
            tls_next_protos: Vec::new(),
            tls_peer_certs: Vec::new(),
            tls_server_name: String::new(),
            tls_version: String::new(),
            no_tls_verify: false,
        }
    }
}

/// Append-only event log shared by every instrumented primitive of one measurement
#[derive(Debug, Default)]
pub struct Saver {
    events: Mutex<Vec<Event>>,
}

impl Saver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&self, event: Event) {
        let mut events = match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        events.push(event);
    }

    /// Snapshot of every event appended so far
    pub fn read(&self) -> Vec<Event> {
        match self.events.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

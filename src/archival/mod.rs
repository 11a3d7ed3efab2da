//! Converts the raw event log of one measurement into report entries.
//!
//! Every function here is pure: same begin anchor and events in, same entries
//! out. Events that do not match a converter's filter are ignored.

pub mod model;

use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::time::Instant;

pub use model::{
    DnsAnswerEntry, DnsQueryEntry, HttpHeader, HttpRequest, HttpResponse, HttpTor,
    MaybeBinaryValue, NetworkEvent, RequestEntry, TcpConnectEntry, TcpConnectStatus,
    TlsHandshake,
};

use crate::endpoint::split_host_port;
use crate::errors::{self, Operation};
use crate::geolocate::AsnLookup;
use crate::trace::{self, Event};

fn elapsed(begin: Instant, ev: &Event) -> f64 {
    ev.time.saturating_duration_since(begin).as_secs_f64()
}

fn event_failure(ev: &Event) -> Option<String> {
    ev.err.as_ref().map(|e| e.to_string())
}

/// One entry per TCP `connect` event
pub fn tcp_connect_list(begin: Instant, events: &[Event]) -> Vec<TcpConnectEntry> {
    let mut out = Vec::new();
    for ev in events {
        if ev.name != trace::CONNECT || ev.proto != "tcp" {
            continue;
        }
        let (ip, port) = match split_host_port(&ev.address) {
            Ok(parts) => parts,
            Err(_) => continue,
        };
        let port = match port.parse::<u16>() {
            Ok(port) => port,
            Err(_) => continue,
        };
        out.push(TcpConnectEntry {
            ip,
            port,
            status: TcpConnectStatus {
                blocked: None,
                failure: event_failure(ev),
                success: ev.err.is_none(),
            },
            t: elapsed(begin, ev),
        });
    }
    out
}

fn headers_list(headers: &[(String, Vec<u8>)]) -> Vec<HttpHeader> {
    let mut out: Vec<HttpHeader> = headers
        .iter()
        .map(|(key, value)| HttpHeader {
            key: key.clone(),
            value: MaybeBinaryValue::new(value.clone()),
        })
        .collect();
    // stable: repeated keys keep their relative order
    out.sort_by(|a, b| a.key.cmp(&b.key));
    out
}

fn headers_map(headers: &[(String, Vec<u8>)]) -> BTreeMap<String, MaybeBinaryValue> {
    let mut out = BTreeMap::new();
    for (key, value) in headers {
        out.entry(key.clone())
            .or_insert_with(|| MaybeBinaryValue::new(value.clone()));
    }
    out
}

/// One entry per HTTP transaction, most recent first
pub fn request_list(begin: Instant, events: &[Event]) -> Vec<RequestEntry> {
    let starts: HashMap<u64, &Event> = events
        .iter()
        .filter(|ev| ev.name == trace::HTTP_TRANSACTION_START)
        .map(|ev| (ev.transaction_id, ev))
        .collect();
    let mut out = Vec::new();
    for done in events {
        if done.name != trace::HTTP_TRANSACTION_DONE {
            continue;
        }
        let start = starts.get(&done.transaction_id).copied().unwrap_or(done);
        let locations = done
            .http_response_headers
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case("location"))
            .map(|(_, value)| String::from_utf8_lossy(value).into_owned())
            .collect();
        out.push(RequestEntry {
            failure: event_failure(done),
            request: HttpRequest {
                body: MaybeBinaryValue::default(),
                body_is_truncated: false,
                headers_list: headers_list(&start.http_request_headers),
                headers: headers_map(&start.http_request_headers),
                method: start.http_method.clone(),
                tor: HttpTor::default(),
                x_transport: start.transport.clone(),
                url: start.http_url.clone(),
            },
            response: HttpResponse {
                body: MaybeBinaryValue::new(done.data.clone()),
                body_is_truncated: done.data_is_truncated,
                code: done.http_status_code,
                headers_list: headers_list(&done.http_response_headers),
                headers: headers_map(&done.http_response_headers),
                locations,
            },
            t: elapsed(begin, start),
        });
    }
    out.reverse();
    out
}

#[derive(Clone, Copy)]
enum QueryType {
    A,
    Aaaa,
}

impl QueryType {
    fn as_str(&self) -> &'static str {
        match self {
            QueryType::A => "A",
            QueryType::Aaaa => "AAAA",
        }
    }

    fn matches(&self, address: &str) -> bool {
        match self {
            QueryType::A => !address.contains(':'),
            QueryType::Aaaa => address.contains(':'),
        }
    }

    fn answer(&self, address: &str, asn: &dyn AsnLookup) -> DnsAnswerEntry {
        let (number, org) = asn.lookup_asn(address).unwrap_or_default();
        let mut answer = DnsAnswerEntry {
            asn: i64::from(number),
            as_org_name: org,
            answer_type: self.as_str().to_string(),
            ..Default::default()
        };
        match self {
            QueryType::A => answer.ipv4 = Some(address.to_string()),
            QueryType::Aaaa => answer.ipv6 = Some(address.to_string()),
        }
        answer
    }
}

/// Up to two entries (A, AAAA) per `resolve_done` event.
///
/// A family with no answers is dropped when the lookup succeeded and kept
/// when it failed, so a failed lookup always yields both entries.
pub fn dns_queries_list(begin: Instant, events: &[Event], asn: &dyn AsnLookup) -> Vec<DnsQueryEntry> {
    let mut out = Vec::new();
    for ev in events {
        if ev.name != trace::RESOLVE_DONE {
            continue;
        }
        for qtype in [QueryType::A, QueryType::Aaaa] {
            let answers: Vec<DnsAnswerEntry> = ev
                .addresses
                .iter()
                .filter(|addr| qtype.matches(addr))
                .map(|addr| qtype.answer(addr, asn))
                .collect();
            if answers.is_empty() && ev.err.is_none() {
                continue;
            }
            out.push(DnsQueryEntry {
                answers,
                engine: ev.proto.clone(),
                failure: event_failure(ev),
                hostname: ev.hostname.clone(),
                query_type: qtype.as_str().to_string(),
                resolver_hostname: None,
                resolver_port: None,
                resolver_address: ev.address.clone(),
                t: elapsed(begin, ev),
            });
        }
    }
    out
}

/// One entry per event, keeping only the fields meaningful for its operation
pub fn network_events_list(begin: Instant, events: &[Event]) -> Vec<NetworkEvent> {
    events
        .iter()
        .map(|ev| {
            let t = elapsed(begin, ev);
            let num_bytes = Some(ev.num_bytes as i64).filter(|n| *n != 0);
            let address = Some(ev.address.clone()).filter(|a| !a.is_empty());
            match ev.name.as_str() {
                trace::CONNECT => NetworkEvent {
                    address,
                    failure: event_failure(ev),
                    operation: ev.name.clone(),
                    proto: Some(ev.proto.clone()),
                    t,
                    ..Default::default()
                },
                trace::READ | trace::WRITE => NetworkEvent {
                    failure: event_failure(ev),
                    num_bytes,
                    operation: ev.name.clone(),
                    t,
                    ..Default::default()
                },
                trace::READ_FROM | trace::WRITE_TO => NetworkEvent {
                    address,
                    failure: event_failure(ev),
                    num_bytes,
                    operation: ev.name.clone(),
                    t,
                    ..Default::default()
                },
                _ => NetworkEvent {
                    operation: ev.name.clone(),
                    t,
                    ..Default::default()
                },
            }
        })
        .collect()
}

/// One entry per completed handshake of any TLS-capable transport
pub fn tls_handshakes_list(begin: Instant, events: &[Event]) -> Vec<TlsHandshake> {
    events
        .iter()
        .filter(|ev| ev.name.ends_with("_handshake_done"))
        .map(|ev| TlsHandshake {
            cipher_suite: ev.tls_cipher_suite.clone(),
            failure: event_failure(ev),
            negotiated_protocol: ev.tls_negotiated_proto.clone(),
            no_tls_verify: ev.no_tls_verify,
            peer_certificates: ev
                .tls_peer_certs
                .iter()
                .map(|c| MaybeBinaryValue::new(c.clone()))
                .collect(),
            server_name: ev.tls_server_name.clone(),
            t: elapsed(begin, ev),
            tls_version: ev.tls_version.clone(),
        })
        .collect()
}

/// Classified failure string, or None for no error
pub fn new_failure(err: Option<&(dyn Error + 'static)>) -> Option<String> {
    err.map(|e| errors::failure_of(e).to_string())
}

/// Operation that failed, `unknown` when the error was never tagged
pub fn new_failed_operation(err: Option<&(dyn Error + 'static)>) -> Option<String> {
    err.map(|e| {
        errors::operation_of(e)
            .unwrap_or(Operation::Unknown)
            .to_string()
    })
}

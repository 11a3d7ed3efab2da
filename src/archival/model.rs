//! Wire-format report entries.

use std::collections::BTreeMap;
use std::fmt;

use base64::{engine::general_purpose, Engine as _};
use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

/// Bytes that serialize as a JSON string when they are valid UTF-8 and as
/// `{"format":"base64","data":...}` otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaybeBinaryValue {
    pub value: Vec<u8>,
}

impl MaybeBinaryValue {
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

impl From<&str> for MaybeBinaryValue {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl fmt::Display for MaybeBinaryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.value))
    }
}

impl Serialize for MaybeBinaryValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match std::str::from_utf8(&self.value) {
            Ok(s) => serializer.serialize_str(s),
            Err(_) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("format", "base64")?;
                map.serialize_entry("data", &general_purpose::STANDARD.encode(&self.value))?;
                map.end()
            }
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawMaybeBinary {
    Text(String),
    Binary {
        #[serde(default)]
        format: Option<String>,
        #[serde(default)]
        data: Option<String>,
    },
}

impl<'de> Deserialize<'de> for MaybeBinaryValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match RawMaybeBinary::deserialize(deserializer)? {
            RawMaybeBinary::Text(s) => Ok(Self::new(s)),
            RawMaybeBinary::Binary { format, data } => {
                if format.as_deref() != Some("base64") {
                    return Err(de::Error::custom("missing or invalid format field"));
                }
                let data = data.ok_or_else(|| de::Error::custom("missing data field"))?;
                let value = general_purpose::STANDARD
                    .decode(data)
                    .map_err(de::Error::custom)?;
                Ok(Self { value })
            }
        }
    }
}

/// Header as a `[key, value]` pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(String, MaybeBinaryValue)", into = "(String, MaybeBinaryValue)")]
pub struct HttpHeader {
    pub key: String,
    pub value: MaybeBinaryValue,
}

impl From<(String, MaybeBinaryValue)> for HttpHeader {
    fn from((key, value): (String, MaybeBinaryValue)) -> Self {
        Self { key, value }
    }
}

impl From<HttpHeader> for (String, MaybeBinaryValue) {
    fn from(h: HttpHeader) -> Self {
        (h.key, h.value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TcpConnectStatus {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub blocked: Option<bool>,
    pub failure: Option<String>,
    pub success: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TcpConnectEntry {
    pub ip: String,
    pub port: u16,
    pub status: TcpConnectStatus,
    pub t: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DnsAnswerEntry {
    #[serde(skip_serializing_if = "is_zero", default)]
    pub asn: i64,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub as_org_name: String,
    pub answer_type: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ipv4: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ipv6: Option<String>,
    #[serde(default)]
    pub ttl: Option<u32>,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DnsQueryEntry {
    pub answers: Vec<DnsAnswerEntry>,
    pub engine: String,
    pub failure: Option<String>,
    pub hostname: String,
    pub query_type: String,
    pub resolver_hostname: Option<String>,
    pub resolver_port: Option<String>,
    pub resolver_address: String,
    pub t: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkEvent {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub address: Option<String>,
    pub failure: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub num_bytes: Option<i64>,
    pub operation: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub proto: Option<String>,
    pub t: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TlsHandshake {
    pub cipher_suite: String,
    pub failure: Option<String>,
    pub negotiated_protocol: String,
    pub no_tls_verify: bool,
    pub peer_certificates: Vec<MaybeBinaryValue>,
    pub server_name: String,
    pub t: f64,
    pub tls_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpTor {
    pub exit_ip: Option<String>,
    pub exit_name: Option<String>,
    pub is_tor: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub body: MaybeBinaryValue,
    pub body_is_truncated: bool,
    pub headers_list: Vec<HttpHeader>,
    pub headers: BTreeMap<String, MaybeBinaryValue>,
    pub method: String,
    pub tor: HttpTor,
    pub x_transport: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub body: MaybeBinaryValue,
    pub body_is_truncated: bool,
    pub code: i64,
    pub headers_list: Vec<HttpHeader>,
    pub headers: BTreeMap<String, MaybeBinaryValue>,
    #[serde(skip)]
    pub locations: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestEntry {
    pub failure: Option<String>,
    pub request: HttpRequest,
    pub response: HttpResponse,
    pub t: f64,
}

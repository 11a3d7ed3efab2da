//! Local servers and canned replies shared by the unit tests.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, Record, RecordType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use url::Url;

/// Builds the reply to `query` carrying the addresses matching its type
pub fn dns_reply(query: &Message, addrs: &[&str], rcode: ResponseCode) -> Message {
    let mut reply = Message::new();
    reply
        .set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .set_recursion_available(true)
        .set_response_code(rcode);
    reply.add_queries(query.queries().to_vec());
    let Some(question) = query.queries().first() else {
        return reply;
    };
    for addr in addrs {
        let rdata = match (addr.parse::<IpAddr>().unwrap(), question.query_type()) {
            (IpAddr::V4(v4), RecordType::A) => RData::A(A::from(v4)),
            (IpAddr::V6(v6), RecordType::AAAA) => RData::AAAA(AAAA::from(v6)),
            _ => continue,
        };
        reply.add_answer(Record::from_rdata(question.name().clone(), 60, rdata));
    }
    reply
}

fn answer(query: &[u8], addrs: &[String]) -> Vec<u8> {
    let query = Message::from_vec(query).unwrap();
    let addrs: Vec<&str> = addrs.iter().map(String::as_str).collect();
    dns_reply(&query, &addrs, ResponseCode::NoError).to_vec().unwrap()
}

/// UDP DNS server answering every query with `addrs`; returns its address
pub async fn spawn_udp_dns_server(addrs: Vec<&str>) -> String {
    let addrs: Vec<String> = addrs.into_iter().map(String::from).collect();
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let local = socket.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            let reply = answer(&buf[..n], &addrs);
            let _ = socket.send_to(&reply, peer).await;
        }
    });
    local
}

/// Length-prefixed DNS over TCP server
pub async fn spawn_tcp_dns_server(addrs: Vec<&str>) -> String {
    let addrs: Vec<String> = addrs.into_iter().map(String::from).collect();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let addrs = addrs.clone();
            tokio::spawn(async move {
                let mut header = [0u8; 2];
                while stream.read_exact(&mut header).await.is_ok() {
                    let mut query = vec![0u8; u16::from_be_bytes(header) as usize];
                    if stream.read_exact(&mut query).await.is_err() {
                        return;
                    }
                    let reply = answer(&query, &addrs);
                    let mut framed = (reply.len() as u16).to_be_bytes().to_vec();
                    framed.extend_from_slice(&reply);
                    if stream.write_all(&framed).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    local
}

/// No-auth SOCKS5 proxy. A zero `reply_code` forwards the connection,
/// any other value is sent back as the CONNECT reply.
pub async fn spawn_socks5_proxy(reply_code: u8) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_socks5(stream, reply_code));
        }
    });
    local
}

async fn serve_socks5(mut stream: TcpStream, reply_code: u8) -> std::io::Result<()> {
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await?;
    let mut methods = vec![0u8; greeting[1] as usize];
    stream.read_exact(&mut methods).await?;
    stream.write_all(&[5, 0]).await?;

    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    let host = match request[3] {
        1 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            IpAddr::from(ip).to_string()
        }
        4 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            IpAddr::from(ip).to_string()
        }
        _ => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
    };
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    let port = u16::from_be_bytes(port);

    let reply = |code: u8| [5, code, 0, 1, 0, 0, 0, 0, 0, 0];
    if reply_code != 0 {
        stream.write_all(&reply(reply_code)).await?;
        return Ok(());
    }
    let mut upstream = match TcpStream::connect((host.as_str(), port)).await {
        Ok(upstream) => upstream,
        Err(_) => {
            stream.write_all(&reply(5)).await?;
            return Ok(());
        }
    };
    stream.write_all(&reply(0)).await?;
    tokio::io::copy_bidirectional(&mut stream, &mut upstream).await?;
    Ok(())
}

/// Serialises an HTTP/1.1 response that closes the connection
pub fn raw_response(status: u16, headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
    let reason = hyper::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Status");
    let mut out = format!("HTTP/1.1 {} {}\r\n", status, reason);
    for (key, value) in headers {
        out.push_str(&format!("{}: {}\r\n", key, value));
    }
    out.push_str(&format!("Content-Length: {}\r\nConnection: close\r\n\r\n", body.len()));
    let mut out = out.into_bytes();
    out.extend_from_slice(body);
    out
}

/// Plain HTTP server writing whatever bytes the handler returns
pub struct HttpServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
}

impl HttpServer {
    pub fn url(&self, path: &str) -> Url {
        Url::parse(&format!("http://{}{}", self.addr, path)).unwrap()
    }

    /// Request heads received so far, in arrival order
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

pub async fn spawn_http_server<F>(handler: F) -> HttpServer
where
    F: Fn(&str) -> Vec<u8> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let handler = Arc::new(handler);
    let seen = requests.clone();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let handler = handler.clone();
            let seen = seen.clone();
            tokio::spawn(async move {
                let Some(head) = read_head(&mut stream).await else {
                    return;
                };
                seen.lock().unwrap().push(head.clone());
                let response = handler(&head);
                let _ = stream.write_all(&response).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    HttpServer { addr, requests }
}

async fn read_head(stream: &mut TcpStream) -> Option<String> {
    let mut data = Vec::new();
    let mut buf = [0u8; 1024];
    while !data.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        data.extend_from_slice(&buf[..n]);
    }
    Some(String::from_utf8_lossy(&data).into_owned())
}

/// Plain-HTTP DNS-over-HTTPS endpoint answering POSTed queries with `addrs`
pub async fn spawn_doh_server(addrs: Vec<&str>) -> Url {
    let addrs: Vec<String> = addrs.into_iter().map(String::from).collect();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let addrs = addrs.clone();
            tokio::spawn(async move {
                let Some(query) = read_post_body(&mut stream).await else {
                    return;
                };
                let reply = answer(&query, &addrs);
                let response = raw_response(200, &[("Content-Type", "application/dns-message")], &reply);
                let _ = stream.write_all(&response).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    Url::parse(&format!("http://{}/dns-query", local)).unwrap()
}

async fn read_post_body(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut data = Vec::new();
    let mut buf = [0u8; 1024];
    let head_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        data.extend_from_slice(&buf[..n]);
    };
    let head = String::from_utf8_lossy(&data[..head_end]).to_ascii_lowercase();
    let length: usize = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse().ok())?;
    while data.len() < head_end + length {
        let n = stream.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        data.extend_from_slice(&buf[..n]);
    }
    Some(data[head_end..head_end + length].to_vec())
}

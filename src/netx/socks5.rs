use std::io;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::context::Context;
use crate::endpoint::split_host_port;
use crate::errors::{ErrWrapper, Operation};
use crate::netx::dialer::{BoxConn, Dialer};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Socks5Error {
    #[error("socks5: unexpected server version {0}")]
    BadVersion(u8),
    #[error("socks5: no acceptable authentication method")]
    NoAcceptableAuth,
    #[error("socks5: {0}")]
    Reply(&'static str),
    #[error("socks5: invalid target {0}")]
    InvalidTarget(String),
}

fn reply_message(code: u8) -> &'static str {
    match code {
        1 => "general server failure",
        2 => "connection not allowed by ruleset",
        3 => "network unreachable",
        4 => "host unreachable",
        5 => "connection refused",
        6 => "TTL expired",
        7 => "command not supported",
        8 => "address type not supported",
        _ => "unknown reply code",
    }
}

/// Dials targets through a SOCKS5 proxy (no authentication, CONNECT only)
pub struct Socks5Dialer {
    proxy_address: String,
    dialer: Arc<dyn Dialer>,
}

impl Socks5Dialer {
    pub fn new(proxy_address: String, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            proxy_address,
            dialer,
        }
    }

    async fn negotiate(conn: &mut BoxConn, target: &str) -> Result<(), ErrWrapper> {
        let wrap_io = |e: io::Error| ErrWrapper::new(Operation::Connect, e);
        let fail = |e: Socks5Error| ErrWrapper::new(Operation::Connect, e);

        conn.write_all(&[5, 1, 0]).await.map_err(wrap_io)?;
        let mut choice = [0u8; 2];
        conn.read_exact(&mut choice).await.map_err(wrap_io)?;
        if choice[0] != 5 {
            return Err(fail(Socks5Error::BadVersion(choice[0])));
        }
        if choice[1] != 0 {
            return Err(fail(Socks5Error::NoAcceptableAuth));
        }

        let (host, port) = split_host_port(target).map_err(|e| ErrWrapper::new(Operation::Connect, e))?;
        let port: u16 = port
            .parse()
            .map_err(|_| fail(Socks5Error::InvalidTarget(target.to_string())))?;
        let mut request = vec![5, 1, 0];
        match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => {
                request.push(1);
                request.extend_from_slice(&ip.octets());
            }
            Ok(IpAddr::V6(ip)) => {
                request.push(4);
                request.extend_from_slice(&ip.octets());
            }
            Err(_) => {
                if host.len() > 255 {
                    return Err(fail(Socks5Error::InvalidTarget(target.to_string())));
                }
                request.push(3);
                request.push(host.len() as u8);
                request.extend_from_slice(host.as_bytes());
            }
        }
        request.extend_from_slice(&port.to_be_bytes());
        conn.write_all(&request).await.map_err(wrap_io)?;

        let mut head = [0u8; 4];
        conn.read_exact(&mut head).await.map_err(wrap_io)?;
        if head[0] != 5 {
            return Err(fail(Socks5Error::BadVersion(head[0])));
        }
        if head[1] != 0 {
            return Err(fail(Socks5Error::Reply(reply_message(head[1]))));
        }
        let bound_len = match head[3] {
            1 => 4,
            4 => 16,
            3 => {
                let mut len = [0u8; 1];
                conn.read_exact(&mut len).await.map_err(wrap_io)?;
                len[0] as usize
            }
            _ => return Err(fail(Socks5Error::Reply(reply_message(8)))),
        };
        let mut bound = vec![0u8; bound_len + 2];
        conn.read_exact(&mut bound).await.map_err(wrap_io)?;
        Ok(())
    }
}

#[async_trait]
impl Dialer for Socks5Dialer {
    async fn dial(&self, ctx: &Context, network: &str, address: &str) -> Result<BoxConn, ErrWrapper> {
        let mut conn = self.dialer.dial(ctx, network, &self.proxy_address).await?;
        ctx.run(Self::negotiate(&mut conn, address))
            .await
            .map_err(|e| ErrWrapper::new(Operation::Connect, e))??;
        debug!("socks5 tunnel to {} via {}", address, self.proxy_address);
        Ok(conn)
    }
}

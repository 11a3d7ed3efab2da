use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::context::Context;
use crate::endpoint::{is_ip_literal, join_host_port, split_host_port};
use crate::errors::{ErrWrapper, Operation};
use crate::netx::dns::DnsError;
use crate::netx::resolver::Resolver;
use crate::trace::{self, Event, Saver};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Byte stream produced by a dialer
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Conn for T {}

pub type BoxConn = Box<dyn Conn>;

#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connects to `address` (`host:port`) over `network` ("tcp")
    async fn dial(&self, ctx: &Context, network: &str, address: &str) -> Result<BoxConn, ErrWrapper>;
}

/// Dialer that resolves with a `Resolver` and connects over plain TCP
pub struct NetDialer {
    resolver: Arc<dyn Resolver>,
    saver: Option<Arc<Saver>>,
    timeout: Duration,
}

impl NetDialer {
    pub fn new(resolver: Arc<dyn Resolver>, saver: Option<Arc<Saver>>) -> Self {
        Self {
            resolver,
            saver,
            timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    async fn connect_one(&self, ctx: &Context, endpoint: &str) -> Result<BoxConn, ErrWrapper> {
        let outcome = ctx
            .run(tokio::time::timeout(self.timeout, TcpStream::connect(endpoint)))
            .await;
        let result = match outcome {
            Err(ctx_err) => Err(ErrWrapper::new(Operation::Connect, ctx_err)),
            Ok(Err(elapsed)) => Err(ErrWrapper::new(Operation::Connect, elapsed)),
            Ok(Ok(Err(io_err))) => Err(ErrWrapper::new(Operation::Connect, io_err)),
            Ok(Ok(Ok(stream))) => Ok(stream),
        };
        if let Some(saver) = &self.saver {
            let mut ev = Event::new(trace::CONNECT);
            ev.address = endpoint.to_string();
            ev.proto = "tcp".to_string();
            ev.err = result.as_ref().err().cloned();
            saver.write(ev);
        }
        let stream = result?;
        debug!("connected to {}", endpoint);
        let conn: BoxConn = Box::new(MeasuredConn::new(stream, self.saver.clone()));
        Ok(conn)
    }
}

#[async_trait]
impl Dialer for NetDialer {
    async fn dial(&self, ctx: &Context, network: &str, address: &str) -> Result<BoxConn, ErrWrapper> {
        if network != "tcp" {
            return Err(ErrWrapper::new(
                Operation::Connect,
                format!("dial: unsupported network {}", network),
            ));
        }
        let (host, port) =
            split_host_port(address).map_err(|e| ErrWrapper::new(Operation::Connect, e))?;
        let addresses = if is_ip_literal(&host) {
            vec![host]
        } else {
            self.resolver.lookup_host(ctx, &host).await?
        };
        let mut last_err = None;
        for ip in addresses {
            match self.connect_one(ctx, &join_host_port(&ip, &port)).await {
                Ok(conn) => return Ok(conn),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| ErrWrapper::new(Operation::Resolve, DnsError::NoAnswer)))
    }
}

/// Connection that tags I/O errors and, with a saver, records reads and writes
pub struct MeasuredConn<T> {
    inner: T,
    saver: Option<Arc<Saver>>,
}

impl<T> MeasuredConn<T> {
    pub fn new(inner: T, saver: Option<Arc<Saver>>) -> Self {
        Self { inner, saver }
    }

    fn record(&self, name: &str, num_bytes: usize, err: Option<ErrWrapper>) {
        if let Some(saver) = &self.saver {
            let mut ev = Event::new(name);
            ev.num_bytes = num_bytes;
            ev.err = err;
            saver.write(ev);
        }
    }
}

fn wrap_io(operation: Operation, err: io::Error) -> (io::Error, ErrWrapper) {
    let kind = err.kind();
    let wrapped = ErrWrapper::new(operation, err);
    (io::Error::new(kind, wrapped.clone()), wrapped)
}

impl<T: AsyncRead + Unpin> AsyncRead for MeasuredConn<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let wanted = buf.remaining();
        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - before;
                let eof = (n == 0 && wanted > 0).then(|| {
                    ErrWrapper::new(Operation::Read, io::Error::from(io::ErrorKind::UnexpectedEof))
                });
                self.record(trace::READ, n, eof);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(err)) => {
                let (err, wrapped) = wrap_io(Operation::Read, err);
                self.record(trace::READ, 0, Some(wrapped));
                Poll::Ready(Err(err))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for MeasuredConn<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        match Pin::new(&mut self.inner).poll_write(cx, data) {
            Poll::Ready(Ok(n)) => {
                self.record(trace::WRITE, n, None);
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(err)) => {
                let (err, wrapped) = wrap_io(Operation::Write, err);
                self.record(trace::WRITE, 0, Some(wrapped));
                Poll::Ready(Err(err))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

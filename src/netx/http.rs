use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hyper::body::HttpBody;
use hyper::{Body, Request};
use tracing::debug;
use url::Url;

use crate::context::{Context, ContextError};
use crate::endpoint::join_host_port;
use crate::errors::{ErrWrapper, Operation};
use crate::netx::dialer::{BoxConn, Dialer};
use crate::netx::tls::TlsDialer;
use crate::trace::{self, Event, Saver};

pub const DEFAULT_MAX_BODY_SNAPSHOT_SIZE: usize = 1 << 17;

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    /// Overrides the Host header (and the HTTP/2 authority)
    pub host: Option<String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: "GET".to_string(),
            url,
            headers: Vec::new(),
            host: None,
            body: Vec::new(),
        }
    }

    fn host_header(&self) -> String {
        if let Some(host) = &self.host {
            return host.clone();
        }
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, Vec<u8>)>,
    /// Leading bytes of the body, up to the snapshot limit
    pub body: Vec<u8>,
    pub body_is_truncated: bool,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .and_then(|(_, value)| std::str::from_utf8(value).ok())
    }

    pub fn header_values(&self, name: &str) -> Vec<&[u8]> {
        self.headers
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_slice())
            .collect()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum HttpError {
    /// The context was already done before the transaction started
    #[error("{0}")]
    Canceled(#[from] ContextError),
    #[error("{0}")]
    Net(#[from] ErrWrapper),
    #[error("http: invalid request: {0}")]
    InvalidRequest(String),
}

/// Performs one HTTP transaction and fully drains the response body
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn round_trip(&self, ctx: &Context, request: &HttpRequest) -> Result<HttpResponse, HttpError>;
}

/// Capitalises each dash-separated word of a header name
pub fn canonical_header_key(key: &str) -> String {
    key.split('-')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// HTTP/1.1 and HTTP/2 over the measurement's own dialers
pub struct NetHttpTransport {
    dialer: Arc<dyn Dialer>,
    tls_dialer: Arc<TlsDialer>,
    saver: Option<Arc<Saver>>,
    max_body_snapshot_size: usize,
    next_transaction_id: AtomicU64,
}

impl NetHttpTransport {
    pub fn new(
        dialer: Arc<dyn Dialer>,
        tls_dialer: Arc<TlsDialer>,
        saver: Option<Arc<Saver>>,
        max_body_snapshot_size: usize,
    ) -> Self {
        Self {
            dialer,
            tls_dialer,
            saver,
            max_body_snapshot_size,
            next_transaction_id: AtomicU64::new(1),
        }
    }

    fn record(&self, ev: Event) {
        if let Some(saver) = &self.saver {
            saver.write(ev);
        }
    }

    async fn connect(&self, ctx: &Context, url: &Url) -> Result<(BoxConn, bool), HttpError> {
        let host = url
            .host_str()
            .ok_or_else(|| HttpError::InvalidRequest(format!("missing host in {}", url)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port = url
            .port_or_known_default()
            .ok_or_else(|| HttpError::InvalidRequest(format!("missing port in {}", url)))?;
        let address = join_host_port(host, &port.to_string());
        match url.scheme() {
            "http" => Ok((self.dialer.dial(ctx, "tcp", &address).await?, false)),
            "https" => {
                let conn = self.tls_dialer.dial_tls(ctx, "tcp", &address).await?;
                let h2 = conn.get_ref().1.alpn_protocol() == Some(b"h2".as_slice());
                let conn: BoxConn = Box::new(conn);
                Ok((conn, h2))
            }
            other => Err(HttpError::InvalidRequest(format!("unsupported scheme {}", other))),
        }
    }

    async fn exchange(
        &self,
        ctx: &Context,
        request: &HttpRequest,
        response: &mut Option<HttpResponse>,
    ) -> Result<(), HttpError> {
        if let Some(err) = ctx.err() {
            return Err(HttpError::Canceled(err));
        }
        let (conn, h2) = self.connect(ctx, &request.url).await?;
        let round_trip = |e: hyper::Error| ErrWrapper::new(Operation::HttpRoundTrip, e);
        let canceled = |e: ContextError| ErrWrapper::new(Operation::HttpRoundTrip, e);

        let mut builder = hyper::client::conn::Builder::new();
        builder.http2_only(h2);
        let (mut sender, connection) = ctx
            .run(builder.handshake::<_, Body>(conn))
            .await
            .map_err(canceled)?
            .map_err(round_trip)?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("http connection closed: {}", e);
            }
        });

        let host = request.host_header();
        let path = match request.url.query() {
            Some(query) => format!("{}?{}", request.url.path(), query),
            None => request.url.path().to_string(),
        };
        let uri = if h2 {
            format!("{}://{}{}", request.url.scheme(), host, path)
        } else {
            path
        };
        let mut builder = Request::builder().method(request.method.as_str()).uri(uri);
        if !h2 {
            builder = builder.header("Host", host.as_str());
        }
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        let hyper_request = builder
            .body(Body::from(request.body.clone()))
            .map_err(|e| HttpError::InvalidRequest(e.to_string()))?;

        let hyper_response = ctx
            .run(sender.send_request(hyper_request))
            .await
            .map_err(canceled)?
            .map_err(round_trip)?;

        let partial = response.insert(HttpResponse {
            status: hyper_response.status().as_u16(),
            headers: hyper_response
                .headers()
                .iter()
                .map(|(k, v)| (canonical_header_key(k.as_str()), v.as_bytes().to_vec()))
                .collect(),
            ..Default::default()
        });

        let mut body = hyper_response.into_body();
        loop {
            let chunk = match ctx.run(body.data()).await {
                Err(ctx_err) => return Err(ErrWrapper::new(Operation::Read, ctx_err).into()),
                Ok(None) => break,
                Ok(Some(Err(e))) => return Err(ErrWrapper::new(Operation::Read, e).into()),
                Ok(Some(Ok(chunk))) => chunk,
            };
            let room = self.max_body_snapshot_size.saturating_sub(partial.body.len());
            if chunk.len() > room {
                partial.body.extend_from_slice(&chunk[..room]);
                partial.body_is_truncated = true;
            } else {
                partial.body.extend_from_slice(&chunk);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl HttpTransport for NetHttpTransport {
    async fn round_trip(&self, ctx: &Context, request: &HttpRequest) -> Result<HttpResponse, HttpError> {
        let id = self.next_transaction_id.fetch_add(1, Ordering::Relaxed);
        let mut request_headers = vec![("Host".to_string(), request.host_header().into_bytes())];
        request_headers.extend(
            request
                .headers
                .iter()
                .map(|(k, v)| (canonical_header_key(k), v.as_bytes().to_vec())),
        );

        let mut start = Event::new(trace::HTTP_TRANSACTION_START);
        start.transaction_id = id;
        start.http_method = request.method.clone();
        start.http_url = request.url.to_string();
        start.http_request_headers = request_headers.clone();
        start.transport = "tcp".to_string();
        self.record(start);

        debug!("{} {}", request.method, request.url);
        let mut response = None;
        let result = self.exchange(ctx, request, &mut response).await;

        let mut done = Event::new(trace::HTTP_TRANSACTION_DONE);
        done.transaction_id = id;
        done.http_method = request.method.clone();
        done.http_url = request.url.to_string();
        done.http_request_headers = request_headers;
        done.transport = "tcp".to_string();
        if let Some(resp) = &response {
            done.http_status_code = i64::from(resp.status);
            done.http_response_headers = resp.headers.clone();
            done.data = resp.body.clone();
            done.data_is_truncated = resp.body_is_truncated;
        }
        if let Err(err) = &result {
            done.err = Some(ErrWrapper::new(Operation::HttpRoundTrip, err.clone()));
        }
        self.record(done);

        result?;
        response.ok_or_else(|| HttpError::InvalidRequest("no response".to_string()))
    }
}

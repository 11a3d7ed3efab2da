use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::HeaderValue;
use tracing::{debug, info};
use url::Url;

use crate::context::Context;
use crate::errors::HttpRequestFailed;
use crate::netx::{Configuration, HttpRequest};
use crate::urlgetter::{Config, Error};

pub const MAX_REDIRECTS: usize = 10;

pub const DEFAULT_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
pub const DEFAULT_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Executes the operation selected by the target URL scheme
pub struct Runner<'a> {
    pub config: &'a Config,
    pub configuration: &'a Configuration,
    pub target: &'a str,
}

impl Runner<'_> {
    pub async fn run(&self, ctx: &Context) -> Result<(), Error> {
        let target = Url::parse(self.target).map_err(Error::InvalidTarget)?;
        info!("urlgetter: {} {}", target.scheme(), self.target);
        match target.scheme() {
            "http" | "https" => self.http_get(ctx, target).await,
            "dnslookup" => self.dns_lookup(ctx, &target).await,
            "tlshandshake" => self.tls_handshake(ctx, &target).await,
            "tcpconnect" => self.tcp_connect(ctx, &target).await,
            _ => Err(Error::UnknownScheme),
        }
    }

    fn base_headers(&self) -> Vec<(String, String)> {
        let user_agent = self
            .config
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
        vec![
            ("Accept".to_string(), DEFAULT_ACCEPT.to_string()),
            ("Accept-Language".to_string(), DEFAULT_ACCEPT_LANGUAGE.to_string()),
            ("User-Agent".to_string(), user_agent),
        ]
    }

    async fn http_get(&self, ctx: &Context, url: Url) -> Result<(), Error> {
        let jar = Jar::default();
        let mut url = url;
        let mut method = self
            .config
            .method
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "GET".to_string());
        let mut body = Vec::new();
        let mut redirects = 0;
        loop {
            let mut headers = self.base_headers();
            if let Some(cookie) = jar.cookies(&url).and_then(|v| v.to_str().map(String::from).ok()) {
                headers.push(("Cookie".to_string(), cookie));
            }
            let request = HttpRequest {
                method: method.clone(),
                url: url.clone(),
                headers,
                host: self.config.http_host.clone().filter(|h| !h.is_empty()),
                body: body.clone(),
            };
            let response = self.configuration.http_transport.round_trip(ctx, &request).await?;

            let set_cookie: Vec<HeaderValue> = response
                .header_values("set-cookie")
                .into_iter()
                .filter_map(|v| HeaderValue::from_bytes(v).ok())
                .collect();
            if !set_cookie.is_empty() {
                jar.set_cookies(&mut set_cookie.iter(), &url);
            }

            let location = response.header("location").filter(|_| is_redirect(response.status));
            if let (false, Some(location)) = (self.config.no_follow_redirects, location) {
                redirects += 1;
                if redirects >= MAX_REDIRECTS {
                    return Err(Error::TooManyRedirects(MAX_REDIRECTS));
                }
                let next = url.join(location).map_err(Error::InvalidTarget)?;
                debug!("redirect {} -> {}", url, next);
                if matches!(response.status, 301..=303) && method != "HEAD" {
                    method = "GET".to_string();
                    body.clear();
                }
                url = next;
                continue;
            }

            if self.config.fail_on_http_error && response.status >= 400 {
                return Err(HttpRequestFailed.into());
            }
            return Ok(());
        }
    }

    async fn dns_lookup(&self, ctx: &Context, target: &Url) -> Result<(), Error> {
        let host = target.host_str().unwrap_or_default();
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let addrs = self.configuration.resolver.lookup_host(ctx, host).await?;
        debug!("dnslookup {} -> {:?}", host, addrs);
        Ok(())
    }

    async fn tls_handshake(&self, ctx: &Context, target: &Url) -> Result<(), Error> {
        let conn = self
            .configuration
            .tls_dialer
            .dial_tls(ctx, "tcp", &endpoint_of(target))
            .await?;
        drop(conn);
        Ok(())
    }

    async fn tcp_connect(&self, ctx: &Context, target: &Url) -> Result<(), Error> {
        let conn = self
            .configuration
            .dialer
            .dial(ctx, "tcp", &endpoint_of(target))
            .await?;
        drop(conn);
        Ok(())
    }
}

fn is_redirect(status: u16) -> bool {
    matches!(status, 301 | 302 | 303 | 307 | 308)
}

/// `host:port` of an opaque target such as `tcpconnect://1.1.1.1:853`
fn endpoint_of(target: &Url) -> String {
    let host = target.host_str().unwrap_or_default();
    match target.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

#[cfg(test)]
mod runner_unit_tests {
    use super::*;

    #[test]
    fn test_endpoint_of() {
        let u = Url::parse("tcpconnect://1.1.1.1:853").unwrap();
        assert_eq!(endpoint_of(&u), "1.1.1.1:853");
        let u = Url::parse("tlshandshake://[::1]:443").unwrap();
        assert_eq!(endpoint_of(&u), "[::1]:443");
    }

    #[test]
    fn test_is_redirect() {
        for code in [301, 302, 303, 307, 308] {
            assert!(is_redirect(code));
        }
        assert!(!is_redirect(200));
        assert!(!is_redirect(304));
    }
}

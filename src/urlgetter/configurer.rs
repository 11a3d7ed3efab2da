use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;
use url::Url;

use crate::endpoint::join_host_port;
use crate::netx::dialer::{Dialer, NetDialer};
use crate::netx::dns::{DnsOverHttps, DnsOverStream, DnsOverUdp, DnsTransport};
use crate::netx::http::{HttpTransport, NetHttpTransport, DEFAULT_MAX_BODY_SNAPSHOT_SIZE};
use crate::netx::resolver::{
    BogonResolver, CacheResolver, Resolver, SaverResolver, SerialResolver, SystemResolver,
};
use crate::netx::socks5::Socks5Dialer;
use crate::netx::tls::{configure_tls_version, InvalidTlsVersion, TlsConfig, TlsDialer};
use crate::netx::Configuration;
use crate::trace::Saver;
use crate::urlgetter::Config;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid DNSCache string")]
    InvalidDnsCache,
    #[error("invalid domain in DNSCache")]
    InvalidDnsCacheDomain,
    #[error("invalid IP in DNSCache")]
    InvalidDnsCacheIp,
    #[error("unsupported resolver scheme")]
    UnsupportedResolverScheme,
    #[error("invalid resolver URL: {0}")]
    InvalidResolverUrl(#[source] url::ParseError),
    #[error("missing host in resolver URL")]
    MissingResolverHost,
    #[error("{0}")]
    InvalidTlsVersion(#[from] InvalidTlsVersion),
    #[error("HTTP/3 is not supported")]
    Http3Unsupported,
    #[error("invalid proxy URL: {0}")]
    InvalidProxyUrl(String),
    #[error("unsupported proxy scheme")]
    UnsupportedProxyScheme,
}

lazy_static! {
    static ref DOMAIN_RE: Regex =
        Regex::new(r"^(?:[-A-Za-z0-9_]+\.)+[A-Za-z]{2,}\.?$").expect("valid domain regex");
}

const DOH_ALIASES: &[(&str, &str)] = &[
    ("doh://powerdns", "https://doh.powerdns.org/"),
    ("doh://google", "https://dns.google/dns-query"),
    ("doh://cloudflare", "https://cloudflare-dns.com/dns-query"),
];

/// Parses a DNSCache seed string into a hostname -> addresses map
pub fn parse_dns_cache(entry: &str) -> Result<HashMap<String, Vec<String>>, ConfigError> {
    let fields: Vec<&str> = entry.split_whitespace().collect();
    if fields.len() < 2 {
        return Err(ConfigError::InvalidDnsCache);
    }
    if !DOMAIN_RE.is_match(fields[0]) {
        return Err(ConfigError::InvalidDnsCacheDomain);
    }
    let mut addrs = Vec::new();
    for field in &fields[1..] {
        let ip: IpAddr = field.parse().map_err(|_| ConfigError::InvalidDnsCacheIp)?;
        addrs.push(ip.to_string());
    }
    let mut out = HashMap::new();
    out.insert(fields[0].to_string(), addrs);
    Ok(out)
}

fn resolver_endpoint(url: &Url, default_port: u16) -> Result<String, ConfigError> {
    let host = url.host_str().ok_or(ConfigError::MissingResolverHost)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = url.port().unwrap_or(default_port);
    Ok(join_host_port(host, &port.to_string()))
}

/// Builds the network stack a measurement runs on.
///
/// Resolver layering, innermost first: transport, DNSCache seed, bogon
/// filter, saver.
pub struct Configurer<'a> {
    pub config: &'a Config,
    pub saver: Arc<Saver>,
    /// SOCKS5 proxy of a running tunnel; overrides `Config::proxy_url`
    pub proxy_url: Option<Url>,
}

impl<'a> Configurer<'a> {
    pub fn new(config: &'a Config, saver: Arc<Saver>) -> Self {
        Self {
            config,
            saver,
            proxy_url: None,
        }
    }

    pub fn new_configuration(&self) -> Result<Configuration, ConfigError> {
        if self.config.http3_enabled {
            return Err(ConfigError::Http3Unsupported);
        }
        let proxy_address = self.proxy_address()?;
        let snapshot = self
            .config
            .max_body_snapshot_size
            .unwrap_or(DEFAULT_MAX_BODY_SNAPSHOT_SIZE);

        let mut resolver = self.base_resolver(proxy_address.as_deref())?;
        if let Some(entry) = self.config.dns_cache.as_deref() {
            resolver = Arc::new(CacheResolver::new(parse_dns_cache(entry)?, resolver));
        }
        if self.config.reject_dns_bogons {
            resolver = Arc::new(BogonResolver::new(resolver));
        }
        let resolver: Arc<dyn Resolver> = Arc::new(SaverResolver::new(resolver, self.saver.clone()));

        let dialer = self.proxied(
            Arc::new(NetDialer::new(resolver.clone(), Some(self.saver.clone()))),
            proxy_address.as_deref(),
        );

        let mut tls_config = TlsConfig {
            server_name: self.config.tls_server_name.clone(),
            next_protos: vec!["h2".to_string(), "http/1.1".to_string()],
            no_tls_verify: self.config.no_tls_verify,
            root_certs: self.config.root_certs.clone(),
            ..Default::default()
        };
        configure_tls_version(&mut tls_config, self.config.tls_version.as_deref().unwrap_or(""))?;
        let tls_dialer = Arc::new(TlsDialer::new(dialer.clone(), tls_config, Some(self.saver.clone())));
        let http_transport: Arc<dyn HttpTransport> = Arc::new(NetHttpTransport::new(
            dialer.clone(),
            tls_dialer.clone(),
            Some(self.saver.clone()),
            snapshot,
        ));
        debug!(
            "configured resolver {} {}",
            resolver.network(),
            resolver.address()
        );
        Ok(Configuration {
            saver: self.saver.clone(),
            resolver,
            dialer,
            tls_dialer,
            http_transport,
            proxy_address,
        })
    }

    fn proxy_address(&self) -> Result<Option<String>, ConfigError> {
        let url = match (&self.proxy_url, self.config.proxy_url.as_deref()) {
            (Some(url), _) => url.clone(),
            (None, Some(raw)) if !raw.is_empty() => {
                Url::parse(raw).map_err(|e| ConfigError::InvalidProxyUrl(e.to_string()))?
            }
            _ => return Ok(None),
        };
        if url.scheme() != "socks5" && url.scheme() != "socks5h" {
            return Err(ConfigError::UnsupportedProxyScheme);
        }
        let host = url
            .host_str()
            .ok_or_else(|| ConfigError::InvalidProxyUrl(url.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port = url.port().unwrap_or(1080);
        Ok(Some(join_host_port(host, &port.to_string())))
    }

    fn proxied(&self, dialer: Arc<dyn Dialer>, proxy_address: Option<&str>) -> Arc<dyn Dialer> {
        match proxy_address {
            Some(proxy) => Arc::new(Socks5Dialer::new(proxy.to_string(), dialer)),
            None => dialer,
        }
    }

    fn dns_tls_dialer(&self, dialer: Arc<dyn Dialer>, alpn: &[&str]) -> Result<Arc<TlsDialer>, ConfigError> {
        let mut config = TlsConfig {
            server_name: self.config.dns_tls_server_name.clone(),
            next_protos: alpn.iter().map(|p| p.to_string()).collect(),
            root_certs: self.config.root_certs.clone(),
            ..Default::default()
        };
        configure_tls_version(&mut config, self.config.dns_tls_version.as_deref().unwrap_or(""))?;
        Ok(Arc::new(TlsDialer::new(dialer, config, Some(self.saver.clone()))))
    }

    fn base_resolver(&self, proxy_address: Option<&str>) -> Result<Arc<dyn Resolver>, ConfigError> {
        let raw = self.config.resolver_url.as_deref().unwrap_or("");
        let raw = DOH_ALIASES
            .iter()
            .find(|(alias, _)| *alias == raw)
            .map(|(_, url)| *url)
            .unwrap_or(raw);
        if raw.is_empty() || !raw.contains("://") {
            return Ok(Arc::new(SystemResolver::new()));
        }
        let url = Url::parse(raw).map_err(ConfigError::InvalidResolverUrl)?;

        // DNS traffic resolves its own endpoints with the system resolver
        let dns_dialer = self.proxied(
            Arc::new(NetDialer::new(Arc::new(SystemResolver::new()), Some(self.saver.clone()))),
            proxy_address,
        );
        let transport: Arc<dyn DnsTransport> = match url.scheme() {
            "system" => return Ok(Arc::new(SystemResolver::new())),
            "https" => {
                let tls = self.dns_tls_dialer(dns_dialer.clone(), &["h2", "http/1.1"])?;
                let http = Arc::new(DnsOverHttps::transport(dns_dialer, tls));
                Arc::new(DnsOverHttps::new(url, self.config.dns_http_host.clone(), http))
            }
            "udp" => Arc::new(DnsOverUdp::new(
                resolver_endpoint(&url, 53)?,
                Some(self.saver.clone()),
            )),
            "tcp" => Arc::new(DnsOverStream::tcp(resolver_endpoint(&url, 53)?, dns_dialer)),
            "dot" => {
                let tls = self.dns_tls_dialer(dns_dialer, &["dot"])?;
                Arc::new(DnsOverStream::tls(resolver_endpoint(&url, 853)?, tls))
            }
            _ => return Err(ConfigError::UnsupportedResolverScheme),
        };
        Ok(Arc::new(SerialResolver::new(transport)))
    }
}

#[cfg(test)]
mod configurer_tests {
    use super::*;
    use crate::context::Context;
    use crate::netx::tls::TlsVersion;
    use crate::trace;

    fn configure(config: &Config) -> Result<Configuration, ConfigError> {
        Configurer::new(config, Arc::new(Saver::new())).new_configuration()
    }

    fn with_resolver(url: &str) -> Config {
        Config {
            resolver_url: Some(url.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_is_system_resolver() {
        let c = configure(&Config::default()).unwrap();
        assert_eq!(c.resolver.network(), "system");
        assert_eq!(c.resolver.address(), "");
        assert!(c.proxy_address.is_none());
        let tls = c.tls_dialer.config();
        assert_eq!(tls.next_protos, vec!["h2".to_string(), "http/1.1".to_string()]);
        assert_eq!(tls.server_name, None);
        assert!(!tls.no_tls_verify);
    }

    #[test]
    fn test_system_spellings() {
        for url in ["system:///", "", "8.8.8.8:53"] {
            let c = configure(&with_resolver(url)).unwrap();
            assert_eq!(c.resolver.network(), "system", "{}", url);
        }
    }

    #[test]
    fn test_doh_aliases() {
        let cases = [
            ("doh://google", "https://dns.google/dns-query"),
            ("doh://cloudflare", "https://cloudflare-dns.com/dns-query"),
            ("doh://powerdns", "https://doh.powerdns.org/"),
            ("https://dns.quad9.net/dns-query", "https://dns.quad9.net/dns-query"),
        ];
        for (alias, expected) in cases {
            let c = configure(&with_resolver(alias)).unwrap();
            assert_eq!(c.resolver.network(), "doh");
            assert_eq!(c.resolver.address(), expected);
        }
    }

    #[test]
    fn test_stream_and_datagram_resolvers() {
        let c = configure(&with_resolver("udp://8.8.8.8")).unwrap();
        assert_eq!(c.resolver.network(), "udp");
        assert_eq!(c.resolver.address(), "8.8.8.8:53");

        let c = configure(&with_resolver("udp://[2001:4860:4860::8888]:5353")).unwrap();
        assert_eq!(c.resolver.address(), "[2001:4860:4860::8888]:5353");

        let c = configure(&with_resolver("tcp://8.8.8.8")).unwrap();
        assert_eq!(c.resolver.network(), "tcp");
        assert_eq!(c.resolver.address(), "8.8.8.8:53");

        let c = configure(&with_resolver("dot://dns.google")).unwrap();
        assert_eq!(c.resolver.network(), "dot");
        assert_eq!(c.resolver.address(), "dns.google:853");
    }

    #[test]
    fn test_unsupported_resolver_scheme() {
        let err = configure(&with_resolver("antani://8.8.8.8")).err().unwrap();
        assert_eq!(err.to_string(), "unsupported resolver scheme");
    }

    #[test]
    fn test_dns_tls_version_invalid() {
        let config = Config {
            resolver_url: Some("dot://dns.google".to_string()),
            dns_tls_version: Some("TLSv1.7".to_string()),
            ..Default::default()
        };
        let err = configure(&config).err().unwrap();
        assert!(matches!(err, ConfigError::InvalidTlsVersion(_)));
    }

    #[test]
    fn test_tls_settings() {
        let config = Config {
            tls_server_name: Some("www.example.com".to_string()),
            tls_version: Some("TLSv1.2".to_string()),
            no_tls_verify: true,
            ..Default::default()
        };
        let c = configure(&config).unwrap();
        let tls = c.tls_dialer.config();
        assert_eq!(tls.server_name.as_deref(), Some("www.example.com"));
        assert_eq!(tls.min_version, Some(TlsVersion::Tls12));
        assert_eq!(tls.max_version, Some(TlsVersion::Tls12));
        assert!(tls.no_tls_verify);
    }

    #[test]
    fn test_invalid_tls_version() {
        let config = Config {
            tls_version: Some("SSLv2".to_string()),
            ..Default::default()
        };
        let err = configure(&config).err().unwrap();
        assert_eq!(err.to_string(), "invalid TLS version");
    }

    #[test]
    fn test_dns_cache_errors() {
        let cases = [
            ("dns.google", "invalid DNSCache string"),
            ("antani 8.8.8.8", "invalid domain in DNSCache"),
            ("dns.google 8.8.8.8 antani", "invalid IP in DNSCache"),
        ];
        for (entry, expected) in cases {
            let config = Config {
                dns_cache: Some(entry.to_string()),
                ..Default::default()
            };
            let err = configure(&config).err().unwrap();
            assert_eq!(err.to_string(), expected, "{}", entry);
        }
    }

    #[tokio::test]
    async fn test_dns_cache_is_served_and_recorded() {
        let saver = Arc::new(Saver::new());
        let config = Config {
            dns_cache: Some("dns.google 8.8.8.8 2001:4860:4860::8888".to_string()),
            ..Default::default()
        };
        let c = Configurer::new(&config, saver.clone()).new_configuration().unwrap();
        let addrs = c.resolver.lookup_host(&Context::background(), "dns.google").await.unwrap();
        assert_eq!(addrs, vec!["8.8.8.8".to_string(), "2001:4860:4860::8888".to_string()]);
        let events = saver.read();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].name, trace::RESOLVE_DONE);
        assert_eq!(events[1].proto, "system");
    }

    #[tokio::test]
    async fn test_reject_bogons() {
        let config = Config {
            dns_cache: Some("www.example.com 10.0.0.1".to_string()),
            reject_dns_bogons: true,
            ..Default::default()
        };
        let c = configure(&config).unwrap();
        let err = c
            .resolver
            .lookup_host(&Context::background(), "www.example.com")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "dns_bogon_error");
    }

    #[test]
    fn test_http3_rejected() {
        let config = Config {
            http3_enabled: true,
            ..Default::default()
        };
        assert!(matches!(configure(&config), Err(ConfigError::Http3Unsupported)));
    }

    #[test]
    fn test_proxy_settings() {
        let config = Config {
            proxy_url: Some("socks5://127.0.0.1:9050".to_string()),
            ..Default::default()
        };
        let c = configure(&config).unwrap();
        assert_eq!(c.proxy_address.as_deref(), Some("127.0.0.1:9050"));

        let mut configurer = Configurer::new(&config, Arc::new(Saver::new()));
        configurer.proxy_url = Some(Url::parse("socks5://127.0.0.1:45678").unwrap());
        let c = configurer.new_configuration().unwrap();
        assert_eq!(c.proxy_address.as_deref(), Some("127.0.0.1:45678"));

        let config = Config {
            proxy_url: Some("http://127.0.0.1:8080".to_string()),
            ..Default::default()
        };
        assert!(matches!(configure(&config), Err(ConfigError::UnsupportedProxyScheme)));
    }

    #[test]
    fn test_config_is_not_mutated() {
        let config = with_resolver("doh://google");
        let before = format!("{:?}", config);
        configure(&config).unwrap();
        assert_eq!(format!("{:?}", config), before);
    }
}

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};
use url::Url;

use crate::archival;
use crate::context::Context;
use crate::errors::ErrWrapper;
use crate::session::{Session, TunnelConfig};
use crate::trace::Saver;
use crate::urlgetter::{Config, Configurer, Error, Runner, TestKeys};

const TUNNEL_DIR_PREFIX: &str = "urlgetter-tunnel-";

/// Runs one complete measurement of a single target
#[derive(Clone)]
pub struct Getter {
    /// Zero point for relative event times; defaults to the start of `get`
    pub begin: Option<Instant>,
    pub config: Config,
    pub session: Arc<dyn Session>,
    pub target: String,
}

impl Getter {
    pub fn new(config: Config, session: Arc<dyn Session>, target: &str) -> Self {
        Self {
            begin: None,
            config,
            session,
            target: target.to_string(),
        }
    }

    /// Measures the target. The returned `TestKeys` are filled in even when
    /// the measurement fails.
    pub async fn get(&self, ctx: &Context) -> (TestKeys, Result<(), ErrWrapper>) {
        let ctx = match self.config.timeout {
            Some(timeout) if timeout > Duration::ZERO => ctx.with_timeout(timeout),
            _ => ctx.with_cancel(),
        };
        let ctx = scopeguard::guard(ctx, |ctx| ctx.cancel());
        let begin = self.begin.unwrap_or_else(Instant::now);
        let saver = Arc::new(Saver::new());

        info!("urlgetter: measuring {}", self.target);
        let mut tk = TestKeys::default();
        let result = self
            .measure(&ctx, saver.clone(), &mut tk)
            .await
            .map_err(ErrWrapper::top_level);

        let err = result.as_ref().err().map(|e| e as &(dyn std::error::Error + 'static));
        tk.failure = archival::new_failure(err);
        tk.failed_operation = archival::new_failed_operation(err);

        let events = saver.read();
        let asn = self.session.asn_lookup();
        tk.network_events = archival::network_events_list(begin, &events);
        tk.queries = archival::dns_queries_list(begin, &events, asn.as_ref());
        tk.requests = archival::request_list(begin, &events);
        tk.tcp_connect = archival::tcp_connect_list(begin, &events);
        tk.tls_handshakes = archival::tls_handshakes_list(begin, &events);
        if let Some(first) = tk.requests.first() {
            tk.http_response_status = first.response.code;
            tk.http_response_body = first.response.body.value.clone();
            tk.http_response_locations = first.response.locations.clone();
        }
        info!(
            "urlgetter: {} done: {}",
            self.target,
            tk.failure.as_deref().unwrap_or("ok")
        );
        (tk, result)
    }

    async fn measure(&self, ctx: &Context, saver: Arc<Saver>, tk: &mut TestKeys) -> Result<(), Error> {
        tk.agent = if self.config.no_follow_redirects {
            "agent".to_string()
        } else {
            "redirect".to_string()
        };
        if let Some(cache) = self.config.dns_cache.as_ref().filter(|c| !c.is_empty()) {
            tk.dns_cache = vec![cache.clone()];
        }
        let tunnel_name = match self.config.tunnel.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => return self.configure_and_run(ctx, saver, None).await,
        };
        tk.tunnel = tunnel_name.to_string();

        let tunnel_dir = tempfile::Builder::new()
            .prefix(TUNNEL_DIR_PREFIX)
            .tempdir_in(self.session.temp_dir())?;
        let config = TunnelConfig {
            name: tunnel_name.to_string(),
            tor_args: self.session.tor_args(),
            tor_binary: self.session.tor_binary(),
            tunnel_dir: tunnel_dir.path().to_path_buf(),
        };
        let tunnel = self.session.start_tunnel(ctx, &config).await?;
        let tunnel = scopeguard::guard(tunnel, |tunnel| {
            debug!("stopping tunnel");
            tunnel.stop();
        });
        tk.bootstrap_time = tunnel.bootstrap_time().as_secs_f64();
        let proxy = tunnel.socks5_proxy_url();
        tk.socksproxy = proxy.to_string();

        let result = self.configure_and_run(ctx, saver, Some(proxy)).await;
        drop(tunnel);
        drop(tunnel_dir);
        result
    }

    async fn configure_and_run(&self, ctx: &Context, saver: Arc<Saver>, proxy_url: Option<Url>) -> Result<(), Error> {
        let configurer = Configurer {
            config: &self.config,
            saver,
            proxy_url,
        };
        let configuration = configurer.new_configuration()?;
        let runner = Runner {
            config: &self.config,
            configuration: &configuration,
            target: &self.target,
        };
        runner.run(ctx).await
    }
}

#[cfg(test)]
mod getter_tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use crate::errors::Operation;
    use crate::session::{BasicSession, TestHelper, Tunnel, TunnelError};
    use crate::testutil::{raw_response, spawn_http_server, spawn_socks5_proxy};
    use crate::trace;

    fn getter(config: Config, target: &str) -> Getter {
        Getter::new(config, Arc::new(BasicSession::default()), target)
    }

    #[tokio::test]
    async fn test_canceled_context() {
        let ctx = Context::background().with_cancel();
        ctx.cancel();
        let (tk, result) = getter(Config::default(), "http://127.0.0.1:1/").get(&ctx).await;
        let err = result.unwrap_err();
        assert!(err.is_canceled());
        assert_eq!(err.operation(), Operation::TopLevel);
        assert_eq!(tk.agent, "redirect");
        assert_eq!(tk.failure.as_deref(), Some("interrupted"));
        assert_eq!(tk.failed_operation.as_deref(), Some("top_level"));
        let operations: Vec<_> = tk.network_events.iter().map(|e| e.operation.as_str()).collect();
        assert_eq!(
            operations,
            vec![trace::HTTP_TRANSACTION_START, trace::HTTP_TRANSACTION_DONE]
        );
        assert!(tk.queries.is_empty());
        assert!(tk.tcp_connect.is_empty());
        assert!(tk.tls_handshakes.is_empty());
        assert_eq!(tk.requests.len(), 1);
        assert_eq!(tk.requests[0].request.method, "GET");
        assert_eq!(tk.requests[0].failure.as_deref(), Some("interrupted"));
        assert_eq!(tk.http_response_status, 0);
    }

    #[tokio::test]
    async fn test_timeout() {
        let config = Config {
            timeout: Some(Duration::from_nanos(1)),
            ..Default::default()
        };
        let (tk, result) = getter(config, "http://127.0.0.1:1/").get(&Context::background()).await;
        assert!(result.unwrap_err().is_deadline_exceeded());
        assert_eq!(tk.failure.as_deref(), Some("generic_timeout_error"));
        assert_eq!(tk.failed_operation.as_deref(), Some("top_level"));
    }

    #[tokio::test]
    async fn test_configuration_error() {
        let config = Config {
            resolver_url: Some("antani:///".to_string()),
            ..Default::default()
        };
        let (tk, result) = getter(config, "http://www.google.com").get(&Context::background()).await;
        assert!(result.is_err());
        assert_eq!(
            tk.failure.as_deref(),
            Some("unknown_failure: unsupported resolver scheme")
        );
        assert_eq!(tk.failed_operation.as_deref(), Some("top_level"));
        assert!(tk.requests.is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_tunnel() {
        let config = Config {
            tunnel: Some("psiphon".to_string()),
            ..Default::default()
        };
        let (tk, result) = getter(config, "http://www.google.com").get(&Context::background()).await;
        assert!(result.is_err());
        assert_eq!(tk.tunnel, "psiphon");
        assert_eq!(
            tk.failure.as_deref(),
            Some("unknown_failure: tunnel: unsupported tunnel name")
        );
        assert!(tk.socksproxy.is_empty());
    }

    #[tokio::test]
    async fn test_http_success_fills_response_fields() {
        let server = spawn_http_server(|_| raw_response(200, &[("Content-Type", "text/plain")], b"hello")).await;
        let config = Config {
            no_follow_redirects: true,
            dns_cache: Some("dns.google 8.8.8.8".to_string()),
            ..Default::default()
        };
        let url = server.url("/");
        let (tk, result) = getter(config, url.as_str()).get(&Context::background()).await;
        result.unwrap();
        assert_eq!(tk.agent, "agent");
        assert_eq!(tk.dns_cache, vec!["dns.google 8.8.8.8".to_string()]);
        assert_eq!(tk.failure, None);
        assert_eq!(tk.failed_operation, None);
        assert_eq!(tk.http_response_status, 200);
        assert_eq!(tk.http_response_body, b"hello");
        assert_eq!(tk.tcp_connect.len(), 1);
        assert!(tk.network_events.iter().any(|e| e.operation == trace::WRITE));
    }

    #[tokio::test]
    async fn test_dnslookup_queries() {
        let config = Config {
            dns_cache: Some("dns.google 8.8.8.8 2001:4860:4860::8888".to_string()),
            ..Default::default()
        };
        let (tk, result) = getter(config, "dnslookup://dns.google").get(&Context::background()).await;
        result.unwrap();
        assert_eq!(tk.queries.len(), 2);
        assert_eq!(tk.queries[0].query_type, "A");
        assert_eq!(tk.queries[0].answers[0].ipv4.as_deref(), Some("8.8.8.8"));
        assert_eq!(tk.queries[1].query_type, "AAAA");
        assert_eq!(tk.queries[0].engine, "system");
    }

    struct FakeTunnel {
        proxy: Url,
        stopped: Arc<AtomicBool>,
    }

    impl Tunnel for FakeTunnel {
        fn bootstrap_time(&self) -> Duration {
            Duration::from_millis(1500)
        }

        fn socks5_proxy_url(&self) -> Url {
            self.proxy.clone()
        }

        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    struct FakeSession {
        temp_dir: PathBuf,
        proxy: Url,
        stopped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Session for FakeSession {
        fn temp_dir(&self) -> PathBuf {
            self.temp_dir.clone()
        }

        fn tor_args(&self) -> Vec<String> {
            Vec::new()
        }

        fn tor_binary(&self) -> Option<String> {
            None
        }

        fn get_test_helpers_by_name(&self, _name: &str) -> Option<Vec<TestHelper>> {
            None
        }

        async fn start_tunnel(&self, _ctx: &Context, config: &TunnelConfig) -> Result<Box<dyn Tunnel>, TunnelError> {
            assert!(config.tunnel_dir.starts_with(&self.temp_dir));
            assert!(config.tunnel_dir.exists());
            Ok(Box::new(FakeTunnel {
                proxy: self.proxy.clone(),
                stopped: self.stopped.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn test_tunnel_proxies_and_stops() {
        let server = spawn_http_server(|_| raw_response(200, &[], b"via tunnel")).await;
        let proxy = spawn_socks5_proxy(0).await;
        let dir = tempfile::tempdir().unwrap();
        let stopped = Arc::new(AtomicBool::new(false));
        let session = Arc::new(FakeSession {
            temp_dir: dir.path().to_path_buf(),
            proxy: Url::parse(&format!("socks5://{}", proxy)).unwrap(),
            stopped: stopped.clone(),
        });
        let config = Config {
            tunnel: Some("fake".to_string()),
            ..Default::default()
        };
        let url = server.url("/");
        let (tk, result) = Getter::new(config, session, url.as_str())
            .get(&Context::background())
            .await;
        result.unwrap();
        assert!(stopped.load(Ordering::SeqCst));
        assert_eq!(tk.tunnel, "fake");
        assert_eq!(tk.bootstrap_time, 1.5);
        assert_eq!(tk.socksproxy, format!("socks5://{}", proxy));
        assert_eq!(tk.http_response_body, b"via tunnel");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}

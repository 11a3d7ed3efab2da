use std::sync::Arc;
use std::time::{Duration, SystemTime};

use lazy_static::lazy_static;
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, ProtocolVersion, RootCertStore, ServerName};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::context::Context;
use crate::endpoint::split_host_port;
use crate::errors::{ErrWrapper, Operation};
use crate::netx::dialer::{BoxConn, Dialer};
use crate::trace::{self, Event, Saver};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub type TlsConn = TlsStream<BoxConn>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls10,
    Tls11,
    Tls12,
    Tls13,
}

impl TlsVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Tls10 => "TLSv1.0",
            TlsVersion::Tls11 => "TLSv1.1",
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid TLS version")]
pub struct InvalidTlsVersion;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("tls: protocol version {0} is not supported")]
    UnsupportedVersion(&'static str),
    #[error("tls: invalid server name {0}")]
    InvalidServerName(String),
    #[error("tls: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Client TLS parameters for one measurement
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub server_name: Option<String>,
    pub next_protos: Vec<String>,
    pub min_version: Option<TlsVersion>,
    pub max_version: Option<TlsVersion>,
    pub no_tls_verify: bool,
    pub root_certs: Option<Arc<RootCertStore>>,
}

/// Pins both min and max to `version`; an empty string leaves defaults
pub fn configure_tls_version(config: &mut TlsConfig, version: &str) -> Result<(), InvalidTlsVersion> {
    let parsed = match version {
        "TLSv1.3" => TlsVersion::Tls13,
        "TLSv1.2" => TlsVersion::Tls12,
        "TLSv1.1" => TlsVersion::Tls11,
        "TLSv1.0" | "TLSv1" => TlsVersion::Tls10,
        "" => return Ok(()),
        _ => return Err(InvalidTlsVersion),
    };
    config.min_version = Some(parsed);
    config.max_version = Some(parsed);
    Ok(())
}

lazy_static! {
    static ref NATIVE_ROOTS: Arc<RootCertStore> = Arc::new(load_native_roots());
}

fn load_native_roots() -> RootCertStore {
    let mut store = RootCertStore::empty();
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            for cert in certs {
                if let Err(e) = store.add(&Certificate(cert.0)) {
                    debug!("skipping native root: {}", e);
                }
            }
        }
        Err(e) => warn!("cannot load native roots: {}", e),
    }
    store
}

struct NoCertificateVerification;

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

impl TlsConfig {
    fn protocol_versions(&self) -> Result<Vec<&'static rustls::SupportedProtocolVersion>, TlsError> {
        let min = self.min_version.unwrap_or(TlsVersion::Tls12);
        let max = self.max_version.unwrap_or(TlsVersion::Tls13);
        if max < TlsVersion::Tls12 {
            return Err(TlsError::UnsupportedVersion(max.as_str()));
        }
        let mut versions = Vec::new();
        if min <= TlsVersion::Tls13 && max >= TlsVersion::Tls13 {
            versions.push(&rustls::version::TLS13);
        }
        if min <= TlsVersion::Tls12 && max >= TlsVersion::Tls12 {
            versions.push(&rustls::version::TLS12);
        }
        Ok(versions)
    }

    /// Builds the rustls client configuration
    pub fn client_config(&self) -> Result<ClientConfig, TlsError> {
        let versions = self.protocol_versions()?;
        let builder = ClientConfig::builder()
            .with_safe_default_cipher_suites()
            .with_safe_default_kx_groups()
            .with_protocol_versions(&versions)?;
        let mut config = if self.no_tls_verify {
            builder
                .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
                .with_no_client_auth()
        } else {
            let roots = self.root_certs.clone().unwrap_or_else(|| NATIVE_ROOTS.clone());
            builder
                .with_root_certificates((*roots).clone())
                .with_no_client_auth()
        };
        config.alpn_protocols = self.next_protos.iter().map(|p| p.as_bytes().to_vec()).collect();
        Ok(config)
    }
}

fn version_string(version: Option<ProtocolVersion>) -> String {
    match version {
        Some(ProtocolVersion::TLSv1_3) => "TLSv1.3".to_string(),
        Some(ProtocolVersion::TLSv1_2) => "TLSv1.2".to_string(),
        Some(other) => format!("{:?}", other),
        None => String::new(),
    }
}

fn cipher_suite_string(suite: rustls::CipherSuite) -> String {
    let name = format!("{:?}", suite);
    match name.strip_prefix("TLS13_") {
        Some(rest) => format!("TLS_{}", rest),
        None => name,
    }
}

/// Dials TCP through an inner dialer and performs a recorded TLS handshake
pub struct TlsDialer {
    dialer: Arc<dyn Dialer>,
    config: TlsConfig,
    saver: Option<Arc<Saver>>,
    timeout: Duration,
}

impl TlsDialer {
    pub fn new(dialer: Arc<dyn Dialer>, config: TlsConfig, saver: Option<Arc<Saver>>) -> Self {
        Self {
            dialer,
            config,
            saver,
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn config(&self) -> &TlsConfig {
        &self.config
    }

    pub async fn dial_tls(&self, ctx: &Context, network: &str, address: &str) -> Result<TlsConn, ErrWrapper> {
        let (host, _) = split_host_port(address).map_err(|e| ErrWrapper::new(Operation::TlsHandshake, e))?;
        let conn = self.dialer.dial(ctx, network, address).await?;
        self.handshake(ctx, conn, &host).await
    }

    /// Handshakes over `conn`, using the configured SNI or `default_sni`
    pub async fn handshake(&self, ctx: &Context, conn: BoxConn, default_sni: &str) -> Result<TlsConn, ErrWrapper> {
        let sni = self
            .config
            .server_name
            .clone()
            .unwrap_or_else(|| default_sni.to_string());

        let mut start = Event::new(trace::TLS_HANDSHAKE_START);
        start.tls_server_name = sni.clone();
        start.tls_next_protos = self.config.next_protos.clone();
        start.no_tls_verify = self.config.no_tls_verify;
        self.record(start);

        let result = self.do_handshake(ctx, conn, &sni).await;

        let mut done = Event::new(trace::TLS_HANDSHAKE_DONE);
        done.tls_server_name = sni.clone();
        done.tls_next_protos = self.config.next_protos.clone();
        done.no_tls_verify = self.config.no_tls_verify;
        match &result {
            Ok(stream) => {
                let (_, state) = stream.get_ref();
                done.tls_cipher_suite = state
                    .negotiated_cipher_suite()
                    .map(|s| cipher_suite_string(s.suite()))
                    .unwrap_or_default();
                done.tls_negotiated_proto = state
                    .alpn_protocol()
                    .map(|p| String::from_utf8_lossy(p).into_owned())
                    .unwrap_or_default();
                done.tls_version = version_string(state.protocol_version());
                done.tls_peer_certs = state
                    .peer_certificates()
                    .map(|certs| certs.iter().map(|c| c.0.clone()).collect())
                    .unwrap_or_default();
                debug!("tls handshake with {} done: {}", sni, done.tls_version);
            }
            Err(err) => {
                debug!("tls handshake with {} failed: {}", sni, err);
                done.err = Some(err.clone());
            }
        }
        self.record(done);
        result
    }

    async fn do_handshake(&self, ctx: &Context, conn: BoxConn, sni: &str) -> Result<TlsConn, ErrWrapper> {
        let wrap = |e: TlsError| ErrWrapper::new(Operation::TlsHandshake, e);
        let config = self.config.client_config().map_err(wrap)?;
        let server_name =
            ServerName::try_from(sni).map_err(|_| wrap(TlsError::InvalidServerName(sni.to_string())))?;
        let connector = TlsConnector::from(Arc::new(config));
        let outcome = ctx
            .run(tokio::time::timeout(self.timeout, connector.connect(server_name, conn)))
            .await;
        match outcome {
            Ok(Ok(Ok(stream))) => Ok(stream),
            Ok(Ok(Err(io_err))) => Err(ErrWrapper::new(Operation::TlsHandshake, io_err)),
            Ok(Err(elapsed)) => Err(ErrWrapper::new(Operation::TlsHandshake, elapsed)),
            Err(ctx_err) => Err(ErrWrapper::new(Operation::TlsHandshake, ctx_err)),
        }
    }

    fn record(&self, ev: Event) {
        if let Some(saver) = &self.saver {
            saver.write(ev);
        }
    }
}

#[cfg(test)]
mod tls_tests {
    use super::*;

    #[test]
    fn test_configure_tls_version() {
        let mut config = TlsConfig::default();
        configure_tls_version(&mut config, "TLSv1.3").unwrap();
        assert_eq!(config.min_version, Some(TlsVersion::Tls13));
        assert_eq!(config.max_version, Some(TlsVersion::Tls13));

        let mut config = TlsConfig::default();
        configure_tls_version(&mut config, "").unwrap();
        assert_eq!(config.min_version, None);
        assert_eq!(config.max_version, None);

        configure_tls_version(&mut config, "TLSv1").unwrap();
        assert_eq!(config.max_version, Some(TlsVersion::Tls10));

        assert_eq!(configure_tls_version(&mut config, "SSLv3"), Err(InvalidTlsVersion));
    }

    #[test]
    fn test_client_config_versions_and_alpn() {
        let config = TlsConfig {
            next_protos: vec!["h2".to_string(), "http/1.1".to_string()],
            min_version: Some(TlsVersion::Tls12),
            max_version: Some(TlsVersion::Tls12),
            no_tls_verify: true,
            ..Default::default()
        };
        let built = config.client_config().unwrap();
        assert_eq!(built.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_legacy_versions_rejected_at_build() {
        let mut config = TlsConfig::default();
        configure_tls_version(&mut config, "TLSv1.1").unwrap();
        let err = config.client_config().err().unwrap();
        assert_eq!(err.to_string(), "tls: protocol version TLSv1.1 is not supported");
    }

    #[test]
    fn test_cipher_suite_names() {
        assert_eq!(
            cipher_suite_string(rustls::CipherSuite::TLS13_AES_128_GCM_SHA256),
            "TLS_AES_128_GCM_SHA256"
        );
        assert_eq!(
            cipher_suite_string(rustls::CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256),
            "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256"
        );
    }
}

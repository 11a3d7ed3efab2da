use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;
use url::Url;

use crate::context::Context;
use crate::geolocate::{AsnLookup, NoAsnLookup};

/// Error starting a circumvention tunnel
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("tunnel: unsupported tunnel name")]
    UnsupportedName(String),
    #[error("tunnel: {0}")]
    Bootstrap(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Parameters handed to the tunnel implementation
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub name: String,
    pub tor_args: Vec<String>,
    pub tor_binary: Option<String>,
    pub tunnel_dir: PathBuf,
}

/// A running tunnel exposing a local SOCKS5 proxy
pub trait Tunnel: Send + Sync {
    fn bootstrap_time(&self) -> Duration;
    fn socks5_proxy_url(&self) -> Url;
    fn stop(&self);
}

/// Test helper service advertised by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestHelper {
    pub address: String,
    pub kind: String,
    pub front: Option<String>,
}

/// Environment a measurement runs in. Owned by the caller; the core only reads it.
#[async_trait]
pub trait Session: Send + Sync {
    fn temp_dir(&self) -> PathBuf;

    fn tor_args(&self) -> Vec<String>;

    fn tor_binary(&self) -> Option<String>;

    fn get_test_helpers_by_name(&self, name: &str) -> Option<Vec<TestHelper>>;

    fn asn_lookup(&self) -> Arc<dyn AsnLookup> {
        Arc::new(NoAsnLookup)
    }

    async fn start_tunnel(&self, _ctx: &Context, config: &TunnelConfig) -> Result<Box<dyn Tunnel>, TunnelError> {
        Err(TunnelError::UnsupportedName(config.name.clone()))
    }
}

/// In-memory session without tunnel support
#[derive(Debug, Clone)]
pub struct BasicSession {
    temp_dir: PathBuf,
    tor_args: Vec<String>,
    tor_binary: Option<String>,
    test_helpers: HashMap<String, Vec<TestHelper>>,
}

impl BasicSession {
    pub fn new(temp_dir: &Path) -> Self {
        Self {
            temp_dir: temp_dir.to_path_buf(),
            tor_args: Vec::new(),
            tor_binary: None,
            test_helpers: HashMap::new(),
        }
    }

    pub fn with_tor(mut self, binary: Option<String>, args: Vec<String>) -> Self {
        self.tor_binary = binary;
        self.tor_args = args;
        self
    }

    pub fn add_test_helper(&mut self, name: &str, helper: TestHelper) {
        self.test_helpers
            .entry(name.to_string())
            .or_default()
            .push(helper);
    }
}

impl Default for BasicSession {
    fn default() -> Self {
        Self::new(&std::env::temp_dir())
    }
}

#[async_trait]
impl Session for BasicSession {
    fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone()
    }

    fn tor_args(&self) -> Vec<String> {
        self.tor_args.clone()
    }

    fn tor_binary(&self) -> Option<String> {
        self.tor_binary.clone()
    }

    fn get_test_helpers_by_name(&self, name: &str) -> Option<Vec<TestHelper>> {
        self.test_helpers.get(name).cloned()
    }
}

/// Receives progress of a running experiment
pub trait ExperimentCallbacks: Send + Sync {
    /// `percentage` is in 0..=1
    fn on_progress(&self, percentage: f64, message: &str);
}

/// Logs progress through tracing
#[derive(Debug, Default, Clone, Copy)]
pub struct PrinterCallbacks;

impl ExperimentCallbacks for PrinterCallbacks {
    fn on_progress(&self, percentage: f64, message: &str) {
        info!("[{:5.1}%] {}", percentage * 100.0, message);
    }
}

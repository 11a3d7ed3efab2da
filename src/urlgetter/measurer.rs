use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::context::Context;
use crate::session::Session;
use crate::urlgetter::{Config, Error, Getter, TestKeys};

pub const EXPERIMENT_NAME: &str = "urlgetter";
pub const EXPERIMENT_VERSION: &str = "0.2.0";

/// Applied when `Config::timeout` is unset
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(45);

/// Experiment entry point measuring one input URL per run.
///
/// A failing target is a measurement result, recorded in the returned
/// `TestKeys`. `run` only errors when it cannot measure at all.
pub struct Measurer {
    pub config: Config,
    session: Arc<dyn Session>,
}

impl Measurer {
    pub fn new(config: Config, session: Arc<dyn Session>) -> Self {
        Self { config, session }
    }

    pub fn name(&self) -> &'static str {
        EXPERIMENT_NAME
    }

    pub fn version(&self) -> &'static str {
        EXPERIMENT_VERSION
    }

    pub async fn run(&self, ctx: &Context, input: &str) -> Result<TestKeys, Error> {
        if input.is_empty() {
            return Err(Error::MissingInput);
        }
        let mut config = self.config.clone();
        config.timeout.get_or_insert(DEFAULT_TIMEOUT);
        let mut getter = Getter::new(config, self.session.clone(), input);
        getter.begin = Some(Instant::now());
        let (tk, result) = getter.get(ctx).await;
        if let Err(err) = result {
            warn!("{}: {}: {}", EXPERIMENT_NAME, input, err);
        }
        Ok(tk)
    }
}

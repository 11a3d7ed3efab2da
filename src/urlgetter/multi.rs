use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::context::Context;
use crate::errors::ErrWrapper;
use crate::revisit::RevisitGuard;
use crate::session::{ExperimentCallbacks, Session};
use crate::urlgetter::{Config, Getter, TestKeys};

pub const DEFAULT_PARALLELISM: usize = 3;

/// Replacement for `Getter::get`, used to stub out the network in tests
pub type GetterFunc =
    Arc<dyn Fn(Context, Getter) -> BoxFuture<'static, (TestKeys, Result<(), ErrWrapper>)> + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct MultiInput {
    pub config: Config,
    pub target: String,
}

impl MultiInput {
    pub fn new(target: &str) -> Self {
        Self {
            config: Config::default(),
            target: target.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MultiOutput {
    pub input: MultiInput,
    pub err: Option<ErrWrapper>,
    pub test_keys: TestKeys,
}

/// Measures many targets over a bounded pool of workers.
///
/// Every input yields exactly one output, also when the context is already
/// done. Outputs arrive in completion order; match them on `input`.
#[derive(Clone)]
pub struct Multi {
    pub begin: Option<Instant>,
    pub getter: Option<GetterFunc>,
    /// Number of workers; zero means `DEFAULT_PARALLELISM`
    pub parallelism: usize,
    pub session: Arc<dyn Session>,
    /// Spaces out repeated measurements of the same resolver
    pub revisit: Option<Arc<dyn RevisitGuard>>,
}

impl Multi {
    pub fn new(session: Arc<dyn Session>) -> Self {
        Self {
            begin: None,
            getter: None,
            parallelism: 0,
            session,
            revisit: None,
        }
    }

    /// Starts measuring `inputs`. The channel yields `inputs.len()` outputs
    /// and then closes.
    pub fn run(&self, ctx: &Context, inputs: Vec<MultiInput>) -> mpsc::Receiver<MultiOutput> {
        let (input_tx, input_rx) = mpsc::channel::<MultiInput>(1);
        let (output_tx, output_rx) = mpsc::channel::<MultiOutput>(1);

        tokio::spawn(async move {
            for input in inputs {
                if input_tx.send(input).await.is_err() {
                    break;
                }
            }
        });

        let input_rx = Arc::new(Mutex::new(input_rx));
        let parallelism = if self.parallelism == 0 {
            DEFAULT_PARALLELISM
        } else {
            self.parallelism
        };
        for worker in 0..parallelism {
            let multi = self.clone();
            let ctx = ctx.clone();
            let input_rx = input_rx.clone();
            let output_tx = output_tx.clone();
            tokio::spawn(async move {
                debug!("multi: worker {} started", worker);
                loop {
                    let next = input_rx.lock().await.recv().await;
                    let Some(input) = next else {
                        break;
                    };
                    let output = multi.measure(&ctx, input).await;
                    if output_tx.send(output).await.is_err() {
                        break;
                    }
                }
                debug!("multi: worker {} stopped", worker);
            });
        }
        output_rx
    }

    /// Like `run`, reporting progress for every completed input
    pub fn collect(
        &self,
        ctx: &Context,
        inputs: Vec<MultiInput>,
        prefix: &str,
        callbacks: Arc<dyn ExperimentCallbacks>,
    ) -> mpsc::Receiver<MultiOutput> {
        let count = inputs.len();
        self.collect_overall(ctx, inputs, 0, count, prefix, callbacks)
    }

    /// Like `collect`, with progress computed as if `inputs` were the chunk
    /// starting at `overall_start_index` of `overall_count` inputs.
    pub fn collect_overall(
        &self,
        ctx: &Context,
        inputs: Vec<MultiInput>,
        overall_start_index: usize,
        overall_count: usize,
        prefix: &str,
        callbacks: Arc<dyn ExperimentCallbacks>,
    ) -> mpsc::Receiver<MultiOutput> {
        let mut results = self.run(ctx, inputs);
        let (tx, rx) = mpsc::channel(1);
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            let mut count = 0;
            while let Some(output) = results.recv().await {
                count += 1;
                let percentage = (overall_start_index + count) as f64 / overall_count.max(1) as f64;
                let outcome = output
                    .err
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "ok".to_string());
                callbacks.on_progress(
                    percentage,
                    &format!("{}: measure {}: {}", prefix, output.input.target, outcome),
                );
                if tx.send(output).await.is_err() {
                    break;
                }
            }
        });
        rx
    }

    async fn measure(&self, ctx: &Context, input: MultiInput) -> MultiOutput {
        let revisit_key = input.config.resolver_url.clone().filter(|u| !u.is_empty());
        if let (Some(guard), Some(key)) = (&self.revisit, &revisit_key) {
            if let Err(err) = guard.maybe_delay(ctx, key).await {
                warn!("multi: not waiting for {}: {}", key, err);
            }
        }

        let getter = Getter {
            begin: self.begin,
            config: input.config.clone(),
            session: self.session.clone(),
            target: input.target.clone(),
        };
        let (test_keys, result) = match &self.getter {
            Some(get) => get(ctx.clone(), getter).await,
            None => getter.get(ctx).await,
        };

        if let (Some(guard), Some(key)) = (&self.revisit, &revisit_key) {
            guard.register(key);
        }
        MultiOutput {
            input,
            err: result.err(),
            test_keys,
        }
    }
}

mod diagnostics;

use std::collections::HashSet;
use std::env;
use std::num::NonZeroUsize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::channel;
use std::thread;
use std::time::{Duration, Instant};

use indicatif::ProgressStyle;
use petgraph::Direction;
use petgraph::graph::NodeIndex;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::Dynamic;
use crate::error::ExecutionError;
use crate::item::ItemId;
use crate::plan::ExecutionPlan;
use crate::result::BuildResult;
use crate::step::StepDescriptor;
use crate::store::{ArtifactStore, Initial, StepContext};

pub use diagnostics::{Diagnostics, ExecutionState, StepRecord, StepState};

/// Size of the worker pool, overrides the available parallelism.
pub const WORKERS_ENV: &str = "BUILDCHAIN_WORKERS";
/// `0`, `false` or `no` turn fail-fast mode off.
pub const FAIL_FAST_ENV: &str = "BUILDCHAIN_FAIL_FAST";

/// How a plan is executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Number of worker threads, `None` for the available parallelism.
    pub workers: Option<NonZeroUsize>,
    /// Stop launching waves once a wave had a failure. When disabled, later
    /// waves still run every step whose upstream steps all succeeded.
    pub fail_fast: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: None,
            fail_fast: true,
        }
    }
}

impl ExecutorConfig {
    /// Defaults, overridden by `BUILDCHAIN_WORKERS` and `BUILDCHAIN_FAIL_FAST`
    /// when they are set to something sensible.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(workers) = env::var(WORKERS_ENV) {
            match workers.trim().parse::<NonZeroUsize>() {
                Ok(workers) => config.workers = Some(workers),
                Err(_) => tracing::warn!(value = %workers, "ignoring invalid {WORKERS_ENV}"),
            }
        }

        if let Ok(fail_fast) = env::var(FAIL_FAST_ENV) {
            config.fail_fast = !matches!(
                fail_fast.trim().to_ascii_lowercase().as_str(),
                "0" | "false" | "no" | "off"
            );
        }

        config
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = NonZeroUsize::new(workers);
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn worker_count(&self) -> usize {
        self.workers
            .or_else(|| thread::available_parallelism().ok())
            .map_or(1, NonZeroUsize::get)
    }
}

impl ExecutionPlan {
    /// Runs every wave of the plan on a fresh artifact store and returns the
    /// final items.
    pub fn run(
        &self,
        config: &ExecutorConfig,
        initial: Initial,
    ) -> Result<BuildResult, ExecutionError> {
        self.run_with_diagnostics(config, initial).0
    }

    /// Like [`run`](Self::run), also reporting what happened to every step,
    /// whether the run succeeded or not.
    pub fn run_with_diagnostics(
        &self,
        config: &ExecutorConfig,
        initial: Initial,
    ) -> (Result<BuildResult, ExecutionError>, Diagnostics) {
        let mut diagnostics = Diagnostics::planned(self);
        let result = execute(self, config, initial, &mut diagnostics);
        (result, diagnostics)
    }
}

/// Outcome of one step, sent back from a worker thread.
struct Outcome {
    node: NodeIndex,
    result: Result<Vec<(ItemId, Dynamic)>, ExecutionError>,
    start: Instant,
    duration: Duration,
}

fn execute(
    plan: &ExecutionPlan,
    config: &ExecutorConfig,
    initial: Initial,
    diagnostics: &mut Diagnostics,
) -> Result<BuildResult, ExecutionError> {
    let mut store = initial.into_store(&plan.initials)?;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.worker_count())
        .thread_name(|index| format!("buildchain-{index}"))
        .build()?;

    let root_span = tracing::span!(Level::INFO, "build_chain", steps = plan.len());
    root_span.pb_set_length(plan.len() as u64);
    root_span.pb_set_style(&crate::utils::style_chain());
    root_span.pb_set_message("Running build steps...");
    let _enter = root_span.enter();

    diagnostics.state = ExecutionState::Running;

    let mut failures = Vec::new();
    // Failed or skipped steps, whose dependents must not run.
    let mut blocked: HashSet<NodeIndex> = HashSet::new();

    for (index, wave) in plan.waves.iter().enumerate() {
        if config.fail_fast && !failures.is_empty() {
            tracing::warn!(wave = index, "skipping remaining waves after failure");
            break;
        }

        let mut runnable = Vec::with_capacity(wave.nodes.len());
        for &node in &wave.nodes {
            let id = plan.graph[node].id();
            let upstream_failed = plan
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .any(|dep| blocked.contains(&dep));

            if upstream_failed {
                tracing::warn!(step = %id, "skipped, an upstream step failed");
                diagnostics.transition(id, StepState::Skipped);
                blocked.insert(node);
                root_span.pb_inc(1);
            } else {
                diagnostics.transition(id, StepState::Running);
                runnable.push(node);
            }
        }

        let wave_span = tracing::span!(Level::INFO, "wave", index, steps = runnable.len());
        let mut outcomes = run_wave(&pool, plan, &store, &runnable, &wave_span);

        // Commit in id order, so failures are reported in a stable order.
        outcomes.sort_by(|a, b| plan.graph[a.node].id().cmp(plan.graph[b.node].id()));

        for outcome in outcomes {
            let id = plan.graph[outcome.node].id();

            let committed = outcome.result.and_then(|writes| {
                for (item, value) in writes {
                    store.commit(id, item, value)?;
                }
                Ok(())
            });

            let state = match committed {
                Ok(()) => {
                    tracing::debug!(step = %id, duration = ?outcome.duration, "step succeeded");
                    StepState::Succeeded
                }
                Err(error) => {
                    tracing::error!(step = %id, "{error}");
                    blocked.insert(outcome.node);
                    failures.push(error);
                    StepState::Failed
                }
            };

            diagnostics.finish(id, state, outcome.start, outcome.duration);
            root_span.pb_inc(1);
        }
    }

    if let Some(error) = ExecutionError::aggregate(failures) {
        diagnostics.state = ExecutionState::Aborted;
        tracing::error!("build chain aborted");
        return Err(error);
    }

    diagnostics.state = ExecutionState::Completed;
    tracing::info!("Build chain complete!");

    Ok(BuildResult::new(store.extract(&plan.finals)))
}

/// Runs every step of one wave on the pool and waits for all of them. The
/// store is only read here; writes come back inside the outcomes.
fn run_wave(
    pool: &ThreadPool,
    plan: &ExecutionPlan,
    store: &ArtifactStore,
    nodes: &[NodeIndex],
    wave_span: &tracing::Span,
) -> Vec<Outcome> {
    let (sender, receiver) = channel::<Outcome>();
    let style = crate::utils::style_step();

    pool.scope(|s| {
        for &node in nodes {
            let step: &StepDescriptor = &plan.graph[node];
            let sender = sender.clone();
            let style = style.clone();

            s.spawn(move |_| {
                let outcome = run_step(node, step, store, wave_span, &style);
                // The receiver outlives the scope.
                let _ = sender.send(outcome);
            });
        }
    });

    drop(sender);
    receiver.into_iter().collect()
}

fn run_step(
    node: NodeIndex,
    step: &StepDescriptor,
    store: &ArtifactStore,
    parent: &tracing::Span,
    style: &ProgressStyle,
) -> Outcome {
    let span = tracing::span!(parent: parent, Level::INFO, "step", id = %step.id());
    span.pb_set_style(style);
    span.pb_set_message(&format!("Running {}", step.id()));
    let _enter = span.enter();

    let start = Instant::now();

    // A panicking action only ever touches its own context, the store is
    // borrowed immutably.
    let result = match catch_unwind(AssertUnwindSafe(|| {
        let mut context = StepContext::new(step, store, span.clone());

        (step.action())(&mut context).map_err(|cause| ExecutionError::StepFailed {
            step: step.id().clone(),
            cause,
        })?;

        context.finish()
    })) {
        Ok(result) => result,
        Err(panic) => {
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                format!("step panicked: {s}")
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("step panicked: {s}")
            } else {
                String::from("step panicked with unknown payload")
            };

            Err(ExecutionError::StepFailed {
                step: step.id().clone(),
                cause: anyhow::anyhow!(msg),
            })
        }
    };

    Outcome {
        node,
        result,
        start,
        duration: start.elapsed(),
    }
}

use std::fmt::Write;

use thiserror::Error;

use crate::core::StepId;
use crate::item::ItemId;

/// A structural problem in the registered steps. Always reported by
/// [`ChainBuilder::build`](crate::ChainBuilder::build), before any step runs.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Step '{0}' was registered more than once")]
    DuplicateStep(StepId),

    #[error("Multiple producers of item {item}: {}", join(.steps))]
    DuplicateProducer { item: ItemId, steps: Vec<StepId> },

    #[error("No producers for required item {item}, consumed by step '{consumer}'")]
    MissingProducer { item: ItemId, consumer: StepId },

    #[error("Cycle detected between steps: {}\n{}", join(.steps), describe_links(.links))]
    CyclicDependency {
        steps: Vec<StepId>,
        links: Vec<CycleLink>,
    },

    #[error("Item {item} is declared both as a simple and as a multi item (step '{step}')")]
    KindMismatch { item: ItemId, step: StepId },

    #[error("Item {item} cannot be produced by step '{step}', it is an initial item")]
    ProducedInitial { item: ItemId, step: StepId },

    #[error("Final item {0} has no producer and is not an initial item")]
    UnproducibleFinal(ItemId),

    #[error("Failed to write the build graph:\n{0}")]
    GraphOutput(#[from] std::io::Error),
}

/// One edge of a dependency cycle: `producer` writes `item`, which
/// `consumer` reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleLink {
    pub producer: StepId,
    pub item: ItemId,
    pub consumer: StepId,
}

impl std::fmt::Display for CycleLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "'{}' produced {} to '{}'", self.producer, self.item, self.consumer)
    }
}

/// A failure while running an [`ExecutionPlan`](crate::ExecutionPlan).
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Step '{step}':\n{cause:#}")]
    StepFailed { step: StepId, cause: anyhow::Error },

    #[error("Step '{step}' declared item {item} but did not produce it")]
    UnproducedDeclaredItem { step: StepId, item: ItemId },

    #[error("Step '{step}' wrote item {item}, which already holds a value")]
    ConflictingWrite { step: StepId, item: ItemId },

    #[error("{} steps failed:\n{}", .0.len(), list(.0))]
    AggregateFailure(Vec<ExecutionError>),

    #[error("Initial item {0} was declared but not supplied")]
    MissingInitial(ItemId),

    #[error("Item {0} was supplied as an initial input but never declared")]
    UndeclaredInitial(ItemId),

    #[error("Failed to build the worker pool")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

impl ExecutionError {
    /// Collapses a list of failures into one error, keeping a lone failure as
    /// it is.
    pub(crate) fn aggregate(mut failures: Vec<ExecutionError>) -> Option<Self> {
        match failures.len() {
            0 => None,
            1 => failures.pop(),
            _ => Some(ExecutionError::AggregateFailure(failures)),
        }
    }

    /// Ids of every step blamed by this error.
    pub fn steps(&self) -> Vec<&StepId> {
        match self {
            ExecutionError::StepFailed { step, .. }
            | ExecutionError::UnproducedDeclaredItem { step, .. }
            | ExecutionError::ConflictingWrite { step, .. } => vec![step],
            ExecutionError::AggregateFailure(all) => all.iter().flat_map(Self::steps).collect(),
            _ => vec![],
        }
    }
}

/// Misuse of a [`StepContext`](crate::StepContext) from inside a step action.
///
/// Converts into `anyhow::Error`, so actions can simply use `?`.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Item {0} was not declared as consumed by this step")]
    NotConsumed(ItemId),

    #[error("Item {0} was not declared as produced by this step")]
    NotProduced(ItemId),

    #[error("Item {0} was already produced by this step")]
    AlreadyProduced(ItemId),

    #[error("Item {0} has no value")]
    Missing(ItemId),
}

fn join(steps: &[StepId]) -> String {
    let mut acc = String::new();
    for (i, step) in steps.iter().enumerate() {
        if i > 0 {
            acc.push_str(", ");
        }
        let _ = write!(acc, "'{step}'");
    }
    acc
}

fn describe_links(links: &[CycleLink]) -> String {
    let mut acc = String::new();
    for link in links {
        let _ = writeln!(acc, "  {link}");
    }
    acc
}

fn list(errors: &[ExecutionError]) -> String {
    let mut acc = String::new();
    for error in errors {
        let _ = writeln!(acc, "  - {error}");
    }
    acc
}

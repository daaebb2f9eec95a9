use std::fmt;
use std::sync::Arc;

use crate::core::StepId;
use crate::item::{Consume, ItemId, Produce, Strength};
use crate::store::StepContext;

/// The work a step performs. Reads and writes go through the [`StepContext`].
pub type StepAction = Arc<dyn Fn(&mut StepContext<'_>) -> anyhow::Result<()> + Send + Sync>;

/// An immutable record of one unit of work and the items it produces and
/// consumes.
///
/// Declarations are sets: declaring the same item twice keeps a single entry.
/// For repeated consumes the strongest strength wins, for repeated produces
/// the producer stays overridable or weak only if every declaration said so.
#[derive(Clone)]
pub struct StepDescriptor {
    id: StepId,
    produces: Vec<Produce>,
    consumes: Vec<Consume>,
    always_run: bool,
    action: StepAction,
    /// Overridable produces that lost to a regular producer when the chain was
    /// built. Writes to them are discarded.
    overridden: Vec<ItemId>,
}

impl StepDescriptor {
    pub fn new<F>(
        id: impl Into<StepId>,
        produces: impl IntoIterator<Item = Produce>,
        consumes: impl IntoIterator<Item = Consume>,
        always_run: bool,
        action: F,
    ) -> Self
    where
        F: Fn(&mut StepContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut step = Self {
            id: id.into(),
            produces: Vec::new(),
            consumes: Vec::new(),
            always_run,
            action: Arc::new(action),
            overridden: Vec::new(),
        };

        for produce in produces {
            step.add_produce(produce);
        }
        for consume in consumes {
            step.add_consume(consume);
        }

        step
    }

    pub fn id(&self) -> &StepId {
        &self.id
    }

    pub fn produces(&self) -> &[Produce] {
        &self.produces
    }

    pub fn consumes(&self) -> &[Consume] {
        &self.consumes
    }

    pub fn always_run(&self) -> bool {
        self.always_run
    }

    pub(crate) fn action(&self) -> &StepAction {
        &self.action
    }

    pub(crate) fn is_overridden(&self, item: &ItemId) -> bool {
        self.overridden.contains(item)
    }

    pub(crate) fn with_overridden(mut self, items: &[ItemId]) -> Self {
        self.overridden = items.to_vec();
        self
    }

    pub(crate) fn consume_of(&self, item: &ItemId) -> Option<&Consume> {
        self.consumes.iter().find(|c| c.item == *item)
    }

    /// Whether `item` is declared as produced, with the same kind.
    pub(crate) fn declares_produce(&self, item: &ItemId) -> bool {
        self.produces
            .iter()
            .any(|p| p.item == *item && p.item.kind() == item.kind())
    }

    pub(crate) fn add_produce(&mut self, produce: Produce) {
        match self.produces.iter_mut().find(|p| p.item == produce.item) {
            Some(existing) => {
                existing.overridable &= produce.overridable;
                existing.weak &= produce.weak;
            }
            None => self.produces.push(produce),
        }
    }

    pub(crate) fn add_consume(&mut self, consume: Consume) {
        match self.consumes.iter_mut().find(|c| c.item == consume.item) {
            Some(existing) => {
                existing.strength = stronger(existing.strength, consume.strength)
            }
            None => self.consumes.push(consume),
        }
    }
}

fn stronger(a: Strength, b: Strength) -> Strength {
    use Strength::*;
    match (a, b) {
        (Required, _) | (_, Required) => Required,
        (Optional, _) | (_, Optional) => Optional,
        _ => Weak,
    }
}

impl fmt::Debug for StepDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDescriptor")
            .field("id", &self.id)
            .field("produces", &self.produces)
            .field("consumes", &self.consumes)
            .field("always_run", &self.always_run)
            .field("overridden", &self.overridden)
            .finish_non_exhaustive()
    }
}

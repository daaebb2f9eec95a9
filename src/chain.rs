use std::collections::{HashMap, HashSet, VecDeque};
use std::env;
use std::fs;
use std::path::PathBuf;

use crate::core::StepId;
use crate::error::GraphError;
use crate::item::{Consume, ItemId, ItemKind, MultiItem, Produce, SimpleItem, Strength};
use crate::plan::{self, ExecutionPlan};
use crate::step::StepDescriptor;
use crate::store::StepContext;

/// Environment variable naming a file the DOT graph is written to on every
/// successful [`ChainBuilder::build`].
pub const GRAPH_OUTPUT_ENV: &str = "BUILDCHAIN_GRAPH_OUTPUT";

/// Accumulates build steps together with the requested final items, and turns
/// them into an [`ExecutionPlan`].
///
/// A step ends up in the plan when it produces a final item, when it is marked
/// [`always_run`](StepBuilder::always_run), or when it produces something that
/// an included step consumes with [`Strength::Required`] or
/// [`Strength::Optional`]. Every other step is dropped.
///
/// # Example
///
/// ```rust
/// use buildchain::{ChainBuilder, ExecutorConfig, Initial, SimpleItem};
///
/// struct Sources(Vec<&'static str>);
/// impl SimpleItem for Sources {}
///
/// struct Count(usize);
/// impl SimpleItem for Count {}
///
/// let mut chain = ChainBuilder::new();
///
/// chain
///     .step("scan")
///     .produces::<Sources>()
///     .run(|ctx| ctx.produce(Sources(vec!["a.rs", "b.rs"])).map_err(Into::into));
///
/// chain
///     .step("count")
///     .consumes::<Sources>()
///     .produces::<Count>()
///     .run(|ctx| {
///         let sources = ctx.consume::<Sources>()?;
///         ctx.produce(Count(sources.0.len()))?;
///         Ok(())
///     });
///
/// chain.add_final::<Count>();
///
/// let plan = chain.build().unwrap();
/// let result = plan.run(&ExecutorConfig::default(), Initial::new()).unwrap();
/// assert_eq!(result.get::<Count>().unwrap().0, 2);
/// ```
#[derive(Debug, Default)]
pub struct ChainBuilder {
    steps: Vec<StepDescriptor>,
    finals: Vec<ItemId>,
    initials: Vec<ItemId>,
    graph_output: Option<PathBuf>,
}

/// Returned from step registration, names the registered step.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepHandle {
    id: StepId,
}

impl StepHandle {
    pub fn id(&self) -> &StepId {
        &self.id
    }
}

impl ChainBuilder {
    pub fn new() -> Self {
        let graph_output = env::var_os(GRAPH_OUTPUT_ENV)
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);

        Self {
            graph_output,
            ..Self::default()
        }
    }

    /// Starts a fluent step declaration.
    pub fn step(&mut self, id: impl Into<StepId>) -> StepBuilder<'_> {
        StepBuilder {
            chain: self,
            id: id.into(),
            produces: Vec::new(),
            consumes: Vec::new(),
            always_run: false,
        }
    }

    pub fn add_step(&mut self, step: StepDescriptor) -> StepHandle {
        let handle = StepHandle {
            id: step.id().clone(),
        };
        self.steps.push(step);
        handle
    }

    pub fn add_final<T: SimpleItem>(&mut self) -> &mut Self {
        self.add_final_item(ItemId::simple::<T>())
    }

    pub fn add_final_multi<T: MultiItem>(&mut self) -> &mut Self {
        self.add_final_item(ItemId::multi::<T>())
    }

    pub fn add_final_item(&mut self, item: ItemId) -> &mut Self {
        if !self.finals.contains(&item) {
            self.finals.push(item);
        }
        self
    }

    /// Declares an item supplied by the caller through [`Initial`](crate::Initial)
    /// when the plan runs. No step may produce a simple initial item.
    pub fn add_initial<T: SimpleItem>(&mut self) -> &mut Self {
        self.add_initial_item(ItemId::simple::<T>())
    }

    pub fn add_initial_multi<T: MultiItem>(&mut self) -> &mut Self {
        self.add_initial_item(ItemId::multi::<T>())
    }

    pub fn add_initial_item(&mut self, item: ItemId) -> &mut Self {
        if !self.initials.contains(&item) {
            self.initials.push(item);
        }
        self
    }

    /// Writes the DOT rendering of every built plan to `path`.
    pub fn graph_output(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.graph_output = Some(path.into());
        self
    }

    /// Validates the registered steps, drops the ones nothing needs, and
    /// partitions the rest into waves.
    ///
    /// The builder is left untouched, so it can be extended and built again.
    pub fn build(&self) -> Result<ExecutionPlan, GraphError> {
        check_unique_ids(&self.steps)?;
        self.check_kinds()?;

        let producers = Producers::collect(&self.steps, &self.initials)?;
        let included = self.wire(&producers)?;

        let plan = plan::partition(
            &self.steps,
            &included,
            &producers,
            &self.finals,
            &self.initials,
        )?;

        if let Some(path) = &self.graph_output {
            fs::write(path, plan.to_dot())?;
            tracing::info!(path = %path.display(), "wrote build graph");
        }

        Ok(plan)
    }

    fn check_kinds(&self) -> Result<(), GraphError> {
        let mut kinds: HashMap<ItemId, ItemKind> = HashMap::new();

        let mut declare = |item: ItemId, step: &StepId| {
            let kind = *kinds.entry(item).or_insert(item.kind());
            match kind == item.kind() {
                true => Ok(()),
                false => Err(GraphError::KindMismatch {
                    item,
                    step: step.clone(),
                }),
            }
        };

        let initial = StepId::initial();
        for item in &self.initials {
            declare(*item, &initial)?;
        }

        let fin = StepId::new("<final>");
        for item in &self.finals {
            declare(*item, &fin)?;
        }

        for step in &self.steps {
            for produce in step.produces() {
                declare(produce.item, step.id())?;
            }
            for consume in step.consumes() {
                declare(consume.item, step.id())?;
            }
        }

        Ok(())
    }

    /// Walks backwards from the final items and the always-run steps through
    /// required and optional consumes. Returns the inclusion mask.
    fn wire(&self, producers: &Producers) -> Result<Vec<bool>, GraphError> {
        let mut included = vec![false; self.steps.len()];
        let mut queue = VecDeque::new();

        let mut include = |index: usize, queue: &mut VecDeque<usize>| {
            if !included[index] {
                included[index] = true;
                queue.push_back(index);
            }
        };

        for item in &self.finals {
            match producers.effective.get(item) {
                Some(_) => producers.including(item).for_each(|i| include(i, &mut queue)),
                None if item.is_multi() || self.initials.contains(item) => {}
                None => return Err(GraphError::UnproducibleFinal(*item)),
            }
        }

        for (index, step) in self.steps.iter().enumerate() {
            if step.always_run() {
                include(index, &mut queue);
            }
        }

        while let Some(index) = queue.pop_front() {
            let step = &self.steps[index];

            for consume in step.consumes() {
                let list = producers.effective.get(&consume.item);

                if consume.strength == Strength::Required
                    && !consume.item.is_multi()
                    && list.is_none()
                    && !self.initials.contains(&consume.item)
                {
                    return Err(GraphError::MissingProducer {
                        item: consume.item,
                        consumer: step.id().clone(),
                    });
                }

                if consume.strength.includes_producer() {
                    for producer in producers.including(&consume.item) {
                        include(producer, &mut queue);
                    }
                }
            }
        }

        for (step, _) in self.steps.iter().zip(&included).filter(|(_, inc)| !**inc) {
            tracing::debug!(step = %step.id(), "pruned, nothing requested depends on it");
        }

        Ok(included)
    }
}

fn check_unique_ids(steps: &[StepDescriptor]) -> Result<(), GraphError> {
    let mut seen = HashSet::new();
    for step in steps {
        if !seen.insert(step.id()) {
            return Err(GraphError::DuplicateStep(step.id().clone()));
        }
    }
    Ok(())
}

/// Producer indices per item, after overridable producers were resolved.
#[derive(Debug, Default)]
pub(crate) struct Producers {
    pub effective: HashMap<ItemId, Vec<usize>>,
    /// Weak produces, which order but never include.
    pub weak: HashSet<(usize, ItemId)>,
    /// Overridable produces that lost to a regular producer, per step.
    pub overridden: HashMap<usize, Vec<ItemId>>,
}

impl Producers {
    fn collect(steps: &[StepDescriptor], initials: &[ItemId]) -> Result<Self, GraphError> {
        let mut regular: HashMap<ItemId, Vec<usize>> = HashMap::new();
        let mut overridable: HashMap<ItemId, Vec<usize>> = HashMap::new();
        let mut weak = HashSet::new();

        for (index, step) in steps.iter().enumerate() {
            for produce in step.produces() {
                let item = produce.item;

                if !item.is_multi() && initials.contains(&item) {
                    return Err(GraphError::ProducedInitial {
                        item,
                        step: step.id().clone(),
                    });
                }

                if produce.weak {
                    weak.insert((index, item));
                }

                let map = match produce.overridable {
                    true => &mut overridable,
                    false => &mut regular,
                };

                let list = map.entry(item).or_default();
                if !item.is_multi() && !list.is_empty() {
                    let mut ids: Vec<_> = list
                        .iter()
                        .chain([&index])
                        .map(|&i| steps[i].id().clone())
                        .collect();
                    ids.sort();
                    return Err(GraphError::DuplicateProducer { item, steps: ids });
                }
                list.push(index);
            }
        }

        let mut effective = regular;
        let mut overridden: HashMap<usize, Vec<ItemId>> = HashMap::new();
        for (item, list) in overridable {
            if effective.contains_key(&item) {
                for index in list {
                    tracing::debug!(step = %steps[index].id(), %item, "overridden producer");
                    overridden.entry(index).or_default().push(item);
                }
            } else {
                effective.insert(item, list);
            }
        }

        Ok(Self {
            effective,
            weak,
            overridden,
        })
    }

    /// Producers of `item` that a strong dependency pulls into the chain.
    fn including(&self, item: &ItemId) -> impl Iterator<Item = usize> + '_ {
        let item = *item;
        self.effective
            .get(&item)
            .into_iter()
            .flatten()
            .copied()
            .filter(move |&index| !self.weak.contains(&(index, item)))
    }
}

/// Fluent declaration of a single step, returned from [`ChainBuilder::step`].
pub struct StepBuilder<'a> {
    chain: &'a mut ChainBuilder,
    id: StepId,
    produces: Vec<Produce>,
    consumes: Vec<Consume>,
    always_run: bool,
}

impl<'a> StepBuilder<'a> {
    pub fn produces<T: SimpleItem>(self) -> Self {
        self.produce(ItemId::simple::<T>(), false, false)
    }

    /// Produces `T` only if no other step produces it regularly.
    pub fn produces_overridable<T: SimpleItem>(self) -> Self {
        self.produce(ItemId::simple::<T>(), true, false)
    }

    /// Produces `T` without requiring the step to run when `T` is needed.
    pub fn produces_weak<T: SimpleItem>(self) -> Self {
        self.produce(ItemId::simple::<T>(), false, true)
    }

    pub fn produces_multi<T: MultiItem>(self) -> Self {
        self.produce(ItemId::multi::<T>(), false, false)
    }

    pub fn produces_multi_weak<T: MultiItem>(self) -> Self {
        self.produce(ItemId::multi::<T>(), false, true)
    }

    pub fn consumes<T: SimpleItem>(self) -> Self {
        self.consume(ItemId::simple::<T>(), Strength::Required)
    }

    pub fn consumes_optional<T: SimpleItem>(self) -> Self {
        self.consume(ItemId::simple::<T>(), Strength::Optional)
    }

    pub fn consumes_weak<T: SimpleItem>(self) -> Self {
        self.consume(ItemId::simple::<T>(), Strength::Weak)
    }

    /// Consumes every contribution to `T`. Zero producers yield an empty list.
    pub fn consumes_multi<T: MultiItem>(self) -> Self {
        self.consume(ItemId::multi::<T>(), Strength::Required)
    }

    pub fn consumes_multi_weak<T: MultiItem>(self) -> Self {
        self.consume(ItemId::multi::<T>(), Strength::Weak)
    }

    pub fn produce(mut self, item: ItemId, overridable: bool, weak: bool) -> Self {
        self.produces.push(Produce {
            item,
            overridable,
            weak,
        });
        self
    }

    pub fn consume(mut self, item: ItemId, strength: Strength) -> Self {
        self.consumes.push(Consume { item, strength });
        self
    }

    /// Keeps the step in the chain even if nothing consumes its outputs.
    pub fn always_run(mut self) -> Self {
        self.always_run = true;
        self
    }

    pub fn run<F>(self, action: F) -> StepHandle
    where
        F: Fn(&mut StepContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let step = StepDescriptor::new(
            self.id,
            self.produces,
            self.consumes,
            self.always_run,
            action,
        );
        self.chain.add_step(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct X;
    impl SimpleItem for X {}

    struct Y;
    impl SimpleItem for Y {}

    struct M;
    impl MultiItem for M {}

    fn noop(_: &mut StepContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    #[test]
    fn duplicate_step_ids_are_rejected() {
        let mut chain = ChainBuilder::default();
        chain.step("a").produces::<X>().run(noop);
        chain.step("a").produces::<Y>().run(noop);
        chain.add_final::<X>();

        let err = chain.build().unwrap_err();
        assert!(matches!(err, GraphError::DuplicateStep(id) if id.as_str() == "a"));
    }

    #[test]
    fn duplicate_simple_producers_are_rejected_even_when_unreachable() {
        let mut chain = ChainBuilder::default();
        chain.step("b").produces::<X>().run(noop);
        chain.step("a").produces::<X>().run(noop);
        chain.step("c").produces::<Y>().run(noop);
        chain.add_final::<Y>();

        match chain.build().unwrap_err() {
            GraphError::DuplicateProducer { item, steps } => {
                assert_eq!(item, ItemId::simple::<X>());
                let steps: Vec<_> = steps.iter().map(StepId::as_str).collect();
                assert_eq!(steps, ["a", "b"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn overridable_producer_yields_to_regular_one() {
        let mut chain = ChainBuilder::default();
        chain.step("default").produces_overridable::<X>().run(noop);
        chain.step("custom").produces::<X>().run(noop);
        chain.add_final::<X>();

        let plan = chain.build().unwrap();
        assert!(plan.contains("custom"));
        assert!(!plan.contains("default"));
    }

    #[test]
    fn overridden_producer_stays_for_its_other_items() {
        let mut chain = ChainBuilder::default();
        let defaults = chain
            .step("defaults")
            .produces_overridable::<X>()
            .produces::<Y>()
            .run(noop);
        chain.step("custom").produces::<X>().run(noop);
        chain.add_final::<X>().add_final::<Y>();

        let producers = Producers::collect(&chain.steps, &chain.initials).unwrap();
        assert_eq!(producers.effective[&ItemId::simple::<X>()], [1]);
        assert_eq!(producers.overridden[&0], [ItemId::simple::<X>()]);

        let plan = chain.build().unwrap();
        assert!(plan.contains(defaults.id().as_str()));
        let step = plan.steps().find(|s| s.id() == defaults.id()).unwrap();
        assert!(step.is_overridden(&ItemId::simple::<X>()));
        assert!(!step.is_overridden(&ItemId::simple::<Y>()));
    }

    #[test]
    fn weak_producers_are_not_included() {
        let mut chain = ChainBuilder::default();
        chain.step("weak").produces_weak::<X>().produces_multi_weak::<M>().run(noop);
        chain.step("reader").consumes_optional::<X>().produces::<Y>().run(noop);
        chain.add_final::<Y>().add_final_multi::<M>();

        let plan = chain.build().unwrap();
        assert!(plan.contains("reader"));
        assert!(!plan.contains("weak"));

        chain.step("anchor").consumes_multi::<M>().always_run().run(noop);
        let plan = chain.build().unwrap();
        assert!(!plan.contains("weak"));
    }

    #[test]
    fn overridable_producer_is_used_alone() {
        let mut chain = ChainBuilder::default();
        chain.step("default").produces_overridable::<X>().run(noop);
        chain.add_final::<X>();

        let plan = chain.build().unwrap();
        assert!(plan.contains("default"));
    }

    #[test]
    fn missing_required_producer_names_consumer() {
        let mut chain = ChainBuilder::default();
        chain.step("b").consumes::<X>().produces::<Y>().run(noop);
        chain.add_final::<Y>();

        match chain.build().unwrap_err() {
            GraphError::MissingProducer { item, consumer } => {
                assert_eq!(item, ItemId::simple::<X>());
                assert_eq!(consumer.as_str(), "b");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn pruned_steps_do_not_need_producers() {
        let mut chain = ChainBuilder::default();
        chain.step("orphan").consumes::<X>().run(noop);
        chain.step("y").produces::<Y>().run(noop);
        chain.add_final::<Y>();

        let plan = chain.build().unwrap();
        assert!(!plan.contains("orphan"));
    }

    #[test]
    fn initial_items_satisfy_required_consumers() {
        let mut chain = ChainBuilder::default();
        chain.add_initial::<X>();
        chain.step("b").consumes::<X>().produces::<Y>().run(noop);
        chain.add_final::<Y>();

        assert!(chain.build().is_ok());
    }

    #[test]
    fn simple_initial_items_cannot_be_produced() {
        let mut chain = ChainBuilder::default();
        chain.add_initial::<X>();
        chain.step("a").produces::<X>().run(noop);
        chain.add_final::<X>();

        let err = chain.build().unwrap_err();
        assert!(matches!(err, GraphError::ProducedInitial { step, .. } if step.as_str() == "a"));
    }

    #[test]
    fn final_without_producer_is_rejected() {
        let mut chain = ChainBuilder::default();
        chain.add_final::<X>();
        assert!(matches!(
            chain.build().unwrap_err(),
            GraphError::UnproducibleFinal(_)
        ));

        let mut chain = ChainBuilder::default();
        chain.add_final_multi::<M>();
        assert!(chain.build().unwrap().is_empty());
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        struct Both;
        impl SimpleItem for Both {}
        impl MultiItem for Both {}

        let mut chain = ChainBuilder::default();
        chain.step("a").produces::<Both>().run(noop);
        chain.step("b").consumes_multi::<Both>().always_run().run(noop);

        let err = chain.build().unwrap_err();
        assert!(matches!(err, GraphError::KindMismatch { step, .. } if step.as_str() == "b"));
    }

    #[test]
    fn graph_output_is_written() {
        let path = std::env::temp_dir().join(format!("buildchain-{}.dot", std::process::id()));

        let mut chain = ChainBuilder::default();
        chain.step("a").produces::<X>().run(noop);
        chain.add_final::<X>();
        chain.graph_output(&path);
        chain.build().unwrap();

        let dot = fs::read_to_string(&path).unwrap();
        let _ = fs::remove_file(&path);
        assert!(dot.starts_with("digraph {"));
        assert!(dot.contains("\"a\""));
    }
}

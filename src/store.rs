//! Per-run storage of produced items and the narrow view a step gets of it.
//!
//! The store is only ever mutated between waves. While a wave runs, every step
//! reads the store through a shared reference and buffers its own writes in its
//! [`StepContext`]; the executor commits those buffers after the whole wave has
//! joined. Consumers therefore never observe a half-written slot, and steps of
//! the same wave cannot see each other's output at all.

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::{Dynamic, StepId};
use crate::error::{ContextError, ExecutionError};
use crate::item::{ItemId, MultiItem, SimpleItem};
use crate::step::StepDescriptor;

/// Contents of one produced item.
#[derive(Clone)]
pub(crate) enum Slot {
    Simple(Dynamic),
    /// Producer-tagged contributions. Initial values first, then contributions
    /// sorted by producer id.
    Multi(Vec<(StepId, Dynamic)>),
}

/// Item values of a single run. Items without a slot are unproduced.
#[derive(Default)]
pub(crate) struct ArtifactStore {
    slots: HashMap<ItemId, Slot>,
}

impl ArtifactStore {
    pub fn get(&self, item: &ItemId) -> Option<&Slot> {
        self.slots.get(item)
    }

    /// Writes one value for `item` on behalf of `step`. A simple slot accepts a
    /// single write per run, a multi slot a single write per producer.
    pub fn commit(
        &mut self,
        step: &StepId,
        item: ItemId,
        value: Dynamic,
    ) -> Result<(), ExecutionError> {
        let conflict = || ExecutionError::ConflictingWrite {
            step: step.clone(),
            item,
        };

        match item.is_multi() {
            false => {
                if self.slots.contains_key(&item) {
                    return Err(conflict());
                }
                self.slots.insert(item, Slot::Simple(value));
            }
            true => {
                let slot = self
                    .slots
                    .entry(item)
                    .or_insert_with(|| Slot::Multi(Vec::new()));

                let Slot::Multi(list) = slot else {
                    return Err(conflict());
                };

                let initial = step.as_str() == StepId::INITIAL;
                if !initial && list.iter().any(|(producer, _)| producer == step) {
                    return Err(conflict());
                }

                let at = list.partition_point(|(producer, _)| {
                    producer.as_str() == StepId::INITIAL || (!initial && producer <= step)
                });
                list.insert(at, (step.clone(), value));
            }
        }

        Ok(())
    }

    /// Moves the slots of `items` out of the store.
    pub fn extract(mut self, items: &[ItemId]) -> HashMap<ItemId, Slot> {
        items
            .iter()
            .filter_map(|item| self.slots.remove_entry(item))
            .collect()
    }
}

/// Values supplied by the caller for the items declared with
/// [`ChainBuilder::add_initial`](crate::ChainBuilder::add_initial).
#[derive(Default)]
pub struct Initial {
    pub(crate) values: Vec<(ItemId, Dynamic)>,
}

impl Initial {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn simple<T: SimpleItem>(mut self, value: T) -> Self {
        self.values.push((ItemId::simple::<T>(), Arc::new(value)));
        self
    }

    /// Adds one contribution to a multi item. May be called repeatedly.
    pub fn multi<T: MultiItem>(mut self, value: T) -> Self {
        self.values.push((ItemId::multi::<T>(), Arc::new(value)));
        self
    }

    /// Checks the supplied values against the declared initial items and
    /// turns them into a fresh store.
    pub(crate) fn into_store(self, declared: &[ItemId]) -> Result<ArtifactStore, ExecutionError> {
        for (item, _) in &self.values {
            // Identity ignores the kind, so compare it explicitly.
            if !declared.iter().any(|d| d == item && d.kind() == item.kind()) {
                return Err(ExecutionError::UndeclaredInitial(*item));
            }
        }

        let mut store = ArtifactStore::default();
        let initial = StepId::initial();
        for (item, value) in self.values {
            store.commit(&initial, item, value)?;
        }

        for item in declared {
            if !item.is_multi() && store.get(item).is_none() {
                return Err(ExecutionError::MissingInitial(*item));
            }
        }

        Ok(store)
    }
}

/// The view a step action gets of the run.
///
/// Reads are limited to the items the step declared as consumed, writes to the
/// items it declared as produced. Every declared item must be written exactly
/// once before the action returns.
pub struct StepContext<'a> {
    step: &'a StepDescriptor,
    store: &'a ArtifactStore,
    produced: Vec<(ItemId, Dynamic)>,
    span: tracing::Span,
}

impl<'a> StepContext<'a> {
    pub(crate) fn new(
        step: &'a StepDescriptor,
        store: &'a ArtifactStore,
        span: tracing::Span,
    ) -> Self {
        Self {
            step,
            store,
            produced: Vec::with_capacity(step.produces().len()),
            span,
        }
    }

    pub fn id(&self) -> &StepId {
        self.step.id()
    }

    /// Tracing span of this step, for attaching events or child spans.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Reads a consumed simple item, failing if it has no value.
    pub fn consume<T: SimpleItem>(&self) -> Result<&'a T, ContextError> {
        let item = ItemId::simple::<T>();
        self.consume_optional::<T>()?
            .ok_or(ContextError::Missing(item))
    }

    /// Reads a consumed simple item. `None` when an optional or weak
    /// dependency was never produced.
    pub fn consume_optional<T: SimpleItem>(&self) -> Result<Option<&'a T>, ContextError> {
        let item = self.declared_consume(ItemId::simple::<T>())?;

        Ok(match self.store.get(&item) {
            Some(Slot::Simple(value)) => Some(downcast(value)),
            _ => None,
        })
    }

    /// Every contribution to a consumed multi item, ordered by producer id.
    pub fn consume_multi<T: MultiItem>(&self) -> Result<Vec<&'a T>, ContextError> {
        Ok(self
            .contributions::<T>()?
            .into_iter()
            .map(|(_, value)| value)
            .collect())
    }

    /// Like [`consume_multi`](Self::consume_multi), tagged with the id of the
    /// producing step.
    pub fn contributions<T: MultiItem>(&self) -> Result<Vec<(&'a StepId, &'a T)>, ContextError> {
        let item = self.declared_consume(ItemId::multi::<T>())?;
        let store: &'a ArtifactStore = self.store;

        Ok(match store.get(&item) {
            Some(Slot::Multi(list)) => list
                .iter()
                .map(|(producer, value)| (producer, downcast(value)))
                .collect(),
            _ => Vec::new(),
        })
    }

    /// Whether another step's regular production of `item` replaced this
    /// step's overridable one. Writing an overridden item is allowed but has no
    /// effect, and leaving it unwritten is not an error.
    pub fn is_overridden(&self, item: &ItemId) -> bool {
        self.step.is_overridden(item)
    }

    pub fn produce<T: SimpleItem>(&mut self, value: T) -> Result<(), ContextError> {
        self.write(ItemId::simple::<T>(), Arc::new(value))
    }

    /// Contributes this step's value to a multi item.
    pub fn produce_multi<T: MultiItem>(&mut self, value: T) -> Result<(), ContextError> {
        self.write(ItemId::multi::<T>(), Arc::new(value))
    }

    fn declared_consume(&self, item: ItemId) -> Result<ItemId, ContextError> {
        match self.step.consume_of(&item) {
            Some(consume) if consume.item.kind() == item.kind() => Ok(item),
            _ => Err(ContextError::NotConsumed(item)),
        }
    }

    fn write(&mut self, item: ItemId, value: Dynamic) -> Result<(), ContextError> {
        if !self.step.declares_produce(&item) {
            return Err(ContextError::NotProduced(item));
        }

        if self.produced.iter().any(|(written, _)| *written == item) {
            return Err(ContextError::AlreadyProduced(item));
        }

        self.produced.push((item, value));
        Ok(())
    }

    /// Hands over the buffered writes, checking that nothing declared was left
    /// out. Writes to overridden items are dropped here.
    pub(crate) fn finish(self) -> Result<Vec<(ItemId, Dynamic)>, ExecutionError> {
        let step = self.step;

        for produce in step.produces() {
            if step.is_overridden(&produce.item) {
                continue;
            }
            if !self.produced.iter().any(|(item, _)| *item == produce.item) {
                return Err(ExecutionError::UnproducedDeclaredItem {
                    step: step.id().clone(),
                    item: produce.item,
                });
            }
        }

        Ok(self
            .produced
            .into_iter()
            .filter(|(item, _)| !step.is_overridden(item))
            .collect())
    }
}

/// Recovers the concrete type of a stored value. Slots are keyed by the
/// `TypeId` of the value they hold, so this cannot fail.
pub(crate) fn downcast<T: 'static>(value: &Dynamic) -> &T {
    value
        .downcast_ref::<T>()
        .expect("Type mismatch in artifact store")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{Consume, Produce, Strength};

    struct Name(&'static str);
    impl SimpleItem for Name {}

    struct Tag(&'static str);
    impl MultiItem for Tag {}

    fn names(store: &ArtifactStore) -> Vec<&str> {
        match store.get(&ItemId::multi::<Tag>()) {
            Some(Slot::Multi(list)) => list.iter().map(|(_, v)| downcast::<Tag>(v).0).collect(),
            _ => vec![],
        }
    }

    #[test]
    fn simple_slots_are_write_once() {
        let mut store = ArtifactStore::default();
        let item = ItemId::simple::<Name>();
        store.commit(&"a".into(), item, Arc::new(Name("x"))).unwrap();

        let err = store.commit(&"b".into(), item, Arc::new(Name("y"))).unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::ConflictingWrite { step, .. } if step.as_str() == "b"
        ));
    }

    #[test]
    fn multi_contributions_sort_by_producer() {
        let mut store = ArtifactStore::default();
        let item = ItemId::multi::<Tag>();
        store.commit(&"zeta".into(), item, Arc::new(Tag("z"))).unwrap();
        store.commit(&"alpha".into(), item, Arc::new(Tag("a"))).unwrap();
        store.commit(&StepId::initial(), item, Arc::new(Tag("i"))).unwrap();
        store.commit(&"mu".into(), item, Arc::new(Tag("m"))).unwrap();

        assert_eq!(names(&store), ["i", "a", "m", "z"]);

        let err = store.commit(&"mu".into(), item, Arc::new(Tag("again")));
        assert!(err.is_err());
    }

    #[test]
    fn initial_values_are_checked() {
        let declared = [ItemId::simple::<Name>(), ItemId::multi::<Tag>()];

        let store = Initial::new().simple(Name("app")).into_store(&declared).unwrap();
        assert!(store.get(&ItemId::simple::<Name>()).is_some());
        assert!(store.get(&ItemId::multi::<Tag>()).is_none());

        let missing = Initial::new().multi(Tag("t")).into_store(&declared);
        assert!(matches!(missing, Err(ExecutionError::MissingInitial(_))));

        let undeclared = Initial::new().multi(Tag("t")).into_store(&[]);
        assert!(matches!(undeclared, Err(ExecutionError::UndeclaredInitial(_))));
    }

    #[test]
    fn context_enforces_declarations() {
        let step = StepDescriptor::new(
            "s",
            [Produce {
                item: ItemId::multi::<Tag>(),
                overridable: false,
                weak: false,
            }],
            [Consume {
                item: ItemId::simple::<Name>(),
                strength: Strength::Optional,
            }],
            false,
            |_| Ok(()),
        );
        let store = ArtifactStore::default();
        let mut ctx = StepContext::new(&step, &store, tracing::Span::none());

        assert!(ctx.consume_optional::<Name>().unwrap().is_none());
        assert!(matches!(ctx.consume::<Name>(), Err(ContextError::Missing(_))));
        assert!(matches!(ctx.consume_multi::<Tag>(), Err(ContextError::NotConsumed(_))));
        assert!(matches!(ctx.produce(Name("n")), Err(ContextError::NotProduced(_))));

        ctx.produce_multi(Tag("t")).unwrap();
        assert!(matches!(ctx.produce_multi(Tag("u")), Err(ContextError::AlreadyProduced(_))));
        assert_eq!(ctx.finish().unwrap().len(), 1);
    }

    #[test]
    fn overridden_items_are_optional_and_dropped() {
        let produces = [
            Produce {
                item: ItemId::simple::<Name>(),
                overridable: true,
                weak: false,
            },
            Produce {
                item: ItemId::multi::<Tag>(),
                overridable: false,
                weak: false,
            },
        ];
        let step = StepDescriptor::new("defaults", produces, [], false, |_| Ok(()))
            .with_overridden(&[ItemId::simple::<Name>()]);
        let store = ArtifactStore::default();

        let mut ctx = StepContext::new(&step, &store, tracing::Span::none());
        assert!(ctx.is_overridden(&ItemId::simple::<Name>()));
        ctx.produce_multi(Tag("t")).unwrap();
        let writes = ctx.finish().unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, ItemId::multi::<Tag>());

        let mut ctx = StepContext::new(&step, &store, tracing::Span::none());
        ctx.produce(Name("ignored")).unwrap();
        ctx.produce_multi(Tag("t")).unwrap();
        let writes = ctx.finish().unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, ItemId::multi::<Tag>());
    }

    #[test]
    fn unwritten_declarations_fail_the_step() {
        let step = StepDescriptor::new(
            "lazy",
            [Produce {
                item: ItemId::simple::<Name>(),
                overridable: false,
                weak: false,
            }],
            [],
            false,
            |_| Ok(()),
        );
        let store = ArtifactStore::default();
        let ctx = StepContext::new(&step, &store, tracing::Span::none());

        let err = ctx.finish().unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::UnproducedDeclaredItem { step, .. } if step.as_str() == "lazy"
        ));
    }
}

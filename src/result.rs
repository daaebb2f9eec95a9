use std::collections::HashMap;

use crate::core::StepId;
use crate::item::{ItemId, MultiItem, SimpleItem};
use crate::store::{Slot, downcast};

/// Final items of a successful run. Nothing else survives the run.
pub struct BuildResult {
    slots: HashMap<ItemId, Slot>,
}

impl BuildResult {
    pub(crate) fn new(slots: HashMap<ItemId, Slot>) -> Self {
        Self { slots }
    }

    /// Value of a final simple item, `None` if it was not requested as a final
    /// item or nothing produced it.
    pub fn get<T: SimpleItem>(&self) -> Option<&T> {
        match self.slots.get(&ItemId::simple::<T>())? {
            Slot::Simple(value) => Some(downcast(value)),
            Slot::Multi(_) => None,
        }
    }

    /// Every contribution to a final multi item, ordered by producer id.
    /// Empty when the item had no contributions.
    pub fn get_all<T: MultiItem>(&self) -> Vec<&T> {
        self.contributions::<T>()
            .into_iter()
            .map(|(_, value)| value)
            .collect()
    }

    /// Like [`get_all`](Self::get_all), tagged with the producing step.
    pub fn contributions<T: MultiItem>(&self) -> Vec<(&StepId, &T)> {
        match self.slots.get(&ItemId::multi::<T>()) {
            Some(Slot::Multi(list)) => list
                .iter()
                .map(|(producer, value)| (producer, downcast(value)))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn contains(&self, item: &ItemId) -> bool {
        self.slots.contains_key(item)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl std::fmt::Debug for BuildResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.slots.keys().map(ItemId::name).collect();
        names.sort_unstable();
        f.debug_struct("BuildResult").field("items", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::Dynamic;

    struct Title(String);
    impl SimpleItem for Title {}

    struct Line(u32);
    impl MultiItem for Line {}

    struct Absent;
    impl SimpleItem for Absent {}

    #[test]
    fn typed_lookup() {
        let mut slots = HashMap::new();
        slots.insert(
            ItemId::simple::<Title>(),
            Slot::Simple(Arc::new(Title("hello".into()))),
        );
        slots.insert(
            ItemId::multi::<Line>(),
            Slot::Multi(vec![
                (StepId::from("a"), Arc::new(Line(1)) as Dynamic),
                (StepId::from("b"), Arc::new(Line(2)) as Dynamic),
            ]),
        );

        let result = BuildResult::new(slots);
        assert_eq!(result.get::<Title>().unwrap().0, "hello");
        assert!(result.get::<Absent>().is_none());
        assert!(!result.contains(&ItemId::simple::<Absent>()));

        let lines: Vec<u32> = result.get_all::<Line>().iter().map(|l| l.0).collect();
        assert_eq!(lines, [1, 2]);

        let producers: Vec<&str> = result
            .contributions::<Line>()
            .into_iter()
            .map(|(id, _)| id.as_str())
            .collect();
        assert_eq!(producers, ["a", "b"]);
        assert_eq!(result.len(), 2);
    }
}

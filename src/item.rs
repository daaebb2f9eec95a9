//! Build item identities.
//!
//! A build item is any Rust type that opts in through [`SimpleItem`] or
//! [`MultiItem`]. The engine never looks inside an item; it only tracks which
//! steps produce and consume which item *types*. Under the hood every value is
//! stored as `Arc<dyn Any + Send + Sync>`, and the typed accessors on
//! [`StepContext`](crate::StepContext) and [`BuildResult`](crate::BuildResult)
//! perform the matching `downcast_ref`. Because an [`ItemId`] can only be
//! created from the item's own type, that downcast cannot fail.

use std::any::{TypeId, type_name};
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// A build item with at most one producer per chain and a single value.
///
/// ```rust
/// use buildchain::SimpleItem;
///
/// struct ApplicationName(String);
/// impl SimpleItem for ApplicationName {}
/// ```
pub trait SimpleItem: Send + Sync + 'static {}

/// A build item with any number of producers. Consumers see every
/// contribution, one per producing step.
///
/// ```rust
/// use buildchain::MultiItem;
///
/// struct ReflectiveClass(&'static str);
/// impl MultiItem for ReflectiveClass {}
/// ```
pub trait MultiItem: Send + Sync + 'static {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemKind {
    Simple,
    Multi,
}

/// The identity of a build item type.
///
/// Equality and hashing go through the Rust [`TypeId`] only; `name` is the
/// type name kept for error messages and graph dumps.
#[derive(Clone, Copy)]
pub struct ItemId {
    type_id: TypeId,
    name: &'static str,
    kind: ItemKind,
}

impl ItemId {
    pub fn simple<T: SimpleItem>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            name: type_name::<T>(),
            kind: ItemKind::Simple,
        }
    }

    pub fn multi<T: MultiItem>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            name: type_name::<T>(),
            kind: ItemKind::Multi,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> ItemKind {
        self.kind
    }

    pub fn is_multi(&self) -> bool {
        self.kind == ItemKind::Multi
    }
}

impl PartialEq for ItemId {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for ItemId {}

impl Hash for ItemId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
    }
}

impl fmt::Debug for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", self.name, self.kind)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// How strongly a step depends on an item it consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Strength {
    /// The chain fails to build if no step produces the item. Forces the
    /// inclusion of its producers.
    Required,
    /// Absence is tolerated, but present producers are still included and
    /// ordered before the consumer.
    Optional,
    /// Ordering only: the consumer runs after the producer if, and only if,
    /// the producer is included for some other reason.
    Weak,
}

impl Strength {
    /// Whether this edge pulls its producers into the chain.
    pub(crate) fn includes_producer(self) -> bool {
        matches!(self, Strength::Required | Strength::Optional)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Consume {
    pub item: ItemId,
    pub strength: Strength,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Produce {
    pub item: ItemId,
    /// An overridable producer is only wired when no regular producer of the
    /// item exists. Otherwise its write is discarded.
    pub overridable: bool,
    /// A weak produce never pulls its step into the chain. It still orders
    /// consumers after the step when the step is included for another reason.
    pub weak: bool,
}

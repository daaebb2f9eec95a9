use std::any::Any;
use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A type-erased, thread-safe container.
pub(crate) type Dynamic = Arc<dyn Any + Send + Sync>;

/// Atomic reference-counted string type used for identifiers.
pub(crate) type ArcStr = Arc<str>;

/// Stable identifier of a build step.
///
/// Step ids are the unit of blame: every [`GraphError`](crate::GraphError) and
/// [`ExecutionError`](crate::ExecutionError) names the offending step by its
/// id, so they should be unique and meaningful (e.g. `"arc::register-beans"`).
///
/// Ids are ordered lexicographically. This ordering is what makes the
/// contributions of a Multi item deterministic.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StepId(ArcStr);

impl StepId {
    /// Producer id attached to Multi values supplied as initial inputs.
    pub const INITIAL: &'static str = "<initial>";

    pub fn new(id: impl Into<ArcStr>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn initial() -> Self {
        Self::new(Self::INITIAL)
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StepId({:?})", &*self.0)
    }
}

impl Borrow<str> for StepId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StepId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for StepId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl Serialize for StepId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for StepId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(StepId::from)
    }
}

/// A 32-byte BLAKE3 hash.
///
/// Used to fingerprint a plan manifest, so that a cached plan can be checked
/// against the currently registered steps before it is reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in &self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_ids_order_lexicographically() {
        let mut ids = vec![StepId::from("b"), StepId::from("a"), StepId::from("c")];
        ids.sort();
        let ids: Vec<_> = ids.iter().map(StepId::as_str).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[test]
    fn hash_is_stable_hex() {
        let a = Hash32::from(blake3::hash(b"chain"));
        let b = Hash32::from(blake3::hash(b"chain"));
        assert_eq!(a, b);
        assert_eq!(a.to_hex(), blake3::hash(b"chain").to_hex().as_str());
        assert_ne!(a, Hash32::from(blake3::hash(b"chains")));
    }
}

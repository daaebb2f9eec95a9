//! Serializable description of a plan: step ids, their declarations and the
//! wave layout. Step actions are never part of it.
//!
//! Item names are Rust type names, which are only stable for one build of the
//! program. A manifest is meant to be compared against a plan built by the same
//! binary, e.g. to decide whether a cached incremental build is still valid.

use serde::{Deserialize, Serialize};

use crate::core::{Hash32, StepId};
use crate::item::{ItemId, ItemKind, Strength};
use crate::plan::ExecutionPlan;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemManifest {
    pub name: String,
    pub kind: ItemKind,
}

impl From<&ItemId> for ItemManifest {
    fn from(item: &ItemId) -> Self {
        Self {
            name: item.name().to_string(),
            kind: item.kind(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProduceManifest {
    pub item: ItemManifest,
    pub overridable: bool,
    pub weak: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumeManifest {
    pub item: ItemManifest,
    pub strength: Strength,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepManifest {
    pub id: StepId,
    pub always_run: bool,
    pub produces: Vec<ProduceManifest>,
    pub consumes: Vec<ConsumeManifest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanManifest {
    /// Sorted by step id.
    pub steps: Vec<StepManifest>,
    pub waves: Vec<Vec<StepId>>,
    pub finals: Vec<ItemManifest>,
    pub initials: Vec<ItemManifest>,
}

impl PlanManifest {
    pub(crate) fn from_plan(plan: &ExecutionPlan) -> Self {
        let mut steps: Vec<StepManifest> = plan
            .steps()
            .map(|step| {
                let mut produces: Vec<_> = step
                    .produces()
                    .iter()
                    .map(|p| ProduceManifest {
                        item: (&p.item).into(),
                        overridable: p.overridable,
                        weak: p.weak,
                    })
                    .collect();
                produces.sort_by(|a, b| a.item.name.cmp(&b.item.name));

                let mut consumes: Vec<_> = step
                    .consumes()
                    .iter()
                    .map(|c| ConsumeManifest {
                        item: (&c.item).into(),
                        strength: c.strength,
                    })
                    .collect();
                consumes.sort_by(|a, b| a.item.name.cmp(&b.item.name));

                StepManifest {
                    id: step.id().clone(),
                    always_run: step.always_run(),
                    produces,
                    consumes,
                }
            })
            .collect();
        steps.sort_by(|a, b| a.id.cmp(&b.id));

        let waves = plan
            .waves()
            .into_iter()
            .map(|wave| wave.into_iter().cloned().collect())
            .collect();

        Self {
            steps,
            waves,
            finals: sorted_items(plan.finals()),
            initials: sorted_items(plan.initials()),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn to_cbor(&self) -> Result<Vec<u8>, ciborium::ser::Error<std::io::Error>> {
        let mut buffer = Vec::new();
        ciborium::into_writer(self, &mut buffer)?;
        Ok(buffer)
    }

    pub fn from_cbor(bytes: &[u8]) -> Result<Self, ciborium::de::Error<std::io::Error>> {
        ciborium::from_reader(bytes)
    }

    /// BLAKE3 digest over every field of the manifest. Two plans with the same
    /// fingerprint declare the same steps and run them in the same waves.
    pub fn fingerprint(&self) -> Hash32 {
        let mut hasher = blake3::Hasher::new();

        let mut field = |bytes: &[u8]| {
            hasher.update(&(bytes.len() as u64).to_le_bytes());
            hasher.update(bytes);
        };

        for step in &self.steps {
            field(step.id.as_str().as_bytes());
            field(&[step.always_run as u8]);
            for p in &step.produces {
                field(p.item.name.as_bytes());
                field(&[p.item.kind as u8, p.overridable as u8, p.weak as u8]);
            }
            field(b"|");
            for c in &step.consumes {
                field(c.item.name.as_bytes());
                field(&[c.item.kind as u8, c.strength as u8]);
            }
            field(b";");
        }

        for wave in &self.waves {
            for id in wave {
                field(id.as_str().as_bytes());
            }
            field(b"~");
        }

        for (tag, items) in [(b"final", &self.finals), (b"inits", &self.initials)] {
            field(tag);
            for item in items {
                field(item.name.as_bytes());
                field(&[item.kind as u8]);
            }
        }

        hasher.finalize().into()
    }
}

fn sorted_items(items: &[ItemId]) -> Vec<ItemManifest> {
    let mut items: Vec<ItemManifest> = items.iter().map(Into::into).collect();
    items.sort_by(|a, b| a.name.cmp(&b.name));
    items
}

#[cfg(test)]
mod tests {
    use crate::{ChainBuilder, MultiItem, SimpleItem};

    struct Config;
    impl SimpleItem for Config {}

    struct Route;
    impl MultiItem for Route {}

    struct Router;
    impl SimpleItem for Router {}

    fn chain() -> ChainBuilder {
        let mut chain = ChainBuilder::default();
        chain.add_initial::<Config>();
        chain
            .step("routes::health")
            .consumes::<Config>()
            .produces_multi::<Route>()
            .run(|ctx| Ok(ctx.produce_multi(Route)?));
        chain
            .step("router")
            .consumes_multi::<Route>()
            .produces::<Router>()
            .run(|ctx| Ok(ctx.produce(Router)?));
        chain.add_final::<Router>();
        chain
    }

    #[test]
    fn manifest_survives_json_and_cbor() {
        let manifest = chain().build().unwrap().manifest();

        let json = manifest.to_json().unwrap();
        assert!(json.contains("routes::health"));
        assert!(!json.contains("action"));
        assert_eq!(super::PlanManifest::from_json(&json).unwrap(), manifest);

        let cbor = manifest.to_cbor().unwrap();
        assert_eq!(super::PlanManifest::from_cbor(&cbor).unwrap(), manifest);
    }

    #[test]
    fn fingerprint_tracks_declarations() {
        let first = chain().build().unwrap().fingerprint();
        let again = chain().build().unwrap().fingerprint();
        assert_eq!(first, again);

        let mut changed = chain();
        changed
            .step("routes::metrics")
            .produces_multi::<Route>()
            .run(|ctx| Ok(ctx.produce_multi(Route)?));
        assert_ne!(first, changed.build().unwrap().fingerprint());
    }
}

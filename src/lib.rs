#![forbid(unsafe_code)]
//! Build steps declare the typed items they produce and consume. A
//! [`ChainBuilder`] wires them into a dependency graph, drops every step that
//! does not contribute to a requested final item, and partitions the rest into
//! waves. Steps of one wave are independent of each other and run in parallel
//! on a worker pool, waves run one after another.
//!
//! ```rust
//! use buildchain::{ChainBuilder, ExecutorConfig, Initial, MultiItem, SimpleItem};
//!
//! struct Prefix(&'static str);
//! impl SimpleItem for Prefix {}
//!
//! struct Route(String);
//! impl MultiItem for Route {}
//!
//! struct Table(Vec<String>);
//! impl SimpleItem for Table {}
//!
//! let mut chain = ChainBuilder::new();
//! chain.add_initial::<Prefix>();
//!
//! for name in ["health", "users"] {
//!     chain
//!         .step(format!("route::{name}"))
//!         .consumes::<Prefix>()
//!         .produces_multi::<Route>()
//!         .run(move |ctx| {
//!             let prefix = ctx.consume::<Prefix>()?;
//!             ctx.produce_multi(Route(format!("{}/{name}", prefix.0)))?;
//!             Ok(())
//!         });
//! }
//!
//! chain
//!     .step("table")
//!     .consumes_multi::<Route>()
//!     .produces::<Table>()
//!     .run(|ctx| {
//!         let routes = ctx.consume_multi::<Route>()?;
//!         ctx.produce(Table(routes.iter().map(|r| r.0.clone()).collect()))?;
//!         Ok(())
//!     });
//!
//! chain.add_final::<Table>();
//!
//! let plan = chain.build().unwrap();
//! assert_eq!(plan.waves().len(), 2);
//!
//! let result = plan
//!     .run(&ExecutorConfig::default(), Initial::new().simple(Prefix("/api")))
//!     .unwrap();
//! assert_eq!(result.get::<Table>().unwrap().0, ["/api/health", "/api/users"]);
//! ```

mod chain;
mod core;
mod error;
mod executor;
mod item;
mod plan;
mod result;
mod step;
mod store;
mod utils;

pub use crate::chain::{ChainBuilder, GRAPH_OUTPUT_ENV, StepBuilder, StepHandle};
pub use crate::core::{Hash32, StepId};
pub use crate::error::{ContextError, CycleLink, ExecutionError, GraphError};
pub use crate::executor::{
    Diagnostics, ExecutionState, ExecutorConfig, FAIL_FAST_ENV, StepRecord, StepState, WORKERS_ENV,
};
pub use crate::item::{Consume, ItemId, ItemKind, MultiItem, Produce, SimpleItem, Strength};
pub use crate::plan::{
    ConsumeManifest, ExecutionPlan, ItemManifest, PlanManifest, ProduceManifest, StepManifest,
};
pub use crate::result::BuildResult;
pub use crate::step::{StepAction, StepDescriptor};
pub use crate::store::{Initial, StepContext};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;

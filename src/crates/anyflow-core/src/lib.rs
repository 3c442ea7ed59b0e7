//! # anyflow-core — dataflow graph execution engine
//!
//! Compile a declared DAG of computation vertices into a reusable runtime
//! [`Graph`], then execute it on demand with lazy activation, conditional
//! branches, mutable/immutable data sharing and streaming (channel) edges.
//! Built for request-scoped serving pipelines — search ranking,
//! recommendation — where thousands of graph instances run every second and
//! scheduling overhead has to stay negligible.
//!
//! ## Core concepts
//!
//! - **Data slots** ([`GraphData`]): named, type-checked cells connecting
//!   vertices. Publication is a two-phase commit: one [`Committer`] per slot
//!   per run wins a compare-and-swap, edits the pending value, and commits
//!   on release. Readiness is published with release/acquire ordering, so
//!   consumers never lock.
//! - **Vertices** ([`vertex::GraphVertex`]): operator instances implementing
//!   [`GraphProcessor`]. Activation walks backward from the requested
//!   outputs, so only the vertices a run actually needs ever execute.
//! - **Conditional edges** ([`GraphDependency`]): dependencies may be gated
//!   by a condition slot with `on`/`unless` polarity; unsatisfied branches
//!   are skipped without running their producers.
//! - **Closures** ([`Closure`]): per-run completion trackers with an error
//!   latch, a completion callback slot, and stall detection with an audit of
//!   slots that can never become ready.
//! - **Channels** ([`Topic`]): ordered streaming edges with explicit close,
//!   letting a consumer start before its producer finished.
//! - **Executors** ([`GraphExecutor`]): pluggable dispatch — inline on the
//!   caller's thread by default, or a bounded thread pool. Trivial vertices
//!   always chain inline, iteratively, on the thread that completed their
//!   last dependency.
//!
//! ## Quick start
//!
//! ```rust
//! use anyflow_core::{GraphBuilder, GraphProcessor, Result, VertexContext};
//!
//! struct Doubler;
//!
//! impl GraphProcessor for Doubler {
//!     fn setup(&mut self, vertex: &VertexContext) -> Result<()> {
//!         if let Some(dependency) = vertex.named_dependency("input") {
//!             dependency.declare_type::<i64>();
//!         }
//!         if let Some(emit) = vertex.named_emit("output") {
//!             emit.declare_type::<i64>();
//!         }
//!         Ok(())
//!     }
//!
//!     fn process(&mut self, vertex: &VertexContext) -> Result<()> {
//!         let input = vertex
//!             .named_dependency("input")
//!             .and_then(|dependency| dependency.value::<i64>())
//!             .copied()
//!             .unwrap_or(0);
//!         if let Some(emit) = vertex.named_emit("output") {
//!             emit.emit::<i64>().set(input * 2);
//!         }
//!         Ok(())
//!     }
//! }
//!
//! let mut builder = GraphBuilder::new();
//! {
//!     let vertex = builder.add_vertex(|| Box::new(Doubler));
//!     vertex.set_name("doubler");
//!     vertex.named_depend("input").to("A");
//!     vertex.named_emit("output").to("B");
//! }
//! builder.finish().unwrap();
//! let graph = builder.build().unwrap();
//!
//! // Feed the input by committing into its slot, then request the output.
//! let a = graph.find_data("A").unwrap();
//! a.emit::<i64>().set(21);
//! let b = graph.find_data("B").unwrap();
//! assert_eq!(graph.run(&[b]).get(), 0);
//! assert_eq!(b.value::<i64>().copied(), Some(42));
//! ```
//!
//! ## Reuse
//!
//! A graph instance is meant to be reused: [`Graph::reset`] clears per-run
//! state, releases every object allocated through the graph's
//! [`MemoryRegion`] in one pass, and (per slot) either destroys the value or
//! applies a user reset callback that keeps its capacity for the next run.

pub mod builder;
pub mod builtin;
pub mod channel;
pub mod closure;
pub mod data;
pub mod dependency;
pub mod error;
pub mod executor;
pub mod graph;
mod runnable;
pub mod value;
pub mod vertex;

pub use builder::{GraphBuilder, GraphDependencyBuilder, GraphEmitBuilder, GraphVertexBuilder};
pub use channel::{ConsumeRange, Consumer, MutableConsumeRange, MutableConsumer, Topic};
pub use closure::{Closure, ClosureCallback, ClosureContext};
pub use data::{ChannelPublisher, Committer, GraphData, OutputChannel, OutputData};
pub use dependency::{
    ChannelConsumer, Essential, GraphDependency, InputChannel, MutableChannelConsumer,
    MutableInputChannel,
};
pub use error::{GraphError, Result};
pub use executor::{
    CallbackTask, GraphExecutor, InplaceGraphExecutor, ThreadPoolGraphExecutor, VertexTask,
};
pub use graph::Graph;
pub use value::{Prim, Primitive, TypeTag, Value};
pub use vertex::{GraphProcessor, GraphVertex, GraphVertexClosure, SharedData, VertexContext};

pub use anyflow_memory::{MemoryRegion, Reuse, ReusableManager, ReusableObject};

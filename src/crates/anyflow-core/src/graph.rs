//! The compiled, reusable runtime graph.
//!
//! A [`Graph`] is produced by the builder and executed many times: `run`
//! activates backward from the requested target slots, dispatches whatever
//! became runnable, and hands back a [`Closure`] tracking completion;
//! `reset` clears all per-run state and releases the graph's memory region
//! so the instance can serve the next request.
//!
//! Activation walks producer edges in reverse: every requested slot binds
//! the run closure, marks itself active, and activates its producers'
//! vertices, which activate their dependencies, and so on down to the
//! leaves. Vertices whose dependencies were all satisfied at activation time
//! are dispatched immediately from the drain scope opened by `run`.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use anyflow_memory::{MemoryRegion, Reuse, ReusableManager, ReusableObject};

use crate::closure::Closure;
use crate::data::GraphData;
use crate::error::Result;
use crate::executor::GraphExecutor;
use crate::runnable::RunnableScope;
use crate::vertex::GraphVertex;

/// Shared immutable topology plus per-run state, reference-counted so
/// executor tasks and async vertex closures can outlive the caller's borrow.
pub(crate) struct GraphCore {
    name: String,
    executor: Arc<dyn GraphExecutor>,
    data: Vec<GraphData>,
    vertices: Vec<GraphVertex>,
    data_index_by_name: HashMap<String, usize>,
    context: OnceLock<Box<dyn Any + Send + Sync>>,
    memory: MemoryRegion,
    reusable: ReusableManager,
}

impl GraphCore {
    pub(crate) fn new(
        name: String,
        executor: Arc<dyn GraphExecutor>,
        data: Vec<GraphData>,
        vertices: Vec<GraphVertex>,
        data_index_by_name: HashMap<String, usize>,
    ) -> Self {
        Self {
            name,
            executor,
            data,
            vertices,
            data_index_by_name,
            context: OnceLock::new(),
            memory: MemoryRegion::new(),
            reusable: ReusableManager::new(),
        }
    }

    pub(crate) fn data(&self, index: usize) -> &GraphData {
        &self.data[index]
    }

    pub(crate) fn vertex(&self, index: usize) -> &GraphVertex {
        &self.vertices[index]
    }

    pub(crate) fn all_data(&self) -> &[GraphData] {
        &self.data
    }

    pub(crate) fn all_vertices(&self) -> &[GraphVertex] {
        &self.vertices
    }

    pub(crate) fn executor(&self) -> &Arc<dyn GraphExecutor> {
        &self.executor
    }

    pub(crate) fn memory_resource(&self) -> &MemoryRegion {
        &self.memory
    }

    pub(crate) fn reusable_manager(&self) -> &ReusableManager {
        &self.reusable
    }

    pub(crate) fn context<T: Default + Send + Sync + 'static>(&self) -> Option<&T> {
        self.context
            .get_or_init(|| Box::new(T::default()))
            .downcast_ref::<T>()
    }
}

/// A compiled dataflow graph, ready to run.
///
/// Not clonable: one `Graph` is one instance with its own per-run state.
/// Build several instances from the same builder for concurrent requests.
pub struct Graph {
    core: Arc<GraphCore>,
}

impl Graph {
    pub(crate) fn from_core(core: Arc<GraphCore>) -> Self {
        Self { core }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Look up a slot by name, for presetting inputs, requesting outputs or
    /// reading results.
    pub fn find_data(&self, name: &str) -> Option<&GraphData> {
        match self.core.data_index_by_name.get(name) {
            Some(&index) => Some(self.core.data(index)),
            None => {
                tracing::warn!(graph = %self.core.name, data = name, "no data with that name");
                None
            }
        }
    }

    /// Evaluate the graph until every target slot is ready.
    ///
    /// Walks backward from the targets activating producers, dispatches the
    /// initially-satisfied vertices, then lets completion waves drive the
    /// rest. The returned [`Closure`] reports the terminal state; dropping
    /// it waits for the run to flush.
    pub fn run(&self, targets: &[&GraphData]) -> Closure {
        let closure = Closure::create(self.core.executor.clone());
        let context = closure.context().clone();
        context.set_all_data_num(self.core.data.len());

        let scope = RunnableScope::enter(&self.core);
        for &target in targets {
            if !target.bind(&context) {
                continue;
            }
            if let Err(error) = target.recursive_activate(&self.core, &context) {
                tracing::warn!(graph = %self.core.name, target = %target, %error, "activation failed");
                scope.discard();
                drop(scope);
                context.finish(error.code());
                context.fire();
                return closure;
            }
        }
        drop(scope);
        context.fire();
        closure
    }

    /// Clear all per-run state: slot values (per their reset callbacks),
    /// vertex activation, processor scratch, the memory region and every
    /// reusable object.
    ///
    /// Must not overlap a run: wait on (or drop) the previous run's
    /// [`Closure`] first, which guarantees no processor is still executing.
    pub fn reset(&mut self) {
        for data in &self.core.data {
            data.reset();
        }
        for vertex in &self.core.vertices {
            vertex.reset();
        }
        // SAFETY: `&mut self` plus the no-overlapping-run contract means no
        // reference created from the region is still alive.
        unsafe { self.core.memory.release_shared() };
        self.core.reusable.clear();
    }

    /// Graph-level shared context of type `T`, materialized with
    /// `T::default()` on first access. One type per graph.
    pub fn context<T: Default + Send + Sync + 'static>(&self) -> Option<&T> {
        self.core.context::<T>()
    }

    /// Allocate an object in the graph's memory region; destroyed at the
    /// next `reset`.
    pub fn create_object<T: Send + Sync + 'static>(&self, value: T) -> &T {
        self.core.memory.create(value)
    }

    /// The graph's memory region.
    pub fn memory_resource(&self) -> &MemoryRegion {
        &self.core.memory
    }

    /// Create a reusable object, logically cleared at every `reset`.
    pub fn create_reusable_object<T: Reuse + Default + Send + Sync>(&self) -> ReusableObject<T> {
        self.core.reusable.create::<T>()
    }

    /// Visit every vertex; stops at the first error.
    pub fn for_each_vertex(&self, mut f: impl FnMut(&GraphVertex) -> Result<()>) -> Result<()> {
        for vertex in &self.core.vertices {
            f(vertex)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("name", &self.core.name)
            .field("data", &self.core.data.len())
            .field("vertices", &self.core.vertices.len())
            .finish()
    }
}

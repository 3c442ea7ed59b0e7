//! Vertices, the operator contract, and per-vertex completion handles.
//!
//! A [`GraphVertex`] is one operator instance: its dependencies, its emits,
//! and a [`GraphProcessor`] implementation. Activation is a single-shot CAS;
//! dispatch happens once the last dependency reaches its terminal state.
//! Trivial vertices run inline on the thread that completed their last
//! dependency (chained iteratively through the drain scope); everything else
//! goes through the executor.
//!
//! Processors bind to named slots explicitly: `setup` declares types,
//! mutability and essentiality against named or anonymous dependencies and
//! emits, and `process` fetches typed values through the same accessors.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use anyflow_memory::{MemoryRegion, Reuse, ReusableObject};

use crate::closure::ClosureContext;
use crate::data::GraphData;
use crate::dependency::{Essential, GraphDependency};
use crate::error::{GraphError, Result};
use crate::executor::VertexTask;
use crate::graph::GraphCore;
use crate::runnable::RunnableScope;
use crate::value::Value;

/// User-supplied operator.
///
/// One instance is created per vertex per graph instance, so implementations
/// are free to keep scratch state in `self`; the engine guarantees at most
/// one `process` call per run.
pub trait GraphProcessor: Send {
    /// Build-compile hook, run once per vertex builder on a throwaway
    /// instance. Transforms the raw user option into the normalized form
    /// every graph instance of this vertex will see. Failure aborts the
    /// build.
    fn config(&self, raw: Value) -> Result<Value> {
        Ok(raw)
    }

    /// Per-graph-instance hook. Declares dependency/emit types (triggering
    /// type-consistency checks on the slots) and may mark the vertex
    /// trivial.
    fn setup(&mut self, vertex: &VertexContext) -> Result<()> {
        let _ = vertex;
        Ok(())
    }

    /// Runs each time the vertex is activated, before dependencies resolve.
    /// The place to propagate mutability claims onto dependencies.
    fn on_activate(&mut self, vertex: &VertexContext) -> Result<()> {
        let _ = vertex;
        Ok(())
    }

    /// The computation. An `Err` fails the whole run with the error's code.
    fn process(&mut self, vertex: &VertexContext) -> Result<()> {
        let _ = vertex;
        Ok(())
    }

    /// Asynchronous form: take ownership of the vertex closure and complete
    /// it later from any thread. The default runs [`process`](Self::process)
    /// synchronously.
    fn process_async(&mut self, vertex: &VertexContext, closure: GraphVertexClosure) {
        match self.process(vertex) {
            Ok(()) => closure.done(0),
            Err(error) => closure.done(error.code()),
        }
    }

    /// Runs during `Graph::reset` to clear per-run scratch state.
    fn reset(&mut self) {}
}

/// One computation node of a built graph.
pub struct GraphVertex {
    index: usize,
    name: Arc<str>,
    processor: Mutex<Box<dyn GraphProcessor>>,
    dependencies: Vec<GraphDependency>,
    // Data index per emit edge; named emits first, anonymous after.
    emits: Vec<usize>,
    dependency_index_by_name: HashMap<String, usize>,
    emit_index_by_name: HashMap<String, usize>,
    // Named entries occupy the front of the vectors.
    anonymous_dependency_start: usize,
    anonymous_emit_start: usize,
    option: Arc<Value>,
    allow_trivial: bool,

    trivial: AtomicBool,
    activated: AtomicBool,
    waiting_num: AtomicI64,
    closure: Mutex<Option<Arc<ClosureContext>>>,
}

#[allow(clippy::too_many_arguments)]
impl GraphVertex {
    pub(crate) fn new(
        index: usize,
        name: Arc<str>,
        processor: Box<dyn GraphProcessor>,
        dependencies: Vec<GraphDependency>,
        emits: Vec<usize>,
        dependency_index_by_name: HashMap<String, usize>,
        emit_index_by_name: HashMap<String, usize>,
        anonymous_dependency_start: usize,
        anonymous_emit_start: usize,
        option: Arc<Value>,
        allow_trivial: bool,
    ) -> Self {
        Self {
            index,
            name,
            processor: Mutex::new(processor),
            dependencies,
            emits,
            dependency_index_by_name,
            emit_index_by_name,
            anonymous_dependency_start,
            anonymous_emit_start,
            option,
            allow_trivial,
            trivial: AtomicBool::new(false),
            activated: AtomicBool::new(false),
            waiting_num: AtomicI64::new(0),
            closure: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Mark this vertex to run inline on the completing thread instead of
    /// through the executor. Ignored for vertices that must stay off the
    /// inline path (multiple producers of one slot).
    pub fn declare_trivial(&self) {
        if self.allow_trivial {
            self.trivial.store(true, Ordering::Relaxed);
        }
    }

    /// The vertex's normalized option.
    pub fn option<T: 'static>(&self) -> Option<&T> {
        self.option.get::<T>()
    }

    pub(crate) fn option_value(&self) -> &Arc<Value> {
        &self.option
    }

    pub(crate) fn dependencies(&self) -> &[GraphDependency] {
        &self.dependencies
    }

    pub(crate) fn dependency(&self, slot: usize) -> &GraphDependency {
        &self.dependencies[slot]
    }

    /// Dependency declared under `name`, if wired.
    pub fn named_dependency(&self, name: &str) -> Option<&GraphDependency> {
        self.dependency_index_by_name
            .get(name)
            .map(|&slot| &self.dependencies[slot])
    }

    /// Positional dependency, in `[0, anonymous_dependency_len)`.
    pub fn anonymous_dependency(&self, index: usize) -> Option<&GraphDependency> {
        self.dependencies.get(self.anonymous_dependency_start + index)
    }

    pub fn anonymous_dependency_len(&self) -> usize {
        self.dependencies.len() - self.anonymous_dependency_start
    }

    pub(crate) fn emits(&self) -> &[usize] {
        &self.emits
    }

    pub(crate) fn named_emit_index(&self, name: &str) -> Option<usize> {
        self.emit_index_by_name
            .get(name)
            .map(|&slot| self.emits[slot])
    }

    pub fn anonymous_emit_len(&self) -> usize {
        self.emits.len() - self.anonymous_emit_start
    }

    /// Publish the empty value through every emit that has not published
    /// yet, so downstream edges resolve.
    pub(crate) fn flush_emits(&self, core: &Arc<GraphCore>) {
        for &emit in &self.emits {
            let data = core.data(emit);
            if !data.ready() {
                data.emit_empty();
            }
        }
    }

    pub(crate) fn closure(&self) -> Option<Arc<ClosureContext>> {
        self.closure.lock().clone()
    }

    // One dependency reached its terminal state; runnable when the last one
    // lands.
    pub(crate) fn dependency_satisfied(&self) -> bool {
        self.waiting_num.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Single-shot activation: record the run closure, activate every
    /// dependency, and settle the waiting counter in one bulk subtraction.
    pub(crate) fn activate(
        &self,
        core: &Arc<GraphCore>,
        activating: &mut Vec<usize>,
        closure: &Arc<ClosureContext>,
    ) -> std::result::Result<(), GraphError> {
        if self
            .activated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        *self.closure.lock() = Some(closure.clone());

        let waiting = self.dependencies.len() as i64;
        if waiting == 0 {
            RunnableScope::schedule(core, self.index);
            return Ok(());
        }
        self.waiting_num.store(waiting, Ordering::Release);

        {
            let context = VertexContext { core, vertex: self };
            self.processor.lock().on_activate(&context)?;
        }

        let mut satisfied = 0;
        for dependency in &self.dependencies {
            satisfied += dependency.activate(activating)?;
        }
        if satisfied > 0
            && self.waiting_num.fetch_sub(satisfied, Ordering::AcqRel) - satisfied == 0
        {
            RunnableScope::schedule(core, self.index);
        }
        Ok(())
    }

    /// Dispatch the vertex once all dependencies are terminal: enforce
    /// essentiality, then run inline (trivial) or through the executor.
    pub(crate) fn invoke(&self, core: &Arc<GraphCore>) {
        let mut skip = false;
        for dependency in &self.dependencies {
            let missing = !dependency.ready() || dependency.empty();
            match dependency.essential() {
                Essential::FailOnEmpty if missing => {
                    tracing::warn!(
                        vertex = %self,
                        target = dependency.target_data().name(),
                        "required dependency is empty, failing the run"
                    );
                    if let Some(context) = self.closure() {
                        let closure = GraphVertexClosure::new(&context, core.clone(), self.index);
                        closure.done(-1);
                    }
                    return;
                }
                Essential::SkipOnEmpty if missing => skip = true,
                _ => {}
            }
        }
        if skip {
            self.flush_emits(core);
            return;
        }
        let Some(context) = self.closure() else {
            return;
        };
        let closure = GraphVertexClosure::new(&context, core.clone(), self.index);
        if self.trivial.load(Ordering::Relaxed) {
            self.run(core, closure);
        } else {
            let task = VertexTask::new(core.clone(), self.index, closure);
            if let Err(task) = core.executor().run_vertex(task) {
                tracing::warn!(vertex = %self, "executor rejected vertex, failing the run");
                task.into_closure().done(-1);
            }
        }
    }

    /// Run the processor body. Entered by the executor (or inline for
    /// trivial vertices).
    pub(crate) fn run(&self, core: &Arc<GraphCore>, closure: GraphVertexClosure) {
        if closure.finished() {
            // The run already failed; publish empties and get out of the way.
            closure.done(0);
            return;
        }
        let context = VertexContext { core, vertex: self };
        self.processor.lock().process_async(&context, closure);
    }

    pub(crate) fn reset(&self) {
        self.activated.store(false, Ordering::Relaxed);
        self.waiting_num.store(0, Ordering::Relaxed);
        *self.closure.lock() = None;
        for dependency in &self.dependencies {
            dependency.reset();
        }
        self.processor.lock().reset();
    }

    pub(crate) fn setup(&self, core: &Arc<GraphCore>) -> std::result::Result<(), GraphError> {
        let context = VertexContext { core, vertex: self };
        self.processor
            .lock()
            .setup(&context)
            .map_err(|error| GraphError::Setup {
                vertex: self.name.to_string(),
                reason: error.to_string(),
            })
    }
}

impl std::fmt::Display for GraphVertex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "vertex[{}][{}]", self.name, self.index)
    }
}

impl std::fmt::Debug for GraphVertex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphVertex")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("dependencies", &self.dependencies.len())
            .field("emits", &self.emits.len())
            .finish()
    }
}

/// What a processor sees of its vertex and graph during `setup`,
/// `on_activate` and `process`.
pub struct VertexContext<'a> {
    core: &'a Arc<GraphCore>,
    vertex: &'a GraphVertex,
}

impl<'a> VertexContext<'a> {
    /// The vertex itself (name, index, trivial flag, option).
    pub fn vertex(&self) -> &'a GraphVertex {
        self.vertex
    }

    /// Dependency declared under `name`, if wired.
    pub fn named_dependency(&self, name: &str) -> Option<&'a GraphDependency> {
        self.vertex.named_dependency(name)
    }

    /// Positional dependency.
    pub fn anonymous_dependency(&self, index: usize) -> Option<&'a GraphDependency> {
        self.vertex.anonymous_dependency(index)
    }

    pub fn anonymous_dependency_len(&self) -> usize {
        self.vertex.anonymous_dependency_len()
    }

    /// Emit slot declared under `name`, if wired.
    pub fn named_emit(&self, name: &str) -> Option<&'a GraphData> {
        self.vertex
            .named_emit_index(name)
            .map(|index| self.core.data(index))
    }

    /// Positional emit slot.
    pub fn anonymous_emit(&self, index: usize) -> Option<&'a GraphData> {
        self.vertex
            .emits()
            .get(self.vertex.anonymous_emit_start + index)
            .map(|&data| self.core.data(data))
    }

    pub fn anonymous_emit_len(&self) -> usize {
        self.vertex.anonymous_emit_len()
    }

    /// The vertex's normalized option.
    pub fn option<T: 'static>(&self) -> Option<&'a T> {
        self.vertex.option.get::<T>()
    }

    pub(crate) fn option_value(&self) -> &'a Arc<Value> {
        self.vertex.option_value()
    }

    /// Mark the vertex trivial (inline execution).
    pub fn declare_trivial(&self) {
        self.vertex.declare_trivial();
    }

    /// Allocate scratch in the graph's memory region; reclaimed at `reset`.
    pub fn create_object<T: Send + Sync + 'static>(&self, value: T) -> &'a T {
        self.core.memory_resource().create(value)
    }

    pub fn memory_resource(&self) -> &'a MemoryRegion {
        self.core.memory_resource()
    }

    /// Create a reusable object, logically cleared at every `reset`.
    pub fn create_reusable_object<T: Reuse + Default + Send + Sync>(&self) -> ReusableObject<T> {
        self.core.reusable_manager().create::<T>()
    }

    /// Graph-level shared context, if one of type `T` was materialized.
    pub fn graph_context<T: Default + Send + Sync + 'static>(&self) -> Option<&'a T> {
        self.core.context::<T>()
    }
}

/// RAII handle that keeps the run open while one vertex body executes.
///
/// Construction increments the run's vertex counter; `done(0)` (or drop)
/// flushes empty values through unpublished emits and decrements it, while a
/// non-zero code fails the run. Move-only: a processor may capture it to
/// complete asynchronously from another thread.
pub struct GraphVertexClosure {
    context: Option<Arc<ClosureContext>>,
    core: Arc<GraphCore>,
    vertex: usize,
}

impl GraphVertexClosure {
    pub(crate) fn new(context: &Arc<ClosureContext>, core: Arc<GraphCore>, vertex: usize) -> Self {
        context.depend_vertex_add();
        Self {
            context: Some(context.clone()),
            core,
            vertex,
        }
    }

    /// Whether the run already reached its terminal state.
    pub fn finished(&self) -> bool {
        self.context
            .as_ref()
            .map(|context| context.finished())
            .unwrap_or(true)
    }

    /// Finish this vertex. Zero publishes empties through unpublished
    /// emits; non-zero fails the run with `code`.
    pub fn done(mut self, code: i32) {
        self.done_impl(code);
    }

    /// Emit slot of the owning vertex, for publishing from an asynchronous
    /// completion context.
    pub fn named_emit(&self, name: &str) -> Option<SharedData> {
        self.core
            .vertex(self.vertex)
            .named_emit_index(name)
            .map(|index| SharedData {
                core: self.core.clone(),
                index,
            })
    }

    /// Positional emit slot, as [`named_emit`](Self::named_emit).
    pub fn anonymous_emit(&self, index: usize) -> Option<SharedData> {
        let vertex = self.core.vertex(self.vertex);
        vertex
            .emits()
            .get(vertex.anonymous_emit_start + index)
            .map(|&data| SharedData {
                core: self.core.clone(),
                index: data,
            })
    }

    fn done_impl(&mut self, code: i32) {
        let Some(context) = self.context.take() else {
            return;
        };
        if code != 0 {
            tracing::warn!(
                vertex = %self.core.vertex(self.vertex),
                code,
                "vertex finished with error"
            );
            context.finish(code);
        } else {
            self.core.vertex(self.vertex).flush_emits(&self.core);
        }
        context.depend_vertex_sub();
    }
}

impl Drop for GraphVertexClosure {
    fn drop(&mut self) {
        self.done_impl(0);
    }
}

impl std::fmt::Debug for GraphVertexClosure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphVertexClosure")
            .field("vertex", &self.core.vertex(self.vertex).name())
            .field("pending", &self.context.is_some())
            .finish()
    }
}

/// Owning handle to a data slot, detached from graph borrows so it can
/// travel into asynchronous completions.
pub struct SharedData {
    core: Arc<GraphCore>,
    index: usize,
}

impl std::ops::Deref for SharedData {
    type Target = GraphData;

    fn deref(&self) -> &GraphData {
        self.core.data(self.index)
    }
}

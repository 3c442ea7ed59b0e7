//! Data slots and the two-phase commit protocol.
//!
//! A [`GraphData`] is a named slot connecting vertices: producers publish
//! into it, successor dependencies read from it. The engine promises
//! processors that once a slot reports ready its value is stable until
//! `reset`, and it keeps that promise without locks: write ownership is won
//! by a single compare-and-swap on `acquired` (one committer per slot per
//! run), and readiness is the sealed state of the slot's closure word, whose
//! release/acquire pair orders the committer's writes before every
//! consumer's reads.
//!
//! Publication is two-phase: `emit` hands back a move-only [`Committer`]
//! that edits the pending value; committing happens at `release` (explicit
//! or on drop), which notifies a bound run closure and walks the successor
//! edges, feeding newly-runnable vertices into the current thread's drain
//! scope.
//!
//! A slot declared mutable downstream is special: after readiness the single
//! depending vertex may rewrite the value in place. Exclusivity of that
//! dependency is what makes it sound, enforced statically where possible and
//! via the `depend_state` claim word at run time otherwise.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::channel::Topic;
use crate::closure::ClosureContext;
use crate::dependency::GraphDependency;
use crate::error::GraphError;
use crate::graph::GraphCore;
use crate::runnable::RunnableScope;
use crate::value::{Primitive, TypeTag, Value};

// Closure-word states: idle, sealed (= ready), or an owned
// `Arc<ClosureContext>` pointer from `bind`.
const IDLE: usize = 0;
const SEALED: usize = usize::MAX;

const DEPEND_NONE: i32 = 0;
const DEPEND_IMMUTABLE: i32 = 1;
const DEPEND_MUTABLE: i32 = 2;

type ResetFn = Box<dyn Fn(&mut Value) + Send + Sync>;

/// A named slot: the unit of communication between vertices.
pub struct GraphData {
    name: String,
    index: usize,
    graph: Weak<GraphCore>,
    // Vertex index per emit edge targeting this slot.
    producers: Vec<usize>,
    // (vertex index, dependency slot) per edge that reads this slot, either
    // as target or as condition.
    successors: Vec<(usize, usize)>,
    declared: Mutex<Option<TypeTag>>,
    declare_error: Mutex<Option<GraphError>>,
    on_reset: Mutex<Option<ResetFn>>,

    acquired: AtomicBool,
    value: UnsafeCell<Value>,
    empty: AtomicBool,
    has_preset: AtomicBool,
    // Backward-reachability dedup. Intentionally a first-pass screen: the
    // closure word is what actually prevents double activation effects.
    active: AtomicBool,
    closure_word: AtomicUsize,
    depend_state: AtomicI32,
    producer_done_num: AtomicU32,
}

// SAFETY: the value cell is written only by the unique acquire-CAS winner
// (or by preset/reset under their documented exclusivity contracts) and read
// only behind an acquire load of the sealed closure word, which the winner
// release-stores after its last write.
unsafe impl Send for GraphData {}
unsafe impl Sync for GraphData {}

impl GraphData {
    pub(crate) fn new(
        name: String,
        index: usize,
        graph: Weak<GraphCore>,
        producers: Vec<usize>,
        successors: Vec<(usize, usize)>,
    ) -> Self {
        Self {
            name,
            index,
            graph,
            producers,
            successors,
            declared: Mutex::new(None),
            declare_error: Mutex::new(None),
            on_reset: Mutex::new(None),
            acquired: AtomicBool::new(false),
            value: UnsafeCell::new(Value::default()),
            empty: AtomicBool::new(true),
            has_preset: AtomicBool::new(false),
            active: AtomicBool::new(false),
            closure_word: AtomicUsize::new(IDLE),
            depend_state: AtomicI32::new(DEPEND_NONE),
            producer_done_num: AtomicU32::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Whether the value has been published for this run.
    pub fn ready(&self) -> bool {
        self.closure_word.load(Ordering::Acquire) == SEALED
    }

    /// Whether the slot holds no value. Meaningful before a run starts and
    /// after the slot is ready.
    pub fn empty(&self) -> bool {
        if self.empty.load(Ordering::Acquire) {
            return true;
        }
        if !self.ready() {
            return false;
        }
        // SAFETY: ready ⇒ sealed ⇒ the committer is gone; reads are stable
        // until reset.
        unsafe { (*self.value.get()).is_empty() }
    }

    /// The element type fixed by the first `declare_type` call, if any.
    pub fn declared_type(&self) -> Option<TypeTag> {
        *self.declared.lock()
    }

    /// Declare (or re-check) the slot's element type.
    ///
    /// The first call fixes the type; later calls must agree. On conflict
    /// the slot is marked broken — `None` is returned here and the graph's
    /// `build` fails.
    pub fn declare_type<T: Send + Sync + 'static>(&self) -> Option<OutputData<'_, T>> {
        let mut declared = self.declared.lock();
        match *declared {
            None => {
                *declared = Some(TypeTag::of::<T>());
                Some(OutputData::new(self))
            }
            Some(tag) if tag == TypeTag::of::<T>() => Some(OutputData::new(self)),
            Some(previous) => {
                tracing::warn!(
                    data = %self,
                    declared = std::any::type_name::<T>(),
                    previous = previous.name(),
                    "type declaration conflict"
                );
                *self.declare_error.lock() = Some(GraphError::TypeConflict {
                    data: self.name.clone(),
                    declared: std::any::type_name::<T>(),
                    previous: previous.name(),
                });
                None
            }
        }
    }

    /// Declare the slot as a streaming channel of `T`.
    pub fn declare_channel<T: Send + Sync + 'static>(&self) -> Option<OutputChannel<'_, T>> {
        let output = self.declare_type::<Topic<T>>()?;
        output.set_on_reset(|topic: &mut Topic<T>| topic.clear());
        Some(OutputChannel::new(self))
    }

    /// Whether some downstream dependency claimed mutable access this run.
    pub fn need_mutable(&self) -> bool {
        self.depend_state.load(Ordering::Relaxed) == DEPEND_MUTABLE
    }

    /// Start publishing into this slot. Exactly one committer per run wins
    /// write ownership; the losers get an invalid committer.
    pub fn emit<T: Send + Sync + 'static>(&self) -> Committer<'_, T> {
        Committer::new(self)
    }

    /// Typed emit handle (the declared-interface view of this slot).
    pub fn output<T: Send + Sync + 'static>(&self) -> OutputData<'_, T> {
        OutputData::new(self)
    }

    /// Channel emit handle.
    pub fn output_channel<T: Send + Sync + 'static>(&self) -> OutputChannel<'_, T> {
        OutputChannel::new(self)
    }

    /// Publish by forwarding a dependency's value, without copying.
    ///
    /// When downstream needs mutability the dependency must be mutable and
    /// its storage writable; otherwise the slot takes a const reference.
    /// Returns `false` when the dependency is unready, the slot is already
    /// committed, or mutability cannot be satisfied (this engine does not
    /// fall back to a copy).
    pub fn forward(&self, dependency: &GraphDependency) -> bool {
        if !dependency.ready() {
            return false;
        }
        let source = dependency.target_data();
        if self.need_mutable() {
            // SAFETY: source is ready, so reading its cell is stable.
            let writable = dependency.is_mutable() && unsafe { (*source.value.get()).supports_mut() };
            if !writable {
                tracing::warn!(
                    data = %self,
                    source = %source,
                    "forward needs mutable storage but the dependency cannot provide it"
                );
                return false;
            }
        }
        if !self.acquire() {
            return false;
        }
        // SAFETY: the acquire CAS grants exclusive write access; the source
        // slot outlives this one (same graph) and its storage address is
        // stable until reset.
        unsafe {
            let cell = &mut *self.value.get();
            if self.need_mutable() || dependency.is_mutable() {
                cell.bind_value_ref_mut(source.value.get());
            } else {
                cell.bind_value_ref(source.value.get() as *const Value);
            }
        }
        self.empty.store(false, Ordering::Release);
        self.release();
        true
    }

    /// Bind an externally-owned buffer as this slot's storage. The first
    /// committer of the next run edits the buffer in place.
    ///
    /// # Safety
    ///
    /// Must be called between runs (no concurrent access to the slot), and
    /// `value` must outlive every run that can observe it. The caller must
    /// not touch `value` while a run is in flight.
    pub unsafe fn preset<T: Send + Sync + 'static>(&self, value: &mut T) {
        (*self.value.get()).bind_mut_ref(value);
        self.has_preset.store(true, Ordering::Relaxed);
    }

    pub fn has_preset_value(&self) -> bool {
        self.has_preset.load(Ordering::Relaxed)
    }

    /// Read the published value. `None` until ready, on emptiness, or on
    /// type mismatch.
    pub fn value<T: 'static>(&self) -> Option<&T> {
        if !self.ready() || self.empty.load(Ordering::Acquire) {
            return None;
        }
        // SAFETY: ready ⇒ sealed; the value is stable until reset.
        unsafe { (*self.value.get()).get::<T>() }
    }

    /// Alias of [`value`](Self::value); publishers use `emit` for writes.
    pub fn cvalue<T: 'static>(&self) -> Option<&T> {
        self.value::<T>()
    }

    /// Numeric view of the published value; zero when unready or empty.
    pub fn as_primitive<P: Primitive>(&self) -> P {
        if !self.ready() || self.empty() {
            return P::default();
        }
        // SAFETY: as in `value`.
        unsafe { (*self.value.get()).as_primitive::<P>() }
    }

    pub(crate) fn producers(&self) -> &[usize] {
        &self.producers
    }

    pub(crate) fn error_code(&self) -> i32 {
        if self.declare_error.lock().is_some() {
            -1
        } else {
            0
        }
    }

    pub(crate) fn take_declare_error(&self) -> Option<GraphError> {
        self.declare_error.lock().take()
    }

    pub(crate) fn set_on_reset_typed<T, C>(&self, callback: C)
    where
        T: 'static,
        C: Fn(&mut T) + Send + Sync + 'static,
    {
        *self.on_reset.lock() = Some(Box::new(move |value: &mut Value| {
            if value.is_reference() {
                value.clear();
                return;
            }
            match value.get_mut::<T>() {
                Some(typed) => callback(typed),
                None => value.clear(),
            }
        }));
    }

    pub(crate) fn set_empty(&self, empty: bool) {
        self.empty.store(empty, Ordering::Release);
    }

    // Win write ownership for this run. First caller only.
    pub(crate) fn acquire(&self) -> bool {
        self.acquired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    // Publish with whatever (possibly empty) state the slot has.
    pub(crate) fn emit_empty(&self) {
        if self.acquire() {
            self.release();
        }
    }

    // Publish a const reference to a value that outlives the graph (builtin
    // const operator).
    pub(crate) fn emit_value_ref(&self, source: *const Value) -> bool {
        if !self.acquire() {
            return false;
        }
        // SAFETY: acquire grants exclusive write access; the caller
        // guarantees `source` outlives the graph.
        unsafe { (*self.value.get()).bind_value_ref(source) };
        self.empty.store(false, Ordering::Release);
        self.release();
        true
    }

    // SAFETY: callers must hold the commit exclusivity (committer), an
    // exclusive mutable-dependency claim, or the reset/preset exclusivity.
    pub(crate) unsafe fn value_cell(&self) -> *mut Value {
        self.value.get()
    }

    /// Seal the slot, notify a bound run closure, and advance successors.
    pub(crate) fn release(&self) {
        let mut current = self.closure_word.load(Ordering::Relaxed);
        loop {
            if current == SEALED {
                return;
            }
            match self.closure_word.compare_exchange_weak(
                current,
                SEALED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(now) => current = now,
            }
        }
        if current != IDLE {
            // SAFETY: a non-idle, non-sealed word is an owned pointer stored
            // by `bind`; sealing transferred ownership to us.
            let context = unsafe { Arc::from_raw(current as *const ClosureContext) };
            context.depend_data_sub();
        }

        let Some(core) = self.graph.upgrade() else {
            return;
        };
        let scope = RunnableScope::enter(&core);
        for &(vertex, slot) in &self.successors {
            core.vertex(vertex).dependency(slot).data_ready(&core, self.index);
        }
        drop(scope);
    }

    /// Register the run closure to be notified when this slot becomes
    /// ready. Returns `false` when the slot is already ready or bound.
    pub(crate) fn bind(&self, context: &Arc<ClosureContext>) -> bool {
        context.depend_data_add();
        context.add_waiting_data(self.graph.clone(), self.index);
        let raw = Arc::into_raw(context.clone()) as usize;
        match self
            .closure_word
            .compare_exchange(IDLE, raw, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(_) => {
                // SAFETY: the pointer we created above was not installed.
                drop(unsafe { Arc::from_raw(raw as *const ClosureContext) });
                context.depend_data_sub();
                false
            }
        }
    }

    // Dependency-exclusivity claims. Immutable claims stack; a mutable
    // claim requires being first; nothing may follow a mutable claim.
    pub(crate) fn acquire_immutable_depend(&self) -> bool {
        self.depend_state.swap(DEPEND_IMMUTABLE, Ordering::Relaxed) != DEPEND_MUTABLE
    }

    pub(crate) fn acquire_mutable_depend(&self) -> bool {
        self.depend_state.swap(DEPEND_MUTABLE, Ordering::Relaxed) == DEPEND_NONE
    }

    // First-pass activation screen; not a correctness gate.
    fn mark_active(&self) -> bool {
        self.active.swap(true, Ordering::Relaxed)
    }

    pub(crate) fn trigger(&self, activating: &mut Vec<usize>) {
        if !self.mark_active() && !self.ready() {
            activating.push(self.index);
        }
    }

    /// Activate this slot's producers. Part of backward reachability.
    pub(crate) fn activate(
        &self,
        core: &Arc<GraphCore>,
        activating: &mut Vec<usize>,
        closure: &Arc<ClosureContext>,
    ) -> Result<(), GraphError> {
        if self.producers.is_empty() {
            tracing::warn!(data = %self, "cannot activate data with no producer");
            return Err(GraphError::NoProducer(self.name.clone()));
        }
        for &producer in &self.producers {
            core.vertex(producer).activate(core, activating, closure)?;
        }
        Ok(())
    }

    /// Walk backward from this slot, activating everything it transitively
    /// needs. Newly-runnable vertices land in the thread's drain scope.
    pub(crate) fn recursive_activate(
        &self,
        core: &Arc<GraphCore>,
        closure: &Arc<ClosureContext>,
    ) -> Result<(), GraphError> {
        let mut activating = Vec::new();
        self.trigger(&mut activating);
        while let Some(index) = activating.pop() {
            core.data(index).activate(core, &mut activating, closure)?;
        }
        Ok(())
    }

    // Channel slots close once the last producer finishes publishing.
    pub(crate) fn check_last_producer(&self) -> bool {
        self.producers.is_empty()
            || self.producer_done_num.fetch_add(1, Ordering::AcqRel) as usize
                == self.producers.len() - 1
    }

    /// Mutable fan-out that is provably wrong without looking at run-time
    /// conditions: a mutable edge with no condition next to any other edge.
    pub(crate) fn check_safe_mutable(&self, core: &GraphCore) -> bool {
        if self.successors.len() <= 1 {
            return true;
        }
        for &(vertex, slot) in &self.successors {
            let dependency = core.vertex(vertex).dependency(slot);
            if dependency.is_mutable() && dependency.condition_data().is_none() {
                return false;
            }
        }
        // Conditions may still make the active set exclusive; the run-time
        // claim protocol has the final word.
        true
    }

    /// Clear per-run state, keeping the declared type and — through the
    /// per-slot reset callback — possibly the value storage.
    pub(crate) fn reset(&self) {
        self.acquired.store(false, Ordering::Relaxed);
        self.empty.store(true, Ordering::Relaxed);
        self.has_preset.store(false, Ordering::Relaxed);
        self.active.store(false, Ordering::Relaxed);
        self.depend_state.store(DEPEND_NONE, Ordering::Relaxed);
        self.producer_done_num.store(0, Ordering::Relaxed);
        let previous = self.closure_word.swap(IDLE, Ordering::AcqRel);
        if previous != IDLE && previous != SEALED {
            // SAFETY: an unreleased binding still owns its Arc pointer.
            drop(unsafe { Arc::from_raw(previous as *const ClosureContext) });
        }
        // SAFETY: reset holds the graph exclusively (no concurrent run).
        let value = unsafe { &mut *self.value.get() };
        match &*self.on_reset.lock() {
            Some(callback) => callback(value),
            None => value.clear(),
        }
    }
}

impl std::fmt::Display for GraphData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "data[{}]", self.name)
    }
}

impl std::fmt::Debug for GraphData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphData")
            .field("name", &self.name)
            .field("ready", &self.ready())
            .field("empty", &self.empty())
            .finish()
    }
}

/// Two-phase publish handle for one slot, one run.
///
/// Obtained from [`GraphData::emit`]; only the committer that won the
/// acquire race is valid. The pending value is edited through
/// [`get`](Self::get) / [`set`](Self::set) and committed by
/// [`release`](Self::release) or on drop. Move-only, so a processor can
/// carry it into an asynchronous completion.
pub struct Committer<'a, T: Send + Sync + 'static> {
    data: Option<&'a GraphData>,
    keep_reference: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<'a, T: Send + Sync + 'static> Committer<'a, T> {
    fn new(data: &'a GraphData) -> Self {
        let valid = data.acquire();
        Self {
            data: valid.then_some(data),
            keep_reference: data.has_preset_value(),
            _marker: PhantomData,
        }
    }

    /// Whether this committer won write ownership.
    pub fn valid(&self) -> bool {
        self.data.is_some()
    }

    /// Access the pending value, creating it when absent. With a preset
    /// buffer bound, edits go to that buffer in place; a type mismatch
    /// against the preset yields `None`.
    pub fn get(&mut self) -> Option<&mut T>
    where
        T: Default,
    {
        let data = self.data?;
        data.set_empty(false);
        // SAFETY: a valid committer holds the slot's write exclusivity.
        let value = unsafe { &mut *data.value_cell() };
        if self.keep_reference {
            value.get_mut::<T>()
        } else {
            Some(value.ensure_owned::<T>())
        }
    }

    /// Replace the pending value.
    pub fn set(&mut self, new_value: T) {
        let Some(data) = self.data else {
            return;
        };
        data.set_empty(false);
        // SAFETY: as in `get`.
        let value = unsafe { &mut *data.value_cell() };
        match value.get_mut::<T>() {
            Some(slot) => *slot = new_value,
            None => *value = Value::new(new_value),
        }
    }

    /// Publish a reference to caller-owned mutable storage instead of an
    /// owned value.
    ///
    /// # Safety
    ///
    /// `value` must outlive every run that can observe this slot, and the
    /// caller must not access it while such a run is in flight.
    pub unsafe fn bind_ref(&mut self, value: &mut T) {
        if let Some(data) = self.data {
            data.set_empty(false);
            (*data.value_cell()).bind_mut_ref(value);
            self.keep_reference = true;
        }
    }

    /// Publish a reference to caller-owned shared storage.
    ///
    /// # Safety
    ///
    /// `value` must outlive every run that can observe this slot.
    pub unsafe fn bind_cref(&mut self, value: &T) {
        if let Some(data) = self.data {
            data.set_empty(false);
            (*data.value_cell()).bind_const_ref(value);
            self.keep_reference = true;
        }
    }

    /// Publish the empty value. Underlying storage is kept for reuse.
    pub fn clear(&mut self) {
        if let Some(data) = self.data {
            data.set_empty(true);
        }
    }

    /// Commit now instead of at drop.
    pub fn release(mut self) {
        self.release_impl();
    }

    /// Abandon publication. The slot stays acquired and never becomes
    /// ready this run — downstream waiters will stall.
    pub fn cancel(mut self) {
        self.data = None;
    }

    fn release_impl(&mut self) {
        if let Some(data) = self.data.take() {
            data.release();
        }
    }
}

impl<T: Send + Sync + 'static> Drop for Committer<'_, T> {
    fn drop(&mut self) {
        self.release_impl();
    }
}

/// Typed emit handle bound to a slot.
pub struct OutputData<'a, T: Send + Sync + 'static> {
    data: &'a GraphData,
    _marker: PhantomData<fn() -> T>,
}

impl<'a, T: Send + Sync + 'static> OutputData<'a, T> {
    fn new(data: &'a GraphData) -> Self {
        Self {
            data,
            _marker: PhantomData,
        }
    }

    /// Start the two-phase publish.
    pub fn emit(&self) -> Committer<'a, T> {
        self.data.emit::<T>()
    }

    /// Emit-and-commit convenience for the common single-assignment case.
    pub fn assign(&self, value: T) {
        let mut committer = self.emit();
        if committer.valid() {
            committer.set(value);
        } else {
            tracing::warn!(data = %self.data, "assign lost the commit race");
        }
    }

    /// Override what `Graph::reset` does to this slot's value. The default
    /// destroys it; pass e.g. `String::clear` to retain capacity across
    /// runs. References are always dropped, never passed to `callback`.
    pub fn set_on_reset(&self, callback: impl Fn(&mut T) + Send + Sync + 'static)
    where
        T: 'static,
    {
        self.data.set_on_reset_typed::<T, _>(callback);
    }

    pub fn data(&self) -> &'a GraphData {
        self.data
    }
}

/// Producer handle for a channel slot. Dropping it closes this producer's
/// share of the stream; the topic itself closes when the last producer is
/// done.
pub struct ChannelPublisher<'a, T: Send + Sync + 'static> {
    topic: Option<&'a Topic<T>>,
    data: Option<&'a GraphData>,
}

impl<'a, T: Send + Sync + 'static> ChannelPublisher<'a, T> {
    pub fn valid(&self) -> bool {
        self.topic.is_some()
    }

    pub fn publish(&self, value: T) {
        match self.topic {
            Some(topic) => topic.publish(value),
            None => tracing::warn!("publish on an invalid channel publisher"),
        }
    }

    /// Reserve `num` contiguous elements and fill them via `fill(offset)`.
    pub fn publish_n(&self, num: usize, fill: impl FnMut(usize) -> T) {
        match self.topic {
            Some(topic) => topic.publish_n(num, fill),
            None => tracing::warn!("publish_n on an invalid channel publisher"),
        }
    }

    /// End this producer's publishing. The consumers observe close only
    /// after every producer of the slot has finished.
    pub fn close(&mut self) {
        if let Some(topic) = self.topic.take() {
            if let Some(data) = self.data.take() {
                if data.check_last_producer() {
                    topic.close();
                }
            }
        }
    }
}

impl<T: Send + Sync + 'static> Drop for ChannelPublisher<'_, T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Channel emit handle bound to a slot.
pub struct OutputChannel<'a, T: Send + Sync + 'static> {
    data: &'a GraphData,
    _marker: PhantomData<fn() -> T>,
}

impl<'a, T: Send + Sync + 'static> OutputChannel<'a, T> {
    fn new(data: &'a GraphData) -> Self {
        Self {
            data,
            _marker: PhantomData,
        }
    }

    /// Open the stream for publishing. The first producer commits the topic
    /// container (waking consumers so they can subscribe); later producers
    /// of an already-open slot join it.
    pub fn open(&self) -> ChannelPublisher<'a, T> {
        let mut committer = self.data.emit::<Topic<T>>();
        if committer.valid() {
            if let Some(topic) = committer.get() {
                let topic: *const Topic<T> = topic;
                committer.release();
                // SAFETY: slot storage is address-stable for the graph's
                // lifetime and only rewritten by reset, which cannot overlap
                // a run.
                return ChannelPublisher {
                    topic: Some(unsafe { &*topic }),
                    data: Some(self.data),
                };
            }
        } else if let Some(topic) = self.data.value::<Topic<T>>() {
            return ChannelPublisher {
                topic: Some(topic),
                data: Some(self.data),
            };
        }
        tracing::warn!(data = %self.data, "cannot open channel for publishing");
        ChannelPublisher {
            topic: None,
            data: None,
        }
    }

    pub fn data(&self) -> &'a GraphData {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak as StdWeak;

    fn standalone_data(name: &str) -> GraphData {
        GraphData::new(name.to_string(), 0, StdWeak::new(), Vec::new(), Vec::new())
    }

    #[test]
    fn test_single_committer_wins() {
        let data = standalone_data("slot");
        let first = data.emit::<i64>();
        let second = data.emit::<i64>();
        assert!(first.valid());
        assert!(!second.valid(), "only one committer per run");
        drop(second);
        assert!(!data.ready(), "losing committer must not publish");
        drop(first);
        assert!(data.ready());
    }

    #[test]
    fn test_commit_publishes_value() {
        let data = standalone_data("slot");
        assert!(!data.ready());
        assert!(data.empty());

        let mut committer = data.emit::<String>();
        committer.get().unwrap().push_str("payload");
        assert!(!data.ready(), "value invisible before release");
        committer.release();

        assert!(data.ready());
        assert!(!data.empty());
        assert_eq!(data.value::<String>().map(String::as_str), Some("payload"));
        assert!(data.value::<i64>().is_none(), "typed access checks the tag");
    }

    #[test]
    fn test_clear_publishes_empty() {
        let data = standalone_data("slot");
        let mut committer = data.emit::<String>();
        committer.get().unwrap().push_str("kept storage");
        committer.clear();
        drop(committer);

        assert!(data.ready());
        assert!(data.empty());
        assert!(data.value::<String>().is_none());
    }

    #[test]
    fn test_cancel_never_publishes() {
        let data = standalone_data("slot");
        let mut committer = data.emit::<i64>();
        *committer.get().unwrap() = 5;
        committer.cancel();
        assert!(!data.ready());
        assert!(!data.emit::<i64>().valid(), "slot stays acquired after cancel");
    }

    #[test]
    fn test_declare_type_checks_equality() {
        let data = standalone_data("slot");
        assert!(data.declare_type::<String>().is_some());
        assert!(data.declare_type::<String>().is_some(), "same type re-declares");
        assert!(data.declare_type::<i64>().is_none(), "conflict is rejected");
        assert_ne!(data.error_code(), 0);
    }

    #[test]
    fn test_as_primitive_converts() {
        let data = standalone_data("slot");
        let mut committer = data.emit::<i32>();
        *committer.get().unwrap() = 41;
        drop(committer);

        assert_eq!(data.as_primitive::<i64>(), 41);
        assert_eq!(data.as_primitive::<f64>(), 41.0);
        assert!(data.as_primitive::<bool>());
    }

    #[test]
    fn test_reset_clears_run_state() {
        let data = standalone_data("slot");
        let mut committer = data.emit::<i64>();
        *committer.get().unwrap() = 9;
        drop(committer);
        assert!(data.ready());

        data.reset();
        assert!(!data.ready());
        assert!(data.empty());
        assert!(data.emit::<i64>().valid(), "slot is writable again");
    }

    #[test]
    fn test_reset_callback_keeps_storage() {
        let data = standalone_data("slot");
        data.output::<String>().set_on_reset(|text| text.clear());

        let mut committer = data.emit::<String>();
        committer
            .get()
            .unwrap()
            .push_str("a value long enough to allocate");
        drop(committer);
        let buffer = data.value::<String>().unwrap().as_ptr();

        data.reset();
        let mut committer = data.emit::<String>();
        let text = committer.get().unwrap();
        assert!(text.is_empty());
        text.push_str("short");
        drop(committer);

        assert_eq!(data.value::<String>().unwrap().as_ptr(), buffer);
        assert_eq!(data.value::<String>().map(String::as_str), Some("short"));
    }

    #[test]
    fn test_preset_buffer_edited_in_place() {
        let mut response = String::from("prefilled-");
        let buffer = response.as_ptr();
        {
            let data = standalone_data("slot");
            // SAFETY: `response` outlives the slot's use in this test and is
            // not touched while committed.
            unsafe { data.preset(&mut response) };
            assert!(data.has_preset_value());

            let mut committer = data.emit::<String>();
            committer.get().unwrap().push_str("body");
            drop(committer);

            let seen = data.value::<String>().unwrap();
            assert_eq!(seen.as_ptr(), buffer, "no copy of the preset buffer");
        }
        assert_eq!(response, "prefilled-body");
    }

    #[test]
    fn test_preset_type_mismatch_yields_none() {
        let mut response = String::new();
        let data = standalone_data("slot");
        // SAFETY: as above.
        unsafe { data.preset(&mut response) };
        let mut committer = data.emit::<i64>();
        assert!(committer.get().is_none(), "preset fixes the storage type");
        drop(committer);
    }

    #[test]
    fn test_assign_convenience() {
        let data = standalone_data("slot");
        data.output::<i64>().assign(77);
        assert!(data.ready());
        assert_eq!(data.value::<i64>().copied(), Some(77));
    }
}

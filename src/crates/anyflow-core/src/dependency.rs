//! Conditional edges between vertices and data slots.
//!
//! A [`GraphDependency`] joins a consumer vertex to a target slot, optionally
//! gated by a condition slot and a polarity (`on` = true, `unless` = false).
//! At activation the edge must both cause activation of the target and/or
//! condition producers and eventually mark itself ready so the consumer can
//! be dispatched.
//!
//! One signed atomic `waiting_num` encodes both sides. Activation adds +1
//! (no condition) or +2; every data-ready callback subtracts 1; a condition
//! that resolves unsatisfied subtracts one more unless the counter already
//! rests at zero. The terminal values are 0 ("activated and satisfied") and
//! −1 ("condition failed before activation"), each reached exactly once per
//! run across all decrement paths — that single terminal transition is what
//! decrements the consumer vertex's own waiting counter.
//!
//! Just before triggering target activation the edge claims its mutability
//! class on the target (`depend_state` CAS). A failed claim is a run-fatal
//! exclusivity violation.

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::channel::{ConsumeRange, Consumer, MutableConsumeRange, MutableConsumer, Topic};
use crate::data::GraphData;
use crate::error::GraphError;
use crate::graph::GraphCore;
use crate::runnable::RunnableScope;
use crate::value::Primitive;

/// How hard a vertex depends on an edge's value being present.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Essential {
    /// The vertex runs regardless; it sees `None` for a missing value.
    Optional,
    /// An empty or unestablished edge short-circuits the vertex: its emits
    /// are published empty without running the processor.
    SkipOnEmpty,
    /// An empty or unestablished edge fails the whole run.
    FailOnEmpty,
}

const ESSENTIAL_OPTIONAL: u8 = 0;
const ESSENTIAL_SKIP: u8 = 1;
const ESSENTIAL_FAIL: u8 = 2;

/// A directed edge from a consumer vertex to a target data slot.
pub struct GraphDependency {
    // Owning vertex index, for scheduling and closure access.
    source: usize,
    target: NonNull<GraphData>,
    condition: Option<NonNull<GraphData>>,
    establish_value: bool,

    mutable: AtomicBool,
    essential: AtomicU8,

    waiting_num: AtomicI64,
    established: AtomicBool,
    ready: AtomicBool,
}

// SAFETY: the target/condition pointers point into the data vector of the
// GraphCore that owns this dependency's vertex; the pointees outlive every
// access. All run-time state is atomic.
unsafe impl Send for GraphDependency {}
unsafe impl Sync for GraphDependency {}

impl GraphDependency {
    pub(crate) fn new(
        source: usize,
        target: NonNull<GraphData>,
        condition: Option<NonNull<GraphData>>,
        establish_value: bool,
    ) -> Self {
        Self {
            source,
            target,
            condition,
            establish_value,
            mutable: AtomicBool::new(false),
            essential: AtomicU8::new(ESSENTIAL_OPTIONAL),
            waiting_num: AtomicI64::new(0),
            established: AtomicBool::new(false),
            ready: AtomicBool::new(false),
        }
    }

    /// Declare that the consumer rewrites the target value in place.
    ///
    /// A mutable edge must be the only active dependency on its target;
    /// `build` rejects statically-unsafe fan-out and the run-time claim
    /// protocol rejects the rest. Persists across `reset`.
    pub fn declare_mutable(&self) {
        self.mutable.store(true, Ordering::Relaxed);
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable.load(Ordering::Relaxed)
    }

    /// Declare the expected element type of the target slot.
    pub fn declare_type<T: Send + Sync + 'static>(&self) {
        let _ = self.target_data().declare_type::<T>();
    }

    /// Declare the target slot as a channel of `T`.
    pub fn declare_channel<T: Send + Sync + 'static>(&self) {
        let _ = self.target_data().declare_channel::<T>();
    }

    /// Declare how the consumer reacts to a missing value. Persists across
    /// `reset`.
    pub fn declare_essential(&self, level: Essential) {
        let encoded = match level {
            Essential::Optional => ESSENTIAL_OPTIONAL,
            Essential::SkipOnEmpty => ESSENTIAL_SKIP,
            Essential::FailOnEmpty => ESSENTIAL_FAIL,
        };
        self.essential.store(encoded, Ordering::Relaxed);
    }

    pub fn essential(&self) -> Essential {
        match self.essential.load(Ordering::Relaxed) {
            ESSENTIAL_SKIP => Essential::SkipOnEmpty,
            ESSENTIAL_FAIL => Essential::FailOnEmpty,
            _ => Essential::Optional,
        }
    }

    /// Whether the edge is satisfied and its value may be read.
    pub fn ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Whether the condition held (always true without a condition).
    pub fn established(&self) -> bool {
        self.established.load(Ordering::Acquire)
    }

    /// Whether the target published no value.
    pub fn empty(&self) -> bool {
        self.target_data().empty()
    }

    /// Read the target value. `None` until ready or when empty.
    pub fn value<T: 'static>(&self) -> Option<&T> {
        if !self.ready() {
            return None;
        }
        self.target_data().value::<T>()
    }

    /// Numeric view of the target value; zero when unready or empty.
    pub fn as_primitive<P: Primitive>(&self) -> P {
        if !self.ready() {
            return P::default();
        }
        self.target_data().as_primitive::<P>()
    }

    /// Rewrite the target value in place.
    ///
    /// # Safety
    ///
    /// The edge must have been declared mutable (enforced: returns `None`
    /// otherwise), and the caller must be the consuming vertex's processor
    /// holding at most one live reference — the exclusive mutable claim
    /// makes this the only edge that can reach the value, but the API
    /// cannot stop one processor from calling this twice and aliasing.
    pub unsafe fn mutable_value<T: 'static>(&self) -> Option<&mut T> {
        if !self.ready() || !self.is_mutable() {
            return None;
        }
        let data = self.target_data();
        if data.empty() {
            return None;
        }
        (*data.value_cell()).get_mut::<T>()
    }

    /// Read-only streaming view of a channel target.
    pub fn channel<T: Send + Sync + 'static>(&self) -> InputChannel<'_, T> {
        InputChannel {
            dependency: self,
            _marker: PhantomData,
        }
    }

    /// Exclusive streaming view of a channel target; requires a mutable
    /// edge.
    pub fn mutable_channel<T: Send + Sync + 'static>(&self) -> MutableInputChannel<'_, T> {
        MutableInputChannel {
            dependency: self,
            _marker: PhantomData,
        }
    }

    pub(crate) fn target_data(&self) -> &GraphData {
        // SAFETY: see the Send/Sync justification above.
        unsafe { self.target.as_ref() }
    }

    pub(crate) fn condition_data(&self) -> Option<&GraphData> {
        // SAFETY: as target_data.
        self.condition.map(|ptr| unsafe { &*ptr.as_ptr() })
    }

    pub(crate) fn reset(&self) {
        self.waiting_num.store(0, Ordering::Relaxed);
        self.established.store(false, Ordering::Relaxed);
        self.ready.store(false, Ordering::Relaxed);
    }

    // Evaluate the condition once it is readable. Only ever flips
    // `established` to true; reset clears it.
    fn check_established(&self) -> bool {
        if self.established.load(Ordering::Acquire) {
            return true;
        }
        let established = match self.condition_data() {
            None => true,
            Some(condition) => condition.as_primitive::<bool>() == self.establish_value,
        };
        if established {
            self.established.store(true, Ordering::Release);
        }
        established
    }

    fn claim_target(&self) -> Result<(), GraphError> {
        let target = self.target_data();
        let claimed = if self.is_mutable() {
            target.acquire_mutable_depend()
        } else {
            target.acquire_immutable_depend()
        };
        if claimed {
            Ok(())
        } else {
            tracing::warn!(
                target = %target,
                "dependency cannot be exclusive, another edge already claimed the slot mutably"
            );
            Err(GraphError::MutableConflict(target.name().to_string()))
        }
    }

    /// Activate this edge. Returns 1 when it was already satisfied at
    /// activation time (the consumer's counter can be advanced in bulk),
    /// 0 when it must wait for data-ready callbacks.
    pub(crate) fn activate(&self, activating: &mut Vec<usize>) -> Result<i64, GraphError> {
        let add = if self.condition.is_none() { 1 } else { 2 };
        let waiting = self.waiting_num.fetch_add(add, Ordering::AcqRel) + add;
        // Terminal domain after activation: [-1, 0, 1, 2]. Negative and zero
        // mean the data-ready side already ran to completion.
        match waiting {
            -1 => {
                // Condition resolved unsatisfied before activation.
                Ok(1)
            }
            0 => {
                // Both target and condition resolved before activation.
                if self.check_established() {
                    self.claim_target()?;
                    self.ready
                        .store(self.target_data().ready(), Ordering::Release);
                }
                Ok(1)
            }
            1 => {
                match self.condition_data() {
                    None => {
                        self.established.store(true, Ordering::Release);
                        self.claim_target()?;
                        self.target_data().trigger(activating);
                    }
                    Some(condition) if !condition.ready() => {
                        condition.trigger(activating);
                    }
                    Some(_) => {
                        if self.check_established() {
                            self.claim_target()?;
                            self.target_data().trigger(activating);
                        }
                        // Unsatisfied here means the extra −1 is still in
                        // flight; the second decrement path finishes the job.
                    }
                }
                Ok(0)
            }
            2 => {
                if let Some(condition) = self.condition_data() {
                    condition.trigger(activating);
                }
                Ok(0)
            }
            _ => Ok(0),
        }
    }

    /// Data-ready callback from the target or condition slot. Exactly one
    /// invocation per run reaches the terminal state and advances the
    /// consumer vertex.
    pub(crate) fn data_ready(&self, core: &Arc<GraphCore>, from: usize) {
        let mut waiting = self.waiting_num.fetch_sub(1, Ordering::AcqRel) - 1;
        let from_condition = self
            .condition_data()
            .map(|condition| condition.index() == from)
            .unwrap_or(false);
        if from_condition {
            if self.check_established() {
                // Established with the target still pending: activate the
                // target's producers now (idempotent).
                if waiting == 1 {
                    if self.claim_target().is_err() {
                        self.fail_run(core);
                        return;
                    }
                    let Some(closure) = core.vertex(self.source).closure() else {
                        return;
                    };
                    if let Err(error) = self.target_data().recursive_activate(core, &closure) {
                        tracing::warn!(
                            target = %self.target_data(),
                            %error,
                            "activation from condition failed"
                        );
                        closure.finish(error.code());
                        return;
                    }
                }
            } else if waiting != 0 {
                // Condition failed: short-circuit the target wait. The
                // target may still complete through another path, hence the
                // guard against punching through the terminal zero.
                waiting = self.waiting_num.fetch_sub(1, Ordering::AcqRel) - 1;
            }
        }
        // The ready terminal [0] and the activation terminals [-1, 0]
        // together account for every path exactly once.
        if waiting == 0 {
            let ready = if from == self.target_data().index() {
                self.check_established()
            } else {
                self.established() && self.target_data().ready()
            };
            self.ready.store(ready, Ordering::Release);
            if core.vertex(self.source).dependency_satisfied() {
                RunnableScope::schedule(core, self.source);
            }
        }
    }

    fn fail_run(&self, core: &Arc<GraphCore>) {
        if let Some(closure) = core.vertex(self.source).closure() {
            closure.finish(-1);
        }
    }
}

impl std::fmt::Debug for GraphDependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphDependency")
            .field("target", &self.target_data().name())
            .field(
                "condition",
                &self.condition_data().map(|condition| condition.name()),
            )
            .field("mutable", &self.is_mutable())
            .field("ready", &self.ready())
            .finish()
    }
}

/// Read-only consumer view of a channel dependency.
pub struct InputChannel<'a, T: Send + Sync + 'static> {
    dependency: &'a GraphDependency,
    _marker: PhantomData<fn() -> T>,
}

impl<'a, T: Send + Sync + 'static> InputChannel<'a, T> {
    /// Subscribe to the stream. Invalid (immediately-drained) when the
    /// dependency is unready or not a channel of `T`.
    pub fn subscribe(&self) -> ChannelConsumer<'a, T> {
        ChannelConsumer {
            inner: self
                .dependency
                .value::<Topic<T>>()
                .map(|topic| topic.subscribe()),
        }
    }
}

/// Streaming consumer handle; an invalid handle behaves as a closed, empty
/// stream.
pub struct ChannelConsumer<'a, T: Send + Sync + 'static> {
    inner: Option<Consumer<'a, T>>,
}

impl<'a, T: Send + Sync + 'static> ChannelConsumer<'a, T> {
    pub fn valid(&self) -> bool {
        self.inner.is_some()
    }

    pub fn consume(&mut self) -> Option<&'a T> {
        self.inner.as_mut()?.consume()
    }

    pub fn consume_n(&mut self, num: usize) -> ConsumeRange<'a, T> {
        match self.inner.as_mut() {
            Some(consumer) => consumer.consume_n(num),
            None => ConsumeRange::invalid(),
        }
    }
}

/// Exclusive consumer view of a channel dependency. Requires the edge to be
/// declared mutable, which makes it the only edge on the slot.
pub struct MutableInputChannel<'a, T: Send + Sync + 'static> {
    dependency: &'a GraphDependency,
    _marker: PhantomData<fn() -> T>,
}

impl<'a, T: Send + Sync + 'static> MutableInputChannel<'a, T> {
    /// Subscribe exclusively. Invalid when the dependency is unready, not
    /// mutable, or not a channel of `T`.
    pub fn subscribe(&self) -> MutableChannelConsumer<'a, T> {
        if !self.dependency.is_mutable() {
            return MutableChannelConsumer { inner: None };
        }
        let topic = self.dependency.value::<Topic<T>>();
        MutableChannelConsumer {
            // SAFETY: the exclusive mutable-dependency claim on the slot
            // means no other consumer or producer can reach this topic.
            inner: topic.map(|topic| unsafe { topic.subscribe_mut_shared() }),
        }
    }
}

/// Exclusive streaming consumer handle.
pub struct MutableChannelConsumer<'a, T: Send + Sync + 'static> {
    inner: Option<MutableConsumer<'a, T>>,
}

impl<'a, T: Send + Sync + 'static> MutableChannelConsumer<'a, T> {
    pub fn valid(&self) -> bool {
        self.inner.is_some()
    }

    pub fn consume(&mut self) -> Option<&'a mut T> {
        self.inner.as_mut()?.consume()
    }

    pub fn consume_n(&mut self, num: usize) -> MutableConsumeRange<'a, T> {
        match self.inner.as_mut() {
            Some(consumer) => consumer.consume_n(num),
            None => MutableConsumeRange::invalid(),
        }
    }
}

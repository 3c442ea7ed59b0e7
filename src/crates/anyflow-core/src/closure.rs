//! Per-run completion tracking.
//!
//! Every [`Graph::run`](crate::graph::Graph::run) creates one
//! [`ClosureContext`] shared by the whole run, and hands the caller a
//! [`Closure`] over it. Two atomic counters guard two distinct lifecycle
//! points:
//!
//! - `waiting_data_num` counts requested target slots that are not yet
//!   ready. Reaching zero with no error finishes the run with code 0.
//! - `waiting_vertex_num` counts live [`GraphVertexClosure`] handles.
//!   Reaching zero means no more work can possibly be produced; if that
//!   happens before the data counter, the run stalled and is finished with
//!   −1 after an audit of the unready slots.
//!
//! Both counters are pre-armed at 1 so that neither can terminate the run
//! while activation is still wiring things up; [`ClosureContext::fire`]
//! removes the arming increments once activation completes.
//!
//! Callback installation and completion race by design. The callback slot is
//! a small state machine `{empty, armed, sealed}`: `on_finish` arms it,
//! `finish` (or either counter hitting zero) seals it, and the CAS winner is
//! the single side that dispatches the callback. The sealed state doubles as
//! the error-code latch — the first finisher's code wins.
//!
//! [`GraphVertexClosure`]: crate::vertex::GraphVertexClosure

use std::collections::HashSet;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};

use crate::executor::{CallbackTask, GraphExecutor};
use crate::graph::GraphCore;

/// Callback delivered when a run reaches its terminal state.
pub type ClosureCallback = Box<dyn FnOnce(Closure) + Send + 'static>;

const CALLBACK_EMPTY: u8 = 0;
const CALLBACK_ARMED: u8 = 1;
const CALLBACK_SEALED: u8 = 2;

// One-shot event: set once, waited on many times.
pub(crate) struct Event {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    fn new() -> Self {
        Self {
            flag: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn notify(&self) {
        let mut flag = self.flag.lock();
        *flag = true;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut flag = self.flag.lock();
        while !*flag {
            self.cond.wait(&mut flag);
        }
    }
}

/// Shared per-run coordinator. Reached through [`Closure`] by user code and
/// through the runtime objects while the run is in flight.
pub struct ClosureContext {
    // Back-reference to the owning Arc, for handing equivalent `Closure`
    // handles to callbacks. Always upgradable while any method runs.
    self_ref: Weak<ClosureContext>,
    executor: Arc<dyn GraphExecutor>,
    waiting_vertex_num: AtomicI64,
    waiting_data_num: AtomicI64,
    callback_state: AtomicU8,
    callback: Mutex<Option<ClosureCallback>>,
    error_code: AtomicI32,
    finished: Event,
    flushed: Event,
    // Callback whose executor dispatch failed; retried at flush.
    flush_callback: Mutex<Option<ClosureCallback>>,
    // Requested targets, kept for the stall audit.
    waiting_data: Mutex<Vec<(Weak<GraphCore>, usize)>>,
    all_data_num: AtomicUsize,
}

impl ClosureContext {
    pub(crate) fn new(executor: Arc<dyn GraphExecutor>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            executor,
            waiting_vertex_num: AtomicI64::new(1),
            waiting_data_num: AtomicI64::new(1),
            callback_state: AtomicU8::new(CALLBACK_EMPTY),
            callback: Mutex::new(None),
            error_code: AtomicI32::new(0),
            finished: Event::new(),
            flushed: Event::new(),
            flush_callback: Mutex::new(None),
            waiting_data: Mutex::new(Vec::new()),
            all_data_num: AtomicUsize::new(0),
        })
    }

    /// Whether the run has reached its terminal state.
    pub fn finished(&self) -> bool {
        self.callback_state.load(Ordering::Acquire) == CALLBACK_SEALED
    }

    /// Block until the terminal state and return the latched error code.
    pub fn get(&self) -> i32 {
        self.finished.wait();
        self.error_code.load(Ordering::Acquire)
    }

    /// Block until every vertex closure has been dropped. After `wait`
    /// returns, no processor is still running on behalf of this run.
    pub fn wait(&self) {
        self.flushed.wait();
    }

    /// Latched error code; meaningful once [`finished`](Self::finished).
    pub fn error_code(&self) -> i32 {
        self.error_code.load(Ordering::Acquire)
    }

    /// Enter the terminal state with `code`. The first caller wins; later
    /// codes are dropped and logged.
    pub(crate) fn finish(&self, code: i32) {
        match self.mark_finished(code) {
            Some(Some(callback)) => self.dispatch(callback),
            Some(None) => {}
            None => {
                if code != 0 {
                    tracing::warn!(code, "late error dropped, run already finished");
                }
            }
        }
    }

    /// Remove the arming increments once activation is complete.
    pub(crate) fn fire(&self) {
        self.depend_data_sub();
        self.depend_vertex_sub();
    }

    /// Install a completion callback.
    ///
    /// If the run already finished the callback runs in place on the calling
    /// thread; otherwise it is dispatched through the executor at the
    /// terminal transition.
    pub(crate) fn on_finish(&self, callback: ClosureCallback) {
        // Publish the callback before arming so a concurrent sealer that
        // observes ARMED always finds it in the slot.
        *self.callback.lock() = Some(callback);
        if self
            .callback_state
            .compare_exchange(
                CALLBACK_EMPTY,
                CALLBACK_ARMED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            // Already sealed; run in place once the code is latched.
            if let Some(callback) = self.callback.lock().take() {
                self.finished.wait();
                self.run_now(callback);
            }
        }
    }

    pub(crate) fn depend_data_add(&self) {
        self.waiting_data_num.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn depend_data_sub(&self) {
        let waiting = self.waiting_data_num.fetch_sub(1, Ordering::AcqRel) - 1;
        if waiting == 0 {
            if let Some(callback) = self.mark_finished(0) {
                if let Some(callback) = callback {
                    self.dispatch(callback);
                }
            }
        }
    }

    pub(crate) fn depend_vertex_add(&self) {
        self.waiting_vertex_num.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn depend_vertex_sub(&self) {
        let waiting = self.waiting_vertex_num.fetch_sub(1, Ordering::AcqRel) - 1;
        if waiting != 0 {
            return;
        }
        // No more work can appear. If the data counter has not reached zero
        // yet, the run stalled: some requested output can never become ready.
        if let Some(callback) = self.mark_finished(-1) {
            self.log_unfinished_data();
            if let Some(callback) = callback {
                self.dispatch(callback);
            }
        }
        let pending = self.flush_callback.lock().take();
        self.flushed.notify();
        if let Some(callback) = pending {
            self.run_now(callback);
        }
    }

    pub(crate) fn add_waiting_data(&self, graph: Weak<GraphCore>, index: usize) {
        self.waiting_data.lock().push((graph, index));
    }

    pub(crate) fn set_all_data_num(&self, num: usize) {
        self.all_data_num.store(num, Ordering::Relaxed);
    }

    // Seal the callback slot. Returns None when already sealed, otherwise
    // the armed callback (if any) to dispatch.
    fn mark_finished(&self, code: i32) -> Option<Option<ClosureCallback>> {
        let mut state = self.callback_state.load(Ordering::Relaxed);
        loop {
            if state == CALLBACK_SEALED {
                return None;
            }
            match self.callback_state.compare_exchange_weak(
                state,
                CALLBACK_SEALED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(previous) => {
                    self.error_code.store(code, Ordering::Release);
                    let callback = if previous == CALLBACK_ARMED {
                        self.callback.lock().take()
                    } else {
                        None
                    };
                    self.finished.notify();
                    return Some(callback);
                }
                Err(current) => state = current,
            }
        }
    }

    fn dispatch(&self, callback: ClosureCallback) {
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        let task = CallbackTask::new(this, callback);
        if let Err(task) = self.executor.run_callback(task) {
            tracing::warn!("callback dispatch rejected by executor, delaying to flush");
            *self.flush_callback.lock() = Some(task.into_callback());
        }
    }

    fn run_now(&self, callback: ClosureCallback) {
        if let Some(this) = self.self_ref.upgrade() {
            callback(Closure::from_context(this));
        }
    }

    // Walk upstream from the unready requested slots. A slot whose
    // producers' dependencies are all ready but which is itself unready
    // points at a processor bug: an emit was omitted or abandoned.
    fn log_unfinished_data(&self) {
        let waiting = self.waiting_data.lock();
        let mut pending: Vec<(Arc<GraphCore>, usize)> = waiting
            .iter()
            .filter_map(|(graph, index)| graph.upgrade().map(|core| (core, *index)))
            .filter(|(core, index)| !core.data(*index).ready())
            .collect();
        drop(waiting);

        let mut checked: HashSet<(*const GraphCore, usize)> = HashSet::new();
        while let Some((core, index)) = pending.pop() {
            let data = core.data(index);
            if data.ready() {
                continue;
            }
            for &producer in data.producers() {
                let vertex = core.vertex(producer);
                let mut dependencies_ready = true;
                for dependency in vertex.dependencies() {
                    if let Some(condition) = dependency.condition_data() {
                        if !condition.ready() {
                            dependencies_ready = false;
                            let key = (Arc::as_ptr(&core), condition.index());
                            if checked.insert(key) {
                                pending.push((core.clone(), condition.index()));
                            }
                            continue;
                        }
                    }
                    let target = dependency.target_data();
                    if !target.ready() {
                        dependencies_ready = false;
                        let key = (Arc::as_ptr(&core), target.index());
                        if checked.insert(key) {
                            pending.push((core.clone(), target.index()));
                        }
                    }
                }
                if dependencies_ready {
                    tracing::warn!(
                        data = data.name(),
                        vertex = vertex.name(),
                        "all vertex finish but data not ready"
                    );
                }
            }
        }
    }
}

impl std::fmt::Debug for ClosureContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClosureContext")
            .field("finished", &self.finished())
            .field(
                "waiting_vertex_num",
                &self.waiting_vertex_num.load(Ordering::Relaxed),
            )
            .field(
                "waiting_data_num",
                &self.waiting_data_num.load(Ordering::Relaxed),
            )
            .field("all_data_num", &self.all_data_num.load(Ordering::Relaxed))
            .finish()
    }
}

/// Handle to one run of a graph.
///
/// Obtained from [`Graph::run`](crate::graph::Graph::run). Dropping the
/// closure blocks until the run is flushed — no processor thread still
/// touching the graph — so `reset` is always safe afterwards.
pub struct Closure {
    context: Option<Arc<ClosureContext>>,
}

impl Closure {
    pub(crate) fn create(executor: Arc<dyn GraphExecutor>) -> Self {
        Self {
            context: Some(ClosureContext::new(executor)),
        }
    }

    pub(crate) fn from_context(context: Arc<ClosureContext>) -> Self {
        Self {
            context: Some(context),
        }
    }

    pub(crate) fn context(&self) -> &Arc<ClosureContext> {
        self.context
            .as_ref()
            .expect("closure context only vacated by on_finish")
    }

    /// Whether the run has reached its terminal state.
    pub fn finished(&self) -> bool {
        self.context().finished()
    }

    /// Block until the terminal state and return the latched error code
    /// (0 on success).
    pub fn get(&self) -> i32 {
        self.context().get()
    }

    /// Block until no processor is still running on behalf of this run.
    pub fn wait(&self) {
        self.context().wait()
    }

    /// Latched error code; meaningful once [`finished`](Self::finished).
    pub fn error_code(&self) -> i32 {
        self.context().error_code()
    }

    /// Install a completion callback and give up this handle.
    ///
    /// The callback receives an equivalent `Closure` for error inspection
    /// and further synchronization. If the run already finished, the
    /// callback runs in place on the calling thread.
    pub fn on_finish(mut self, callback: impl FnOnce(Closure) + Send + 'static) {
        let context = self
            .context
            .take()
            .expect("closure context only vacated by on_finish");
        context.on_finish(Box::new(callback));
    }
}

impl Drop for Closure {
    fn drop(&mut self) {
        if let Some(context) = self.context.take() {
            context.wait();
        }
    }
}

impl std::fmt::Debug for Closure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.context {
            Some(context) => context.fmt(f),
            None => f.write_str("Closure(detached)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::InplaceGraphExecutor;
    use std::sync::atomic::AtomicUsize;

    fn new_context() -> Arc<ClosureContext> {
        ClosureContext::new(InplaceGraphExecutor::global())
    }

    #[test]
    fn test_fire_with_no_work_finishes_clean() {
        let context = new_context();
        assert!(!context.finished());
        context.fire();
        assert!(context.finished());
        assert_eq!(context.get(), 0);
        context.wait();
    }

    #[test]
    fn test_first_finish_code_wins() {
        let context = new_context();
        context.finish(7);
        context.finish(13);
        context.fire();
        assert_eq!(context.get(), 7);
    }

    #[test]
    fn test_stall_when_data_never_ready() {
        let context = new_context();
        // One pending data that never becomes ready, no pending vertices.
        context.depend_data_add();
        context.fire();
        assert!(context.finished(), "vertex counter reached zero first");
        assert_eq!(context.get(), -1);
    }

    #[test]
    fn test_finished_transition_is_monotonic() {
        let context = new_context();
        context.depend_data_add();
        context.depend_vertex_add();
        context.fire();
        assert!(!context.finished());

        context.depend_data_sub();
        assert!(context.finished());
        assert_eq!(context.error_code(), 0);

        context.depend_vertex_sub();
        assert!(context.finished());
        assert_eq!(context.error_code(), 0, "stall path lost the race");
        context.wait();
    }

    #[test]
    fn test_on_finish_after_completion_runs_inline() {
        let context = new_context();
        context.fire();

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        Closure::from_context(context).on_finish(move |closure| {
            assert_eq!(closure.get(), 0);
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_on_finish_before_completion_fires_at_finish() {
        let context = new_context();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        Closure::from_context(context.clone()).on_finish(move |closure| {
            assert_eq!(closure.error_code(), 3);
            seen.fetch_add(1, Ordering::SeqCst);
            // The closure handed to the callback waits for flush on drop,
            // which `fire` on the main thread provides.
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let finisher = {
            let context = context.clone();
            std::thread::spawn(move || context.finish(3))
        };
        while !context.finished() {
            std::thread::yield_now();
        }
        context.fire();
        finisher.join().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_blocks_until_vertex_flush() {
        let context = new_context();
        context.depend_vertex_add();
        context.fire();

        let worker_context = context.clone();
        let worker = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            worker_context.depend_vertex_sub();
        });
        context.wait();
        worker.join().unwrap();
        assert!(context.finished());
    }
}

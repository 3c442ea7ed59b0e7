//! Iterative draining of runnable vertices.
//!
//! Publishing a value can make downstream vertices runnable, and trivial
//! vertices run inline on the publishing thread — which publishes again, and
//! so on. Done naively that recursion is one stack frame per chained vertex.
//! Instead, every thread keeps a stack of *drain scopes*: the outermost
//! `release` (or `Graph::run`) on a thread opens a scope for its graph,
//! newly-runnable vertices are pushed into the innermost matching scope, and
//! the opener drains the scope iteratively after its own work completes. A
//! chain of any length therefore runs in constant stack depth.
//!
//! Scopes are keyed by graph identity so that a processor which runs a
//! *different* graph inline gets its own nested scope, drained before
//! control returns to the outer graph.

use std::cell::RefCell;
use std::sync::Arc;

use crate::graph::GraphCore;

struct ScopeFrame {
    graph: *const GraphCore,
    pending: Vec<usize>,
}

thread_local! {
    static SCOPES: RefCell<Vec<ScopeFrame>> = const { RefCell::new(Vec::new()) };
}

/// RAII drain scope. The instance that actually opened a frame drains every
/// pending vertex when dropped; nested instances for the same graph are
/// no-ops.
pub(crate) struct RunnableScope<'a> {
    core: &'a Arc<GraphCore>,
    owns: bool,
}

impl<'a> RunnableScope<'a> {
    pub(crate) fn enter(core: &'a Arc<GraphCore>) -> Self {
        let graph = Arc::as_ptr(core);
        let owns = SCOPES.with(|scopes| {
            let mut scopes = scopes.borrow_mut();
            match scopes.last() {
                Some(frame) if frame.graph == graph => false,
                _ => {
                    scopes.push(ScopeFrame {
                        graph,
                        pending: Vec::new(),
                    });
                    true
                }
            }
        });
        Self { core, owns }
    }

    /// Queue a vertex for invocation in the innermost scope of its graph.
    pub(crate) fn schedule(core: &Arc<GraphCore>, vertex: usize) {
        let graph = Arc::as_ptr(core);
        let queued = SCOPES.with(|scopes| {
            let mut scopes = scopes.borrow_mut();
            match scopes.last_mut() {
                Some(frame) if frame.graph == graph => {
                    frame.pending.push(vertex);
                    true
                }
                _ => false,
            }
        });
        if !queued {
            // No active scope on this thread (an async completion from an
            // external thread, typically): open one and drain right here.
            let scope = RunnableScope::enter(core);
            SCOPES.with(|scopes| {
                if let Some(frame) = scopes.borrow_mut().last_mut() {
                    frame.pending.push(vertex);
                }
            });
            drop(scope);
        }
    }

    /// Throw away pending work instead of running it (activation failed and
    /// the run is already finished with an error).
    pub(crate) fn discard(&self) {
        if !self.owns {
            return;
        }
        SCOPES.with(|scopes| {
            if let Some(frame) = scopes.borrow_mut().last_mut() {
                frame.pending.clear();
            }
        });
    }
}

impl Drop for RunnableScope<'_> {
    fn drop(&mut self) {
        if !self.owns {
            return;
        }
        loop {
            // Short borrow: the invoke below re-enters `schedule`.
            let next = SCOPES.with(|scopes| {
                scopes
                    .borrow_mut()
                    .last_mut()
                    .and_then(|frame| frame.pending.pop())
            });
            match next {
                Some(vertex) => self.core.vertex(vertex).invoke(self.core),
                None => break,
            }
        }
        SCOPES.with(|scopes| {
            scopes.borrow_mut().pop();
        });
    }
}

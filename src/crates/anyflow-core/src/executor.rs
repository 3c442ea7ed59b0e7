//! Execution strategies for vertex bodies and completion callbacks.
//!
//! The engine never owns threads. Non-trivial vertices and finish callbacks
//! are handed to a [`GraphExecutor`], which decides where they run:
//! [`InplaceGraphExecutor`] runs everything synchronously on the calling
//! thread (the default, right for graphs of cheap vertices),
//! [`ThreadPoolGraphExecutor`] dispatches through a bounded MPMC queue to a
//! fixed worker pool.
//!
//! Submission hands the executor an owned task; a rejected submission gives
//! the task back so the caller can fail the run cleanly instead of leaking a
//! vertex closure.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::closure::{Closure, ClosureCallback, ClosureContext};
use crate::graph::GraphCore;
use crate::vertex::GraphVertexClosure;

/// A non-trivial vertex invocation, ready to run on any thread.
pub struct VertexTask {
    core: Arc<GraphCore>,
    vertex: usize,
    closure: GraphVertexClosure,
}

impl VertexTask {
    pub(crate) fn new(core: Arc<GraphCore>, vertex: usize, closure: GraphVertexClosure) -> Self {
        Self {
            core,
            vertex,
            closure,
        }
    }

    /// Run the vertex body to completion (or to async hand-off).
    pub fn run(self) {
        let VertexTask {
            core,
            vertex,
            closure,
        } = self;
        core.vertex(vertex).run(&core, closure);
    }

    pub(crate) fn into_closure(self) -> GraphVertexClosure {
        self.closure
    }
}

impl std::fmt::Debug for VertexTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VertexTask")
            .field("vertex", &self.core.vertex(self.vertex).name())
            .finish()
    }
}

/// A finish callback bound to its run context.
pub struct CallbackTask {
    context: Arc<ClosureContext>,
    callback: ClosureCallback,
}

impl CallbackTask {
    pub(crate) fn new(context: Arc<ClosureContext>, callback: ClosureCallback) -> Self {
        Self { context, callback }
    }

    /// Deliver the callback with an equivalent [`Closure`] handle.
    pub fn run(self) {
        (self.callback)(Closure::from_context(self.context));
    }

    pub(crate) fn into_callback(self) -> ClosureCallback {
        self.callback
    }
}

impl std::fmt::Debug for CallbackTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CallbackTask")
    }
}

/// Strategy for running vertex bodies and delivering finish callbacks.
pub trait GraphExecutor: Send + Sync {
    /// Run a vertex body. On rejection the task is returned so the caller
    /// can fail the run.
    fn run_vertex(&self, task: VertexTask) -> Result<(), VertexTask>;

    /// Deliver a finish callback. On rejection the task is returned and
    /// retried when the run flushes.
    fn run_callback(&self, task: CallbackTask) -> Result<(), CallbackTask>;
}

/// Synchronous executor: everything runs on the calling thread.
#[derive(Debug, Default)]
pub struct InplaceGraphExecutor;

impl InplaceGraphExecutor {
    /// Shared instance used by builders that never set an executor.
    pub fn global() -> Arc<InplaceGraphExecutor> {
        static GLOBAL: std::sync::OnceLock<Arc<InplaceGraphExecutor>> = std::sync::OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(InplaceGraphExecutor)).clone()
    }
}

impl GraphExecutor for InplaceGraphExecutor {
    fn run_vertex(&self, task: VertexTask) -> Result<(), VertexTask> {
        task.run();
        Ok(())
    }

    fn run_callback(&self, task: CallbackTask) -> Result<(), CallbackTask> {
        task.run();
        Ok(())
    }
}

enum Job {
    Vertex(VertexTask),
    Callback(CallbackTask),
}

/// Worker-pool executor over a bounded MPMC queue.
///
/// Submission blocks when the queue is full, which back-pressures producers
/// instead of growing without bound. After [`stop`](Self::stop) every
/// submission is rejected.
pub struct ThreadPoolGraphExecutor {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPoolGraphExecutor {
    /// Start `worker_num` workers over a queue of `queue_capacity` entries.
    pub fn new(worker_num: usize, queue_capacity: usize) -> Self {
        let worker_num = if worker_num == 0 {
            num_cpus::get()
        } else {
            worker_num
        };
        let (sender, receiver): (Sender<Job>, Receiver<Job>) = bounded(queue_capacity.max(1));
        let workers = (0..worker_num)
            .map(|index| {
                let receiver = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("anyflow-worker-{index}"))
                    .spawn(move || Self::worker_loop(receiver))
                    .expect("spawn executor worker")
            })
            .collect();
        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    /// Pool sized to the machine with a reasonable queue.
    pub fn with_default_size() -> Self {
        Self::new(num_cpus::get(), 1024)
    }

    fn worker_loop(receiver: Receiver<Job>) {
        while let Ok(job) = receiver.recv() {
            match job {
                Job::Vertex(task) => task.run(),
                Job::Callback(task) => task.run(),
            }
        }
    }

    /// Stop accepting work and join the workers. Queued work is drained
    /// before the workers exit.
    pub fn stop(&self) {
        let sender = self.sender.lock().take();
        drop(sender);
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(panic) = worker.join() {
                tracing::warn!(?panic, "executor worker panicked");
            }
        }
    }

    fn submit(&self, job: Job) -> Result<(), Job> {
        let guard = self.sender.lock();
        match guard.as_ref() {
            Some(sender) => {
                // Cloning lets the (potentially blocking) send happen outside
                // the lock so `stop` is never wedged behind a full queue.
                let sender = sender.clone();
                drop(guard);
                sender.send(job).map_err(|rejected| rejected.0)
            }
            None => Err(job),
        }
    }
}

impl GraphExecutor for ThreadPoolGraphExecutor {
    fn run_vertex(&self, task: VertexTask) -> Result<(), VertexTask> {
        self.submit(Job::Vertex(task)).map_err(|job| match job {
            Job::Vertex(task) => task,
            Job::Callback(_) => unreachable!("vertex submissions return vertex jobs"),
        })
    }

    fn run_callback(&self, task: CallbackTask) -> Result<(), CallbackTask> {
        self.submit(Job::Callback(task)).map_err(|job| match job {
            Job::Callback(task) => task,
            Job::Vertex(_) => unreachable!("callback submissions return callback jobs"),
        })
    }
}

impl Drop for ThreadPoolGraphExecutor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ThreadPoolGraphExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPoolGraphExecutor")
            .field("stopped", &self.sender.lock().is_none())
            .finish()
    }
}

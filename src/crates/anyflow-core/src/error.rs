//! Error types for graph construction and execution.
//!
//! Build-time failures (bad wiring, conflicting declarations, processor
//! `config`/`setup` errors) surface as [`GraphError`] values from
//! [`GraphBuilder::finish`](crate::builder::GraphBuilder::finish) and
//! [`GraphBuilder::build`](crate::builder::GraphBuilder::build). Run-time
//! failures are latched as an `i32` code on the run's closure — the first
//! `finish(code)` wins, later codes are dropped and logged — and read back
//! through [`Closure::get`](crate::closure::Closure::get). [`GraphError::code`]
//! maps an error to the code it latches.

use thiserror::Error;

/// Convenience result type using [`GraphError`].
pub type Result<T> = std::result::Result<T, GraphError>;

/// All errors produced by graph construction and execution.
#[derive(Error, Debug)]
pub enum GraphError {
    /// Graph wiring is structurally invalid.
    #[error("graph validation failed: {0}")]
    Validation(String),

    /// A data slot was declared with two different element types.
    #[error("data '{data}' declared as {declared} conflicts with previous {previous}")]
    TypeConflict {
        data: String,
        declared: &'static str,
        previous: &'static str,
    },

    /// A mutable dependency cannot be made exclusive.
    ///
    /// Raised at build time when exclusivity is statically violated, and at
    /// run time (as code −1) when conditional edges resolve into more than
    /// one active dependency on a mutably-depended slot.
    #[error("mutable dependency on '{0}' is not exclusive")]
    MutableConflict(String),

    /// A name was referenced but never produced or bound.
    #[error("no data named '{0}' in graph")]
    MissingData(String),

    /// A processor's `config` hook rejected its option.
    #[error("config of vertex '{vertex}' failed: {reason}")]
    Config { vertex: String, reason: String },

    /// A processor's `setup` hook failed while building a graph instance.
    #[error("setup of vertex '{vertex}' failed: {reason}")]
    Setup { vertex: String, reason: String },

    /// A data slot was activated but has no producer.
    #[error("cannot activate data '{0}' with no producer")]
    NoProducer(String),

    /// A processor's `process` reported failure with an application code.
    #[error("processor failed with code {0}")]
    Processor(i32),

    /// The executor refused a task.
    #[error("executor rejected work: {0}")]
    Executor(String),

    /// All vertex work drained before the requested data became ready.
    #[error("graph stalled: requested data never became ready")]
    Stalled,
}

impl GraphError {
    /// The `i32` code this error latches onto a run's closure.
    ///
    /// Application codes from [`GraphError::Processor`] pass through
    /// unchanged; every framework error maps to −1.
    pub fn code(&self) -> i32 {
        match self {
            GraphError::Processor(code) => *code,
            _ => -1,
        }
    }

    /// Build a processor error from a non-zero application code.
    pub fn processor(code: i32) -> Self {
        GraphError::Processor(code)
    }
}

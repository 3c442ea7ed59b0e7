//! Conditional selection operator.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::builder::GraphBuilder;
use crate::error::{GraphError, Result};
use crate::vertex::{GraphProcessor, VertexContext};

static INSTANCE_INDEX: AtomicUsize = AtomicUsize::new(0);

/// Forwards the first ready dependency into its single emit.
///
/// Wired with conditional edges, only one dependency resolves per run; the
/// chosen value passes through by reference. Mutability requested downstream
/// propagates to every candidate edge at activation.
#[derive(Default)]
pub struct SelectProcessor;

impl SelectProcessor {
    /// The common `dest = cond ? true_src : false_src` wiring.
    pub fn apply(
        builder: &mut GraphBuilder,
        dest: &str,
        cond: &str,
        true_src: &str,
        false_src: &str,
    ) {
        let index = INSTANCE_INDEX.fetch_add(1, Ordering::Relaxed) + 1;
        let vertex = builder.add_vertex(|| Box::<SelectProcessor>::default());
        vertex.set_name(format!("SelectProcessor{index}"));
        vertex.anonymous_depend().to(true_src).on(cond);
        vertex.anonymous_depend().to(false_src).unless(cond);
        vertex.anonymous_emit().to(dest);
    }
}

impl GraphProcessor for SelectProcessor {
    fn setup(&mut self, vertex: &VertexContext) -> Result<()> {
        if vertex.anonymous_emit_len() != 1 {
            return Err(GraphError::Validation(format!(
                "emit num [{}] != 1 for {}",
                vertex.anonymous_emit_len(),
                vertex.vertex()
            )));
        }
        vertex.declare_trivial();
        Ok(())
    }

    fn on_activate(&mut self, vertex: &VertexContext) -> Result<()> {
        let target = vertex
            .anonymous_emit(0)
            .ok_or_else(|| GraphError::Validation("select target missing".to_string()))?;
        if target.need_mutable() {
            for index in 0..vertex.anonymous_dependency_len() {
                if let Some(dependency) = vertex.anonymous_dependency(index) {
                    dependency.declare_mutable();
                }
            }
        }
        Ok(())
    }

    fn process(&mut self, vertex: &VertexContext) -> Result<()> {
        let target = vertex
            .anonymous_emit(0)
            .ok_or_else(|| GraphError::Validation("select target missing".to_string()))?;
        for index in 0..vertex.anonymous_dependency_len() {
            let Some(dependency) = vertex.anonymous_dependency(index) else {
                continue;
            };
            if dependency.ready() {
                if target.forward(dependency) {
                    return Ok(());
                }
                tracing::warn!(
                    vertex = %vertex.vertex(),
                    dependency = index,
                    "selected dependency could not be forwarded"
                );
                return Err(GraphError::Validation(
                    "selected dependency could not be forwarded".to_string(),
                ));
            }
        }
        tracing::warn!(vertex = %vertex.vertex(), "no dependency ready to forward");
        Err(GraphError::Validation(
            "no dependency ready to forward".to_string(),
        ))
    }
}

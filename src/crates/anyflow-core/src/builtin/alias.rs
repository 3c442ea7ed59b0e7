//! Renaming operator.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::builder::GraphBuilder;
use crate::error::{GraphError, Result};
use crate::vertex::{GraphProcessor, VertexContext};

static INSTANCE_INDEX: AtomicUsize = AtomicUsize::new(0);

/// Publishes its single dependency under another name, by reference.
///
/// Trivial: runs inline on the thread that completed the source. Mutability
/// requested downstream of the alias propagates to the source edge at
/// activation, so a mutable consumer of the alias mutates the original
/// storage.
#[derive(Default)]
pub struct AliasProcessor;

impl AliasProcessor {
    /// Wire `alias` as another name for `source`.
    pub fn apply(builder: &mut GraphBuilder, alias: &str, source: &str) {
        let index = INSTANCE_INDEX.fetch_add(1, Ordering::Relaxed) + 1;
        let vertex = builder.add_vertex(|| Box::<AliasProcessor>::default());
        vertex.set_name(format!("AliasProcessor{index}"));
        vertex.anonymous_depend().to(source);
        vertex.anonymous_emit().to(alias);
    }
}

impl GraphProcessor for AliasProcessor {
    fn setup(&mut self, vertex: &VertexContext) -> Result<()> {
        if vertex.anonymous_dependency_len() != 1 {
            return Err(GraphError::Validation(format!(
                "depend num [{}] != 1 for {}",
                vertex.anonymous_dependency_len(),
                vertex.vertex()
            )));
        }
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
        let source = vertex
            .anonymous_dependency(0)
            .ok_or_else(|| GraphError::Validation("alias source missing".to_string()))?;
        let target = vertex
            .anonymous_emit(0)
            .ok_or_else(|| GraphError::Validation("alias target missing".to_string()))?;
        if target.need_mutable() {
            source.declare_mutable();
        }
        Ok(())
    }

    fn process(&mut self, vertex: &VertexContext) -> Result<()> {
        let source = vertex
            .anonymous_dependency(0)
            .ok_or_else(|| GraphError::Validation("alias source missing".to_string()))?;
        let target = vertex
            .anonymous_emit(0)
            .ok_or_else(|| GraphError::Validation("alias target missing".to_string()))?;
        if !target.forward(source) {
            tracing::warn!(vertex = %vertex.vertex(), "alias forward failed");
        }
        Ok(())
    }
}

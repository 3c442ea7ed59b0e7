//! Constant operator.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::builder::GraphBuilder;
use crate::error::{GraphError, Result};
use crate::value::Value;
use crate::vertex::{GraphProcessor, VertexContext};

static INSTANCE_INDEX: AtomicUsize = AtomicUsize::new(0);

/// Publishes its option value into a slot, by reference.
///
/// The option lives as long as the vertex, so every run republishes the same
/// storage with no copy.
#[derive(Default)]
pub struct ConstProcessor;

impl ConstProcessor {
    /// Wire `data` to carry the constant `value`.
    pub fn apply(builder: &mut GraphBuilder, data: &str, value: impl Into<Value>) {
        let index = INSTANCE_INDEX.fetch_add(1, Ordering::Relaxed) + 1;
        let vertex = builder.add_vertex(|| Box::<ConstProcessor>::default());
        vertex.set_name(format!("ConstProcessor{index}"));
        vertex.option(value);
        vertex.anonymous_emit().to(data);
    }
}

impl GraphProcessor for ConstProcessor {
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

    fn process(&mut self, vertex: &VertexContext) -> Result<()> {
        let option = vertex.option_value();
        let target = vertex
            .anonymous_emit(0)
            .ok_or_else(|| GraphError::Validation("const target missing".to_string()))?;
        if !target.emit_value_ref(Arc::as_ptr(option)) {
            tracing::warn!(vertex = %vertex.vertex(), "const emit lost the commit race");
        }
        Ok(())
    }
}

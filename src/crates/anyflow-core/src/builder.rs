//! Declarative graph construction.
//!
//! Users describe vertices against *named* data slots; the builder is the
//! symbol table plus a validation pass that turns those strings into dense
//! indices. [`GraphBuilder::finish`] resolves every name, runs each
//! processor's `config` hook and detects multi-producer slots (forcing their
//! producers off the inline path so commit atomicity is preserved);
//! [`GraphBuilder::build`] can then stamp out any number of independent
//! runtime [`Graph`] instances, each with freshly wired slots, vertices and
//! processor instances.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::data::GraphData;
use crate::dependency::GraphDependency;
use crate::error::{GraphError, Result};
use crate::executor::{GraphExecutor, InplaceGraphExecutor};
use crate::graph::{Graph, GraphCore};
use crate::value::Value;
use crate::vertex::{GraphProcessor, GraphVertex};

type ProcessorFactory = Arc<dyn Fn() -> Box<dyn GraphProcessor> + Send + Sync>;

/// Builder for a whole graph: vertices plus the data-name symbol table.
pub struct GraphBuilder {
    name: String,
    executor: Arc<dyn GraphExecutor>,
    vertexes: Vec<GraphVertexBuilder>,
    data_index_for_name: HashMap<String, usize>,
    data_names: Vec<String>,
    // Producing vertex-builder indices per data index, deduplicated.
    producers_for_data: HashMap<usize, Vec<usize>>,
    finished: bool,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self {
            name: String::new(),
            executor: InplaceGraphExecutor::global(),
            vertexes: Vec::new(),
            data_index_for_name: HashMap::new(),
            data_names: Vec::new(),
            producers_for_data: HashMap::new(),
            finished: false,
        }
    }

    /// Name the graph, for logging.
    pub fn set_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Executor used by every graph built from this builder. Defaults to
    /// inline execution on the calling thread.
    pub fn set_executor(&mut self, executor: Arc<dyn GraphExecutor>) -> &mut Self {
        self.executor = executor;
        self
    }

    /// Add a vertex backed by processor instances from `factory`. Returns
    /// the vertex builder for wiring dependencies and emits.
    pub fn add_vertex<F>(&mut self, factory: F) -> &mut GraphVertexBuilder
    where
        F: Fn() -> Box<dyn GraphProcessor> + Send + Sync + 'static,
    {
        let index = self.vertexes.len();
        self.vertexes
            .push(GraphVertexBuilder::new(index, Arc::new(factory)));
        self.vertexes
            .last_mut()
            .expect("vertex was just pushed")
    }

    /// Visit every vertex builder, e.g. to post-process wiring.
    pub fn for_each_vertex(&mut self, mut f: impl FnMut(&mut GraphVertexBuilder)) {
        for vertex in &mut self.vertexes {
            f(vertex);
        }
    }

    /// Resolve names to indices, run `config` on every processor and check
    /// overall consistency. Must run once before [`build`](Self::build).
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.data_index_for_name.clear();
        self.data_names.clear();
        self.producers_for_data.clear();

        let mut vertexes = std::mem::take(&mut self.vertexes);
        let result: Result<()> = (|| {
            for (index, vertex) in vertexes.iter_mut().enumerate() {
                vertex.finish(self, index)?;
            }
            Ok(())
        })();
        self.vertexes = vertexes;
        result?;

        // A slot with several producers needs every commit to go through the
        // executor; an inline chain from a second producer could interleave
        // with the first writer.
        for producers in self.producers_for_data.values() {
            if producers.len() > 1 {
                for &vertex in producers {
                    self.vertexes[vertex].allow_trivial = false;
                }
            }
        }
        self.finished = true;
        Ok(())
    }

    /// Instantiate a runtime graph. Can be called repeatedly; every call
    /// produces an independent instance with fresh processor instances.
    pub fn build(&self) -> Result<Graph> {
        if !self.finished {
            return Err(GraphError::Validation(
                "finish() must succeed before build()".to_string(),
            ));
        }

        let data_count = self.data_names.len();
        let mut successors: Vec<Vec<(usize, usize)>> = vec![Vec::new(); data_count];
        let mut producers: Vec<Vec<usize>> = vec![Vec::new(); data_count];
        for (vertex_index, vertex) in self.vertexes.iter().enumerate() {
            for (slot, dependency) in vertex.all_dependencies().enumerate() {
                successors[dependency.target_index].push((vertex_index, slot));
                if let Some(condition) = dependency.condition_index {
                    successors[condition].push((vertex_index, slot));
                }
            }
            for emit in vertex.all_emits() {
                producers[emit.target_index].push(vertex_index);
            }
        }

        let core = Arc::new_cyclic(|weak| {
            let mut data = Vec::with_capacity(data_count);
            for (index, name) in self.data_names.iter().enumerate() {
                data.push(GraphData::new(
                    name.clone(),
                    index,
                    weak.clone(),
                    std::mem::take(&mut producers[index]),
                    std::mem::take(&mut successors[index]),
                ));
            }
            let vertices = self
                .vertexes
                .iter()
                .enumerate()
                .map(|(index, vertex)| vertex.build(index, &data))
                .collect();
            GraphCore::new(
                self.name.clone(),
                self.executor.clone(),
                data,
                vertices,
                self.data_index_for_name.clone(),
            )
        });

        for vertex in core.all_vertices() {
            vertex.setup(&core)?;
        }
        for data in core.all_data() {
            if let Some(error) = data.take_declare_error() {
                tracing::warn!(data = %data, %error, "build rejected");
                return Err(error);
            }
            if !data.check_safe_mutable(&core) {
                tracing::warn!(data = %data, "mutable dependency is not exclusive");
                return Err(GraphError::MutableConflict(data.name().to_string()));
            }
        }
        Ok(Graph::from_core(core))
    }

    fn get_or_allocate_data_index(&mut self, name: &str) -> usize {
        match self.data_index_for_name.get(name) {
            Some(&index) => index,
            None => {
                let index = self.data_names.len();
                self.data_names.push(name.to_string());
                self.data_index_for_name.insert(name.to_string(), index);
                index
            }
        }
    }

    fn register_data_producer(&mut self, data_index: usize, vertex_index: usize) {
        let producers = self.producers_for_data.entry(data_index).or_default();
        if !producers.contains(&vertex_index) {
            producers.push(vertex_index);
        }
    }
}

impl std::fmt::Debug for GraphBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphBuilder")
            .field("name", &self.name)
            .field("vertexes", &self.vertexes.len())
            .field("finished", &self.finished)
            .finish()
    }
}

/// Builder for one vertex: processor factory, option, dependencies, emits.
pub struct GraphVertexBuilder {
    index: usize,
    name: String,
    factory: ProcessorFactory,
    raw_option: Value,
    option: Arc<Value>,
    allow_trivial: bool,

    dependency_index_by_name: HashMap<String, usize>,
    named_dependencies: Vec<GraphDependencyBuilder>,
    anonymous_dependencies: Vec<GraphDependencyBuilder>,

    emit_index_by_name: HashMap<String, usize>,
    named_emits: Vec<GraphEmitBuilder>,
    anonymous_emits: Vec<GraphEmitBuilder>,
}

impl GraphVertexBuilder {
    fn new(index: usize, factory: ProcessorFactory) -> Self {
        Self {
            index,
            name: String::new(),
            factory,
            raw_option: Value::default(),
            option: Arc::new(Value::default()),
            allow_trivial: true,
            dependency_index_by_name: HashMap::new(),
            named_dependencies: Vec::new(),
            anonymous_dependencies: Vec::new(),
            emit_index_by_name: HashMap::new(),
            named_emits: Vec::new(),
            anonymous_emits: Vec::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Name the vertex, for logging.
    pub fn set_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.name = name.into();
        self
    }

    /// Alias of [`set_name`](Self::set_name).
    pub fn name(&mut self, name: impl Into<String>) -> &mut Self {
        self.set_name(name)
    }

    /// Raw option handed to the processor's `config` hook at `finish`.
    pub fn option(&mut self, value: impl Into<Value>) -> &mut Self {
        self.raw_option = value.into();
        self
    }

    /// Add (or fetch) the named dependency `name`.
    pub fn named_depend(&mut self, name: &str) -> &mut GraphDependencyBuilder {
        match self.dependency_index_by_name.get(name) {
            Some(&slot) => &mut self.named_dependencies[slot],
            None => {
                let slot = self.named_dependencies.len();
                self.dependency_index_by_name.insert(name.to_string(), slot);
                self.named_dependencies
                    .push(GraphDependencyBuilder::new(Some(name.to_string()), slot));
                self.named_dependencies
                    .last_mut()
                    .expect("dependency was just pushed")
            }
        }
    }

    /// Add a positional dependency.
    pub fn anonymous_depend(&mut self) -> &mut GraphDependencyBuilder {
        let slot = self.anonymous_dependencies.len();
        self.anonymous_dependencies
            .push(GraphDependencyBuilder::new(None, slot));
        self.anonymous_dependencies
            .last_mut()
            .expect("dependency was just pushed")
    }

    /// Add (or fetch) the named emit `name`.
    pub fn named_emit(&mut self, name: &str) -> &mut GraphEmitBuilder {
        match self.emit_index_by_name.get(name) {
            Some(&slot) => &mut self.named_emits[slot],
            None => {
                let slot = self.named_emits.len();
                self.emit_index_by_name.insert(name.to_string(), slot);
                self.named_emits
                    .push(GraphEmitBuilder::new(Some(name.to_string()), slot));
                self.named_emits.last_mut().expect("emit was just pushed")
            }
        }
    }

    /// Add a positional emit.
    pub fn anonymous_emit(&mut self) -> &mut GraphEmitBuilder {
        let slot = self.anonymous_emits.len();
        self.anonymous_emits
            .push(GraphEmitBuilder::new(None, slot));
        self.anonymous_emits.last_mut().expect("emit was just pushed")
    }

    /// Number of named dependencies wired so far.
    pub fn named_dependency_count(&self) -> usize {
        self.named_dependencies.len()
    }

    /// Number of positional dependencies wired so far.
    pub fn anonymous_dependency_count(&self) -> usize {
        self.anonymous_dependencies.len()
    }

    fn all_dependencies(&self) -> impl Iterator<Item = &GraphDependencyBuilder> {
        self.named_dependencies
            .iter()
            .chain(self.anonymous_dependencies.iter())
    }

    fn all_emits(&self) -> impl Iterator<Item = &GraphEmitBuilder> {
        self.named_emits.iter().chain(self.anonymous_emits.iter())
    }

    fn finish(&mut self, graph: &mut GraphBuilder, vertex_index: usize) -> Result<()> {
        let vertex_name = self.name.clone();
        for dependency in self
            .named_dependencies
            .iter_mut()
            .chain(self.anonymous_dependencies.iter_mut())
        {
            dependency.finish(graph, &vertex_name)?;
        }
        for emit in self
            .named_emits
            .iter_mut()
            .chain(self.anonymous_emits.iter_mut())
        {
            emit.finish(graph, &vertex_name)?;
            graph.register_data_producer(emit.target_index, vertex_index);
        }

        let processor = (self.factory)();
        let raw = std::mem::take(&mut self.raw_option);
        let normalized = processor.config(raw).map_err(|error| GraphError::Config {
            vertex: self.name.clone(),
            reason: error.to_string(),
        })?;
        self.option = Arc::new(normalized);
        Ok(())
    }

    fn build(&self, vertex_index: usize, data: &[GraphData]) -> GraphVertex {
        let dependencies = self
            .all_dependencies()
            .map(|dependency| {
                GraphDependency::new(
                    vertex_index,
                    NonNull::from(&data[dependency.target_index]),
                    dependency
                        .condition_index
                        .map(|condition| NonNull::from(&data[condition])),
                    dependency.establish_value,
                )
            })
            .collect();
        let emits = self.all_emits().map(|emit| emit.target_index).collect();
        GraphVertex::new(
            vertex_index,
            Arc::from(self.name.as_str()),
            (self.factory)(),
            dependencies,
            emits,
            self.dependency_index_by_name.clone(),
            self.emit_index_by_name.clone(),
            self.named_dependencies.len(),
            self.named_emits.len(),
            self.option.clone(),
            self.allow_trivial,
        )
    }
}

impl std::fmt::Debug for GraphVertexBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphVertexBuilder")
            .field("name", &self.name)
            .field("index", &self.index)
            .finish()
    }
}

/// Builder for one dependency edge.
pub struct GraphDependencyBuilder {
    name: Option<String>,
    slot: usize,
    target: String,
    condition: Option<String>,
    establish_value: bool,
    target_index: usize,
    condition_index: Option<usize>,
}

impl GraphDependencyBuilder {
    fn new(name: Option<String>, slot: usize) -> Self {
        Self {
            name,
            slot,
            target: String::new(),
            condition: None,
            establish_value: false,
            target_index: 0,
            condition_index: None,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn condition(&self) -> Option<&str> {
        self.condition.as_deref()
    }

    /// The data slot this edge reads.
    pub fn to(&mut self, target: &str) -> &mut Self {
        self.target = target.to_string();
        self
    }

    /// Gate the edge on `condition` being true.
    pub fn on(&mut self, condition: &str) -> &mut Self {
        self.condition = Some(condition.to_string());
        self.establish_value = true;
        self
    }

    /// Gate the edge on `condition` being false.
    pub fn unless(&mut self, condition: &str) -> &mut Self {
        self.condition = Some(condition.to_string());
        self.establish_value = false;
        self
    }

    fn finish(&mut self, graph: &mut GraphBuilder, vertex: &str) -> Result<()> {
        if self.target.is_empty() {
            return Err(GraphError::Validation(format!(
                "dependency of vertex '{vertex}' has no target"
            )));
        }
        self.target_index = graph.get_or_allocate_data_index(&self.target);
        self.condition_index = self
            .condition
            .as_ref()
            .map(|condition| graph.get_or_allocate_data_index(condition));
        Ok(())
    }
}

impl std::fmt::Debug for GraphDependencyBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphDependencyBuilder")
            .field("target", &self.target)
            .field("condition", &self.condition)
            .finish()
    }
}

/// Builder for one emit edge.
pub struct GraphEmitBuilder {
    name: Option<String>,
    slot: usize,
    target: String,
    target_index: usize,
}

impl GraphEmitBuilder {
    fn new(name: Option<String>, slot: usize) -> Self {
        Self {
            name,
            slot,
            target: String::new(),
            target_index: 0,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// The data slot this emit publishes.
    pub fn to(&mut self, target: &str) -> &mut Self {
        self.target = target.to_string();
        self
    }

    fn finish(&mut self, graph: &mut GraphBuilder, vertex: &str) -> Result<()> {
        if self.target.is_empty() {
            return Err(GraphError::Validation(format!(
                "emit of vertex '{vertex}' has no target"
            )));
        }
        self.target_index = graph.get_or_allocate_data_index(&self.target);
        Ok(())
    }
}

impl std::fmt::Debug for GraphEmitBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphEmitBuilder")
            .field("target", &self.target)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;
    impl GraphProcessor for Noop {}

    #[test]
    fn test_build_requires_finish() {
        let builder = GraphBuilder::new();
        assert!(matches!(builder.build(), Err(GraphError::Validation(_))));
    }

    #[test]
    fn test_dependency_requires_target() {
        let mut builder = GraphBuilder::new();
        {
            let vertex = builder.add_vertex(|| Box::new(Noop));
            vertex.set_name("lonely");
            vertex.named_depend("input");
        }
        assert!(matches!(builder.finish(), Err(GraphError::Validation(_))));
    }

    #[test]
    fn test_named_depend_deduplicates() {
        let mut builder = GraphBuilder::new();
        let vertex = builder.add_vertex(|| Box::new(Noop));
        vertex.named_depend("input").to("A");
        assert_eq!(vertex.named_depend("input").target(), "A");
        assert_eq!(vertex.named_dependency_count(), 1);
    }

    #[test]
    fn test_build_produces_independent_graphs() {
        let mut builder = GraphBuilder::new();
        {
            let vertex = builder.add_vertex(|| Box::new(Noop));
            vertex.set_name("producer");
            vertex.named_emit("out").to("X");
        }
        builder.finish().unwrap();
        let first = builder.build().unwrap();
        let second = builder.build().unwrap();

        first.find_data("X").unwrap().emit::<i64>().set(1);
        assert!(first.find_data("X").unwrap().ready());
        assert!(!second.find_data("X").unwrap().ready());
    }

    #[test]
    fn test_config_failure_aborts_finish() {
        struct Rejecting;
        impl GraphProcessor for Rejecting {
            fn config(&self, _raw: Value) -> Result<Value> {
                Err(GraphError::Validation("option rejected".to_string()))
            }
        }

        let mut builder = GraphBuilder::new();
        {
            let vertex = builder.add_vertex(|| Box::new(Rejecting));
            vertex.set_name("rejecting");
            vertex.option(1_i64);
            vertex.named_emit("out").to("X");
        }
        assert!(matches!(builder.finish(), Err(GraphError::Config { .. })));
    }

    #[test]
    fn test_normalized_option_reaches_vertices() {
        struct DoublingConfig;
        impl GraphProcessor for DoublingConfig {
            fn config(&self, raw: Value) -> Result<Value> {
                Ok(Value::from_primitive(raw.as_primitive::<i64>() * 2))
            }
        }

        let mut builder = GraphBuilder::new();
        {
            let vertex = builder.add_vertex(|| Box::new(DoublingConfig));
            vertex.set_name("doubling");
            vertex.option(21_i64);
            vertex.named_emit("out").to("X");
        }
        builder.finish().unwrap();
        let graph = builder.build().unwrap();
        graph
            .for_each_vertex(|vertex| {
                assert_eq!(vertex.option::<i64>().copied(), Some(42));
                Ok(())
            })
            .unwrap();
    }
}

//! End-to-end graph execution scenarios.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyflow_core::builtin::{AliasProcessor, ConstProcessor, SelectProcessor};
use anyflow_core::{
    Essential, GraphBuilder, GraphError, GraphProcessor, GraphVertexClosure, Result,
    ThreadPoolGraphExecutor, VertexContext,
};

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// `result = op(lhs, rhs)` over `i64` slots.
struct BinaryOp {
    op: fn(i64, i64) -> i64,
}

impl GraphProcessor for BinaryOp {
    fn setup(&mut self, vertex: &VertexContext) -> Result<()> {
        for name in ["lhs", "rhs"] {
            if let Some(dependency) = vertex.named_dependency(name) {
                dependency.declare_type::<i64>();
                dependency.declare_essential(Essential::FailOnEmpty);
            }
        }
        if let Some(emit) = vertex.named_emit("result") {
            emit.declare_type::<i64>();
        }
        Ok(())
    }

    fn process(&mut self, vertex: &VertexContext) -> Result<()> {
        let operand = |name: &str| {
            vertex
                .named_dependency(name)
                .and_then(|dependency| dependency.value::<i64>())
                .copied()
                .ok_or_else(|| GraphError::Validation(format!("operand '{name}' missing")))
        };
        let result = (self.op)(operand("lhs")?, operand("rhs")?);
        if let Some(emit) = vertex.named_emit("result") {
            emit.emit::<i64>().set(result);
        }
        Ok(())
    }
}

fn add_binary(builder: &mut GraphBuilder, name: &str, op: fn(i64, i64) -> i64, lhs: &str, rhs: &str, result: &str) {
    let vertex = builder.add_vertex(move || Box::new(BinaryOp { op }));
    vertex.set_name(name);
    vertex.named_depend("lhs").to(lhs);
    vertex.named_depend("rhs").to(rhs);
    vertex.named_emit("result").to(result);
}

fn feed_i64(graph: &anyflow_core::Graph, name: &str, value: i64) {
    graph
        .find_data(name)
        .unwrap_or_else(|| panic!("no data named {name}"))
        .emit::<i64>()
        .set(value);
}

#[test]
fn test_product_of_sum_and_difference() {
    init_logging();
    // (A + B) * (A - B)
    let mut builder = GraphBuilder::new();
    builder.set_name("sum_diff_product");
    add_binary(&mut builder, "sum", |a, b| a + b, "A", "B", "Sum");
    add_binary(&mut builder, "diff", |a, b| a - b, "A", "B", "Diff");
    add_binary(&mut builder, "product", |a, b| a * b, "Sum", "Diff", "FinalRes");
    builder.finish().unwrap();
    let graph = builder.build().unwrap();

    feed_i64(&graph, "A", 10);
    feed_i64(&graph, "B", 5);
    let result = graph.find_data("FinalRes").unwrap();
    assert_eq!(graph.run(&[result]).get(), 0);
    assert_eq!(result.value::<i64>().copied(), Some(75));
}

#[test]
fn test_difference_of_squares_matches() {
    // A² - B² must agree with (A + B) * (A - B).
    let mut builder = GraphBuilder::new();
    builder.set_name("difference_of_squares");
    add_binary(&mut builder, "a_squared", |a, b| a * b, "A", "A", "A2");
    add_binary(&mut builder, "b_squared", |a, b| a * b, "B", "B", "B2");
    add_binary(&mut builder, "diff", |a, b| a - b, "A2", "B2", "FinalRes");
    builder.finish().unwrap();
    let graph = builder.build().unwrap();

    feed_i64(&graph, "A", 10);
    feed_i64(&graph, "B", 5);
    let result = graph.find_data("FinalRes").unwrap();
    assert_eq!(graph.run(&[result]).get(), 0);
    assert_eq!(result.value::<i64>().copied(), Some(75));
}

#[test]
fn test_select_preserves_identity() {
    init_logging();
    let mut builder = GraphBuilder::new();
    ConstProcessor::apply(&mut builder, "a", "hello");
    ConstProcessor::apply(&mut builder, "b", "world");
    SelectProcessor::apply(&mut builder, "x", "c", "a", "b");
    builder.finish().unwrap();
    let graph = builder.build().unwrap();

    graph.find_data("c").unwrap().emit::<bool>().set(true);
    let x = graph.find_data("x").unwrap();
    assert_eq!(graph.run(&[x]).get(), 0);
    assert_eq!(x.value::<String>().map(String::as_str), Some("hello"));

    // Zero-copy: the selected output is the constant's own storage.
    let a = graph.find_data("a").unwrap();
    assert_eq!(graph.run(&[a]).get(), 0);
    let through_select = x.value::<String>().unwrap() as *const String;
    let direct = a.value::<String>().unwrap() as *const String;
    assert_eq!(through_select, direct);
}

#[test]
fn test_select_other_branch_after_reset() {
    let mut builder = GraphBuilder::new();
    ConstProcessor::apply(&mut builder, "a", "hello");
    ConstProcessor::apply(&mut builder, "b", "world");
    SelectProcessor::apply(&mut builder, "x", "c", "a", "b");
    builder.finish().unwrap();
    let mut graph = builder.build().unwrap();

    graph.find_data("c").unwrap().emit::<bool>().set(true);
    {
        let x = graph.find_data("x").unwrap();
        assert_eq!(graph.run(&[x]).get(), 0);
        assert_eq!(x.value::<String>().map(String::as_str), Some("hello"));
    }

    graph.reset();
    graph.find_data("c").unwrap().emit::<bool>().set(false);
    let x = graph.find_data("x").unwrap();
    assert_eq!(graph.run(&[x]).get(), 0);
    assert_eq!(x.value::<String>().map(String::as_str), Some("world"));
}

/// Emits a string into its single emit.
struct StringSource {
    text: &'static str,
}

impl GraphProcessor for StringSource {
    fn setup(&mut self, vertex: &VertexContext) -> Result<()> {
        if let Some(emit) = vertex.named_emit("out") {
            emit.declare_type::<String>();
        }
        Ok(())
    }

    fn process(&mut self, vertex: &VertexContext) -> Result<()> {
        if let Some(emit) = vertex.named_emit("out") {
            let mut committer = emit.emit::<String>();
            if let Some(text) = committer.get() {
                text.push_str(self.text);
            }
        }
        Ok(())
    }
}

/// Rewrites its mutable input in place, then reports the final length.
struct MutatingConsumer;

impl GraphProcessor for MutatingConsumer {
    fn setup(&mut self, vertex: &VertexContext) -> Result<()> {
        if let Some(dependency) = vertex.named_dependency("input") {
            dependency.declare_type::<String>();
            dependency.declare_mutable();
            dependency.declare_essential(Essential::SkipOnEmpty);
        }
        if let Some(emit) = vertex.named_emit("out") {
            emit.declare_type::<i64>();
        }
        Ok(())
    }

    fn process(&mut self, vertex: &VertexContext) -> Result<()> {
        let dependency = vertex
            .named_dependency("input")
            .ok_or_else(|| GraphError::Validation("input missing".to_string()))?;
        // SAFETY: single call, single live reference.
        let text = unsafe { dependency.mutable_value::<String>() }
            .ok_or_else(|| GraphError::Validation("input not mutable".to_string()))?;
        text.push('!');
        if let Some(emit) = vertex.named_emit("out") {
            emit.emit::<i64>().set(text.len() as i64);
        }
        Ok(())
    }
}

/// Plain read-only consumer of the same slot.
struct ReadingConsumer;

impl GraphProcessor for ReadingConsumer {
    fn setup(&mut self, vertex: &VertexContext) -> Result<()> {
        if let Some(dependency) = vertex.named_dependency("input") {
            dependency.declare_type::<String>();
            dependency.declare_essential(Essential::SkipOnEmpty);
        }
        if let Some(emit) = vertex.named_emit("out") {
            emit.declare_type::<i64>();
        }
        Ok(())
    }

    fn process(&mut self, vertex: &VertexContext) -> Result<()> {
        let length = vertex
            .named_dependency("input")
            .and_then(|dependency| dependency.value::<String>())
            .map(|text| text.len() as i64)
            .unwrap_or(0);
        if let Some(emit) = vertex.named_emit("out") {
            emit.emit::<i64>().set(length);
        }
        Ok(())
    }
}

#[test]
fn test_unconditional_mutable_fanout_rejected_at_build() {
    init_logging();
    let mut builder = GraphBuilder::new();
    {
        let vertex = builder.add_vertex(|| Box::new(StringSource { text: "payload" }));
        vertex.set_name("source");
        vertex.named_emit("out").to("D");
    }
    {
        let vertex = builder.add_vertex(|| Box::new(MutatingConsumer));
        vertex.set_name("mutator");
        vertex.named_depend("input").to("D");
        vertex.named_emit("out").to("out1");
    }
    {
        let vertex = builder.add_vertex(|| Box::new(ReadingConsumer));
        vertex.set_name("reader");
        vertex.named_depend("input").to("D");
        vertex.named_emit("out").to("out2");
    }
    builder.finish().unwrap();
    match builder.build() {
        Err(GraphError::MutableConflict(data)) => assert_eq!(data, "D"),
        other => panic!("expected mutable conflict, got {other:?}"),
    }
}

fn conditional_mutable_graph() -> anyflow_core::Graph {
    let mut builder = GraphBuilder::new();
    {
        let vertex = builder.add_vertex(|| Box::new(StringSource { text: "payload" }));
        vertex.set_name("source");
        vertex.named_emit("out").to("D");
    }
    {
        let vertex = builder.add_vertex(|| Box::new(MutatingConsumer));
        vertex.set_name("mutator1");
        vertex.named_depend("input").to("D").on("c1");
        vertex.named_emit("out").to("out1");
    }
    {
        let vertex = builder.add_vertex(|| Box::new(MutatingConsumer));
        vertex.set_name("mutator2");
        vertex.named_depend("input").to("D").on("c2");
        vertex.named_emit("out").to("out2");
    }
    builder.finish().unwrap();
    builder.build().unwrap()
}

#[test]
fn test_disjoint_conditional_mutables_build_and_run() {
    let graph = conditional_mutable_graph();
    graph.find_data("c1").unwrap().emit::<bool>().set(true);
    graph.find_data("c2").unwrap().emit::<bool>().set(false);

    let out1 = graph.find_data("out1").unwrap();
    let out2 = graph.find_data("out2").unwrap();
    assert_eq!(graph.run(&[out1, out2]).get(), 0);
    assert_eq!(out1.value::<i64>().copied(), Some(8), "payload plus one");
    assert!(out2.empty(), "unestablished consumer skipped");
}

#[test]
fn test_both_conditional_mutables_fail_at_run() {
    init_logging();
    let graph = conditional_mutable_graph();
    graph.find_data("c1").unwrap().emit::<bool>().set(true);
    graph.find_data("c2").unwrap().emit::<bool>().set(true);

    let out1 = graph.find_data("out1").unwrap();
    let out2 = graph.find_data("out2").unwrap();
    assert_eq!(graph.run(&[out1, out2]).get(), -1);
}

/// Declares an emit but abandons its committer, so the slot never becomes
/// ready.
struct AbandoningProducer;

impl GraphProcessor for AbandoningProducer {
    fn setup(&mut self, vertex: &VertexContext) -> Result<()> {
        if let Some(emit) = vertex.named_emit("out") {
            emit.declare_type::<String>();
        }
        Ok(())
    }

    fn process(&mut self, vertex: &VertexContext) -> Result<()> {
        if let Some(emit) = vertex.named_emit("out") {
            let committer = emit.emit::<String>();
            committer.cancel();
        }
        Ok(())
    }
}

#[test]
fn test_stall_detected_when_emit_abandoned() {
    init_logging();
    let mut builder = GraphBuilder::new();
    {
        let vertex = builder.add_vertex(|| Box::new(AbandoningProducer));
        vertex.set_name("abandoner");
        vertex.named_emit("out").to("X");
    }
    builder.finish().unwrap();
    let graph = builder.build().unwrap();

    let x = graph.find_data("X").unwrap();
    let closure = graph.run(&[x]);
    assert_eq!(closure.get(), -1, "all work drained but X never became ready");
    assert!(!x.ready());
}

/// Streams `[1, 2, 3, 4]` into its channel emit and closes.
struct StreamProducer;

impl GraphProcessor for StreamProducer {
    fn setup(&mut self, vertex: &VertexContext) -> Result<()> {
        if let Some(emit) = vertex.named_emit("stream") {
            emit.declare_channel::<i32>();
        }
        Ok(())
    }

    fn process(&mut self, vertex: &VertexContext) -> Result<()> {
        let emit = vertex
            .named_emit("stream")
            .ok_or_else(|| GraphError::Validation("stream missing".to_string()))?;
        let publisher = emit.output_channel::<i32>().open();
        for value in [1, 2, 3, 4] {
            publisher.publish(value);
        }
        Ok(())
    }
}

/// Consumes the stream mutably: one element, a range of two, a short range,
/// then the close.
struct StreamConsumer;

impl GraphProcessor for StreamConsumer {
    fn setup(&mut self, vertex: &VertexContext) -> Result<()> {
        if let Some(dependency) = vertex.named_dependency("stream") {
            dependency.declare_channel::<i32>();
            dependency.declare_mutable();
        }
        if let Some(emit) = vertex.named_emit("sum") {
            emit.declare_type::<i64>();
        }
        Ok(())
    }

    fn process(&mut self, vertex: &VertexContext) -> Result<()> {
        let dependency = vertex
            .named_dependency("stream")
            .ok_or_else(|| GraphError::Validation("stream missing".to_string()))?;
        let channel = dependency.mutable_channel::<i32>();
        let mut consumer = channel.subscribe();
        if !consumer.valid() {
            return Err(GraphError::Validation("stream not subscribable".to_string()));
        }

        let mut sum = 0_i64;
        let first = consumer
            .consume()
            .ok_or_else(|| GraphError::Validation("stream ended early".to_string()))?;
        *first += 10;
        sum += i64::from(*first);

        let range = consumer.consume_n(2);
        if range.len() != 2 {
            return Err(GraphError::Validation("expected a full range".to_string()));
        }
        sum += i64::from(*range.get(0).expect("in range"));
        sum += i64::from(*range.get(1).expect("in range"));

        let short = consumer.consume_n(2);
        if short.len() != 1 {
            return Err(GraphError::Validation("expected a short range".to_string()));
        }
        sum += i64::from(*short.get(0).expect("in range"));

        if consumer.consume().is_some() {
            return Err(GraphError::Validation("close not observed".to_string()));
        }

        if let Some(emit) = vertex.named_emit("sum") {
            emit.emit::<i64>().set(sum);
        }
        Ok(())
    }
}

#[test]
fn test_channel_stream_and_close() {
    init_logging();
    let mut builder = GraphBuilder::new();
    {
        let vertex = builder.add_vertex(|| Box::new(StreamProducer));
        vertex.set_name("producer");
        vertex.named_emit("stream").to("numbers");
    }
    {
        let vertex = builder.add_vertex(|| Box::new(StreamConsumer));
        vertex.set_name("consumer");
        vertex.named_depend("stream").to("numbers");
        vertex.named_emit("sum").to("sum");
    }
    builder.finish().unwrap();
    let graph = builder.build().unwrap();

    let sum = graph.find_data("sum").unwrap();
    assert_eq!(graph.run(&[sum]).get(), 0);
    // (1 + 10) + 2 + 3 + 4
    assert_eq!(sum.value::<i64>().copied(), Some(20));
}

/// Emits a run-dependent string, keeping slot storage across resets.
struct ShrinkingWriter {
    runs: usize,
}

impl GraphProcessor for ShrinkingWriter {
    fn setup(&mut self, vertex: &VertexContext) -> Result<()> {
        if let Some(emit) = vertex.named_emit("out") {
            if let Some(output) = emit.declare_type::<String>() {
                output.set_on_reset(|text| text.clear());
            }
        }
        Ok(())
    }

    fn process(&mut self, vertex: &VertexContext) -> Result<()> {
        self.runs += 1;
        let text = if self.runs == 1 {
            "the first, considerably longer payload"
        } else {
            "short"
        };
        if let Some(emit) = vertex.named_emit("out") {
            let mut committer = emit.emit::<String>();
            if let Some(slot) = committer.get() {
                slot.push_str(text);
            }
        }
        Ok(())
    }
}

#[test]
fn test_reset_reuses_string_storage() {
    let mut builder = GraphBuilder::new();
    {
        let vertex = builder.add_vertex(|| Box::new(ShrinkingWriter { runs: 0 }));
        vertex.set_name("writer");
        vertex.named_emit("out").to("text");
    }
    builder.finish().unwrap();
    let mut graph = builder.build().unwrap();

    let (buffer, capacity) = {
        let text = graph.find_data("text").unwrap();
        assert_eq!(graph.run(&[text]).get(), 0);
        let value = text.value::<String>().unwrap();
        (value.as_ptr(), value.capacity())
    };

    graph.reset();
    {
        let text = graph.find_data("text").unwrap();
        assert!(!text.ready(), "reset clears readiness");
        assert_eq!(graph.run(&[text]).get(), 0);
        let value = text.value::<String>().unwrap();
        assert_eq!(value, "short");
        assert_eq!(value.as_ptr(), buffer, "storage reused across reset");
        assert!(value.capacity() >= capacity);
    }
}

#[test]
fn test_trivial_chain_runs_iteratively() {
    // A long alias chain executes inline on one thread; draining is
    // iterative, so chain length is not bounded by stack depth.
    let mut builder = GraphBuilder::new();
    for index in 1..=2000 {
        AliasProcessor::apply(
            &mut builder,
            &format!("d{index}"),
            &format!("d{}", index - 1),
        );
    }
    builder.finish().unwrap();
    let graph = builder.build().unwrap();

    feed_i64(&graph, "d0", 7);
    let tail = graph.find_data("d2000").unwrap();
    assert_eq!(graph.run(&[tail]).get(), 0);
    assert_eq!(tail.as_primitive::<i64>(), 7);
}

/// Counts its invocations; used to pin down once-per-run semantics.
struct CountingProducer {
    calls: Arc<AtomicUsize>,
}

impl GraphProcessor for CountingProducer {
    fn setup(&mut self, vertex: &VertexContext) -> Result<()> {
        if let Some(emit) = vertex.named_emit("out") {
            emit.declare_type::<i64>();
        }
        Ok(())
    }

    fn process(&mut self, vertex: &VertexContext) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(emit) = vertex.named_emit("out") {
            emit.emit::<i64>().set(1);
        }
        Ok(())
    }
}

#[test]
fn test_shared_producer_processes_once() {
    struct IntReader;
    impl GraphProcessor for IntReader {
        fn setup(&mut self, vertex: &VertexContext) -> Result<()> {
            if let Some(dependency) = vertex.named_dependency("input") {
                dependency.declare_type::<i64>();
            }
            if let Some(emit) = vertex.named_emit("out") {
                emit.declare_type::<i64>();
            }
            Ok(())
        }
        fn process(&mut self, vertex: &VertexContext) -> Result<()> {
            let seen = vertex
                .named_dependency("input")
                .map(|dependency| dependency.as_primitive::<i64>())
                .unwrap_or(0);
            if let Some(emit) = vertex.named_emit("out") {
                emit.emit::<i64>().set(seen);
            }
            Ok(())
        }
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let mut builder = GraphBuilder::new();
    {
        let counted = calls.clone();
        let vertex = builder.add_vertex(move || {
            Box::new(CountingProducer {
                calls: counted.clone(),
            })
        });
        vertex.set_name("shared");
        vertex.named_emit("out").to("shared_value");
    }
    for index in 1..=2 {
        let vertex = builder.add_vertex(|| Box::new(IntReader));
        vertex.set_name(format!("consumer{index}"));
        vertex.named_depend("input").to("shared_value");
        vertex.named_emit("out").to(format!("out{index}").as_str());
    }
    builder.finish().unwrap();
    let graph = builder.build().unwrap();

    let out1 = graph.find_data("out1").unwrap();
    let out2 = graph.find_data("out2").unwrap();
    assert_eq!(graph.run(&[out1, out2]).get(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1, "one process per run");
}

/// Completes its vertex closure from a spawned thread.
struct AsyncDoubler;

impl GraphProcessor for AsyncDoubler {
    fn setup(&mut self, vertex: &VertexContext) -> Result<()> {
        if let Some(dependency) = vertex.named_dependency("input") {
            dependency.declare_type::<i64>();
        }
        if let Some(emit) = vertex.named_emit("output") {
            emit.declare_type::<i64>();
        }
        Ok(())
    }

    fn process_async(&mut self, vertex: &VertexContext, closure: GraphVertexClosure) {
        let input = vertex
            .named_dependency("input")
            .and_then(|dependency| dependency.value::<i64>())
            .copied()
            .unwrap_or(0);
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            if let Some(output) = closure.named_emit("output") {
                output.emit::<i64>().set(input * 2);
            }
            closure.done(0);
        });
    }
}

#[test]
fn test_async_completion_from_another_thread() {
    init_logging();
    let mut builder = GraphBuilder::new();
    {
        let vertex = builder.add_vertex(|| Box::new(AsyncDoubler));
        vertex.set_name("async_doubler");
        vertex.named_depend("input").to("in");
        vertex.named_emit("output").to("out");
    }
    builder.finish().unwrap();
    let graph = builder.build().unwrap();

    feed_i64(&graph, "in", 21);
    let out = graph.find_data("out").unwrap();
    let closure = graph.run(&[out]);
    assert_eq!(closure.get(), 0);
    closure.wait();
    assert_eq!(out.value::<i64>().copied(), Some(42));
}

/// Publishes the empty value.
struct EmptyProducer;

impl GraphProcessor for EmptyProducer {
    fn setup(&mut self, vertex: &VertexContext) -> Result<()> {
        if let Some(emit) = vertex.named_emit("out") {
            emit.declare_type::<String>();
        }
        Ok(())
    }

    fn process(&mut self, vertex: &VertexContext) -> Result<()> {
        if let Some(emit) = vertex.named_emit("out") {
            let mut committer = emit.emit::<String>();
            committer.clear();
        }
        Ok(())
    }
}

fn essential_graph(level: Essential) -> anyflow_core::Graph {
    struct LeveledConsumer {
        level: Essential,
    }

    impl GraphProcessor for LeveledConsumer {
        fn setup(&mut self, vertex: &VertexContext) -> Result<()> {
            if let Some(dependency) = vertex.named_dependency("input") {
                dependency.declare_type::<String>();
                dependency.declare_essential(self.level);
            }
            if let Some(emit) = vertex.named_emit("out") {
                emit.declare_type::<i64>();
            }
            Ok(())
        }

        fn process(&mut self, vertex: &VertexContext) -> Result<()> {
            let length = vertex
                .named_dependency("input")
                .and_then(|dependency| dependency.value::<String>())
                .map(|text| text.len() as i64)
                .unwrap_or(-7);
            if let Some(emit) = vertex.named_emit("out") {
                emit.emit::<i64>().set(length);
            }
            Ok(())
        }
    }

    let mut builder = GraphBuilder::new();
    {
        let vertex = builder.add_vertex(|| Box::new(EmptyProducer));
        vertex.set_name("empty_producer");
        vertex.named_emit("out").to("E");
    }
    {
        let vertex = builder.add_vertex(move || Box::new(LeveledConsumer { level }));
        vertex.set_name("consumer");
        vertex.named_depend("input").to("E");
        vertex.named_emit("out").to("out");
    }
    builder.finish().unwrap();
    builder.build().unwrap()
}

#[test]
fn test_optional_dependency_sees_missing_value() {
    let graph = essential_graph(Essential::Optional);
    let out = graph.find_data("out").unwrap();
    assert_eq!(graph.run(&[out]).get(), 0);
    assert_eq!(out.value::<i64>().copied(), Some(-7), "fallback path taken");
}

#[test]
fn test_skip_on_empty_flushes_emits() {
    let graph = essential_graph(Essential::SkipOnEmpty);
    let out = graph.find_data("out").unwrap();
    assert_eq!(graph.run(&[out]).get(), 0);
    assert!(out.ready());
    assert!(out.empty(), "skipped vertex publishes empty");
}

#[test]
fn test_fail_on_empty_fails_the_run() {
    let graph = essential_graph(Essential::FailOnEmpty);
    let out = graph.find_data("out").unwrap();
    assert_eq!(graph.run(&[out]).get(), -1);
}

#[test]
fn test_declared_types_must_agree_across_vertices() {
    struct IntDeclarer;
    impl GraphProcessor for IntDeclarer {
        fn setup(&mut self, vertex: &VertexContext) -> Result<()> {
            if let Some(emit) = vertex.named_emit("out") {
                emit.declare_type::<i64>();
            }
            Ok(())
        }
    }
    struct StringExpecter;
    impl GraphProcessor for StringExpecter {
        fn setup(&mut self, vertex: &VertexContext) -> Result<()> {
            if let Some(dependency) = vertex.named_dependency("input") {
                dependency.declare_type::<String>();
            }
            Ok(())
        }
    }

    let mut builder = GraphBuilder::new();
    {
        let vertex = builder.add_vertex(|| Box::new(IntDeclarer));
        vertex.set_name("producer");
        vertex.named_emit("out").to("T");
    }
    {
        let vertex = builder.add_vertex(|| Box::new(StringExpecter));
        vertex.set_name("consumer");
        vertex.named_depend("input").to("T");
        vertex.named_emit("sink").to("sink");
    }
    builder.finish().unwrap();
    match builder.build() {
        Err(GraphError::TypeConflict { data, .. }) => assert_eq!(data, "T"),
        other => panic!("expected type conflict, got {other:?}"),
    }
}

#[test]
fn test_thread_pool_executor_runs_graph() {
    init_logging();
    let executor = Arc::new(ThreadPoolGraphExecutor::new(4, 256));
    let mut builder = GraphBuilder::new();
    builder.set_executor(executor);
    add_binary(&mut builder, "sum", |a, b| a + b, "A", "B", "Sum");
    add_binary(&mut builder, "diff", |a, b| a - b, "A", "B", "Diff");
    add_binary(&mut builder, "product", |a, b| a * b, "Sum", "Diff", "FinalRes");
    builder.finish().unwrap();
    let mut graph = builder.build().unwrap();

    for round in 1..=3 {
        feed_i64(&graph, "A", 10 * round);
        feed_i64(&graph, "B", 5);
        {
            let result = graph.find_data("FinalRes").unwrap();
            let closure = graph.run(&[result]);
            assert_eq!(closure.get(), 0);
            closure.wait();
            assert_eq!(
                result.value::<i64>().copied(),
                Some((10 * round) * (10 * round) - 25)
            );
        }
        graph.reset();
    }
}

#[test]
fn test_processor_error_code_propagates() {
    struct Failing;
    impl GraphProcessor for Failing {
        fn setup(&mut self, vertex: &VertexContext) -> Result<()> {
            if let Some(emit) = vertex.named_emit("out") {
                emit.declare_type::<i64>();
            }
            Ok(())
        }
        fn process(&mut self, _vertex: &VertexContext) -> Result<()> {
            Err(GraphError::Processor(42))
        }
    }

    let mut builder = GraphBuilder::new();
    {
        let vertex = builder.add_vertex(|| Box::new(Failing));
        vertex.set_name("failing");
        vertex.named_emit("out").to("X");
    }
    builder.finish().unwrap();
    let graph = builder.build().unwrap();

    let x = graph.find_data("X").unwrap();
    assert_eq!(graph.run(&[x]).get(), 42, "application code is latched");
}

#[test]
fn test_on_finish_callback_delivery() {
    let mut builder = GraphBuilder::new();
    add_binary(&mut builder, "sum", |a, b| a + b, "A", "B", "Sum");
    builder.finish().unwrap();
    let graph = builder.build().unwrap();

    feed_i64(&graph, "A", 2);
    feed_i64(&graph, "B", 3);
    let observed = Arc::new(AtomicUsize::new(0));
    let seen = observed.clone();
    let sum = graph.find_data("Sum").unwrap();
    graph.run(&[sum]).on_finish(move |closure| {
        assert_eq!(closure.error_code(), 0);
        seen.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(observed.load(Ordering::SeqCst), 1);
    assert_eq!(sum.value::<i64>().copied(), Some(5));
}

#[test]
fn test_alias_of_preset_input() {
    let mut builder = GraphBuilder::new();
    AliasProcessor::apply(&mut builder, "renamed", "request");
    builder.finish().unwrap();
    let graph = builder.build().unwrap();

    let mut request = String::from("external buffer");
    let buffer = request.as_ptr();
    {
        let data = graph.find_data("request").unwrap();
        // SAFETY: `request` outlives the run and is not touched during it.
        unsafe { data.preset(&mut request) };
        let mut committer = data.emit::<String>();
        committer.get().unwrap().push_str(", extended");
        drop(committer);

        let renamed = graph.find_data("renamed").unwrap();
        assert_eq!(graph.run(&[renamed]).get(), 0);
        let through_alias = renamed.value::<String>().unwrap();
        assert_eq!(through_alias.as_ptr(), buffer, "alias sees the preset buffer");
    }
    assert_eq!(request, "external buffer, extended");
}

#[test]
fn test_reset_releases_graph_memory() {
    let mut builder = GraphBuilder::new();
    add_binary(&mut builder, "sum", |a, b| a + b, "A", "B", "Sum");
    builder.finish().unwrap();
    let mut graph = builder.build().unwrap();

    {
        let scratch = graph.create_object(vec![0_u8; 1024]);
        assert_eq!(scratch.len(), 1024);
        assert_eq!(graph.memory_resource().len(), 1);

        feed_i64(&graph, "A", 1);
        feed_i64(&graph, "B", 2);
        let sum = graph.find_data("Sum").unwrap();
        assert_eq!(graph.run(&[sum]).get(), 0);
    }

    graph.reset();
    assert!(graph.memory_resource().is_empty());
    assert!(!graph.find_data("Sum").unwrap().ready());
}

use graphcore::{
    Arguments, ArtifactCell, ArtifactType, ExecutionContext, GraphError, GraphNode, Operation,
    OperationDescriptor, Outputs, ParameterSpec, ResultHandle, ValueType, EXECUTOR_PARAMETER,
    OUTPUT_PARAMETER, SELF_SLOT,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
struct Layer(Vec<i64>);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

// new Layer(size, fill)
fn layer_constructor(calls: Arc<AtomicUsize>) -> Arc<Operation> {
    let descriptor = OperationDescriptor::new("layer")
        .with_parameter(ParameterSpec::literal("size", ValueType::Int))
        .with_parameter(ParameterSpec::literal("fill", ValueType::Int).with_default(0i64))
        .with_output(SELF_SLOT, ArtifactType::of::<Layer>());

    let operation = Operation::constructor(
        descriptor,
        Arc::new(move |args: &Arguments<'_>| {
            calls.fetch_add(1, Ordering::SeqCst);
            let size = args.int("size")? as usize;
            let fill = args.int("fill")?;
            Ok(Outputs::new().with(SELF_SLOT, Layer(vec![fill; size])))
        }),
    )
    .unwrap();
    Arc::new(operation)
}

// Layer.grow(amount): adds `amount` to every cell in place
fn grow_method() -> Arc<Operation> {
    let descriptor = OperationDescriptor::new("grow")
        .with_parameter(ParameterSpec::exclusive::<Layer>(EXECUTOR_PARAMETER))
        .with_parameter(ParameterSpec::literal("amount", ValueType::Int))
        .with_output(SELF_SLOT, ArtifactType::of::<Layer>());

    let operation = Operation::method(
        descriptor,
        true,
        Arc::new(|args: &Arguments<'_>| {
            let amount = args.int("amount")?;
            args.receiver()?
                .write(|layer: &mut Layer| layer.0.iter_mut().for_each(|v| *v += amount))?;
            Ok(Outputs::new())
        }),
    )
    .unwrap();
    Arc::new(operation)
}

// new Layer(other.sum()) from a shared snapshot
fn sum_constructor() -> Arc<Operation> {
    let descriptor = OperationDescriptor::new("sum")
        .with_parameter(ParameterSpec::artifact::<Layer>("other"))
        .with_output(SELF_SLOT, ArtifactType::of::<Layer>());

    let operation = Operation::constructor(
        descriptor,
        Arc::new(|args: &Arguments<'_>| {
            let other = args.shared::<Layer>("other")?;
            Ok(Outputs::new().with(SELF_SLOT, Layer(vec![other.0.iter().sum()])))
        }),
    )
    .unwrap();
    Arc::new(operation)
}

fn layer_node(size: &str) -> Arc<GraphNode> {
    let node = Arc::new(GraphNode::new(layer_constructor(Arc::new(AtomicUsize::new(0)))));
    node.set_parameter("size", size).unwrap();
    node
}

#[test]
fn test_results_are_memoized() {
    init_tracing();
    let calls = Arc::new(AtomicUsize::new(0));
    let node = GraphNode::new(layer_constructor(calls.clone()));
    node.set_parameter("size", "3").unwrap();
    let ctx = ExecutionContext::new(1);

    assert!(node.prepare_results(&ctx, true).unwrap());
    let first = node.get_result(SELF_SLOT).unwrap();
    assert!(node.prepare_results(&ctx, true).unwrap());
    let second = node.get_result(SELF_SLOT).unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1, "operation should run once");
    assert!(first.ptr_eq(&second), "same live artifact both times");
    assert_eq!(first.get::<Layer>().unwrap(), Layer(vec![0, 0, 0]));
}

#[test]
fn test_concurrent_prepare_computes_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let node = Arc::new(GraphNode::new(layer_constructor(calls.clone())));
    node.set_parameter("size", "8").unwrap();
    let ctx = Arc::new(ExecutionContext::new(1));

    let threads: Vec<_> = (0..8)
        .map(|_| {
            let node = node.clone();
            let ctx = ctx.clone();
            std::thread::spawn(move || node.prepare_results(&ctx, true).unwrap())
        })
        .collect();
    for thread in threads {
        assert!(thread.join().unwrap());
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_reading_before_compute_is_illegal_state() {
    let node = layer_node("2");
    assert!(matches!(node.get_result(SELF_SLOT), Err(GraphError::IllegalState(_))));
    assert!(matches!(node.get_immutable_result(SELF_SLOT), Err(GraphError::IllegalState(_))));

    node.prepare_results(&ExecutionContext::default(), true).unwrap();
    assert!(matches!(node.get_result("missing"), Err(GraphError::IllegalState(_))));
}

#[test]
fn test_is_defined_is_pure() {
    let calls = Arc::new(AtomicUsize::new(0));
    let node = GraphNode::new(layer_constructor(calls.clone()));
    let ctx = ExecutionContext::new(1);

    assert!(!node.is_defined(&ctx), "size is unbound");
    node.set_parameter("size", "width * 2").unwrap();
    assert!(!node.is_defined(&ctx), "width is not defined yet");
    ctx.define("width", 4i64);
    assert!(node.is_defined(&ctx));

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(!node.is_computed());
}

#[test]
fn test_empty_required_literal_fails_naming_parameter() {
    let node = GraphNode::new(layer_constructor(Arc::new(AtomicUsize::new(0))));
    node.set_parameter("size", "").unwrap();
    let err = node.prepare_results(&ExecutionContext::default(), true).unwrap_err();

    match err {
        GraphError::Computation { parameter, node: id, .. } => {
            assert_eq!(parameter, "size");
            assert_eq!(id, node.id().to_string());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!node.is_computed());
}

#[test]
fn test_lenient_skip_leaves_node_uncomputed() {
    let node = GraphNode::new(layer_constructor(Arc::new(AtomicUsize::new(0))));
    let computed = node.prepare_results(&ExecutionContext::default(), false).unwrap();
    assert!(!computed);
    assert!(!node.is_computed());
}

#[test]
fn test_exclusive_consumer_mutates_producer_live_result() {
    let producer = layer_node("2");
    let method = Arc::new(GraphNode::new(grow_method()));
    method.bind(EXECUTOR_PARAMETER, &producer, SELF_SLOT).unwrap();
    method.set_parameter("amount", "5").unwrap();
    let ctx = ExecutionContext::default();

    producer.prepare_results(&ctx, true).unwrap();
    method.prepare_results(&ctx, true).unwrap();

    let live = producer.get_result(SELF_SLOT).unwrap();
    assert!(live.ptr_eq(&method.get_result(SELF_SLOT).unwrap()));
    assert_eq!(live.get::<Layer>().unwrap(), Layer(vec![5, 5]));

    let before = producer.get_immutable_result(SELF_SLOT).unwrap();
    assert_eq!(before.downcast_ref::<Layer>(), Some(&Layer(vec![0, 0])));
}

#[test]
fn test_shared_consumer_sees_snapshot() {
    let producer = layer_node("3");
    let consumer = Arc::new(GraphNode::new(sum_constructor()));
    consumer.bind("other", &producer, SELF_SLOT).unwrap();
    let ctx = ExecutionContext::default();

    producer.prepare_results(&ctx, true).unwrap();
    producer
        .get_result(SELF_SLOT)
        .unwrap()
        .write(|layer: &mut Layer| layer.0[0] = 100)
        .unwrap();
    consumer.prepare_results(&ctx, true).unwrap();

    let sum = consumer.get_result(SELF_SLOT).unwrap().get::<Layer>().unwrap();
    assert_eq!(sum, Layer(vec![0]), "consumer reads the snapshot taken at compute time");
}

#[test]
fn test_set_parameter_validation() {
    let producer = layer_node("1");
    let method = Arc::new(GraphNode::new(grow_method()));

    assert!(matches!(
        method.set_parameter("nope", "1"),
        Err(GraphError::InvalidArgument(_))
    ));
    assert!(matches!(
        method.set_parameter(EXECUTOR_PARAMETER, "1"),
        Err(GraphError::InvalidArgument(_))
    ));

    let handle = ResultHandle::new(&producer, SELF_SLOT, EXECUTOR_PARAMETER).unwrap();
    assert!(matches!(
        method.set_parameter("amount", handle.clone()),
        Err(GraphError::InvalidArgument(_))
    ));

    let wrong_name = ResultHandle::new(&producer, SELF_SLOT, "other").unwrap();
    assert!(method.set_parameter(EXECUTOR_PARAMETER, wrong_name).is_err());

    assert!(ResultHandle::new(&producer, "missing", EXECUTOR_PARAMETER).is_err());
    method.set_parameter(EXECUTOR_PARAMETER, handle).unwrap();
}

#[test]
fn test_exclusive_parameter_cannot_be_rebound_without_clearing() {
    let first = layer_node("1");
    let second = layer_node("1");
    let method = Arc::new(GraphNode::new(grow_method()));

    method.bind(EXECUTOR_PARAMETER, &first, SELF_SLOT).unwrap();
    method.bind(EXECUTOR_PARAMETER, &first, SELF_SLOT).unwrap();
    assert!(matches!(
        method.bind(EXECUTOR_PARAMETER, &second, SELF_SLOT),
        Err(GraphError::IllegalState(_))
    ));

    method.clear_parameter(EXECUTOR_PARAMETER).unwrap();
    method.bind(EXECUTOR_PARAMETER, &second, SELF_SLOT).unwrap();
    assert_eq!(method.edges()[0].producer, *second.id());
}

#[test]
fn test_copy_keeps_literals_only() {
    let producer = layer_node("1");
    let method = GraphNode::new(grow_method());
    method.bind(EXECUTOR_PARAMETER, &producer, SELF_SLOT).unwrap();
    method.set_parameter("amount", "3").unwrap();
    let ctx = ExecutionContext::default();
    producer.prepare_results(&ctx, true).unwrap();
    method.prepare_results(&ctx, true).unwrap();

    let copy = method.copy();
    assert_ne!(copy.id(), method.id());
    assert!(!copy.is_computed());
    assert!(copy.edges().is_empty());
    assert!(matches!(
        copy.parameter("amount").unwrap(),
        graphcore::Binding::Expression(ref e) if e == "3"
    ));
}

#[test]
fn test_failed_operation_publishes_nothing() {
    let descriptor = OperationDescriptor::new("broken")
        .with_output(SELF_SLOT, ArtifactType::of::<Layer>())
        .with_output("extra", ArtifactType::of::<Layer>());
    let operation = Operation::factory(
        descriptor,
        Arc::new(|_: &Arguments<'_>| Ok(Outputs::new().with(SELF_SLOT, Layer(vec![])))),
    )
    .unwrap();
    let node = GraphNode::new(Arc::new(operation));

    let err = node.prepare_results(&ExecutionContext::default(), true).unwrap_err();
    assert!(matches!(err, GraphError::Invocation { .. }));
    assert!(!node.is_computed());
    assert!(node.get_result(SELF_SLOT).is_err());
}

#[test]
fn test_input_and_output_nodes() {
    let ty = ArtifactType::of::<Layer>();
    let input = Arc::new(GraphNode::new(Arc::new(Operation::input("layer.input", ty))));
    let output = Arc::new(GraphNode::new(Arc::new(Operation::output("layer.output", ty))));
    output.bind(OUTPUT_PARAMETER, &input, SELF_SLOT).unwrap();
    let ctx = ExecutionContext::default();

    assert!(!input.is_defined(&ctx), "nothing injected yet");
    assert!(input.inject(ArtifactCell::new("wrong type".to_string())).is_err());
    input.inject(ArtifactCell::new(Layer(vec![7]))).unwrap();

    input.prepare_results(&ctx, true).unwrap();
    output.prepare_results(&ctx, true).unwrap();

    let captured = output.captured().unwrap();
    assert_eq!(captured.downcast_ref::<Layer>(), Some(&Layer(vec![7])));
    assert!(output.result_slots().is_empty());
}

#[test]
fn test_reset_allows_recompute() {
    let calls = Arc::new(AtomicUsize::new(0));
    let node = GraphNode::new(layer_constructor(calls.clone()));
    node.set_parameter("size", "1").unwrap();
    let ctx = ExecutionContext::default();

    node.prepare_results(&ctx, true).unwrap();
    node.reset();
    assert!(!node.is_computed());
    node.prepare_results(&ctx, true).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_describe_lists_bindings() {
    let producer = layer_node("2");
    let method = GraphNode::new(grow_method());
    method.bind(EXECUTOR_PARAMETER, &producer, SELF_SLOT).unwrap();

    let summary = method.describe();
    assert_eq!(summary.kind, "method");
    assert_eq!(summary.executable, "Layer.grow");
    assert_eq!(summary.parameters[0].binding, Some(format!("{}.self", producer.id())));
    assert_eq!(summary.parameters[1].binding, None);
}

// new Layer([size, base.sum() or -1, offset or -1]); base and offset may be absent
fn patch_constructor() -> Arc<Operation> {
    let descriptor = OperationDescriptor::new("patch")
        .with_parameter(ParameterSpec::literal("size", ValueType::Int))
        .with_parameter(ParameterSpec::artifact::<Layer>("base").nullable())
        .with_parameter(ParameterSpec::literal("offset", ValueType::Int).nullable())
        .with_output(SELF_SLOT, ArtifactType::of::<Layer>());

    let operation = Operation::constructor(
        descriptor,
        Arc::new(|args: &Arguments<'_>| {
            let base = match args.optional_shared::<Layer>("base")? {
                Some(layer) => layer.0.iter().sum(),
                None => -1,
            };
            let offset = args.optional_int("offset")?.unwrap_or(-1);
            Ok(Outputs::new().with(SELF_SLOT, Layer(vec![args.int("size")?, base, offset])))
        }),
    )
    .unwrap();
    Arc::new(operation)
}

#[test]
fn test_unbound_nullable_parameters_resolve_to_null() {
    let ctx = ExecutionContext::new(1);
    let node = GraphNode::new(patch_constructor());
    node.set_parameter("size", "2").unwrap();

    assert!(node.is_defined(&ctx), "unbound nullable artifact and literal are allowed");
    assert_eq!(node.first_undefined(&ctx), None);

    node.prepare_results(&ctx, true).unwrap();
    let result = node.get_result(SELF_SLOT).unwrap().get::<Layer>().unwrap();
    assert_eq!(result, Layer(vec![2, -1, -1]));
}

#[test]
fn test_nullable_literal_evaluating_to_null_is_passed_as_null() {
    let ctx = ExecutionContext::new(1);
    let node = GraphNode::new(patch_constructor());
    node.set_parameter("size", "2").unwrap();
    node.set_parameter("offset", "null").unwrap();
    assert!(node.is_defined(&ctx));

    node.prepare_results(&ctx, true).unwrap();
    let result = node.get_result(SELF_SLOT).unwrap().get::<Layer>().unwrap();
    assert_eq!(result, Layer(vec![2, -1, -1]));

    // The same expression on a required parameter leaves the node undefined.
    let required = GraphNode::new(patch_constructor());
    required.set_parameter("size", "null").unwrap();
    assert!(!required.is_defined(&ctx));
    match required.prepare_results(&ctx, true) {
        Err(GraphError::Computation { parameter, reason, .. }) => {
            assert_eq!(parameter, "size");
            assert!(reason.contains("null"), "{reason}");
        }
        other => panic!("expected computation error, got {other:?}"),
    }
}

#[test]
fn test_bound_nullable_artifact_is_resolved() {
    let ctx = ExecutionContext::new(1);
    let base = layer_node("3");
    base.set_parameter("fill", "2").unwrap();
    base.prepare_results(&ctx, true).unwrap();

    let node = GraphNode::new(patch_constructor());
    node.set_parameter("size", "1").unwrap();
    node.bind("base", &base, SELF_SLOT).unwrap();
    node.set_parameter("offset", "size_hint").unwrap();
    ctx.define("size_hint", 5i64);

    node.prepare_results(&ctx, true).unwrap();
    let result = node.get_result(SELF_SLOT).unwrap().get::<Layer>().unwrap();
    assert_eq!(result, Layer(vec![1, 6, 5]));
}

#[test]
fn test_toggling_satisfied_parameter_keeps_definedness() {
    let ctx = ExecutionContext::new(1);
    let base = layer_node("1");

    let defined = GraphNode::new(patch_constructor());
    defined.set_parameter("size", "2").unwrap();
    let undefined = GraphNode::new(patch_constructor());

    for node in [&defined, &undefined] {
        let before = node.is_defined(&ctx);
        node.set_parameter("offset", "4").unwrap();
        assert_eq!(node.is_defined(&ctx), before);
        node.clear_parameter("offset").unwrap();
        assert_eq!(node.is_defined(&ctx), before);
        node.bind("base", &base, SELF_SLOT).unwrap();
        assert_eq!(node.is_defined(&ctx), before);
        node.clear_parameter("base").unwrap();
        assert_eq!(node.is_defined(&ctx), before);
    }
    assert!(defined.is_defined(&ctx));
    assert_eq!(undefined.first_undefined(&ctx).map(|(name, _)| name), Some("size".to_string()));
}

#[test]
fn test_typed_literals_survive_binding() {
    let ctx = ExecutionContext::new(1);
    let node = layer_node("1");
    node.set_parameter("fill", i64::MIN).unwrap();
    assert_eq!(node.first_undefined(&ctx), None);
    node.prepare_results(&ctx, true).unwrap();
    assert_eq!(node.get_result(SELF_SLOT).unwrap().get::<Layer>().unwrap(), Layer(vec![i64::MIN]));

    let method = GraphNode::new(grow_method());
    for value in [f64::INFINITY, f64::NEG_INFINITY, f64::NAN] {
        assert!(matches!(
            method.set_parameter("amount", value),
            Err(GraphError::InvalidArgument(_))
        ));
    }
    method.set_parameter("amount", 2.0).unwrap();
    assert_eq!(method.first_undefined(&ctx).map(|(name, _)| name), Some(EXECUTOR_PARAMETER.to_string()));
}

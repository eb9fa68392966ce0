use graphcore::{
    Arguments, ArtifactType, EventBus, GraphError, GraphNode, Operation, OperationDescriptor, Outputs,
    ParameterSpec, PipelineEvent, ValueType, EXECUTOR_PARAMETER, SELF_SLOT,
};
use graphruntime::{EntryState, GenerationRuntime, Graph, RuntimeConfig, RuntimeError, Scheduler, SchedulerError};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

fn scheduler(workers: usize) -> Scheduler {
    Scheduler::new(workers, EventBus::default()).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dependency_runs_first() {
    init_tracing();
    let scheduler = scheduler(4);
    let produced = Arc::new(AtomicBool::new(false));

    let flag = produced.clone();
    let a = scheduler.register("a", &[], move || {
        std::thread::sleep(Duration::from_millis(30));
        flag.store(true, Ordering::SeqCst);
        Ok(())
    });
    let flag = produced.clone();
    let b = scheduler.register("b", &[a.clone()], move || {
        assert!(flag.load(Ordering::SeqCst), "b ran before a finished");
        Ok(())
    });

    scheduler.start();
    scheduler.await_entries(&[a, b]).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_await_blocks_until_terminal() {
    let scheduler = scheduler(2);
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

    let slow = scheduler.register("slow", &[], move || {
        release_rx.recv().map_err(|e| GraphError::IllegalState(e.to_string()))?;
        Ok(())
    });
    scheduler.start();

    let waiting = {
        let scheduler = scheduler.clone();
        let slow = slow.clone();
        tokio::spawn(async move { scheduler.await_entries(&[slow]).await })
    };

    // Unrelated registrations must not release the barrier.
    for i in 0..5 {
        scheduler.register(format!("noise-{i}"), &[], || Ok(()));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiting.is_finished(), "barrier returned while entry was running");
    assert!(matches!(slow.state(), EntryState::Running));

    release_tx.send(()).unwrap();
    waiting.await.unwrap().unwrap();
    assert!(slow.is_terminal());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failure_is_isolated_per_entry() {
    let scheduler = scheduler(4);
    let sibling_ran = Arc::new(AtomicBool::new(false));
    let dependent_ran = Arc::new(AtomicBool::new(false));

    let failing = scheduler.register("failing", &[], || Err(GraphError::IllegalState("boom".to_string())));
    let flag = sibling_ran.clone();
    let sibling = scheduler.register("sibling", &[], move || {
        flag.store(true, Ordering::SeqCst);
        Ok(())
    });
    let flag = dependent_ran.clone();
    let dependent = scheduler.register("dependent", &[failing.clone()], move || {
        flag.store(true, Ordering::SeqCst);
        Ok(())
    });

    scheduler.start();

    assert!(scheduler.await_entries(&[sibling]).await.is_ok());
    assert!(sibling_ran.load(Ordering::SeqCst));

    let err = failing.wait().await.unwrap_err();
    assert!(matches!(err, SchedulerError::EntryFailed { .. }));
    assert!(matches!(err.graph_error(), Some(GraphError::IllegalState(_))));

    assert!(matches!(
        dependent.wait().await,
        Err(SchedulerError::DependencyFailed { .. })
    ));
    assert!(!dependent_ran.load(Ordering::SeqCst));

    match scheduler.join().await {
        Err(SchedulerError::PipelineFailed { failed, .. }) => assert_eq!(failed, 2),
        other => panic!("unexpected join result: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_pool_bounds_concurrency() {
    let scheduler = scheduler(2);
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    for i in 0..8 {
        let running = running.clone();
        let peak = peak.clone();
        scheduler.register(format!("task-{i}"), &[], move || {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(10));
            running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        });
    }

    scheduler.start();
    let report = scheduler.join().await.unwrap();
    assert_eq!(report.completed, 8);
    assert!(peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_reset_discards_unstarted_entries() {
    let scheduler = scheduler(1);
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let stale = scheduler.register("stale", &[], move || {
        flag.store(true, Ordering::SeqCst);
        Ok(())
    });
    let old_run = scheduler.run_id();

    let new_run = scheduler.reset();
    assert_ne!(old_run, new_run);
    assert!(scheduler.entries().is_empty());
    assert!(matches!(stale.wait().await, Err(SchedulerError::Discarded { .. })));

    scheduler.start();
    let report = scheduler.join().await.unwrap();
    assert_eq!(report.completed, 0);
    assert!(!ran.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_panicking_task_is_reported() {
    let scheduler = scheduler(1);
    let entry = scheduler.register("panics", &[], || panic!("kaboom"));
    scheduler.start();

    match entry.wait().await {
        Err(SchedulerError::Panicked { message, .. }) => assert_eq!(message, "kaboom"),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn test_events_follow_entry_lifecycle() {
    let bus = EventBus::new(64);
    let mut rx = bus.subscribe();
    let scheduler = Scheduler::new(1, bus).unwrap();
    scheduler.register("only", &[], || Ok(()));
    scheduler.start();
    scheduler.join().await.unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(match event {
            PipelineEvent::PipelineStarted { .. } => "started",
            PipelineEvent::EntryStarted { .. } => "entry-started",
            PipelineEvent::EntryCompleted { .. } => "entry-completed",
            PipelineEvent::PipelineDrained { .. } => "drained",
            _ => "other",
        });
    }
    assert_eq!(kinds, vec!["started", "entry-started", "entry-completed", "drained"]);
}

#[derive(Debug, Clone, PartialEq)]
struct Buffer(Vec<f64>);

// new Buffer(len) filled with 1.0
fn buffer_constructor() -> Operation {
    Operation::constructor(
        OperationDescriptor::new("buffer")
            .with_parameter(ParameterSpec::literal("len", ValueType::Int))
            .with_output(SELF_SLOT, ArtifactType::of::<Buffer>()),
        Arc::new(|args: &Arguments<'_>| {
            let len = args.int("len")? as usize;
            Ok(Outputs::new().with(SELF_SLOT, Buffer(vec![1.0; len])))
        }),
    )
    .unwrap()
}

// Buffer.scale(factor), in place
fn scale_method() -> Operation {
    Operation::method(
        OperationDescriptor::new("scale")
            .with_parameter(ParameterSpec::exclusive::<Buffer>(EXECUTOR_PARAMETER))
            .with_parameter(ParameterSpec::literal("factor", ValueType::Float))
            .with_output(SELF_SLOT, ArtifactType::of::<Buffer>()),
        true,
        Arc::new(|args: &Arguments<'_>| {
            let factor = args.float("factor")?;
            args.receiver()?
                .write(|b: &mut Buffer| b.0.iter_mut().for_each(|v| *v *= factor))?;
            Ok(Outputs::new())
        }),
    )
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_runtime_runs_graph_in_dependency_order() {
    let runtime = GenerationRuntime::with_config(RuntimeConfig::default().with_workers(2)).unwrap();
    let mut graph = Graph::new();

    let buffer = graph.add(GraphNode::new(Arc::new(buffer_constructor()))).unwrap();
    buffer.set_parameter("len", "n").unwrap();
    let scale = graph.add(GraphNode::new(Arc::new(scale_method()))).unwrap();
    scale.bind(EXECUTOR_PARAMETER, &buffer, SELF_SLOT).unwrap();
    scale.set_parameter("factor", 2.5).unwrap();
    runtime.context().define("n", 3i64);

    let summary = runtime.run(&graph).await.unwrap();
    assert_eq!(summary.entries, 2);
    assert_eq!(summary.computed, 2);

    let result = scale.get_result(SELF_SLOT).unwrap().get::<Buffer>().unwrap();
    assert_eq!(result, Buffer(vec![2.5, 2.5, 2.5]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_strict_run_reports_undefined_node() {
    let runtime = GenerationRuntime::with_config(RuntimeConfig::default()).unwrap();
    let mut graph = Graph::new();
    let buffer = graph.add(GraphNode::new(Arc::new(buffer_constructor()))).unwrap();

    let err = runtime.run(&graph).await.unwrap_err();
    match err {
        RuntimeError::Scheduler(err) => match err.graph_error() {
            Some(GraphError::Computation { parameter, .. }) => assert_eq!(parameter, "len"),
            other => panic!("unexpected cause: {other:?}"),
        },
        other => panic!("unexpected error: {other}"),
    }
    assert!(!buffer.is_computed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lenient_run_skips_undefined_branch() {
    let runtime = GenerationRuntime::with_config(RuntimeConfig::default().lenient()).unwrap();
    let mut events = runtime.subscribe_events();
    let mut graph = Graph::new();

    let buffer = graph.add(GraphNode::new(Arc::new(buffer_constructor()))).unwrap();
    let scale = graph.add(GraphNode::new(Arc::new(scale_method()))).unwrap();
    scale.bind(EXECUTOR_PARAMETER, &buffer, SELF_SLOT).unwrap();
    scale.set_parameter("factor", "1").unwrap();

    let summary = runtime.run(&graph).await.unwrap();
    assert_eq!(summary.computed, 0);
    assert_eq!(summary.skipped, 2);

    let mut skipped = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let PipelineEvent::NodeSkipped { parameter, .. } = event {
            skipped.push(parameter);
        }
    }
    assert_eq!(skipped, vec!["len".to_string(), EXECUTOR_PARAMETER.to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_mutators_of_one_slot_are_rejected() {
    let runtime = GenerationRuntime::with_config(RuntimeConfig::default().with_workers(2)).unwrap();
    let mut graph = Graph::new();

    let buffer = graph.add(GraphNode::new(Arc::new(buffer_constructor()))).unwrap();
    buffer.set_parameter("len", "2").unwrap();
    let triple = graph.add(GraphNode::new(Arc::new(scale_method()))).unwrap();
    triple.bind(EXECUTOR_PARAMETER, &buffer, SELF_SLOT).unwrap();
    triple.set_parameter("factor", 3.0).unwrap();
    let quintuple = graph.add(GraphNode::new(Arc::new(scale_method()))).unwrap();
    quintuple.bind(EXECUTOR_PARAMETER, &buffer, SELF_SLOT).unwrap();
    quintuple.set_parameter("factor", 5.0).unwrap();

    match graph.validate() {
        Err(GraphError::IllegalState(message)) => {
            assert!(message.contains(&buffer.id().to_string()), "{message}");
            assert!(message.contains(&quintuple.id().to_string()), "{message}");
        }
        other => panic!("expected IllegalState, got {other:?}"),
    }

    let err = runtime.run(&graph).await.unwrap_err();
    assert!(matches!(err, RuntimeError::Graph(GraphError::IllegalState(_))));
    assert!(runtime.scheduler().entries().is_empty());
    assert!(!buffer.is_computed());

    // Chaining the second mutator after the first is fine.
    quintuple.clear_parameter(EXECUTOR_PARAMETER).unwrap();
    quintuple.bind(EXECUTOR_PARAMETER, &triple, SELF_SLOT).unwrap();
    runtime.run(&graph).await.unwrap();
    let result = quintuple.get_result(SELF_SLOT).unwrap().get::<Buffer>().unwrap();
    assert_eq!(result, Buffer(vec![15.0, 15.0]));
}

use crate::{Graph, OperationRegistry, RuntimeError, Schedule, Scheduler};
use graphcore::{EventBus, ExecutionContext, PipelineEvent, RunId};
use std::sync::Arc;
use std::time::Instant;

/// Configuration for the runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Maximum entries computing at once.
    pub workers: usize,
    /// Root seed of the execution context.
    pub seed: u64,
    /// Fail on undefined nodes instead of skipping them.
    pub fail_on_undefined: bool,
    pub event_buffer_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            seed: 0,
            fail_on_undefined: true,
            event_buffer_size: 1000,
        }
    }
}

impl RuntimeConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn lenient(mut self) -> Self {
        self.fail_on_undefined = false;
        self
    }

    pub fn with_event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = size;
        self
    }
}

/// What one call to [`GenerationRuntime::run`] did
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: RunId,
    pub entries: usize,
    pub computed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
}

/// Main runtime for running generation graphs
pub struct GenerationRuntime {
    config: RuntimeConfig,
    registry: Arc<OperationRegistry>,
    scheduler: Scheduler,
    event_bus: EventBus,
    context: Arc<ExecutionContext>,
}

impl GenerationRuntime {
    /// Create a new runtime with default settings
    pub fn new() -> Result<Self, RuntimeError> {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a new runtime with custom configuration
    pub fn with_config(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        Self::with_registry(Arc::new(OperationRegistry::new()), config)
    }

    /// Create a new runtime with a pre-configured registry
    pub fn with_registry(registry: Arc<OperationRegistry>, config: RuntimeConfig) -> Result<Self, RuntimeError> {
        let event_bus = EventBus::new(config.event_buffer_size);
        let scheduler = Scheduler::new(config.workers, event_bus.clone())?;
        let context = Arc::new(ExecutionContext::new(config.seed));

        Ok(Self {
            config,
            registry,
            scheduler,
            event_bus,
            context,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Root execution context; draw stage seeds from it while building.
    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.context
    }

    /// Subscribe to pipeline events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Schedules every node of `graph` on a fresh run and starts it,
    /// without waiting. Pair with `Scheduler::await_entries` or `join`.
    pub fn launch(&self, graph: &Graph) -> Result<Schedule, RuntimeError> {
        let run_id = self.scheduler.reset();
        tracing::info!("Launching run {} over {} nodes", run_id, graph.len());

        let schedule = graph.schedule(&self.scheduler, &self.context, self.config.fail_on_undefined)?;
        self.scheduler.start();
        Ok(schedule)
    }

    /// Runs `graph` to completion.
    pub async fn run(&self, graph: &Graph) -> Result<RunSummary, RuntimeError> {
        let started = Instant::now();
        let schedule = self.launch(graph)?;
        let report = self.scheduler.join().await?;

        let computed = graph.nodes().iter().filter(|node| node.is_computed()).count();
        Ok(RunSummary {
            run_id: report.run_id,
            entries: schedule.len(),
            computed,
            skipped: graph.len() - computed,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

use crate::SchedulerError;
use chrono::Utc;
use graphcore::{EventBus, GraphError, PipelineEvent, RunId};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore};
use uuid::Uuid;

/// Where an entry is in its lifecycle.
#[derive(Debug, Clone)]
pub enum EntryState {
    /// Waiting for `start` or for its dependencies.
    Pending,
    Running,
    Done(Result<(), SchedulerError>),
}

impl EntryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EntryState::Done(_))
    }
}

/// Admission gate shared by every entry of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Closed,
    Open,
    Discarded,
}

/// Handle to a registered entry. Cheap to clone; any number of tasks may
/// wait on the same entry.
#[derive(Clone)]
pub struct EntryHandle {
    run_id: RunId,
    index: usize,
    name: Arc<str>,
    state: watch::Receiver<EntryState>,
}

impl EntryHandle {
    /// Sequence index within its run.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn state(&self) -> EntryState {
        self.state.borrow().clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.borrow().is_terminal()
    }

    /// Waits until the entry is terminal and returns its outcome.
    pub async fn wait(&self) -> Result<(), SchedulerError> {
        let mut state = self.state.clone();
        let terminal = state.wait_for(EntryState::is_terminal).await.map(|state| state.clone());
        match terminal {
            Ok(EntryState::Done(result)) => result,
            // Sender dropped without a terminal state: the task never ran.
            _ => Err(self.discarded()),
        }
    }

    fn label(&self) -> String {
        format!("#{} {}", self.index, self.name)
    }

    fn discarded(&self) -> SchedulerError {
        SchedulerError::Discarded { entry: self.label() }
    }
}

impl fmt::Debug for EntryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryHandle")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

struct RunState {
    run_id: RunId,
    gate: watch::Sender<Gate>,
    entries: Vec<EntryHandle>,
    started: Option<Instant>,
}

impl RunState {
    fn new() -> Self {
        let (gate, _) = watch::channel(Gate::Closed);
        Self {
            run_id: Uuid::new_v4(),
            gate,
            entries: Vec::new(),
            started: None,
        }
    }
}

/// Outcome of a drained pipeline
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub run_id: RunId,
    pub completed: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

/// Runs registered entries on a bounded worker pool once their declared
/// dependencies are done.
///
/// Entries registered before [`Scheduler::start`] wait at a gate; entries
/// registered afterwards are admitted immediately. Dependencies are never
/// inferred: an entry only waits for the handles passed to `register`.
/// A failed entry does not affect its siblings, but its dependents fail
/// with `DependencyFailed` without running.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    runtime: Handle,
    workers: usize,
    permits: Arc<Semaphore>,
    events: EventBus,
    run: Mutex<RunState>,
}

impl Scheduler {
    /// Creates a scheduler on the current tokio runtime running at most
    /// `workers` tasks at a time.
    pub fn new(workers: usize, events: EventBus) -> Result<Self, SchedulerError> {
        let runtime = Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;
        let workers = workers.max(1);
        Ok(Self {
            inner: Arc::new(Inner {
                runtime,
                workers,
                permits: Arc::new(Semaphore::new(workers)),
                events,
                run: Mutex::new(RunState::new()),
            }),
        })
    }

    pub fn workers(&self) -> usize {
        self.inner.workers
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Id of the current run; changes on every reset.
    pub fn run_id(&self) -> RunId {
        self.run().run_id
    }

    pub fn is_started(&self) -> bool {
        self.run().started.is_some()
    }

    /// Handles of every entry registered in the current run, in order.
    pub fn entries(&self) -> Vec<EntryHandle> {
        self.run().entries.clone()
    }

    /// Looks an entry of the current run up by name.
    pub fn entry(&self, name: &str) -> Result<EntryHandle, SchedulerError> {
        self.run()
            .entries
            .iter()
            .find(|entry| &*entry.name == name)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownEntry(name.to_string()))
    }

    /// Records `task` to run after every entry in `dependencies` has
    /// completed. Never runs the task synchronously.
    pub fn register<F>(&self, name: impl Into<String>, dependencies: &[EntryHandle], task: F) -> EntryHandle
    where
        F: FnOnce() -> Result<(), GraphError> + Send + 'static,
    {
        let mut run = self.run();
        let (state_tx, state_rx) = watch::channel(EntryState::Pending);
        let handle = EntryHandle {
            run_id: run.run_id,
            index: run.entries.len(),
            name: Arc::from(name.into()),
            state: state_rx,
        };
        run.entries.push(handle.clone());

        let entry = EntryTask {
            handle: handle.clone(),
            dependencies: dependencies.to_vec(),
            gate: run.gate.subscribe(),
            permits: self.inner.permits.clone(),
            events: self.inner.events.clone(),
            state: state_tx,
        };
        drop(run);

        tracing::debug!("Registered entry {} with {} dependencies", entry.handle.label(), dependencies.len());
        self.inner.runtime.spawn(entry.run(task));
        handle
    }

    /// Admits registered work to the worker pool.
    pub fn start(&self) {
        let mut run = self.run();
        if run.started.is_some() {
            return;
        }
        run.started = Some(Instant::now());
        run.gate.send_replace(Gate::Open);

        tracing::info!("Pipeline {} started with {} entries", run.run_id, run.entries.len());
        self.inner.events.emit(PipelineEvent::PipelineStarted {
            run_id: run.run_id,
            entries: run.entries.len(),
            timestamp: Utc::now(),
        });
    }

    /// Barrier: returns once every entry in `entries` is terminal. The
    /// first failure among them, in argument order, is returned.
    pub async fn await_entries(&self, entries: &[EntryHandle]) -> Result<(), SchedulerError> {
        let outcomes = futures::future::join_all(entries.iter().map(EntryHandle::wait)).await;
        outcomes.into_iter().collect()
    }

    /// Waits for the whole pipeline to drain, including entries registered
    /// while it was draining.
    pub async fn join(&self) -> Result<PipelineReport, SchedulerError> {
        let (run_id, started) = {
            let run = self.run();
            (run.run_id, run.started.ok_or(SchedulerError::NotStarted)?)
        };

        let mut waited = 0;
        let mut outcomes = Vec::new();
        loop {
            let pending: Vec<EntryHandle> = self.run().entries.iter().skip(waited).cloned().collect();
            if pending.is_empty() || self.run_id() != run_id {
                break;
            }
            waited += pending.len();
            outcomes.extend(futures::future::join_all(pending.iter().map(EntryHandle::wait)).await);
        }

        let failed = outcomes.iter().filter(|outcome| outcome.is_err()).count();
        let report = PipelineReport {
            run_id,
            completed: outcomes.len() - failed,
            failed,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        tracing::info!(
            "Pipeline {} drained: {} completed, {} failed in {}ms",
            run_id,
            report.completed,
            report.failed,
            report.duration_ms
        );
        self.inner.events.emit(PipelineEvent::PipelineDrained {
            run_id,
            completed: report.completed,
            failed: report.failed,
            duration_ms: report.duration_ms,
            timestamp: Utc::now(),
        });

        match outcomes.into_iter().find_map(Result::err) {
            Some(first) => Err(SchedulerError::PipelineFailed {
                failed,
                first: Box::new(first),
            }),
            None => Ok(report),
        }
    }

    /// Clears all registered entries and begins a new, unstarted run.
    /// Entries still held at the start gate resolve as `Discarded`; admitted
    /// entries run to completion.
    pub fn reset(&self) -> RunId {
        let mut run = self.run();
        run.gate.send_replace(Gate::Discarded);
        let discarded = run.entries.iter().filter(|entry| !entry.is_terminal()).count();
        *run = RunState::new();

        tracing::info!("Pipeline reset, new run {} ({} unfinished entries discarded)", run.run_id, discarded);
        run.run_id
    }

    fn run(&self) -> MutexGuard<'_, RunState> {
        self.inner.run.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let run = self.run();
        f.debug_struct("Scheduler")
            .field("workers", &self.inner.workers)
            .field("run_id", &run.run_id)
            .field("entries", &run.entries.len())
            .field("started", &run.started.is_some())
            .finish()
    }
}

/// Everything a spawned entry needs, moved into its task.
struct EntryTask {
    handle: EntryHandle,
    dependencies: Vec<EntryHandle>,
    gate: watch::Receiver<Gate>,
    permits: Arc<Semaphore>,
    events: EventBus,
    state: watch::Sender<EntryState>,
}

impl EntryTask {
    async fn run<F>(mut self, task: F)
    where
        F: FnOnce() -> Result<(), GraphError> + Send + 'static,
    {
        let outcome = self.execute(task).await;
        if let Err(err) = &outcome {
            if !matches!(err, SchedulerError::Discarded { .. }) {
                self.events.emit(PipelineEvent::EntryFailed {
                    run_id: self.handle.run_id,
                    entry: self.handle.index,
                    name: self.handle.name.to_string(),
                    error: err.to_string(),
                    timestamp: Utc::now(),
                });
            }
        }
        self.state.send_replace(EntryState::Done(outcome));
    }

    async fn execute<F>(&mut self, task: F) -> Result<(), SchedulerError>
    where
        F: FnOnce() -> Result<(), GraphError> + Send + 'static,
    {
        let admitted = matches!(
            self.gate.wait_for(|gate| *gate != Gate::Closed).await.map(|gate| *gate),
            Ok(Gate::Open)
        );
        if !admitted {
            tracing::debug!("Entry {} discarded", self.handle.label());
            return Err(self.handle.discarded());
        }

        for dependency in &self.dependencies {
            if dependency.wait().await.is_err() {
                let err = SchedulerError::DependencyFailed {
                    entry: self.handle.label(),
                    dependency: dependency.label(),
                };
                tracing::warn!("{}", err);
                return Err(err);
            }
        }

        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| self.handle.discarded())?;

        self.state.send_replace(EntryState::Running);
        self.events.emit(PipelineEvent::EntryStarted {
            run_id: self.handle.run_id,
            entry: self.handle.index,
            name: self.handle.name.to_string(),
            timestamp: Utc::now(),
        });

        let started = Instant::now();
        let outcome = tokio::task::spawn_blocking(task).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(())) => {
                tracing::debug!("Entry {} completed in {}ms", self.handle.label(), duration_ms);
                self.events.emit(PipelineEvent::EntryCompleted {
                    run_id: self.handle.run_id,
                    entry: self.handle.index,
                    name: self.handle.name.to_string(),
                    duration_ms,
                    timestamp: Utc::now(),
                });
                Ok(())
            }
            Ok(Err(err)) => {
                tracing::warn!("Entry {} failed: {}", self.handle.label(), err);
                Err(SchedulerError::EntryFailed {
                    entry: self.handle.label(),
                    source: Arc::new(err),
                })
            }
            Err(join_error) => {
                let message = panic_message(join_error);
                tracing::error!("Entry {} panicked: {}", self.handle.label(), message);
                Err(SchedulerError::Panicked {
                    entry: self.handle.label(),
                    message,
                })
            }
        }
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_entries_wait_for_start() {
        let scheduler = Scheduler::new(2, EventBus::default()).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let entry = scheduler.register("count", &[], move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        tokio::task::yield_now().await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(!entry.is_terminal());

        scheduler.start();
        scheduler.await_entries(&[entry]).await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_join_before_start_is_rejected() {
        let scheduler = Scheduler::new(1, EventBus::default()).unwrap();
        assert!(matches!(scheduler.join().await, Err(SchedulerError::NotStarted)));
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        assert!(matches!(
            Scheduler::new(1, EventBus::default()),
            Err(SchedulerError::NoRuntime)
        ));
    }

    #[tokio::test]
    async fn test_lookup_by_name() {
        let scheduler = Scheduler::new(1, EventBus::default()).unwrap();
        scheduler.register("a", &[], || Ok(()));
        assert_eq!(scheduler.entry("a").unwrap().index(), 0);
        assert!(matches!(scheduler.entry("b"), Err(SchedulerError::UnknownEntry(_))));
    }
}

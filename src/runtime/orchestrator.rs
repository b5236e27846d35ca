use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context as AnyhowContext, Result};
use serde::Serialize;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::definition::{ProcessTopics, extract, loader};
use crate::discovery::{ConsulDiscovery, DiscoveryBackend, ServiceRegistry};
use crate::engine::{HttpWorkflowEngine, WorkflowEngine};
use crate::invoke::{ErrorKind, HttpBackend, InvocationResult, Invoker, SandboxBackend, TaskBackend};
use crate::runtime::completer::{Completion, TaskCompleter};
use crate::runtime::lease::LeaseKeeper;
use crate::runtime::poller::TaskPoller;
use crate::runtime::router::TaskRouter;
use crate::runtime::state::{Observation, OrchestratorState, TerminationPolicy, next_state};
use crate::runtime::task::Task;
use crate::runtime::topics::TopicSet;

/// Counters collected over one `run`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrchestratorReport {
    pub cycles: u64,
    pub locked: u64,
    pub completed: u64,
    pub retries_scheduled: u64,
    pub incidents: u64,
    /// Tasks whose lock was lost or whose worker was aborted; never reported.
    pub abandoned: u64,
    /// Outcomes the engine did not accept, plus crashed workers.
    pub errors: u64,
    pub final_state: OrchestratorState,
}

impl OrchestratorReport {
    fn new() -> Self {
        Self {
            cycles: 0,
            locked: 0,
            completed: 0,
            retries_scheduled: 0,
            incidents: 0,
            abandoned: 0,
            errors: 0,
            final_state: OrchestratorState::Bootstrapping,
        }
    }

    pub fn failed(&self) -> u64 {
        self.retries_scheduled + self.incidents
    }

    fn record(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Completed => self.completed += 1,
            TaskOutcome::RetryScheduled => self.retries_scheduled += 1,
            TaskOutcome::Incident => self.incidents += 1,
            TaskOutcome::Abandoned => self.abandoned += 1,
            TaskOutcome::NotReported => self.errors += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskOutcome {
    Completed,
    RetryScheduled,
    Incident,
    Abandoned,
    NotReported,
}

impl From<Completion> for TaskOutcome {
    fn from(completion: Completion) -> Self {
        match completion {
            Completion::Completed => TaskOutcome::Completed,
            Completion::RetryScheduled { .. } => TaskOutcome::RetryScheduled,
            Completion::Incident => TaskOutcome::Incident,
        }
    }
}

/// Route, invoke and report one task. Shared by all workers.
struct Dispatcher {
    router: TaskRouter,
    invoker: Arc<Invoker>,
    completer: TaskCompleter,
    lease: LeaseKeeper,
}

impl Dispatcher {
    async fn process(&self, task: Task, acquired: Instant) -> TaskOutcome {
        tokio::select! {
            _ = self.lease.hold(&task.id, acquired) => TaskOutcome::Abandoned,
            outcome = self.execute(&task) => outcome,
        }
    }

    async fn execute(&self, task: &Task) -> TaskOutcome {
        let result = self.invoke(task).await;
        match self.completer.complete(task, &result).await {
            Ok(completion) => completion.into(),
            Err(_) => TaskOutcome::NotReported,
        }
    }

    /// Tries candidates in round-robin order, moving past open circuits.
    async fn invoke(&self, task: &Task) -> InvocationResult {
        let candidates = match self.router.candidates(task) {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(task_id = %task.id, topic = %task.topic, error = %e, "Routing failed");
                return InvocationResult::failure(e.kind(), e.to_string(), 0);
            }
        };

        let mut last = None;
        for endpoint in candidates {
            let result = self.invoker.invoke(&endpoint, task).await;
            if result.error_kind != Some(ErrorKind::CircuitOpen) {
                return result;
            }
            last = Some(result);
        }
        last.unwrap_or_else(|| InvocationResult::failure(ErrorKind::NoServiceAvailable, "no endpoint accepted the call", 0))
    }
}

pub struct Orchestrator {
    engine: Arc<dyn WorkflowEngine>,
    registry: Arc<ServiceRegistry>,
    poller: TaskPoller,
    dispatcher: Arc<Dispatcher>,
    policy: TerminationPolicy,
    pool_size: usize,
    max_tasks: usize,
    poll_interval: Duration,
    registry_refresh: Duration,
    definition_refresh: Duration,
    definitions_dir: Option<PathBuf>,
    fetch_definitions: bool,
    definitions: Vec<(String, String)>,
    topics: watch::Sender<Arc<TopicSet>>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        engine: Arc<dyn WorkflowEngine>,
        registry: Arc<ServiceRegistry>,
        invoker: Arc<Invoker>,
    ) -> Self {
        let orchestrator = &config.orchestrator;
        let dispatcher = Dispatcher {
            router: TaskRouter::new(registry.clone()),
            invoker,
            completer: TaskCompleter::new(
                engine.clone(),
                orchestrator.default_retries,
                orchestrator.default_retry_delay(),
            ),
            lease: LeaseKeeper::new(engine.clone(), &config.poller),
        };
        let (topics, _) = watch::channel(Arc::new(TopicSet::new()));

        Self {
            poller: TaskPoller::new(engine.clone(), &config.poller),
            engine,
            registry,
            dispatcher: Arc::new(dispatcher),
            policy: TerminationPolicy {
                idle_grace: orchestrator.idle_grace(),
                absolute_timeout: orchestrator.absolute_timeout(),
            },
            pool_size: orchestrator.worker_pool_size.max(1),
            max_tasks: config.poller.max_tasks.max(1),
            poll_interval: config.poller.poll_interval(),
            registry_refresh: config.discovery.refresh_interval(),
            definition_refresh: orchestrator.definition_refresh_interval(),
            definitions_dir: config.definitions_dir.clone(),
            fetch_definitions: config.engine.fetch_definitions,
            definitions: Vec::new(),
            topics,
            shutdown: CancellationToken::new(),
        }
    }

    /// Wires the HTTP engine client, Consul discovery (when configured) and
    /// the invocation backends from configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let engine = HttpWorkflowEngine::new(
            &config.engine.base_url,
            config.engine.worker_id(),
            config.engine.request_timeout(),
        ).context("Failed to build workflow engine client")?;

        let discovery: Option<Arc<dyn DiscoveryBackend>> = match &config.discovery.base_url {
            Some(url) => Some(Arc::new(
                ConsulDiscovery::new(url, config.discovery.request_timeout())
                    .context("Failed to build discovery client")?,
            )),
            None => None,
        };
        let registry = ServiceRegistry::new(discovery, config.static_services(), &config.discovery);

        let http = HttpBackend::new(config.invoker.request_timeout())
            .context("Failed to build service HTTP client")?;
        let sandbox: Option<Arc<dyn TaskBackend>> = if config.sandbox.enabled {
            Some(Arc::new(SandboxBackend::new(config.sandbox.clone())))
        } else {
            None
        };
        let invoker = Invoker::new(Arc::new(http), sandbox, &config.invoker, &config.breaker);

        Ok(Self::new(config, Arc::new(engine), Arc::new(registry), Arc::new(invoker)))
    }

    /// Adds process-definition documents on top of the configured sources.
    pub fn with_definitions(mut self, definitions: Vec<(String, String)>) -> Self {
        self.definitions.extend(definitions);
        self
    }

    /// Cancelling the token moves the orchestrator to Draining.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn topics(&self) -> Arc<TopicSet> {
        self.topics.borrow().clone()
    }

    fn swap_topics(&self, next: TopicSet) {
        self.topics.send_replace(Arc::new(next));
    }

    async fn refresh_definitions(&self) {
        let mut documents = self.definitions.clone();
        if let Some(dir) = &self.definitions_dir {
            match loader::load_definitions_from_dir(dir) {
                Ok(found) => documents.extend(found),
                Err(e) => warn!(error = %format!("{:#}", e), "Failed to load process definitions"),
            }
        }
        if self.fetch_definitions {
            match self.engine.process_definitions().await {
                Ok(found) => documents.extend(found),
                Err(e) => warn!(error = %e, "Failed to fetch process definitions from engine"),
            }
        }

        let extracted: Vec<ProcessTopics> = documents.iter()
            .map(|(id, xml)| {
                let process = extract(xml);
                debug!(definition = %id, topics = process.topics.len(), "Extracted topics");
                process
            })
            .collect();
        let next = self.topics().with_static(&extracted);
        if next.static_topics() != self.topics().static_topics() {
            info!(topics = ?next.static_topics(), "Static topics updated");
        }
        self.swap_topics(next);
    }

    async fn refresh_dynamic(&self) {
        if let Some(active) = self.poller.active_topics().await {
            let current = self.topics();
            if &active != current.dynamic() {
                debug!(topics = ?active, "Active topics changed");
                self.swap_topics(current.with_dynamic(active));
            }
        }
    }

    pub async fn run(&self) -> OrchestratorReport {
        let started = Instant::now();
        let mut report = OrchestratorReport::new();
        let mut state = OrchestratorState::Bootstrapping;
        info!(worker_id = %self.engine.worker_id(), pool = self.pool_size, "Orchestrator starting");

        self.registry.refresh().await;
        let refresh_stop = CancellationToken::new();
        let refresh = self.registry.clone().spawn_refresh(self.registry_refresh, refresh_stop.clone());
        self.refresh_definitions().await;
        self.refresh_dynamic().await;
        let mut definitions_loaded = Instant::now();

        let permits = Arc::new(Semaphore::new(self.pool_size));
        let mut workers: JoinSet<TaskOutcome> = JoinSet::new();
        let mut processed: BTreeSet<String> = BTreeSet::new();
        let mut idle_since: Option<Instant> = None;

        loop {
            while let Some(joined) = workers.try_join_next() {
                record_joined(&mut report, joined);
            }

            let all_topics = self.topics().all();
            let observation = Observation {
                elapsed: started.elapsed(),
                idle_for: idle_since.map(|since| since.elapsed()),
                all_topics_processed: all_topics.is_subset(&processed),
                in_flight: workers.len(),
                shutdown_requested: self.shutdown.is_cancelled(),
            };
            let next = next_state(state, &observation, &self.policy);
            if next != state {
                info!(from = %state, to = %next, in_flight = observation.in_flight, "Orchestrator state change");
                state = next;
            }

            match state {
                OrchestratorState::Terminated => break,
                OrchestratorState::Bootstrapping => continue,
                OrchestratorState::Polling => {
                    report.cycles += 1;
                    if definitions_loaded.elapsed() >= self.definition_refresh {
                        self.refresh_definitions().await;
                        definitions_loaded = Instant::now();
                    }
                    self.refresh_dynamic().await;

                    let topics = self.topics();
                    let polled = topics.all();
                    let free = permits.available_permits().min(self.max_tasks);
                    if free > 0 {
                        let acquired = Instant::now();
                        let tasks = match self.poller.fetch_and_lock(&polled, free).await {
                            // an unreachable engine leaves the idle bookkeeping alone
                            None => Vec::new(),
                            Some(tasks) if tasks.is_empty() => {
                                processed.extend(polled);
                                idle_since.get_or_insert_with(Instant::now);
                                tasks
                            }
                            Some(tasks) => {
                                idle_since = None;
                                tasks
                            }
                        };

                        for mut task in tasks {
                            let Ok(permit) = permits.clone().acquire_owned().await else {
                                break;
                            };
                            report.locked += 1;
                            processed.insert(task.topic.clone());
                            if let Some(hint) = topics.hint(&task.topic) {
                                task.routing.fill_from(hint);
                            }
                            let dispatcher = self.dispatcher.clone();
                            workers.spawn(async move {
                                let _permit = permit;
                                dispatcher.process(task, acquired).await
                            });
                        }
                    }

                    tokio::select! {
                        _ = self.shutdown.cancelled() => {}
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                OrchestratorState::Draining => {
                    tokio::select! {
                        Some(joined) = workers.join_next() => record_joined(&mut report, joined),
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }

        if !workers.is_empty() {
            warn!(in_flight = workers.len(), "Aborting in-flight tasks, their locks will lapse");
            workers.abort_all();
        }
        while let Some(joined) = workers.join_next().await {
            record_joined(&mut report, joined);
        }

        refresh_stop.cancel();
        if let Err(e) = refresh.await {
            error!(error = %e, "Registry refresh loop crashed");
        }

        report.final_state = state;
        info!(
            cycles = report.cycles,
            locked = report.locked,
            completed = report.completed,
            failed = report.failed(),
            abandoned = report.abandoned,
            "Orchestrator stopped"
        );
        report
    }
}

fn record_joined(report: &mut OrchestratorReport, joined: Result<TaskOutcome, tokio::task::JoinError>) {
    match joined {
        Ok(outcome) => report.record(outcome),
        Err(e) if e.is_cancelled() => report.abandoned += 1,
        Err(e) => {
            error!(error = %e, "Worker crashed");
            report.errors += 1;
        }
    }
}

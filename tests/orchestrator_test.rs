use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use async_trait::async_trait;
use serde_json::{Value, json};
use taskwire::config::{Config, StaticService};
use taskwire::definition::extract;
use taskwire::discovery::ServiceRegistry;
use taskwire::engine::memory::TaskStatus;
use taskwire::engine::{EngineError, FetchRequest, InMemoryEngine, TaskFailure, WorkflowEngine};
use taskwire::invoke::{HttpBackend, Invoker};
use taskwire::runtime::{
    LeaseKeeper, Observation, Orchestrator, OrchestratorState, Task, TaskPoller, TerminationPolicy, TopicSet, next_state,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DEFINITION: &str = r#"<definitions xmlns:camunda="http://camunda.org/schema/1.0/bpmn">
  <process id="order">
    <serviceTask id="classify" camunda:topic="classify">
      <extensionElements>
        <camunda:properties>
          <camunda:property name="serviceType" value="ml" />
          <camunda:property name="serviceName" value="classifier" />
        </camunda:properties>
      </extensionElements>
    </serviceTask>
    <serviceTask id="archive" camunda:topic="archive" />
  </process>
</definitions>"#;

fn config(service_url: &str) -> Config {
    let mut config = Config::default();
    config.poller.lock_duration_ms = 2_000;
    config.poller.poll_interval_ms = 20;
    config.poller.max_tasks = 4;
    config.invoker.request_timeout_ms = 5_000;
    config.invoker.base_delay_ms = 10;
    config.invoker.max_delay_ms = 50;
    config.orchestrator.worker_pool_size = 2;
    config.orchestrator.idle_grace_ms = Some(200);
    config.orchestrator.absolute_timeout_ms = Some(20_000);
    config.sandbox.enabled = false;
    config.services = vec![StaticService {
        service_type: "ml".to_string(),
        service_name: "classifier".to_string(),
        version: None,
        base_url: service_url.to_string(),
    }];
    config
}

fn invoker(config: &Config) -> Arc<Invoker> {
    let http = HttpBackend::new(config.invoker.request_timeout()).expect("Failed to build client");
    Arc::new(Invoker::new(Arc::new(http), None, &config.invoker, &config.breaker))
}

fn orchestrator_with(config: &Config, engine: Arc<dyn WorkflowEngine>, invoker: Arc<Invoker>) -> Orchestrator {
    let registry = ServiceRegistry::new(None, config.static_services(), &config.discovery);
    Orchestrator::new(config, engine, Arc::new(registry), invoker)
}

fn orchestrator(config: &Config, engine: InMemoryEngine) -> Orchestrator {
    orchestrator_with(config, Arc::new(engine), invoker(config))
}

/// Engine whose fetchAndLock is down until `recovers_at`.
struct FlakyEngine {
    inner: InMemoryEngine,
    recovers_at: Instant,
}

#[async_trait]
impl WorkflowEngine for FlakyEngine {
    fn worker_id(&self) -> &str {
        self.inner.worker_id()
    }

    async fn fetch_and_lock(&self, request: &FetchRequest) -> Result<Vec<Task>, EngineError> {
        if Instant::now() < self.recovers_at {
            return Err(EngineError::Status { status: 503, body: "engine restarting".to_string() });
        }
        self.inner.fetch_and_lock(request).await
    }

    async fn complete(&self, task_id: &str, variables: &HashMap<String, Value>) -> Result<(), EngineError> {
        self.inner.complete(task_id, variables).await
    }

    async fn fail(&self, task_id: &str, failure: &TaskFailure) -> Result<(), EngineError> {
        self.inner.fail(task_id, failure).await
    }

    async fn extend_lock(&self, task_id: &str, new_duration: Duration) -> Result<(), EngineError> {
        self.inner.extend_lock(task_id, new_duration).await
    }

    async fn active_topics(&self) -> Result<BTreeSet<String>, EngineError> {
        self.inner.active_topics().await
    }

    async fn process_definitions(&self) -> Result<Vec<(String, String)>, EngineError> {
        self.inner.process_definitions().await
    }
}

async fn success_backend(delay: Duration) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/process_task"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"status": "success", "result": {"label": "ok"}}))
                .set_delay(delay),
        )
        .mount(&server)
        .await;
    server
}

#[test]
fn test_state_transitions() {
    let policy = TerminationPolicy {
        idle_grace: Some(Duration::from_secs(1)),
        absolute_timeout: Some(Duration::from_secs(60)),
    };
    let busy = Observation {
        elapsed: Duration::from_secs(5),
        idle_for: None,
        all_topics_processed: true,
        in_flight: 2,
        shutdown_requested: false,
    };

    assert_eq!(next_state(OrchestratorState::Bootstrapping, &busy, &policy), OrchestratorState::Polling);
    assert_eq!(next_state(OrchestratorState::Polling, &busy, &policy), OrchestratorState::Polling);

    let idle_unprocessed = Observation {
        idle_for: Some(Duration::from_secs(5)),
        all_topics_processed: false,
        ..busy
    };
    assert_eq!(next_state(OrchestratorState::Polling, &idle_unprocessed, &policy), OrchestratorState::Polling);

    let briefly_idle = Observation {
        idle_for: Some(Duration::from_millis(500)),
        ..busy
    };
    assert_eq!(next_state(OrchestratorState::Polling, &briefly_idle, &policy), OrchestratorState::Polling);

    let drained = Observation {
        idle_for: Some(Duration::from_secs(2)),
        ..busy
    };
    assert_eq!(next_state(OrchestratorState::Polling, &drained, &policy), OrchestratorState::Draining);
    assert_eq!(next_state(OrchestratorState::Draining, &drained, &policy), OrchestratorState::Draining);
    assert_eq!(
        next_state(OrchestratorState::Draining, &Observation { in_flight: 0, ..drained }, &policy),
        OrchestratorState::Terminated
    );

    let expired = Observation {
        elapsed: Duration::from_secs(61),
        ..busy
    };
    assert_eq!(next_state(OrchestratorState::Polling, &expired, &policy), OrchestratorState::Terminated);
    assert_eq!(next_state(OrchestratorState::Terminated, &busy, &policy), OrchestratorState::Terminated);

    let shutdown = Observation {
        shutdown_requested: true,
        ..busy
    };
    assert_eq!(next_state(OrchestratorState::Polling, &shutdown, &policy), OrchestratorState::Draining);
}

#[test]
fn test_no_idle_grace_polls_forever() {
    let policy = TerminationPolicy::default();
    let idle = Observation {
        elapsed: Duration::from_secs(3_600),
        idle_for: Some(Duration::from_secs(3_600)),
        all_topics_processed: true,
        in_flight: 0,
        shutdown_requested: false,
    };
    assert_eq!(next_state(OrchestratorState::Polling, &idle, &policy), OrchestratorState::Polling);
}

#[test]
fn test_topic_set_is_replaced_not_mutated() {
    let process = extract(DEFINITION);
    let empty = TopicSet::new();
    let with_static = empty.with_static([&process]);
    let with_both = with_static.with_dynamic(BTreeSet::from(["notify".to_string()]));

    assert!(empty.is_empty());
    assert_eq!(with_static.all().len(), 2);
    assert_eq!(
        with_both.all(),
        BTreeSet::from(["archive".to_string(), "classify".to_string(), "notify".to_string()])
    );
    assert_eq!(with_both.hint("classify").and_then(|h| h.service_name.as_deref()), Some("classifier"));
    assert!(with_both.hint("archive").is_none());
}

#[tokio::test]
async fn test_poller_skips_when_nothing_to_poll() {
    let engine = InMemoryEngine::new();
    engine.add_task(Task::new("t1", "classify"));
    let poller = TaskPoller::new(Arc::new(engine.clone()), &Config::default().poller);

    assert_eq!(poller.fetch_and_lock(&BTreeSet::new(), 10).await, Some(Vec::new()));
    let locked = poller.fetch_and_lock(&BTreeSet::from(["classify".to_string()]), 10).await
        .expect("Fetch should reach the engine");
    assert_eq!(locked.len(), 1);
    assert_eq!(poller.active_topics().await, Some(BTreeSet::new()));
}

#[tokio::test]
async fn test_lease_keeper_gives_up_when_lock_is_gone() {
    let engine = InMemoryEngine::new();
    engine.add_task(Task::new("t1", "classify"));
    let mut config = Config::default();
    config.poller.lock_duration_ms = 1_000;
    config.poller.lock_renewal_fraction = 0.1;

    let keeper = LeaseKeeper::new(Arc::new(engine), &config.poller);
    let lost = tokio::time::timeout(Duration::from_secs(2), keeper.hold("t1", tokio::time::Instant::now()))
        .await
        .expect("Lease keeper should give up");
    assert_eq!(lost.task_id, "t1");
}

#[tokio::test]
async fn test_two_workers_process_every_task_once() {
    let server = success_backend(Duration::from_millis(20)).await;
    let config = config(&server.uri());

    let engine = InMemoryEngine::new();
    engine.deploy("order", DEFINITION);
    for i in 0..6 {
        // half carry routing metadata, half rely on the definition's hints
        let task = Task::new(format!("t{}", i), "classify");
        let task = if i % 2 == 0 { task.with_routing("ml", "classifier", None) } else { task };
        engine.add_task(task);
    }

    let first = orchestrator(&config, engine.worker("w1"));
    let second = orchestrator(&config, engine.worker("w2"));
    let (a, b) = tokio::join!(first.run(), second.run());

    assert_eq!(a.final_state, OrchestratorState::Terminated);
    assert_eq!(b.final_state, OrchestratorState::Terminated);
    assert_eq!(a.completed + b.completed, 6);
    assert_eq!(a.locked + b.locked, 6);
    for i in 0..6 {
        let id = format!("t{}", i);
        assert!(matches!(engine.status(&id), Some(TaskStatus::Completed(_))), "task {} not completed", id);
        assert_eq!(engine.times_locked(&id), 1, "task {} locked more than once", id);
    }
    assert_eq!(server.received_requests().await.map_or(0, |r| r.len()), 6);
}

#[tokio::test]
async fn test_unroutable_task_raises_incident() {
    let server = success_backend(Duration::ZERO).await;
    let config = config(&server.uri());

    let engine = InMemoryEngine::new();
    engine.add_task(Task::new("lost", "unknown-topic"));

    let report = orchestrator(&config, engine.clone()).run().await;
    assert_eq!(report.incidents, 1);
    assert_eq!(report.completed, 0);
    assert!(matches!(engine.status("lost"), Some(TaskStatus::Incident { .. })));
    assert!(server.received_requests().await.map_or(true, |r| r.is_empty()));
}

#[tokio::test]
async fn test_slow_invocation_keeps_lock_alive() {
    let server = success_backend(Duration::from_millis(1_500)).await;
    let mut config = config(&server.uri());
    config.poller.lock_duration_ms = 1_000;
    config.poller.lock_renewal_fraction = 0.4;

    let engine = InMemoryEngine::new();
    engine.add_task(Task::new("slow", "classify").with_routing("ml", "classifier", None));

    let report = orchestrator(&config, engine.worker("owner")).run().await;

    assert_eq!(report.completed, 1);
    assert_eq!(report.abandoned, 0);
    assert_eq!(engine.times_locked("slow"), 1);
}

#[tokio::test]
async fn test_transient_failure_schedules_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/process_task"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    let mut config = config(&server.uri());
    config.invoker.max_retries = 1;
    config.orchestrator.default_retry_delay_ms = 60_000;

    let engine = InMemoryEngine::new();
    engine.add_task(Task::new("flaky", "classify").with_routing("ml", "classifier", None));

    let report = orchestrator(&config, engine.clone()).run().await;
    assert_eq!(report.retries_scheduled, 1);
    assert_eq!(report.failed(), 1);
    assert_eq!(engine.retries("flaky"), Some(2));
    assert_eq!(engine.status("flaky"), Some(TaskStatus::Open));
    assert_eq!(server.received_requests().await.map_or(0, |r| r.len()), 2);
}

#[tokio::test]
async fn test_absolute_timeout_aborts_in_flight_work() {
    let server = success_backend(Duration::from_secs(10)).await;
    let mut config = config(&server.uri());
    config.orchestrator.idle_grace_ms = None;
    config.orchestrator.absolute_timeout_ms = Some(500);

    let engine = InMemoryEngine::new();
    engine.add_task(Task::new("stuck", "classify").with_routing("ml", "classifier", None));

    let started = std::time::Instant::now();
    let report = orchestrator(&config, engine.clone()).run().await;
    assert_eq!(report.final_state, OrchestratorState::Terminated);
    assert_eq!(report.abandoned, 1);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(engine.status("stuck"), Some(TaskStatus::Open));
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_work() {
    let server = success_backend(Duration::from_millis(300)).await;
    let mut config = config(&server.uri());
    config.orchestrator.idle_grace_ms = None;

    let engine = InMemoryEngine::new();
    engine.add_task(Task::new("t1", "classify").with_routing("ml", "classifier", None));

    let orchestrator = orchestrator(&config, engine.clone());
    let shutdown = orchestrator.shutdown_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
    });

    let report = orchestrator.run().await;
    assert_eq!(report.final_state, OrchestratorState::Terminated);
    assert_eq!(report.completed, 1);
    assert!(matches!(engine.status("t1"), Some(TaskStatus::Completed(_))));
}

#[tokio::test]
async fn test_engine_outage_does_not_count_as_idle() {
    let server = success_backend(Duration::ZERO).await;
    let config = config(&server.uri());

    let engine = InMemoryEngine::new();
    engine.add_task(Task::new("t1", "classify").with_routing("ml", "classifier", None));
    // the outage outlasts the 200ms idle grace
    let flaky = FlakyEngine {
        inner: engine.clone(),
        recovers_at: Instant::now() + Duration::from_millis(800),
    };

    let started = Instant::now();
    let report = orchestrator_with(&config, Arc::new(flaky), invoker(&config)).run().await;

    assert!(started.elapsed() >= Duration::from_millis(800));
    assert_eq!(report.final_state, OrchestratorState::Terminated);
    assert_eq!(report.locked, 1);
    assert_eq!(report.completed, 1);
    assert!(matches!(engine.status("t1"), Some(TaskStatus::Completed(_))));
}

#[tokio::test]
async fn test_open_circuit_falls_through_to_next_endpoint() {
    let tripped = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/process_task"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "success"})))
        .expect(0)
        .mount(&tripped)
        .await;
    let healthy = success_backend(Duration::ZERO).await;

    let mut config = config(&healthy.uri());
    config.breaker.failure_threshold = 1;
    config.services.push(StaticService {
        service_type: "ml".to_string(),
        service_name: "classifier".to_string(),
        version: None,
        base_url: tripped.uri(),
    });
    let invoker = invoker(&config);
    // static endpoints are keyed by their base URL
    invoker.breakers().for_endpoint(&tripped.uri()).record_failure();

    let engine = InMemoryEngine::new();
    for i in 0..2 {
        // two tasks, so the round-robin start lands on the tripped endpoint once
        engine.add_task(Task::new(format!("t{}", i), "classify").with_routing("ml", "classifier", None));
    }

    let report = orchestrator_with(&config, Arc::new(engine.clone()), invoker).run().await;

    assert_eq!(report.completed, 2);
    assert_eq!(report.failed(), 0);
    assert_eq!(healthy.received_requests().await.map_or(0, |r| r.len()), 2);
    assert_eq!(tripped.received_requests().await.map_or(0, |r| r.len()), 0);
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use serde_json::json;
use taskwire::config::PollerConfig;
use taskwire::engine::memory::TaskStatus;
use taskwire::engine::{FetchRequest, InMemoryEngine, WorkflowEngine};
use taskwire::invoke::{ErrorKind, InvocationResult};
use taskwire::runtime::{Completion, Task, TaskCompleter};

fn completer(engine: &InMemoryEngine) -> TaskCompleter {
    TaskCompleter::new(Arc::new(engine.clone()), 3, Duration::from_millis(0))
}

async fn lock_one(engine: &InMemoryEngine, topic: &str) -> Task {
    let request = FetchRequest {
        topics: vec![topic.to_string()],
        lock_duration: PollerConfig::default().lock_duration(),
        max_tasks: 1,
    };
    let mut tasks = engine.fetch_and_lock(&request).await.expect("Fetch failed");
    assert_eq!(tasks.len(), 1, "Expected a lockable task");
    tasks.remove(0)
}

fn transient(delay_ms: u64) -> InvocationResult {
    let mut result = InvocationResult::failure(ErrorKind::ServiceUnavailable, "503 from service", 4);
    result.retry_delay = Some(Duration::from_millis(delay_ms));
    result
}

#[tokio::test]
async fn test_success_completes_with_output() {
    let engine = InMemoryEngine::new();
    engine.add_task(Task::new("t1", "classify"));
    let task = lock_one(&engine, "classify").await;

    let output = HashMap::from([("label".to_string(), json!("spam"))]);
    let completion = completer(&engine)
        .complete(&task, &InvocationResult::success(output.clone(), 1))
        .await
        .expect("Completion failed");

    assert_eq!(completion, Completion::Completed);
    assert_eq!(engine.status("t1"), Some(TaskStatus::Completed(output)));
}

#[tokio::test]
async fn test_retry_budget_only_decreases() {
    let engine = InMemoryEngine::new();
    engine.add_task(Task::new("t1", "classify"));
    let completer = completer(&engine);

    let mut observed = Vec::new();
    loop {
        engine.release_backoff("t1");
        let task = lock_one(&engine, "classify").await;
        let completion = completer.complete(&task, &transient(1_000)).await.expect("Failure report failed");
        observed.push(engine.retries("t1").expect("Retries should be set"));
        if completion == Completion::Incident {
            break;
        }
    }

    assert_eq!(observed, vec![2, 1, 0]);
    assert!(matches!(engine.status("t1"), Some(TaskStatus::Incident { .. })));
    let failures = engine.failures("t1");
    assert_eq!(failures[0].retry_timeout, Duration::from_millis(1_000));
    assert_eq!(failures[2].retry_timeout, Duration::ZERO);
    assert!(failures[0].error_message.starts_with("ServiceUnavailable"));
}

#[tokio::test]
async fn test_permanent_failure_raises_incident() {
    let engine = InMemoryEngine::new();
    engine.add_task(Task::new("t1", "classify"));
    let task = lock_one(&engine, "classify").await;

    let result = InvocationResult::failure(ErrorKind::MissingRoutingMetadata, "no serviceType", 0);
    let completion = completer(&engine).complete(&task, &result).await.expect("Failure report failed");

    assert_eq!(completion, Completion::Incident);
    assert_eq!(engine.retries("t1"), Some(0));
}

#[tokio::test]
async fn test_engine_retry_counter_takes_precedence() {
    let engine = InMemoryEngine::new();
    let mut task = Task::new("t1", "classify");
    task.retries = Some(10);
    engine.add_task(task);
    let task = lock_one(&engine, "classify").await;

    let completion = completer(&engine).complete(&task, &transient(0)).await.expect("Failure report failed");
    assert_eq!(completion, Completion::RetryScheduled { remaining: 9 });
}

#[tokio::test]
async fn test_default_retry_delay_applies_without_hint() {
    let engine = InMemoryEngine::new();
    let completer = TaskCompleter::new(Arc::new(engine.clone()), 3, Duration::from_secs(5));
    let task = Task::new("t1", "classify");

    let failure = completer.failure_for(&task, &InvocationResult::failure(ErrorKind::TransientNetwork, "reset", 1));
    assert_eq!(failure.retries, 2);
    assert_eq!(failure.retry_timeout, Duration::from_secs(5));
}

#[tokio::test]
async fn test_report_without_lock_is_an_error() {
    let engine = InMemoryEngine::new();
    engine.add_task(Task::new("t1", "classify"));
    let task = Task::new("t1", "classify");

    let result = completer(&engine).complete(&task, &InvocationResult::success(HashMap::new(), 1)).await;
    assert!(result.is_err());
    assert_eq!(engine.status("t1"), Some(TaskStatus::Open));
}

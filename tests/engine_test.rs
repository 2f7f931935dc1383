//! End-to-end engine scenarios against a scripted invoker.
//!
//! Most tests run with a paused clock so retry backoff and deadline
//! behavior are deterministic; the circuit-breaker test talks to a real
//! local HTTP listener through the production invoker.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value as JsonValue};
use tokio_util::sync::CancellationToken;

use overture::{
    Engine, EngineConfig, EngineError, ExecutionContext, Invoker, SagaCoordinator, StepOutcome,
    WorkflowStatus,
};

// =============================================================================
// Scripted invoker
// =============================================================================

/// One scripted reply for a (service, method) pair.
enum Reply {
    /// Succeed immediately with this value.
    Value(JsonValue),
    /// Succeed with this value after a delay.
    After(Duration, JsonValue),
    /// Fail with a transport `unavailable` status (retryable).
    Unavailable,
    /// Fail with an in-service `success=false` reply (retryable).
    Business(String),
}

#[derive(Debug, Clone)]
struct Call {
    service: String,
    method: String,
    step_id: String,
    input: HashMap<String, JsonValue>,
}

#[derive(Default)]
struct ScriptedInvoker {
    replies: Mutex<HashMap<(String, String), VecDeque<Reply>>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedInvoker {
    fn script(&self, service: &str, method: &str, replies: Vec<Reply>) {
        self.replies
            .lock()
            .unwrap()
            .insert((service.to_string(), method.to_string()), replies.into());
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn calls_to(&self, service: &str, method: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.service == service && call.method == method)
            .count()
    }
}

#[async_trait::async_trait]
impl Invoker for ScriptedInvoker {
    async fn invoke(
        &self,
        service: &str,
        method: &str,
        input: HashMap<String, JsonValue>,
        _workflow_id: &str,
        step_id: &str,
    ) -> Result<JsonValue, EngineError> {
        self.calls.lock().unwrap().push(Call {
            service: service.to_string(),
            method: method.to_string(),
            step_id: step_id.to_string(),
            input,
        });

        let reply = self
            .replies
            .lock()
            .unwrap()
            .get_mut(&(service.to_string(), method.to_string()))
            .and_then(VecDeque::pop_front);

        match reply {
            None => Ok(json!({"ok": true})),
            Some(Reply::Value(value)) => Ok(value),
            Some(Reply::After(delay, value)) => {
                tokio::time::sleep(delay).await;
                Ok(value)
            }
            Some(Reply::Unavailable) => {
                Err(EngineError::Rpc(tonic::Status::unavailable("service down")))
            }
            Some(Reply::Business(message)) => Err(EngineError::Remote(message)),
        }
    }
}

fn engine_with(mock: &Arc<ScriptedInvoker>) -> Engine {
    let invoker: Arc<dyn Invoker> = Arc::clone(mock) as Arc<dyn Invoker>;
    Engine::with_invoker(invoker, EngineConfig::default())
}

// =============================================================================
// Happy path and data flow
// =============================================================================

const HAPPY_LINEAR: &str = r#"
name: happy_linear
version: "1.0"
services:
  alpha:
    type: grpc
    endpoint: localhost:50051
  beta:
    type: grpc
    endpoint: localhost:50052
steps:
  - id: first
    service: alpha
    method: create
    output: first_out
    compensate:
      method: undo_create
  - id: second
    service: beta
    method: finish
    input:
      prev: "{{ first_out.id }}"
    output: second_out
output:
  summary: "{{ first_out.id }}-{{ second_out.id }}"
"#;

#[tokio::test(start_paused = true)]
async fn happy_linear_records_outputs_in_order() {
    let mock = Arc::new(ScriptedInvoker::default());
    mock.script("alpha", "create", vec![Reply::Value(json!({"id": "X"}))]);
    mock.script("beta", "finish", vec![Reply::Value(json!({"id": "Y"}))]);

    let engine = engine_with(&mock);
    engine.load_str(HAPPY_LINEAR).unwrap();

    let result = engine
        .execute("happy_linear", json!({}), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status, WorkflowStatus::Success);
    assert!(result.error.is_none());
    assert_eq!(result.output["first_out"], json!({"id": "X"}));
    assert_eq!(result.output["second_out"], json!({"id": "Y"}));
    assert_eq!(result.output["summary"], json!("X-Y"));

    // Declaration order: first commits before second starts.
    let calls = mock.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].step_id, "first");
    assert_eq!(calls[1].step_id, "second");
    // The second step saw the first step's output through its template.
    assert_eq!(calls[1].input["prev"], json!("X"));
}

#[tokio::test(start_paused = true)]
async fn unknown_workflow_fails_before_running() {
    let mock = Arc::new(ScriptedInvoker::default());
    let engine = engine_with(&mock);
    let err = engine
        .execute("ghost", json!({}), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::WorkflowNotFound(_)));
}

#[tokio::test(start_paused = true)]
async fn template_resolution_error_is_terminal() {
    let mock = Arc::new(ScriptedInvoker::default());
    let engine = engine_with(&mock);
    engine
        .load_str(
            r#"
name: bad_ref
version: "1"
services:
  svc:
    type: http
    endpoint: http://localhost:1
steps:
  - id: only
    service: svc
    method: go
    input:
      value: "{{ never_recorded.id }}"
"#,
        )
        .unwrap();

    let result = engine
        .execute("bad_ref", json!({}), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status, WorkflowStatus::Failed);
    assert!(result.error.unwrap().contains("never_recorded"));
    assert!(mock.calls().is_empty());
}

// =============================================================================
// Failure and rollback
// =============================================================================

const ROLLBACK: &str = r#"
name: rollback
version: "1.0"
services:
  svc:
    type: http
    endpoint: http://localhost:1
steps:
  - id: one
    service: svc
    method: step1
    output: out1
    compensate:
      method: undo1
      input:
        ref: "{{ out1.id }}"
  - id: two
    service: svc
    method: step2
    output: out2
    compensate:
      method: undo2
      input:
        ref: "{{ out2.id }}"
  - id: three
    service: svc
    method: step3
    compensate:
      method: undo3
"#;

#[tokio::test(start_paused = true)]
async fn failure_rolls_back_in_reverse_order() {
    let mock = Arc::new(ScriptedInvoker::default());
    mock.script("svc", "step1", vec![Reply::Value(json!({"id": "A"}))]);
    mock.script("svc", "step2", vec![Reply::Value(json!({"id": "B"}))]);
    mock.script(
        "svc",
        "step3",
        vec![Reply::Business("insufficient funds".into())],
    );

    let engine = engine_with(&mock);
    engine.load_str(ROLLBACK).unwrap();

    let result = engine
        .execute("rollback", json!({}), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status, WorkflowStatus::Compensated);
    let error = result.error.unwrap();
    assert!(error.contains("three"), "error should name the failing step: {error}");
    assert!(error.contains("insufficient funds"));

    // Compensations replay newest-first, with re-rendered inputs, and
    // carry a derived step id.
    let undo_calls: Vec<Call> = mock
        .calls()
        .into_iter()
        .filter(|call| call.method.starts_with("undo"))
        .collect();
    assert_eq!(undo_calls.len(), 2);
    assert_eq!(undo_calls[0].method, "undo2");
    assert_eq!(undo_calls[0].input["ref"], json!("B"));
    assert_eq!(undo_calls[0].step_id, "two_compensate");
    assert_eq!(undo_calls[1].method, "undo1");
    assert_eq!(undo_calls[1].input["ref"], json!("A"));
}

#[tokio::test(start_paused = true)]
async fn failed_compensation_yields_failed_status() {
    let mock = Arc::new(ScriptedInvoker::default());
    mock.script("svc", "step1", vec![Reply::Value(json!({"id": "A"}))]);
    mock.script("svc", "step2", vec![Reply::Value(json!({"id": "B"}))]);
    mock.script("svc", "step3", vec![Reply::Business("declined".into())]);
    // undo2 fails; undo1 must still run.
    mock.script("svc", "undo2", vec![Reply::Business("cannot undo".into())]);

    let engine = engine_with(&mock);
    engine.load_str(ROLLBACK).unwrap();

    let result = engine
        .execute("rollback", json!({}), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status, WorkflowStatus::Failed);
    assert_eq!(mock.calls_to("svc", "undo2"), 1);
    assert_eq!(mock.calls_to("svc", "undo1"), 1);
}

#[tokio::test(start_paused = true)]
async fn failure_with_nothing_committed_is_plain_failed() {
    let mock = Arc::new(ScriptedInvoker::default());
    mock.script("svc", "step1", vec![Reply::Business("nope".into())]);

    let engine = engine_with(&mock);
    engine
        .load_str(
            r#"
name: first_fails
version: "1"
services:
  svc:
    type: http
    endpoint: http://localhost:1
steps:
  - id: only
    service: svc
    method: step1
"#,
        )
        .unwrap();

    let result = engine
        .execute("first_fails", json!({}), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.status, WorkflowStatus::Failed);
}

// =============================================================================
// Parallel groups
// =============================================================================

const FAN_OUT: &str = r#"
name: fan_out
version: "1.0"
services:
  pa:
    type: http
    endpoint: http://localhost:1
  pb:
    type: http
    endpoint: http://localhost:2
    timeout: 1s
    retry:
      attempts: 2
  pc:
    type: http
    endpoint: http://localhost:3
steps:
  - parallel:
      - id: a
        service: pa
        method: run
        output: oa
      - id: b
        service: pb
        method: run
        output: ob
      - id: c
        service: pc
        method: run
        output: oc
"#;

#[tokio::test(start_paused = true)]
async fn parallel_fan_out_retries_slow_child() {
    let mock = Arc::new(ScriptedInvoker::default());
    mock.script("pa", "run", vec![Reply::Value(json!({"n": 1}))]);
    // First attempt exceeds pb's 1s per-call deadline; retry succeeds.
    mock.script(
        "pb",
        "run",
        vec![
            Reply::After(Duration::from_secs(2), json!({"n": 2})),
            Reply::Value(json!({"n": 2})),
        ],
    );
    mock.script(
        "pc",
        "run",
        vec![Reply::After(Duration::from_millis(1500), json!({"n": 3}))],
    );

    let engine = engine_with(&mock);
    engine.load_str(FAN_OUT).unwrap();

    let started = tokio::time::Instant::now();
    let result = engine
        .execute("fan_out", json!({}), CancellationToken::new())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(result.status, WorkflowStatus::Success);
    assert_eq!(result.output["oa"], json!({"n": 1}));
    assert_eq!(result.output["ob"], json!({"n": 2}));
    assert_eq!(result.output["oc"], json!({"n": 3}));

    // Child b was invoked exactly twice: deadline expiry, then retry.
    assert_eq!(mock.calls_to("pb", "run"), 2);
    // Wall time is bounded below by b's deadline plus one backoff sleep.
    assert!(
        elapsed >= Duration::from_secs(2),
        "expected at least 2s of virtual time, got {elapsed:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn parallel_child_failure_fails_the_group() {
    let mock = Arc::new(ScriptedInvoker::default());
    mock.script("pa", "run", vec![Reply::Value(json!({"n": 1}))]);
    // pb allows 2 attempts; both must fail for the group to fail.
    mock.script(
        "pb",
        "run",
        vec![
            Reply::Business("broken".into()),
            Reply::Business("broken".into()),
        ],
    );
    mock.script(
        "pc",
        "run",
        vec![Reply::After(Duration::from_secs(30), json!({"n": 3}))],
    );

    let engine = engine_with(&mock);
    engine.load_str(FAN_OUT).unwrap();

    let result = engine
        .execute("fan_out", json!({}), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status, WorkflowStatus::Failed);
    let error = result.error.unwrap();
    assert!(
        error.contains("step b"),
        "error should name the failing child: {error}"
    );
    assert!(error.contains("broken"));
}

// =============================================================================
// Guards
// =============================================================================

#[tokio::test(start_paused = true)]
async fn false_guard_skips_without_recording() {
    let mock = Arc::new(ScriptedInvoker::default());
    let engine = engine_with(&mock);
    engine
        .load_str(
            r#"
name: guarded
version: "1"
services:
  svc:
    type: http
    endpoint: http://localhost:1
steps:
  - id: maybe
    service: svc
    method: optional
    when: "{{ input.flagged }}"
    output: maybe_out
    compensate:
      method: undo_optional
  - id: always
    service: svc
    method: required
    output: always_out
"#,
        )
        .unwrap();

    let result = engine
        .execute("guarded", json!({"flagged": "false"}), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status, WorkflowStatus::Success);
    assert_eq!(mock.calls_to("svc", "optional"), 0);
    assert_eq!(mock.calls_to("svc", "required"), 1);
    // Nothing recorded for the skipped step.
    assert!(result.output.get("maybe_out").is_none());
    assert!(result.output.get("always_out").is_some());
}

#[tokio::test(start_paused = true)]
async fn guard_matches_boolean_output_by_name() {
    let mock = Arc::new(ScriptedInvoker::default());
    mock.script("svc", "check", vec![Reply::Value(json!(true))]);

    let engine = engine_with(&mock);
    engine
        .load_str(
            r#"
name: guarded_by_output
version: "1"
services:
  svc:
    type: http
    endpoint: http://localhost:1
steps:
  - id: check
    service: svc
    method: check
    output: approved
  - id: follow
    service: svc
    method: follow_up
    when: approved
"#,
        )
        .unwrap();

    let result = engine
        .execute("guarded_by_output", json!({}), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status, WorkflowStatus::Success);
    assert_eq!(mock.calls_to("svc", "follow_up"), 1);
}

// =============================================================================
// Retry cap
// =============================================================================

#[tokio::test(start_paused = true)]
async fn retry_attempts_cap_total_invocations() {
    let mock = Arc::new(ScriptedInvoker::default());
    mock.script(
        "svc",
        "wobble",
        vec![Reply::Unavailable, Reply::Unavailable, Reply::Unavailable],
    );

    let engine = engine_with(&mock);
    engine
        .load_str(
            r#"
name: capped
version: "1"
services:
  svc:
    type: http
    endpoint: http://localhost:1
    retry:
      attempts: 2
      backoff: exponential
steps:
  - id: only
    service: svc
    method: wobble
"#,
        )
        .unwrap();

    let result = engine
        .execute("capped", json!({}), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status, WorkflowStatus::Failed);
    assert_eq!(mock.calls_to("svc", "wobble"), 2);
}

#[tokio::test(start_paused = true)]
async fn terminal_errors_stop_retry_immediately() {
    let mock = Arc::new(ScriptedInvoker::default());
    // not_found is terminal even with attempts remaining.
    mock.script("svc", "go", vec![Reply::Value(json!(null))]);
    let engine = engine_with(&mock);
    engine
        .load_str(
            r#"
name: terminal
version: "1"
services:
  svc:
    type: http
    endpoint: http://localhost:1
    retry:
      attempts: 5
steps:
  - id: only
    service: svc
    method: go
    input:
      value: "{{ missing_key }}"
"#,
        )
        .unwrap();

    let result = engine
        .execute("terminal", json!({}), CancellationToken::new())
        .await
        .unwrap();

    // Resolution failure is terminal: no invocation at all.
    assert_eq!(result.status, WorkflowStatus::Failed);
    assert_eq!(mock.calls_to("svc", "go"), 0);
}

// =============================================================================
// Timeouts and cancellation
// =============================================================================

#[tokio::test(start_paused = true)]
async fn workflow_timeout_cancels_without_compensation() {
    let mock = Arc::new(ScriptedInvoker::default());
    mock.script(
        "svc",
        "nap",
        vec![Reply::After(Duration::from_secs(5), json!({"ok": true}))],
    );

    let engine = engine_with(&mock);
    engine
        .load_str(
            r#"
name: sleepy
version: "1"
timeout: 1s
services:
  svc:
    type: http
    endpoint: http://localhost:1
steps:
  - id: nap
    service: svc
    method: nap
    compensate:
      method: undo_nap
  - id: after
    service: svc
    method: later
"#,
        )
        .unwrap();

    let result = engine
        .execute("sleepy", json!({}), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status, WorkflowStatus::Cancelled);
    assert!(result.error.is_some());
    // The sleeping step started; nothing else did, and nothing rolled back.
    assert_eq!(mock.calls_to("svc", "nap"), 1);
    assert_eq!(mock.calls_to("svc", "later"), 0);
    assert_eq!(mock.calls_to("svc", "undo_nap"), 0);
}

#[tokio::test(start_paused = true)]
async fn caller_cancellation_stops_new_work() {
    let mock = Arc::new(ScriptedInvoker::default());
    mock.script(
        "svc",
        "slow",
        vec![Reply::After(Duration::from_secs(2), json!({"ok": true}))],
    );

    let engine = engine_with(&mock);
    engine
        .load_str(
            r#"
name: interruptible
version: "1"
services:
  svc:
    type: http
    endpoint: http://localhost:1
steps:
  - id: slow
    service: svc
    method: slow
    compensate:
      method: undo_slow
  - id: next
    service: svc
    method: next
"#,
        )
        .unwrap();

    let cancel = CancellationToken::new();
    let canceller = {
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        }
    };

    let (result, ()) = tokio::join!(
        engine.execute("interruptible", json!({}), cancel.clone()),
        canceller
    );
    let result = result.unwrap();

    assert_eq!(result.status, WorkflowStatus::Cancelled);
    assert_eq!(mock.calls_to("svc", "slow"), 1);
    // No new leaf after cancellation, no compensation either.
    assert_eq!(mock.calls_to("svc", "next"), 0);
    assert_eq!(mock.calls_to("svc", "undo_slow"), 0);
}

// =============================================================================
// Saga replay idempotence
// =============================================================================

#[tokio::test(start_paused = true)]
async fn saga_replay_is_idempotent() {
    use overture::{Compensation, Step};

    let mock = Arc::new(ScriptedInvoker::default());
    let invoker: Arc<dyn Invoker> = Arc::clone(&mock) as Arc<dyn Invoker>;
    let saga = SagaCoordinator::new(invoker);

    let ctx = ExecutionContext::new("wf-replay", json!({}));
    for id in ["one", "two"] {
        let step = Step {
            id: id.to_string(),
            service: "svc".to_string(),
            method: "do".to_string(),
            compensate: Some(Compensation {
                method: format!("undo_{id}"),
                input: HashMap::new(),
            }),
            ..Step::default()
        };
        ctx.commit(&step, &StepOutcome::completed(id, json!({"id": id})));
    }

    saga.compensate(&ctx).await.unwrap();
    let after_first = mock.calls().len();
    assert_eq!(after_first, 2);

    // Every entry is marked compensated: the second pass is a no-op.
    saga.compensate(&ctx).await.unwrap();
    assert_eq!(mock.calls().len(), after_first);
    assert!(ctx.executed().iter().all(|entry| entry.compensated));
}

// =============================================================================
// Circuit breaker (production invoker against a local listener)
// =============================================================================

async fn spawn_unavailable_server() -> (std::net::SocketAddr, Arc<AtomicUsize>) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(
                    b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                )
                .await;
        }
    });

    (addr, hits)
}

#[tokio::test]
async fn breaker_trips_and_rejects_without_outbound_calls() {
    let (addr, hits) = spawn_unavailable_server().await;

    let engine = Engine::new();
    engine
        .load_str(&format!(
            r#"
name: breaker_trip
version: "1"
services:
  flaky:
    type: http
    endpoint: http://{addr}
    retry:
      attempts: 5
steps:
  - id: only
    service: flaky
    method: "POST /work"
"#
        ))
        .unwrap();

    let result = engine
        .execute("breaker_trip", json!({}), CancellationToken::new())
        .await
        .unwrap();

    // Three 503s trip the breaker; the fourth attempt is rejected before
    // any request leaves the process, and the rejection is terminal.
    assert_eq!(result.status, WorkflowStatus::Failed);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert!(result.error.unwrap().contains("circuit breaker open"));
    assert!(!engine.registry().is_healthy("flaky"));
}

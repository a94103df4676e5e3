//! End-to-end engine scenarios against in-process stub HTTP backends.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use cascade_catalog::{MemoryStorage, OperationKind, Storage};
use cascade_core::{
    AgentId, EngineConfig, ExecutionStatus, IssueCategory, OperationStatus, RetryConfig,
};
use cascade_engine::{
    AllowedCatalog, AuditEventKind, Credential, CredentialType, Engine, ExecutionResponse,
    MemoryAuditSink, RunOutcome, StaticCatalogProvider, StaticCredentialResolver,
    ValidationReport,
};

const AGENT: &str = "agent-1";

struct Harness {
    engine: Engine,
    audit: Arc<MemoryAuditSink>,
    storage: Arc<MemoryStorage>,
}

/// Default test configuration: fast retries so transient-failure tests
/// finish in milliseconds.
fn test_config() -> EngineConfig {
    EngineConfig {
        retry: RetryConfig {
            max_retries: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_base: 2.0,
            jitter: false,
        },
        ..Default::default()
    }
}

async fn harness(config: EngineConfig) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let mut allowed = AllowedCatalog::default();
    for kind in OperationKind::ALL {
        allowed.operation_kinds.insert(kind.as_str().to_string());
    }
    allowed.apis.insert("127.0.0.1".into(), vec![]);
    allowed
        .credentials
        .insert("github".into(), CredentialType::BearerToken);

    let provider = Arc::new(StaticCatalogProvider::new());
    provider.grant(AGENT, allowed).await;

    let credentials = Arc::new(StaticCredentialResolver::new());
    credentials
        .insert(
            "github",
            Credential::new("s3cr3t-token", CredentialType::BearerToken),
        )
        .await;

    let audit = Arc::new(MemoryAuditSink::new());
    let storage = Arc::new(MemoryStorage::new());
    let engine = Engine::builder()
        .config(config)
        .catalog_provider(provider)
        .credential_resolver(credentials)
        .audit_sink(audit.clone())
        .storage(storage.clone())
        .build();

    Harness {
        engine,
        audit,
        storage,
    }
}

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub");
    let addr = listener.local_addr().expect("stub addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("stub server");
    });
    format!("http://{addr}")
}

async fn run(h: &Harness, workflow: &str) -> ExecutionResponse {
    match h
        .engine
        .run(
            &AgentId::new(AGENT),
            workflow.as_bytes(),
            CancellationToken::new(),
        )
        .await
        .expect("engine run")
    {
        RunOutcome::Completed(response) => response,
        RunOutcome::Invalid(report) => panic!("unexpected rejection: {:?}", report.errors),
    }
}

async fn run_expecting_rejection(h: &Harness, workflow: &str) -> ValidationReport {
    match h
        .engine
        .run(
            &AgentId::new(AGENT),
            workflow.as_bytes(),
            CancellationToken::new(),
        )
        .await
        .expect("engine run")
    {
        RunOutcome::Invalid(report) => report,
        RunOutcome::Completed(response) => {
            panic!("expected rejection, got status {}", response.status)
        }
    }
}

fn fetch_and_filter_workflow(base: &str) -> String {
    format!(
        r#"
{{"type":"operationUpdate","operationId":"a","operation":{{"ApiCall":{{"method":"GET","url":"{base}/users","outputPath":"/workflow/users"}}}}}}
{{"type":"operationUpdate","operationId":"b","operation":{{"FilterData":{{"inputPath":"/workflow/users","conditions":[{{"field":"points","operator":">","value":100}}],"outputPath":"/workflow/top"}}}}}}
{{"type":"beginExecution","executionId":"e1","operationOrder":["a","b"]}}
"#
    )
}

fn users_router(hits: Arc<AtomicUsize>) -> Router {
    Router::new()
        .route(
            "/users",
            get(|State(hits): State<Arc<AtomicUsize>>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Json(json!([{"id": 1, "points": 50}, {"id": 2, "points": 200}]))
            }),
        )
        .with_state(hits)
}

#[tokio::test]
async fn fetch_and_filter_end_to_end() {
    let hits = Arc::new(AtomicUsize::new(0));
    let base = serve(users_router(hits.clone())).await;
    let h = harness(test_config()).await;

    let response = run(&h, &fetch_and_filter_workflow(&base)).await;

    assert_eq!(response.status, ExecutionStatus::Success);
    assert_eq!(response.execution_id.as_str(), "e1");
    assert_eq!(
        response.data["/workflow/top"],
        json!([{"id": 2, "points": 200}])
    );
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(response.operations["a"].status, OperationStatus::Success);
    assert_eq!(response.operations["b"].status, OperationStatus::Success);
}

#[tokio::test]
async fn forward_reference_rejected_without_side_effects() {
    let hits = Arc::new(AtomicUsize::new(0));
    let base = serve(users_router(hits.clone())).await;
    let h = harness(test_config()).await;

    let workflow =
        fetch_and_filter_workflow(&base).replace(r#"["a","b"]"#, r#"["b","a"]"#);
    let report = run_expecting_rejection(&h, &workflow).await;

    assert!(report
        .errors
        .iter()
        .any(|i| i.category == IssueCategory::Dependency));
    // no HTTP request was issued and nothing was audited beyond validation
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert!(h.audit.events().is_empty());
}

#[tokio::test]
async fn unknown_credential_rejected_at_permission() {
    let h = harness(test_config()).await;
    let workflow = r#"
{"type":"operationUpdate","operationId":"a","operation":{"ApiCall":{"method":"GET","url":"http://127.0.0.1:9/x","headers":{"Authorization":{"credentialRef":{"id":"missing"}}},"outputPath":"/workflow/x"}}}
{"type":"beginExecution","executionId":"e1","operationOrder":["a"]}
"#;
    let report = run_expecting_rejection(&h, workflow).await;
    let error = &report.errors[0];
    assert_eq!(error.category, IssueCategory::Permission);
    assert!(error.message.contains("missing"));
}

#[tokio::test]
async fn rate_limit_denial_reports_retry_after() {
    let mut config = EngineConfig::default();
    config.rate_limits.requests_per_minute = 1;
    let h = harness(config).await;

    let workflow = r#"
{"type":"operationUpdate","operationId":"w","operation":{"Wait":{"duration":0}}}
{"type":"beginExecution","executionId":"e1","operationOrder":["w"]}
"#;
    let first = run(&h, workflow).await;
    assert_eq!(first.status, ExecutionStatus::Success);

    let second = run(&h, &workflow.replace("e1", "e2")).await;
    assert_eq!(second.status, ExecutionStatus::Failed);
    let op = &second.operations["w"];
    assert_eq!(op.status, OperationStatus::Failed);
    let error = op.error.as_ref().expect("error report");
    assert_eq!(error.kind, "RateLimitError");
    assert!(error.context["retryAfterMs"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn retry_absorbs_transient_503s() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let router = Router::new()
        .route(
            "/flaky",
            get(|State(attempts): State<Arc<AtomicUsize>>| async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"try": n})))
                } else {
                    (StatusCode::OK, Json(json!([{"ok": true}])))
                }
            }),
        )
        .with_state(attempts.clone());
    let base = serve(router).await;
    let h = harness(test_config()).await;

    let workflow = format!(
        r#"
{{"type":"operationUpdate","operationId":"a","operation":{{"ApiCall":{{"method":"GET","url":"{base}/flaky","outputPath":"/workflow/data"}}}}}}
{{"type":"beginExecution","executionId":"e1","operationOrder":["a"]}}
"#
    );
    let response = run(&h, &workflow).await;

    assert_eq!(response.status, ExecutionStatus::Success);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    // one operation-finished event, successful; no failed records anywhere
    let finished: Vec<_> = h
        .audit
        .events()
        .into_iter()
        .filter(|e| matches!(e.kind, AuditEventKind::OperationFinished { .. }))
        .collect();
    assert_eq!(finished.len(), 1);
    assert!(response
        .operations
        .values()
        .all(|op| op.status == OperationStatus::Success));
}

#[tokio::test]
async fn identical_get_calls_share_one_backend_call() {
    let hits = Arc::new(AtomicUsize::new(0));
    let base = serve(users_router(hits.clone())).await;
    let h = harness(test_config()).await;

    let workflow = format!(
        r#"
{{"type":"operationUpdate","operationId":"a","operation":{{"ApiCall":{{"method":"GET","url":"{base}/users","outputPath":"/workflow/users"}}}}}}
{{"type":"operationUpdate","operationId":"b","operation":{{"ApiCall":{{"method":"GET","url":"{base}/users","outputPath":"/workflow/users"}}}}}}
{{"type":"beginExecution","executionId":"e1","operationOrder":["a","b"]}}
"#
    );
    let response = run(&h, &workflow).await;

    assert_eq!(response.status, ExecutionStatus::Success);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(h.engine.cache().stats().hits, 1);
    assert_eq!(
        response.operations["a"].result,
        response.operations["b"].result
    );
}

#[tokio::test]
async fn conditional_gates_not_taken_branch() {
    let hits = Arc::new(AtomicUsize::new(0));
    let base = serve(users_router(hits.clone())).await;
    let h = harness(test_config()).await;

    // users is non-empty, so the `empty` condition is false: the ifFalse
    // branch (keep) runs and drop is gated off; summarize reads drop's
    // output and is skipped transitively.
    let workflow = format!(
        r#"
{{"type":"operationUpdate","operationId":"fetch","operation":{{"ApiCall":{{"method":"GET","url":"{base}/users","outputPath":"/workflow/users"}}}}}}
{{"type":"operationUpdate","operationId":"gate","operation":{{"Conditional":{{"condition":{{"path":"/workflow/users","operator":"empty"}},"ifTrue":["drop"],"ifFalse":["keep"]}}}}}}
{{"type":"operationUpdate","operationId":"keep","operation":{{"FilterData":{{"inputPath":"/workflow/users","conditions":[],"outputPath":"/workflow/kept"}}}}}}
{{"type":"operationUpdate","operationId":"drop","operation":{{"FilterData":{{"inputPath":"/workflow/users","conditions":[],"outputPath":"/workflow/dropped"}}}}}}
{{"type":"operationUpdate","operationId":"summarize","operation":{{"TransformData":{{"inputPath":"/workflow/dropped","transform":"aggregate","config":{{"function":"count"}},"outputPath":"/workflow/summary"}}}}}}
{{"type":"beginExecution","executionId":"e1","operationOrder":["fetch","gate","keep","drop","summarize"]}}
"#
    );
    let response = run(&h, &workflow).await;

    assert_eq!(response.status, ExecutionStatus::PartialSuccess);
    assert_eq!(response.operations["keep"].status, OperationStatus::Success);
    assert_eq!(response.operations["drop"].status, OperationStatus::Skipped);
    assert_eq!(
        response.operations["summarize"].status,
        OperationStatus::Skipped
    );
    assert_eq!(response.data["/workflow/kept"], json!([{"id": 1, "points": 50}, {"id": 2, "points": 200}]));
    assert!(!response.data.contains_key("/workflow/dropped"));
}

#[tokio::test]
async fn loop_iterates_with_scratch_bindings() {
    let hits = Arc::new(AtomicUsize::new(0));
    let router = Router::new()
        .route(
            "/users",
            get(|| async { Json(json!([{"id": 1, "points": 50}, {"id": 2, "points": 200}])) }),
        )
        .route(
            "/echo/:index",
            get(
                |Path(index): Path<u64>, State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Json(json!({"index": index}))
                },
            ),
        )
        .with_state(hits.clone());
    let base = serve(router).await;
    let h = harness(test_config()).await;

    let workflow = format!(
        r#"
{{"type":"operationUpdate","operationId":"seed","operation":{{"ApiCall":{{"method":"GET","url":"{base}/users","outputPath":"/workflow/seed"}}}}}}
{{"type":"operationUpdate","operationId":"fetch_item","operation":{{"ApiCall":{{"method":"GET","url":"{base}/echo/{{/workflow/_loop/index}}","outputPath":"/workflow/item"}}}}}}
{{"type":"operationUpdate","operationId":"each","operation":{{"Loop":{{"inputPath":"/workflow/seed","operations":["fetch_item"],"outputPath":"/workflow/all"}}}}}}
{{"type":"beginExecution","executionId":"e1","operationOrder":["seed","each"]}}
"#
    );
    let response = run(&h, &workflow).await;

    assert_eq!(response.status, ExecutionStatus::Success, "{:?}", response.operations);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!(
        response.data["/workflow/all"],
        json!([{"index": 0}, {"index": 1}])
    );
    // the scratch subtree is gone after the loop
    assert!(!response.data.contains_key("/workflow/_loop"));
}

#[tokio::test]
async fn credential_injection_and_audit_hygiene() {
    let router = Router::new().route(
        "/secure",
        get(|headers: HeaderMap| async move {
            let authorized = headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(|v| v == "Bearer s3cr3t-token")
                .unwrap_or(false);
            if authorized {
                (StatusCode::OK, Json(json!({"ok": true})))
            } else {
                (StatusCode::UNAUTHORIZED, Json(json!({"ok": false})))
            }
        }),
    );
    let base = serve(router).await;
    let h = harness(test_config()).await;

    let workflow = format!(
        r#"
{{"type":"operationUpdate","operationId":"a","operation":{{"ApiCall":{{"method":"GET","url":"{base}/secure","headers":{{"Authorization":{{"credentialRef":{{"id":"github"}}}}}},"outputPath":"/workflow/out"}}}}}}
{{"type":"beginExecution","executionId":"e1","operationOrder":["a"]}}
"#
    );
    let response = run(&h, &workflow).await;
    assert_eq!(response.status, ExecutionStatus::Success);
    assert_eq!(response.data["/workflow/out"], json!({"ok": true}));

    let events = h.audit.events();
    assert!(events.iter().any(|e| matches!(
        &e.kind,
        AuditEventKind::CredentialUsed { credential_id, .. } if credential_id == "github"
    )));
    // no credential plaintext anywhere in the audit trail or the response
    let audit_json = serde_json::to_string(&events).unwrap();
    assert!(!audit_json.contains("s3cr3t-token"));
    let response_json = serde_json::to_string(&response).unwrap();
    assert!(!response_json.contains("s3cr3t-token"));
}

#[tokio::test]
async fn store_data_reaches_storage_backend() {
    let hits = Arc::new(AtomicUsize::new(0));
    let base = serve(users_router(hits)).await;
    let h = harness(test_config()).await;

    let workflow = format!(
        r#"
{{"type":"operationUpdate","operationId":"a","operation":{{"ApiCall":{{"method":"GET","url":"{base}/users","outputPath":"/workflow/users"}}}}}}
{{"type":"operationUpdate","operationId":"s","operation":{{"StoreData":{{"inputPath":"/workflow/users","storage":"localStorage","key":"users-snapshot"}}}}}}
{{"type":"beginExecution","executionId":"e1","operationOrder":["a","s"]}}
"#
    );
    let response = run(&h, &workflow).await;

    assert_eq!(response.status, ExecutionStatus::Success);
    let stored = h
        .storage
        .get("localStorage", "users-snapshot")
        .await
        .unwrap()
        .expect("stored value");
    assert_eq!(stored, json!([{"id": 1, "points": 50}, {"id": 2, "points": 200}]));
}

#[tokio::test]
async fn merge_pipeline_through_engine() {
    let router = Router::new()
        .route("/a", get(|| async { Json(json!([1, 2])) }))
        .route("/b", get(|| async { Json(json!([2, 3])) }));
    let base = serve(router).await;
    let h = harness(test_config()).await;

    let workflow = format!(
        r#"
{{"type":"operationUpdate","operationId":"left","operation":{{"ApiCall":{{"method":"GET","url":"{base}/a","outputPath":"/workflow/left"}}}}}}
{{"type":"operationUpdate","operationId":"right","operation":{{"ApiCall":{{"method":"GET","url":"{base}/b","outputPath":"/workflow/right"}}}}}}
{{"type":"operationUpdate","operationId":"m","operation":{{"MergeData":{{"sources":["/workflow/left","/workflow/right"],"strategy":"union","outputPath":"/workflow/merged"}}}}}}
{{"type":"beginExecution","executionId":"e1","operationOrder":["left","right","m"]}}
"#
    );
    let response = run(&h, &workflow).await;

    assert_eq!(response.status, ExecutionStatus::Success);
    assert_eq!(response.data["/workflow/merged"], json!([1, 2, 3]));
}

#[tokio::test]
async fn non_json_response_becomes_a_string_body() {
    let router = Router::new().route("/plain", get(|| async { "just text" }));
    let base = serve(router).await;
    let h = harness(test_config()).await;

    let workflow = format!(
        r#"
{{"type":"operationUpdate","operationId":"a","operation":{{"ApiCall":{{"method":"GET","url":"{base}/plain","outputPath":"/workflow/text"}}}}}}
{{"type":"beginExecution","executionId":"e1","operationOrder":["a"]}}
"#
    );
    let response = run(&h, &workflow).await;

    assert_eq!(response.status, ExecutionStatus::Success);
    assert_eq!(response.data["/workflow/text"], json!("just text"));
}

#[tokio::test]
async fn timeout_surfaces_timeout_error() {
    let router = Router::new().route(
        "/slow",
        get(|| async {
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            Json(json!({"late": true}))
        }),
    );
    let base = serve(router).await;

    let mut config = test_config();
    config.retry.max_retries = 0;
    let h = harness(config).await;
    let workflow = format!(
        r#"
{{"type":"operationUpdate","operationId":"a","operation":{{"ApiCall":{{"method":"GET","url":"{base}/slow","outputPath":"/workflow/x","timeoutMs":50}}}}}}
{{"type":"beginExecution","executionId":"e1","operationOrder":["a"]}}
"#
    );
    let response = run(&h, &workflow).await;

    assert_eq!(response.status, ExecutionStatus::Failed);
    let error = response.operations["a"].error.as_ref().expect("error");
    assert_eq!(error.kind, "TimeoutError");
}

#[tokio::test]
async fn cancellation_fails_the_execution() {
    let h = harness(test_config()).await;
    let workflow = r#"
{"type":"operationUpdate","operationId":"w","operation":{"Wait":{"duration":60000}}}
{"type":"beginExecution","executionId":"e1","operationOrder":["w"]}
"#;
    let cancel = CancellationToken::new();
    cancel.cancel();
    let outcome = h
        .engine
        .run(&AgentId::new(AGENT), workflow.as_bytes(), cancel)
        .await
        .unwrap();
    let RunOutcome::Completed(response) = outcome else {
        panic!("expected execution");
    };
    assert_eq!(response.status, ExecutionStatus::Failed);
    let error = response.operations["w"].error.as_ref().expect("error");
    assert_eq!(error.kind, "CancellationError");
}

#[tokio::test]
async fn responses_are_deterministic_modulo_durations() {
    let hits = Arc::new(AtomicUsize::new(0));
    let base = serve(users_router(hits)).await;

    let mut config = test_config();
    config.cache.enabled = false;
    let h = harness(config).await;

    let workflow = fetch_and_filter_workflow(&base);
    let first = normalize(run(&h, &workflow).await);
    let second = normalize(run(&h, &workflow).await);
    assert_eq!(first, second);
}

/// Zero the timing fields and drop response headers (the stub stamps a Date
/// header) so runs compare on the semantic payload.
fn normalize(response: ExecutionResponse) -> Value {
    let mut value = serde_json::to_value(&response).unwrap();
    value["durationMs"] = json!(0);
    for (_, op) in value["operations"].as_object_mut().unwrap() {
        op["durationMs"] = json!(0);
        if let Some(result) = op.get_mut("result") {
            if let Some(map) = result.as_object_mut() {
                map.remove("headers");
            }
        }
    }
    value
}

//! The execution engine: parse, validate, run, respond.
//!
//! `Engine` is the long-lived, process-wide object holding the shared
//! machinery (rate limiter, cache, audit sink, collaborator traits). Each
//! `run` call builds a private `Execution` that owns the data model and the
//! operation records, walks the declared order sequentially, and dies with
//! the response.

use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use cascade_core::{
    collect_references, parse_workflow, resolve_references, AgentId, DataModel, DataPath,
    EngineConfig, EngineError, ExecutionId, ExecutionStatus, OperationId, OperationStatus,
    ParsedWorkflow,
};
use cascade_catalog::{
    apply_filter, apply_merge, apply_transform, evaluate_condition, wait, HttpExecutor,
    MemoryStorage, OperationArgs, OperationKind, Storage,
};

use crate::audit::AuditEvent;
use crate::cache::{cache_key, ResultCache};
use crate::rate_limit::RateLimiter;
use crate::response::{project_data, ExecutionResponse, OperationSummary, ResponseFormat};
use crate::retry::RetryPolicy;
use crate::traits::{
    AuditSink, CatalogProvider, CredentialResolver, StaticCatalogProvider,
    StaticCredentialResolver,
};
use crate::validator::{ValidationReport, Validator};

/// Placeholder substituted for credential values in cache keys.
pub const CREDENTIAL_PLACEHOLDER: &str = "<credential>";

/// Outcome of one `run` call.
#[derive(Debug)]
pub enum RunOutcome {
    /// Parsing or validation rejected the workflow; nothing executed.
    Invalid(ValidationReport),
    /// The workflow executed (possibly partially).
    Completed(ExecutionResponse),
}

/// The workflow execution engine.
pub struct Engine {
    provider: Arc<dyn CatalogProvider>,
    credentials: Arc<dyn CredentialResolver>,
    audit: Arc<dyn AuditSink>,
    storage: Arc<dyn Storage>,
    rate_limiter: Arc<RateLimiter>,
    cache: Arc<ResultCache>,
    retry: RetryPolicy,
    http: HttpExecutor,
    config: EngineConfig,
    response_format: ResponseFormat,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Parse and validate without executing.
    pub async fn validate(
        &self,
        agent_id: &AgentId,
        workflow: &[u8],
    ) -> Result<ValidationReport, EngineError> {
        let parsed = match parse_workflow(workflow) {
            Ok(parsed) => parsed,
            Err(issues) => return Ok(ValidationReport::from_issues(issues)),
        };
        let allowed = self.provider.allowed_catalog(agent_id).await?;
        Ok(Validator::new(&allowed, &self.config.limits).validate(&parsed))
    }

    /// Parse, validate and execute a workflow for one agent.
    ///
    /// `Err` is reserved for collaborator faults (the catalog provider
    /// failing); every workflow-level problem comes back as a `RunOutcome`.
    #[instrument(skip(self, workflow, cancel), fields(agent = %agent_id))]
    pub async fn run(
        &self,
        agent_id: &AgentId,
        workflow: &[u8],
        cancel: CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        let parsed = match parse_workflow(workflow) {
            Ok(parsed) => parsed,
            Err(issues) => {
                debug!("workflow rejected at parse");
                return Ok(RunOutcome::Invalid(ValidationReport::from_issues(issues)));
            }
        };
        let allowed = self.provider.allowed_catalog(agent_id).await?;
        let report = Validator::new(&allowed, &self.config.limits).validate(&parsed);
        if !report.valid {
            debug!(errors = report.errors.len(), "workflow rejected at validation");
            return Ok(RunOutcome::Invalid(report));
        }

        let execution = Execution::new(self, agent_id, parsed, cancel);
        Ok(RunOutcome::Completed(execution.run().await))
    }
}

// ============================================================================
// BUILDER
// ============================================================================

/// Builder for [`Engine`]. Collaborators default to the in-memory
/// implementations.
pub struct EngineBuilder {
    config: EngineConfig,
    provider: Option<Arc<dyn CatalogProvider>>,
    credentials: Option<Arc<dyn CredentialResolver>>,
    audit: Option<Arc<dyn AuditSink>>,
    storage: Option<Arc<dyn Storage>>,
    response_format: ResponseFormat,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            provider: None,
            credentials: None,
            audit: None,
            storage: None,
            response_format: ResponseFormat::Compact,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn catalog_provider(mut self, provider: Arc<dyn CatalogProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn credential_resolver(mut self, resolver: Arc<dyn CredentialResolver>) -> Self {
        self.credentials = Some(resolver);
        self
    }

    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = format;
        self
    }

    pub fn build(self) -> Engine {
        let rate_limiter = Arc::new(RateLimiter::new(&self.config.rate_limits));
        let cache = Arc::new(ResultCache::new(self.config.cache.clone()));
        let retry = RetryPolicy::new(self.config.retry.clone());
        Engine {
            provider: self
                .provider
                .unwrap_or_else(|| Arc::new(StaticCatalogProvider::new())),
            credentials: self
                .credentials
                .unwrap_or_else(|| Arc::new(StaticCredentialResolver::new())),
            audit: self
                .audit
                .unwrap_or_else(|| Arc::new(crate::audit::MemoryAuditSink::new())),
            storage: self.storage.unwrap_or_else(|| Arc::new(MemoryStorage::new())),
            rate_limiter,
            cache,
            retry,
            http: HttpExecutor::new(),
            config: self.config,
            response_format: self.response_format,
        }
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// PER-RUN STATE
// ============================================================================

#[derive(Debug, Default)]
struct OperationRecord {
    status: OperationStatus,
    duration_ms: u64,
    result: Option<Value>,
    error: Option<cascade_core::ErrorReport>,
}

enum OpOutcome {
    Done,
    Skipped,
    Failed(EngineError),
}

struct Execution<'e> {
    engine: &'e Engine,
    agent_id: &'e AgentId,
    workflow: ParsedWorkflow,
    execution_id: ExecutionId,
    cancel: CancellationToken,
    model: DataModel,
    records: HashMap<OperationId, OperationRecord>,
    /// Ids gated off by a Conditional.
    gated: HashSet<OperationId>,
    /// Output paths of skipped operations, for skip propagation.
    skipped_outputs: Vec<DataPath>,
    deadline: Instant,
}

impl<'e> Execution<'e> {
    fn new(
        engine: &'e Engine,
        agent_id: &'e AgentId,
        workflow: ParsedWorkflow,
        cancel: CancellationToken,
    ) -> Self {
        let execution_id = if workflow.execution_id.is_empty() {
            ExecutionId::generate()
        } else {
            workflow.execution_id.clone()
        };
        let records = workflow
            .operations
            .keys()
            .map(|id| (id.clone(), OperationRecord::default()))
            .collect();
        Self {
            engine,
            agent_id,
            execution_id,
            cancel,
            model: DataModel::new(engine.config.limits.max_data_model_bytes),
            records,
            gated: HashSet::new(),
            skipped_outputs: Vec::new(),
            deadline: Instant::now()
                + Duration::from_millis(engine.config.limits.max_workflow_duration_ms),
            workflow,
        }
    }

    async fn run(mut self) -> ExecutionResponse {
        let started = Instant::now();
        self.engine.audit.append(AuditEvent::execution_started(
            &self.execution_id,
            self.agent_id,
            &self.workflow.workflow_hash,
            self.workflow.operations.len(),
        ));
        info!(execution = %self.execution_id, operations = self.workflow.order.len(), "execution started");

        let order = self.workflow.order.clone();
        let mut aborted = false;
        for id in &order {
            if self.cancel.is_cancelled() {
                self.fail_operation(id, EngineError::Cancelled, 0);
                aborted = true;
                break;
            }
            if Instant::now() >= self.deadline {
                self.fail_operation(
                    id,
                    EngineError::Resource(format!(
                        "execution exceeded its {}ms budget",
                        self.engine.config.limits.max_workflow_duration_ms
                    )),
                    0,
                );
                aborted = true;
                break;
            }
            match self.run_operation(id).await {
                OpOutcome::Done | OpOutcome::Skipped => {}
                OpOutcome::Failed(_) => {
                    // Stop on first terminal failure. continue_on_error is
                    // reserved and deliberately not honoured.
                    aborted = true;
                    break;
                }
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        let status = self.aggregate_status(aborted);
        let (succeeded, failed, skipped) = self.counts();
        self.engine.audit.append(AuditEvent::execution_finished(
            &self.execution_id,
            status,
            duration_ms,
            succeeded,
            failed,
            skipped,
        ));
        info!(execution = %self.execution_id, %status, duration_ms, "execution finished");

        let mut operations = BTreeMap::new();
        for (id, record) in self.records {
            operations.insert(
                id.as_str().to_string(),
                OperationSummary {
                    status: record.status,
                    duration_ms: record.duration_ms,
                    result: record.result,
                    error: record.error,
                },
            );
        }

        ExecutionResponse {
            execution_id: self.execution_id,
            status,
            operations,
            data: project_data(
                &self.model,
                &self.engine.config.response,
                self.engine.response_format,
            ),
            duration_ms,
        }
    }

    fn aggregate_status(&self, aborted: bool) -> ExecutionStatus {
        let (succeeded, failed, skipped) = self.counts();
        if aborted || failed > 0 {
            if succeeded > 0 || skipped > 0 {
                ExecutionStatus::PartialSuccess
            } else {
                ExecutionStatus::Failed
            }
        } else if skipped > 0 {
            ExecutionStatus::PartialSuccess
        } else {
            ExecutionStatus::Success
        }
    }

    fn counts(&self) -> (usize, usize, usize) {
        let mut succeeded = 0;
        let mut failed = 0;
        let mut skipped = 0;
        for record in self.records.values() {
            match record.status {
                OperationStatus::Success => succeeded += 1,
                OperationStatus::Failed => failed += 1,
                OperationStatus::Skipped => skipped += 1,
                _ => {}
            }
        }
        (succeeded, failed, skipped)
    }

    // ========================================================================
    // SINGLE OPERATION
    // ========================================================================

    async fn run_operation(&mut self, id: &OperationId) -> OpOutcome {
        let started = Instant::now();
        let def = match self.workflow.get(id) {
            Some(def) => def.clone(),
            None => {
                let err = EngineError::Execution(format!("operation {id} disappeared"));
                self.fail_operation(id, err.clone(), 0);
                return OpOutcome::Failed(err);
            }
        };
        let kind: OperationKind = def.kind.parse().expect("kind was validated");

        // Conditional gating.
        if self.gated.contains(id) {
            self.skip_operation(id, &def.args, started);
            return OpOutcome::Skipped;
        }
        // Skip propagation: reading anything a skipped operation would have
        // produced skips this operation too.
        match collect_references(&def.args) {
            Ok(refs) => {
                let tainted = refs.iter().any(|r| {
                    self.skipped_outputs.iter().any(|out| out.is_prefix_of(r))
                });
                if tainted {
                    self.skip_operation(id, &def.args, started);
                    return OpOutcome::Skipped;
                }
            }
            Err(err) => {
                self.fail_operation(id, err.clone(), ms_since(started));
                return OpOutcome::Failed(err);
            }
        }

        self.records.get_mut(id).expect("record exists").status = OperationStatus::Running;
        self.engine.audit.append(AuditEvent::operation_started(
            &self.execution_id,
            id,
            kind.as_str(),
            &def.args,
        ));

        match self.execute_operation(id, kind, &def.args).await {
            Ok(result) => {
                let duration = ms_since(started);
                let record = self.records.get_mut(id).expect("record exists");
                record.status = OperationStatus::Success;
                record.duration_ms = duration;
                record.result = Some(result);
                self.engine.audit.append(AuditEvent::operation_finished(
                    &self.execution_id,
                    id,
                    OperationStatus::Success,
                    duration,
                    None,
                ));
                OpOutcome::Done
            }
            Err(err) => {
                self.fail_operation(id, err.clone(), ms_since(started));
                OpOutcome::Failed(err)
            }
        }
    }

    /// Steps 2-7 of the execution loop for one operation: resolve, inject,
    /// consult the cache, take a rate-limit slot, dispatch, write back.
    ///
    /// Written as an explicit boxed future (rather than `async fn`) to break
    /// the async type cycle with `run_loop`/`run_body_operation`: rustc
    /// cannot infer the hidden type of a recursive `async fn`'s opaque
    /// return type, even when the recursive call is itself boxed.
    fn execute_operation<'a>(
        &'a mut self,
        id: &'a OperationId,
        kind: OperationKind,
        raw_args: &'a Value,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Value, EngineError>> + Send + 'a>>
    {
        Box::pin(async move {
            // Reference resolution against the current data model.
            let resolved = resolve_references(raw_args, &|path| self.model.read(path))?;

            // Credential injection; the canonical view replaces secrets with a
            // stable placeholder and is the only view that may reach cache keys.
            let (injected, canonical) = self.inject_credentials(id, resolved).await?;
            let args = OperationArgs::parse(kind, &injected)?;

            let cacheable = args.is_cacheable() && !self.engine.cache.ttl_for(kind).is_zero();
            let key = cacheable.then(|| cache_key(kind, &canonical));
            if let Some(key) = &key {
                if let Some(result) = self.engine.cache.get(key) {
                    debug!(operation = %id, "cache hit");
                    self.write_output(&args, &result)?;
                    return Ok(result);
                }
            }

            self.engine
                .rate_limiter
                .acquire(self.agent_id, kind, &self.cancel)
                .await?;

            let result = self.dispatch(id, &args).await?;

            self.write_output(&args, &result)?;
            if let Some(key) = key {
                self.engine.cache.set(kind, key, result.clone());
            }
            Ok(result)
        })
    }

    async fn dispatch(
        &mut self,
        id: &OperationId,
        args: &OperationArgs,
    ) -> Result<Value, EngineError> {
        match args {
            OperationArgs::ApiCall(api) => {
                let headers = string_headers(&api.headers)?;
                let engine = self.engine;
                let cancel = self.cancel.clone();
                engine
                    .retry
                    .run(id.as_str(), &cancel, || {
                        engine
                            .http
                            .execute(api, &headers, api.body.as_ref(), &cancel)
                    })
                    .await
            }
            OperationArgs::Filter(filter) => {
                let input = self.read_input(&filter.input_path)?;
                apply_filter(&input, &filter.conditions)
                    .map_err(|e| at_path(e, &filter.input_path))
            }
            OperationArgs::Transform(transform) => {
                let input = self.read_input(&transform.input_path)?;
                apply_transform(&input, transform)
            }
            OperationArgs::Merge(merge) => {
                let mut sources = Vec::with_capacity(merge.sources.len());
                for source in &merge.sources {
                    sources.push(self.read_input(source)?);
                }
                apply_merge(&sources, merge.strategy)
            }
            OperationArgs::Conditional(conditional) => {
                let path = DataPath::parse(&conditional.condition.path)?;
                let current = self.model.read(&path).ok();
                let taken = evaluate_condition(current.as_ref(), &conditional.condition)?;
                let not_taken = if taken {
                    &conditional.if_false
                } else {
                    &conditional.if_true
                };
                for gated_id in not_taken {
                    let gated_id = OperationId::new(gated_id.clone());
                    if let Some(def) = self.workflow.get(&gated_id) {
                        if let Ok(parsed) = OperationArgs::parse(
                            def.kind.parse().expect("kind was validated"),
                            &def.args,
                        ) {
                            if let Ok(Some(path)) = parsed.parsed_output_path() {
                                self.skipped_outputs.push(path);
                            }
                        }
                    }
                    self.gated.insert(gated_id);
                }
                Ok(json!({ "condition": taken }))
            }
            OperationArgs::Loop(_) => {
                // Boxed to break the async type cycle (dispatch -> run_loop
                // -> run_body_operation -> dispatch); the validator rejects
                // nested Loops, so this never actually recurses.
                let fut: std::pin::Pin<
                    Box<dyn std::future::Future<Output = Result<Value, EngineError>> + Send + '_>,
                > = Box::pin(self.run_loop(id, args));
                fut.await
            }
            OperationArgs::Store(store) => {
                let input = self.read_input(&store.input_path)?;
                self.engine
                    .storage
                    .put(store.storage.namespace(), &store.key, input)
                    .await?;
                Ok(json!({ "stored": true, "key": store.key }))
            }
            OperationArgs::Wait(w) => {
                let remaining = self.deadline.saturating_duration_since(Instant::now());
                if Duration::from_millis(w.duration) > remaining {
                    return Err(EngineError::Resource(format!(
                        "Wait of {}ms exceeds the remaining execution budget",
                        w.duration
                    )));
                }
                wait(w.duration, &self.cancel).await?;
                Ok(Value::Null)
            }
        }
    }

    async fn run_loop(
        &mut self,
        id: &OperationId,
        args: &OperationArgs,
    ) -> Result<Value, EngineError> {
        let OperationArgs::Loop(l) = args else {
            unreachable!("run_loop is only dispatched for Loop args")
        };
        let items = self.read_input(&l.input_path)?;
        let items = items.as_array().cloned().ok_or_else(|| EngineError::Data {
            path: l.input_path.clone(),
            message: "Loop requires an array input".to_string(),
        })?;

        let scratch = DataPath::root().child("_loop");
        let body_ids: Vec<OperationId> =
            l.operations.iter().map(|s| OperationId::new(s.clone())).collect();
        let last_output = body_ids
            .last()
            .and_then(|last| self.workflow.get(last))
            .and_then(|def| {
                let kind: OperationKind = def.kind.parse().ok()?;
                OperationArgs::parse(kind, &def.args).ok()?.parsed_output_path().ok()?
            });

        let mut collected = Vec::new();
        let result = 'iterations: {
            for (index, item) in items.iter().enumerate() {
                if self.cancel.is_cancelled() {
                    break 'iterations Err(EngineError::Cancelled);
                }
                if Instant::now() >= self.deadline {
                    break 'iterations Err(EngineError::Resource(
                        "execution budget exhausted inside Loop".to_string(),
                    ));
                }
                if let Err(e) = self
                    .model
                    .write(&scratch.child("current"), item.clone())
                    .and_then(|_| self.model.write(&scratch.child("index"), json!(index)))
                {
                    break 'iterations Err(e);
                }

                for body_id in &body_ids {
                    // Boxed to break the async type cycle (Loop -> body ->
                    // dispatch); the validator rejects nested Loops, so this
                    // never actually recurses.
                    let body: std::pin::Pin<
                        Box<dyn std::future::Future<Output = OpOutcome> + Send + '_>,
                    > = Box::pin(self.run_body_operation(body_id));
                    match body.await {
                        OpOutcome::Done | OpOutcome::Skipped => {}
                        OpOutcome::Failed(err) => {
                            warn!(operation = %id, iteration = index, "loop aborted");
                            break 'iterations Err(err);
                        }
                    }
                }
                if let Some(out) = &last_output {
                    if let Ok(value) = self.model.read(out) {
                        collected.push(value);
                    }
                }
            }
            Ok(())
        };
        self.model.remove_head("_loop");
        result?;

        if l.output_path.is_some() {
            Ok(Value::Array(collected))
        } else {
            Ok(json!({ "iterations": items.len() }))
        }
    }

    /// Loop bodies go through the same record/audit lifecycle as ordered
    /// operations. The validator guarantees a body is never another Loop,
    /// so this cannot recurse.
    async fn run_body_operation(&mut self, id: &OperationId) -> OpOutcome {
        let started = Instant::now();
        let def = match self.workflow.get(id) {
            Some(def) => def.clone(),
            None => {
                let err = EngineError::Execution(format!("operation {id} disappeared"));
                return OpOutcome::Failed(err);
            }
        };
        let kind: OperationKind = def.kind.parse().expect("kind was validated");
        debug_assert!(kind != OperationKind::Loop, "validator rejects nested loops");

        self.records.get_mut(id).expect("record exists").status = OperationStatus::Running;
        self.engine.audit.append(AuditEvent::operation_started(
            &self.execution_id,
            id,
            kind.as_str(),
            &def.args,
        ));
        match self.execute_operation(id, kind, &def.args).await {
            Ok(result) => {
                let duration = ms_since(started);
                let record = self.records.get_mut(id).expect("record exists");
                record.status = OperationStatus::Success;
                record.duration_ms = duration;
                record.result = Some(result);
                self.engine.audit.append(AuditEvent::operation_finished(
                    &self.execution_id,
                    id,
                    OperationStatus::Success,
                    duration,
                    None,
                ));
                OpOutcome::Done
            }
            Err(err) => {
                self.fail_operation(id, err.clone(), ms_since(started));
                OpOutcome::Failed(err)
            }
        }
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    fn read_input(&self, path: &str) -> Result<Value, EngineError> {
        self.model.read(&DataPath::parse(path)?)
    }

    fn write_output(&mut self, args: &OperationArgs, result: &Value) -> Result<(), EngineError> {
        if let Some(path) = args.parsed_output_path()? {
            // An ApiCall's operation result is the full response envelope;
            // downstream operations consume the payload, so the data model
            // gets the body.
            let value = match args {
                OperationArgs::ApiCall(_) => {
                    result.get("body").cloned().unwrap_or(Value::Null)
                }
                _ => result.clone(),
            };
            self.model.write(&path, value)?;
        }
        Ok(())
    }

    /// Resolve every credential reference: the injected view carries the
    /// formatted plaintext, the canonical view carries the placeholder.
    async fn inject_credentials(
        &self,
        id: &OperationId,
        resolved: Value,
    ) -> Result<(Value, Value), EngineError> {
        let mut refs = Vec::new();
        find_credential_refs(&resolved, "", &mut refs);
        if refs.is_empty() {
            let canonical = resolved.clone();
            return Ok((resolved, canonical));
        }

        let mut replacements: HashMap<String, String> = HashMap::new();
        for (location, credential_id) in &refs {
            if !replacements.contains_key(credential_id) {
                let credential = self.engine.credentials.resolve(credential_id).await?;
                self.engine.audit.append(AuditEvent::credential_used(
                    &self.execution_id,
                    id,
                    credential_id,
                    credential.kind.as_str(),
                    location,
                ));
                replacements.insert(credential_id.clone(), credential.formatted());
            }
        }

        let mut injected = resolved.clone();
        substitute_credentials(&mut injected, &|id| replacements.get(id).cloned());
        let mut canonical = resolved;
        substitute_credentials(&mut canonical, &|_| {
            Some(CREDENTIAL_PLACEHOLDER.to_string())
        });
        Ok((injected, canonical))
    }

    fn skip_operation(&mut self, id: &OperationId, raw_args: &Value, started: Instant) {
        // The operation's own output becomes tainted for everything
        // downstream of it.
        if let Some(def) = self.workflow.get(id) {
            if let Ok(kind) = def.kind.parse::<OperationKind>() {
                if let Ok(parsed) = OperationArgs::parse(kind, raw_args) {
                    if let Ok(Some(path)) = parsed.parsed_output_path() {
                        self.skipped_outputs.push(path);
                    }
                }
            }
        }
        let duration = ms_since(started);
        let record = self.records.get_mut(id).expect("record exists");
        record.status = OperationStatus::Skipped;
        record.duration_ms = duration;
        self.engine.audit.append(AuditEvent::operation_finished(
            &self.execution_id,
            id,
            OperationStatus::Skipped,
            duration,
            None,
        ));
    }

    fn fail_operation(&mut self, id: &OperationId, err: EngineError, duration_ms: u64) {
        warn!(operation = %id, error = %err, "operation failed");
        let record = self.records.get_mut(id).expect("record exists");
        record.status = OperationStatus::Failed;
        record.duration_ms = duration_ms;
        record.error = Some(err.report(Some(id)));
        self.engine.audit.append(AuditEvent::operation_finished(
            &self.execution_id,
            id,
            OperationStatus::Failed,
            duration_ms,
            Some(err.to_string()),
        ));
    }
}

fn ms_since(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn at_path(err: EngineError, path: &str) -> EngineError {
    match err {
        EngineError::Data { path: p, message } if p.is_empty() => EngineError::Data {
            path: path.to_string(),
            message,
        },
        other => other,
    }
}

/// Headers after injection must all be plain strings.
fn string_headers(
    headers: &BTreeMap<String, Value>,
) -> Result<BTreeMap<String, String>, EngineError> {
    let mut out = BTreeMap::new();
    for (name, value) in headers {
        match value {
            Value::String(s) => {
                out.insert(name.clone(), s.clone());
            }
            other => {
                return Err(EngineError::Structure(format!(
                    "header {name} did not resolve to a string (got {})",
                    match other {
                        Value::Object(_) => "object",
                        Value::Array(_) => "array",
                        Value::Number(_) => "number",
                        Value::Bool(_) => "boolean",
                        Value::Null => "null",
                        Value::String(_) => unreachable!(),
                    }
                )))
            }
        }
    }
    Ok(out)
}

fn find_credential_refs(value: &Value, location: &str, out: &mut Vec<(String, String)>) {
    if cascade_core::is_credential_ref(value) {
        if let Some(id) = value["credentialRef"]["id"].as_str() {
            out.push((location.to_string(), id.to_string()));
        }
        return;
    }
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let child_location = if location.is_empty() {
                    key.clone()
                } else {
                    format!("{location}.{key}")
                };
                find_credential_refs(child, &child_location, out);
            }
        }
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                find_credential_refs(item, &format!("{location}[{index}]"), out);
            }
        }
        _ => {}
    }
}

fn substitute_credentials(value: &mut Value, lookup: &impl Fn(&str) -> Option<String>) {
    if cascade_core::is_credential_ref(value) {
        if let Some(id) = value["credentialRef"]["id"].as_str() {
            if let Some(replacement) = lookup(id) {
                *value = Value::String(replacement);
            }
        }
        return;
    }
    match value {
        Value::Object(map) => {
            for child in map.values_mut() {
                substitute_credentials(child, lookup);
            }
        }
        Value::Array(items) => {
            for item in items {
                substitute_credentials(item, lookup);
            }
        }
        _ => {}
    }
}

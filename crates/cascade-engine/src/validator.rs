//! Static workflow validation.
//!
//! Four phases, run in order, short-circuiting on the first phase that
//! produces errors so findings stay actionable: structure, permission,
//! dependency, type. Warnings never block execution.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use cascade_core::{
    collect_references, is_credential_ref, DataPath, ExecutionLimits, Issue, IssueCategory,
    OperationId, ParsedWorkflow,
};
use cascade_catalog::{
    url_host, url_path, OperationArgs, OperationKind, OutputType, MAX_WAIT_MS,
};
use serde_json::Value;

use crate::traits::AllowedCatalog;

/// The validation response shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<Issue>,
    pub warnings: Vec<Issue>,
}

impl ValidationReport {
    pub fn from_issues(issues: Vec<Issue>) -> Self {
        let (errors, warnings): (Vec<Issue>, Vec<Issue>) =
            issues.into_iter().partition(Issue::is_error);
        Self {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

/// Validates parsed workflows against the catalog and one agent's
/// permissions.
pub struct Validator<'a> {
    allowed: &'a AllowedCatalog,
    limits: &'a ExecutionLimits,
}

/// Typed view of one defined operation, built during the structure phase.
struct CheckedOp<'a> {
    id: &'a OperationId,
    kind: OperationKind,
    args: OperationArgs,
    raw_args: &'a Value,
}

impl<'a> Validator<'a> {
    pub fn new(allowed: &'a AllowedCatalog, limits: &'a ExecutionLimits) -> Self {
        Self { allowed, limits }
    }

    pub fn validate(&self, workflow: &ParsedWorkflow) -> ValidationReport {
        let mut issues = Vec::new();

        let checked = self.check_structure(workflow, &mut issues);
        if issues.iter().any(Issue::is_error) {
            return ValidationReport::from_issues(issues);
        }

        self.check_permissions(&checked, &mut issues);
        if issues.iter().any(Issue::is_error) {
            return ValidationReport::from_issues(issues);
        }

        self.check_dependencies(workflow, &checked, &mut issues);
        if issues.iter().any(Issue::is_error) {
            return ValidationReport::from_issues(issues);
        }

        self.check_types(workflow, &checked, &mut issues);
        ValidationReport::from_issues(issues)
    }

    // ========================================================================
    // PHASE 1: STRUCTURE
    // ========================================================================

    fn check_structure<'w>(
        &self,
        workflow: &'w ParsedWorkflow,
        issues: &mut Vec<Issue>,
    ) -> Vec<CheckedOp<'w>> {
        let error = |message: String| Issue::error(IssueCategory::Structure, message);

        if workflow.order.is_empty() {
            issues.push(error("operationOrder must not be empty".into()));
        }
        if workflow.operations.len() > self.limits.max_operations_per_workflow {
            issues.push(error(format!(
                "workflow defines {} operations, cap is {}",
                workflow.operations.len(),
                self.limits.max_operations_per_workflow
            )));
        }

        let mut seen = HashSet::new();
        for id in &workflow.order {
            if !seen.insert(id) {
                issues.push(error(format!("duplicate id in operationOrder: {id}")));
            }
            if workflow.get(id).is_none() {
                issues.push(error(format!(
                    "operationOrder references undefined operation: {id}"
                )));
            }
        }

        let mut checked = Vec::with_capacity(workflow.operations.len());
        for def in workflow.operations.values() {
            let kind: OperationKind = match def.kind.parse() {
                Ok(kind) => kind,
                Err(_) => {
                    issues.push(
                        error(format!("unknown operation kind: {}", def.kind))
                            .for_operation(def.id.as_str()),
                    );
                    continue;
                }
            };
            let args = match OperationArgs::parse(kind, &def.args) {
                Ok(args) => args,
                Err(e) => {
                    issues.push(error(e.to_string()).for_operation(def.id.as_str()));
                    continue;
                }
            };
            self.check_op_shape(&def.id, &args, workflow, issues);
            checked.push(CheckedOp {
                id: &def.id,
                kind,
                args,
                raw_args: &def.args,
            });
        }

        checked
    }

    fn check_op_shape(
        &self,
        id: &OperationId,
        args: &OperationArgs,
        workflow: &ParsedWorkflow,
        issues: &mut Vec<Issue>,
    ) {
        let error = |message: String| {
            Issue::error(IssueCategory::Structure, message).for_operation(id.as_str())
        };

        match args.parsed_output_path() {
            Err(e) => issues.push(error(format!("invalid outputPath: {e}"))),
            Ok(Some(path)) if path.is_root() => {
                issues.push(error("outputPath must point below /workflow".into()))
            }
            Ok(_) => {}
        }

        match args {
            OperationArgs::Wait(wait) => {
                if wait.duration > MAX_WAIT_MS {
                    issues.push(error(format!(
                        "Wait duration {}ms exceeds the {MAX_WAIT_MS}ms cap",
                        wait.duration
                    )));
                }
            }
            OperationArgs::Merge(merge) => {
                if merge.sources.len() < 2 {
                    issues.push(
                        error("MergeData requires at least two sources".into())
                            .with_suggestion("Use a direct reference for single-source data"),
                    );
                }
            }
            OperationArgs::Loop(l) => {
                let in_order: HashSet<&OperationId> = workflow.order.iter().collect();
                for body_id in &l.operations {
                    let body_id = OperationId::new(body_id.clone());
                    match workflow.get(&body_id) {
                        None => issues.push(error(format!(
                            "Loop references undefined operation: {body_id}"
                        ))),
                        Some(body) => {
                            if body.kind == OperationKind::Loop.as_str() {
                                issues.push(error(format!(
                                    "Loop body operation {body_id} must not be another Loop"
                                )));
                            }
                            if in_order.contains(&body_id) {
                                issues.push(error(format!(
                                    "Loop body operation {body_id} must not appear in operationOrder"
                                )));
                            }
                        }
                    }
                }
                issues.push(
                    Issue::warning(
                        IssueCategory::Structure,
                        "Loop execution time grows with its input array",
                    )
                    .for_operation(id.as_str()),
                );
            }
            OperationArgs::Conditional(conditional) => {
                let positions: HashMap<&OperationId, usize> = workflow
                    .order
                    .iter()
                    .enumerate()
                    .map(|(i, id)| (id, i))
                    .collect();
                let own_position = positions.get(id).copied();
                if own_position.is_none() {
                    issues.push(
                        Issue::warning(
                            IssueCategory::Structure,
                            "Conditional is not in operationOrder and will never gate anything",
                        )
                        .for_operation(id.as_str()),
                    );
                }
                for branch_id in conditional
                    .if_true
                    .iter()
                    .chain(conditional.if_false.iter())
                {
                    let branch_id = OperationId::new(branch_id.clone());
                    if workflow.get(&branch_id).is_none() {
                        issues.push(error(format!(
                            "Conditional references undefined operation: {branch_id}"
                        )));
                        continue;
                    }
                    match (own_position, positions.get(&branch_id)) {
                        (Some(_), None) => issues.push(error(format!(
                            "Conditional branch operation {branch_id} must appear in operationOrder"
                        ))),
                        (Some(own), Some(branch)) if branch <= &own => {
                            issues.push(error(format!(
                                "Conditional branch operation {branch_id} must be ordered after the Conditional"
                            )))
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    // ========================================================================
    // PHASE 2: PERMISSION
    // ========================================================================

    fn check_permissions(&self, checked: &[CheckedOp<'_>], issues: &mut Vec<Issue>) {
        for op in checked {
            let error = |message: String| {
                Issue::error(IssueCategory::Permission, message).for_operation(op.id.as_str())
            };

            if !self.allowed.allows_kind(op.kind.as_str()) {
                issues.push(
                    error(format!("operation kind {} is not permitted", op.kind))
                        .with_suggestion("Request access to this operation kind"),
                );
            }

            if let OperationArgs::ApiCall(api) = &op.args {
                match url_host(&api.url) {
                    None => issues.push(error(format!(
                        "cannot determine the API host for operation {}",
                        op.id
                    ))),
                    Some(host) => {
                        if !self.allowed.allows_host(&host) {
                            issues.push(
                                error(format!("API host {host} is not permitted"))
                                    .with_suggestion("Request access to this API"),
                            );
                        } else {
                            self.check_endpoint(op, &host, issues);
                        }
                    }
                }
            }

            for (credential_id, in_headers) in collect_credential_refs(op.raw_args) {
                if !self.allowed.allows_credential(&credential_id) {
                    issues.push(
                        error(format!("credential {credential_id} is not permitted"))
                            .with_suggestion("Request access to this credential"),
                    );
                }
                if !in_headers {
                    issues.push(
                        Issue::warning(
                            IssueCategory::Permission,
                            format!(
                                "credential {credential_id} is referenced outside ApiCall headers"
                            ),
                        )
                        .for_operation(op.id.as_str()),
                    );
                }
            }
        }
    }

    fn check_endpoint(&self, op: &CheckedOp<'_>, host: &str, issues: &mut Vec<Issue>) {
        let OperationArgs::ApiCall(api) = &op.args else {
            return;
        };
        let endpoints = &self.allowed.apis[host];
        if endpoints.is_empty() {
            return;
        }
        let path = url_path(&api.url).unwrap_or_default();
        let method = api.method.to_string();
        let known = endpoints
            .iter()
            .any(|e| e.path == path && e.method.eq_ignore_ascii_case(&method));
        if !known {
            issues.push(
                Issue::warning(
                    IssueCategory::Permission,
                    format!("endpoint {method} {path} is not declared for host {host}"),
                )
                .for_operation(op.id.as_str())
                .with_suggestion("Verify the endpoint exists in the API definition"),
            );
        }
    }

    // ========================================================================
    // PHASE 3: DEPENDENCY
    // ========================================================================

    fn check_dependencies(
        &self,
        workflow: &ParsedWorkflow,
        checked: &[CheckedOp<'_>],
        issues: &mut Vec<Issue>,
    ) {
        let by_id: HashMap<&OperationId, &CheckedOp<'_>> =
            checked.iter().map(|op| (op.id, op)).collect();

        let mut produced: Vec<DataPath> = Vec::new();
        for id in &workflow.order {
            let Some(op) = by_id.get(id) else { continue };
            self.check_op_reads(op, &produced, false, issues);

            // A Loop also validates its body against the state available at
            // its own position, plus the loop scratch bindings and earlier
            // body outputs.
            if let OperationArgs::Loop(l) = &op.args {
                let mut loop_scope = produced.clone();
                loop_scope.push(DataPath::root().child("_loop"));
                for body_id in &l.operations {
                    let body_id = OperationId::new(body_id.clone());
                    if let Some(body) = by_id.get(&body_id) {
                        self.check_op_reads(body, &loop_scope, true, issues);
                        if let Ok(Some(path)) = body.args.parsed_output_path() {
                            loop_scope.push(path);
                        }
                    }
                }
            }

            if let Ok(Some(path)) = op.args.parsed_output_path() {
                produced.push(path);
            }
        }
    }

    fn check_op_reads(
        &self,
        op: &CheckedOp<'_>,
        produced: &[DataPath],
        in_loop: bool,
        issues: &mut Vec<Issue>,
    ) {
        let refs = match collect_references(op.raw_args) {
            Ok(refs) => refs,
            Err(e) => {
                issues.push(
                    Issue::error(IssueCategory::Dependency, e.to_string())
                        .for_operation(op.id.as_str()),
                );
                return;
            }
        };
        for reference in refs {
            let satisfied = produced.iter().any(|out| out.is_prefix_of(&reference));
            if !satisfied {
                let where_hint = if in_loop {
                    "an operation ordered before the Loop"
                } else {
                    "an earlier operation in operationOrder"
                };
                issues.push(
                    Issue::error(
                        IssueCategory::Dependency,
                        format!("{reference} is not produced by {where_hint}"),
                    )
                    .for_operation(op.id.as_str())
                    .with_suggestion(format!(
                        "Order an operation whose outputPath covers {reference} before this one"
                    )),
                );
            }
        }
    }

    // ========================================================================
    // PHASE 4: TYPE
    // ========================================================================

    fn check_types(
        &self,
        workflow: &ParsedWorkflow,
        checked: &[CheckedOp<'_>],
        issues: &mut Vec<Issue>,
    ) {
        let by_id: HashMap<&OperationId, &CheckedOp<'_>> =
            checked.iter().map(|op| (op.id, op)).collect();

        // Declared output types by exact outputPath, in order.
        let mut output_types: HashMap<String, OutputType> = HashMap::new();
        for id in &workflow.order {
            let Some(op) = by_id.get(id) else { continue };

            let mut require_array = |path: &str| {
                // Only an exact producer match carries a declared type; a
                // reference deeper into a produced subtree is dynamic.
                if let Some(output) = output_types.get(path) {
                    if !output.satisfies_array() {
                        issues.push(
                            Issue::error(
                                IssueCategory::Type,
                                format!(
                                    "{} requires an array input but {path} is not array-typed",
                                    op.kind
                                ),
                            )
                            .for_operation(op.id.as_str())
                            .with_suggestion("Produce an array at this path, or transform it first"),
                        );
                    }
                }
            };

            match &op.args {
                OperationArgs::Filter(f) => require_array(&f.input_path),
                OperationArgs::Loop(l) => require_array(&l.input_path),
                OperationArgs::Merge(m) => {
                    for source in &m.sources {
                        require_array(source);
                    }
                }
                _ => {}
            }

            if let Some(path) = op.args.output_path() {
                output_types.insert(path.to_string(), op.args.declared_output());
            }
        }
    }
}

/// Every `{"credentialRef": {"id": ...}}` in an argument tree, with whether
/// it sits under a `headers` object.
fn collect_credential_refs(args: &Value) -> Vec<(String, bool)> {
    let mut out = Vec::new();
    walk_credentials(args, false, &mut out);
    out
}

fn walk_credentials(value: &Value, in_headers: bool, out: &mut Vec<(String, bool)>) {
    if is_credential_ref(value) {
        if let Some(id) = value["credentialRef"]["id"].as_str() {
            out.push((id.to_string(), in_headers));
        }
        return;
    }
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                walk_credentials(child, in_headers || key == "headers", out);
            }
        }
        Value::Array(items) => {
            for item in items {
                walk_credentials(item, in_headers, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{CredentialType, EndpointSpec};
    use cascade_core::parse_workflow;

    fn allow_all() -> AllowedCatalog {
        let mut catalog = AllowedCatalog::default();
        for kind in OperationKind::ALL {
            catalog.operation_kinds.insert(kind.as_str().to_string());
        }
        catalog.apis.insert("api.example.com".into(), vec![]);
        catalog
            .credentials
            .insert("github".into(), CredentialType::BearerToken);
        catalog
    }

    fn validate(stream: &str) -> ValidationReport {
        validate_with(stream, &allow_all())
    }

    fn validate_with(stream: &str, allowed: &AllowedCatalog) -> ValidationReport {
        let workflow = parse_workflow(stream.as_bytes()).expect("parseable");
        let limits = ExecutionLimits::default();
        Validator::new(allowed, &limits).validate(&workflow)
    }

    const FETCH_FILTER: &str = r#"
{"type":"operationUpdate","operationId":"a","operation":{"ApiCall":{"method":"GET","url":"https://api.example.com/users","outputPath":"/workflow/users"}}}
{"type":"operationUpdate","operationId":"b","operation":{"FilterData":{"inputPath":"/workflow/users","conditions":[{"field":"points","operator":">","value":100}],"outputPath":"/workflow/top"}}}
{"type":"beginExecution","executionId":"e1","operationOrder":["a","b"]}
"#;

    #[test]
    fn test_valid_workflow_passes() {
        let report = validate(FETCH_FILTER);
        assert!(report.valid, "unexpected errors: {:?}", report.errors);
    }

    #[test]
    fn test_forward_reference_is_dependency_error() {
        let swapped = FETCH_FILTER.replace(r#"["a","b"]"#, r#"["b","a"]"#);
        let report = validate(&swapped);
        assert!(!report.valid);
        assert_eq!(report.errors[0].category, IssueCategory::Dependency);
    }

    #[test]
    fn test_empty_order_rejected() {
        let stream = r#"
{"type":"operationUpdate","operationId":"a","operation":{"Wait":{"duration":0}}}
{"type":"beginExecution","executionId":"e1","operationOrder":[]}
"#;
        let report = validate(stream);
        assert!(!report.valid);
        assert_eq!(report.errors[0].category, IssueCategory::Structure);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let stream = r#"
{"type":"operationUpdate","operationId":"a","operation":{"Teleport":{}}}
{"type":"beginExecution","executionId":"e1","operationOrder":["a"]}
"#;
        let report = validate(stream);
        assert!(!report.valid);
        assert!(report.errors[0].message.contains("unknown operation kind"));
    }

    #[test]
    fn test_disallowed_kind_is_permission_error() {
        let mut allowed = allow_all();
        allowed.operation_kinds.remove("ApiCall");
        let report = validate_with(FETCH_FILTER, &allowed);
        assert!(!report.valid);
        assert_eq!(report.errors[0].category, IssueCategory::Permission);
    }

    #[test]
    fn test_unknown_host_is_permission_error() {
        let stream = FETCH_FILTER.replace("api.example.com", "evil.example.net");
        let report = validate(&stream);
        assert!(!report.valid);
        assert!(report
            .errors
            .iter()
            .any(|i| i.category == IssueCategory::Permission
                && i.message.contains("evil.example.net")));
    }

    #[test]
    fn test_unknown_credential_is_permission_error() {
        let stream = r#"
{"type":"operationUpdate","operationId":"a","operation":{"ApiCall":{"method":"GET","url":"https://api.example.com/users","headers":{"Authorization":{"credentialRef":{"id":"missing"}}},"outputPath":"/workflow/users"}}}
{"type":"beginExecution","executionId":"e1","operationOrder":["a"]}
"#;
        let report = validate(stream);
        assert!(!report.valid);
        assert_eq!(report.errors[0].category, IssueCategory::Permission);
        assert!(report.errors[0].message.contains("missing"));
    }

    #[test]
    fn test_merge_single_source_rejected() {
        let stream = r#"
{"type":"operationUpdate","operationId":"a","operation":{"ApiCall":{"method":"GET","url":"https://api.example.com/users","outputPath":"/workflow/users"}}}
{"type":"operationUpdate","operationId":"m","operation":{"MergeData":{"sources":["/workflow/users"],"strategy":"concat","outputPath":"/workflow/merged"}}}
{"type":"beginExecution","executionId":"e1","operationOrder":["a","m"]}
"#;
        let report = validate(stream);
        assert!(!report.valid);
        assert!(report.errors[0].message.contains("two sources"));
    }

    #[test]
    fn test_wait_duration_cap() {
        let stream = r#"
{"type":"operationUpdate","operationId":"w","operation":{"Wait":{"duration":600001}}}
{"type":"beginExecution","executionId":"e1","operationOrder":["w"]}
"#;
        let report = validate(stream);
        assert!(!report.valid);
        assert!(report.errors[0].message.contains("cap"));
    }

    #[test]
    fn test_type_phase_rejects_scalar_into_filter() {
        let stream = r#"
{"type":"operationUpdate","operationId":"a","operation":{"ApiCall":{"method":"GET","url":"https://api.example.com/n","outputPath":"/workflow/items"}}}
{"type":"operationUpdate","operationId":"agg","operation":{"TransformData":{"inputPath":"/workflow/items","transform":"aggregate","config":{"field":"n","function":"sum"},"outputPath":"/workflow/total"}}}
{"type":"operationUpdate","operationId":"f","operation":{"FilterData":{"inputPath":"/workflow/total","conditions":[],"outputPath":"/workflow/out"}}}
{"type":"beginExecution","executionId":"e1","operationOrder":["a","agg","f"]}
"#;
        let report = validate(stream);
        assert!(!report.valid);
        assert_eq!(report.errors[0].category, IssueCategory::Type);
    }

    #[test]
    fn test_conditional_branch_must_follow() {
        let stream = r#"
{"type":"operationUpdate","operationId":"a","operation":{"ApiCall":{"method":"GET","url":"https://api.example.com/users","outputPath":"/workflow/users"}}}
{"type":"operationUpdate","operationId":"gate","operation":{"Conditional":{"condition":{"path":"/workflow/users","operator":"empty"},"ifTrue":["a"]}}}
{"type":"beginExecution","executionId":"e1","operationOrder":["a","gate"]}
"#;
        let report = validate(stream);
        assert!(!report.valid);
        assert!(report.errors[0].message.contains("ordered after"));
    }

    #[test]
    fn test_loop_body_not_in_order() {
        let stream = r#"
{"type":"operationUpdate","operationId":"a","operation":{"ApiCall":{"method":"GET","url":"https://api.example.com/users","outputPath":"/workflow/users"}}}
{"type":"operationUpdate","operationId":"body","operation":{"FilterData":{"inputPath":"/workflow/users","conditions":[],"outputPath":"/workflow/one"}}}
{"type":"operationUpdate","operationId":"loop","operation":{"Loop":{"inputPath":"/workflow/users","operations":["body"],"outputPath":"/workflow/out"}}}
{"type":"beginExecution","executionId":"e1","operationOrder":["a","body","loop"]}
"#;
        let report = validate(stream);
        assert!(!report.valid);
        assert!(report
            .errors
            .iter()
            .any(|i| i.message.contains("must not appear in operationOrder")));
    }

    #[test]
    fn test_endpoint_warning() {
        let mut allowed = allow_all();
        allowed.apis.insert(
            "api.example.com".into(),
            vec![EndpointSpec {
                method: "GET".into(),
                path: "/accounts".into(),
            }],
        );
        let report = validate_with(FETCH_FILTER, &allowed);
        assert!(report.valid);
        assert!(report
            .warnings
            .iter()
            .any(|w| w.message.contains("/users")));
    }
}

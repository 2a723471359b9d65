//! TL-001: Core types - resource specs, input values, state records, run reports.

use super::cell::Output;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

/// Remote attributes returned by a provider. Always carries `id`.
pub type Attributes = BTreeMap<String, Value>;

/// Current state record schema version.
pub const STATE_SCHEMA: &str = "1.0";

// ============================================================================
// Declarations
// ============================================================================

/// A single input field of a resource.
#[derive(Debug, Clone)]
pub enum InputValue {
    /// A value known at declaration time.
    Literal(Value),
    /// A reference to another resource's output, possibly composed.
    Deferred(Output<Value>),
}

impl InputValue {
    /// Resource ids this input reads from.
    pub fn dependencies(&self) -> BTreeSet<String> {
        match self {
            Self::Literal(_) => BTreeSet::new(),
            Self::Deferred(out) => out.dependencies().clone(),
        }
    }
}

impl From<Value> for InputValue {
    fn from(v: Value) -> Self {
        Self::Literal(v)
    }
}

impl From<&str> for InputValue {
    fn from(s: &str) -> Self {
        Self::Literal(Value::String(s.to_string()))
    }
}

impl From<String> for InputValue {
    fn from(s: String) -> Self {
        Self::Literal(Value::String(s))
    }
}

impl From<Output<Value>> for InputValue {
    fn from(out: Output<Value>) -> Self {
        Self::Deferred(out)
    }
}

impl From<&Output<Value>> for InputValue {
    fn from(out: &Output<Value>) -> Self {
        Self::Deferred(out.clone())
    }
}

/// A declared request to ensure one remote object exists with given inputs.
#[derive(Debug, Clone)]
pub struct ResourceSpec {
    pub id: String,
    pub kind: String,
    pub inputs: IndexMap<String, InputValue>,
}

impl ResourceSpec {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            inputs: IndexMap::new(),
        }
    }

    /// Builder-style input setter.
    pub fn input(mut self, field: impl Into<String>, value: impl Into<InputValue>) -> Self {
        self.inputs.insert(field.into(), value.into());
        self
    }

    /// Derived dependency set: every resource id referenced by any input.
    /// A self-reference is kept so the graph reports it as a cycle.
    pub fn depends_on(&self) -> BTreeSet<String> {
        self.inputs.values().flat_map(|v| v.dependencies()).collect()
    }
}

/// How a kind converges when its inputs change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePolicy {
    /// Patch the existing remote object.
    InPlace,
    /// Delete the remote object, then create a new one.
    Replace,
}

/// Declared shape of a resource kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindSchema {
    pub kind: &'static str,
    pub required_inputs: &'static [&'static str],
    pub outputs: &'static [&'static str],
    pub update_policy: UpdatePolicy,
}

// ============================================================================
// State
// ============================================================================

/// Persisted record of a converged resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Record schema version
    pub schema: String,

    pub resource_id: String,

    pub kind: String,

    /// BLAKE3 over kind and resolved inputs
    pub inputs_hash: String,

    /// Attributes reported by the remote platform
    #[serde(default)]
    pub remote_attributes: Attributes,

    /// When the record was last written
    #[serde(default)]
    pub applied_at: Option<String>,
}

impl StateRecord {
    /// Remote object id, if the record still points at one.
    pub fn remote_id(&self) -> Option<String> {
        self.remote_attributes
            .get("id")
            .map(super::cell::value_to_string)
            .filter(|id| !id.is_empty())
    }
}

// ============================================================================
// Plan
// ============================================================================

/// Convergence action for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    Create,
    Update,
    Replace,
    NoOp,
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Update => write!(f, "UPDATE"),
            Self::Replace => write!(f, "REPLACE"),
            Self::NoOp => write!(f, "NO-OP"),
        }
    }
}

// ============================================================================
// Run results
// ============================================================================

/// What happened to a node during a run.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    Created,
    Updated,
    Replaced,
    Unchanged,
    Failed(super::error::NodeFailure),
    /// Not executed because a dependency did not converge.
    Skipped { dependency: String },
    /// Not executed because the run was cancelled.
    Cancelled,
}

impl NodeOutcome {
    pub fn from_action(action: PlanAction) -> Self {
        match action {
            PlanAction::Create => Self::Created,
            PlanAction::Update => Self::Updated,
            PlanAction::Replace => Self::Replaced,
            PlanAction::NoOp => Self::Unchanged,
        }
    }

    /// Converged outcomes are persisted to the state store.
    pub fn is_converged(&self) -> bool {
        matches!(
            self,
            Self::Created | Self::Updated | Self::Replaced | Self::Unchanged
        )
    }

    /// True if the node issued a mutating remote call.
    pub fn changed(&self) -> bool {
        matches!(self, Self::Created | Self::Updated | Self::Replaced)
    }
}

impl fmt::Display for NodeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Updated => write!(f, "updated"),
            Self::Replaced => write!(f, "replaced"),
            Self::Unchanged => write!(f, "unchanged"),
            Self::Failed(cause) => write!(f, "FAILED: {}", cause),
            Self::Skipped { dependency } => write!(f, "skipped (depends on {})", dependency),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Per-node entry in a run report.
#[derive(Debug, Clone)]
pub struct NodeReport {
    pub resource_id: String,
    pub kind: String,
    pub outcome: NodeOutcome,
    pub duration: Duration,
}

/// Result of one executor run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    /// Node reports in execution order
    pub nodes: IndexMap<String, NodeReport>,
    /// Named exports that resolved
    pub outputs: IndexMap<String, Value>,
    /// Named exports that did not resolve, with the reason
    pub unresolved: IndexMap<String, String>,
    pub total_duration: Duration,
}

impl RunReport {
    pub fn outcome(&self, resource_id: &str) -> Option<&NodeOutcome> {
        self.nodes.get(resource_id).map(|n| &n.outcome)
    }

    pub fn count(&self, pred: impl Fn(&NodeOutcome) -> bool) -> usize {
        self.nodes.values().filter(|n| pred(&n.outcome)).count()
    }

    /// Nodes that failed, were skipped or were cancelled.
    pub fn failures(&self) -> Vec<super::error::FailedNode> {
        self.nodes
            .values()
            .filter(|n| !n.outcome.is_converged())
            .map(|n| super::error::FailedNode {
                resource_id: n.resource_id.clone(),
                kind: n.kind.clone(),
                cause: n.outcome.to_string(),
            })
            .collect()
    }

    /// Named exports, or an aggregate error naming every node that did not converge.
    pub fn into_outputs(self) -> super::error::Result<IndexMap<String, Value>> {
        let failures = self.failures();
        if !failures.is_empty() {
            return Err(super::error::Error::RunFailed { failures });
        }
        if let Some((name, reason)) = self.unresolved.into_iter().next() {
            return Err(super::error::Error::UnresolvedExport { name, reason });
        }
        Ok(self.outputs)
    }
}

// ============================================================================
// Provenance events
// ============================================================================

/// Provenance event for the JSONL event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProvenanceEvent {
    RunStarted {
        run_id: String,
        nodes: usize,
        waves: usize,
        trustlink_version: String,
    },
    NodeStarted {
        run_id: String,
        resource: String,
        action: String,
    },
    NodeConverged {
        run_id: String,
        resource: String,
        action: String,
        duration_seconds: f64,
        hash: String,
    },
    NodeFailed {
        run_id: String,
        resource: String,
        error: String,
    },
    NodeSkipped {
        run_id: String,
        resource: String,
        reason: String,
    },
    RunCompleted {
        run_id: String,
        resources_changed: u32,
        resources_unchanged: u32,
        resources_failed: u32,
        total_seconds: f64,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: ProvenanceEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cell::ValueCell;
    use crate::core::error::{NodeFailure, RemoteError};
    use serde_json::json;
    use std::sync::Arc;

    fn reference(id: &str) -> Output<Value> {
        Output::from_cell(
            Arc::new(ValueCell::pending()),
            BTreeSet::from([id.to_string()]),
        )
    }

    #[test]
    fn test_tl001_depends_on_is_derived_from_inputs() {
        let project_id = reference("project");
        let repo_id = reference("repository");
        let spec = ResourceSpec::new("pipeline", "build_definition")
            .input("project_id", &project_id)
            .input("repository_id", repo_id.apply(|v| v))
            .input("branch", "refs/heads/main")
            .input("yml_path", json!("azure-pipelines.yaml"));

        assert_eq!(
            spec.depends_on(),
            BTreeSet::from(["project".to_string(), "repository".to_string()])
        );
    }

    #[test]
    fn test_tl001_self_reference_is_kept() {
        let spec = ResourceSpec::new("loop", "project").input("name", reference("loop"));
        assert!(spec.depends_on().contains("loop"));
    }

    #[test]
    fn test_tl001_combined_inputs_union_dependencies() {
        let subject = Output::format(
            "sc://{}/{}/{}",
            &[Output::from("contoso"), reference("project"), reference("conn")],
        );
        let input: InputValue = subject.into();
        assert_eq!(
            input.dependencies(),
            BTreeSet::from(["conn".to_string(), "project".to_string()])
        );
    }

    #[test]
    fn test_tl001_state_record_roundtrip() {
        let record = StateRecord {
            schema: STATE_SCHEMA.to_string(),
            resource_id: "project".to_string(),
            kind: "project".to_string(),
            inputs_hash: "blake3:abc".to_string(),
            remote_attributes: Attributes::from([
                ("id".to_string(), json!("proj-1")),
                ("name".to_string(), json!("ready")),
            ]),
            applied_at: Some("2026-02-16T14:00:00Z".to_string()),
        };
        let yaml = serde_yaml_ng::to_string(&record).unwrap();
        let back: StateRecord = serde_yaml_ng::from_str(&yaml).unwrap();
        assert_eq!(back, record);
        assert_eq!(back.remote_id().as_deref(), Some("proj-1"));
    }

    #[test]
    fn test_tl001_remote_id_absent() {
        let record = StateRecord {
            schema: STATE_SCHEMA.to_string(),
            resource_id: "x".to_string(),
            kind: "project".to_string(),
            inputs_hash: "blake3:abc".to_string(),
            remote_attributes: Attributes::from([("id".to_string(), json!(""))]),
            applied_at: None,
        };
        assert!(record.remote_id().is_none());
    }

    #[test]
    fn test_tl001_remote_id_numeric() {
        let record = StateRecord {
            schema: STATE_SCHEMA.to_string(),
            resource_id: "pipeline".to_string(),
            kind: "build_definition".to_string(),
            inputs_hash: "blake3:abc".to_string(),
            remote_attributes: Attributes::from([("id".to_string(), json!(42))]),
            applied_at: None,
        };
        assert_eq!(record.remote_id().as_deref(), Some("42"));
    }

    #[test]
    fn test_tl001_plan_action_display() {
        assert_eq!(PlanAction::Create.to_string(), "CREATE");
        assert_eq!(PlanAction::Replace.to_string(), "REPLACE");
        assert_eq!(PlanAction::NoOp.to_string(), "NO-OP");
    }

    #[test]
    fn test_tl001_outcome_classification() {
        assert!(NodeOutcome::Unchanged.is_converged());
        assert!(!NodeOutcome::Unchanged.changed());
        assert!(NodeOutcome::Replaced.changed());
        assert!(!NodeOutcome::Cancelled.is_converged());
        let failed = NodeOutcome::Failed(NodeFailure::Remote {
            attempts: 1,
            error: RemoteError::Transient("reset".into()),
        });
        assert!(!failed.is_converged());
        assert!(failed.to_string().starts_with("FAILED"));
    }

    #[test]
    fn test_tl001_provenance_event_serde() {
        let event = ProvenanceEvent::NodeStarted {
            run_id: "r-abc".to_string(),
            resource: "project".to_string(),
            action: "CREATE".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"node_started\""));
        assert!(json.contains("\"run_id\":\"r-abc\""));
    }

    #[test]
    fn test_tl001_into_outputs_reports_failures() {
        let mut nodes = IndexMap::new();
        nodes.insert(
            "contributor".to_string(),
            NodeReport {
                resource_id: "contributor".to_string(),
                kind: "role_assignment".to_string(),
                outcome: NodeOutcome::Failed(NodeFailure::TypeMismatch("bad".into())),
                duration: Duration::ZERO,
            },
        );
        let report = RunReport {
            run_id: "r-1".to_string(),
            nodes,
            outputs: IndexMap::new(),
            unresolved: IndexMap::new(),
            total_duration: Duration::ZERO,
        };
        let err = report.into_outputs().unwrap_err();
        assert!(err.to_string().contains("contributor (role_assignment)"));
    }
}

//! TL-012: Executor - orchestration loop for a run.
//!
//! validate → waves → per node: await inputs → hash → load prior → plan →
//! remote call (timeout, retry) → resolve outputs → persist → events
//!
//! Nodes inside a wave run concurrently, bounded by `parallelism`. A failed
//! node fails its output cells, which skips exactly its dependent subtree;
//! independent siblings keep going and are persisted.

use super::cell::{CellError, CellFailure};
use super::config::EngineConfig;
use super::error::{DeclarationError, Error, NodeFailure, RemoteError, Result};
use super::graph::{DependencyGraph, GraphNode, Wave};
use super::planner;
use super::state::{new_record, StateStore};
use super::types::*;
use crate::provider::{Inputs, Provider};
use crate::tripwire::eventlog::{self, EventLog};
use crate::tripwire::hasher;
use futures::stream::{self, StreamExt};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Result of one node: its report entry and, if converged, the record to persist.
struct NodeResult {
    report: NodeReport,
    record: Option<StateRecord>,
}

/// Drives a dependency graph to convergence against a provider.
pub struct Executor {
    provider: Arc<dyn Provider>,
    config: EngineConfig,
    events: EventLog,
    cancel: CancellationToken,
}

impl Executor {
    pub fn new(provider: Arc<dyn Provider>, config: EngineConfig) -> Self {
        Self {
            provider,
            config,
            events: EventLog::disabled(),
            cancel: CancellationToken::new(),
        }
    }

    /// Record provenance events to `events`.
    pub fn with_event_log(mut self, events: EventLog) -> Self {
        self.events = events;
        self
    }

    /// Token that cancels the run: no further wave or node is started once it fires.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Check the graph before any remote call: acyclic, known kinds, required inputs.
    pub fn validate(&self, graph: &DependencyGraph) -> std::result::Result<Vec<Wave>, DeclarationError> {
        let waves = graph.topological_order()?;
        for node in graph.nodes() {
            let spec = &node.spec;
            let Some(schema) = self.provider.schema(&spec.kind) else {
                return Err(DeclarationError::UnknownKind {
                    id: spec.id.clone(),
                    kind: spec.kind.clone(),
                });
            };
            if let Some(field) = schema
                .required_inputs
                .iter()
                .find(|field| !spec.inputs.contains_key(**field))
            {
                return Err(DeclarationError::MissingInput {
                    id: spec.id.clone(),
                    kind: spec.kind.clone(),
                    field: field.to_string(),
                });
            }
        }
        Ok(waves)
    }

    /// Execute the graph once, bottom-up.
    ///
    /// Returns `Err` only for declaration errors, which are detected before
    /// any remote call. Node failures are reported in the [`RunReport`].
    pub async fn run(&self, graph: &DependencyGraph, store: &dyn StateStore) -> Result<RunReport> {
        let start = Instant::now();
        let waves = self.validate(graph)?;
        let run_id = eventlog::generate_run_id();

        tracing::info!(
            run_id = %run_id,
            nodes = graph.len(),
            waves = waves.len(),
            "run started"
        );
        self.events.record(ProvenanceEvent::RunStarted {
            run_id: run_id.clone(),
            nodes: graph.len(),
            waves: waves.len(),
            trustlink_version: env!("CARGO_PKG_VERSION").to_string(),
        });

        let mut nodes: IndexMap<String, NodeReport> = IndexMap::new();
        let mut records: Vec<StateRecord> = Vec::new();

        for (index, wave) in waves.iter().enumerate() {
            if self.cancel.is_cancelled() {
                for id in wave {
                    if let Some(node) = graph.node(id) {
                        let result = self.cancelled(node, &run_id, Instant::now());
                        nodes.insert(id.clone(), result.report);
                    }
                }
                continue;
            }

            tracing::debug!(wave = index, size = wave.len(), "starting wave");
            let run_id_ref = run_id.as_str();
            let mut results: HashMap<String, NodeResult> = stream::iter(
                wave.iter().filter_map(|id| graph.node(id)),
            )
            .map(|node| async move {
                let result = self.execute_node(node, store, run_id_ref).await;
                (node.spec.id.clone(), result)
            })
            .buffer_unordered(self.config.parallelism.max(1))
            .collect()
            .await;

            for id in wave {
                if let Some(result) = results.remove(id) {
                    records.extend(result.record);
                    nodes.insert(id.clone(), result.report);
                }
            }
        }

        for record in records {
            if let Err(e) = store.save(&record) {
                tracing::error!(resource = %record.resource_id, error = %e, "cannot persist state record");
                if let Some(report) = nodes.get_mut(&record.resource_id) {
                    report.outcome = NodeOutcome::Failed(NodeFailure::State(e.to_string()));
                }
            }
        }

        let mut outputs = IndexMap::new();
        let mut unresolved = IndexMap::new();
        for (name, output) in graph.exports() {
            match output.get() {
                Some(Ok(value)) => {
                    outputs.insert(name.clone(), value);
                }
                Some(Err(e)) => {
                    unresolved.insert(name.clone(), e.to_string());
                }
                None => {
                    unresolved.insert(name.clone(), "never resolved".to_string());
                }
            }
        }

        let report = RunReport {
            run_id: run_id.clone(),
            nodes,
            outputs,
            unresolved,
            total_duration: start.elapsed(),
        };

        let changed = report.count(NodeOutcome::changed) as u32;
        let unchanged = report.count(|o| *o == NodeOutcome::Unchanged) as u32;
        let failed = report.count(|o| !o.is_converged()) as u32;
        tracing::info!(
            run_id = %run_id,
            changed,
            unchanged,
            failed,
            seconds = report.total_duration.as_secs_f64(),
            "run completed"
        );
        self.events.record(ProvenanceEvent::RunCompleted {
            run_id,
            resources_changed: changed,
            resources_unchanged: unchanged,
            resources_failed: failed,
            total_seconds: report.total_duration.as_secs_f64(),
        });

        Ok(report)
    }

    async fn execute_node(&self, node: &GraphNode, store: &dyn StateStore, run_id: &str) -> NodeResult {
        let started = Instant::now();
        let spec = &node.spec;

        let mut inputs = Inputs::new();
        for (field, value) in &spec.inputs {
            let resolved = match value {
                InputValue::Literal(v) => v.clone(),
                InputValue::Deferred(output) => match output.wait().await {
                    Ok(v) => v,
                    Err(e) => return self.abandon(node, e, run_id, started),
                },
            };
            inputs.insert(field.clone(), resolved);
        }

        if self.cancel.is_cancelled() {
            return self.cancelled(node, run_id, started);
        }

        let inputs_hash = hasher::hash_inputs(&spec.kind, &inputs);
        let prior = match store.load(&spec.id) {
            Ok(prior) => prior,
            Err(e @ Error::StateCorruption { .. }) => {
                tracing::warn!(resource = %spec.id, error = %e, "ignoring corrupt state record");
                None
            }
            Err(e) => {
                return self.record_failure(node, NodeFailure::State(e.to_string()), run_id, started)
            }
        };

        let policy = self
            .provider
            .schema(&spec.kind)
            .map(|s| s.update_policy)
            .unwrap_or(UpdatePolicy::InPlace);
        let requested: Vec<String> = node.outputs.cells().into_iter().map(|(f, _)| f).collect();
        let mut action =
            planner::determine_action(prior.as_ref(), &spec.kind, &inputs_hash, policy, &requested);
        let remote_id = prior.as_ref().and_then(StateRecord::remote_id);

        if action == PlanAction::NoOp && self.config.refresh {
            if let Some(id) = &remote_id {
                match self
                    .call(&spec.id, "read", || self.provider.read(&spec.kind, id))
                    .await
                {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        tracing::warn!(resource = %spec.id, remote_id = %id, "remote object vanished, recreating");
                        action = PlanAction::Create;
                    }
                    Err(failure) => return self.record_failure(node, failure, run_id, started),
                }
            }
        }

        tracing::debug!("{}", planner::describe_action(&spec.id, &spec.kind, action));
        if action != PlanAction::NoOp {
            self.events.record(ProvenanceEvent::NodeStarted {
                run_id: run_id.to_string(),
                resource: spec.id.clone(),
                action: action.to_string(),
            });
        }

        let attributes = match self
            .converge(spec, action, prior.as_ref(), remote_id.as_deref(), &inputs)
            .await
        {
            Ok(attributes) => attributes,
            Err(failure) => return self.record_failure(node, failure, run_id, started),
        };

        let mut values = Vec::new();
        for (field, cell) in node.outputs.cells() {
            match attributes.get(&field) {
                Some(value) => values.push((cell, value.clone())),
                None => {
                    return self.record_failure(
                        node,
                        NodeFailure::MissingAttribute(field),
                        run_id,
                        started,
                    )
                }
            }
        }
        for (cell, value) in values {
            cell.resolve(value);
        }

        let record = match (action, prior) {
            (PlanAction::NoOp, Some(prior)) => prior,
            _ => new_record(&spec.id, &spec.kind, &inputs_hash, attributes),
        };
        self.record_success(node, action, record, run_id, started)
    }

    /// Issue the remote calls for `action`, returning the object's attributes.
    async fn converge(
        &self,
        spec: &ResourceSpec,
        action: PlanAction,
        prior: Option<&StateRecord>,
        remote_id: Option<&str>,
        inputs: &Inputs,
    ) -> std::result::Result<Attributes, NodeFailure> {
        let kind = spec.kind.as_str();
        match (action, prior, remote_id) {
            (PlanAction::NoOp, Some(prior), _) => Ok(prior.remote_attributes.clone()),
            (PlanAction::Update, _, Some(id)) => {
                self.call(&spec.id, "update", || self.provider.update(kind, id, inputs))
                    .await
            }
            (PlanAction::Replace, Some(prior), Some(id)) => {
                let old_kind = prior.kind.as_str();
                self.call(&spec.id, "delete", || self.provider.delete(old_kind, id))
                    .await?;
                self.call(&spec.id, "create", || self.provider.create(kind, inputs))
                    .await
            }
            _ => {
                self.call(&spec.id, "create", || self.provider.create(kind, inputs))
                    .await
            }
        }
    }

    /// One remote operation with a per-attempt timeout and bounded retries of
    /// transient errors.
    async fn call<T, F, Fut>(&self, resource_id: &str, op: &str, mut f: F) -> std::result::Result<T, NodeFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, RemoteError>>,
    {
        let timeout = self.config.call_timeout();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let result = match tokio::time::timeout(timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(RemoteError::Transient(format!(
                    "{} timed out after {}s",
                    op,
                    timeout.as_secs()
                ))),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempts <= self.config.max_retries => {
                    let delay = self.config.backoff(attempts - 1);
                    tracing::warn!(
                        resource = %resource_id,
                        op,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "transient remote error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(NodeFailure::Remote { attempts, error }),
            }
        }
    }

    fn record_success(
        &self,
        node: &GraphNode,
        action: PlanAction,
        record: StateRecord,
        run_id: &str,
        started: Instant,
    ) -> NodeResult {
        let duration = started.elapsed();
        tracing::info!(
            resource = %node.spec.id,
            kind = %node.spec.kind,
            action = %action,
            seconds = duration.as_secs_f64(),
            "converged"
        );
        self.events.record(ProvenanceEvent::NodeConverged {
            run_id: run_id.to_string(),
            resource: node.spec.id.clone(),
            action: action.to_string(),
            duration_seconds: duration.as_secs_f64(),
            hash: record.inputs_hash.clone(),
        });
        NodeResult {
            report: report(node, NodeOutcome::from_action(action), duration),
            record: Some(record),
        }
    }

    fn record_failure(
        &self,
        node: &GraphNode,
        failure: NodeFailure,
        run_id: &str,
        started: Instant,
    ) -> NodeResult {
        fail_outputs(node, CellError::upstream(&node.spec.id));
        tracing::error!(
            resource = %node.spec.id,
            kind = %node.spec.kind,
            error = %failure,
            "node failed"
        );
        self.events.record(ProvenanceEvent::NodeFailed {
            run_id: run_id.to_string(),
            resource: node.spec.id.clone(),
            error: failure.to_string(),
        });
        NodeResult {
            report: report(node, NodeOutcome::Failed(failure), started.elapsed()),
            record: None,
        }
    }

    /// An input failed: skip on upstream failure, fail on a type mismatch.
    fn abandon(&self, node: &GraphNode, error: CellError, run_id: &str, started: Instant) -> NodeResult {
        match error.failure {
            CellFailure::Cancelled => self.cancelled(node, run_id, started),
            CellFailure::TypeMismatch(_) => {
                self.record_failure(node, NodeFailure::TypeMismatch(error.to_string()), run_id, started)
            }
            CellFailure::Upstream => {
                fail_outputs(node, CellError::upstream(&node.spec.id));
                tracing::warn!(
                    resource = %node.spec.id,
                    dependency = %error.origin,
                    "skipped, dependency did not converge"
                );
                self.events.record(ProvenanceEvent::NodeSkipped {
                    run_id: run_id.to_string(),
                    resource: node.spec.id.clone(),
                    reason: error.to_string(),
                });
                NodeResult {
                    report: report(
                        node,
                        NodeOutcome::Skipped {
                            dependency: error.origin,
                        },
                        started.elapsed(),
                    ),
                    record: None,
                }
            }
        }
    }

    fn cancelled(&self, node: &GraphNode, run_id: &str, started: Instant) -> NodeResult {
        fail_outputs(node, CellError::cancelled(&node.spec.id));
        self.events.record(ProvenanceEvent::NodeSkipped {
            run_id: run_id.to_string(),
            resource: node.spec.id.clone(),
            reason: "run cancelled".to_string(),
        });
        NodeResult {
            report: report(node, NodeOutcome::Cancelled, started.elapsed()),
            record: None,
        }
    }
}

fn fail_outputs(node: &GraphNode, error: CellError) {
    for (_, cell) in node.outputs.cells() {
        cell.fail(error.clone());
    }
}

fn report(node: &GraphNode, outcome: NodeOutcome, duration: Duration) -> NodeReport {
    NodeReport {
        resource_id: node.spec.id.clone(),
        kind: node.spec.kind.clone(),
        outcome,
        duration,
    }
}

//! TL-004: Convergence decisions - compare resolved inputs against recorded state.

use super::types::{PlanAction, StateRecord, UpdatePolicy};

/// Decide what to do with a node whose inputs have resolved to `inputs_hash`.
///
/// `requested_outputs` are the output fields downstream nodes read; a prior
/// record that lacks one of them cannot satisfy a No-op.
pub fn determine_action(
    prior: Option<&StateRecord>,
    kind: &str,
    inputs_hash: &str,
    policy: UpdatePolicy,
    requested_outputs: &[String],
) -> PlanAction {
    let Some(prior) = prior else {
        return PlanAction::Create;
    };
    if prior.remote_id().is_none() {
        return PlanAction::Create;
    }
    if prior.kind != kind {
        return PlanAction::Replace;
    }

    let covers_outputs = requested_outputs
        .iter()
        .all(|field| prior.remote_attributes.contains_key(field));
    if prior.inputs_hash == inputs_hash && covers_outputs {
        return PlanAction::NoOp;
    }

    match policy {
        UpdatePolicy::InPlace => PlanAction::Update,
        UpdatePolicy::Replace => PlanAction::Replace,
    }
}

/// Human-readable description of a planned action.
pub fn describe_action(resource_id: &str, kind: &str, action: PlanAction) -> String {
    match action {
        PlanAction::Create => format!("{}: create {}", resource_id, kind),
        PlanAction::Update => format!("{}: update in place (inputs changed)", resource_id),
        PlanAction::Replace => format!("{}: replace (inputs changed)", resource_id),
        PlanAction::NoOp => format!("{}: no changes", resource_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::new_record;
    use crate::core::types::Attributes;
    use serde_json::json;

    fn record(kind: &str, hash: &str) -> StateRecord {
        new_record(
            "node",
            kind,
            hash,
            Attributes::from([
                ("id".to_string(), json!("remote-1")),
                ("name".to_string(), json!("ready")),
            ]),
        )
    }

    #[test]
    fn test_tl004_create_without_prior() {
        let action = determine_action(None, "project", "blake3:a", UpdatePolicy::InPlace, &[]);
        assert_eq!(action, PlanAction::Create);
    }

    #[test]
    fn test_tl004_create_when_prior_has_no_remote_object() {
        let mut prior = record("project", "blake3:a");
        prior.remote_attributes.remove("id");
        let action = determine_action(Some(&prior), "project", "blake3:a", UpdatePolicy::InPlace, &[]);
        assert_eq!(action, PlanAction::Create);
    }

    #[test]
    fn test_tl004_noop_on_equal_hash() {
        let prior = record("project", "blake3:a");
        let fields = vec!["id".to_string(), "name".to_string()];
        let action =
            determine_action(Some(&prior), "project", "blake3:a", UpdatePolicy::InPlace, &fields);
        assert_eq!(action, PlanAction::NoOp);
    }

    #[test]
    fn test_tl004_changed_hash_follows_policy() {
        let prior = record("project", "blake3:a");
        assert_eq!(
            determine_action(Some(&prior), "project", "blake3:b", UpdatePolicy::InPlace, &[]),
            PlanAction::Update
        );
        assert_eq!(
            determine_action(Some(&prior), "project", "blake3:b", UpdatePolicy::Replace, &[]),
            PlanAction::Replace
        );
    }

    #[test]
    fn test_tl004_kind_change_replaces() {
        let prior = record("application", "blake3:a");
        assert_eq!(
            determine_action(Some(&prior), "project", "blake3:a", UpdatePolicy::InPlace, &[]),
            PlanAction::Replace
        );
    }

    #[test]
    fn test_tl004_missing_requested_output_forces_update() {
        let prior = record("service_connection", "blake3:a");
        let fields = vec!["workload_identity_federation_issuer".to_string()];
        assert_eq!(
            determine_action(
                Some(&prior),
                "service_connection",
                "blake3:a",
                UpdatePolicy::InPlace,
                &fields
            ),
            PlanAction::Update
        );
    }

    #[test]
    fn test_tl004_describe_action() {
        assert_eq!(
            describe_action("project", "project", PlanAction::Create),
            "project: create project"
        );
        assert!(describe_action("x", "k", PlanAction::NoOp).contains("no changes"));
    }
}

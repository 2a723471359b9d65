//! Resource catalog - the kinds that make up the pipeline trust chain.
//!
//! Each kind declares:
//! 1. The inputs a declaration must provide
//! 2. The output attributes the remote platform reports back
//! 3. Whether changed inputs patch the object or replace it

pub mod deployment;

use crate::core::types::{KindSchema, UpdatePolicy};

/// Built-in Contributor role definition id.
pub const CONTRIBUTOR_ROLE_ID: &str = "b24988ac-6180-42a0-ab88-20f7382dd24c";

/// Token exchange audience for workload identity federation.
pub const TOKEN_EXCHANGE_AUDIENCE: &str = "api://AzureADTokenExchange";

pub const PROJECT: KindSchema = KindSchema {
    kind: "project",
    required_inputs: &["name", "description", "features"],
    outputs: &["id", "name"],
    update_policy: UpdatePolicy::InPlace,
};

/// Lookup of the repository created alongside a project. Never creates a
/// repository of its own; "update" repeats the lookup.
pub const REPOSITORY_LOOKUP: KindSchema = KindSchema {
    kind: "repository_lookup",
    required_inputs: &["project_id", "name"],
    outputs: &["id", "name"],
    update_policy: UpdatePolicy::InPlace,
};

pub const REPOSITORY_FILE: KindSchema = KindSchema {
    kind: "repository_file",
    required_inputs: &["repository_id", "file", "content", "branch", "commit_message"],
    outputs: &["id", "file"],
    update_policy: UpdatePolicy::InPlace,
};

pub const APPLICATION: KindSchema = KindSchema {
    kind: "application",
    required_inputs: &["display_name"],
    outputs: &["id", "application_id", "object_id"],
    update_policy: UpdatePolicy::InPlace,
};

pub const SERVICE_PRINCIPAL: KindSchema = KindSchema {
    kind: "service_principal",
    required_inputs: &["application_id"],
    outputs: &["id", "application_id"],
    update_policy: UpdatePolicy::Replace,
};

pub const ROLE_ASSIGNMENT: KindSchema = KindSchema {
    kind: "role_assignment",
    required_inputs: &["principal_id", "principal_type", "role_definition_id", "scope"],
    outputs: &["id"],
    update_policy: UpdatePolicy::Replace,
};

pub const SERVICE_CONNECTION: KindSchema = KindSchema {
    kind: "service_connection",
    required_inputs: &[
        "project_id",
        "name",
        "authentication_scheme",
        "tenant_id",
        "subscription_id",
        "subscription_name",
        "service_principal_id",
    ],
    outputs: &["id", "name", "workload_identity_federation_issuer"],
    update_policy: UpdatePolicy::InPlace,
};

pub const FEDERATED_IDENTITY_CREDENTIAL: KindSchema = KindSchema {
    kind: "federated_identity_credential",
    required_inputs: &[
        "application_object_id",
        "display_name",
        "description",
        "audiences",
        "issuer",
        "subject",
    ],
    outputs: &["id"],
    update_policy: UpdatePolicy::Replace,
};

pub const BUILD_DEFINITION: KindSchema = KindSchema {
    kind: "build_definition",
    required_inputs: &["project_id", "repository_id", "branch", "yml_path", "repository_type"],
    outputs: &["id"],
    update_policy: UpdatePolicy::InPlace,
};

pub const PIPELINE_AUTHORIZATION: KindSchema = KindSchema {
    kind: "pipeline_authorization",
    required_inputs: &["project_id", "type", "pipeline_id", "resource_id"],
    outputs: &["id"],
    update_policy: UpdatePolicy::Replace,
};

/// Every kind in the catalog, in declaration order.
pub const CATALOG: &[KindSchema] = &[
    PROJECT,
    REPOSITORY_LOOKUP,
    REPOSITORY_FILE,
    APPLICATION,
    SERVICE_PRINCIPAL,
    ROLE_ASSIGNMENT,
    SERVICE_CONNECTION,
    FEDERATED_IDENTITY_CREDENTIAL,
    BUILD_DEFINITION,
    PIPELINE_AUTHORIZATION,
];

pub fn schema_for(kind: &str) -> Option<&'static KindSchema> {
    CATALOG.iter().find(|s| s.kind == kind)
}

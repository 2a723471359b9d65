//! TL-031: The pipeline trust-chain deployment.
//!
//! Declares a project with its default repository, commits a pipeline file,
//! registers an application and service principal with Contributor on the
//! subscription, creates a workload-identity service connection, federates
//! the application with it, defines the pipeline and authorises the pipeline
//! to use the connection. Every edge comes from an output reference.

use super::{CONTRIBUTOR_ROLE_ID, TOKEN_EXCHANGE_AUDIENCE};
use crate::core::cell::{value_to_string, Output};
use crate::core::error::DeclarationError;
use crate::core::graph::DependencyGraph;
use crate::core::parser::{organization_name, DeploymentConfig};
use crate::core::types::ResourceSpec;
use serde_json::{json, Value};

/// Name of the exported pipeline URL.
pub const PIPELINE_URL: &str = "pipelineUrl";

/// Resource ids used by the deployment.
pub mod ids {
    pub const PROJECT: &str = "project";
    pub const REPOSITORY: &str = "repository";
    pub const PIPELINE_FILE: &str = "pipeline-file";
    pub const APPLICATION: &str = "application";
    pub const SERVICE_PRINCIPAL: &str = "service-principal";
    pub const CONTRIBUTOR: &str = "contributor";
    pub const SERVICE_CONNECTION: &str = "service-connection";
    pub const FEDERATED_CREDENTIAL: &str = "federated-credential";
    pub const PIPELINE: &str = "pipeline";
    pub const PIPELINE_AUTHORIZATION: &str = "pipeline-authorization";
}

/// A declared deployment, ready for the executor.
#[derive(Debug)]
pub struct Deployment {
    pub graph: DependencyGraph,
}

/// Build definition ids come back as numbers or numeric strings; the
/// authorization needs an integer.
fn pipeline_id(value: Value) -> Result<Value, String> {
    if let Some(n) = value.as_i64() {
        return Ok(Value::from(n));
    }
    if let Some(s) = value.as_str() {
        return s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| format!("pipeline id '{}' is not an integer", s));
    }
    Err(format!("pipeline id {} is not an integer", value))
}

/// Declare the trust-chain graph for `config`.
pub fn declare(config: &DeploymentConfig) -> Result<Deployment, DeclarationError> {
    let mut graph = DependencyGraph::new();

    let organization_url = Output::known(json!(config.organization_url));
    let organization = organization_url.apply(|url| json!(organization_name(&value_to_string(&url))));

    let project = graph.add_node(
        ResourceSpec::new(ids::PROJECT, "project")
            .input("name", config.project.name.as_str())
            .input("description", config.project.description.as_str())
            .input("features", json!(config.project.features)),
    )?;

    let repository = graph.add_node(
        ResourceSpec::new(ids::REPOSITORY, "repository_lookup")
            .input("project_id", project.output("id"))
            .input("name", project.output("name")),
    )?;

    let pipeline_file = graph.add_node(
        ResourceSpec::new(ids::PIPELINE_FILE, "repository_file")
            .input("repository_id", repository.output("id"))
            .input("file", config.pipeline.file.as_str())
            .input("content", config.pipeline_content())
            .input("branch", config.pipeline.branch.as_str())
            .input("commit_message", config.pipeline.commit_message.as_str()),
    )?;

    let application = graph.add_node(
        ResourceSpec::new(ids::APPLICATION, "application")
            .input("display_name", config.identity.application_name.as_str()),
    )?;

    let service_principal = graph.add_node(
        ResourceSpec::new(ids::SERVICE_PRINCIPAL, "service_principal")
            .input("application_id", application.output("application_id")),
    )?;

    let subscription = Output::known(json!(config.cloud.subscription_id));
    graph.add_node(
        ResourceSpec::new(ids::CONTRIBUTOR, "role_assignment")
            .input("principal_id", service_principal.output("id"))
            .input("principal_type", "ServicePrincipal")
            .input("role_definition_id", CONTRIBUTOR_ROLE_ID)
            .input("scope", Output::format("/subscriptions/{}", &[subscription])),
    )?;

    let connection = graph.add_node(
        ResourceSpec::new(ids::SERVICE_CONNECTION, "service_connection")
            .input("project_id", project.output("id"))
            .input("name", config.identity.service_connection_name.as_str())
            .input("authentication_scheme", "WorkloadIdentityFederation")
            .input("tenant_id", config.cloud.tenant_id.as_str())
            .input("subscription_id", config.cloud.subscription_id.as_str())
            .input("subscription_name", config.cloud.subscription_name.as_str())
            .input("service_principal_id", service_principal.output("application_id")),
    )?;

    let subject = Output::format(
        "sc://{}/{}/{}",
        &[organization, project.output("name"), connection.output("name")],
    );
    graph.add_node(
        ResourceSpec::new(ids::FEDERATED_CREDENTIAL, "federated_identity_credential")
            .input("application_object_id", application.output("object_id"))
            .input("display_name", config.identity.credential_name.as_str())
            .input("description", config.identity.credential_description.as_str())
            .input("audiences", json!([TOKEN_EXCHANGE_AUDIENCE]))
            .input("issuer", connection.output("workload_identity_federation_issuer"))
            .input("subject", subject),
    )?;

    let pipeline = graph.add_node(
        ResourceSpec::new(ids::PIPELINE, "build_definition")
            .input("project_id", project.output("id"))
            .input("repository_id", repository.output("id"))
            .input("branch", config.pipeline.branch.as_str())
            .input("yml_path", pipeline_file.output("file"))
            .input("repository_type", "TfsGit"),
    )?;

    graph.add_node(
        ResourceSpec::new(ids::PIPELINE_AUTHORIZATION, "pipeline_authorization")
            .input("project_id", project.output("id"))
            .input("type", "endpoint")
            .input("pipeline_id", pipeline.output("id").try_apply("pipeline id", pipeline_id))
            .input("resource_id", connection.output("id")),
    )?;

    graph.export(
        PIPELINE_URL,
        Output::format(
            "{}{}/_build?definitionId={}",
            &[organization_url, project.output("name"), pipeline.output("id")],
        ),
    );

    Ok(Deployment { graph })
}

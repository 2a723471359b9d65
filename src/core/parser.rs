//! TL-009: trustlink.yaml parsing and validation.
//!
//! Parses the deployment file and validates structural constraints:
//! - Version must be "1.0"
//! - Organisation URL must be https
//! - Project, identity and cloud names must be present
//! - Pipeline content must be available (inline or from `pipeline.source`)

use super::config::EngineConfig;
use super::error::{Error, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Project host features allowed in `project.features`.
pub const FEATURE_STATES: &[&str] = &["enabled", "disabled"];

/// Root of trustlink.yaml.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    pub version: String,

    /// Organisation URL on the project host, e.g. `https://dev.azure.com/contoso/`
    pub organization_url: String,

    pub project: ProjectConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub identity: IdentityConfig,

    pub cloud: CloudConfig,

    #[serde(default)]
    pub policy: EngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,

    #[serde(default = "default_project_description")]
    pub description: String,

    #[serde(default = "default_features")]
    pub features: IndexMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Path of the pipeline file inside the repository
    #[serde(default = "default_pipeline_file")]
    pub file: String,

    /// Local file whose content is committed, relative to trustlink.yaml
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,

    /// Inline content, used when `source` is absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    #[serde(default = "default_branch")]
    pub branch: String,

    #[serde(default = "default_commit_message")]
    pub commit_message: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            file: default_pipeline_file(),
            source: None,
            content: None,
            branch: default_branch(),
            commit_message: default_commit_message(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_application_name")]
    pub application_name: String,

    #[serde(default = "default_service_connection_name")]
    pub service_connection_name: String,

    #[serde(default = "default_credential_name")]
    pub credential_name: String,

    #[serde(default = "default_credential_description")]
    pub credential_description: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            application_name: default_application_name(),
            service_connection_name: default_service_connection_name(),
            credential_name: default_credential_name(),
            credential_description: default_credential_description(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    pub tenant_id: String,
    pub subscription_id: String,
    #[serde(default)]
    pub subscription_name: String,
}

fn default_project_description() -> String {
    "New project with everything correctly configured to provision Azure resources or deploy applications to Azure".to_string()
}

fn default_features() -> IndexMap<String, String> {
    [
        ("boards", "disabled"),
        ("repositories", "enabled"),
        ("pipelines", "enabled"),
        ("testplans", "disabled"),
        ("artifacts", "disabled"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn default_pipeline_file() -> String {
    "azure-pipelines.yaml".to_string()
}

fn default_branch() -> String {
    "refs/heads/main".to_string()
}

fn default_commit_message() -> String {
    "Add preconfigured pipeline file".to_string()
}

fn default_application_name() -> String {
    "ADO Azure Ready App".to_string()
}

fn default_service_connection_name() -> String {
    "azure-with-oidc".to_string()
}

fn default_credential_name() -> String {
    "AzureReadyDeploys".to_string()
}

fn default_credential_description() -> String {
    "Deployments for azure-ready-repository".to_string()
}

impl DeploymentConfig {
    /// Organisation name: the last path segment of the organisation URL.
    pub fn organization_name(&self) -> String {
        organization_name(&self.organization_url)
    }

    /// Pipeline file content, empty if neither source nor content was given.
    pub fn pipeline_content(&self) -> &str {
        self.pipeline.content.as_deref().unwrap_or_default()
    }
}

/// Last non-empty path segment of a URL.
pub fn organization_name(url: &str) -> String {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    without_scheme
        .split('/')
        .skip(1)
        .filter(|s| !s.is_empty())
        .last()
        .unwrap_or_default()
        .to_string()
}

/// Ensure the URL ends with exactly one `/`.
pub fn normalize_organization_url(url: &str) -> String {
    format!("{}/", url.trim().trim_end_matches('/'))
}

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Parse a trustlink.yaml file from disk, reading `pipeline.source`
/// relative to the file's directory.
pub fn parse_config_file(path: &Path) -> Result<DeploymentConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
    let mut config = parse_config(&content)?;

    if config.pipeline.content.is_none() {
        if let Some(source) = &config.pipeline.source {
            let base = path.parent().unwrap_or_else(|| Path::new("."));
            let source_path = base.join(source);
            let body = std::fs::read_to_string(&source_path).map_err(|e| {
                Error::Config(format!(
                    "failed to read pipeline source {}: {}",
                    source_path.display(),
                    e
                ))
            })?;
            config.pipeline.content = Some(body);
        }
    }

    Ok(config)
}

/// Parse a trustlink.yaml from a string.
pub fn parse_config(yaml: &str) -> Result<DeploymentConfig> {
    let mut config: DeploymentConfig = serde_yaml_ng::from_str(yaml)?;
    config.organization_url = normalize_organization_url(&config.organization_url);
    Ok(config)
}

/// Validate a parsed config. Returns a list of errors (empty = valid).
pub fn validate_config(config: &DeploymentConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut err = |message: String| errors.push(ValidationError { message });

    if config.version != "1.0" {
        err(format!("version must be \"1.0\", got \"{}\"", config.version));
    }

    if !config.organization_url.starts_with("https://") {
        err(format!(
            "organization_url must start with https://, got \"{}\"",
            config.organization_url
        ));
    } else if config.organization_name().is_empty() {
        err("organization_url has no organisation segment".to_string());
    }

    if config.project.name.trim().is_empty() {
        err("project.name must not be empty".to_string());
    }
    for (feature, state) in &config.project.features {
        if !FEATURE_STATES.contains(&state.as_str()) {
            err(format!(
                "project feature '{}' must be enabled or disabled, got \"{}\"",
                feature, state
            ));
        }
    }

    if config.pipeline.file.is_empty() {
        err("pipeline.file must not be empty".to_string());
    }
    if !config.pipeline.branch.starts_with("refs/") {
        err(format!(
            "pipeline.branch must be a full ref (refs/...), got \"{}\"",
            config.pipeline.branch
        ));
    }
    if config.pipeline.content.is_none() {
        err("pipeline has no content (set pipeline.source or pipeline.content)".to_string());
    }

    let identity = [
        ("identity.application_name", &config.identity.application_name),
        (
            "identity.service_connection_name",
            &config.identity.service_connection_name,
        ),
        ("identity.credential_name", &config.identity.credential_name),
    ];
    for (field, value) in identity {
        if value.trim().is_empty() {
            err(format!("{} must not be empty", field));
        }
    }

    if config.cloud.tenant_id.trim().is_empty() {
        err("cloud.tenant_id must not be empty".to_string());
    }
    if config.cloud.subscription_id.trim().is_empty() {
        err("cloud.subscription_id must not be empty".to_string());
    }

    for problem in config.policy.problems() {
        err(problem);
    }

    errors
}

//! TL-021: Simulated provider - an in-process model of the project host and
//! the cloud directory.
//!
//! Objects are kept in memory keyed by `<kind>/<id>` and, when a path is
//! given, mirrored to a JSON file after every mutation so that separate CLI
//! invocations see the same remote world. Tests use the fault injection and
//! call log to observe exactly which remote operations a run issued.

use super::{Inputs, Provider};
use crate::core::cell::value_to_string;
use crate::core::error::{PermanentClass, RemoteError, Result};
use crate::core::types::Attributes;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Remote operation observed by the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
}

impl Operation {
    pub fn is_mutating(self) -> bool {
        !matches!(self, Self::Read)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCall {
    pub operation: Operation,
    pub kind: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct World {
    #[serde(default)]
    serial: u64,
    #[serde(default)]
    last_definition: u64,
    #[serde(default)]
    objects: BTreeMap<String, Attributes>,
}

impl World {
    fn next_uuid(&mut self, seed: &str) -> String {
        self.serial += 1;
        uuid_from(&format!("{}:{}", seed, self.serial))
    }

    fn find(&self, kind: &str, pred: impl Fn(&Attributes) -> bool) -> Option<&Attributes> {
        let prefix = format!("{}/", kind);
        self.objects
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(_, attrs)| attrs)
            .find(|attrs| pred(attrs))
    }

    fn exists(&self, kind: &str, id: &str) -> bool {
        self.objects.contains_key(&object_key(kind, id))
    }
}

#[derive(Debug)]
struct Fault {
    error: RemoteError,
    /// `None` fails every call.
    remaining: Option<u32>,
}

/// In-process provider honouring the resource catalog.
#[derive(Debug)]
pub struct SimulatedProvider {
    organization: String,
    path: Option<PathBuf>,
    latency: Duration,
    world: Mutex<World>,
    faults: Mutex<HashMap<String, Fault>>,
    pinned: Mutex<HashMap<String, Value>>,
    calls: Mutex<Vec<RemoteCall>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

fn uuid_from(seed: &str) -> String {
    let hash = blake3::hash(seed.as_bytes());
    let hex = hash.to_hex();
    let hex = hex.as_str();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// Repository lookups read the repository created alongside a project.
fn storage_kind(kind: &str) -> &str {
    match kind {
        "repository_lookup" => "repository",
        other => other,
    }
}

fn object_key(kind: &str, id: &str) -> String {
    format!("{}/{}", storage_kind(kind), id)
}

fn text(inputs: &Inputs, field: &str) -> std::result::Result<String, RemoteError> {
    inputs
        .get(field)
        .map(value_to_string)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            RemoteError::permanent(
                PermanentClass::Other,
                format!("input '{}' is required", field),
            )
        })
}

fn not_found(kind: &str, id: &str) -> RemoteError {
    RemoteError::permanent(PermanentClass::NotFound, format!("{} '{}' does not exist", kind, id))
}

impl SimulatedProvider {
    /// Ephemeral simulator for the organisation named `organization`.
    pub fn new(organization: &str) -> Self {
        Self {
            organization: organization.to_string(),
            path: None,
            latency: Duration::ZERO,
            world: Mutex::new(World::default()),
            faults: Mutex::new(HashMap::new()),
            pinned: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Simulator backed by a JSON file, loaded if it already exists.
    pub fn persistent(organization: &str, path: &Path) -> Result<Self> {
        let mut provider = Self::new(organization);
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            provider.world = Mutex::new(serde_json::from_str(&content)?);
        }
        provider.path = Some(path.to_path_buf());
        Ok(provider)
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail the next `times` calls for `kind` with `error`, or every call when `None`.
    pub fn inject_failure(&self, kind: &str, error: RemoteError, times: Option<u32>) {
        if times == Some(0) {
            return;
        }
        lock(&self.faults).insert(
            kind.to_string(),
            Fault {
                error,
                remaining: times,
            },
        );
    }

    pub fn clear_failures(&self) {
        lock(&self.faults).clear();
    }

    /// Use `id` for the next object created of `kind` instead of a generated one.
    pub fn pin_id(&self, kind: &str, id: Value) {
        lock(&self.pinned).insert(storage_kind(kind).to_string(), id);
    }

    /// Every call issued so far, in order.
    pub fn calls(&self) -> Vec<RemoteCall> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Calls that created, updated or deleted an object of `kind`.
    pub fn mutations_of(&self, kind: &str) -> Vec<Operation> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.kind == kind && c.operation.is_mutating())
            .map(|c| c.operation)
            .collect()
    }

    pub fn object_count(&self) -> usize {
        lock(&self.world).objects.len()
    }

    /// Attributes of a stored object.
    pub fn object(&self, kind: &str, id: &str) -> Option<Attributes> {
        lock(&self.world).objects.get(&object_key(kind, id)).cloned()
    }

    /// Remove an object behind the engine's back, as an operator might.
    pub fn remove_object(&self, kind: &str, id: &str) -> bool {
        let removed = lock(&self.world).objects.remove(&object_key(kind, id)).is_some();
        if removed {
            self.persist();
        }
        removed
    }

    fn take_fault(&self, kind: &str) -> Option<RemoteError> {
        let mut faults = lock(&self.faults);
        let fault = faults.get_mut(kind)?;
        let error = fault.error.clone();
        if let Some(remaining) = fault.remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                faults.remove(kind);
            }
        }
        Some(error)
    }

    async fn enter(&self, operation: Operation, kind: &str) -> std::result::Result<(), RemoteError> {
        lock(&self.calls).push(RemoteCall {
            operation,
            kind: kind.to_string(),
        });
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match self.take_fault(kind) {
            Some(error) => {
                tracing::debug!(kind, ?operation, %error, "injected failure");
                Err(error)
            }
            None => Ok(()),
        }
    }

    fn generated_id(&self, world: &mut World, kind: &str) -> Value {
        if let Some(id) = lock(&self.pinned).remove(storage_kind(kind)) {
            return id;
        }
        match kind {
            "build_definition" => {
                world.last_definition += 1;
                json!(world.last_definition)
            }
            _ => json!(world.next_uuid(&self.organization)),
        }
    }

    fn organization_issuer(&self) -> String {
        format!(
            "https://vstoken.dev.azure.com/{}",
            uuid_from(&format!("organization:{}", self.organization))
        )
    }

    fn persist(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let result = (|| -> Result<()> {
            let json = serde_json::to_string_pretty(&*lock(&self.world))?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, json)?;
            std::fs::rename(&tmp, path)?;
            Ok(())
        })();
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "cannot persist simulated world");
        }
    }

    fn create_object(
        &self,
        kind: &str,
        inputs: &Inputs,
    ) -> std::result::Result<Attributes, RemoteError> {
        let mut world = lock(&self.world);
        let mut attrs: Attributes = inputs.clone();

        match kind {
            "project" => {
                let name = text(inputs, "name")?;
                let taken = world
                    .find("project", |a| a.get("name") == Some(&Value::String(name.clone())))
                    .is_some();
                if taken {
                    return Err(RemoteError::permanent(
                        PermanentClass::Conflict,
                        format!("project '{}' already exists", name),
                    ));
                }
                let id = self.generated_id(&mut world, "project");
                let project_id = value_to_string(&id);
                let repo_id = self.generated_id(&mut world, "repository");
                let repository = Attributes::from([
                    ("id".to_string(), repo_id.clone()),
                    ("name".to_string(), json!(name)),
                    ("project_id".to_string(), json!(project_id)),
                ]);
                world
                    .objects
                    .insert(object_key("repository", &value_to_string(&repo_id)), repository);
                attrs.insert("id".to_string(), id);
            }
            "repository_lookup" => {
                drop(world);
                return self.lookup_repository(inputs);
            }
            "repository_file" => {
                let repository_id = text(inputs, "repository_id")?;
                if !world.exists("repository", &repository_id) {
                    return Err(not_found("repository", &repository_id));
                }
                let file = text(inputs, "file")?;
                let content = inputs.get("content").map(value_to_string).unwrap_or_default();
                attrs.insert("id".to_string(), json!(format!("{}/{}", repository_id, file)));
                attrs.insert(
                    "commit_id".to_string(),
                    json!(crate::tripwire::hasher::hash_string(&content)),
                );
            }
            "application" => {
                text(inputs, "display_name")?;
                let object_id = self.generated_id(&mut world, "application");
                let application_id = json!(world.next_uuid(&self.organization));
                attrs.insert("object_id".to_string(), object_id.clone());
                attrs.insert("application_id".to_string(), application_id);
                attrs.insert("id".to_string(), object_id);
            }
            "service_principal" => {
                let application_id = text(inputs, "application_id")?;
                let registered = world
                    .find("application", |a| {
                        a.get("application_id").map(value_to_string).as_deref()
                            == Some(application_id.as_str())
                    })
                    .is_some();
                if !registered {
                    return Err(not_found("application", &application_id));
                }
                let id = self.generated_id(&mut world, kind);
                attrs.insert("id".to_string(), id);
            }
            "role_assignment" => {
                let principal_id = text(inputs, "principal_id")?;
                if !world.exists("service_principal", &principal_id) {
                    return Err(not_found("service principal", &principal_id));
                }
                let scope = text(inputs, "scope")?;
                let name = world.next_uuid(&self.organization);
                attrs.insert(
                    "id".to_string(),
                    json!(format!(
                        "{}/providers/Microsoft.Authorization/roleAssignments/{}",
                        scope, name
                    )),
                );
            }
            "service_connection" => {
                let project_id = text(inputs, "project_id")?;
                if !world.exists("project", &project_id) {
                    return Err(not_found("project", &project_id));
                }
                let id = self.generated_id(&mut world, kind);
                attrs.insert("id".to_string(), id);
                attrs.insert(
                    "workload_identity_federation_issuer".to_string(),
                    json!(self.organization_issuer()),
                );
            }
            "federated_identity_credential" => {
                let object_id = text(inputs, "application_object_id")?;
                if !world.exists("application", &object_id) {
                    return Err(not_found("application", &object_id));
                }
                let id = self.generated_id(&mut world, kind);
                attrs.insert("id".to_string(), id);
            }
            "build_definition" => {
                let repository_id = text(inputs, "repository_id")?;
                if !world.exists("repository", &repository_id) {
                    return Err(not_found("repository", &repository_id));
                }
                let id = self.generated_id(&mut world, kind);
                attrs.insert("id".to_string(), id);
            }
            "pipeline_authorization" => {
                let pipeline_id = text(inputs, "pipeline_id")?;
                let resource_id = text(inputs, "resource_id")?;
                attrs.insert(
                    "id".to_string(),
                    json!(format!("{}.{}", pipeline_id, resource_id)),
                );
            }
            other => {
                return Err(RemoteError::permanent(
                    PermanentClass::Other,
                    format!("unsupported kind '{}'", other),
                ))
            }
        }

        let id = attrs.get("id").map(value_to_string).unwrap_or_default();
        world.objects.insert(object_key(kind, &id), attrs.clone());
        drop(world);
        self.persist();
        Ok(attrs)
    }

    fn lookup_repository(&self, inputs: &Inputs) -> std::result::Result<Attributes, RemoteError> {
        let project_id = text(inputs, "project_id")?;
        let name = text(inputs, "name")?;
        let world = lock(&self.world);
        world
            .find("repository", |a| {
                a.get("project_id").map(value_to_string).as_deref() == Some(project_id.as_str())
                    && a.get("name").map(value_to_string).as_deref() == Some(name.as_str())
            })
            .cloned()
            .ok_or_else(|| not_found("repository", &format!("{}/{}", project_id, name)))
    }

    fn update_object(
        &self,
        kind: &str,
        remote_id: &str,
        inputs: &Inputs,
    ) -> std::result::Result<Attributes, RemoteError> {
        if kind == "repository_lookup" {
            return self.lookup_repository(inputs);
        }
        let mut world = lock(&self.world);
        let key = object_key(kind, remote_id);
        let Some(existing) = world.objects.get_mut(&key) else {
            return Err(not_found(kind, remote_id));
        };
        for (field, value) in inputs {
            existing.insert(field.clone(), value.clone());
        }
        let attrs = existing.clone();
        drop(world);
        self.persist();
        Ok(attrs)
    }

    fn delete_object(&self, kind: &str, remote_id: &str) {
        // Lookups never own the repository they found.
        if kind == "repository_lookup" {
            return;
        }
        let removed = lock(&self.world)
            .objects
            .remove(&object_key(kind, remote_id))
            .is_some();
        if removed {
            self.persist();
        }
    }
}

#[async_trait]
impl Provider for SimulatedProvider {
    async fn create(
        &self,
        kind: &str,
        inputs: &Inputs,
    ) -> std::result::Result<Attributes, RemoteError> {
        self.enter(Operation::Create, kind).await?;
        self.create_object(kind, inputs)
    }

    async fn read(
        &self,
        kind: &str,
        remote_id: &str,
    ) -> std::result::Result<Option<Attributes>, RemoteError> {
        self.enter(Operation::Read, kind).await?;
        Ok(self.object(kind, remote_id))
    }

    async fn update(
        &self,
        kind: &str,
        remote_id: &str,
        inputs: &Inputs,
    ) -> std::result::Result<Attributes, RemoteError> {
        self.enter(Operation::Update, kind).await?;
        self.update_object(kind, remote_id, inputs)
    }

    async fn delete(&self, kind: &str, remote_id: &str) -> std::result::Result<(), RemoteError> {
        self.enter(Operation::Delete, kind).await?;
        self.delete_object(kind, remote_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(pairs: &[(&str, Value)]) -> Inputs {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn project_inputs(name: &str) -> Inputs {
        inputs(&[
            ("name", json!(name)),
            ("description", json!("")),
            ("features", json!({"boards": "disabled"})),
        ])
    }

    #[tokio::test]
    async fn test_tl021_project_creates_default_repository() {
        let p = SimulatedProvider::new("contoso");
        let project = p.create("project", &project_inputs("ready")).await.unwrap();
        let project_id = value_to_string(&project["id"]);
        assert_eq!(project_id.len(), 36);

        let repo = p
            .create(
                "repository_lookup",
                &inputs(&[("project_id", json!(project_id)), ("name", json!("ready"))]),
            )
            .await
            .unwrap();
        assert_eq!(repo["name"], json!("ready"));
        assert_eq!(p.object_count(), 2);
    }

    #[tokio::test]
    async fn test_tl021_duplicate_project_conflicts() {
        let p = SimulatedProvider::new("contoso");
        p.create("project", &project_inputs("ready")).await.unwrap();
        let err = p.create("project", &project_inputs("ready")).await.unwrap_err();
        assert!(matches!(
            err,
            RemoteError::Permanent {
                class: PermanentClass::Conflict,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_tl021_build_definition_ids_are_sequential() {
        let p = SimulatedProvider::new("contoso");
        let project = p.create("project", &project_inputs("ready")).await.unwrap();
        let repo = p
            .create(
                "repository_lookup",
                &inputs(&[("project_id", project["id"].clone()), ("name", json!("ready"))]),
            )
            .await
            .unwrap();
        let def = inputs(&[
            ("project_id", project["id"].clone()),
            ("repository_id", repo["id"].clone()),
            ("branch", json!("refs/heads/main")),
            ("yml_path", json!("azure-pipelines.yaml")),
            ("repository_type", json!("TfsGit")),
        ]);
        assert_eq!(p.create("build_definition", &def).await.unwrap()["id"], json!(1));
        assert_eq!(p.create("build_definition", &def).await.unwrap()["id"], json!(2));
    }

    #[tokio::test]
    async fn test_tl021_pinned_id() {
        let p = SimulatedProvider::new("contoso");
        p.pin_id("project", json!("proj-1"));
        let project = p.create("project", &project_inputs("ready")).await.unwrap();
        assert_eq!(project["id"], json!("proj-1"));
        let again = p.create("project", &project_inputs("other")).await.unwrap();
        assert_ne!(again["id"], json!("proj-1"));
    }

    #[tokio::test]
    async fn test_tl021_missing_dependency_is_not_found() {
        let p = SimulatedProvider::new("contoso");
        let err = p
            .create("service_principal", &inputs(&[("application_id", json!("nope"))]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RemoteError::Permanent {
                class: PermanentClass::NotFound,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_tl021_injected_failures_are_consumed() {
        let p = SimulatedProvider::new("contoso");
        p.inject_failure("application", RemoteError::Transient("throttled".into()), Some(2));
        let app = inputs(&[("display_name", json!("ADO Azure Ready App"))]);
        assert!(p.create("application", &app).await.is_err());
        assert!(p.create("application", &app).await.is_err());
        let created = p.create("application", &app).await.unwrap();
        assert_eq!(created["id"], created["object_id"]);
        assert_eq!(p.call_count(), 3);
        assert_eq!(p.mutations_of("application").len(), 3);
    }

    #[tokio::test]
    async fn test_tl021_update_read_delete() {
        let p = SimulatedProvider::new("contoso");
        let app = p
            .create("application", &inputs(&[("display_name", json!("a"))]))
            .await
            .unwrap();
        let id = value_to_string(&app["id"]);
        let updated = p
            .update("application", &id, &inputs(&[("display_name", json!("b"))]))
            .await
            .unwrap();
        assert_eq!(updated["display_name"], json!("b"));
        assert_eq!(updated["application_id"], app["application_id"]);

        assert!(p.read("application", &id).await.unwrap().is_some());
        p.delete("application", &id).await.unwrap();
        assert!(p.read("application", &id).await.unwrap().is_none());
        assert!(p.update("application", &id, &Inputs::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_tl021_persistent_world_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remote.json");
        let id = {
            let p = SimulatedProvider::persistent("contoso", &path).unwrap();
            let project = p.create("project", &project_inputs("ready")).await.unwrap();
            value_to_string(&project["id"])
        };
        let p = SimulatedProvider::persistent("contoso", &path).unwrap();
        assert!(p.object("project", &id).is_some());
        assert_eq!(p.call_count(), 0);
    }

    #[test]
    fn test_tl021_issuer_is_stable_per_organization() {
        let a = SimulatedProvider::new("contoso").organization_issuer();
        let b = SimulatedProvider::new("contoso").organization_issuer();
        let c = SimulatedProvider::new("fabrikam").organization_issuer();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("https://vstoken.dev.azure.com/"));
    }
}

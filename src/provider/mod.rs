//! TL-020: Provider interface - narrow CRUD contract to the remote platforms.
//!
//! A provider knows nothing about graphs or state. It receives fully resolved
//! inputs and returns the remote object's attributes, which always carry `id`.

pub mod simulated;

pub use simulated::SimulatedProvider;

use crate::core::error::RemoteError;
use crate::core::types::{Attributes, KindSchema};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;

/// Fully resolved inputs handed to a provider call.
pub type Inputs = BTreeMap<String, Value>;

#[async_trait]
pub trait Provider: Send + Sync {
    /// Schema for `kind`, or `None` if this provider does not manage it.
    fn schema(&self, kind: &str) -> Option<KindSchema> {
        crate::resources::schema_for(kind).cloned()
    }

    async fn create(&self, kind: &str, inputs: &Inputs) -> Result<Attributes, RemoteError>;

    /// Current attributes, or `None` if the object no longer exists.
    async fn read(&self, kind: &str, remote_id: &str) -> Result<Option<Attributes>, RemoteError>;

    async fn update(
        &self,
        kind: &str,
        remote_id: &str,
        inputs: &Inputs,
    ) -> Result<Attributes, RemoteError>;

    async fn delete(&self, kind: &str, remote_id: &str) -> Result<(), RemoteError>;
}

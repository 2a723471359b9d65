//! Trustlink - declarative provisioning of a CI-to-cloud trust chain.
//!
//! Resources form a dependency graph whose edges come from deferred output
//! references. The executor converges it wave by wave against recorded state.
//! BLAKE3 input hashing. Provenance tracing.

pub mod cli;
pub mod core;
pub mod provider;
pub mod resources;
pub mod tripwire;

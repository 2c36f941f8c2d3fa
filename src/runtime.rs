//! Container runtime client interface.
//!
//! The agent never talks to a container engine directly; it goes through
//! this trait. A production implementation wraps the engine's API, while
//! tests use [`crate::testing::FakeRuntime`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::Port;

/// Activation state of a container unit as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationState {
    /// The unit is up
    Active,
    /// The unit is starting
    Activating,
    /// The unit is stopped or shutting down
    Inactive,
    /// The unit failed
    Failed,
}

impl ActivationState {
    /// Whether the unit counts as running for convergence purposes
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Active | Self::Activating)
    }
}

/// A container unit as observed through the runtime client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    /// Container name
    pub name: String,
    /// Image the container was created from, when the runtime reports it
    pub container_image: Option<String>,
    /// Current activation state
    pub activation_state: ActivationState,
    /// Port mappings the container was created with
    pub ports: Vec<Port>,
}

/// Client interface to the local container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start a named container.
    ///
    /// Fails with [`crate::Error::ContainerConflict`] if a container with
    /// this name already exists.
    async fn add(
        &self,
        name: &str,
        image: &str,
        ports: &[Port],
        environment: Option<&BTreeMap<String, String>>,
    ) -> Result<()>;

    /// Stop and remove a named container.
    ///
    /// Removing a container that does not exist is not an error.
    async fn remove(&self, name: &str) -> Result<()>;

    /// List all container units known to the runtime.
    async fn list(&self) -> Result<Vec<Unit>>;
}

//! # herder
//!
//! A per-node convergence agent for container clusters.
//!
//! Each node runs an agent that inspects what is currently running
//! locally, compares it against the cluster-wide desired configuration,
//! and applies an ordered plan of state changes: starting and stopping
//! containers, routing external TCP ports to applications hosted on
//! peer nodes, creating stateful volumes, and moving volumes between
//! nodes as their applications move.
//!
//! ## Features
//!
//! - **Declarative configuration** - applications, ports, links and
//!   volumes in a versioned YAML format, with a compose-style
//!   alternative accepted and auto-detected
//! - **Minimal ordered plans** - only the changes a node actually
//!   needs, in an order that keeps volume movement deadlock-free
//! - **Namespaced port proxies** - iptables-backed DNAT/MASQUERADE
//!   rules tagged per controller, so independent agents share a kernel
//! - **Value-typed plans** - plans are plain data with structural
//!   equality, inspectable before anything runs
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use herder::testing::{FakePool, FakeRemoteNodes, FakeRuntime};
//! use herder::{make_memory_network, Configuration, Deployer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), herder::Error> {
//!     let deployer = Deployer::new(
//!         Arc::new(FakePool::new()),
//!         Arc::new(FakeRuntime::new()),
//!         Arc::new(make_memory_network()),
//!         Arc::new(FakeRemoteNodes::new()),
//!     );
//!
//!     let desired = Configuration::new().model_from_configuration(
//!         &serde_yaml::from_str(
//!             "{version: 1, applications: {site: {image: 'sample/site:latest'}}}",
//!         )?,
//!         &serde_yaml::from_str("{version: 1, nodes: {'node1.example.com': [site]}}")?,
//!     )?;
//!
//!     // One convergence tick: observe, plan, execute.
//!     deployer
//!         .change_node_state(&desired, &desired, "node1.example.com")
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`model`] - immutable value types for configuration and state
//! - [`config`] - configuration parsing and persistence
//! - [`compose`] - the compose-style configuration format
//! - [`marshal`] - emitting configuration from observed state
//! - [`deploy`] - observation and the convergence planner
//! - [`actions`] - state changes and their execution semantics
//! - [`network`] / [`iptables`] - the namespaced port-proxy controller
//! - [`runtime`] / [`volume`] - collaborator interfaces
//! - [`testing`] - in-memory test doubles

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub use actions::StateChange;
pub use config::{
    current_from_configuration, persist_node_state, Configuration, CONFIGURATION_VERSION,
    DEFAULT_STATE_PATH,
};
#[cfg(feature = "compose")]
pub use compose::{applications_from_compose_configuration, is_compose_configuration};
pub use deploy::{find_volume_changes, Deployer};
pub use error::{Error, Result};
pub use iptables::{make_host_network, make_host_network_in, HostNetwork, COMMENT_MARKER};
pub use marshal::marshal_node_state;
pub use model::{
    Application, AttachedVolume, Deployment, ImageReference, Link, Node, NodeState, Port, Proxy,
    VolumeChanges, VolumeHandoff,
};
pub use network::{
    make_memory_network, make_memory_network_in, MemoryNetwork, Network, DEFAULT_NAMESPACE,
};
pub use runtime::{ActivationState, ContainerRuntime, Unit};
pub use volume::{
    RemoteNodes, RemoteVolumeManager, Volume, VolumePool, TRANSPORT_PORT,
    TRANSPORT_PRIVATE_KEY_PATH, TRANSPORT_USER,
};

pub mod actions;
#[cfg(feature = "compose")]
pub mod compose;
pub mod config;
pub mod deploy;
pub mod error;
pub mod iptables;
pub mod marshal;
pub mod model;
pub mod network;
pub mod runtime;
pub mod testing;
pub mod volume;

/// The version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

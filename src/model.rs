//! Core model types for cluster configuration and node state.
//!
//! Everything here is an immutable value: construction validates, equality
//! and ordering are structural, and transformations yield new values. The
//! parser builds these from configuration files, the observation step builds
//! them from the live node, and the planner only ever compares them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A container image reference in `repository:tag` form.
///
/// Only the final component is split on a colon, so registry hosts with
/// ports (`localhost:5000/site:v2`) parse correctly. A missing tag is an
/// error.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ImageReference {
    /// Repository, possibly including a registry host
    pub repository: String,
    /// Image tag
    pub tag: String,
}

impl ImageReference {
    /// Create an image reference from repository and tag parts
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Result<Self> {
        let repository = repository.into();
        let tag = tag.into();
        if repository.is_empty() {
            return Err(Error::invalid_config("Image repository cannot be empty."));
        }
        if tag.is_empty() || tag.contains('/') {
            return Err(Error::invalid_config(format!(
                "Image name '{repository}' has no tag."
            )));
        }
        Ok(Self { repository, tag })
    }

    /// The full `repository:tag` form
    pub fn full_name(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

impl FromStr for ImageReference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.rsplit_once(':') {
            Some((repository, tag)) if !tag.contains('/') => Self::new(repository, tag),
            _ => Err(Error::invalid_config(format!(
                "Image name '{s}' has no tag."
            ))),
        }
    }
}

/// A port an application exposes to the outside world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Port {
    /// Port the application listens on inside its container
    pub internal_port: u16,
    /// Port exposed on the host
    pub external_port: u16,
}

impl Port {
    /// Create a port mapping; both sides must be in 1..=65535
    pub fn new(internal_port: u16, external_port: u16) -> Result<Self> {
        if internal_port == 0 || external_port == 0 {
            return Err(Error::invalid_config("Ports must be in the range 1-65535."));
        }
        Ok(Self {
            internal_port,
            external_port,
        })
    }
}

/// A named connection from one application to the ports of another.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Link {
    /// Port the linking application connects to
    pub local_port: u16,
    /// Port the target application is reachable on
    pub remote_port: u16,
    /// Alias under which the target is known to the linking application
    pub alias: String,
}

impl Link {
    /// Create a link; ports must be in 1..=65535 and the alias non-empty
    pub fn new(local_port: u16, remote_port: u16, alias: impl Into<String>) -> Result<Self> {
        let alias = alias.into();
        if local_port == 0 || remote_port == 0 {
            return Err(Error::invalid_config("Ports must be in the range 1-65535."));
        }
        if alias.is_empty() {
            return Err(Error::invalid_config("Link alias cannot be empty."));
        }
        Ok(Self {
            local_port,
            remote_port,
            alias,
        })
    }

    /// The alias normalized for environment variable names: uppercased,
    /// hyphens replaced with underscores
    pub fn environment_alias(&self) -> String {
        self.alias.to_uppercase().replace('-', "_")
    }
}

/// A stateful volume attached to an application.
///
/// The volume name currently always equals the owning application's name.
/// The mountpoint is `None` only for observed state, where it is unknown.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AttachedVolume {
    /// Volume name
    pub name: String,
    /// Absolute path the volume is mounted at inside the container, or
    /// `None` when observation could not determine it
    pub mountpoint: Option<PathBuf>,
}

impl AttachedVolume {
    /// Create an attached volume with a known mountpoint
    pub fn new(name: impl Into<String>, mountpoint: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            mountpoint: Some(mountpoint.into()),
        }
    }

    /// Create an attached volume whose mountpoint is unknown
    pub fn unknown_mountpoint(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mountpoint: None,
        }
    }
}

/// A uniquely named container declaration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Application {
    /// Application name, globally unique within a deployment
    pub name: String,
    /// Image to run, or `None` when observed state could not determine it
    pub image: Option<ImageReference>,
    /// Externally exposed ports
    pub ports: BTreeSet<Port>,
    /// Links to other applications
    pub links: BTreeSet<Link>,
    /// At most one attached volume
    pub volume: Option<AttachedVolume>,
    /// Declared environment variables
    pub environment: Option<BTreeMap<String, String>>,
}

impl Application {
    /// Create a minimal application with only a name, as produced by
    /// observation of a running container
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: None,
            ports: BTreeSet::new(),
            links: BTreeSet::new(),
            volume: None,
            environment: None,
        }
    }

    /// Replace the volume, yielding a new value
    pub fn with_volume(mut self, volume: AttachedVolume) -> Self {
        self.volume = Some(volume);
        self
    }
}

/// A cluster node and the applications assigned to it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Node {
    /// Node hostname
    pub hostname: String,
    /// Applications assigned to this node
    pub applications: BTreeSet<Application>,
}

impl Node {
    /// Create a node; application names must be unique within the node
    pub fn new(
        hostname: impl Into<String>,
        applications: impl IntoIterator<Item = Application>,
    ) -> Result<Self> {
        let hostname = hostname.into();
        let applications: BTreeSet<Application> = applications.into_iter().collect();
        let mut names = BTreeSet::new();
        for application in &applications {
            if !names.insert(application.name.as_str()) {
                return Err(Error::invalid_config(format!(
                    "Node {hostname} has a config error. \
                     Duplicate application name: {}.",
                    application.name
                )));
            }
        }
        Ok(Self {
            hostname,
            applications,
        })
    }
}

/// A cluster-wide mapping of applications to nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Deployment {
    /// The nodes making up the cluster
    pub nodes: BTreeSet<Node>,
}

impl Deployment {
    /// Create a deployment; hostnames must be unique
    pub fn new(nodes: impl IntoIterator<Item = Node>) -> Result<Self> {
        let nodes: BTreeSet<Node> = nodes.into_iter().collect();
        let mut hostnames = BTreeSet::new();
        for node in &nodes {
            if !hostnames.insert(node.hostname.as_str()) {
                return Err(Error::invalid_config(format!(
                    "Deployment configuration has an error. \
                     Duplicate hostname: {}.",
                    node.hostname
                )));
            }
        }
        Ok(Self { nodes })
    }

    /// Look up a node by hostname
    pub fn node(&self, hostname: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.hostname == hostname)
    }
}

/// The observed state of the local node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeState {
    /// Applications currently running or starting up
    pub running: BTreeSet<Application>,
    /// Applications currently shutting down or stopped
    pub not_running: BTreeSet<Application>,
    /// TCP ports in use on the node, whether by servers or proxies
    pub used_ports: BTreeSet<u16>,
}

impl NodeState {
    /// All observed applications, running or not
    pub fn all_applications(&self) -> impl Iterator<Item = &Application> {
        self.running.iter().chain(self.not_running.iter())
    }
}

/// A volume that must leave this node for a named peer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VolumeHandoff {
    /// The volume to hand off
    pub volume: AttachedVolume,
    /// Hostname of the node taking ownership
    pub hostname: String,
}

/// The classification of volume movements relative to the local node.
///
/// A volume appears in at most one of the three sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeChanges {
    /// Volumes moving from this node to a peer
    pub going: BTreeSet<VolumeHandoff>,
    /// Volumes moving from a peer to this node
    pub coming: BTreeSet<AttachedVolume>,
    /// Volumes nowhere present yet that this node must create
    pub creating: BTreeSet<AttachedVolume>,
}

/// A host-to-peer TCP proxy owned by a controller namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Proxy {
    /// Host the proxied traffic is sent to
    pub target_ip: String,
    /// TCP port proxied on both sides
    pub target_port: u16,
    /// Tag scoping this proxy to a controller instance
    pub namespace: String,
}

impl Proxy {
    /// Create a proxy record
    pub fn new(
        target_ip: impl Into<String>,
        target_port: u16,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            target_ip: target_ip.into(),
            target_port,
            namespace: namespace.into(),
        }
    }
}

//! Convergence of the local node toward a desired cluster deployment.
//!
//! The [`Deployer`] owns handles to the node's collaborators: the
//! container runtime, the volume pool, the proxy controller and the
//! cross-node transport. Each convergence tick observes the node,
//! computes the minimal ordered plan of state changes, and runs it.
//!
//! Phases are strictly ordered. Proxies are reconciled first. Volumes
//! leaving this node are pushed while their contents are still warm,
//! their owning containers are stopped, and only then is ownership
//! handed off; handing off before waiting for inbound volumes is what
//! keeps two nodes swapping volumes from deadlocking against each
//! other. Containers start last, once every volume they need exists.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info};

use crate::actions::StateChange;
use crate::error::Result;
use crate::model::{
    Application, AttachedVolume, Deployment, NodeState, Proxy, VolumeChanges, VolumeHandoff,
};
use crate::network::Network;
use crate::runtime::ContainerRuntime;
use crate::volume::{RemoteNodes, VolumePool};

/// Drives the local node toward a desired deployment.
pub struct Deployer {
    pub(crate) volume_pool: Arc<dyn VolumePool>,
    pub(crate) container_runtime: Arc<dyn ContainerRuntime>,
    pub(crate) network: Arc<dyn Network>,
    pub(crate) remote_nodes: Arc<dyn RemoteNodes>,
}

impl Deployer {
    /// Create a deployer over the node's collaborators.
    pub fn new(
        volume_pool: Arc<dyn VolumePool>,
        container_runtime: Arc<dyn ContainerRuntime>,
        network: Arc<dyn Network>,
        remote_nodes: Arc<dyn RemoteNodes>,
    ) -> Self {
        Self {
            volume_pool,
            container_runtime,
            network,
            remote_nodes,
        }
    }

    /// The proxy controller this deployer reconciles through.
    pub fn network(&self) -> &dyn Network {
        self.network.as_ref()
    }

    /// Observe the applications and ports on this node.
    ///
    /// Units in an active or activating state count as running, anything
    /// else as stopped. A unit whose name matches a locally-owned volume
    /// is observed with that volume attached; its mountpoint is unknown.
    pub async fn discover_node_configuration(&self) -> Result<NodeState> {
        let pool_uuid = self.volume_pool.uuid();
        let owned_volumes: BTreeSet<String> = self
            .volume_pool
            .enumerate()
            .await?
            .into_iter()
            .filter(|volume| volume.is_locally_owned_by(pool_uuid))
            .map(|volume| volume.name)
            .collect();

        let units = self.container_runtime.list().await?;
        let used_ports = self.network.enumerate_used_ports().await?;

        let mut running = BTreeSet::new();
        let mut not_running = BTreeSet::new();
        for unit in units {
            let mut application = Application::named(&unit.name);
            if owned_volumes.contains(&unit.name) {
                application.volume = Some(AttachedVolume::unknown_mountpoint(&unit.name));
            }
            if unit.activation_state.is_running() {
                running.insert(application);
            } else {
                not_running.insert(application);
            }
        }

        debug!(
            running = running.len(),
            not_running = not_running.len(),
            "observed node state"
        );
        Ok(NodeState {
            running,
            not_running,
            used_ports,
        })
    }

    /// Work out which changes need to happen to make the local node
    /// match the desired deployment.
    ///
    /// `current_cluster_state` is the last known cluster-wide
    /// configuration; it may lag behind reality, which is why the local
    /// node's state is passed in freshly observed rather than read from
    /// it.
    pub async fn calculate_necessary_state_changes(
        &self,
        desired_state: &Deployment,
        current_cluster_state: &Deployment,
        node_state: &NodeState,
        hostname: &str,
    ) -> Result<StateChange> {
        let mut phases = Vec::new();

        // Ports exposed by applications on peer nodes must be proxied
        // from this node.
        let mut desired_proxies = BTreeSet::new();
        let mut desired_node_applications: BTreeSet<Application> = BTreeSet::new();
        for node in &desired_state.nodes {
            if node.hostname == hostname {
                desired_node_applications = node.applications.clone();
                continue;
            }
            for application in &node.applications {
                for port in &application.ports {
                    desired_proxies.insert(Proxy::new(
                        node.hostname.clone(),
                        port.external_port,
                        self.network.namespace(),
                    ));
                }
            }
        }
        let current_proxies: BTreeSet<Proxy> = self
            .network
            .enumerate_proxies()
            .await?
            .into_iter()
            .collect();
        if desired_proxies != current_proxies {
            phases.push(StateChange::SetProxies {
                proxies: desired_proxies,
            });
        }

        // Applications are compared by name only; configuration drift
        // within an application is not reconciled here.
        let running: BTreeSet<&str> = node_state
            .running
            .iter()
            .map(|app| app.name.as_str())
            .collect();
        let not_running: BTreeSet<&str> = node_state
            .not_running
            .iter()
            .map(|app| app.name.as_str())
            .collect();
        let desired_local: BTreeSet<&str> = desired_node_applications
            .iter()
            .map(|app| app.name.as_str())
            .collect();

        let all_local: BTreeSet<&str> = running.union(&not_running).copied().collect();
        let start_names: BTreeSet<&str> =
            desired_local.difference(&all_local).copied().collect();
        let stop_names: BTreeSet<&str> =
            all_local.difference(&desired_local).copied().collect();

        let start_containers: Vec<StateChange> = desired_node_applications
            .iter()
            .filter(|app| start_names.contains(app.name.as_str()))
            .map(|app| StateChange::StartApplication {
                application: app.clone(),
                hostname: hostname.to_string(),
            })
            .collect();
        let stop_containers: Vec<StateChange> = node_state
            .all_applications()
            .filter(|app| stop_names.contains(app.name.as_str()))
            .map(|app| StateChange::StopApplication {
                application: app.clone(),
            })
            .collect();
        // An application that exists here but is not running must be
        // restarted, not merely started.
        let restart_containers: Vec<StateChange> = desired_node_applications
            .iter()
            .filter(|app| not_running.contains(app.name.as_str()))
            .map(|app| {
                StateChange::sequentially(vec![
                    StateChange::StopApplication {
                        application: app.clone(),
                    },
                    StateChange::StartApplication {
                        application: app.clone(),
                        hostname: hostname.to_string(),
                    },
                ])
            })
            .collect();

        let volumes = find_volume_changes(hostname, current_cluster_state, desired_state);

        if !volumes.going.is_empty() {
            phases.push(StateChange::in_parallel(
                volumes
                    .going
                    .iter()
                    .map(|handoff| StateChange::PushVolume {
                        volume: handoff.volume.clone(),
                        hostname: handoff.hostname.clone(),
                    })
                    .collect(),
            ));
        }
        if !stop_containers.is_empty() {
            phases.push(StateChange::in_parallel(stop_containers));
        }
        if !volumes.going.is_empty() {
            phases.push(StateChange::in_parallel(
                volumes
                    .going
                    .iter()
                    .map(|handoff| StateChange::HandoffVolume {
                        volume: handoff.volume.clone(),
                        hostname: handoff.hostname.clone(),
                    })
                    .collect(),
            ));
        }
        if !volumes.coming.is_empty() {
            phases.push(StateChange::in_parallel(
                volumes
                    .coming
                    .iter()
                    .map(|volume| StateChange::WaitForVolume {
                        volume: volume.clone(),
                    })
                    .collect(),
            ));
        }
        if !volumes.creating.is_empty() {
            phases.push(StateChange::in_parallel(
                volumes
                    .creating
                    .iter()
                    .map(|volume| StateChange::CreateVolume {
                        volume: volume.clone(),
                    })
                    .collect(),
            ));
        }

        let mut start_restart = start_containers;
        start_restart.extend(restart_containers);
        if !start_restart.is_empty() {
            phases.push(StateChange::in_parallel(start_restart));
        }

        Ok(StateChange::sequentially(phases))
    }

    /// One convergence tick: observe, plan, execute.
    pub async fn change_node_state(
        &self,
        desired_state: &Deployment,
        current_cluster_state: &Deployment,
        hostname: &str,
    ) -> Result<()> {
        let node_state = self.discover_node_configuration().await?;
        let plan = self
            .calculate_necessary_state_changes(
                desired_state,
                current_cluster_state,
                &node_state,
                hostname,
            )
            .await?;
        if plan.is_empty() {
            debug!(hostname, "node already converged");
            return Ok(());
        }
        info!(hostname, "applying state changes");
        plan.run(self).await
    }
}

/// Classify every volume as going, coming or creating relative to the
/// named node, comparing current and desired cluster state by volume
/// name.
pub fn find_volume_changes(
    hostname: &str,
    current_state: &Deployment,
    desired_state: &Deployment,
) -> VolumeChanges {
    let node_volumes = |deployment: &Deployment, wanted: &str| -> BTreeSet<AttachedVolume> {
        deployment
            .nodes
            .iter()
            .filter(|node| node.hostname == wanted)
            .flat_map(|node| {
                node.applications
                    .iter()
                    .filter_map(|app| app.volume.clone())
            })
            .collect()
    };

    let local_desired = node_volumes(desired_state, hostname);
    let local_current = node_volumes(current_state, hostname);
    let local_current_names: BTreeSet<&str> =
        local_current.iter().map(|v| v.name.as_str()).collect();

    let mut remote_current_names: BTreeSet<&str> = BTreeSet::new();
    for node in &current_state.nodes {
        if node.hostname != hostname {
            remote_current_names.extend(
                node.applications
                    .iter()
                    .filter_map(|app| app.volume.as_ref())
                    .map(|volume| volume.name.as_str()),
            );
        }
    }

    // Volumes running here now but desired elsewhere leave this node.
    let mut going = BTreeSet::new();
    for node in &desired_state.nodes {
        if node.hostname == hostname {
            continue;
        }
        for volume in node.applications.iter().filter_map(|app| app.volume.as_ref()) {
            if local_current_names.contains(volume.name.as_str()) {
                going.insert(VolumeHandoff {
                    volume: volume.clone(),
                    hostname: node.hostname.clone(),
                });
            }
        }
    }

    // Volumes desired here that currently live on a peer arrive from
    // that peer; volumes desired here that exist nowhere get created.
    let coming: BTreeSet<AttachedVolume> = local_desired
        .iter()
        .filter(|volume| remote_current_names.contains(volume.name.as_str()))
        .cloned()
        .collect();
    let creating: BTreeSet<AttachedVolume> = local_desired
        .iter()
        .filter(|volume| {
            !local_current_names.contains(volume.name.as_str())
                && !remote_current_names.contains(volume.name.as_str())
        })
        .cloned()
        .collect();

    VolumeChanges {
        going,
        coming,
        creating,
    }
}

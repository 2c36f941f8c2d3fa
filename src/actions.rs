//! State changes and their execution.
//!
//! Every change the convergence engine can make to the local node is a
//! variant of [`StateChange`], a closed sum type with structural
//! equality. Plans are values: the planner builds a tree of changes, the
//! tests compare trees, and only [`StateChange::run`] touches the world.
//!
//! Composite changes define the failure semantics. [`Sequentially`]
//! stops at the first failing child and propagates its error.
//! [`InParallel`] starts every child, awaits them all, logs every
//! failure and returns the first one; a failing sibling never cancels
//! the others.
//!
//! [`Sequentially`]: StateChange::Sequentially
//! [`InParallel`]: StateChange::InParallel

use std::collections::{BTreeMap, BTreeSet};

use futures::future::{join_all, BoxFuture, FutureExt};
use tracing::{debug, error};

use crate::deploy::Deployer;
use crate::error::{Error, Result};
use crate::model::{Application, AttachedVolume, Link, Port, Proxy};

/// A change to the state of the local node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChange {
    /// Run children in order; the first failure aborts the rest.
    Sequentially {
        /// Children, run one after another
        changes: Vec<StateChange>,
    },
    /// Run children concurrently; failures do not cancel siblings.
    InParallel {
        /// Children, run all at once
        changes: Vec<StateChange>,
    },
    /// Create and start an application's container.
    StartApplication {
        /// The application to start
        application: Application,
        /// Hostname of the node it starts on, used when synthesizing
        /// link environment variables
        hostname: String,
    },
    /// Stop and remove an application's container.
    StopApplication {
        /// The application to stop
        application: Application,
    },
    /// Create a new locally-owned volume.
    CreateVolume {
        /// Volume to create
        volume: AttachedVolume,
    },
    /// Wait until a volume exists and is locally owned.
    WaitForVolume {
        /// Volume to wait for
        volume: AttachedVolume,
    },
    /// Transfer ownership of a volume to a peer node.
    HandoffVolume {
        /// Volume to hand off
        volume: AttachedVolume,
        /// Peer taking ownership
        hostname: String,
    },
    /// Replicate a volume to a peer node without transferring ownership.
    PushVolume {
        /// Volume to push
        volume: AttachedVolume,
        /// Peer receiving the copy
        hostname: String,
    },
    /// Reconcile the installed proxies with a desired set.
    SetProxies {
        /// The proxies that should exist after reconciliation
        proxies: BTreeSet<Proxy>,
    },
}

impl StateChange {
    /// A sequential composition of changes.
    pub fn sequentially(changes: Vec<StateChange>) -> Self {
        Self::Sequentially { changes }
    }

    /// A parallel composition of changes.
    pub fn in_parallel(changes: Vec<StateChange>) -> Self {
        Self::InParallel { changes }
    }

    /// An empty plan.
    pub fn empty() -> Self {
        Self::Sequentially {
            changes: Vec::new(),
        }
    }

    /// Whether this change does nothing.
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Sequentially { changes } if changes.is_empty())
    }

    /// Apply this change to the node behind the deployer.
    pub fn run<'a>(&'a self, deployer: &'a Deployer) -> BoxFuture<'a, Result<()>> {
        match self {
            Self::Sequentially { changes } => async move {
                for change in changes {
                    change.run(deployer).await?;
                }
                Ok(())
            }
            .boxed(),

            Self::InParallel { changes } => async move {
                let results = join_all(changes.iter().map(|change| change.run(deployer))).await;
                first_failure(results)
            }
            .boxed(),

            Self::StartApplication {
                application,
                hostname,
            } => async move {
                debug!(application = %application.name, "starting application");
                if let Some(volume) = &application.volume {
                    let mountpoint = volume.mountpoint.as_deref().ok_or_else(|| {
                        Error::invalid_config(format!(
                            "Application '{}' has a volume with an unknown mountpoint.",
                            application.name
                        ))
                    })?;
                    deployer
                        .volume_pool
                        .expose(&volume.name, mountpoint)
                        .await?;
                }
                let image = application.image.as_ref().ok_or_else(|| {
                    Error::invalid_config(format!(
                        "Application '{}' has no image to start from.",
                        application.name
                    ))
                })?;
                let ports: Vec<Port> = application.ports.iter().copied().collect();
                let environment = application_environment(application, hostname);
                deployer
                    .container_runtime
                    .add(
                        &application.name,
                        &image.full_name(),
                        &ports,
                        environment.as_ref(),
                    )
                    .await
            }
            .boxed(),

            Self::StopApplication { application } => async move {
                debug!(application = %application.name, "stopping application");
                deployer.container_runtime.remove(&application.name).await?;
                if let Some(volume) = &application.volume {
                    deployer.volume_pool.unexpose(&volume.name).await?;
                }
                Ok(())
            }
            .boxed(),

            Self::CreateVolume { volume } => async move {
                deployer.volume_pool.create(&volume.name).await.map(|_| ())
            }
            .boxed(),

            Self::WaitForVolume { volume } => async move {
                deployer
                    .volume_pool
                    .wait_for_volume(&volume.name)
                    .await
                    .map(|_| ())
            }
            .boxed(),

            Self::HandoffVolume { volume, hostname } => async move {
                debug!(volume = %volume.name, peer = %hostname, "handing off volume");
                let remote = deployer.remote_nodes.connect(hostname).await?;
                let pool_volume = deployer.volume_pool.get(&volume.name).await?;
                deployer
                    .volume_pool
                    .handoff(&pool_volume, remote.as_ref())
                    .await
            }
            .boxed(),

            Self::PushVolume { volume, hostname } => async move {
                debug!(volume = %volume.name, peer = %hostname, "pushing volume");
                let remote = deployer.remote_nodes.connect(hostname).await?;
                let pool_volume = deployer.volume_pool.get(&volume.name).await?;
                deployer
                    .volume_pool
                    .push(&pool_volume, remote.as_ref())
                    .await
            }
            .boxed(),

            Self::SetProxies { proxies } => async move {
                let network = deployer.network.as_ref();
                let current: BTreeSet<Proxy> =
                    network.enumerate_proxies().await?.into_iter().collect();
                let mut results = Vec::new();
                for proxy in current.difference(proxies) {
                    results.push(network.delete_proxy(proxy).await);
                }
                for proxy in proxies.difference(&current) {
                    results.push(
                        network
                            .create_proxy_to(&proxy.target_ip, proxy.target_port)
                            .await
                            .map(|_| ()),
                    );
                }
                first_failure(results)
            }
            .boxed(),
        }
    }
}

/// Log every failure, then return the first one.
fn first_failure(results: impl IntoIterator<Item = Result<()>>) -> Result<()> {
    let mut first = None;
    for result in results {
        if let Err(err) = result {
            error!(error = %err, "state change failed");
            if first.is_none() {
                first = Some(err);
            }
        }
    }
    match first {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Environment variables advertising a link's target, one quad per link.
///
/// The alias is uppercased with hyphens replaced by underscores; the
/// value points back at this node, where the proxy for the target's
/// external port lives.
pub(crate) fn link_environment(hostname: &str, links: &BTreeSet<Link>) -> BTreeMap<String, String> {
    let mut environment = BTreeMap::new();
    for link in links {
        let base = format!("{}_PORT_{}_TCP", link.environment_alias(), link.local_port);
        environment.insert(
            base.clone(),
            format!("tcp://{hostname}:{}", link.remote_port),
        );
        environment.insert(format!("{base}_ADDR"), hostname.to_string());
        environment.insert(format!("{base}_PORT"), link.remote_port.to_string());
        environment.insert(format!("{base}_PROTO"), "tcp".to_string());
    }
    environment
}

/// The full environment an application's container starts with: the
/// synthesized link variables merged under the declared ones, declared
/// values winning on conflict.
pub(crate) fn application_environment(
    application: &Application,
    hostname: &str,
) -> Option<BTreeMap<String, String>> {
    let mut environment = link_environment(hostname, &application.links);
    if let Some(declared) = &application.environment {
        environment.extend(declared.clone());
    }
    if environment.is_empty() {
        None
    } else {
        Some(environment)
    }
}

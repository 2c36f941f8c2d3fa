//! In-memory test doubles for the collaborator interfaces.
//!
//! These implement the runtime, volume pool and transport traits
//! without touching a real container engine, storage pool or network,
//! and record the calls made against them so tests can assert on
//! behavior.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::Port;
use crate::runtime::{ActivationState, ContainerRuntime, Unit};
use crate::volume::{RemoteNodes, RemoteVolumeManager, Volume, VolumePool};

/// A [`ContainerRuntime`] holding units in memory.
#[derive(Debug, Default)]
pub struct FakeRuntime {
    units: Mutex<BTreeMap<String, Unit>>,
    environments: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
}

impl FakeRuntime {
    /// An empty runtime.
    pub fn new() -> Self {
        Self::default()
    }

    /// A runtime pre-populated with units.
    pub fn with_units(units: impl IntoIterator<Item = Unit>) -> Self {
        Self {
            units: Mutex::new(
                units
                    .into_iter()
                    .map(|unit| (unit.name.clone(), unit))
                    .collect(),
            ),
            environments: Mutex::new(BTreeMap::new()),
        }
    }

    /// The environment a unit was started with, if one was passed.
    pub async fn environment_of(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.environments.lock().await.get(name).cloned()
    }

    /// Whether a unit with the given name exists.
    pub async fn has_unit(&self, name: &str) -> bool {
        self.units.lock().await.contains_key(name)
    }

    /// The unit with the given name, if any.
    pub async fn unit(&self, name: &str) -> Option<Unit> {
        self.units.lock().await.get(name).cloned()
    }
}

/// A stopped unit with the given name, convenient for observation tests.
pub fn stopped_unit(name: &str) -> Unit {
    Unit {
        name: name.to_string(),
        container_image: None,
        activation_state: ActivationState::Inactive,
        ports: Vec::new(),
    }
}

/// An active unit with the given name.
pub fn active_unit(name: &str) -> Unit {
    Unit {
        name: name.to_string(),
        container_image: None,
        activation_state: ActivationState::Active,
        ports: Vec::new(),
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn add(
        &self,
        name: &str,
        image: &str,
        ports: &[Port],
        environment: Option<&BTreeMap<String, String>>,
    ) -> Result<()> {
        let mut units = self.units.lock().await;
        if units.contains_key(name) {
            return Err(Error::container_conflict(name));
        }
        if let Some(environment) = environment {
            self.environments
                .lock()
                .await
                .insert(name.to_string(), environment.clone());
        }
        units.insert(
            name.to_string(),
            Unit {
                name: name.to_string(),
                container_image: Some(image.to_string()),
                activation_state: ActivationState::Active,
                ports: ports.to_vec(),
            },
        );
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.units.lock().await.remove(name);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Unit>> {
        Ok(self.units.lock().await.values().cloned().collect())
    }
}

/// A [`VolumePool`] holding volumes in memory and recording transfers.
#[derive(Debug)]
pub struct FakePool {
    uuid: Uuid,
    volumes: Mutex<BTreeMap<String, Volume>>,
    exposed: Mutex<BTreeMap<String, PathBuf>>,
    pushed: Mutex<Vec<String>>,
    handed_off: Mutex<Vec<String>>,
}

impl FakePool {
    /// An empty pool with a fresh identity.
    pub fn new() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            volumes: Mutex::new(BTreeMap::new()),
            exposed: Mutex::new(BTreeMap::new()),
            pushed: Mutex::new(Vec::new()),
            handed_off: Mutex::new(Vec::new()),
        }
    }

    /// Insert a volume owned by an arbitrary pool, locally owned or not.
    pub async fn add_volume(&self, name: &str, owner: Uuid) {
        self.volumes.lock().await.insert(
            name.to_string(),
            Volume {
                uuid: owner,
                name: name.to_string(),
            },
        );
    }

    /// Where a volume is currently exposed, if it is.
    pub async fn exposed_at(&self, name: &str) -> Option<PathBuf> {
        self.exposed.lock().await.get(name).cloned()
    }

    /// Names of volumes pushed so far, in order.
    pub async fn pushed(&self) -> Vec<String> {
        self.pushed.lock().await.clone()
    }

    /// Names of volumes handed off so far, in order.
    pub async fn handed_off(&self) -> Vec<String> {
        self.handed_off.lock().await.clone()
    }
}

impl Default for FakePool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VolumePool for FakePool {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    async fn create(&self, name: &str) -> Result<Volume> {
        let volume = Volume {
            uuid: self.uuid,
            name: name.to_string(),
        };
        self.volumes
            .lock()
            .await
            .insert(name.to_string(), volume.clone());
        Ok(volume)
    }

    async fn get(&self, name: &str) -> Result<Volume> {
        self.volumes
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::volume_not_found(name))
    }

    async fn enumerate(&self) -> Result<Vec<Volume>> {
        Ok(self.volumes.lock().await.values().cloned().collect())
    }

    async fn wait_for_volume(&self, name: &str) -> Result<Volume> {
        loop {
            if let Some(volume) = self.volumes.lock().await.get(name) {
                if volume.is_locally_owned_by(self.uuid) {
                    return Ok(volume.clone());
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn expose(&self, name: &str, mountpoint: &Path) -> Result<()> {
        self.exposed
            .lock()
            .await
            .insert(name.to_string(), mountpoint.to_path_buf());
        Ok(())
    }

    async fn unexpose(&self, name: &str) -> Result<()> {
        self.exposed.lock().await.remove(name);
        Ok(())
    }

    async fn push(&self, volume: &Volume, remote: &dyn RemoteVolumeManager) -> Result<()> {
        if !volume.is_locally_owned_by(self.uuid) {
            return Err(Error::not_owned(&volume.name));
        }
        let _sink = remote.receive(volume).await?;
        self.pushed.lock().await.push(volume.name.clone());
        Ok(())
    }

    async fn handoff(&self, volume: &Volume, remote: &dyn RemoteVolumeManager) -> Result<()> {
        if !volume.is_locally_owned_by(self.uuid) {
            return Err(Error::not_owned(&volume.name));
        }
        let _sink = remote.receive(volume).await?;
        let peer_uuid = remote.acquire(volume).await?;
        self.volumes.lock().await.insert(
            volume.name.clone(),
            Volume {
                uuid: peer_uuid,
                name: volume.name.clone(),
            },
        );
        self.handed_off.lock().await.push(volume.name.clone());
        Ok(())
    }
}

/// A [`RemoteVolumeManager`] that discards received data.
#[derive(Debug, Clone)]
pub struct FakeRemoteManager {
    uuid: Uuid,
}

#[async_trait]
impl RemoteVolumeManager for FakeRemoteManager {
    async fn receive(&self, _volume: &Volume) -> Result<Box<dyn AsyncWrite + Send + Unpin>> {
        Ok(Box::new(tokio::io::sink()))
    }

    async fn acquire(&self, _volume: &Volume) -> Result<Uuid> {
        Ok(self.uuid)
    }
}

/// A [`RemoteNodes`] connector recording the peers it was asked for.
#[derive(Debug)]
pub struct FakeRemoteNodes {
    remote_uuid: Uuid,
    connected: Mutex<Vec<String>>,
}

impl FakeRemoteNodes {
    /// A connector whose remote managers all share one fresh identity.
    pub fn new() -> Self {
        Self {
            remote_uuid: Uuid::new_v4(),
            connected: Mutex::new(Vec::new()),
        }
    }

    /// Hostnames connected to so far, in order.
    pub async fn connections(&self) -> Vec<String> {
        self.connected.lock().await.clone()
    }
}

impl Default for FakeRemoteNodes {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteNodes for FakeRemoteNodes {
    async fn connect(&self, hostname: &str) -> Result<Box<dyn RemoteVolumeManager>> {
        self.connected.lock().await.push(hostname.to_string());
        Ok(Box::new(FakeRemoteManager {
            uuid: self.remote_uuid,
        }))
    }
}

//! Volume pool and cross-node transport interfaces.
//!
//! Stateful volumes live in a storage pool owned by each node. The pool
//! driver (filesystem snapshots, send/receive streams) and the SSH
//! transport that connects peers are external; the traits here are the
//! seams the convergence engine calls through.

use std::path::Path;

use async_trait::async_trait;
use tokio::io::AsyncWrite;
use uuid::Uuid;

use crate::error::Result;

/// TCP port remote volume manager sessions connect to.
pub const TRANSPORT_PORT: u16 = 22;

/// User remote volume manager sessions authenticate as.
pub const TRANSPORT_USER: &str = "root";

/// Path to the private key used for cross-node sessions, present on every
/// node.
pub const TRANSPORT_PRIVATE_KEY_PATH: &str = "/etc/herder/id_rsa_herder";

/// A volume in a node's storage pool.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Volume {
    /// UUID of the pool that owns this volume
    pub uuid: Uuid,
    /// Volume name
    pub name: String,
}

impl Volume {
    /// Whether the pool with the given UUID owns this volume
    pub fn is_locally_owned_by(&self, pool_uuid: Uuid) -> bool {
        self.uuid == pool_uuid
    }
}

/// A peer node's volume manager, reached over the cross-node transport.
#[async_trait]
pub trait RemoteVolumeManager: Send + Sync {
    /// Open a sink to which the volume's contents can be streamed.
    ///
    /// The stream format is a contract between pool drivers and is opaque
    /// to the convergence engine.
    async fn receive(&self, volume: &Volume) -> Result<Box<dyn AsyncWrite + Send + Unpin>>;

    /// Tell the peer to take ownership of the volume. Returns the peer
    /// pool's UUID.
    async fn acquire(&self, volume: &Volume) -> Result<Uuid>;
}

/// Factory for remote volume manager sessions.
///
/// Production implementations establish a session to
/// `(hostname, TRANSPORT_PORT, TRANSPORT_USER, TRANSPORT_PRIVATE_KEY_PATH)`.
#[async_trait]
pub trait RemoteNodes: Send + Sync {
    /// Connect to the named peer's volume manager.
    async fn connect(&self, hostname: &str) -> Result<Box<dyn RemoteVolumeManager>>;
}

/// The local node's volume storage pool.
#[async_trait]
pub trait VolumePool: Send + Sync {
    /// UUID identifying this pool. A volume is locally owned iff its UUID
    /// equals this one.
    fn uuid(&self) -> Uuid;

    /// Create a new locally-owned volume.
    async fn create(&self, name: &str) -> Result<Volume>;

    /// Look up a volume by name.
    async fn get(&self, name: &str) -> Result<Volume>;

    /// List every volume in the pool, owned or not.
    async fn enumerate(&self) -> Result<Vec<Volume>>;

    /// Wait until a volume with the given name exists and is locally
    /// owned.
    async fn wait_for_volume(&self, name: &str) -> Result<Volume>;

    /// Make a volume's filesystem available to the container runtime at
    /// the given mountpoint.
    async fn expose(&self, name: &str, mountpoint: &Path) -> Result<()>;

    /// Withdraw a volume's filesystem from the container runtime.
    async fn unexpose(&self, name: &str) -> Result<()>;

    /// Replicate a volume's contents to a peer without changing
    /// ownership. Fails with [`crate::Error::NotOwned`] unless the volume
    /// is locally owned.
    async fn push(&self, volume: &Volume, remote: &dyn RemoteVolumeManager) -> Result<()>;

    /// Transfer ownership of a volume to a peer. Fails with
    /// [`crate::Error::NotOwned`] unless the volume is locally owned.
    async fn handoff(&self, volume: &Volume, remote: &dyn RemoteVolumeManager) -> Result<()>;
}

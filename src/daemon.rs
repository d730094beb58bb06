//! # Zone Manager Daemon
//!
//! The daemon owns a [`PeerHost`], binds one stream handler per [`Command`],
//! and keeps the registry of zones it manages (zone name to the content hash
//! of the zone's latest document).
//!
//! ## Registry
//!
//! The registry is a `tokio::sync::RwLock<HashMap<String, ZoneSlot>>`.
//! [`Daemon::create_zone`] first reserves the name, then runs the escrow and
//! content-store calls with no lock held, then publishes the hash. Queries
//! treat a reserved name as unknown. Two creations of the same name cannot
//! both pass the reservation step. A creation that fails or is cancelled
//! before publishing frees its reservation.
//!
//! ## Failure Policy
//!
//! A handler that returns `Ok` finishes its stream. A handler that returns
//! `Err` resets the stream with the code from
//! [`reset_code_for`](crate::transport::reset_code_for) and the error is
//! logged at `warn`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::address::PeerAddr;
use crate::config::HostConfig;
use crate::error::{Result, TnsError};
use crate::host::PeerHost;
use crate::identity::{Identity, Keypair};
use crate::messages::{NOT_MANAGED, Zone, ZoneCreation, ZoneRequest, echo_response};
use crate::protocols::{Command, StreamHandler};
use crate::stores::{Codec, ContentStore, KeyStore, ZoneStore};
use crate::transport::{PeerStream, reset_code_for};

/// Collaborators a daemon writes through.
#[derive(Clone)]
pub struct DaemonStores {
    pub keys: Arc<dyn KeyStore>,
    pub content: Arc<dyn ContentStore>,
    pub zones: Arc<dyn ZoneStore>,
}

/// Outcome of the best-effort zone store write in [`Daemon::create_zone`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Persistence {
    Stored,
    Failed(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreatedZone {
    pub name: String,
    /// Content hash of the published zone document.
    pub hash: String,
    /// Identity derived from the zone's own keypair.
    pub zone_id: Identity,
    pub persistence: Persistence,
}

#[derive(Clone, Debug)]
enum ZoneSlot {
    /// Creation in progress.
    Reserved,
    Published(String),
}

struct DaemonState {
    manager: Identity,
    zones: RwLock<HashMap<String, ZoneSlot>>,
    stores: DaemonStores,
}

impl DaemonState {
    async fn lookup(&self, name: &str) -> Option<String> {
        match self.zones.read().await.get(name) {
            Some(ZoneSlot::Published(hash)) => Some(hash.clone()),
            _ => None,
        }
    }

    async fn handle_query(&self, stream: &mut PeerStream, command: Command) -> Result<()> {
        match command {
            Command::Echo => {
                let line = stream.read_line().await?;
                stream.write_all(echo_response(&line).as_bytes()).await
            }
            Command::ZoneRequest => {
                let line = stream.read_line().await?;
                let request: ZoneRequest = serde_json::from_str(line.trim_end())?;
                debug!(
                    peer = %stream.peer().short(),
                    zone = %request.zone_name,
                    user = %request.user_name,
                    manager_key = %request.zone_manager_key_name,
                    "zone request"
                );

                match self.lookup(&request.zone_name).await {
                    Some(hash) => stream.write_all(hash.as_bytes()).await,
                    None => stream.write_all(NOT_MANAGED.as_bytes()).await,
                }
            }
            Command::RecordRequest => Err(TnsError::NotImplemented),
        }
    }

    /// Claim `name`, failing if it is reserved or published.
    async fn reserve(self: &Arc<Self>, name: &str) -> Result<Reservation> {
        let mut zones = self.zones.write().await;
        if zones.contains_key(name) {
            return Err(TnsError::AlreadyManaged(name.to_string()));
        }
        zones.insert(name.to_string(), ZoneSlot::Reserved);
        Ok(Reservation {
            state: self.clone(),
            name: name.to_string(),
            armed: true,
        })
    }
}

fn remove_reserved(zones: &mut HashMap<String, ZoneSlot>, name: &str) {
    if matches!(zones.get(name), Some(ZoneSlot::Reserved)) {
        zones.remove(name);
    }
}

/// A `Reserved` registry slot held by an in-flight zone creation.
///
/// Dropping it unpublished frees the name, so a creation future cancelled
/// mid-flight does not lock the name out.
struct Reservation {
    state: Arc<DaemonState>,
    name: String,
    armed: bool,
}

impl Reservation {
    async fn publish(mut self, hash: String) {
        self.state
            .zones
            .write()
            .await
            .insert(self.name.clone(), ZoneSlot::Published(hash));
        self.armed = false;
    }

    async fn release(mut self) {
        remove_reserved(&mut *self.state.zones.write().await, &self.name);
        self.armed = false;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(mut zones) = self.state.zones.try_write() {
            remove_reserved(&mut zones, &self.name);
            debug!(zone = %self.name, "released abandoned reservation");
            return;
        }

        let state = self.state.clone();
        let name = std::mem::take(&mut self.name);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    remove_reserved(&mut *state.zones.write().await, &name);
                    debug!(zone = %name, "released abandoned reservation");
                });
            }
            Err(_) => warn!(zone = %name, "no runtime to release abandoned reservation"),
        }
    }
}

/// Stream handler bound to one command.
struct CommandHandler {
    state: Arc<DaemonState>,
    command: Command,
}

#[async_trait]
impl StreamHandler for CommandHandler {
    async fn handle(&self, mut stream: PeerStream) {
        let peer = stream.peer();
        debug!(peer = %peer.short(), command = self.command.name(), "new stream");

        match self.state.handle_query(&mut stream, self.command).await {
            Ok(()) => match stream.close() {
                Ok(()) => debug!(peer = %peer.short(), command = self.command.name(), "handled stream"),
                Err(e) => warn!(peer = %peer.short(), error = %e, "failed to finish stream"),
            },
            Err(e) => {
                warn!(
                    peer = %peer.short(),
                    command = self.command.name(),
                    error = %e,
                    "stream handler failed"
                );
                stream.reset(reset_code_for(&e));
            }
        }
    }
}

pub struct Daemon {
    host: Arc<PeerHost>,
    state: Arc<DaemonState>,
}

impl Daemon {
    /// Bind a host for `keypair`. The keypair's identity becomes the
    /// manager of every zone this daemon creates.
    pub async fn new(keypair: Keypair, config: HostConfig, stores: DaemonStores) -> Result<Self> {
        let manager = keypair.identity();
        let host = PeerHost::bind(keypair, config).await?;
        Ok(Self {
            host: Arc::new(host),
            state: Arc::new(DaemonState {
                manager,
                zones: RwLock::new(HashMap::new()),
                stores,
            }),
        })
    }

    /// Fetch the manager key named `name` from escrow, or generate and
    /// escrow a fresh one when none is stored.
    pub async fn load_manager_key(keys: &dyn KeyStore, name: &str) -> Result<Keypair> {
        let stored = keys
            .get_private_key(name)
            .await
            .map_err(|e| TnsError::Escrow(format!("{:#}", e)))?;

        if let Some(bytes) = stored {
            return Keypair::from_escrow_bytes(&bytes).ok_or_else(|| {
                TnsError::Escrow(format!("key {:?} has {} bytes, expected 32", name, bytes.len()))
            });
        }

        let keypair = Keypair::generate();
        keys.put_private_key(name, &keypair.secret_key_bytes())
            .await
            .map_err(|e| TnsError::Escrow(format!("{:#}", e)))?;
        info!(key = name, peer = %keypair.identity().short(), "generated manager key");
        Ok(keypair)
    }

    pub fn peer_id(&self) -> Identity {
        self.host.peer_id()
    }

    pub fn host(&self) -> &Arc<PeerHost> {
        &self.host
    }

    /// The `index`-th listen address of this daemon, with its `/p2p/` id.
    pub fn reachable_address(&self, index: usize) -> Result<PeerAddr> {
        let addrs = self.host.listen_addrs();
        let count = addrs.len();
        addrs.into_iter().nth(index).ok_or_else(|| {
            TnsError::Address(format!("invalid address index {} ({} available)", index, count))
        })
    }

    /// Snapshot of the published zones: name to content hash.
    pub async fn zones(&self) -> BTreeMap<String, String> {
        self.state
            .zones
            .read()
            .await
            .iter()
            .filter_map(|(name, slot)| match slot {
                ZoneSlot::Published(hash) => Some((name.clone(), hash.clone())),
                ZoneSlot::Reserved => None,
            })
            .collect()
    }

    /// Serve one stream for `command`. Does not finish or reset the stream.
    pub async fn handle_query(&self, stream: &mut PeerStream, command: Command) -> Result<()> {
        self.state.handle_query(stream, command).await
    }

    /// Route every [`Command`] to this daemon. Rebinding replaces the
    /// previous handlers.
    pub async fn bind_handlers(&self) {
        for command in Command::ALL {
            let handler = Arc::new(CommandHandler {
                state: self.state.clone(),
                command,
            });
            self.host.set_stream_handler(command.protocol_id(), handler).await;
        }
    }

    /// Bind every command handler, then serve until `cancel` fires and
    /// close the host.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.bind_handlers().await;
        info!(peer = %self.peer_id(), "daemon serving");

        cancel.cancelled().await;

        info!("terminating daemon");
        self.close().await;
        Ok(())
    }

    pub async fn create_zone(&self, req: &ZoneCreation) -> Result<CreatedZone> {
        let reservation = self.state.reserve(&req.name).await?;

        let zone_keypair = Keypair::generate();
        if let Err(e) = self
            .state
            .stores
            .keys
            .put_private_key(&req.zone_key_name, &zone_keypair.secret_key_bytes())
            .await
        {
            reservation.release().await;
            return Err(TnsError::Escrow(format!("{:#}", e)));
        }

        let zone_id = zone_keypair.identity();
        let manager_id = self.state.manager.to_hex();
        let zone = Zone::new(req.name.clone(), zone_id.to_hex(), manager_id.clone());

        let document = match serde_json::to_vec(&zone) {
            Ok(bytes) => bytes,
            Err(e) => {
                reservation.release().await;
                return Err(e.into());
            }
        };

        let hash = match self.state.stores.content.put(&document, Codec::Json).await {
            Ok(hash) => hash,
            Err(e) => {
                reservation.release().await;
                return Err(TnsError::ContentStore(format!("{:#}", e)));
            }
        };

        let persistence = match self
            .state
            .stores
            .zones
            .new_zone(&req.name, &manager_id, &zone_id.to_hex(), &hash)
            .await
        {
            Ok(()) => Persistence::Stored,
            Err(e) => {
                let reason = format!("{:#}", e);
                warn!(zone = %req.name, error = %reason, "failed to add zone to zone store");
                Persistence::Failed(reason)
            }
        };

        reservation.publish(hash.clone()).await;

        info!(
            zone = %req.name,
            zone_id = %zone_id.short(),
            hash = %hash,
            manager_key = %req.manager_key_name,
            "created zone"
        );

        Ok(CreatedZone {
            name: req.name.clone(),
            hash,
            zone_id,
            persistence,
        })
    }

    pub async fn close(&self) {
        self.host.close().await;
    }
}

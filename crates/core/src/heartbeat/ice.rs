//! The ice-server heartbeat engine.

use crate::dispatch::*;
use crate::heartbeat::MetaverseHeartbeat;
use crate::identity::DomainIdentity;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use torii_api::protocol as proto;
use torii_api::*;

/// Settings keys read by [IceHeartbeat].
mod keys {
    /// Seconds between ice-server heartbeats.
    pub const INTERVAL_SECS: &str = "ice.heartbeat_interval_secs";
}

const DEFAULT_INTERVAL_SECS: u64 = 2;

/// Heartbeats sent with no reply before the current ice-server address
/// is marked failed and another candidate is chosen.
const FAILOVER_NO_REPLY_HEARTBEATS: u32 = 3;

/// Consecutive denials before the domain keypair is regenerated.
const DENIALS_FOR_KEYPAIR_REGEN: u32 = 3;

/// Resolves the ice-server hostname to its candidate addresses.
pub trait IceResolver: 'static + Send + Sync + std::fmt::Debug {
    /// Look up the candidate addresses for a hostname.
    fn resolve(
        &self,
        hostname: String,
    ) -> BoxFut<'static, ToriiResult<Vec<IpAddr>>>;
}

/// Trait-object [IceResolver].
pub type DynIceResolver = Arc<dyn IceResolver>;

/// The production DNS resolver.
#[derive(Debug)]
pub struct DnsIceResolver;

impl IceResolver for DnsIceResolver {
    fn resolve(
        &self,
        hostname: String,
    ) -> BoxFut<'static, ToriiResult<Vec<IpAddr>>> {
        Box::pin(async move {
            // the port here only satisfies the lookup api
            let addrs = tokio::net::lookup_host((hostname.as_str(), 0))
                .await
                .map_err(|e| {
                    ToriiError::other_src("ice-server dns lookup", e)
                })?
                .map(|sa| sa.ip())
                .collect();
            Ok(addrs)
        })
    }
}

struct State {
    candidates: Vec<IpAddr>,
    failed: HashSet<IpAddr>,
    selected: Option<SocketAddr>,
    no_reply_count: u32,
    denial_count: u32,
    connected: bool,
    /// The signed heartbeat is rebuilt only when its inputs change.
    cached: Option<(DomainId, SocketPair, bytes::Bytes)>,
}

/// The ice-server heartbeat engine.
pub struct IceHeartbeat {
    settings: SettingsStore,
    datagrams: DynDatagrams,
    dispatch: Arc<PacketDispatch>,
    identity: Arc<DomainIdentity>,
    metaverse_hb: Arc<MetaverseHeartbeat>,
    metaverse: DynMetaverseClient,
    resolver: DynIceResolver,
    ice_host: String,
    ice_port: u16,
    state: Mutex<State>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for IceHeartbeat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IceHeartbeat")
            .field("selected", &self.selected())
            .finish()
    }
}

impl Drop for IceHeartbeat {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl IceHeartbeat {
    /// Construct the engine. Call [IceHeartbeat::register] to hook up
    /// ack/denial packets and [IceHeartbeat::start] to begin ticking;
    /// tests drive [IceHeartbeat::tick] directly.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        settings: SettingsStore,
        datagrams: DynDatagrams,
        dispatch: Arc<PacketDispatch>,
        identity: Arc<DomainIdentity>,
        metaverse_hb: Arc<MetaverseHeartbeat>,
        metaverse: DynMetaverseClient,
        resolver: DynIceResolver,
        ice_server: (String, u16),
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            datagrams,
            dispatch,
            identity,
            metaverse_hb,
            metaverse,
            resolver,
            ice_host: ice_server.0,
            ice_port: ice_server.1,
            state: Mutex::new(State {
                candidates: Vec::new(),
                failed: HashSet::new(),
                selected: None,
                no_reply_count: 0,
                denial_count: 0,
                connected: false,
                cached: None,
            }),
            task: Mutex::new(None),
        })
    }

    /// Register the ack/denial packet handlers.
    pub fn register(self: Arc<Self>) {
        let engine = self.clone();
        self.dispatch.register_handler(
            proto::PacketType::ICEServerHeartbeatACK,
            Arc::new(move |_packet: InboundPacket| {
                let engine = engine.clone();
                tokio::task::spawn(async move {
                    engine.handle_ack().await;
                });
            }),
        );

        let engine = self.clone();
        self.dispatch.register_handler(
            proto::PacketType::ICEServerHeartbeatDenied,
            Arc::new(move |_packet: InboundPacket| {
                let engine = engine.clone();
                tokio::task::spawn(async move {
                    engine.handle_denial().await;
                });
            }),
        );
    }

    /// Spawn the fixed-interval tick loop.
    pub fn start(self: Arc<Self>) {
        let engine = Arc::downgrade(&self);
        let task = tokio::task::spawn(async move {
            loop {
                let interval = match engine.upgrade() {
                    Some(engine) => {
                        engine.tick().await;
                        engine
                            .settings
                            .get_or(keys::INTERVAL_SECS, DEFAULT_INTERVAL_SECS)
                    }
                    None => break,
                };
                tokio::time::sleep(std::time::Duration::from_secs(
                    interval.max(1),
                ))
                .await;
            }
        });
        *self.task.lock().unwrap() = Some(task);
    }

    /// The currently selected ice-server socket.
    pub fn selected(&self) -> Option<SocketAddr> {
        self.state.lock().unwrap().selected
    }

    /// One heartbeat cycle: count the silence, fail over if it has
    /// gone on too long, then send the signed announcement.
    pub async fn tick(&self) {
        let failover = {
            let mut state = self.state.lock().unwrap();
            if state.selected.is_some() {
                state.no_reply_count += 1;
                if state.no_reply_count > FAILOVER_NO_REPLY_HEARTBEATS {
                    let stale = state.selected.take();
                    if let Some(stale) = stale {
                        tracing::warn!(%stale, count = state.no_reply_count - 1,
                            "no replies from ice-server, failing over");
                        state.failed.insert(stale.ip());
                    }
                    state.no_reply_count = 0;
                    state.connected = false;
                    true
                } else {
                    false
                }
            } else {
                false
            }
        };

        if failover {
            // peers can't rendezvous through a dead ice-server
            self.metaverse_hb
                .announce_ice_address("0.0.0.0".into())
                .await;
        }

        if self.selected().is_none() {
            self.select_candidate().await;
        }

        let target = match self.selected() {
            Some(target) => target,
            None => {
                tracing::debug!(host = %self.ice_host,
                    "no ice-server candidate available yet");
                return;
            }
        };

        let wire = match self.heartbeat_packet() {
            Ok(wire) => wire,
            Err(err) => {
                tracing::warn!(?err, "could not build ice heartbeat");
                return;
            }
        };
        if let Err(err) = self.datagrams.send(target, wire).await {
            tracing::debug!(?err, %target, "ice heartbeat send failed");
        }
    }

    /// Resolve candidates and pick uniformly at random among those not
    /// yet failed. When every candidate has failed, the failed set is
    /// cleared and they are all eligible again.
    async fn select_candidate(&self) {
        if let Ok(addrs) =
            self.resolver.resolve(self.ice_host.clone()).await
        {
            if !addrs.is_empty() {
                self.state.lock().unwrap().candidates = addrs;
            }
        }

        let selected = {
            let mut state = self.state.lock().unwrap();
            if state.candidates.is_empty() {
                return;
            }

            let mut eligible: Vec<IpAddr> = state
                .candidates
                .iter()
                .filter(|a| !state.failed.contains(a))
                .copied()
                .collect();
            if eligible.is_empty() {
                tracing::warn!(host = %self.ice_host,
                    "all ice-server addresses have failed, \
                     re-attempting all of them");
                state.failed.clear();
                eligible = state.candidates.clone();
            }

            use rand::Rng;
            let pick = eligible
                [rand::thread_rng().gen_range(0..eligible.len())];
            let selected = SocketAddr::new(pick, self.ice_port);
            state.selected = Some(selected);
            state.denial_count = 0;
            state.no_reply_count = 0;
            selected
        };

        tracing::info!(%selected, "set candidate ice-server socket");
        self.metaverse_hb
            .announce_ice_address(selected.ip().to_string())
            .await;
    }

    /// The signed heartbeat frame, rebuilt only when the domain id,
    /// sockets, or keypair have changed.
    fn heartbeat_packet(&self) -> ToriiResult<bytes::Bytes> {
        let domain_id = self.identity.id();
        let local = self.datagrams.local_addr()?;
        let sockets = SocketPair {
            public: local,
            local,
        };

        let mut state = self.state.lock().unwrap();
        let stale = match state.cached.as_ref() {
            Some((id, s, _)) => *id != domain_id || *s != sockets,
            None => true,
        };
        if stale {
            let plaintext =
                proto::IceHeartbeat::plaintext(&domain_id, &sockets);
            let payload = proto::IceHeartbeat {
                domain_id,
                sockets,
                signature: self.identity.sign(&plaintext),
            }
            .encode();
            state.cached = Some((domain_id, sockets, payload));
        }

        let payload = state
            .cached
            .as_ref()
            .map(|(_, _, p)| p.clone())
            .expect("cache just filled");
        Ok(proto::encode_unsourced(
            proto::PacketType::ICEServerHeartbeat,
            self.dispatch.next_sequence(),
            &payload,
        ))
    }

    /// The ice-server answered: the silence and denial counters reset,
    /// and the first answer announces our address to the metaverse.
    pub async fn handle_ack(&self) {
        let first = {
            let mut state = self.state.lock().unwrap();
            state.no_reply_count = 0;
            state.denial_count = 0;
            let first = !state.connected && state.selected.is_some();
            state.connected = state.selected.is_some();
            first
        };
        if first {
            if let Some(selected) = self.selected() {
                self.metaverse_hb
                    .announce_ice_address(selected.ip().to_string())
                    .await;
            }
        }
    }

    /// The ice-server rejected our signature. Three in a row means the
    /// metaverse and we disagree about our public key: regenerate the
    /// keypair and upload the new public key.
    pub async fn handle_denial(&self) {
        let regen = {
            let mut state = self.state.lock().unwrap();
            state.no_reply_count = 0;
            state.denial_count += 1;
            if state.denial_count >= DENIALS_FOR_KEYPAIR_REGEN {
                state.denial_count = 0;
                state.cached = None;
                true
            } else {
                false
            }
        };

        if regen {
            tracing::warn!(
                "ice-server denied {DENIALS_FOR_KEYPAIR_REGEN} \
                 heartbeats, regenerating domain keypair"
            );
            let public = self.identity.regenerate_keypair();
            if let Err(err) = self
                .metaverse
                .upload_public_key(self.identity.id(), public)
                .await
            {
                tracing::warn!(?err, "public key upload failed");
            }
        }
    }

    /// Seed this engine's default settings.
    pub fn default_config(settings: &SettingsStore) -> ToriiResult<()> {
        settings.seed_default(
            keys::INTERVAL_SECS,
            serde_json::json!(DEFAULT_INTERVAL_SECS),
        )
    }
}

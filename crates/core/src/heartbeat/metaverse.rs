//! The metaverse heartbeat engine.

use crate::identity::DomainIdentity;
use std::sync::{Arc, Mutex};
use torii_api::settings::{ConnectIdentity, PermissionsCatalog};
use torii_api::*;

/// Settings keys read by [MetaverseHeartbeat].
mod keys {
    /// Seconds between metaverse heartbeats.
    pub const INTERVAL_SECS: &str = "metaverse.heartbeat_interval_secs";
    /// The automatic networking mode: `disabled`, `ip`, or `full`.
    pub const AUTOMATIC_NETWORKING: &str =
        "metaverse.automatic_networking";
    /// Static public address announced when automatic networking is
    /// disabled.
    pub const NETWORK_ADDRESS: &str = "metaverse.network_address";
}

const DEFAULT_INTERVAL_SECS: u64 = 15;

/// Give up re-acquiring a temporary name after this many failures, to
/// avoid flooding traffic.
const MAX_TEMP_NAME_ATTEMPTS: u32 = 5;

/// Where the heartbeat loop currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    /// Heartbeats flow normally.
    Steady,
    /// The domain needs a fresh temporary name before heartbeating.
    AcquiringTempName {
        /// Failed acquisition attempts so far.
        attempts: u32,
    },
    /// Too many failed acquisitions; heartbeats are halted until an
    /// operator intervenes.
    Silent,
}

struct IceAddressUpdate {
    in_flight: bool,
    redo: bool,
    address: String,
}

/// The metaverse heartbeat engine.
pub struct MetaverseHeartbeat {
    settings: SettingsStore,
    registry: DynNodeRegistry,
    metaverse: DynMetaverseClient,
    identity: Arc<DomainIdentity>,
    state: Mutex<HeartbeatState>,
    ice_update: Mutex<IceAddressUpdate>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for MetaverseHeartbeat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaverseHeartbeat")
            .field("state", &*self.state.lock().unwrap())
            .finish()
    }
}

impl Drop for MetaverseHeartbeat {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl MetaverseHeartbeat {
    /// Construct the engine. Call [MetaverseHeartbeat::start] to begin
    /// ticking; tests drive [MetaverseHeartbeat::tick] directly.
    pub fn create(
        settings: SettingsStore,
        registry: DynNodeRegistry,
        metaverse: DynMetaverseClient,
        identity: Arc<DomainIdentity>,
    ) -> Arc<Self> {
        let state = if identity.is_temporary()
            && identity.api_key().is_none()
        {
            HeartbeatState::AcquiringTempName { attempts: 0 }
        } else {
            HeartbeatState::Steady
        };
        Arc::new(Self {
            settings,
            registry,
            metaverse,
            identity,
            state: Mutex::new(state),
            ice_update: Mutex::new(IceAddressUpdate {
                in_flight: false,
                redo: false,
                address: "0.0.0.0".into(),
            }),
            task: Mutex::new(None),
        })
    }

    /// Spawn the periodic tick loop.
    pub fn start(self: Arc<Self>) {
        let engine = Arc::downgrade(&self);
        let task = tokio::task::spawn(async move {
            loop {
                // do not heartbeat immediately: this avoids flooding if
                // the heartbeat fails with a 401
                let interval = match engine.upgrade() {
                    Some(engine) => engine
                        .settings
                        .get_or(keys::INTERVAL_SECS, DEFAULT_INTERVAL_SECS),
                    None => break,
                };
                tokio::time::sleep(std::time::Duration::from_secs(
                    interval.max(1),
                ))
                .await;
                match engine.upgrade() {
                    Some(engine) => engine.tick().await,
                    None => break,
                }
            }
        });
        *self.task.lock().unwrap() = Some(task);
    }

    /// The current loop state.
    pub fn state(&self) -> HeartbeatState {
        *self.state.lock().unwrap()
    }

    /// One heartbeat cycle.
    pub async fn tick(&self) {
        let state = self.state();
        match state {
            HeartbeatState::Silent => {}
            HeartbeatState::AcquiringTempName { attempts } => {
                self.acquire_temp_name(attempts).await;
            }
            HeartbeatState::Steady => self.heartbeat().await,
        }
    }

    async fn acquire_temp_name(&self, attempts: u32) {
        match self.metaverse.request_temporary_name().await {
            Ok(grant) => {
                self.identity.adopt_temporary(grant);
                // a fresh domain id needs our public key on file
                let _ = self
                    .metaverse
                    .upload_public_key(
                        self.identity.id(),
                        self.identity.public_key(),
                    )
                    .await;
                *self.state.lock().unwrap() = HeartbeatState::Steady;
            }
            Err(err) => {
                let attempts = attempts + 1;
                if attempts >= MAX_TEMP_NAME_ATTEMPTS {
                    tracing::warn!(?err,
                        "too many temporary domain requests; going \
                         silent; set a domain id or restart");
                    *self.state.lock().unwrap() = HeartbeatState::Silent;
                } else {
                    tracing::warn!(?err, attempts,
                        "temporary domain request failed");
                    *self.state.lock().unwrap() =
                        HeartbeatState::AcquiringTempName { attempts };
                }
            }
        }
    }

    async fn heartbeat(&self) {
        let body = self.heartbeat_body().await;
        match self
            .metaverse
            .domain_heartbeat(self.identity.id(), body)
            .await
        {
            Ok(()) => {}
            Err(err) => match err.status() {
                // a temporary domain with a bad token gets a 401
                Some(401) if self.identity.is_temporary() => {
                    tracing::warn!(
                        "temporary domain lacks a valid api key, \
                         resetting"
                    );
                    *self.state.lock().unwrap() =
                        HeartbeatState::AcquiringTempName { attempts: 0 };
                }
                // the domain does not (or no longer) exists
                Some(404) => {
                    tracing::warn!(
                        "domain not found, getting a new temporary \
                         domain"
                    );
                    *self.state.lock().unwrap() =
                        HeartbeatState::AcquiringTempName { attempts: 0 };
                }
                _ => {
                    tracing::debug!(?err,
                        "metaverse heartbeat failed, retrying next tick");
                }
            },
        }
    }

    /// The heartbeat body the metaverse expects under `{"domain": …}`.
    pub async fn heartbeat_body(&self) -> serde_json::Value {
        let snapshot = self.settings.snapshot();
        // the domain is restricted if anonymous connections are
        // disallowed
        let anonymous = PermissionsCatalog::from_snapshot(&snapshot)
            .resolve(&ConnectIdentity::default());
        let restricted = !anonymous.contains(Permissions::CONNECT);

        let num_users =
            self.registry.count_agents().await.unwrap_or(0);

        let mut domain = serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "protocol": torii_api::protocol::protocol_signature(),
            "automatic_networking": self.settings.get_or(
                keys::AUTOMATIC_NETWORKING,
                "disabled".to_string(),
            ),
            "restricted": restricted,
            "heartbeat": { "num_users": num_users },
        });

        if let Some(address) = self
            .settings
            .get(keys::NETWORK_ADDRESS)
            .and_then(|v| v.as_str().map(str::to_string))
        {
            domain["network_address"] = serde_json::json!(address);
        }
        if let Some(api_key) = self.identity.api_key() {
            domain["api_key"] = serde_json::json!(api_key);
        }

        serde_json::json!({ "domain": domain })
    }

    /// Tell the metaverse which ice-server address we answer at.
    ///
    /// At most one update is in flight; if the address changes while
    /// one is in flight, a single redo bit triggers exactly one
    /// follow-up on completion.
    pub async fn announce_ice_address(&self, address: String) {
        {
            let mut update = self.ice_update.lock().unwrap();
            update.address = address;
            if update.in_flight {
                update.redo = true;
                return;
            }
            update.in_flight = true;
        }

        loop {
            let address = self.ice_update.lock().unwrap().address.clone();
            let result = self
                .metaverse
                .update_ice_address(self.identity.id(), address.clone())
                .await;

            if let Err(err) = &result {
                tracing::warn!(?err, %address,
                    "failed to update ice-server address with metaverse");
            } else {
                tracing::debug!(%address,
                    "ice-server address updated with metaverse");
            }

            let mut update = self.ice_update.lock().unwrap();
            if update.redo {
                // changed while in flight: one follow-up
                update.redo = false;
                continue;
            }
            update.in_flight = false;
            break;
        }
    }

    /// Seed this engine's default settings.
    pub fn default_config(settings: &SettingsStore) -> ToriiResult<()> {
        settings.seed_default(
            keys::INTERVAL_SECS,
            serde_json::json!(DEFAULT_INTERVAL_SECS),
        )?;
        settings.seed_default(
            keys::AUTOMATIC_NETWORKING,
            serde_json::json!("disabled"),
        )
    }
}

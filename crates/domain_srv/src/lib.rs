#![deny(missing_docs)]
//! The torii domain controller server: wires the control-plane modules
//! over UDP, owns the content engine, and fronts everything with the
//! admin HTTP surface.

use std::sync::Arc;
use torii_api::*;
use torii_backup::{
    AssetsBackupHandler, BackupEngine, ContentSettingsBackupHandler,
    EntitiesBackupHandler, EntitiesFile,
};
use torii_core::dispatch::PacketDispatch;
use torii_core::gatekeeper::Gatekeeper;
use torii_core::heartbeat::{
    DnsIceResolver, IceHeartbeat, MetaverseHeartbeat,
};
use torii_core::{
    AssignmentQueue, DomainIdentity, MembershipFanout, NodeServices,
};

pub mod auth;
pub mod config;
pub use config::Config;
pub mod content;
pub mod http;
pub mod metaverse;
pub mod udp;

/// The supervisor relaunches the process when it exits with this code.
pub const EXIT_CODE_REBOOT: i32 = 234923;

/// Exit code for a TLS certificate configured without its key (or vice
/// versa).
pub const EXIT_CODE_MISSING_TLS: i32 = 3;

/// Environment variable overriding the domain key passphrase setting.
pub const KEY_PASSPHRASE_ENV: &str = "DOMAIN_SERVER_KEY_PASSPHRASE";

/// Why the server could not start, with its documented exit code.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    /// TLS was half-configured.
    #[error("tls requires both a certificate and a key")]
    MissingTlsPair,

    /// The auth strategy could not be resolved.
    #[error(transparent)]
    Auth(#[from] auth::AuthConfigError),

    /// Any other startup failure.
    #[error(transparent)]
    Other(#[from] ToriiError),
}

impl StartupError {
    /// The process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::MissingTlsPair => EXIT_CODE_MISSING_TLS,
            StartupError::Auth(err) => err.exit_code(),
            StartupError::Other(_) => 1,
        }
    }
}

/// A running domain controller.
pub struct DomainSrv {
    settings: SettingsStore,
    identity: Arc<DomainIdentity>,
    registry: DynNodeRegistry,
    datagrams: DynDatagrams,
    http_addr: std::net::SocketAddr,
    shutdown_recv:
        tokio::sync::Mutex<tokio::sync::mpsc::UnboundedReceiver<i32>>,
    // engines live as long as the server
    _gatekeeper: Arc<Gatekeeper>,
    _queue: Arc<AssignmentQueue>,
    _fanout: Arc<MembershipFanout>,
    _services: Arc<NodeServices>,
    _content: Arc<content::ContentServices>,
    _engine: Arc<BackupEngine>,
    _metaverse_hb: Arc<MetaverseHeartbeat>,
    _ice_hb: Option<Arc<IceHeartbeat>>,
    _watch_tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl std::fmt::Debug for DomainSrv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainSrv")
            .field("id", &self.identity.id())
            .finish()
    }
}

impl DomainSrv {
    /// Start a domain controller from a configuration.
    pub async fn start(config: Config) -> Result<Self, StartupError> {
        if config.tls_cert.is_some() != config.tls_key.is_some() {
            return Err(StartupError::MissingTlsPair);
        }

        std::fs::create_dir_all(&config.data_dir).map_err(|e| {
            ToriiError::other_src("create data dir", e)
        })?;
        let settings = SettingsStore::new(config.settings_path())?;
        if let Ok(passphrase) = std::env::var(KEY_PASSPHRASE_ENV) {
            settings.set_override(
                "security.key_passphrase",
                serde_json::json!(passphrase),
            );
        }

        let auth = auth::AuthStrategy::from_settings(&settings)?;

        // module construction through the builder
        let mut builder = Builder {
            settings: settings.clone(),
            registry: torii_core::factories::MemRegistryFactory::create(),
            datagrams: udp::UdpDatagramsFactory::create(
                config.listen_addr,
            ),
        };
        builder.set_default_config()?;
        MetaverseHeartbeat::default_config(&settings)?;
        IceHeartbeat::default_config(&settings)?;
        BackupEngine::default_config(&settings)?;
        seed_assignment_defaults(&settings)?;
        builder.validate_config()?;
        let builder = builder.build();

        let registry = builder.registry.create(builder.clone()).await?;
        let datagrams =
            builder.datagrams.create(builder.clone()).await?;
        let dispatch =
            PacketDispatch::create(registry.clone(), datagrams.clone());

        let identity = Arc::new(resolve_identity(&config, &settings));
        let metaverse = metaverse::UreqMetaverse::create(
            config.metaverse_url.clone(),
            &settings,
        );

        // assignment queue + gatekeeper
        let queue = AssignmentQueue::new(
            settings.clone(),
            Some(config.scripts_dir()),
        );
        queue
            .clone()
            .register(&dispatch, datagrams.clone(), &registry)?;
        queue.seed_static(static_assignments(&settings));

        let gatekeeper = Gatekeeper::create(
            settings.clone(),
            registry.clone(),
            datagrams.clone(),
            dispatch.clone(),
            metaverse.clone(),
            identity.clone(),
            queue.clone(),
        );
        gatekeeper.clone().register();
        gatekeeper.clone().watch_settings();

        let fanout = MembershipFanout::register(
            registry.clone(),
            datagrams.clone(),
            dispatch.clone(),
        )?;

        let services = NodeServices::create(
            settings.clone(),
            registry.clone(),
            datagrams.clone(),
            dispatch.clone(),
            identity.clone(),
        );
        services.clone().register();

        // content: entities file, backup engine, packet handlers
        let entities = Arc::new(EntitiesFile::new(config.entities_dir()));
        if let Err(err) = entities.swap_in_replacement() {
            tracing::warn!(?err, "startup replacement swap failed");
        }

        let engine =
            BackupEngine::create(settings.clone(), config.backups_dir());
        engine.add_handler(EntitiesBackupHandler::create(entities.clone()));
        engine.add_handler(ContentSettingsBackupHandler::create(
            settings.clone(),
        ));
        engine.add_handler(AssetsBackupHandler::create(
            config.assets_dir(),
        ));
        engine.clone().start();

        let content_services = content::ContentServices::create(
            entities,
            engine.clone(),
            datagrams.clone(),
            dispatch.clone(),
        );
        content_services.clone().register();

        // heartbeat engines
        let metaverse_hb = MetaverseHeartbeat::create(
            settings.clone(),
            registry.clone(),
            metaverse.clone(),
            identity.clone(),
        );
        metaverse_hb.clone().start();

        let automatic_networking: String = settings
            .get_or("metaverse.automatic_networking", "disabled".into());
        let ice_hb = if automatic_networking == "full" {
            let ice_hb = IceHeartbeat::create(
                settings.clone(),
                datagrams.clone(),
                dispatch.clone(),
                identity.clone(),
                metaverse_hb.clone(),
                metaverse.clone(),
                Arc::new(DnsIceResolver),
                config.ice_server.clone(),
            );
            ice_hb.clone().register();
            ice_hb.clone().start();
            Some(ice_hb)
        } else {
            None
        };

        // the admin http surface
        let (shutdown_send, shutdown_recv) =
            tokio::sync::mpsc::unbounded_channel();

        let http_state = Arc::new(http::HttpState {
            settings: settings.clone(),
            registry: registry.clone(),
            queue: queue.clone(),
            engine: engine.clone(),
            content: content_services.clone(),
            metaverse: metaverse.clone(),
            identity: identity.clone(),
            auth,
            shutdown: shutdown_send.clone(),
        });
        let router = http::router(http_state);

        let mut watch_tasks = Vec::new();

        let handle = axum_server::Handle::new();
        let serve_handle = handle.clone();
        let serve_router = router.clone();
        let http_bind = config.http_addr;
        watch_tasks.push(tokio::task::spawn(async move {
            if let Err(err) = axum_server::bind(http_bind)
                .handle(serve_handle)
                .serve(serve_router.into_make_service())
                .await
            {
                tracing::error!(?err, "admin http server failed");
            }
        }));
        let http_addr =
            handle.listening().await.ok_or_else(|| {
                ToriiError::other("admin http server did not bind")
            })?;
        tracing::info!(%http_addr, "admin http surface listening");

        if let (Some(cert), Some(key)) =
            (config.tls_cert.clone(), config.tls_key.clone())
        {
            let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(
                cert, key,
            )
            .await
            .map_err(|e| ToriiError::other_src("load tls pem", e))?;
            let https_bind = config.https_addr;
            watch_tasks.push(tokio::task::spawn(async move {
                if let Err(err) =
                    axum_server::bind_rustls(https_bind, tls)
                        .serve(router.into_make_service())
                        .await
                {
                    tracing::error!(?err, "admin https server failed");
                }
            }));
        }

        if let Some(parent_pid) = config.parent_pid {
            watch_tasks.push(tokio::task::spawn(watch_parent(
                parent_pid,
                shutdown_send,
            )));
        }

        tracing::info!(
            id = %identity.id(),
            listen = ?datagrams.local_addr(),
            "domain controller is up"
        );

        Ok(Self {
            settings,
            identity,
            registry,
            datagrams,
            http_addr,
            shutdown_recv: tokio::sync::Mutex::new(shutdown_recv),
            _gatekeeper: gatekeeper,
            _queue: queue,
            _fanout: fanout,
            _services: services,
            _content: content_services,
            _engine: engine,
            _metaverse_hb: metaverse_hb,
            _ice_hb: ice_hb,
            _watch_tasks: watch_tasks,
        })
    }

    /// The settings store.
    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    /// The node registry.
    pub fn registry(&self) -> &DynNodeRegistry {
        &self.registry
    }

    /// The domain id.
    pub fn id(&self) -> DomainId {
        self.identity.id()
    }

    /// The bound admin HTTP address.
    pub fn http_addr(&self) -> std::net::SocketAddr {
        self.http_addr
    }

    /// The bound datagram address.
    pub fn listen_addr(&self) -> ToriiResult<std::net::SocketAddr> {
        self.datagrams.local_addr()
    }

    /// Wait until something requests process exit (the restart route,
    /// or the parent-pid watcher), returning the exit code.
    pub async fn wait_for_exit(&self) -> i32 {
        let mut recv = self.shutdown_recv.lock().await;
        recv.recv().await.unwrap_or(0)
    }
}

impl Drop for DomainSrv {
    fn drop(&mut self) {
        for task in self._watch_tasks.drain(..) {
            task.abort();
        }
    }
}

fn resolve_identity(
    config: &Config,
    settings: &SettingsStore,
) -> DomainIdentity {
    if let Some(id) = config.domain_id {
        return DomainIdentity::new(id, place_name(settings));
    }
    if let Some(id) = settings
        .get("metaverse.domain_id")
        .and_then(|v| v.as_str().and_then(|s| s.parse().ok()))
    {
        let identity = DomainIdentity::new(id, place_name(settings));
        if let Some(api_key) = settings
            .get("metaverse.api_key")
            .and_then(|v| v.as_str().map(str::to_string))
        {
            // a persisted temporary grant
            identity.adopt_temporary(TemporaryDomain {
                id,
                name: place_name(settings),
                api_key,
            });
        }
        return identity;
    }
    DomainIdentity::new_temporary()
}

fn place_name(settings: &SettingsStore) -> String {
    settings.get_or("descriptors.world_name", String::new())
}

fn seed_assignment_defaults(
    settings: &SettingsStore,
) -> ToriiResult<()> {
    settings.seed_default(
        "assignment.static_types",
        serde_json::json!([
            { "type": "audio-mixer" },
            { "type": "avatar-mixer" },
            { "type": "entity-server" },
            { "type": "asset-server" },
            { "type": "messages-mixer" },
            { "type": "entity-script-server" },
        ]),
    )
}

fn static_assignments(settings: &SettingsStore) -> Vec<Assignment> {
    #[derive(serde::Deserialize)]
    struct Entry {
        #[serde(rename = "type")]
        node_type: NodeType,
        #[serde(default)]
        pool: String,
    }

    let entries: Vec<Entry> =
        settings.get_or("assignment.static_types", Vec::new());
    entries
        .into_iter()
        .map(|e| Assignment::new_static(e.node_type, e.pool))
        .collect()
}

/// Exit when the parent process dies (the `--parent-pid` flag).
async fn watch_parent(
    parent_pid: u32,
    shutdown: tokio::sync::mpsc::UnboundedSender<i32>,
) {
    loop {
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        let alive = std::path::Path::new(&format!("/proc/{parent_pid}"))
            .exists();
        if !alive {
            tracing::warn!(parent_pid, "parent process died, exiting");
            let _ = shutdown.send(0);
            return;
        }
    }
}

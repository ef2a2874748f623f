//! Scene-content packet handlers: entity-server persistence and
//! fetches, wholesale replacement, and replacement-from-URL.

use std::sync::Arc;
use torii_api::protocol as proto;
use torii_api::*;
use torii_backup::{BackupEngine, EntitiesFile};
use torii_core::dispatch::*;

/// The scene-content services.
pub struct ContentServices {
    entities: Arc<EntitiesFile>,
    engine: Arc<BackupEngine>,
    datagrams: DynDatagrams,
    dispatch: Arc<PacketDispatch>,
}

impl std::fmt::Debug for ContentServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentServices").finish()
    }
}

impl ContentServices {
    /// Construct the services over their collaborators.
    pub fn create(
        entities: Arc<EntitiesFile>,
        engine: Arc<BackupEngine>,
        datagrams: DynDatagrams,
        dispatch: Arc<PacketDispatch>,
    ) -> Arc<Self> {
        Arc::new(Self {
            entities,
            engine,
            datagrams,
            dispatch,
        })
    }

    /// Register the content packet handlers.
    pub fn register(self: Arc<Self>) {
        let svc = self.clone();
        self.dispatch.register_handler(
            proto::PacketType::OctreeDataPersist,
            Arc::new(move |packet: InboundPacket| {
                let svc = svc.clone();
                tokio::task::spawn(async move {
                    svc.handle_persist(packet).await;
                });
            }),
        );

        let svc = self.clone();
        self.dispatch.register_handler(
            proto::PacketType::OctreeDataFileRequest,
            Arc::new(move |packet: InboundPacket| {
                let svc = svc.clone();
                tokio::task::spawn(async move {
                    svc.handle_file_request(packet).await;
                });
            }),
        );

        let svc = self.clone();
        self.dispatch.register_handler(
            proto::PacketType::OctreeFileReplacement,
            Arc::new(move |packet: InboundPacket| {
                let svc = svc.clone();
                tokio::task::spawn(async move {
                    svc.handle_replacement(packet).await;
                });
            }),
        );

        let svc = self.clone();
        self.dispatch.register_handler(
            proto::PacketType::DomainContentReplacementFromUrl,
            Arc::new(move |packet: InboundPacket| {
                let svc = svc.clone();
                tokio::task::spawn(async move {
                    svc.handle_replacement_from_url(packet).await;
                });
            }),
        );
    }

    /// The entity server persists the authoritative scene through us.
    async fn handle_persist(&self, packet: InboundPacket) {
        if packet.source.is_none() {
            return;
        }
        let entities = self.entities.clone();
        let data = packet.payload.clone();
        let result =
            tokio::task::spawn_blocking(move || entities.persist(&data))
                .await;
        match result {
            Ok(Ok(header)) => {
                tracing::debug!(id = %header.id, version = header.version,
                    "entity server persisted scene");
            }
            Ok(Err(err)) => {
                tracing::warn!(?err, "scene persist rejected");
            }
            Err(err) => {
                tracing::warn!(?err, "scene persist task failed");
            }
        }
    }

    /// The entity server asks for the scene, telling us which version
    /// it already holds.
    async fn handle_file_request(&self, packet: InboundPacket) {
        if packet.source.is_none() {
            return;
        }
        let query = match proto::SceneVersionQuery::decode(packet.payload)
        {
            Ok(query) => query,
            Err(err) => {
                tracing::debug!(?err, "undecodable scene query");
                return;
            }
        };

        let entities = self.entities.clone();
        let current = tokio::task::spawn_blocking(move || {
            let raw = entities.read_raw()?;
            let parsed = entities.read()?;
            Ok::<_, ToriiError>(raw.zip(parsed))
        })
        .await;

        let reply = match current {
            Ok(Ok(Some((raw, (header, _)))))
                if header.id != query.have_id.0
                    || header.version > query.have_version =>
            {
                proto::SceneFileReply {
                    fresh: true,
                    data: raw,
                }
            }
            _ => proto::SceneFileReply {
                fresh: false,
                data: bytes::Bytes::new(),
            },
        };

        let wire = proto::encode_unsourced(
            proto::PacketType::OctreeDataFileReply,
            self.dispatch.next_sequence(),
            &reply.encode(),
        );
        if let Err(err) = self.datagrams.send(packet.sender, wire).await {
            tracing::debug!(?err, "scene reply send failed");
        }
    }

    async fn handle_replacement(&self, packet: InboundPacket) {
        let source = match packet.source.as_ref() {
            Some(source) => source,
            None => return,
        };
        if !source.can(Permissions::REPLACE_CONTENT) {
            tracing::warn!(id = %source.id,
                "content replacement from node without permission");
            return;
        }

        if let Err(err) = self
            .apply_upload("models.json.gz", packet.payload.clone())
            .await
        {
            tracing::warn!(?err, "content replacement failed");
        }
    }

    async fn handle_replacement_from_url(&self, packet: InboundPacket) {
        let source = match packet.source.as_ref() {
            Some(source) => source,
            None => return,
        };
        if !source.can(Permissions::REPLACE_CONTENT) {
            tracing::warn!(id = %source.id,
                "content replacement from node without permission");
            return;
        }

        let req = match proto::ContentFromUrl::decode(packet.payload) {
            Ok(req) => req,
            Err(_) => return,
        };

        tracing::info!(url = %req.url, "fetching replacement content");
        let url = req.url.clone();
        let fetched = tokio::task::spawn_blocking(move || {
            let mut resp = ureq::get(&url).call().map_err(|e| {
                ToriiError::other_src("fetch replacement content", e)
            })?;
            resp.body_mut()
                .with_config()
                // scene archives can be large
                .limit(512 * 1024 * 1024)
                .read_to_vec()
                .map_err(|e| {
                    ToriiError::other_src("read replacement content", e)
                })
        })
        .await;

        let data = match fetched {
            Ok(Ok(data)) => bytes::Bytes::from(data),
            Ok(Err(err)) => {
                tracing::warn!(?err, url = %req.url,
                    "replacement fetch failed");
                return;
            }
            Err(err) => {
                tracing::warn!(?err, "replacement fetch task failed");
                return;
            }
        };

        let filename = req
            .url
            .rsplit('/')
            .next()
            .unwrap_or("content.zip")
            .to_string();
        if let Err(err) = self.apply_upload(&filename, data).await {
            tracing::warn!(?err, url = %req.url,
                "replacement apply failed");
        }
    }

    /// Route uploaded content by extension: archives go through backup
    /// recovery, scenes through the atomic `.replace` swap. Shared by
    /// the HTTP `/content/upload` route.
    pub async fn apply_upload(
        &self,
        filename: &str,
        data: bytes::Bytes,
    ) -> ToriiResult<()> {
        if filename.ends_with(".zip") {
            let now = Timestamp::now().as_micros() / 1_000_000;
            let id = format!("uploaded-{now}.zip");
            let path = self.engine.backups_path().join(&id);
            let write_path = path.clone();
            tokio::task::spawn_blocking(move || {
                if let Some(parent) = write_path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        ToriiError::other_src("create backups dir", e)
                    })?;
                }
                std::fs::write(&write_path, &data).map_err(|e| {
                    ToriiError::other_src("write uploaded archive", e)
                })
            })
            .await
            .map_err(|e| ToriiError::other_src("upload task", e))??;
            return self.engine.recover(&id).await;
        }

        if filename.ends_with(".json") || filename.ends_with(".json.gz") {
            let entities = self.entities.clone();
            return tokio::task::spawn_blocking(move || {
                entities.stage_replacement(&data)?;
                entities.swap_in_replacement()?;
                Ok(())
            })
            .await
            .map_err(|e| ToriiError::other_src("upload task", e))?;
        }

        Err(ToriiError::other(format!(
            "unsupported content upload {filename:?}"
        )))
    }
}

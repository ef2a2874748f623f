//! The authoritative entities file and its atomic `.replace` swap.

use std::io::{Read, Write};
use torii_api::*;

/// The filename of the authoritative scene.
pub const ENTITIES_FILE: &str = "models.json.gz";

/// The staging filename for a pending scene replacement.
pub const REPLACE_FILE: &str = "models.json.gz.replace";

/// The header prefixed to the gzipped scene payload: the first line of
/// the decompressed stream, followed by the scene JSON.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SceneHeader {
    /// The scene instance id. Rewritten on every replacement so entity
    /// servers can tell a swapped scene from an edited one.
    pub id: uuid::Uuid,
    /// The scene version, monotonically bumped.
    pub version: u64,
}

/// The entities file manager. All writes to the authoritative path go
/// through this type; the swap protocol keeps the file parseable at
/// every instant.
#[derive(Debug, Clone)]
pub struct EntitiesFile {
    dir: std::path::PathBuf,
}

impl EntitiesFile {
    /// Manage the entities file inside `dir` (created on demand).
    pub fn new(dir: impl Into<std::path::PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The authoritative file path.
    pub fn path(&self) -> std::path::PathBuf {
        self.dir.join(ENTITIES_FILE)
    }

    /// The staging path for a pending replacement.
    pub fn replace_path(&self) -> std::path::PathBuf {
        self.dir.join(REPLACE_FILE)
    }

    /// Read and parse the authoritative file. `None` when it does not
    /// exist yet.
    pub fn read(&self) -> ToriiResult<Option<(SceneHeader, String)>> {
        match std::fs::read(self.path()) {
            Ok(raw) => Ok(Some(parse_scene(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => {
                Err(ToriiError::other_src("read entities file", e))
            }
        }
    }

    /// The raw gzipped bytes of the authoritative file, for backup
    /// archives and entity-server fetches.
    pub fn read_raw(&self) -> ToriiResult<Option<bytes::Bytes>> {
        match std::fs::read(self.path()) {
            Ok(raw) => Ok(Some(raw.into())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => {
                Err(ToriiError::other_src("read entities file", e))
            }
        }
    }

    /// Persist raw gzipped scene bytes as the authoritative file, as
    /// sent by the entity server. Invalid content is rejected and the
    /// previous good state kept.
    pub fn persist(&self, raw: &[u8]) -> ToriiResult<SceneHeader> {
        let (header, _) = parse_scene(raw)?;
        self.ensure_dir()?;
        write_via_temp(&self.path(), raw)?;
        tracing::debug!(id = %header.id, version = header.version,
            "wrote entities file");
        Ok(header)
    }

    /// Stage replacement content at the `.replace` path. The content
    /// may be raw scene JSON or an already-gzipped scene, with or
    /// without a header line; it is normalised to headered gzip before
    /// staging, and invalid content is rejected without touching
    /// anything.
    pub fn stage_replacement(&self, content: &[u8]) -> ToriiResult<()> {
        let text = match gunzip(content) {
            Ok(text) => text,
            // not gzip: treat as plain scene JSON
            Err(_) => String::from_utf8(content.to_vec())
                .map_err(|e| ToriiError::other_src("scene not utf8", e))?,
        };
        let (header, body) = match split_header(&text) {
            Some((header, body)) => (header, body.to_string()),
            None => {
                // no header line: validate the body and mint one
                let _: serde_json::Value = serde_json::from_str(&text)
                    .map_err(|e| {
                        ToriiError::other_src("scene not valid json", e)
                    })?;
                (
                    SceneHeader {
                        id: uuid::Uuid::new_v4(),
                        version: 0,
                    },
                    text,
                )
            }
        };

        self.ensure_dir()?;
        let staged = gzip_scene(&header, &body)?;
        write_via_temp(&self.replace_path(), &staged)?;
        tracing::info!(path = ?self.replace_path(),
            "staged entities replacement");
        Ok(())
    }

    /// If a valid `.replace` file is present, swap it in: mint a fresh
    /// `{id, version}`, delete the staging file, and write the real
    /// path. Returns `true` when a swap happened.
    ///
    /// The staging file is deleted before the write: if it cannot be
    /// deleted the swap is aborted, otherwise a restart loop would
    /// re-apply the same replacement forever.
    pub fn swap_in_replacement(&self) -> ToriiResult<bool> {
        let staged = match std::fs::read(self.replace_path()) {
            Ok(staged) => staged,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(false)
            }
            Err(e) => {
                return Err(ToriiError::other_src("read .replace", e))
            }
        };

        let (old_header, body) = match parse_scene(&staged) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!(?err,
                    "replacement file is invalid, ignoring it");
                return Ok(false);
            }
        };

        if let Err(e) = std::fs::remove_file(self.replace_path()) {
            return Err(ToriiError::other_src(
                "unable to remove .replace, aborting swap",
                e,
            ));
        }

        let header = SceneHeader {
            id: uuid::Uuid::new_v4(),
            version: old_header.version.wrapping_add(1),
        };
        let raw = gzip_scene(&header, &body)?;
        write_via_temp(&self.path(), &raw)?;
        tracing::info!(id = %header.id, version = header.version,
            "swapped in replacement entities file");
        Ok(true)
    }

    fn ensure_dir(&self) -> ToriiResult<()> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| ToriiError::other_src("create entities dir", e))
    }
}

fn gunzip(raw: &[u8]) -> ToriiResult<String> {
    let mut out = String::new();
    flate2::read::GzDecoder::new(raw)
        .read_to_string(&mut out)
        .map_err(|e| ToriiError::other_src("gunzip scene", e))?;
    Ok(out)
}

fn split_header(text: &str) -> Option<(SceneHeader, &str)> {
    let (first, rest) = text.split_once('\n')?;
    let header: SceneHeader = serde_json::from_str(first).ok()?;
    Some((header, rest))
}

/// Parse a headered gzipped scene into its header and JSON body.
pub fn parse_scene(raw: &[u8]) -> ToriiResult<(SceneHeader, String)> {
    let text = gunzip(raw)?;
    let (header, body) = split_header(&text)
        .ok_or_else(|| ToriiError::other("scene header missing"))?;
    let _: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| ToriiError::other_src("scene body not json", e))?;
    Ok((header, body.to_string()))
}

/// Gzip a scene body under a header line.
pub fn gzip_scene(
    header: &SceneHeader,
    body: &str,
) -> ToriiResult<Vec<u8>> {
    let mut enc = flate2::write::GzEncoder::new(
        Vec::new(),
        flate2::Compression::default(),
    );
    let header = serde_json::to_string(header)
        .map_err(|e| ToriiError::other_src("encode scene header", e))?;
    enc.write_all(header.as_bytes())
        .and_then(|_| enc.write_all(b"\n"))
        .and_then(|_| enc.write_all(body.as_bytes()))
        .map_err(|e| ToriiError::other_src("gzip scene", e))?;
    enc.finish()
        .map_err(|e| ToriiError::other_src("gzip scene", e))
}

fn write_via_temp(path: &std::path::Path, raw: &[u8]) -> ToriiResult<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, raw)
        .map_err(|e| ToriiError::other_src("write temp file", e))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| ToriiError::other_src("rename temp file", e))
}

#[cfg(test)]
mod test;

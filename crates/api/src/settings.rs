//! The layered settings store and the permissions catalog derived
//! from it.
//!
//! Three layers, top-most defined value wins on read:
//! command-line overrides ⊕ the persisted settings file ⊕ defaults
//! seeded by module factories. All reads go through keypath accessors
//! (`a.b.c`); all writes are recursive merges that persist the file
//! layer and notify update listeners.

use crate::*;
use serde_json::Value;
use std::sync::{Arc, Mutex};

/// Details of one applied settings change, handed to update listeners.
#[derive(Debug, Clone)]
pub struct SettingsUpdate {
    /// The patch that was merged in.
    pub patch: Value,
}

type Listener = Arc<dyn Fn(&SettingsUpdate) + 'static + Send + Sync>;

struct Inner {
    defaults: Value,
    file: Value,
    overrides: Value,
    file_path: Option<std::path::PathBuf>,
    listeners: Vec<Listener>,
}

/// The layered settings store.
///
/// Cheaply clonable; every clone shares the same layers and listener
/// list. The file layer is written only by this store, via
/// write-to-temp-then-rename.
#[derive(Clone)]
pub struct SettingsStore(Arc<Mutex<Inner>>);

impl std::fmt::Debug for SettingsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsStore").finish()
    }
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::new_ephemeral()
    }
}

impl SettingsStore {
    /// Construct a store persisted at `file_path`, loading the file
    /// layer from disk if present. A missing file is an empty layer;
    /// an unreadable file is an error (never silently discard operator
    /// configuration).
    pub fn new(file_path: std::path::PathBuf) -> ToriiResult<Self> {
        let file = match std::fs::read(&file_path) {
            Ok(raw) => serde_json::from_slice(&raw).map_err(|e| {
                ToriiError::other_src(
                    format!("invalid settings file {file_path:?}"),
                    e,
                )
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Value::Object(Default::default())
            }
            Err(e) => {
                return Err(ToriiError::other_src(
                    format!("unable to read settings file {file_path:?}"),
                    e,
                ))
            }
        };
        Ok(Self(Arc::new(Mutex::new(Inner {
            defaults: Value::Object(Default::default()),
            file,
            overrides: Value::Object(Default::default()),
            file_path: Some(file_path),
            listeners: Vec::new(),
        }))))
    }

    /// Construct a store with no backing file. Used in tests and by
    /// `--get-temp-name` style one-shot invocations.
    pub fn new_ephemeral() -> Self {
        Self(Arc::new(Mutex::new(Inner {
            defaults: Value::Object(Default::default()),
            file: Value::Object(Default::default()),
            overrides: Value::Object(Default::default()),
            file_path: None,
            listeners: Vec::new(),
        })))
    }

    /// Seed a default at a keypath. Module factories call this from
    /// `default_config`; an existing default at the same keypath is an
    /// error so modules cannot silently fight over a key.
    pub fn seed_default(
        &self,
        keypath: &str,
        value: Value,
    ) -> ToriiResult<()> {
        let mut inner = self.0.lock().unwrap();
        if path_get(&inner.defaults, keypath).is_some() {
            return Err(ToriiError::other(format!(
                "refusing to overwrite conflicting default: {keypath}"
            )));
        }
        path_set(&mut inner.defaults, keypath, value);
        Ok(())
    }

    /// Apply a command-line (or environment) override at a keypath.
    pub fn set_override(&self, keypath: &str, value: Value) {
        let mut inner = self.0.lock().unwrap();
        path_set(&mut inner.overrides, keypath, value);
    }

    /// Read the top-most defined value at a keypath.
    pub fn get(&self, keypath: &str) -> Option<Value> {
        let inner = self.0.lock().unwrap();
        path_get(&inner.overrides, keypath)
            .or_else(|| path_get(&inner.file, keypath))
            .or_else(|| path_get(&inner.defaults, keypath))
            .cloned()
    }

    /// Read a typed value at a keypath, falling back to `default` when
    /// absent or of the wrong shape.
    pub fn get_or<T: serde::de::DeserializeOwned>(
        &self,
        keypath: &str,
        default: T,
    ) -> T {
        self.get(keypath)
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or(default)
    }

    /// A merged snapshot of all three layers.
    pub fn snapshot(&self) -> Value {
        let inner = self.0.lock().unwrap();
        let mut out = inner.defaults.clone();
        merge(&mut out, &inner.file);
        merge(&mut out, &inner.overrides);
        out
    }

    /// Apply `patch` depth-first into the file layer, write the layer
    /// through to disk, and notify update listeners. A `null` in the
    /// patch deletes the key it addresses.
    pub fn recurse_and_overwrite(&self, patch: Value) -> ToriiResult<()> {
        let (listeners, persist) = {
            let mut inner = self.0.lock().unwrap();
            let mut file = std::mem::take(&mut inner.file);
            merge(&mut file, &patch);
            inner.file = file;
            let persist = match inner.file_path.as_ref() {
                Some(path) => Some((path.clone(), inner.file.clone())),
                None => None,
            };
            (inner.listeners.clone(), persist)
        };

        if let Some((path, file)) = persist {
            persist_file(&path, &file)?;
        }

        let update = SettingsUpdate { patch };
        for l in listeners.iter() {
            l(&update);
        }
        Ok(())
    }

    /// Register a listener called after every applied settings change.
    pub fn register_update_listener(&self, listener: Listener) {
        self.0.lock().unwrap().listeners.push(listener);
    }
}

fn persist_file(
    path: &std::path::Path,
    file: &Value,
) -> ToriiResult<()> {
    let enc = serde_json::to_vec_pretty(file)
        .map_err(|e| ToriiError::other_src("encode settings", e))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, enc)
        .map_err(|e| ToriiError::other_src("write settings temp", e))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| ToriiError::other_src("rename settings temp", e))
}

fn path_get<'v>(root: &'v Value, keypath: &str) -> Option<&'v Value> {
    let mut cur = root;
    for seg in keypath.split('.') {
        cur = cur.as_object()?.get(seg)?;
    }
    Some(cur)
}

fn path_set(root: &mut Value, keypath: &str, value: Value) {
    let mut cur = root;
    let segs: Vec<&str> = keypath.split('.').collect();
    for seg in &segs[..segs.len() - 1] {
        if !cur.is_object() {
            *cur = Value::Object(Default::default());
        }
        cur = cur
            .as_object_mut()
            .expect("just ensured object")
            .entry(seg.to_string())
            .or_insert(Value::Object(Default::default()));
    }
    if !cur.is_object() {
        *cur = Value::Object(Default::default());
    }
    cur.as_object_mut()
        .expect("just ensured object")
        .insert(segs[segs.len() - 1].to_string(), value);
}

fn merge(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (k, v) in patch {
                if v.is_null() {
                    base.remove(k);
                } else {
                    merge(
                        base.entry(k.clone()).or_insert(Value::Null),
                        v,
                    );
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

/// One way a permissions-catalog entry can match a connecting node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionsKey {
    /// Matches any candidate.
    Anonymous,
    /// Matches candidates with a verified username.
    LoggedIn,
    /// Matches verified users who are friends of the domain owner.
    Friends,
    /// Matches candidates connecting from loopback.
    Localhost,
    /// Matches one specific verified username.
    User(String),
    /// Matches members of a metaverse group at a specific rank.
    Group {
        /// The group name.
        name: String,
        /// The rank within the group.
        rank: u8,
    },
}

/// What we know about a candidate when resolving permissions.
///
/// Captured at admission and kept on the node record so permission
/// resolution stays a deterministic function of (settings snapshot,
/// node identity) across settings updates.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ConnectIdentity {
    /// The metaverse-verified username, if any.
    pub verified_username: Option<String>,
    /// `true` when the candidate connects from loopback.
    pub is_localhost: bool,
    /// `true` when the candidate is a friend of the domain owner.
    pub is_friend: bool,
    /// Group memberships known at resolution time, `(name, rank)`.
    pub groups: Vec<(String, u8)>,
}

/// The permissions catalog: resolution is a union of every entry that
/// matches the connecting node.
#[derive(Debug, Clone, Default)]
pub struct PermissionsCatalog {
    entries: Vec<(PermissionsKey, Permissions)>,
}

impl PermissionsCatalog {
    /// Parse the catalog out of a settings snapshot.
    ///
    /// Settings shape:
    /// `security.standard_permissions` maps
    /// `anonymous|logged_in|friends|localhost` to permission bits;
    /// `security.permissions` maps usernames to bits;
    /// `security.group_permissions` is an array of
    /// `{group, rank, permissions}`.
    pub fn from_snapshot(snapshot: &Value) -> Self {
        let mut entries = Vec::new();

        if let Some(std) = path_get(snapshot, "security.standard_permissions")
            .and_then(Value::as_object)
        {
            for (name, bits) in std {
                let key = match name.as_str() {
                    "anonymous" => PermissionsKey::Anonymous,
                    "logged_in" => PermissionsKey::LoggedIn,
                    "friends" => PermissionsKey::Friends,
                    "localhost" => PermissionsKey::Localhost,
                    other => {
                        tracing::warn!(
                            key = other,
                            "ignoring unknown standard permissions key"
                        );
                        continue;
                    }
                };
                entries.push((key, bits_of(bits)));
            }
        }

        if let Some(users) = path_get(snapshot, "security.permissions")
            .and_then(Value::as_object)
        {
            for (name, bits) in users {
                entries.push((
                    PermissionsKey::User(name.clone()),
                    bits_of(bits),
                ));
            }
        }

        if let Some(groups) = path_get(snapshot, "security.group_permissions")
            .and_then(Value::as_array)
        {
            for entry in groups {
                let name = entry
                    .get("group")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if name.is_empty() {
                    continue;
                }
                let rank =
                    entry.get("rank").and_then(Value::as_u64).unwrap_or(0)
                        as u8;
                let bits = entry
                    .get("permissions")
                    .map(bits_of)
                    .unwrap_or_default();
                entries.push((
                    PermissionsKey::Group {
                        name: name.to_string(),
                        rank,
                    },
                    bits,
                ));
            }
        }

        Self { entries }
    }

    /// The union of every entry matching `identity`.
    pub fn resolve(&self, identity: &ConnectIdentity) -> Permissions {
        let mut out = Permissions::empty();
        for (key, bits) in &self.entries {
            let matched = match key {
                PermissionsKey::Anonymous => true,
                PermissionsKey::LoggedIn => {
                    identity.verified_username.is_some()
                }
                PermissionsKey::Friends => identity.is_friend,
                PermissionsKey::Localhost => identity.is_localhost,
                PermissionsKey::User(name) => identity
                    .verified_username
                    .as_deref()
                    .is_some_and(|u| u.eq_ignore_ascii_case(name)),
                PermissionsKey::Group { name, rank } => {
                    identity.groups.iter().any(|(g, r)| {
                        g.eq_ignore_ascii_case(name) && r == rank
                    })
                }
            };
            if matched {
                out |= *bits;
            }
        }
        out
    }
}

fn bits_of(v: &Value) -> Permissions {
    Permissions::from_bits_truncate(v.as_u64().unwrap_or(0) as u32)
}

//! Per-user session state and its JSON persistence.
//!
//! One document on disk maps user id to a profile: the set of named
//! sessions plus the currently active pointer. The store itself does no
//! locking; every mutation runs under the hub's exclusion domain, and
//! `save` rewrites the whole map through a temp file + rename.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;

/// Length of the id prefix shown to users in replies and listings.
pub const SESSION_ID_DISPLAY_LEN: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionInfo {
    pub session_id: String,
    #[serde(alias = "session_mode")]
    pub mode: String,
    #[serde(default)]
    pub user_role: Option<String>,
    #[serde(default)]
    pub bot_role: Option<String>,
    #[serde(default)]
    pub config: serde_json::Map<String, Value>,
}

impl SessionInfo {
    pub fn new(mode: impl Into<String>) -> Self {
        Self {
            session_id: new_session_id(),
            mode: mode.into(),
            user_role: None,
            bot_role: None,
            config: serde_json::Map::new(),
        }
    }

    pub fn display_id(&self) -> &str {
        let end = self
            .session_id
            .len()
            .min(SESSION_ID_DISPLAY_LEN);
        &self.session_id[..end]
    }
}

/// Globally unique, immutable session id (uuid v4 hex).
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: i64,
    #[serde(default)]
    pub active_session_id: Option<String>,
    #[serde(default)]
    pub sessions: HashMap<String, SessionInfo>,
}

impl UserProfile {
    pub fn new(user_id: i64) -> Self {
        Self {
            user_id,
            active_session_id: None,
            sessions: HashMap::new(),
        }
    }

    pub fn active_session(&self) -> Option<&SessionInfo> {
        self.active_session_id
            .as_ref()
            .and_then(|id| self.sessions.get(id))
    }

    /// Resolve a session by id prefix. Strict: both "no match" and
    /// "multiple matches" are validation errors.
    pub fn resolve_prefix(&self, prefix: &str) -> Result<&SessionInfo, CoreError> {
        let prefix = prefix.trim();
        if prefix.is_empty() {
            return Err(CoreError::Validation(
                "Please provide the first characters of a session id.".to_string(),
            ));
        }
        let mut matches = self
            .sessions
            .values()
            .filter(|s| s.session_id.starts_with(prefix));
        match (matches.next(), matches.next()) {
            (None, _) => Err(CoreError::Validation(format!(
                "No session found with id prefix '{}'.",
                prefix
            ))),
            (Some(_), Some(_)) => Err(CoreError::Validation(format!(
                "Multiple sessions match prefix '{}'; provide more characters.",
                prefix
            ))),
            (Some(session), None) => Ok(session),
        }
    }
}

pub struct SessionStore {
    path: PathBuf,
    users: HashMap<i64, UserProfile>,
}

impl SessionStore {
    /// Load the persisted map. A missing file is an empty store; malformed
    /// content is logged and reset to empty. Startup never fails here.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let users = match fs::read_to_string(&path) {
            Ok(contents) => match parse_store(&contents) {
                Ok(users) => {
                    tracing::info!("Loaded {} users from {:?}", users.len(), path);
                    users
                }
                Err(e) => {
                    tracing::error!("User store at {:?} is malformed, resetting: {:#}", path, e);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self { path, users }
    }

    pub fn get_or_create(&mut self, user_id: i64) -> &mut UserProfile {
        self.users
            .entry(user_id)
            .or_insert_with(|| UserProfile::new(user_id))
    }

    pub fn get(&self, user_id: i64) -> Option<&UserProfile> {
        self.users.get(&user_id)
    }

    /// Find a session by id across all users (used by the config-sink
    /// write-back, which only knows the session id).
    pub fn find_session_mut(&mut self, session_id: &str) -> Option<&mut SessionInfo> {
        self.users
            .values_mut()
            .find_map(|profile| profile.sessions.get_mut(session_id))
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Rewrite the whole map. Goes through a temp file in the same
    /// directory and a rename so a crash mid-write leaves the old file
    /// intact. Callers hold the hub lock for the duration.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {:?}", parent))?;
            }
        }

        // String keys and stable ordering on disk.
        let serializable: BTreeMap<String, &UserProfile> = self
            .users
            .iter()
            .map(|(id, profile)| (id.to_string(), profile))
            .collect();
        let json = serde_json::to_string_pretty(&serializable)
            .context("Failed to serialize user store")?;

        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, json)
            .with_context(|| format!("Failed to write {:?}", tmp_path))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("Failed to replace {:?}", self.path))?;
        Ok(())
    }
}

fn parse_store(contents: &str) -> Result<HashMap<i64, UserProfile>> {
    let raw: serde_json::Map<String, Value> =
        serde_json::from_str(contents).context("not a JSON object")?;

    let mut users = HashMap::new();
    for (key, value) in raw {
        let user_id: i64 = key
            .parse()
            .with_context(|| format!("user key '{}' is not an integer", key))?;

        let mut profile = match value {
            // Legacy flat form: the entry is a bare session-id string. The
            // original mode and roles are unrecoverable, so it becomes a
            // plain-mode session; the first save rewrites it in the current
            // schema.
            Value::String(session_id) => {
                tracing::warn!("Upgrading legacy store entry for user {}", user_id);
                let mut session = SessionInfo::new("plain");
                session.session_id = session_id.clone();
                let mut profile = UserProfile::new(user_id);
                profile.sessions.insert(session_id.clone(), session);
                profile.active_session_id = Some(session_id);
                profile
            }
            other => serde_json::from_value::<UserProfile>(other)
                .with_context(|| format!("bad profile for user {}", user_id))?,
        };

        profile.user_id = user_id;

        // Repair a dangling active pointer rather than carrying a broken
        // invariant into the registry.
        if let Some(active) = &profile.active_session_id {
            if !profile.sessions.contains_key(active) {
                tracing::warn!(
                    "User {} active session {} does not exist; clearing",
                    user_id,
                    active
                );
                profile.active_session_id = None;
            }
        }

        users.insert(user_id, profile);
    }
    Ok(users)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn store_in(dir: &tempfile::TempDir) -> SessionStore {
        SessionStore::load(dir.path().join("users.json"))
    }

    #[test]
    fn missing_file_yields_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert_eq!(store.user_count(), 0);
    }

    #[test]
    fn malformed_file_resets_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        fs::write(&path, "{ not json").unwrap();
        let store = SessionStore::load(&path);
        assert_eq!(store.user_count(), 0);
    }

    #[test]
    fn save_and_reload_round_trips_nested_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");

        let mut store = SessionStore::load(&path);
        let mut session = SessionInfo::new("roleplay");
        session.user_role = Some("Dave".to_string());
        session.bot_role = Some("Dean".to_string());
        session.config.insert(
            "prompt_overrides".to_string(),
            serde_json::json!({"tone": {"warmth": 0.8, "tags": ["casual", "playful"]}}),
        );
        let session_id = session.session_id.clone();

        let profile = store.get_or_create(42);
        profile.sessions.insert(session_id.clone(), session.clone());
        profile.active_session_id = Some(session_id.clone());
        store.save().unwrap();

        let reloaded = SessionStore::load(&path);
        let profile = reloaded.get(42).unwrap();
        assert_eq!(profile.active_session_id.as_deref(), Some(&session_id[..]));
        assert_eq!(profile.sessions[&session_id], session);
    }

    #[test]
    fn legacy_flat_entry_upgrades_on_load_and_rewrites_on_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        fs::write(&path, r#"{"7": "abcdef0123456789"}"#).unwrap();

        let mut store = SessionStore::load(&path);
        let profile = store.get_or_create(7);
        assert_eq!(
            profile.active_session_id.as_deref(),
            Some("abcdef0123456789")
        );
        assert_eq!(profile.sessions["abcdef0123456789"].mode, "plain");

        store.save().unwrap();
        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert!(raw["7"].is_object());
        assert_eq!(raw["7"]["sessions"]["abcdef0123456789"]["mode"], "plain");
    }

    #[test]
    fn dangling_active_pointer_is_cleared_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        fs::write(
            &path,
            r#"{"9": {"user_id": 9, "active_session_id": "gone", "sessions": {}}}"#,
        )
        .unwrap();

        let store = SessionStore::load(&path);
        assert_eq!(store.get(9).unwrap().active_session_id, None);
    }

    #[test]
    fn generated_session_ids_are_unique() {
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(new_session_id()));
        }
    }

    #[test]
    fn prefix_resolution_is_strict() {
        let mut profile = UserProfile::new(1);
        for id in ["aa11", "aa22", "bb33"] {
            let mut session = SessionInfo::new("plain");
            session.session_id = id.to_string();
            profile.sessions.insert(id.to_string(), session);
        }

        assert_eq!(profile.resolve_prefix("bb").unwrap().session_id, "bb33");
        assert!(matches!(
            profile.resolve_prefix("aa"),
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            profile.resolve_prefix("zz"),
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            profile.resolve_prefix(""),
            Err(CoreError::Validation(_))
        ));
    }
}

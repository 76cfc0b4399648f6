//! Known-roles registry.
//!
//! A JSON document mapping role name to persona description, loaded once at
//! startup. Bot-role mutations are validated against this set before any
//! session state changes. Reload only happens through the admin path.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result};

use crate::error::CoreError;

pub struct RoleRegistry {
    path: PathBuf,
    roles: RwLock<HashMap<String, String>>,
}

impl RoleRegistry {
    /// Load the registry. A missing or malformed file yields an empty
    /// registry with a warning; startup never fails on it.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let roles = match read_roles(&path) {
            Ok(roles) => {
                tracing::info!("Loaded {} roles from {:?}", roles.len(), path);
                roles
            }
            Err(e) => {
                tracing::warn!("Roles config not usable at {:?}: {:#}", path, e);
                HashMap::new()
            }
        };
        Self {
            path,
            roles: RwLock::new(roles),
        }
    }

    pub fn validate(&self, role_name: &str) -> Result<(), CoreError> {
        let roles = self.roles.read().unwrap();
        if roles.contains_key(role_name) {
            Ok(())
        } else {
            let mut names: Vec<_> = roles.keys().cloned().collect();
            names.sort();
            Err(CoreError::Validation(format!(
                "Unknown role '{}'. Available roles: {}",
                role_name,
                names.join(", ")
            )))
        }
    }

    pub fn describe(&self, role_name: &str) -> Option<String> {
        self.roles.read().unwrap().get(role_name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.roles.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.roles.read().unwrap().is_empty()
    }

    /// Re-read the backing file. Admin-triggered only; on failure the
    /// previously loaded set stays in effect.
    pub fn reload(&self) -> Result<usize> {
        let fresh = read_roles(&self.path)?;
        let count = fresh.len();
        *self.roles.write().unwrap() = fresh;
        tracing::info!("Reloaded {} roles from {:?}", count, self.path);
        Ok(count)
    }
}

fn read_roles(path: &Path) -> Result<HashMap<String, String>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_str(&contents).with_context(|| format!("Failed to parse {:?}", path))
}

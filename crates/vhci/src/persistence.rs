//! Persisted import locations (§6 `SET_PERSISTENT`/`GET_PERSISTENT`): the
//! set of `node_name,service_name,busid` triples the controller should
//! reattach automatically at boot.
//!
//! Grounded in the original driver's registry-backed persistent device
//! list, reimplemented as a flat TOML file (matching [`crate::config`]'s
//! own storage choice) at the path [`crate::config::VhciConfig::persistence_path`]
//! returns.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::device::ImportedDeviceLocation;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedFile {
    devices: Vec<PersistedLocation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
struct PersistedLocation {
    node_name: String,
    service_name: String,
    busid: String,
}

impl From<&ImportedDeviceLocation> for PersistedLocation {
    fn from(loc: &ImportedDeviceLocation) -> Self {
        PersistedLocation {
            node_name: loc.node_name.clone(),
            service_name: loc.service_name.clone(),
            busid: loc.busid.clone(),
        }
    }
}

impl From<PersistedLocation> for ImportedDeviceLocation {
    fn from(p: PersistedLocation) -> Self {
        ImportedDeviceLocation {
            node_name: p.node_name,
            service_name: p.service_name,
            busid: p.busid,
        }
    }
}

/// The on-disk persisted-location store. Holds the full set in memory and
/// rewrites the whole file on every mutation, matching the original's
/// simple "registry value is the whole list" semantics — there is no
/// concurrent-writer scenario to optimize for (only the controller, under
/// its own lock, touches this store).
pub struct PersistenceStore {
    path: PathBuf,
    locations: HashSet<PersistedLocation>,
}

impl PersistenceStore {
    pub fn load(path: PathBuf) -> Result<Self> {
        let locations = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read persisted devices file: {}", path.display()))?;
            let parsed: PersistedFile = toml::from_str(&content)
                .with_context(|| format!("failed to parse persisted devices file: {}", path.display()))?;
            parsed.devices.into_iter().collect()
        } else {
            HashSet::new()
        };
        Ok(PersistenceStore { path, locations })
    }

    /// `SET_PERSISTENT`: adds `location` to the persisted set and rewrites
    /// the file.
    pub fn set_persistent(&mut self, location: &ImportedDeviceLocation) -> Result<()> {
        self.locations.insert(location.into());
        self.flush()
    }

    /// Removes `location` from the persisted set, if present.
    pub fn clear_persistent(&mut self, location: &ImportedDeviceLocation) -> Result<()> {
        self.locations.remove(&PersistedLocation::from(location));
        self.flush()
    }

    /// `GET_PERSISTENT`: every persisted location, in unspecified order.
    pub fn get_persistent(&self) -> Vec<ImportedDeviceLocation> {
        self.locations.iter().cloned().map(Into::into).collect()
    }

    pub fn is_persistent(&self, location: &ImportedDeviceLocation) -> bool {
        self.locations.contains(&PersistedLocation::from(location))
    }

    fn flush(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create persistence directory: {}", parent.display()))?;
        }
        let file = PersistedFile {
            devices: self.locations.iter().cloned().collect(),
        };
        let content = toml::to_string_pretty(&file).context("failed to serialize persisted devices")?;
        fs::write(&self.path, content)
            .with_context(|| format!("failed to write persisted devices file: {}", self.path.display()))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(busid: &str) -> ImportedDeviceLocation {
        ImportedDeviceLocation {
            node_name: "host".into(),
            service_name: "3240".into(),
            busid: busid.into(),
        }
    }

    #[test]
    fn set_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("imported_devices.toml");
        let mut store = PersistenceStore::load(path.clone()).unwrap();
        store.set_persistent(&loc("1-1")).unwrap();
        assert!(store.is_persistent(&loc("1-1")));

        let reloaded = PersistenceStore::load(path).unwrap();
        assert_eq!(reloaded.get_persistent().len(), 1);
    }

    #[test]
    fn clear_removes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("imported_devices.toml");
        let mut store = PersistenceStore::load(path).unwrap();
        store.set_persistent(&loc("1-1")).unwrap();
        store.clear_persistent(&loc("1-1")).unwrap();
        assert!(store.get_persistent().is_empty());
    }

    #[test]
    fn loading_missing_file_yields_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.toml");
        let store = PersistenceStore::load(path).unwrap();
        assert!(store.get_persistent().is_empty());
    }
}

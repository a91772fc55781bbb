//! Installed versions, backups and rollback
//!
//! Each plugin id has an append-only history persisted at `history/<id>.json`.
//! Every installed version keeps a backup at `backups/<id>/<version>`; the
//! active package is mirrored at `active/<id>`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use palisade_core::locking::KeyedLocks;
use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::manifest::Dependency;
use crate::resolver::{DependencyGraph, DependencyResolver, InstalledIndex, InstalledPlugin};
use crate::store::{ArtifactStore, StorageError, keys};
use crate::verifier::{ArtifactVerifier, VerificationError, VerifiedArtifact};
use crate::{PluginError, PluginResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub version: Version,
    pub installed_at: DateTime<Utc>,
    pub backup_location: String,
    pub active: bool,
    /// Set when this version stopped being the active one
    #[serde(default)]
    pub deactivated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

/// Outcome of an install or rollback
#[derive(Debug, Clone)]
pub struct Activation {
    pub record: VersionRecord,
    pub previous: Option<Version>,
    pub artifact: VerifiedArtifact,
    pub graph: DependencyGraph,
}

#[derive(Debug)]
pub struct VersionManager {
    store: Arc<dyn ArtifactStore>,
    verifier: Arc<ArtifactVerifier>,
    resolver: Arc<DependencyResolver>,
    histories: DashMap<String, Vec<VersionRecord>>,
    locks: KeyedLocks,
}

impl VersionManager {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        verifier: Arc<ArtifactVerifier>,
        resolver: Arc<DependencyResolver>,
    ) -> Self {
        Self {
            store,
            verifier,
            resolver,
            histories: DashMap::new(),
            locks: KeyedLocks::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    /// Verify, resolve, back up the current version and activate `artifact`
    pub async fn install(
        &self,
        plugin_id: &str,
        version: &Version,
        artifact: &[u8],
    ) -> PluginResult<Activation> {
        let _guard = self.locks.lock(plugin_id).await;

        let verified = self.verify_for(plugin_id, version, artifact)?;
        let history = self.load_history(plugin_id).await?;
        if history.iter().any(|r| &r.version == version) {
            return Err(PluginError::VersionExists {
                plugin_id: plugin_id.to_string(),
                version: version.clone(),
            });
        }

        let index = self.installed_index().await?;
        let graph = self
            .resolver
            .resolve(plugin_id, &verified.metadata, &index)?;

        let previous_active = self.read_optional(&keys::active(plugin_id)).await?;
        let previous = history.iter().find(|r| r.active).cloned();
        if let (Some(record), Some(bytes)) = (&previous, &previous_active) {
            self.snapshot(record, bytes).await?;
        }

        let backup_location = keys::backup(plugin_id, version);
        self.store.write(&backup_location, artifact).await?;
        self.store.write(&keys::active(plugin_id), artifact).await?;

        let now = Utc::now();
        let mut updated = history;
        for record in updated.iter_mut().filter(|r| r.active) {
            record.active = false;
            record.deactivated_at = Some(now);
        }
        let record = VersionRecord {
            version: version.clone(),
            installed_at: now,
            backup_location,
            active: true,
            deactivated_at: None,
            dependencies: verified.metadata.dependencies.clone(),
        };
        updated.push(record.clone());

        if let Err(e) = self.persist_history(plugin_id, &updated).await {
            self.restore_active(plugin_id, previous_active.as_deref()).await;
            return Err(e);
        }
        self.histories.insert(plugin_id.to_string(), updated);

        info!(plugin_id = %plugin_id, version = %version, "Plugin version installed");
        Ok(Activation {
            record,
            previous: previous.map(|r| r.version),
            artifact: verified,
            graph,
        })
    }

    /// Make an earlier version active again
    ///
    /// The target is re-verified and re-resolved first; on any failure the
    /// previously active version stays active.
    pub async fn rollback(&self, plugin_id: &str, target: &Version) -> PluginResult<Activation> {
        let _guard = self.locks.lock(plugin_id).await;

        let history = self.load_history(plugin_id).await?;
        let target_record = history
            .iter()
            .find(|r| &r.version == target)
            .cloned()
            .ok_or_else(|| PluginError::VersionNotFound {
                plugin_id: plugin_id.to_string(),
                version: target.clone(),
            })?;

        let bytes = self.store.read(&target_record.backup_location).await?;
        let verified = self.verify_for(plugin_id, target, &bytes)?;

        let index = self.installed_index().await?;
        let graph = self
            .resolver
            .resolve(plugin_id, &verified.metadata, &index)?;

        let previous = history.iter().find(|r| r.active).cloned();
        let previous_active = self.read_optional(&keys::active(plugin_id)).await?;

        self.store.write(&keys::active(plugin_id), &bytes).await?;

        let now = Utc::now();
        let mut updated = history;
        for record in updated.iter_mut() {
            if record.version == *target {
                record.active = true;
                record.deactivated_at = None;
            } else if record.active {
                record.active = false;
                record.deactivated_at = Some(now);
            }
        }

        if let Err(e) = self.persist_history(plugin_id, &updated).await {
            self.restore_active(plugin_id, previous_active.as_deref()).await;
            return Err(e);
        }
        self.histories.insert(plugin_id.to_string(), updated);

        info!(
            plugin_id = %plugin_id,
            from = ?previous.as_ref().map(|r| r.version.to_string()),
            to = %target,
            "Plugin rolled back"
        );

        let mut record = target_record;
        record.active = true;
        record.deactivated_at = None;
        Ok(Activation {
            record,
            previous: previous.map(|r| r.version),
            artifact: verified,
            graph,
        })
    }

    /// Full history, oldest first
    pub async fn history(&self, plugin_id: &str) -> PluginResult<Vec<VersionRecord>> {
        self.load_history(plugin_id).await
    }

    pub async fn active(&self, plugin_id: &str) -> PluginResult<Option<VersionRecord>> {
        Ok(self
            .load_history(plugin_id)
            .await?
            .into_iter()
            .find(|r| r.active))
    }

    /// Bytes of the active package
    pub async fn read_active(&self, plugin_id: &str) -> PluginResult<(VersionRecord, Vec<u8>)> {
        let record = self
            .active(plugin_id)
            .await?
            .ok_or_else(|| PluginError::NotFound(plugin_id.to_string()))?;
        let bytes = self.store.read(&keys::active(plugin_id)).await?;
        Ok((record, bytes))
    }

    /// Drop the oldest inactive versions beyond `keep`, deleting their backups
    pub async fn prune(&self, plugin_id: &str, keep: usize) -> PluginResult<Vec<VersionRecord>> {
        let _guard = self.locks.lock(plugin_id).await;

        let history = self.load_history(plugin_id).await?;
        let mut inactive: Vec<&VersionRecord> = history.iter().filter(|r| !r.active).collect();
        inactive.sort_by_key(|r| r.installed_at);

        let excess = inactive.len().saturating_sub(keep);
        let doomed: Vec<VersionRecord> = inactive.into_iter().take(excess).cloned().collect();
        if doomed.is_empty() {
            return Ok(Vec::new());
        }

        let retained: Vec<VersionRecord> = history
            .iter()
            .filter(|r| !doomed.iter().any(|d| d.version == r.version))
            .cloned()
            .collect();

        self.persist_history(plugin_id, &retained).await?;
        self.histories.insert(plugin_id.to_string(), retained);

        for record in &doomed {
            if let Err(e) = self.store.remove(&record.backup_location).await {
                warn!(
                    plugin_id = %plugin_id,
                    version = %record.version,
                    error = %e,
                    "Failed to delete pruned backup"
                );
            }
        }

        info!(plugin_id = %plugin_id, pruned = doomed.len(), "Pruned version history");
        Ok(doomed)
    }

    /// Ids with any recorded history
    pub async fn installed_ids(&self) -> PluginResult<Vec<String>> {
        let mut ids: Vec<String> = self
            .store
            .list(keys::HISTORY_PREFIX)
            .await?
            .into_iter()
            .filter_map(|key| {
                key.strip_prefix(keys::HISTORY_PREFIX)
                    .and_then(|name| name.strip_suffix(".json"))
                    .map(str::to_string)
            })
            .collect();

        for entry in self.histories.iter() {
            if !ids.contains(entry.key()) {
                ids.push(entry.key().clone());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Snapshot of every installed version, for the resolver
    pub async fn installed_index(&self) -> PluginResult<InstalledIndex> {
        let mut index = InstalledIndex::new();
        for id in self.installed_ids().await? {
            for record in self.load_history(&id).await? {
                index.insert(InstalledPlugin {
                    id: id.clone(),
                    version: record.version,
                    dependencies: record.dependencies,
                });
            }
        }
        Ok(index)
    }

    pub(crate) fn verify_for(
        &self,
        plugin_id: &str,
        version: &Version,
        bytes: &[u8],
    ) -> PluginResult<VerifiedArtifact> {
        let verified = self.verifier.verify(bytes)?;
        if verified.metadata.id != plugin_id || verified.metadata.version != *version {
            return Err(VerificationError::Malformed(format!(
                "package is {}@{}, expected {}@{}",
                verified.metadata.id, verified.metadata.version, plugin_id, version
            ))
            .into());
        }
        Ok(verified)
    }

    async fn load_history(&self, plugin_id: &str) -> PluginResult<Vec<VersionRecord>> {
        if let Some(history) = self.histories.get(plugin_id) {
            return Ok(history.clone());
        }

        let key = keys::history(plugin_id);
        let history: Vec<VersionRecord> = match self.store.read(&key).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| StorageError::Corrupt {
                key: key.clone(),
                reason: e.to_string(),
            })?,
            Err(StorageError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        if !history.is_empty() {
            self.histories
                .insert(plugin_id.to_string(), history.clone());
        }
        Ok(history)
    }

    async fn persist_history(
        &self,
        plugin_id: &str,
        history: &[VersionRecord],
    ) -> PluginResult<()> {
        let key = keys::history(plugin_id);
        let bytes = serde_json::to_vec_pretty(history).map_err(|e| StorageError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.store.write(&key, &bytes).await?;
        Ok(())
    }

    async fn read_optional(&self, key: &str) -> PluginResult<Option<Vec<u8>>> {
        match self.store.read(key).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Re-write the backup of the outgoing version if it has gone missing
    async fn snapshot(&self, record: &VersionRecord, active_bytes: &[u8]) -> PluginResult<()> {
        match self.store.read(&record.backup_location).await {
            Ok(_) => Ok(()),
            Err(StorageError::NotFound(_)) => {
                self.store
                    .write(&record.backup_location, active_bytes)
                    .await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn restore_active(&self, plugin_id: &str, previous: Option<&[u8]>) {
        let key = keys::active(plugin_id);
        let result = match previous {
            Some(bytes) => self.store.write(&key, bytes).await,
            None => self.store.remove(&key).await,
        };
        if let Err(e) = result {
            warn!(plugin_id = %plugin_id, error = %e, "Failed to restore active artifact");
        }
    }
}

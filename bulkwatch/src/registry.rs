//! The immutable map from resource types to storages.

use crate::selector::GroupVersionResource;
use crate::storage::{ObjectEncoder, Storage, Watcher};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Storages and preferred versions known to the server.
///
/// Built once with [`RegistryBuilder`] and shared read-only by every session.
#[derive(Clone, Default)]
pub struct Registry {
    storages: HashMap<GroupVersionResource, Arc<dyn Storage>>,
    preferred_versions: HashMap<String, String>,
}

/// A storage that can be watched, as returned by [`Registry::lookup`].
#[derive(Clone)]
pub struct WatchTarget {
    /// Opens the underlying watch.
    pub watcher: Arc<dyn Watcher>,
    /// Encodes the storage's objects.
    pub encoder: Arc<dyn ObjectEncoder>,
}

impl fmt::Debug for WatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchTarget").finish_non_exhaustive()
    }
}

/// Why a lookup did not produce a [`WatchTarget`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    /// No storage is registered for the resource type.
    #[error("unsupported resource: {0}")]
    NotFound(GroupVersionResource),
    /// A storage exists but does not support watching.
    #[error("resource {0} does not support watch")]
    NotWatchable(GroupVersionResource),
}

impl Registry {
    /// Start building a registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// The version used when a selector leaves it empty.
    pub fn preferred_version(&self, group: &str) -> Option<&str> {
        self.preferred_versions.get(group).map(String::as_str)
    }

    /// Find the storage for `gvr` and check that it can be watched.
    pub fn lookup(&self, gvr: &GroupVersionResource) -> Result<WatchTarget, LookupError> {
        let storage = self
            .storages
            .get(gvr)
            .ok_or_else(|| LookupError::NotFound(gvr.clone()))?;

        let watcher = storage
            .clone()
            .watcher()
            .ok_or_else(|| LookupError::NotWatchable(gvr.clone()))?;

        Ok(WatchTarget {
            watcher,
            encoder: storage.encoder(),
        })
    }

    /// Registered resource types, in no particular order.
    pub fn resources(&self) -> impl Iterator<Item = &GroupVersionResource> {
        self.storages.keys()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("resources", &self.storages.keys().collect::<Vec<_>>())
            .field("preferred_versions", &self.preferred_versions)
            .finish()
    }
}

/// Builder for [`Registry`].
#[derive(Default)]
pub struct RegistryBuilder {
    registry: Registry,
}

impl RegistryBuilder {
    /// Serve `gvr` from `storage`.
    ///
    /// The first registered version of a group becomes its preferred version
    /// unless [`prefer_version`](Self::prefer_version) says otherwise.
    pub fn register(mut self, gvr: GroupVersionResource, storage: Arc<dyn Storage>) -> Self {
        self.registry
            .preferred_versions
            .entry(gvr.group.clone())
            .or_insert_with(|| gvr.version.clone());
        self.registry.storages.insert(gvr, storage);
        self
    }

    /// Set the preferred version of `group`.
    pub fn prefer_version(mut self, group: impl Into<String>, version: impl Into<String>) -> Self {
        self.registry
            .preferred_versions
            .insert(group.into(), version.into());
        self
    }

    /// Finish building.
    pub fn build(self) -> Registry {
        self.registry
    }
}

impl fmt::Debug for RegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryBuilder")
            .field("registry", &self.registry)
            .finish()
    }
}

//! Durable record of every known server instance.
//!
//! The [`Registry`] trait maps instance ids to [`ServerInstance`] records and
//! keeps a unique secondary index from name to id. Both uniqueness rules are
//! enforced at write time, and every mutating call is durable before it
//! returns.
//!
//! Two implementations are provided:
//!
//! * [`FileRegistry`] - a JSON document replaced atomically on every write
//! * [`InMemoryRegistry`] - for tests and embedding
mod file;
mod id;
mod instance;
mod memory;

pub use file::FileRegistry;
pub use id::{ServerId, validate_name};
pub use instance::{DesiredState, ObservedState, ServerInstance};
pub use memory::InMemoryRegistry;

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;

/// Instance persistence contract.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Upserts an instance by id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateName`] when another instance already holds
    /// the name, or [`Error::PersistenceFailed`] when the write could not be
    /// made durable; in both cases nothing changes.
    async fn put(&self, instance: &ServerInstance) -> Result<()>;

    /// Fetches one instance.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the id is unknown.
    async fn get(&self, id: &ServerId) -> Result<ServerInstance>;

    /// Looks an instance up through the name index.
    async fn find_by_name(&self, name: &str) -> Result<Option<ServerInstance>>;

    /// Snapshot of all instances, ordered by name.
    ///
    /// The returned vector can be iterated any number of times; it does not
    /// observe writes made after the call.
    async fn list(&self) -> Result<Vec<ServerInstance>>;

    /// Removes an instance and returns its last record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the id is unknown, including on a
    /// second removal of the same id.
    async fn remove(&self, id: &ServerId) -> Result<ServerInstance>;
}

/// Shared in-memory state with both indexes.
#[derive(Debug, Clone, Default)]
pub(crate) struct RegistryState {
    instances: HashMap<ServerId, ServerInstance>,
    names: HashMap<String, ServerId>,
}

impl RegistryState {
    pub(crate) fn from_instances(
        instances: impl IntoIterator<Item = ServerInstance>,
    ) -> Result<Self> {
        let mut state = Self::default();
        for instance in instances {
            if state.instances.contains_key(&instance.id) {
                return Err(Error::PersistenceFailed(format!(
                    "registry holds server id {} twice",
                    instance.id
                )));
            }
            state.upsert(instance)?;
        }
        Ok(state)
    }

    pub(crate) fn upsert(&mut self, instance: ServerInstance) -> Result<()> {
        if let Some(holder) = self.names.get(&instance.name) {
            if *holder != instance.id {
                return Err(Error::DuplicateName(instance.name));
            }
        }

        if let Some(previous) = self.instances.get(&instance.id) {
            if previous.name != instance.name {
                self.names.remove(&previous.name);
            }
        }
        self.names.insert(instance.name.clone(), instance.id.clone());
        self.instances.insert(instance.id.clone(), instance);
        Ok(())
    }

    pub(crate) fn get(&self, id: &ServerId) -> Result<ServerInstance> {
        self.instances
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    pub(crate) fn find_by_name(&self, name: &str) -> Option<ServerInstance> {
        self.names
            .get(name)
            .and_then(|id| self.instances.get(id))
            .cloned()
    }

    pub(crate) fn remove(&mut self, id: &ServerId) -> Result<ServerInstance> {
        let removed = self
            .instances
            .remove(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        self.names.remove(&removed.name);
        Ok(removed)
    }

    pub(crate) fn list(&self) -> Vec<ServerInstance> {
        let mut all: Vec<ServerInstance> = self.instances.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        all
    }
}

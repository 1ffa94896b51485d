use crate::error::{Error, Result};
use crate::registry::{Registry, RegistryState, ServerId, ServerInstance};
use async_trait::async_trait;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Thread-safe in-memory registry.
///
/// Nothing survives the process; "durable" means visible to every later call.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl InMemoryRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, RegistryState>> {
        self.state
            .read()
            .map_err(|_| Error::PersistenceFailed("registry lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, RegistryState>> {
        self.state
            .write()
            .map_err(|_| Error::PersistenceFailed("registry lock poisoned".to_string()))
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn put(&self, instance: &ServerInstance) -> Result<()> {
        self.write()?.upsert(instance.clone())
    }

    async fn get(&self, id: &ServerId) -> Result<ServerInstance> {
        self.read()?.get(id)
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<ServerInstance>> {
        Ok(self.read()?.find_by_name(name))
    }

    async fn list(&self) -> Result<Vec<ServerInstance>> {
        Ok(self.read()?.list())
    }

    async fn remove(&self, id: &ServerId) -> Result<ServerInstance> {
        self.write()?.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ObservedState;

    fn instance(id: &str, name: &str) -> ServerInstance {
        ServerInstance::new(ServerId::parse(id).unwrap(), name, format!("/srv/{id}"))
    }

    #[tokio::test]
    async fn test_put_get_list_remove() -> Result<()> {
        let registry = InMemoryRegistry::new();
        registry.put(&instance("aaaa", "alpha")).await?;
        registry.put(&instance("bbbb", "beta")).await?;

        let alpha = registry.get(&ServerId::parse("aaaa")?).await?;
        assert_eq!(alpha.name, "alpha");
        assert_eq!(alpha.observed_state, ObservedState::Stopped);

        let names: Vec<String> = registry.list().await?.into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["alpha", "beta"]);

        registry.remove(&ServerId::parse("aaaa")?).await?;
        assert!(matches!(
            registry.remove(&ServerId::parse("aaaa")?).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            registry.get(&ServerId::parse("aaaa")?).await,
            Err(Error::NotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_name_uniqueness_enforced_on_put() -> Result<()> {
        let registry = InMemoryRegistry::new();
        registry.put(&instance("aaaa", "alpha")).await?;

        let err = registry.put(&instance("bbbb", "alpha")).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateName(_)));
        assert_eq!(registry.list().await?.len(), 1);
        assert!(registry.find_by_name("alpha").await?.is_some());
        Ok(())
    }
}

use crate::error::{Error, Result};
use crate::registry::{ObservedState, Registry, RegistryState, ServerId, ServerInstance};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct RegistryDocument {
    version: u32,
    instances: Vec<ServerInstance>,
}

/// Registry persisted as one JSON document.
///
/// Every write renders the complete next state into a temporary file next to
/// the target, syncs it, and renames it over the previous document, so a
/// reader never sees a partial write.
///
/// Several managers may share one document. Writers take an exclusive
/// advisory lock on `<document>.lock`, reload the document under it and
/// apply their change to what is on disk, so uniqueness is checked against
/// every other writer. Reads go straight to the document.
#[derive(Debug)]
pub struct FileRegistry {
    path: PathBuf,
    lock_path: PathBuf,
    /// Queues this handle's writers ahead of the file lock.
    writer: Mutex<()>,
}

impl FileRegistry {
    /// Open the registry stored at `path`. The document is created by the
    /// first write.
    ///
    /// Records persisted while a start was in flight are rewritten as
    /// [`ObservedState::Unknown`]; reconciliation settles them.
    #[tracing::instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut lock_name = path.file_name().unwrap_or_default().to_os_string();
        lock_name.push(".lock");
        let registry = Self {
            lock_path: path.with_file_name(lock_name),
            path,
            writer: Mutex::new(()),
        };

        let state = registry.load().await?;
        let interrupted: Vec<ServerId> = state
            .list()
            .into_iter()
            .filter(|instance| instance.observed_state == ObservedState::Starting)
            .map(|instance| instance.id)
            .collect();
        if !interrupted.is_empty() {
            registry
                .transact(move |state| {
                    for id in &interrupted {
                        let Ok(mut instance) = state.get(id) else {
                            continue;
                        };
                        if instance.observed_state == ObservedState::Starting {
                            tracing::warn!(server_id = %id, "Start was interrupted, state unknown");
                            instance.observed_state = ObservedState::Unknown;
                            state.upsert(instance)?;
                        }
                    }
                    Ok(())
                })
                .await?;
        }

        tracing::debug!(instances = state.list().len(), "Registry loaded");
        Ok(registry)
    }

    /// Location of the registry document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<RegistryState> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => parse_document(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RegistryState::default()),
            Err(e) => Err(Error::persistence("Failed to read registry", e)),
        }
    }

    /// Read-modify-write of the document under the registry lock. Nothing is
    /// written when `change` fails.
    async fn transact<T, F>(&self, change: F) -> Result<T>
    where
        F: FnOnce(&mut RegistryState) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let _writer = self.writer.lock().await;
        let path = self.path.clone();
        let lock_path = self.lock_path.clone();

        tokio::task::spawn_blocking(move || -> Result<T> {
            let _lock = lock_exclusive(&lock_path)?;
            let mut state = match std::fs::read_to_string(&path) {
                Ok(content) => parse_document(&content)?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => RegistryState::default(),
                Err(e) => return Err(Error::persistence("Failed to read registry", e)),
            };
            let outcome = change(&mut state)?;

            let document = RegistryDocument {
                version: FORMAT_VERSION,
                instances: state.list(),
            };
            let bytes = serde_json::to_vec_pretty(&document)
                .map_err(|e| Error::persistence("Failed to serialize registry", e))?;
            write_atomically(&path, &bytes)?;
            Ok(outcome)
        })
        .await
        .map_err(|e| Error::persistence("Registry writer task failed", e))?
    }
}

fn parse_document(content: &str) -> Result<RegistryState> {
    let document: RegistryDocument = serde_json::from_str(content)
        .map_err(|e| Error::persistence("Failed to parse registry", e))?;
    if document.version != FORMAT_VERSION {
        return Err(Error::PersistenceFailed(format!(
            "Unsupported registry version {}",
            document.version
        )));
    }
    RegistryState::from_instances(document.instances)
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn open_lock_file(lock_path: &Path) -> Result<File> {
    std::fs::create_dir_all(parent_dir(lock_path))
        .map_err(|e| Error::persistence("Failed to create registry directory", e))?;
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path)
        .map_err(|e| Error::persistence("Failed to open registry lock", e))
}

/// Blocks until this process holds the registry lock; released on drop.
#[cfg(unix)]
fn lock_exclusive(lock_path: &Path) -> Result<impl Sized> {
    use nix::fcntl::{Flock, FlockArg};

    Flock::lock(open_lock_file(lock_path)?, FlockArg::LockExclusive)
        .map_err(|(_, errno)| Error::persistence("Failed to lock registry", errno))
}

#[cfg(not(unix))]
fn lock_exclusive(lock_path: &Path) -> Result<impl Sized> {
    open_lock_file(lock_path)
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = parent_dir(path);
    std::fs::create_dir_all(&parent)
        .map_err(|e| Error::persistence("Failed to create registry directory", e))?;

    let mut file = NamedTempFile::new_in(&parent)
        .map_err(|e| Error::persistence("Failed to create temporary registry file", e))?;
    file.write_all(bytes)
        .map_err(|e| Error::persistence("Failed to write registry", e))?;
    file.as_file()
        .sync_all()
        .map_err(|e| Error::persistence("Failed to sync registry", e))?;
    file.persist(path)
        .map_err(|e| Error::persistence("Failed to replace registry", e.error))?;
    Ok(())
}

#[async_trait]
impl Registry for FileRegistry {
    async fn put(&self, instance: &ServerInstance) -> Result<()> {
        let instance = instance.clone();
        self.transact(move |state| state.upsert(instance)).await
    }

    async fn get(&self, id: &ServerId) -> Result<ServerInstance> {
        self.load().await?.get(id)
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<ServerInstance>> {
        Ok(self.load().await?.find_by_name(name))
    }

    async fn list(&self) -> Result<Vec<ServerInstance>> {
        Ok(self.load().await?.list())
    }

    async fn remove(&self, id: &ServerId) -> Result<ServerInstance> {
        let id = id.clone();
        self.transact(move |state| state.remove(&id)).await
    }
}

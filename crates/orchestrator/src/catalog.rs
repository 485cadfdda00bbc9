//! Registry of deployed sandboxes and the ports they hold.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sandbox_core::CatalogItem;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{OrchestratorError, Result};

pub const CATALOG_FILE: &str = "sandboxes.json";

/// Where deployments are recorded. Also the source of truth for ports that
/// are already in use.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Every port held by a recorded deployment.
    async fn installed_ports(&self) -> Result<BTreeSet<u16>>;

    async fn find(&self, destination: &Path) -> Result<Option<CatalogItem>>;

    /// Record a deployment, replacing any entry with the same destination.
    async fn register(&self, item: CatalogItem) -> Result<()>;

    /// Forget a deployment. Returns the removed entry, if there was one.
    async fn remove(&self, destination: &Path) -> Result<Option<CatalogItem>>;

    async fn list(&self) -> Result<Vec<CatalogItem>>;
}

type Entries = BTreeMap<PathBuf, CatalogItem>;

fn ports_of(entries: &Entries) -> BTreeSet<u16> {
    entries
        .values()
        .flat_map(|item| item.port.iter().copied())
        .collect()
}

/// Catalog stored as a JSON object keyed by destination directory.
#[derive(Debug)]
pub struct JsonCatalog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Catalog file inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(CATALOG_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Entries> {
        match fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(Entries::new()),
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                OrchestratorError::Catalog(format!("{}: {}", self.path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Catalog does not exist yet");
                Ok(Entries::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&self, entries: &Entries) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(entries)?;
        // Write then rename so readers never see a half-written file.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), entries = entries.len(), "Catalog saved");
        Ok(())
    }
}

#[async_trait]
impl Catalog for JsonCatalog {
    async fn installed_ports(&self) -> Result<BTreeSet<u16>> {
        let _guard = self.lock.lock().await;
        Ok(ports_of(&self.load().await?))
    }

    async fn find(&self, destination: &Path) -> Result<Option<CatalogItem>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.remove(destination))
    }

    async fn register(&self, item: CatalogItem) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        if entries.contains_key(&item.destination) {
            warn!(destination = %item.destination.display(), "Replacing catalog entry");
        }
        entries.insert(item.destination.clone(), item);
        self.store(&entries).await
    }

    async fn remove(&self, destination: &Path) -> Result<Option<CatalogItem>> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        let removed = entries.remove(destination);
        if removed.is_some() {
            self.store(&entries).await?;
        }
        Ok(removed)
    }

    async fn list(&self) -> Result<Vec<CatalogItem>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.into_values().collect())
    }
}

/// Catalog that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    entries: Mutex<Entries>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(items: impl IntoIterator<Item = CatalogItem>) -> Self {
        Self {
            entries: Mutex::new(
                items
                    .into_iter()
                    .map(|item| (item.destination.clone(), item))
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn installed_ports(&self) -> Result<BTreeSet<u16>> {
        Ok(ports_of(&*self.entries.lock().await))
    }

    async fn find(&self, destination: &Path) -> Result<Option<CatalogItem>> {
        Ok(self.entries.lock().await.get(destination).cloned())
    }

    async fn register(&self, item: CatalogItem) -> Result<()> {
        self.entries
            .lock()
            .await
            .insert(item.destination.clone(), item);
        Ok(())
    }

    async fn remove(&self, destination: &Path) -> Result<Option<CatalogItem>> {
        Ok(self.entries.lock().await.remove(destination))
    }

    async fn list(&self) -> Result<Vec<CatalogItem>> {
        Ok(self.entries.lock().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_core::Version;
    use tempfile::TempDir;

    fn item(destination: &str, ports: &[u16]) -> CatalogItem {
        CatalogItem {
            origin: PathBuf::from("/opt/mysql/8.0.11"),
            sandbox_type: "multiple".to_string(),
            version: Version::new(8, 0, 11),
            port: ports.to_vec(),
            nodes: vec!["node1".to_string(), "node2".to_string()],
            destination: PathBuf::from(destination),
            log_directory: None,
        }
    }

    #[tokio::test]
    async fn test_json_catalog_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let catalog = JsonCatalog::in_dir(temp_dir.path());

        assert!(catalog.installed_ports().await.unwrap().is_empty());
        assert!(catalog.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_json_catalog_register_and_remove() {
        let temp_dir = TempDir::new().unwrap();
        let catalog = JsonCatalog::in_dir(&temp_dir.path().join("state"));

        catalog.register(item("/sb/a", &[20001, 20002])).await.unwrap();
        catalog.register(item("/sb/b", &[21001, 21002])).await.unwrap();
        assert!(catalog.path().exists());

        let ports = catalog.installed_ports().await.unwrap();
        assert_eq!(ports.len(), 4);
        assert!(ports.contains(&21002));

        // A second handle sees what the first one wrote.
        let reopened = JsonCatalog::new(catalog.path());
        let found = reopened.find(Path::new("/sb/a")).await.unwrap().unwrap();
        assert_eq!(found.port, vec![20001, 20002]);

        let removed = reopened.remove(Path::new("/sb/a")).await.unwrap();
        assert!(removed.is_some());
        assert!(reopened.remove(Path::new("/sb/a")).await.unwrap().is_none());
        assert_eq!(catalog.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_json_catalog_rejects_garbage() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(CATALOG_FILE);
        tokio::fs::write(&path, "not json").await.unwrap();

        let err = JsonCatalog::new(&path).installed_ports().await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Catalog(_)));
    }

    #[tokio::test]
    async fn test_memory_catalog() {
        let catalog = MemoryCatalog::with_items([item("/sb/a", &[20001])]);
        catalog.register(item("/sb/a", &[20005])).await.unwrap();

        let ports: Vec<u16> = catalog.installed_ports().await.unwrap().into_iter().collect();
        assert_eq!(ports, vec![20005]);
    }
}

use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::AppConfig;
use crate::error::{AppError, Result};

/// Configuration store backed by a JSON file
///
/// Uses `ArcSwap` for lock-free reads; tiles read the connection
/// settings once at mount and keep their own copy afterwards.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    /// Lock-free cache using ArcSwap for zero-cost reads
    cache: Arc<ArcSwap<AppConfig>>,
    change_tx: broadcast::Sender<ConfigChange>,
}

/// Configuration change event
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub key: String,
}

impl ConfigStore {
    /// Load the configuration file, creating it with defaults if missing
    pub async fn load(path: &Path) -> Result<Self> {
        let config = match tokio::fs::read_to_string(path).await {
            Ok(json) => Self::parse(&json)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = AppConfig::default();
                Self::save_to_file(path, &config).await?;
                config
            }
            Err(e) => return Err(e.into()),
        };

        let (change_tx, _) = broadcast::channel(16);

        Ok(Self {
            path: path.to_path_buf(),
            cache: Arc::new(ArcSwap::from_pointee(config)),
            change_tx,
        })
    }

    fn parse(json: &str) -> Result<AppConfig> {
        serde_json::from_str(json).map_err(|e| AppError::Config(e.to_string()))
    }

    async fn save_to_file(path: &Path, config: &AppConfig) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        // Write next to the target and rename so readers never see a partial file
        let json = serde_json::to_string_pretty(config)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Get current configuration (lock-free, zero-copy)
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Set entire configuration
    pub async fn set(&self, config: AppConfig) -> Result<()> {
        Self::save_to_file(&self.path, &config).await?;
        self.cache.store(Arc::new(config));

        let _ = self.change_tx.send(ConfigChange {
            key: "app_config".to_string(),
        });

        Ok(())
    }

    /// Re-read the file (e.g. after an operator edited it)
    ///
    /// Subscribers are notified only when the parsed content changed.
    pub async fn reload(&self) -> Result<bool> {
        let json = tokio::fs::read_to_string(&self.path).await?;
        let config = Self::parse(&json)?;

        let current = serde_json::to_value(&*self.cache.load_full())?;
        if current == serde_json::to_value(&config)? {
            return Ok(false);
        }

        self.cache.store(Arc::new(config));
        let _ = self.change_tx.send(ConfigChange {
            key: "app_config".to_string(),
        });
        Ok(true)
    }

    /// Subscribe to configuration changes
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.change_tx.subscribe()
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamDescriptor;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_config_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wall.json");

        let store = ConfigStore::load(&path).await.unwrap();
        assert!(path.exists());
        assert!(store.get().streams.is_empty());

        let mut config = (*store.get()).clone();
        config.connection.base_url = "http://127.0.0.1:8889".to_string();
        config.streams.push(StreamDescriptor::new("gate", "cam-gate"));
        store.set(config).await.unwrap();

        let store2 = ConfigStore::load(&path).await.unwrap();
        let config = store2.get();
        assert_eq!(config.connection.base_url, "http://127.0.0.1:8889");
        assert_eq!(config.streams.len(), 1);
    }

    #[tokio::test]
    async fn test_reload_notifies_on_change() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wall.json");
        let store = ConfigStore::load(&path).await.unwrap();
        let mut rx = store.subscribe();

        assert!(!store.reload().await.unwrap());

        tokio::fs::write(
            &path,
            r#"{ "streams": [{ "id": "yard", "camera_key": "cam-yard" }] }"#,
        )
        .await
        .unwrap();

        assert!(store.reload().await.unwrap());
        assert_eq!(rx.recv().await.unwrap().key, "app_config");
        assert_eq!(store.get().streams[0].camera_key, "cam-yard");
    }

    #[tokio::test]
    async fn test_invalid_file_is_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();

        let err = ConfigStore::load(&path).await.err().unwrap();
        assert!(matches!(err, AppError::Config(_)));
    }
}

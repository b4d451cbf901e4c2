use crate::model::DeviceDescriptor;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.json";

// Device descriptors a user has paired, keyed by session name.
pub type UserConfig = HashMap<String, DeviceDescriptor>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] io::Error),
    #[error("store json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn load(&self, user_id: &str) -> Result<UserConfig, StoreError>;
    async fn save(&self, user_id: &str, config: &UserConfig) -> Result<(), StoreError>;
    async fn reset(&self, user_id: &str) -> Result<(), StoreError>;
    async fn client_key(&self, user_id: &str, uuid: &str) -> Result<Option<String>, StoreError>;
    async fn save_client_key(&self, user_id: &str, uuid: &str, key: &str)
        -> Result<(), StoreError>;
}

// One directory per user under `root`, named by the hash of the user id.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn user_dir(&self, user_id: &str) -> PathBuf {
        self.root.join(hash_user_id(user_id))
    }

    fn key_file(&self, user_id: &str, uuid: &str) -> PathBuf {
        self.user_dir(user_id).join(format!("keyFile-{uuid}"))
    }

    async fn ensure_user_dir(&self, user_id: &str) -> Result<PathBuf, StoreError> {
        let dir = self.user_dir(user_id);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }
}

#[async_trait]
impl ConfigStore for FileStore {
    async fn load(&self, user_id: &str) -> Result<UserConfig, StoreError> {
        let path = self.user_dir(user_id).join(CONFIG_FILE);
        match read_optional(&path).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(UserConfig::new()),
        }
    }

    async fn save(&self, user_id: &str, config: &UserConfig) -> Result<(), StoreError> {
        let dir = self.ensure_user_dir(user_id).await?;
        let data = serde_json::to_string_pretty(config)?;
        tokio::fs::write(dir.join(CONFIG_FILE), data).await?;
        Ok(())
    }

    async fn reset(&self, user_id: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_dir_all(self.user_dir(user_id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn client_key(&self, user_id: &str, uuid: &str) -> Result<Option<String>, StoreError> {
        let key = read_optional(&self.key_file(user_id, uuid)).await?;
        Ok(key.map(|k| k.trim().to_string()).filter(|k| !k.is_empty()))
    }

    async fn save_client_key(
        &self,
        user_id: &str,
        uuid: &str,
        key: &str,
    ) -> Result<(), StoreError> {
        self.ensure_user_dir(user_id).await?;
        tokio::fs::write(self.key_file(user_id, uuid), key).await?;
        Ok(())
    }
}

async fn read_optional(path: &Path) -> Result<Option<String>, StoreError> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => Ok(Some(raw)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn hash_user_id(user_id: &str) -> String {
    hex::encode(Sha256::digest(user_id.as_bytes()))
}

#[cfg(test)]
pub(crate) mod memory {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    pub struct MemoryStore {
        configs: Mutex<HashMap<String, UserConfig>>,
        keys: Mutex<HashMap<(String, String), String>>,
        loads: AtomicUsize,
    }

    impl MemoryStore {
        pub fn config_for(&self, user_id: &str) -> Option<UserConfig> {
            self.configs.lock().get(user_id).cloned()
        }

        pub fn key_for(&self, user_id: &str, uuid: &str) -> Option<String> {
            self.keys
                .lock()
                .get(&(user_id.to_string(), uuid.to_string()))
                .cloned()
        }

        pub fn load_count(&self) -> usize {
            self.loads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ConfigStore for MemoryStore {
        async fn load(&self, user_id: &str) -> Result<UserConfig, StoreError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(self.config_for(user_id).unwrap_or_default())
        }

        async fn save(&self, user_id: &str, config: &UserConfig) -> Result<(), StoreError> {
            self.configs
                .lock()
                .insert(user_id.to_string(), config.clone());
            Ok(())
        }

        async fn reset(&self, user_id: &str) -> Result<(), StoreError> {
            self.configs.lock().remove(user_id);
            self.keys.lock().retain(|(user, _), _| user != user_id);
            Ok(())
        }

        async fn client_key(
            &self,
            user_id: &str,
            uuid: &str,
        ) -> Result<Option<String>, StoreError> {
            Ok(self.key_for(user_id, uuid))
        }

        async fn save_client_key(
            &self,
            user_id: &str,
            uuid: &str,
            key: &str,
        ) -> Result<(), StoreError> {
            self.keys
                .lock()
                .insert((user_id.to_string(), uuid.to_string()), key.to_string());
            Ok(())
        }
    }
}

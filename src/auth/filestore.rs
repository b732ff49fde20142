use super::{AuthState, CredentialBackend};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use tokio::fs;

/// Default credential backend: one directory per instance under a base
/// path, state stored as a single JSON document. Saves go through a
/// temporary file plus rename, so a concurrent load never observes a
/// torn write.
pub struct FileAuthBackend {
    base_path: PathBuf,
}

impl FileAuthBackend {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn sanitize(key: &str) -> String {
        key.replace(|c: char| !c.is_alphanumeric() && c != '.' && c != '-', "_")
    }

    fn instance_dir(&self, instance_key: &str) -> PathBuf {
        self.base_path.join(Self::sanitize(instance_key))
    }

    fn state_path(&self, instance_key: &str) -> PathBuf {
        self.instance_dir(instance_key).join("state.json")
    }
}

#[async_trait]
impl CredentialBackend for FileAuthBackend {
    async fn load(&self, instance_key: &str) -> StoreResult<Option<AuthState>> {
        match fs::read(self.state_path(instance_key)).await {
            Ok(data) => serde_json::from_slice(&data)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn save(&self, instance_key: &str, state: &AuthState) -> StoreResult<()> {
        let dir = self.instance_dir(instance_key);
        fs::create_dir_all(&dir).await?;

        let data = serde_json::to_vec_pretty(state)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let path = self.state_path(instance_key);
        let tmp_path = dir.join("state.json.tmp");
        fs::write(&tmp_path, data).await?;
        fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    async fn delete(&self, instance_key: &str) -> StoreResult<()> {
        match fs::remove_dir_all(self.instance_dir(instance_key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }
}

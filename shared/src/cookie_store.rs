/// JSON file holding the credentials obtained by QR login.
use std::path::PathBuf;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::errors::StoreError;
use crate::models::Credentials;

/// File-backed credential store.
///
/// Reads and writes go through one async lock so a save never interleaves
/// with a load.
pub struct CookieStore {
    path: PathBuf,
    lock: RwLock<()>,
}

impl CookieStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: RwLock::new(()),
        }
    }

    /// Load stored credentials. A missing file yields empty credentials.
    pub async fn load(&self) -> Result<Credentials, StoreError> {
        let _guard = self.lock.read().await;
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No credential file at {}", self.path.display());
                Ok(Credentials::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Persist credentials, replacing the file atomically.
    pub async fn save(&self, creds: &Credentials) -> Result<(), StoreError> {
        let _guard = self.lock.write().await;
        let json = serde_json::to_vec_pretty(creds)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        info!("Credentials saved to {}", self.path.display());
        Ok(())
    }
}

//! Persistence for session credentials.
//!
//! The supervisor loads credentials once per connect and saves them after
//! every update from the messaging library.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StorageError;
use crate::session::transport::Credentials;

/// File name used inside the auth directory.
pub const CREDENTIALS_FILE: &str = "creds.bin";

/// Storage collaborator for the session's authentication material.
#[async_trait]
pub trait CredentialStorage: Send + Sync {
    /// Load saved credentials. `None` means start a fresh login.
    async fn load(&self) -> Result<Option<Credentials>, StorageError>;

    /// Durably save credentials, replacing any previous copy.
    async fn save(&self, credentials: &Credentials) -> Result<(), StorageError>;
}

/// Stores credentials as a single file in an auth directory.
///
/// Writes go to a temp file that is synced and renamed over the target, so a
/// crash mid-write leaves the previous credentials intact.
#[derive(Debug, Clone)]
pub struct FileCredentialStorage {
    dir: PathBuf,
}

impl FileCredentialStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(CREDENTIALS_FILE)
    }

    fn temp_path(&self) -> PathBuf {
        self.dir.join(format!("{CREDENTIALS_FILE}.tmp"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl CredentialStorage for FileCredentialStorage {
    async fn load(&self) -> Result<Option<Credentials>, StorageError> {
        match tokio::fs::read(self.path()).await {
            Ok(bytes) if bytes.is_empty() => Err(StorageError::Corrupt(format!(
                "{} is empty",
                self.path().display()
            ))),
            Ok(bytes) => Ok(Some(Credentials::new(bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn save(&self, credentials: &Credentials) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let tmp = self.temp_path();
        let mut file = tokio::fs::File::create(&tmp).await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, credentials.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, self.path()).await?;
        tracing::debug!(path = %self.path().display(), "Saved session credentials");
        Ok(())
    }
}

/// In-memory storage, for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryCredentialStorage {
    credentials: RwLock<Option<Credentials>>,
    saves: std::sync::atomic::AtomicUsize,
}

impl MemoryCredentialStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(credentials: Credentials) -> Self {
        Self {
            credentials: RwLock::new(Some(credentials)),
            saves: Default::default(),
        }
    }

    /// Number of completed saves.
    pub fn save_count(&self) -> usize {
        self.saves.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub async fn current(&self) -> Option<Credentials> {
        self.credentials.read().await.clone()
    }
}

#[async_trait]
impl CredentialStorage for MemoryCredentialStorage {
    async fn load(&self) -> Result<Option<Credentials>, StorageError> {
        Ok(self.credentials.read().await.clone())
    }

    async fn save(&self, credentials: &Credentials) -> Result<(), StorageError> {
        *self.credentials.write().await = Some(credentials.clone());
        self.saves.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

//! JSON-file backed store.
//!
//! Keeps the working set in a [`MemoryRepository`] and rewrites the whole
//! snapshot after every mutation. Writes go to a temporary file first and are
//! renamed into place, so a crash never leaves a half-written snapshot.

use super::*;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

pub struct FileRepository {
    inner: MemoryRepository,
    path: PathBuf,
    /// Serializes snapshot + write so an older image never overwrites a newer one
    write_lock: Mutex<()>,
}

impl FileRepository {
    /// Open (or create) the store at `path`
    pub async fn open(path: impl AsRef<Path>) -> RepoResult<Self> {
        let path = path.as_ref().to_path_buf();

        let inner = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let snapshot: StoreSnapshot = serde_json::from_str(&contents)?;
                if snapshot.schema_version > SNAPSHOT_SCHEMA_VERSION {
                    return Err(RepositoryError::Serialization(format!(
                        "snapshot schema {} is newer than supported {}",
                        snapshot.schema_version, SNAPSHOT_SCHEMA_VERSION
                    )));
                }
                tracing::info!(
                    "Loaded {} session(s) and {} round(s) from {}",
                    snapshot.sessions.len(),
                    snapshot.rounds.len(),
                    path.display()
                );
                MemoryRepository::from_snapshot(snapshot)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No store at {}, starting empty", path.display());
                MemoryRepository::new()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            inner,
            path,
            write_lock: Mutex::new(()),
        })
    }

    async fn persist(&self) -> RepoResult<()> {
        let _guard = self.write_lock.lock().await;
        let snapshot = self.inner.snapshot().await;
        let json = serde_json::to_vec_pretty(&snapshot)?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl Repository for FileRepository {
    async fn insert_session(&self, session: Session) -> RepoResult<()> {
        self.inner.insert_session(session).await?;
        self.persist().await
    }

    async fn get_session(&self, id: &str) -> RepoResult<Option<Session>> {
        self.inner.get_session(id).await
    }

    async fn find_session_by_code(&self, code: &str) -> RepoResult<Option<Session>> {
        self.inner.find_session_by_code(code).await
    }

    async fn list_sessions(&self) -> RepoResult<Vec<Session>> {
        self.inner.list_sessions().await
    }

    async fn save_session(&self, session: &Session) -> RepoResult<()> {
        self.inner.save_session(session).await?;
        self.persist().await
    }

    async fn delete_session(&self, id: &str) -> RepoResult<bool> {
        let existed = self.inner.delete_session(id).await?;
        if existed {
            self.persist().await?;
        }
        Ok(existed)
    }

    async fn insert_round(&self, round: Round) -> RepoResult<()> {
        self.inner.insert_round(round).await?;
        self.persist().await
    }

    async fn get_round(&self, id: &str) -> RepoResult<Option<Round>> {
        self.inner.get_round(id).await
    }

    async fn update_round(&self, id: &str, update: RoundUpdate) -> RepoResult<Option<Guarded<Round>>> {
        let outcome = self.inner.update_round(id, update).await?;
        if matches!(outcome, Some(Guarded::Applied(_))) {
            self.persist().await?;
        }
        Ok(outcome)
    }

    async fn get_user(&self, user_id: &str) -> RepoResult<Option<UserProfile>> {
        self.inner.get_user(user_id).await
    }

    async fn save_user(&self, user: &UserProfile) -> RepoResult<()> {
        self.inner.save_user(user).await?;
        self.persist().await
    }

    async fn clear_current_session(&self, user_id: &str, session_id: &str) -> RepoResult<()> {
        self.inner.clear_current_session(user_id, session_id).await?;
        self.persist().await
    }
}

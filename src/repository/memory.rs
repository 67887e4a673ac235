use super::*;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct Store {
    sessions: HashMap<SessionId, Session>,
    rounds: HashMap<RoundId, Round>,
    users: HashMap<UserId, UserProfile>,
}

/// In-process store. All collections share one lock so conditional round
/// updates observe and write the status atomically.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    store: RwLock<Store>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            store: RwLock::new(Store {
                sessions: snapshot.sessions,
                rounds: snapshot.rounds,
                users: snapshot.users,
            }),
        }
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        let store = self.store.read().await;
        StoreSnapshot {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            exported_at: chrono::Utc::now().to_rfc3339(),
            sessions: store.sessions.clone(),
            rounds: store.rounds.clone(),
            users: store.users.clone(),
        }
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn insert_session(&self, session: Session) -> RepoResult<()> {
        self.store
            .write()
            .await
            .sessions
            .insert(session.id.clone(), session);
        Ok(())
    }

    async fn get_session(&self, id: &str) -> RepoResult<Option<Session>> {
        Ok(self.store.read().await.sessions.get(id).cloned())
    }

    async fn find_session_by_code(&self, code: &str) -> RepoResult<Option<Session>> {
        let code = code.trim().to_uppercase();
        Ok(self
            .store
            .read()
            .await
            .sessions
            .values()
            .find(|s| s.code == code)
            .cloned())
    }

    async fn list_sessions(&self) -> RepoResult<Vec<Session>> {
        Ok(self.store.read().await.sessions.values().cloned().collect())
    }

    async fn save_session(&self, session: &Session) -> RepoResult<()> {
        let mut session = session.clone();
        session.updated_at = chrono::Utc::now().to_rfc3339();
        self.store
            .write()
            .await
            .sessions
            .insert(session.id.clone(), session);
        Ok(())
    }

    async fn delete_session(&self, id: &str) -> RepoResult<bool> {
        let mut store = self.store.write().await;
        let existed = store.sessions.remove(id).is_some();
        store.rounds.retain(|_, r| r.session_id != id);
        Ok(existed)
    }

    async fn insert_round(&self, round: Round) -> RepoResult<()> {
        self.store
            .write()
            .await
            .rounds
            .insert(round.id.clone(), round);
        Ok(())
    }

    async fn get_round(&self, id: &str) -> RepoResult<Option<Round>> {
        Ok(self.store.read().await.rounds.get(id).cloned())
    }

    async fn update_round(&self, id: &str, update: RoundUpdate) -> RepoResult<Option<Guarded<Round>>> {
        let mut store = self.store.write().await;
        let Some(round) = store.rounds.get_mut(id) else {
            return Ok(None);
        };

        let outcome = match update.apply(round) {
            Guarded::Applied(()) => Guarded::Applied(round.clone()),
            Guarded::StatusMismatch(status) => Guarded::StatusMismatch(status),
            Guarded::Duplicate => Guarded::Duplicate,
        };
        Ok(Some(outcome))
    }

    async fn get_user(&self, user_id: &str) -> RepoResult<Option<UserProfile>> {
        Ok(self.store.read().await.users.get(user_id).cloned())
    }

    async fn save_user(&self, user: &UserProfile) -> RepoResult<()> {
        self.store
            .write()
            .await
            .users
            .insert(user.user_id.clone(), user.clone());
        Ok(())
    }

    async fn clear_current_session(&self, user_id: &str, session_id: &str) -> RepoResult<()> {
        if let Some(user) = self.store.write().await.users.get_mut(user_id) {
            if user.current_session.as_deref() == Some(session_id) {
                user.current_session = None;
            }
        }
        Ok(())
    }
}

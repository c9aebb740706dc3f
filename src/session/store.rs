//! Context store: the single writer of session state.
//!
//! Sessions live in memory behind a per-session async mutex and are written
//! through to SQLite so conversations survive server restarts.

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use super::Session;
use crate::llm::Message;

/// Session listing entry for the status API
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub has_subject: bool,
    pub history_len: usize,
    pub updated_at: Option<String>,
}

/// Durable session snapshots backed by SQLite
pub struct SessionDb {
    conn: Connection,
}

impl SessionDb {
    /// Open or create a session database at the given path
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open session store at {:?}", db_path))?;

        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                subject TEXT,
                history TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    /// Load a stored snapshot, if any
    pub fn load(&self, id: &str) -> Result<Option<Session>> {
        let row = self
            .conn
            .query_row(
                "SELECT subject, history FROM sessions WHERE id = ?1",
                params![id],
                |row| Ok((row.get::<_, Option<String>>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        match row {
            Some((subject, history)) => {
                let history: Vec<Message> = serde_json::from_str(&history)
                    .with_context(|| format!("Corrupt history for session {}", id))?;
                Ok(Some(Session { subject, history }))
            }
            None => Ok(None),
        }
    }

    /// Write a snapshot, replacing whatever was stored
    pub fn save(&self, id: &str, session: &Session) -> Result<()> {
        let history = serde_json::to_string(&session.history)
            .context("Failed to serialize history")?;
        let now = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();

        self.conn.execute(
            "INSERT INTO sessions (id, subject, history, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                subject = excluded.subject,
                history = excluded.history,
                updated_at = excluded.updated_at",
            params![id, session.subject, history, now],
        )?;
        Ok(())
    }

    /// List all stored sessions, most recently updated first
    pub fn list(&self) -> Result<Vec<SessionSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, subject IS NOT NULL, history, updated_at
             FROM sessions ORDER BY updated_at DESC, id",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, bool>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            let (id, has_subject, history, updated_at) = row?;
            let history: Vec<Message> = serde_json::from_str(&history)
                .with_context(|| format!("Corrupt history for session {}", id))?;
            summaries.push(SessionSummary {
                id,
                has_subject,
                history_len: history.len(),
                updated_at: Some(updated_at),
            });
        }
        Ok(summaries)
    }
}

pub type SharedSessionDb = Arc<Mutex<SessionDb>>;

type SessionCell = Arc<AsyncMutex<Session>>;

/// Owns every session's state. All mutation goes through here.
pub struct ContextStore {
    sessions: Mutex<HashMap<String, SessionCell>>,
    db: Option<SharedSessionDb>,
    history_cap: usize,
}

impl ContextStore {
    /// Store without durable backing; state is lost when the process exits.
    pub fn in_memory(history_cap: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            db: None,
            history_cap,
        }
    }

    /// Store backed by the SQLite database at `db_path`.
    pub fn open(db_path: &Path, history_cap: usize) -> Result<Self> {
        let db = SessionDb::open(db_path)?;
        Ok(Self {
            sessions: Mutex::new(HashMap::new()),
            db: Some(Arc::new(Mutex::new(db))),
            history_cap,
        })
    }

    pub fn history_cap(&self) -> usize {
        self.history_cap
    }

    fn cell(&self, id: &str) -> Result<SessionCell> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| anyhow!("session map lock poisoned"))?;

        if let Some(cell) = sessions.get(id) {
            return Ok(Arc::clone(cell));
        }

        let initial = match &self.db {
            Some(db) => {
                let db = db.lock().map_err(|_| anyhow!("session db lock poisoned"))?;
                db.load(id)?.unwrap_or_default()
            }
            None => Session::default(),
        };
        debug!(session = id, restored = !initial.is_empty(), "session loaded");

        let cell = Arc::new(AsyncMutex::new(initial));
        sessions.insert(id.to_string(), Arc::clone(&cell));
        Ok(cell)
    }

    /// Take exclusive ownership of a session until the guard is dropped.
    ///
    /// Waits while another turn on the same session holds it.
    pub async fn checkout(&self, id: &str) -> Result<SessionGuard<'_>> {
        let cell = self.cell(id)?;
        let session = cell.lock_owned().await;
        Ok(SessionGuard {
            id: id.to_string(),
            session,
            store: self,
        })
    }

    /// Snapshot of a session, creating an empty one on first sight.
    pub async fn get(&self, id: &str) -> Result<Session> {
        let guard = self.checkout(id).await?;
        Ok(guard.session().clone())
    }

    /// Clear a session to its initial state. Idempotent.
    pub async fn reset(&self, id: &str) -> Result<()> {
        let mut guard = self.checkout(id).await?;
        guard.reset();
        guard.commit()
    }

    pub async fn append_turn(&self, id: &str, user: Message, assistant: Message) -> Result<()> {
        let mut guard = self.checkout(id).await?;
        guard.append_turn(user, assistant);
        guard.commit()
    }

    pub async fn set_subject(&self, id: &str, text: impl Into<String>) -> Result<()> {
        let mut guard = self.checkout(id).await?;
        guard.set_subject(text);
        guard.commit()
    }

    /// Known sessions. With a database this includes sessions from earlier runs.
    pub fn list(&self) -> Result<Vec<SessionSummary>> {
        if let Some(db) = &self.db {
            let db = db.lock().map_err(|_| anyhow!("session db lock poisoned"))?;
            return db.list();
        }

        let sessions = self
            .sessions
            .lock()
            .map_err(|_| anyhow!("session map lock poisoned"))?;
        let mut summaries: Vec<SessionSummary> = sessions
            .iter()
            // a session mid-turn is skipped rather than waited on
            .filter_map(|(id, cell)| {
                cell.try_lock().ok().map(|session| SessionSummary {
                    id: id.clone(),
                    has_subject: session.subject.is_some(),
                    history_len: session.history.len(),
                    updated_at: None,
                })
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(summaries)
    }

    /// Drop an idle session from memory once its guard goes away.
    fn release(&self, id: &str, session: &Session) {
        // without a database the map is the only copy of a non-empty session
        if self.db.is_none() && !session.is_empty() {
            return;
        }
        let Ok(mut sessions) = self.sessions.lock() else {
            return;
        };
        // one reference in the map, one in the departing guard; any more are
        // turns queued on this session
        if sessions.get(id).is_some_and(|cell| Arc::strong_count(cell) <= 2) {
            sessions.remove(id);
            debug!(session = id, "session released");
        }
    }

    #[cfg(test)]
    pub(crate) fn resident_sessions(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or_default()
    }

    fn persist(&self, id: &str, session: &Session) -> Result<()> {
        if let Some(db) = &self.db {
            let db = db.lock().map_err(|_| anyhow!("session db lock poisoned"))?;
            db.save(id, session)?;
        }
        Ok(())
    }
}

/// Exclusive handle on one session for the duration of a turn.
///
/// Mutations apply to memory immediately; `commit` writes the snapshot
/// through to the database. Dropping the guard lets the store forget a
/// session it can reload.
pub struct SessionGuard<'a> {
    id: String,
    session: OwnedMutexGuard<Session>,
    store: &'a ContextStore,
}

impl SessionGuard<'_> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn reset(&mut self) {
        self.session.clear();
    }

    pub fn set_subject(&mut self, text: impl Into<String>) {
        self.session.set_subject(text);
    }

    /// Record a single history entry (the user's side of a turn in flight).
    pub fn record(&mut self, message: Message) {
        let cap = self.store.history_cap;
        self.session.push(message, cap);
    }

    pub fn append_turn(&mut self, user: Message, assistant: Message) {
        let cap = self.store.history_cap;
        self.session.append_turn(user, assistant, cap);
    }

    /// Put back a snapshot taken earlier in the turn.
    pub fn restore(&mut self, snapshot: Session) {
        *self.session = snapshot;
    }

    pub fn commit(&self) -> Result<()> {
        self.store.persist(&self.id, &self.session)
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.store.release(&self.id, &self.session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_get_creates_empty_session() {
        let store = ContextStore::in_memory(6);
        let session = store.get("fresh").await.unwrap();
        assert_eq!(session, Session::default());
    }

    #[tokio::test]
    async fn test_append_turn_truncates_to_cap() {
        let store = ContextStore::in_memory(6);
        store.set_subject("s", "fn main() {}").await.unwrap();
        for i in 0..5 {
            store
                .append_turn("s", Message::user(format!("q{}", i)), Message::assistant(format!("a{}", i)))
                .await
                .unwrap();
        }

        let session = store.get("s").await.unwrap();
        assert_eq!(session.history.len(), 6);
        assert_eq!(session.history[0], Message::user("q2"));
        assert_eq!(session.history[5], Message::assistant("a4"));
    }

    #[tokio::test]
    async fn test_reset_is_idempotent() {
        let store = ContextStore::in_memory(6);
        store.set_subject("s", "code").await.unwrap();
        store
            .append_turn("s", Message::user("q"), Message::assistant("a"))
            .await
            .unwrap();

        store.reset("s").await.unwrap();
        store.reset("s").await.unwrap();
        assert!(store.get("s").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sessions_are_independent() {
        let store = ContextStore::in_memory(6);
        store.set_subject("a", "code a").await.unwrap();
        store.set_subject("b", "code b").await.unwrap();
        store.reset("a").await.unwrap();

        assert!(store.get("a").await.unwrap().subject.is_none());
        assert_eq!(store.get("b").await.unwrap().subject.as_deref(), Some("code b"));
    }

    #[tokio::test]
    async fn test_checkout_serializes_same_session() {
        let store = Arc::new(ContextStore::in_memory(6));
        let guard = store.checkout("s").await.unwrap();

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let guard = store.checkout("s").await.unwrap();
                guard.session().history.len()
            })
        };

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        let mut guard = guard;
        guard.record(Message::user("first"));
        drop(guard);

        assert_eq!(waiter.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_uncommitted_changes_are_not_persisted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        {
            let store = ContextStore::open(&path, 6).unwrap();
            let mut guard = store.checkout("s").await.unwrap();
            guard.set_subject("draft");
        }

        let reopened = ContextStore::open(&path, 6).unwrap();
        assert!(reopened.get("s").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sessions_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        {
            let store = ContextStore::open(&path, 6).unwrap();
            store.set_subject("s", "fn main() {}").await.unwrap();
            store
                .append_turn("s", Message::user("why?"), Message::assistant("because"))
                .await
                .unwrap();
        }

        let reopened = ContextStore::open(&path, 6).unwrap();
        let session = reopened.get("s").await.unwrap();
        assert_eq!(session.subject.as_deref(), Some("fn main() {}"));
        assert_eq!(
            session.history,
            vec![Message::user("why?"), Message::assistant("because")]
        );

        let listed = reopened.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "s");
        assert!(listed[0].has_subject);
        assert_eq!(listed[0].history_len, 2);
    }

    #[tokio::test]
    async fn test_in_memory_list() {
        let store = ContextStore::in_memory(6);
        store.set_subject("b", "x").await.unwrap();
        store
            .append_turn("a", Message::user("q"), Message::assistant("a"))
            .await
            .unwrap();

        let listed = store.list().unwrap();
        let ids: Vec<&str> = listed.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(!listed[0].has_subject);
        assert!(listed[1].has_subject);
    }

    #[tokio::test]
    async fn test_durable_sessions_leave_memory_after_use() {
        let dir = tempdir().unwrap();
        let store = ContextStore::open(&dir.path().join("sessions.db"), 6).unwrap();

        store.set_subject("s", "fn main() {}").await.unwrap();
        store
            .append_turn("s", Message::user("why?"), Message::assistant("because"))
            .await
            .unwrap();
        store.get("never-seen").await.unwrap();
        assert_eq!(store.resident_sessions(), 0);

        let session = store.get("s").await.unwrap();
        assert_eq!(session.subject.as_deref(), Some("fn main() {}"));
        assert_eq!(session.history.len(), 2);
        assert_eq!(store.resident_sessions(), 0);
    }

    #[tokio::test]
    async fn test_in_memory_store_keeps_only_non_empty_sessions() {
        let store = ContextStore::in_memory(6);
        store.set_subject("s", "code").await.unwrap();
        store.get("ghost").await.unwrap();
        assert_eq!(store.resident_sessions(), 1);

        store.reset("s").await.unwrap();
        assert_eq!(store.resident_sessions(), 0);
    }

    #[tokio::test]
    async fn test_queued_turn_keeps_session_resident() {
        let dir = tempdir().unwrap();
        let store = Arc::new(ContextStore::open(&dir.path().join("sessions.db"), 6).unwrap());
        let mut guard = store.checkout("s").await.unwrap();

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let guard = store.checkout("s").await.unwrap();
                guard.session().history.len()
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        // uncommitted, so only the shared cell carries it to the waiter
        guard.record(Message::user("first"));
        drop(guard);
        assert_eq!(waiter.await.unwrap(), 1);
        assert_eq!(store.resident_sessions(), 0);
    }

    #[test]
    fn test_list_rejects_corrupt_history() {
        let dir = tempdir().unwrap();
        let db = SessionDb::open(&dir.path().join("sessions.db")).unwrap();
        db.save("good", &Session::default()).unwrap();
        db.conn
            .execute(
                "INSERT INTO sessions (id, subject, history, updated_at)
                 VALUES ('bad', NULL, 'not json', '2026-01-01T00:00:00Z')",
                [],
            )
            .unwrap();

        let err = db.list().unwrap_err();
        assert!(err.to_string().contains("Corrupt history for session bad"));
        assert!(db.load("bad").is_err());
    }
}

use crate::auth::{digest_password, validate_credentials, IdentityProvider};
use crate::errors::{AppError, AppResult};
use crate::models::{
    Priority, Quadrant, Task, TaskDocument, TaskPatch, TaskStatus, UserProfile,
};
use crate::store::{FeedEvent, TaskBackend, TaskFeed, Unsubscribe};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Local stand-in for the managed document service: one SQLite file holding
/// task documents and user records, plus an in-process watcher registry that
/// pushes the full per-owner snapshot after every mutation.
#[derive(Debug)]
pub struct LocalBackend {
    conn: Mutex<Connection>,
    watchers: WatcherRegistry,
}

impl LocalBackend {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;
        Ok(Self {
            conn: Mutex::new(conn),
            watchers: WatcherRegistry::default(),
        })
    }

    fn snapshot_for(&self, owner_id: &str) -> AppResult<Vec<Task>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, title, description, deadline, priority, status,
                    attachments_json, quadrant, created_at, updated_at, completed_at
             FROM tasks WHERE user_id = ?1
             ORDER BY created_at DESC, rowid DESC",
        )?;
        let tasks = stmt
            .query_map([owner_id], parse_task_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    fn owner_of(&self, task_id: &str) -> AppResult<Option<String>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        conn.query_row(
            "SELECT user_id FROM tasks WHERE id = ?1",
            [task_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn task_by_id(&self, task_id: &str) -> AppResult<Option<Task>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        conn.query_row(
            "SELECT id, user_id, title, description, deadline, priority, status,
                    attachments_json, quadrant, created_at, updated_at, completed_at
             FROM tasks WHERE id = ?1",
            [task_id],
            parse_task_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn tasks_for_owner(&self, owner_id: &str) -> AppResult<Vec<Task>> {
        self.snapshot_for(owner_id)
    }

    /// A failed snapshot query degrades to an empty push plus a failure
    /// event; the mutation that triggered it has already committed.
    fn publish(&self, owner_id: &str) {
        match self.snapshot_for(owner_id) {
            Ok(tasks) => self.watchers.push(owner_id, FeedEvent::Snapshot(tasks)),
            Err(error) => {
                tracing::warn!(owner_id = %owner_id, error = %error, "task snapshot query failed");
                self.watchers.push(owner_id, FeedEvent::Snapshot(Vec::new()));
                self.watchers.push(
                    owner_id,
                    FeedEvent::Failed {
                        message: error.to_string(),
                    },
                );
            }
        }
    }
}

impl TaskBackend for LocalBackend {
    async fn insert_task(&self, document: TaskDocument) -> AppResult<Task> {
        let task_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let attachments_json = serde_json::to_string(&document.attachments)?;
        {
            let conn = self
                .conn
                .lock()
                .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
            conn.execute(
                "INSERT INTO tasks (
                   id, user_id, title, description, deadline, priority, status,
                   attachments_json, quadrant, created_at, updated_at, completed_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10, NULL)",
                params![
                    task_id,
                    document.user_id,
                    document.title,
                    document.description,
                    document.deadline.map(|at| at.to_rfc3339()),
                    document.priority.as_str(),
                    document.status.as_str(),
                    attachments_json,
                    document.quadrant.map(Quadrant::as_str),
                    now.to_rfc3339(),
                ],
            )?;
        }
        self.publish(&document.user_id);

        Ok(Task {
            task_id,
            user_id: document.user_id,
            title: document.title,
            description: document.description,
            deadline: document.deadline,
            priority: document.priority,
            status: document.status,
            attachments: document.attachments,
            quadrant: document.quadrant,
            created_at: now,
            updated_at: now,
            completed_at: None,
        })
    }

    async fn update_task(&self, task_id: &str, patch: TaskPatch) -> AppResult<()> {
        let now = Utc::now();
        let changed = {
            let conn = self
                .conn
                .lock()
                .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;

            let mut sets: Vec<&str> = vec!["updated_at = ?"];
            let mut values: Vec<Option<String>> = vec![Some(now.to_rfc3339())];
            if let Some(title) = &patch.title {
                sets.push("title = ?");
                values.push(Some(title.clone()));
            }
            if let Some(description) = &patch.description {
                sets.push("description = ?");
                values.push(description.clone());
            }
            if let Some(deadline) = &patch.deadline {
                sets.push("deadline = ?");
                values.push(deadline.map(|at| at.to_rfc3339()));
            }
            if let Some(priority) = patch.priority {
                sets.push("priority = ?");
                values.push(Some(priority.as_str().to_string()));
            }
            if let Some(attachments) = &patch.attachments {
                sets.push("attachments_json = ?");
                values.push(Some(serde_json::to_string(attachments)?));
            }

            let query = format!("UPDATE tasks SET {} WHERE id = ?", sets.join(", "));
            values.push(Some(task_id.to_string()));
            conn.execute(&query, rusqlite::params_from_iter(values.iter()))?
        };
        if changed == 0 {
            return Err(AppError::NotFound(format!("Task {} does not exist", task_id)));
        }
        if let Some(owner) = self.owner_of(task_id)? {
            self.publish(&owner);
        }
        Ok(())
    }

    async fn delete_task(&self, task_id: &str) -> AppResult<()> {
        let owner = self.owner_of(task_id)?;
        {
            let conn = self
                .conn
                .lock()
                .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
            conn.execute("DELETE FROM tasks WHERE id = ?1", [task_id])?;
        }
        if let Some(owner) = owner {
            self.publish(&owner);
        }
        Ok(())
    }

    async fn complete_task(&self, task_id: &str) -> AppResult<()> {
        let now = Utc::now().to_rfc3339();
        let changed = {
            let conn = self
                .conn
                .lock()
                .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
            conn.execute(
                "UPDATE tasks SET status = 'done', completed_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND status <> 'done'",
                params![now, task_id],
            )?
        };
        if changed == 0 {
            // Either missing, or already done and left untouched.
            if self.owner_of(task_id)?.is_none() {
                return Err(AppError::NotFound(format!("Task {} does not exist", task_id)));
            }
            return Ok(());
        }
        if let Some(owner) = self.owner_of(task_id)? {
            self.publish(&owner);
        }
        Ok(())
    }

    fn subscribe_owner(&self, owner_id: &str) -> AppResult<TaskFeed> {
        let (watcher_id, receiver) = self.watchers.open(owner_id)?;
        let registry = self.watchers.clone();
        let feed = TaskFeed::new(
            receiver,
            Unsubscribe::new(move || registry.close(watcher_id)),
        );
        match self.snapshot_for(owner_id) {
            Ok(tasks) => self.watchers.send_to(watcher_id, FeedEvent::Snapshot(tasks)),
            Err(error) => {
                tracing::warn!(owner_id = %owner_id, error = %error, "initial task snapshot failed");
                self.watchers
                    .send_to(watcher_id, FeedEvent::Snapshot(Vec::new()));
                self.watchers.send_to(
                    watcher_id,
                    FeedEvent::Failed {
                        message: error.to_string(),
                    },
                );
            }
        }
        Ok(feed)
    }
}

impl IdentityProvider for LocalBackend {
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        display_name: Option<&str>,
    ) -> AppResult<UserProfile> {
        let email = validate_credentials(email, password)?;
        let id = Uuid::new_v4().to_string();
        let digest = digest_password(password);
        let display_name = display_name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(ToString::to_string);

        let conn = self
            .conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let exists = conn
            .query_row(
                "SELECT COUNT(1) FROM users WHERE email = ?1",
                [email.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .unwrap_or(0)
            > 0;
        if exists {
            return Err(AppError::Auth(format!("Email {} is already registered", email)));
        }
        conn.execute(
            "INSERT INTO users (id, email, display_name, password_digest, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, email, display_name, digest, Utc::now().to_rfc3339()],
        )?;

        Ok(UserProfile {
            id,
            email,
            display_name,
        })
    }

    async fn sign_in(&self, email: &str, password: &str) -> AppResult<UserProfile> {
        let email = email.trim().to_ascii_lowercase();
        let conn = self
            .conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let row = conn
            .query_row(
                "SELECT id, display_name, password_digest FROM users WHERE email = ?1",
                [email.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        // One message for both unknown email and bad password.
        let Some((id, display_name, stored_digest)) = row else {
            return Err(AppError::Auth("Invalid email or password".to_string()));
        };
        if digest_password(password) != stored_digest {
            return Err(AppError::Auth("Invalid email or password".to_string()));
        }

        Ok(UserProfile {
            id,
            email,
            display_name,
        })
    }

    async fn sign_out(&self) -> AppResult<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct Watcher {
    owner_id: String,
    sender: mpsc::UnboundedSender<FeedEvent>,
}

#[derive(Debug, Clone, Default)]
struct WatcherRegistry {
    watchers: Arc<Mutex<HashMap<u64, Watcher>>>,
    next_id: Arc<AtomicU64>,
}

impl WatcherRegistry {
    fn open(&self, owner_id: &str) -> AppResult<(u64, mpsc::UnboundedReceiver<FeedEvent>)> {
        let watcher_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut watchers = self
            .watchers
            .lock()
            .map_err(|_| AppError::Internal("watcher registry mutex poisoned".to_string()))?;
        watchers.insert(
            watcher_id,
            Watcher {
                owner_id: owner_id.to_string(),
                sender,
            },
        );
        Ok((watcher_id, receiver))
    }

    fn close(&self, watcher_id: u64) {
        if let Ok(mut watchers) = self.watchers.lock() {
            watchers.remove(&watcher_id);
        }
    }

    fn send_to(&self, watcher_id: u64, event: FeedEvent) {
        let Ok(watchers) = self.watchers.lock() else {
            return;
        };
        if let Some(watcher) = watchers.get(&watcher_id) {
            let _ = watcher.sender.send(event);
        }
    }

    fn push(&self, owner_id: &str, event: FeedEvent) {
        let Ok(mut watchers) = self.watchers.lock() else {
            return;
        };
        let mut closed = Vec::new();
        for (id, watcher) in watchers.iter() {
            if watcher.owner_id == owner_id && watcher.sender.send(event.clone()).is_err() {
                closed.push(*id);
            }
        }
        for id in closed {
            watchers.remove(&id);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.watchers.lock().map(|watchers| watchers.len()).unwrap_or(0)
    }
}

fn parse_task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let attachments_raw: String = row.get(7)?;
    Ok(Task {
        task_id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        deadline: row
            .get::<_, Option<String>>(4)?
            .and_then(|raw| parse_time_lenient(&raw)),
        priority: parse_priority(&row.get::<_, String>(5)?),
        status: parse_status(&row.get::<_, String>(6)?),
        attachments: serde_json::from_str(&attachments_raw).unwrap_or_default(),
        quadrant: row
            .get::<_, Option<String>>(8)?
            .and_then(|raw| parse_quadrant(&raw)),
        created_at: parse_time_or_now(&row.get::<_, String>(9)?),
        updated_at: parse_time_or_now(&row.get::<_, String>(10)?),
        completed_at: row
            .get::<_, Option<String>>(11)?
            .and_then(|raw| parse_time_lenient(&raw)),
    })
}

fn parse_priority(raw: &str) -> Priority {
    match raw {
        "Low" => Priority::Low,
        "High" => Priority::High,
        _ => Priority::Medium,
    }
}

fn parse_status(raw: &str) -> TaskStatus {
    match raw {
        "done" => TaskStatus::Done,
        _ => TaskStatus::Open,
    }
}

fn parse_quadrant(raw: &str) -> Option<Quadrant> {
    match raw {
        "urgent-important" => Some(Quadrant::UrgentImportant),
        "not-urgent-important" => Some(Quadrant::NotUrgentImportant),
        "urgent-not-important" => Some(Quadrant::UrgentNotImportant),
        "not-urgent-not-important" => Some(Quadrant::NotUrgentNotImportant),
        other => {
            tracing::warn!(raw = %other, "unknown quadrant value ignored");
            None
        }
    }
}

fn parse_time_lenient(raw: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(parsed) => Some(parsed.with_timezone(&Utc)),
        Err(error) => {
            tracing::warn!(raw = %raw, error = %error, "malformed timestamp treated as absent");
            None
        }
    }
}

fn parse_time_or_now(raw: &str) -> DateTime<Utc> {
    parse_time_lenient(raw).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CreateTaskPayload;
    use crate::store::TaskStore;

    fn open_backend(dir: &tempfile::TempDir) -> LocalBackend {
        LocalBackend::new(&dir.path().join("tasks.db")).expect("backend")
    }

    fn document(owner: &str, title: &str) -> TaskDocument {
        TaskDocument {
            user_id: owner.to_string(),
            title: title.to_string(),
            description: None,
            deadline: None,
            priority: Priority::Medium,
            status: TaskStatus::Open,
            attachments: Vec::new(),
            quadrant: None,
        }
    }

    #[tokio::test]
    async fn insert_assigns_id_and_server_timestamps() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = open_backend(&dir);

        let task = backend
            .insert_task(document("user-1", "Pay rent"))
            .await
            .expect("insert");
        assert!(!task.task_id.is_empty());
        assert_eq!(task.created_at, task.updated_at);

        let snapshot = backend.snapshot_for("user-1").expect("snapshot");
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].title, "Pay rent");
    }

    #[tokio::test]
    async fn update_merges_fields_and_refreshes_updated_at() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = open_backend(&dir);

        let mut doc = document("user-1", "Write report");
        doc.deadline = Some(Utc::now());
        doc.description = Some("first draft".to_string());
        let task = backend.insert_task(doc).await.expect("insert");

        backend
            .update_task(
                &task.task_id,
                TaskPatch {
                    title: Some("Write final report".to_string()),
                    deadline: Some(None),
                    ..TaskPatch::default()
                },
            )
            .await
            .expect("update");

        let snapshot = backend.snapshot_for("user-1").expect("snapshot");
        assert_eq!(snapshot[0].title, "Write final report");
        assert!(snapshot[0].deadline.is_none());
        assert_eq!(snapshot[0].description.as_deref(), Some("first draft"));
        assert!(snapshot[0].updated_at >= task.updated_at);

        let missing = backend
            .update_task("no-such-task", TaskPatch::default())
            .await;
        assert!(matches!(missing, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_silent_on_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = open_backend(&dir);

        let task = backend
            .insert_task(document("user-1", "Disposable"))
            .await
            .expect("insert");
        backend.delete_task(&task.task_id).await.expect("delete");
        backend
            .delete_task(&task.task_id)
            .await
            .expect("second delete");
        backend
            .delete_task("never-existed")
            .await
            .expect("missing delete");
        assert!(backend.snapshot_for("user-1").expect("snapshot").is_empty());
    }

    #[tokio::test]
    async fn complete_never_regresses_completed_at() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = open_backend(&dir);

        let task = backend
            .insert_task(document("user-1", "One-way door"))
            .await
            .expect("insert");
        backend.complete_task(&task.task_id).await.expect("complete");

        let first = backend.snapshot_for("user-1").expect("snapshot")[0].clone();
        assert_eq!(first.status, TaskStatus::Done);
        let stamp = first.completed_at.expect("completed_at set");

        backend
            .complete_task(&task.task_id)
            .await
            .expect("second complete");
        let second = backend.snapshot_for("user-1").expect("snapshot")[0].clone();
        assert_eq!(second.completed_at, Some(stamp));
        assert_eq!(second.updated_at, first.updated_at);

        let missing = backend.complete_task("no-such-task").await;
        assert!(matches!(missing, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn watchers_receive_pushes_and_are_pruned_after_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = Arc::new(open_backend(&dir));
        let store = TaskStore::new(Arc::clone(&backend));

        let mut feed = store.subscribe_by_owner(Some("user-1")).expect("subscribe");
        match feed.next_event().await {
            Some(FeedEvent::Snapshot(tasks)) => assert!(tasks.is_empty()),
            _ => panic!("expected initial snapshot"),
        }

        store
            .create(
                "user-1",
                CreateTaskPayload {
                    title: "Buy milk".to_string(),
                    description: None,
                    deadline: None,
                    priority: None,
                    attachments: Vec::new(),
                    quadrant: None,
                },
            )
            .await
            .expect("create");
        match feed.next_event().await {
            Some(FeedEvent::Snapshot(tasks)) => assert_eq!(tasks.len(), 1),
            _ => panic!("expected snapshot after create"),
        }

        assert_eq!(backend.watchers.len(), 1);
        drop(feed);
        assert_eq!(backend.watchers.len(), 0);

        // No watcher left; the mutation must still succeed.
        store
            .create(
                "user-1",
                CreateTaskPayload {
                    title: "Buy bread".to_string(),
                    description: None,
                    deadline: None,
                    priority: None,
                    attachments: Vec::new(),
                    quadrant: None,
                },
            )
            .await
            .expect("create without watchers");
    }

    #[tokio::test]
    async fn other_owners_do_not_see_foreign_snapshots() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = Arc::new(open_backend(&dir));

        let mut feed_a = backend.subscribe_owner("user-a").expect("subscribe a");
        let mut feed_b = backend.subscribe_owner("user-b").expect("subscribe b");
        assert!(matches!(
            feed_a.next_event().await,
            Some(FeedEvent::Snapshot(_))
        ));
        assert!(matches!(
            feed_b.next_event().await,
            Some(FeedEvent::Snapshot(_))
        ));

        backend
            .insert_task(document("user-a", "Only for a"))
            .await
            .expect("insert");

        match feed_a.next_event().await {
            Some(FeedEvent::Snapshot(tasks)) => assert_eq!(tasks.len(), 1),
            _ => panic!("expected snapshot for owner a"),
        }
        // Owner b got nothing beyond the initial snapshot.
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            feed_b.next_event(),
        )
        .await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn malformed_stored_timestamps_degrade_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = open_backend(&dir);

        let task = backend
            .insert_task(document("user-1", "Corrupted row"))
            .await
            .expect("insert");
        {
            let conn = backend.conn.lock().expect("db lock");
            conn.execute(
                "UPDATE tasks SET deadline = 'not-a-time' WHERE id = ?1",
                [task.task_id.as_str()],
            )
            .expect("corrupt deadline");
        }

        let snapshot = backend.snapshot_for("user-1").expect("snapshot");
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].deadline.is_none());
    }

    #[tokio::test]
    async fn sign_up_and_sign_in_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = open_backend(&dir);

        let profile = backend
            .sign_up("Ada@Example.com", "hunter22", Some("Ada"))
            .await
            .expect("sign up");
        assert_eq!(profile.email, "ada@example.com");
        assert_eq!(profile.display_name.as_deref(), Some("Ada"));

        let duplicate = backend.sign_up("ada@example.com", "hunter22", None).await;
        assert!(matches!(duplicate, Err(AppError::Auth(_))));

        let wrong = backend.sign_in("ada@example.com", "wrong-pass").await;
        assert!(matches!(wrong, Err(AppError::Auth(_))));
        let unknown = backend.sign_in("nobody@example.com", "hunter22").await;
        assert!(matches!(unknown, Err(AppError::Auth(_))));

        let signed_in = backend
            .sign_in("ada@example.com", "hunter22")
            .await
            .expect("sign in");
        assert_eq!(signed_in.id, profile.id);
    }
}

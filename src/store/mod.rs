use crate::errors::{AppError, AppResult};
use crate::models::{
    CreateTaskPayload, Task, TaskDocument, TaskPatch, TaskStatus, UpdateTaskPayload,
};
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub enum FeedEvent {
    Snapshot(Vec<Task>),
    Failed { message: String },
}

/// Releases a task subscription when invoked or dropped.
pub struct Unsubscribe(Option<Box<dyn FnOnce() + Send>>);

impl Unsubscribe {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(release)))
    }

    pub fn no_op() -> Self {
        Self(None)
    }

    pub fn release(mut self) {
        if let Some(release) = self.0.take() {
            release();
        }
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        if let Some(release) = self.0.take() {
            release();
        }
    }
}

/// Stream of full task snapshots for one owner. Snapshots are delivered in
/// `created_at`-descending order; dropping the feed unsubscribes.
pub struct TaskFeed {
    events: mpsc::UnboundedReceiver<FeedEvent>,
    handle: Option<Unsubscribe>,
}

impl TaskFeed {
    pub fn new(events: mpsc::UnboundedReceiver<FeedEvent>, handle: Unsubscribe) -> Self {
        Self {
            events,
            handle: Some(handle),
        }
    }

    /// Feed for an absent owner: one empty snapshot, then the feed closes.
    pub fn empty() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let _ = sender.send(FeedEvent::Snapshot(Vec::new()));
        Self {
            events: receiver,
            handle: None,
        }
    }

    pub async fn next_event(&mut self) -> Option<FeedEvent> {
        match self.events.recv().await {
            Some(FeedEvent::Snapshot(mut tasks)) => {
                sort_snapshot(&mut tasks);
                Some(FeedEvent::Snapshot(tasks))
            }
            other => other,
        }
    }

    /// Bounded wait for the first snapshot. Falls through to an empty
    /// snapshot plus an error string instead of blocking indefinitely.
    pub async fn first_snapshot(&mut self, wait: Duration) -> (Vec<Task>, Option<String>) {
        match tokio::time::timeout(wait, self.next_event()).await {
            Ok(Some(FeedEvent::Snapshot(tasks))) => (tasks, None),
            Ok(Some(FeedEvent::Failed { message })) => (Vec::new(), Some(message)),
            Ok(None) => (
                Vec::new(),
                Some("task feed closed before the first snapshot".to_string()),
            ),
            Err(_) => (
                Vec::new(),
                Some(format!(
                    "no snapshot within {} ms",
                    wait.as_millis()
                )),
            ),
        }
    }

    pub fn unsubscribe(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.release();
        }
    }
}

fn sort_snapshot(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

/// External document-service boundary. The backend assigns ids and all
/// server-side timestamps; callers never stamp time themselves.
pub trait TaskBackend: Send + Sync {
    fn insert_task(&self, document: TaskDocument) -> impl Future<Output = AppResult<Task>> + Send;
    fn update_task(
        &self,
        task_id: &str,
        patch: TaskPatch,
    ) -> impl Future<Output = AppResult<()>> + Send;
    /// Idempotent: deleting a missing task succeeds silently.
    fn delete_task(&self, task_id: &str) -> impl Future<Output = AppResult<()>> + Send;
    /// Idempotent: completing a done task leaves `completed_at` untouched.
    fn complete_task(&self, task_id: &str) -> impl Future<Output = AppResult<()>> + Send;
    fn subscribe_owner(&self, owner_id: &str) -> AppResult<TaskFeed>;
}

pub struct TaskStore<B: TaskBackend> {
    backend: Arc<B>,
}

impl<B: TaskBackend> Clone for TaskStore<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: TaskBackend> TaskStore<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    pub async fn create(&self, owner_id: &str, payload: CreateTaskPayload) -> AppResult<Task> {
        if payload.title.trim().is_empty() {
            return Err(AppError::Validation("Task title cannot be empty".to_string()));
        }
        let deadline = payload.deadline.as_deref().and_then(normalize_deadline);
        let document = TaskDocument {
            user_id: owner_id.to_string(),
            title: payload.title,
            description: payload.description.and_then(non_empty),
            deadline,
            priority: payload.priority.unwrap_or_default(),
            status: TaskStatus::Open,
            attachments: payload.attachments,
            quadrant: payload.quadrant,
        };
        self.backend.insert_task(document).await
    }

    pub async fn update(&self, task_id: &str, payload: UpdateTaskPayload) -> AppResult<()> {
        let mut patch = TaskPatch::default();
        if let Some(title) = payload.title {
            if title.trim().is_empty() {
                return Err(AppError::Validation("Task title cannot be empty".to_string()));
            }
            patch.title = Some(title);
        }
        if let Some(description) = payload.description {
            patch.description = Some(non_empty(description));
        }
        if let Some(raw) = payload.deadline {
            // A carried deadline always overwrites; unparseable or empty clears.
            patch.deadline = Some(normalize_deadline(&raw));
        }
        if let Some(priority) = payload.priority {
            patch.priority = Some(priority);
        }
        if let Some(attachments) = payload.attachments {
            patch.attachments = Some(attachments);
        }
        self.backend.update_task(task_id, patch).await
    }

    pub async fn delete(&self, task_id: &str) -> AppResult<()> {
        self.backend.delete_task(task_id).await
    }

    pub async fn complete(&self, task_id: &str) -> AppResult<()> {
        self.backend.complete_task(task_id).await
    }

    pub fn subscribe_by_owner(&self, owner_id: Option<&str>) -> AppResult<TaskFeed> {
        match owner_id {
            Some(owner) => self.backend.subscribe_owner(owner),
            None => Ok(TaskFeed::empty()),
        }
    }
}

/// Accepts RFC 3339, the HTML `datetime-local` forms, and bare dates
/// (interpreted in local time). Anything else counts as "no deadline".
pub fn normalize_deadline(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return local_to_utc(naive);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).and_then(local_to_utc);
    }
    tracing::warn!(raw = %trimmed, "unparseable deadline treated as absent");
    None
}

fn local_to_utc(naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Attachment, Priority, Quadrant};

    fn snapshot_task(task_id: &str, created_at: DateTime<Utc>) -> Task {
        Task {
            task_id: task_id.to_string(),
            user_id: "user-1".to_string(),
            title: format!("task {}", task_id),
            description: None,
            deadline: None,
            priority: Priority::Medium,
            status: TaskStatus::Open,
            attachments: Vec::new(),
            quadrant: None,
            created_at,
            updated_at: created_at,
            completed_at: None,
        }
    }

    #[test]
    fn normalize_deadline_accepts_common_forms() {
        let rfc = normalize_deadline("2025-06-10T14:30:00Z").expect("rfc3339");
        assert_eq!(rfc, Utc.with_ymd_and_hms(2025, 6, 10, 14, 30, 0).unwrap());

        assert!(normalize_deadline("2025-06-10T14:30").is_some());
        assert!(normalize_deadline("2025-06-10").is_some());
        assert!(normalize_deadline("").is_none());
        assert!(normalize_deadline("   ").is_none());
        assert!(normalize_deadline("next tuesday").is_none());
    }

    #[tokio::test]
    async fn empty_feed_pushes_one_snapshot_then_closes() {
        let mut feed = TaskFeed::empty();
        match feed.next_event().await {
            Some(FeedEvent::Snapshot(tasks)) => assert!(tasks.is_empty()),
            other => panic!("expected empty snapshot, got {:?}", other.is_some()),
        }
        assert!(feed.next_event().await.is_none());
    }

    #[tokio::test]
    async fn feed_delivers_snapshots_sorted_by_created_at_descending() {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut feed = TaskFeed::new(receiver, Unsubscribe::no_op());

        let older = snapshot_task("a", Utc.with_ymd_and_hms(2025, 1, 1, 8, 0, 0).unwrap());
        let newer = snapshot_task("b", Utc.with_ymd_and_hms(2025, 1, 2, 8, 0, 0).unwrap());
        sender
            .send(FeedEvent::Snapshot(vec![older, newer]))
            .expect("send");

        match feed.next_event().await {
            Some(FeedEvent::Snapshot(tasks)) => {
                assert_eq!(tasks[0].task_id, "b");
                assert_eq!(tasks[1].task_id, "a");
            }
            _ => panic!("expected snapshot"),
        }
    }

    #[tokio::test]
    async fn first_snapshot_times_out_to_empty_with_error() {
        let (_sender, receiver) = mpsc::unbounded_channel();
        let mut feed = TaskFeed::new(receiver, Unsubscribe::no_op());

        let (tasks, error) = feed.first_snapshot(Duration::from_millis(50)).await;
        assert!(tasks.is_empty());
        assert!(error.is_some());
    }

    #[tokio::test]
    async fn failed_event_carries_message_after_empty_snapshot() {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut feed = TaskFeed::new(receiver, Unsubscribe::no_op());

        sender.send(FeedEvent::Snapshot(Vec::new())).expect("send");
        sender
            .send(FeedEvent::Failed {
                message: "listener detached".to_string(),
            })
            .expect("send");

        let (tasks, error) = feed.first_snapshot(Duration::from_millis(50)).await;
        assert!(tasks.is_empty());
        assert!(error.is_none());
        match feed.next_event().await {
            Some(FeedEvent::Failed { message }) => assert_eq!(message, "listener detached"),
            _ => panic!("expected failure event"),
        }
    }

    #[test]
    fn unsubscribe_runs_release_closure_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let handle = Unsubscribe::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        handle.release();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let seen = Arc::clone(&calls);
        {
            let _dropped = Unsubscribe::new(move || {
                seen.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn create_payload_keeps_attachments_and_quadrant() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = Arc::new(crate::db::LocalBackend::new(&dir.path().join("tasks.db")).expect("backend"));
        let store = TaskStore::new(backend);

        let blank = store
            .create(
                "user-1",
                CreateTaskPayload {
                    title: "   ".to_string(),
                    description: None,
                    deadline: None,
                    priority: None,
                    attachments: Vec::new(),
                    quadrant: None,
                },
            )
            .await;
        assert!(matches!(blank, Err(AppError::Validation(_))));

        let task = store
            .create(
                "user-1",
                CreateTaskPayload {
                    title: "Pay rent".to_string(),
                    description: Some("before noon".to_string()),
                    deadline: Some("2025-06-10T09:00:00Z".to_string()),
                    priority: None,
                    attachments: vec![Attachment::Persisted {
                        reference: "attachment://abc".to_string(),
                        name: "lease.pdf".to_string(),
                        mime_type: "application/pdf".to_string(),
                        size: 4,
                    }],
                    quadrant: Some(Quadrant::UrgentImportant),
                },
            )
            .await
            .expect("create");

        assert!(!task.task_id.is_empty());
        assert_eq!(task.priority, Priority::Medium);
        assert_eq!(task.status, TaskStatus::Open);
        assert_eq!(task.attachments.len(), 1);
        assert_eq!(task.quadrant, Some(Quadrant::UrgentImportant));
        assert!(task.deadline.is_some());
        assert!(task.completed_at.is_none());
    }
}

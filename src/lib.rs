pub mod attachments;
pub mod auth;
pub mod classifier;
pub mod db;
pub mod errors;
pub mod insights;
pub mod kv;
pub mod models;
pub mod reminders;
pub mod store;

pub use crate::attachments::{DownloadedFile, ResolvedAttachment, ValidationOutcome};
pub use crate::auth::IdentityProvider;
pub use crate::classifier::{ClassifierFlow, ClassifierState};
pub use crate::db::LocalBackend;
pub use crate::errors::{AppError, AppResult};
pub use crate::kv::KvStore;
pub use crate::models::{
    AppSettings, Attachment, CreateTaskPayload, FileUpload, Horizon, OverallStats, Priority,
    Quadrant, RejectReason, RejectedFile, Reminder, Task, TaskStatus, TodayStats,
    UpdateTaskPayload, UserProfile, WorkloadAdvice,
};
pub use crate::reminders::{LogSink, ReminderConfig, ReminderScheduler, ReminderSink, ReminderTask};
pub use crate::store::{FeedEvent, TaskBackend, TaskFeed, TaskStore, Unsubscribe};

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

pub fn init_tracing(app_data_dir: &Path) -> AppResult<()> {
    let log_dir = app_data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).map_err(|error| AppError::Io(error.to_string()))?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "smart-todo.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| AppError::Internal(error.to_string()))
}

/// Composition root: the local backend, the attachment side-channel, the
/// quadrant classifier gate and the reminder machinery, scoped to one
/// signed-in user at a time.
#[derive(Clone)]
pub struct TodoCore {
    backend: Arc<LocalBackend>,
    store: TaskStore<LocalBackend>,
    kv: KvStore,
    scheduler: ReminderScheduler,
    classifier: Arc<StdMutex<ClassifierFlow>>,
    current_user: Arc<RwLock<Option<UserProfile>>>,
    task_pump: Arc<StdMutex<Option<JoinHandle<()>>>>,
    reminder_task: Arc<StdMutex<Option<ReminderTask>>>,
    app_data_dir: PathBuf,
}

impl TodoCore {
    pub fn new(app_data_dir: PathBuf) -> AppResult<Arc<Self>> {
        let backend = Arc::new(LocalBackend::new(&app_data_dir.join("tasks.db"))?);
        let kv = KvStore::open(&app_data_dir.join("sidecar.db"))?;

        let settings = match kv.get_settings() {
            Ok(settings) => settings,
            Err(error) => {
                tracing::warn!(error = %error, "failed to load settings; using defaults");
                AppSettings::default()
            }
        };
        kv.set_capacity_bytes(settings.sidecar_capacity_bytes);

        let scheduler = ReminderScheduler::new(
            kv.clone(),
            Arc::new(LogSink),
            ReminderConfig::from_settings(&settings),
        );
        let store = TaskStore::new(Arc::clone(&backend));

        Ok(Arc::new(Self {
            backend,
            store,
            kv,
            scheduler,
            classifier: Arc::new(StdMutex::new(ClassifierFlow::new())),
            current_user: Arc::new(RwLock::new(None)),
            task_pump: Arc::new(StdMutex::new(None)),
            reminder_task: Arc::new(StdMutex::new(None)),
            app_data_dir,
        }))
    }

    pub fn data_dir(&self) -> &Path {
        &self.app_data_dir
    }

    /// Starts the reminder poll loop. Replacing an already-running loop
    /// aborts the previous one.
    pub fn start_reminders(&self) {
        let task = self.scheduler.start();
        if let Ok(mut slot) = self.reminder_task.lock() {
            *slot = Some(task);
        }
    }

    pub fn stop_reminders(&self) {
        if let Ok(mut slot) = self.reminder_task.lock() {
            *slot = None;
        }
    }

    // ─── Identity ───────────────────────────────────────────────────────────

    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        display_name: Option<&str>,
    ) -> AppResult<UserProfile> {
        let profile = self.backend.sign_up(email, password, display_name).await?;
        self.enter_session(profile.clone()).await?;
        Ok(profile)
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> AppResult<UserProfile> {
        let profile = self.backend.sign_in(email, password).await?;
        self.enter_session(profile.clone()).await?;
        Ok(profile)
    }

    pub async fn sign_out(&self) -> AppResult<()> {
        self.backend.sign_out().await?;
        self.stop_task_pump();
        *self.current_user.write().await = None;
        self.scheduler.update_tasks(Vec::new()).await;
        Ok(())
    }

    pub async fn current_user(&self) -> Option<UserProfile> {
        self.current_user.read().await.clone()
    }

    async fn enter_session(&self, profile: UserProfile) -> AppResult<()> {
        let feed = self.backend.subscribe_owner(&profile.id)?;
        *self.current_user.write().await = Some(profile);
        self.restart_task_pump(feed);
        Ok(())
    }

    fn restart_task_pump(&self, mut feed: TaskFeed) {
        let scheduler = self.scheduler.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = feed.next_event().await {
                match event {
                    FeedEvent::Snapshot(tasks) => scheduler.update_tasks(tasks).await,
                    FeedEvent::Failed { message } => {
                        tracing::warn!(message = %message, "task feed reported a failure");
                    }
                }
            }
        });
        if let Ok(mut slot) = self.task_pump.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        }
    }

    fn stop_task_pump(&self) {
        if let Ok(mut slot) = self.task_pump.lock() {
            if let Some(pump) = slot.take() {
                pump.abort();
            }
        }
    }

    async fn require_user(&self) -> AppResult<UserProfile> {
        self.current_user
            .read()
            .await
            .clone()
            .ok_or_else(|| AppError::Auth("Not signed in".to_string()))
    }

    // ─── Tasks ──────────────────────────────────────────────────────────────

    pub async fn create_task(&self, payload: CreateTaskPayload) -> AppResult<Task> {
        let user = self.require_user().await?;
        self.store.create(&user.id, payload).await
    }

    pub async fn update_task(&self, task_id: &str, payload: UpdateTaskPayload) -> AppResult<()> {
        self.require_user().await?;
        self.store.update(task_id, payload).await
    }

    pub async fn complete_task(&self, task_id: &str) -> AppResult<()> {
        self.require_user().await?;
        self.store.complete(task_id).await
    }

    /// Deletes the task, then drops any attachment records it still
    /// references from the side-channel.
    pub async fn delete_task(&self, task_id: &str) -> AppResult<()> {
        self.require_user().await?;
        let task = self.backend.task_by_id(task_id)?;
        self.store.delete(task_id).await?;
        if let Some(task) = task {
            let purged = attachments::purge_task_attachments(&self.kv, &task);
            if purged > 0 {
                tracing::debug!(task_id = %task_id, purged, "purged attachment records");
            }
        }
        Ok(())
    }

    pub async fn subscribe_tasks(&self) -> AppResult<TaskFeed> {
        let user = self.current_user.read().await.clone();
        self.store
            .subscribe_by_owner(user.as_ref().map(|profile| profile.id.as_str()))
    }

    pub async fn workload_advice(
        &self,
        proposed_deadline: DateTime<Utc>,
    ) -> AppResult<WorkloadAdvice> {
        let user = self.require_user().await?;
        let tasks = self.backend.tasks_for_owner(&user.id)?;
        let settings = self.kv.get_settings()?;
        Ok(insights::workload_advice(
            &tasks,
            proposed_deadline,
            settings.weekday_task_soft_limit,
        ))
    }

    // ─── Classification ─────────────────────────────────────────────────────

    pub async fn begin_classification(&self, draft: CreateTaskPayload) -> AppResult<()> {
        self.require_user().await?;
        let mut flow = self
            .classifier
            .lock()
            .map_err(|_| AppError::Internal("classifier mutex poisoned".to_string()))?;
        *flow = ClassifierFlow::new();
        flow.begin(draft);
        Ok(())
    }

    /// Returns `Ok(None)` when no selection is pending, which covers repeat
    /// submissions while one is already in flight.
    pub async fn submit_classified(&self, quadrant: Quadrant) -> AppResult<Option<Task>> {
        let user = self.require_user().await?;
        let payload = {
            let mut flow = self
                .classifier
                .lock()
                .map_err(|_| AppError::Internal("classifier mutex poisoned".to_string()))?;
            flow.select(quadrant)
        };
        let Some(payload) = payload else {
            return Ok(None);
        };

        match self.store.create(&user.id, payload).await {
            Ok(task) => {
                if let Ok(mut flow) = self.classifier.lock() {
                    flow.mark_submitted();
                }
                Ok(Some(task))
            }
            Err(error) => {
                if let Ok(mut flow) = self.classifier.lock() {
                    flow.submission_failed();
                }
                Err(error)
            }
        }
    }

    pub fn cancel_classification(&self) {
        if let Ok(mut flow) = self.classifier.lock() {
            flow.cancel();
        }
    }

    // ─── Attachments ────────────────────────────────────────────────────────

    pub async fn attach_files(
        &self,
        uploads: Vec<FileUpload>,
    ) -> AppResult<(Vec<Attachment>, Vec<RejectedFile>)> {
        self.require_user().await?;
        let outcome = attachments::validate(uploads);
        let persisted = attachments::persist_locally(&self.kv, outcome.accepted)?;
        Ok((persisted, outcome.rejected))
    }

    pub async fn download_attachment(&self, attachment: &Attachment) -> AppResult<DownloadedFile> {
        self.require_user().await?;
        attachments::download(&self.kv, attachment)
    }

    // ─── Settings ───────────────────────────────────────────────────────────

    pub fn settings(&self) -> AppResult<AppSettings> {
        self.kv.get_settings()
    }

    /// Merged update. The side-channel capacity applies immediately; a new
    /// poll cadence applies the next time the reminder loop is started.
    pub fn update_settings(&self, update: serde_json::Value) -> AppResult<AppSettings> {
        self.kv.update_settings(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn core(dir: &tempfile::TempDir) -> Arc<TodoCore> {
        TodoCore::new(dir.path().to_path_buf()).expect("core")
    }

    fn payload(title: &str) -> CreateTaskPayload {
        CreateTaskPayload {
            title: title.to_string(),
            description: None,
            deadline: None,
            priority: None,
            attachments: Vec::new(),
            quadrant: None,
        }
    }

    #[tokio::test]
    async fn task_operations_require_a_signed_in_user() {
        let dir = tempfile::tempdir().expect("tempdir");
        let core = core(&dir);

        let error = core
            .create_task(payload("Pay rent"))
            .await
            .expect_err("auth gate");
        assert!(matches!(error, AppError::Auth(_)));
    }

    #[tokio::test]
    async fn sign_up_enters_a_session_and_feeds_subscriptions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let core = core(&dir);

        core.sign_up("maya@example.com", "hunter22", Some("Maya"))
            .await
            .expect("sign up");
        let user = core.current_user().await.expect("session");
        assert_eq!(user.email, "maya@example.com");

        core.create_task(payload("Pay rent")).await.expect("create");

        let mut feed = core.subscribe_tasks().await.expect("subscribe");
        let (tasks, error) = feed.first_snapshot(Duration::from_secs(2)).await;
        assert!(error.is_none());
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].title, "Pay rent");
    }

    #[tokio::test]
    async fn sign_out_closes_the_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let core = core(&dir);

        core.sign_up("maya@example.com", "hunter22", None)
            .await
            .expect("sign up");
        core.sign_out().await.expect("sign out");

        assert!(core.current_user().await.is_none());
        let error = core
            .create_task(payload("Pay rent"))
            .await
            .expect_err("auth gate");
        assert!(matches!(error, AppError::Auth(_)));
    }

    #[tokio::test]
    async fn classifier_flow_creates_exactly_one_task() {
        let dir = tempfile::tempdir().expect("tempdir");
        let core = core(&dir);
        core.sign_up("maya@example.com", "hunter22", None)
            .await
            .expect("sign up");

        core.begin_classification(payload("File taxes"))
            .await
            .expect("begin");
        let created = core
            .submit_classified(Quadrant::UrgentImportant)
            .await
            .expect("submit");
        let task = created.expect("task created");
        assert_eq!(task.quadrant, Some(Quadrant::UrgentImportant));

        let repeat = core
            .submit_classified(Quadrant::UrgentImportant)
            .await
            .expect("repeat submit");
        assert!(repeat.is_none());
    }

    #[tokio::test]
    async fn delete_purges_stored_attachment_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let core = core(&dir);
        core.sign_up("maya@example.com", "hunter22", None)
            .await
            .expect("sign up");

        let (attached, rejected) = core
            .attach_files(vec![FileUpload {
                name: "receipt.png".to_string(),
                mime_type: "image/png".to_string(),
                bytes: vec![1; 64],
            }])
            .await
            .expect("attach");
        assert!(rejected.is_empty());
        assert!(core.kv.used_bytes().expect("used") > 0);

        let mut with_files = payload("Pay rent");
        with_files.attachments = attached;
        let task = core.create_task(with_files).await.expect("create");

        core.delete_task(&task.task_id).await.expect("delete");
        assert_eq!(core.kv.used_bytes().expect("used"), 0);
    }
}

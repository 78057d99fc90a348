use crate::errors::AppResult;
use crate::kv::KvStore;
use crate::models::{AppSettings, Horizon, Reminder, Task};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};

pub const SUPPRESSION_WINDOW_MINUTES: i64 = 60;

pub fn horizon_for(deadline: DateTime<Utc>, now: DateTime<Utc>) -> Option<Horizon> {
    let delta = deadline - now;
    if delta < chrono::Duration::zero() {
        return None;
    }
    if delta <= chrono::Duration::minutes(5) {
        return Some(Horizon::Imminent);
    }
    match delta.num_days() {
        0 => Some(Horizon::Today),
        1 => Some(Horizon::Tomorrow),
        2 => Some(Horizon::TwoDays),
        3 => Some(Horizon::ThreeDays),
        _ => None,
    }
}

pub fn due_reminders(tasks: &[Task], now: DateTime<Utc>, kv: &KvStore) -> Vec<Reminder> {
    let mut due = Vec::new();
    for task in tasks {
        if task.is_done() {
            continue;
        }
        let Some(deadline) = task.deadline else {
            continue;
        };
        let Some(horizon) = horizon_for(deadline, now) else {
            continue;
        };
        if suppressed(kv, &task.task_id, now) {
            continue;
        }
        due.push(Reminder {
            task_id: task.task_id.clone(),
            title: task.title.clone(),
            horizon,
            message: message_for(horizon, deadline, now),
            deadline,
        });
    }
    due
}

pub fn record_emission(kv: &KvStore, task_id: &str, now: DateTime<Utc>) -> AppResult<()> {
    kv.set(&emission_key(task_id), &now.to_rfc3339())
}

fn suppressed(kv: &KvStore, task_id: &str, now: DateTime<Utc>) -> bool {
    let raw = match kv.get(&emission_key(task_id)) {
        Ok(Some(raw)) => raw,
        Ok(None) => return false,
        Err(error) => {
            tracing::warn!(task_id = %task_id, error = %error, "failed to read reminder stamp");
            return false;
        }
    };

    match DateTime::parse_from_rfc3339(&raw) {
        Ok(last) => (now - last.with_timezone(&Utc)).num_minutes() < SUPPRESSION_WINDOW_MINUTES,
        Err(error) => {
            tracing::warn!(task_id = %task_id, error = %error, "malformed reminder stamp treated as absent");
            false
        }
    }
}

fn message_for(horizon: Horizon, deadline: DateTime<Utc>, now: DateTime<Utc>) -> String {
    match horizon {
        Horizon::Imminent => {
            let minutes = (deadline - now).num_minutes().max(1);
            format!("due in {} minutes", minutes)
        }
        Horizon::Today => "due today".to_string(),
        Horizon::Tomorrow => "due tomorrow".to_string(),
        Horizon::TwoDays => "due in 2 days".to_string(),
        Horizon::ThreeDays => "due in 3 days".to_string(),
    }
}

fn emission_key(task_id: &str) -> String {
    format!("reminder:{}", task_id)
}

pub trait ReminderSink: Send + Sync {
    fn deliver(&self, reminder: &Reminder) -> AppResult<()>;
}

// Fallback sink; writes the reminder to the log and cannot fail.
#[derive(Debug, Default)]
pub struct LogSink;

impl ReminderSink for LogSink {
    fn deliver(&self, reminder: &Reminder) -> AppResult<()> {
        tracing::info!(
            task_id = %reminder.task_id,
            horizon = %reminder.horizon.as_str(),
            message = %reminder.message,
            "task reminder"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReminderConfig {
    pub poll_interval: Duration,
    pub delivery_delay: Duration,
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            delivery_delay: Duration::from_secs(3),
        }
    }
}

impl ReminderConfig {
    pub fn from_settings(settings: &AppSettings) -> Self {
        Self {
            poll_interval: Duration::from_secs(settings.reminder_poll_seconds.max(1)),
            delivery_delay: Duration::from_secs(settings.reminder_delivery_delay_seconds),
        }
    }
}

#[derive(Clone)]
pub struct ReminderScheduler {
    tasks: Arc<RwLock<Vec<Task>>>,
    kv: KvStore,
    sink: Arc<dyn ReminderSink>,
    notify: Arc<Notify>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    config: ReminderConfig,
}

impl ReminderScheduler {
    pub fn new(kv: KvStore, sink: Arc<dyn ReminderSink>, config: ReminderConfig) -> Self {
        Self {
            tasks: Arc::new(RwLock::new(Vec::new())),
            kv,
            sink,
            notify: Arc::new(Notify::new()),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            config,
        }
    }

    pub async fn update_tasks(&self, tasks: Vec<Task>) {
        *self.tasks.write().await = tasks;
        self.notify.notify_one();
    }

    pub fn poke(&self) {
        self.notify.notify_one();
    }

    pub fn start(&self) -> ReminderTask {
        let scheduler = self.clone();
        ReminderTask {
            handle: tokio::spawn(async move {
                scheduler.run_loop().await;
            }),
        }
    }

    async fn run_loop(self) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.notify.notified() => {}
            }
            self.poll_once(Utc::now()).await;
        }
    }

    async fn poll_once(&self, now: DateTime<Utc>) {
        let snapshot = self.tasks.read().await.clone();
        for reminder in due_reminders(&snapshot, now, &self.kv) {
            {
                let mut in_flight = self.in_flight.lock().await;
                if !in_flight.insert(reminder.task_id.clone()) {
                    continue;
                }
            }
            let scheduler = self.clone();
            tokio::spawn(async move {
                scheduler.deliver_after_delay(reminder).await;
            });
        }
    }

    // Stamps the emission even when the sink fails; a broken sink must not
    // turn into a reminder storm on the next poll.
    async fn deliver_after_delay(&self, reminder: Reminder) {
        tokio::time::sleep(self.config.delivery_delay).await;
        if let Err(error) = record_emission(&self.kv, &reminder.task_id, Utc::now()) {
            tracing::warn!(task_id = %reminder.task_id, error = %error, "failed to record reminder emission");
        }
        if let Err(error) = self.sink.deliver(&reminder) {
            tracing::warn!(task_id = %reminder.task_id, error = %error, "reminder delivery failed");
        }
        self.in_flight.lock().await.remove(&reminder.task_id);
    }
}

#[derive(Debug)]
pub struct ReminderTask {
    handle: JoinHandle<()>,
}

impl ReminderTask {
    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for ReminderTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

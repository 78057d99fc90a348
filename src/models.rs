use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "Low",
            Self::Medium => "Medium",
            Self::High => "High",
        }
    }

    pub fn rank(self) -> u8 {
        match self {
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Medium
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Open,
    Done,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Done => "done",
        }
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Open
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Quadrant {
    UrgentImportant,
    NotUrgentImportant,
    UrgentNotImportant,
    NotUrgentNotImportant,
}

impl Quadrant {
    // Dialog display order.
    pub const ALL: [Quadrant; 4] = [
        Self::UrgentImportant,
        Self::NotUrgentImportant,
        Self::UrgentNotImportant,
        Self::NotUrgentNotImportant,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::UrgentImportant => "urgent-important",
            Self::NotUrgentImportant => "not-urgent-important",
            Self::UrgentNotImportant => "urgent-not-important",
            Self::NotUrgentNotImportant => "not-urgent-not-important",
        }
    }

    pub fn is_urgent(self) -> bool {
        matches!(self, Self::UrgentImportant | Self::UrgentNotImportant)
    }

    pub fn is_important(self) -> bool {
        matches!(self, Self::UrgentImportant | Self::NotUrgentImportant)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::UrgentImportant => "Do First",
            Self::NotUrgentImportant => "Schedule",
            Self::UrgentNotImportant => "Delegate",
            Self::NotUrgentNotImportant => "Eliminate",
        }
    }

    pub fn advice(self) -> &'static str {
        match self {
            Self::UrgentImportant => "Do it now! Prioritize completing it promptly.",
            Self::NotUrgentImportant => "Schedule it! Plan time to do this important task.",
            Self::UrgentNotImportant => "Delegate it! Consider if someone else can handle this.",
            Self::NotUrgentNotImportant => {
                "Eliminate it! Consider dropping or postponing this task."
            }
        }
    }
}

// ─── Attachments ────────────────────────────────────────────────────────────

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUpload {
    pub name: String,
    pub mime_type: String,
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
}

impl FileUpload {
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    UnsupportedType,
    TooLarge,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnsupportedType => "unsupported-type",
            Self::TooLarge => "too-large",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedFile {
    pub name: String,
    pub reason: RejectReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Attachment {
    #[serde(rename_all = "camelCase")]
    Pending {
        name: String,
        mime_type: String,
        size: u64,
        #[serde(with = "base64_bytes")]
        bytes: Vec<u8>,
    },
    #[serde(rename_all = "camelCase")]
    Persisted {
        reference: String,
        name: String,
        mime_type: String,
        size: u64,
    },
}

impl Attachment {
    pub fn name(&self) -> &str {
        match self {
            Self::Pending { name, .. } | Self::Persisted { name, .. } => name,
        }
    }

    pub fn mime_type(&self) -> &str {
        match self {
            Self::Pending { mime_type, .. } | Self::Persisted { mime_type, .. } => mime_type,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            Self::Pending { size, .. } | Self::Persisted { size, .. } => *size,
        }
    }

    pub fn reference(&self) -> Option<&str> {
        match self {
            Self::Pending { .. } => None,
            Self::Persisted { reference, .. } => Some(reference),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredAttachment {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    pub data: String,
    pub uploaded_at: DateTime<Utc>,
}

// ─── Tasks ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: String,
    pub user_id: String,
    pub title: String,
    pub description: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
    pub priority: Priority,
    pub status: TaskStatus,
    pub attachments: Vec<Attachment>,
    pub quadrant: Option<Quadrant>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn is_done(&self) -> bool {
        self.status == TaskStatus::Done
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDocument {
    pub user_id: String,
    pub title: String,
    pub description: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
    pub priority: Priority,
    pub status: TaskStatus,
    pub attachments: Vec<Attachment>,
    pub quadrant: Option<Quadrant>,
}

// Outer None leaves a field untouched; Some(None) clears it.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub deadline: Option<Option<DateTime<Utc>>>,
    pub priority: Option<Priority>,
    pub attachments: Option<Vec<Attachment>>,
}

impl TaskPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.deadline.is_none()
            && self.priority.is_none()
            && self.attachments.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskPayload {
    pub title: String,
    pub description: Option<String>,
    pub deadline: Option<String>,
    pub priority: Option<Priority>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub quadrant: Option<Quadrant>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTaskPayload {
    pub title: Option<String>,
    pub description: Option<String>,
    pub deadline: Option<String>,
    pub priority: Option<Priority>,
    pub attachments: Option<Vec<Attachment>>,
}

// ─── Derived views ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TodayStats {
    pub total: usize,
    pub completed: usize,
    pub pending: usize,
    pub high_priority: usize,
    pub completion_percentage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OverallStats {
    pub completion_rate: f64,
    pub completed_count: usize,
    pub total_count: usize,
    pub high_priority_open_count: usize,
    pub overdue_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadAdvice {
    pub weekday_count: usize,
    pub needs_confirmation: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Horizon {
    Imminent,
    Today,
    Tomorrow,
    TwoDays,
    ThreeDays,
}

impl Horizon {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Imminent => "imminent",
            Self::Today => "today",
            Self::Tomorrow => "tomorrow",
            Self::TwoDays => "two-days",
            Self::ThreeDays => "three-days",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reminder {
    pub task_id: String,
    pub title: String,
    pub horizon: Horizon,
    pub message: String,
    pub deadline: DateTime<Utc>,
}

// ─── Identity & settings ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppSettings {
    pub reminder_poll_seconds: u64,
    pub reminder_delivery_delay_seconds: u64,
    pub subscription_wait_seconds: u64,
    pub sidecar_capacity_bytes: u64,
    pub weekday_task_soft_limit: u32,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            reminder_poll_seconds: 60,
            reminder_delivery_delay_seconds: 3,
            subscription_wait_seconds: 10,
            sidecar_capacity_bytes: 64 * 1024 * 1024,
            weekday_task_soft_limit: 15,
        }
    }
}

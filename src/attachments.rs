use crate::errors::{AppError, AppResult};
use crate::kv::KvStore;
use crate::models::{Attachment, FileUpload, RejectReason, RejectedFile, StoredAttachment, Task};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const MAX_ATTACHMENT_BYTES: u64 = 5 * 1024 * 1024;

const REFERENCE_SCHEME: &str = "attachment://";

#[derive(Debug, Clone, Default)]
pub struct ValidationOutcome {
    pub accepted: Vec<FileUpload>,
    pub rejected: Vec<RejectedFile>,
}

#[derive(Debug, Clone)]
pub enum ResolvedAttachment {
    Stored(StoredAttachment),
    Missing { reference: String },
}

#[derive(Debug, Clone)]
pub struct DownloadedFile {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

// Unsupported type wins over size when both apply.
pub fn validate(uploads: Vec<FileUpload>) -> ValidationOutcome {
    let mut outcome = ValidationOutcome::default();
    for upload in uploads {
        if !is_supported_type(&upload.mime_type) {
            outcome.rejected.push(RejectedFile {
                name: upload.name,
                reason: RejectReason::UnsupportedType,
            });
            continue;
        }
        if upload.size() > MAX_ATTACHMENT_BYTES {
            outcome.rejected.push(RejectedFile {
                name: upload.name,
                reason: RejectReason::TooLarge,
            });
            continue;
        }
        outcome.accepted.push(upload);
    }
    outcome
}

pub fn persist_locally(kv: &KvStore, uploads: Vec<FileUpload>) -> AppResult<Vec<Attachment>> {
    let mut persisted = Vec::with_capacity(uploads.len());
    for upload in uploads {
        let now = Utc::now();
        let id = new_attachment_id(now);
        let size = upload.size();
        let FileUpload {
            name,
            mime_type,
            bytes,
        } = upload;

        let record = StoredAttachment {
            id: id.clone(),
            name: name.clone(),
            mime_type: mime_type.clone(),
            size,
            data: STANDARD.encode(&bytes),
            uploaded_at: now,
        };
        kv.set_json(&record_key(&id), &record)?;

        persisted.push(Attachment::Persisted {
            reference: reference_for(&id),
            name,
            mime_type,
            size,
        });
    }
    Ok(persisted)
}

pub fn resolve(kv: &KvStore, reference: &str) -> AppResult<ResolvedAttachment> {
    let Some(id) = reference.strip_prefix(REFERENCE_SCHEME) else {
        tracing::warn!(reference = %reference, "attachment reference has unknown scheme");
        return Ok(ResolvedAttachment::Missing {
            reference: reference.to_string(),
        });
    };

    match kv.get(&record_key(id))? {
        Some(raw) => match serde_json::from_str::<StoredAttachment>(&raw) {
            Ok(record) => Ok(ResolvedAttachment::Stored(record)),
            Err(error) => {
                tracing::warn!(reference = %reference, error = %error, "skipping malformed attachment record");
                Ok(ResolvedAttachment::Missing {
                    reference: reference.to_string(),
                })
            }
        },
        None => Ok(ResolvedAttachment::Missing {
            reference: reference.to_string(),
        }),
    }
}

pub fn download(kv: &KvStore, attachment: &Attachment) -> AppResult<DownloadedFile> {
    match attachment {
        Attachment::Pending {
            name,
            mime_type,
            bytes,
            ..
        } => Ok(DownloadedFile {
            name: name.clone(),
            mime_type: mime_type.clone(),
            bytes: bytes.clone(),
        }),
        Attachment::Persisted { reference, .. } => match resolve(kv, reference)? {
            ResolvedAttachment::Stored(record) => {
                let bytes = STANDARD.decode(record.data.as_bytes()).map_err(|error| {
                    AppError::Storage(format!("attachment payload corrupted: {}", error))
                })?;
                Ok(DownloadedFile {
                    name: record.name,
                    mime_type: record.mime_type,
                    bytes,
                })
            }
            ResolvedAttachment::Missing { reference } => Err(AppError::NotFound(format!(
                "Attachment '{}' is no longer available",
                reference
            ))),
        },
    }
}

pub fn save_to_dir(dir: &Path, file: &DownloadedFile) -> AppResult<PathBuf> {
    fs::create_dir_all(dir).map_err(|error| AppError::Io(error.to_string()))?;
    let path = dir.join(sanitize_file_name(&file.name));
    fs::write(&path, &file.bytes).map_err(|error| AppError::Io(error.to_string()))?;
    Ok(path)
}

// Out-of-range indices leave the list untouched.
pub fn remove(mut attachments: Vec<Attachment>, index: usize) -> Vec<Attachment> {
    if index < attachments.len() {
        attachments.remove(index);
    }
    attachments
}

pub fn purge_task_attachments(kv: &KvStore, task: &Task) -> usize {
    let mut purged = 0;
    for attachment in &task.attachments {
        let Some(reference) = attachment.reference() else {
            continue;
        };
        let Some(id) = reference.strip_prefix(REFERENCE_SCHEME) else {
            continue;
        };
        match kv.remove(&record_key(id)) {
            Ok(true) => purged += 1,
            Ok(false) => {}
            Err(error) => {
                tracing::warn!(reference = %reference, error = %error, "failed to purge attachment record");
            }
        }
    }
    purged
}

fn is_supported_type(mime_type: &str) -> bool {
    let normalized = mime_type.trim().to_ascii_lowercase();
    normalized.starts_with("image/") || normalized == "application/pdf"
}

fn record_key(id: &str) -> String {
    format!("attachment:{}", id)
}

fn reference_for(id: &str) -> String {
    format!("{}{}", REFERENCE_SCHEME, id)
}

fn new_attachment_id(now: DateTime<Utc>) -> String {
    let short = Uuid::new_v4().simple().to_string();
    format!(
        "att_{}_{}_{}",
        now.format("%Y%m%d"),
        now.format("%H%M%S"),
        &short[..8]
    )
}

fn sanitize_file_name(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    let cleaned = out.trim_matches(['_', '.']).to_string();
    if cleaned.is_empty() {
        "download".to_string()
    } else {
        cleaned
    }
}

//! Marks an attachment as uploaded once its message has been sent.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use courier_core::{AttachmentId, MessageId};

use crate::jobs::job::{Job, JobError, JobRegistry};
use crate::jobs::types::{JobDescriptor, JobParameters};

pub const KEY: &str = "AttachmentMarkUploadedJob";

const LIFESPAN: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRecord {
    pub id: AttachmentId,
    pub content_type: String,
    pub size: u64,
    /// Message the upload was last recorded against.
    pub uploaded_for: Option<MessageId>,
}

impl AttachmentRecord {
    pub fn new(id: AttachmentId, content_type: impl Into<String>, size: u64) -> Self {
        Self {
            id,
            content_type: content_type.into(),
            size,
            uploaded_for: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttachmentError {
    #[error("attachment i/o failure: {0}")]
    Io(String),
    #[error("attachment storage error: {0}")]
    Storage(String),
}

impl From<AttachmentError> for JobError {
    fn from(err: AttachmentError) -> Self {
        match err {
            AttachmentError::Io(e) => JobError::Io(e),
            AttachmentError::Storage(e) => JobError::Permanent(e),
        }
    }
}

pub trait AttachmentStore: Send + Sync {
    fn attachment(&self, id: AttachmentId) -> Result<Option<AttachmentRecord>, AttachmentError>;

    fn mark_uploaded(
        &self,
        message_id: MessageId,
        attachment: &AttachmentRecord,
    ) -> Result<(), AttachmentError>;
}

/// In-memory attachment table for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryAttachmentStore {
    rows: RwLock<HashMap<AttachmentId, AttachmentRecord>>,
}

impl InMemoryAttachmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: AttachmentRecord) -> Result<(), AttachmentError> {
        self.rows
            .write()
            .map_err(|_| AttachmentError::Storage("lock poisoned".to_string()))?
            .insert(record.id, record);
        Ok(())
    }
}

impl AttachmentStore for InMemoryAttachmentStore {
    fn attachment(&self, id: AttachmentId) -> Result<Option<AttachmentRecord>, AttachmentError> {
        let rows = self
            .rows
            .read()
            .map_err(|_| AttachmentError::Storage("lock poisoned".to_string()))?;
        Ok(rows.get(&id).cloned())
    }

    fn mark_uploaded(
        &self,
        message_id: MessageId,
        attachment: &AttachmentRecord,
    ) -> Result<(), AttachmentError> {
        let mut rows = self
            .rows
            .write()
            .map_err(|_| AttachmentError::Storage("lock poisoned".to_string()))?;
        match rows.get_mut(&attachment.id) {
            Some(row) => {
                row.uploaded_for = Some(message_id);
                Ok(())
            }
            None => Err(AttachmentError::Storage(format!(
                "{} vanished before it was marked",
                attachment.id
            ))),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MarkUploadedData {
    message_id: i64,
    row_id: i64,
    unique_id: i64,
}

pub struct AttachmentMarkUploadedJob {
    message_id: MessageId,
    attachment_id: AttachmentId,
    attachments: Arc<dyn AttachmentStore>,
}

impl std::fmt::Debug for AttachmentMarkUploadedJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentMarkUploadedJob")
            .field("message_id", &self.message_id)
            .field("attachment_id", &self.attachment_id)
            .finish_non_exhaustive()
    }
}

impl AttachmentMarkUploadedJob {
    pub fn new(
        attachments: Arc<dyn AttachmentStore>,
        message_id: MessageId,
        attachment_id: AttachmentId,
    ) -> Self {
        Self {
            message_id,
            attachment_id,
            attachments,
        }
    }
}

impl Job for AttachmentMarkUploadedJob {
    fn factory_key(&self) -> &str {
        KEY
    }

    fn parameters(&self) -> JobParameters {
        JobParameters::default()
            .with_lifespan(LIFESPAN)
            .with_unlimited_attempts()
    }

    fn serialize(&self) -> Result<Option<Vec<u8>>, JobError> {
        Ok(Some(serde_json::to_vec(&MarkUploadedData {
            message_id: self.message_id.0,
            row_id: self.attachment_id.row_id,
            unique_id: self.attachment_id.unique_id,
        })?))
    }

    fn run(&mut self) -> Result<(), JobError> {
        let attachment = self
            .attachments
            .attachment(self.attachment_id)?
            .ok_or_else(|| JobError::NotFound(format!("cannot find {}", self.attachment_id)))?;
        self.attachments.mark_uploaded(self.message_id, &attachment)?;
        Ok(())
    }

    fn should_retry(&self, error: &JobError) -> bool {
        matches!(error, JobError::Io(_))
    }
}

pub(crate) fn register(registry: &mut JobRegistry, attachments: Arc<dyn AttachmentStore>) {
    registry.register(KEY, move |descriptor: &JobDescriptor| {
        let data = descriptor
            .serialized_data
            .as_deref()
            .ok_or_else(|| JobError::Serialization("missing payload".to_string()))?;
        let data: MarkUploadedData = serde_json::from_slice(data)?;
        Ok(Box::new(AttachmentMarkUploadedJob::new(
            attachments.clone(),
            MessageId(data.message_id),
            AttachmentId::new(data.row_id, data.unique_id),
        )) as Box<dyn Job>)
    });
}

//! Resend of previously-sent content after a peer reports a decryption failure.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use courier_core::{DistributionId, GroupId, ProtocolAddress, RecipientId};

use crate::content::{Content, ContentHint};
use crate::directory::RecipientDirectory;
use crate::error::ResendError;
use crate::session_lock::SessionLock;
use crate::store::ProtocolStore;
use crate::transport::{MessageTransport, ResendEnvelope, SendStatus};

/// Parameters of one resend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResendRequest {
    pub recipient_id: RecipientId,
    pub sent_timestamp: i64,
    /// Serialized [`Content`] as originally sent.
    pub content: Vec<u8>,
    pub content_hint: ContentHint,
    pub urgent: bool,
    pub group_id: Option<GroupId>,
    pub distribution_id: Option<DistributionId>,
}

/// Why a resend was dropped without contacting the network.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Unregistered,
    GroupNotFound,
    NotGroupMember,
    DistributionListNotFound,
    NotListMember,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResendOutcome {
    Sent { devices: usize },
    /// The service answered but did not accept the message.
    NotDelivered(SendStatus),
    Skipped(SkipReason),
}

/// Resend protocol logic, shared by every resend job.
#[derive(Clone)]
pub struct MessageResender {
    directory: Arc<dyn RecipientDirectory>,
    store: Arc<dyn ProtocolStore>,
    transport: Arc<dyn MessageTransport>,
    session_lock: Arc<SessionLock>,
}

impl core::fmt::Debug for MessageResender {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MessageResender").finish_non_exhaustive()
    }
}

impl MessageResender {
    pub fn new(
        directory: Arc<dyn RecipientDirectory>,
        store: Arc<dyn ProtocolStore>,
        transport: Arc<dyn MessageTransport>,
        session_lock: Arc<SessionLock>,
    ) -> Self {
        Self {
            directory,
            store,
            transport,
            session_lock,
        }
    }

    #[instrument(
        skip(self, request),
        fields(recipient = %request.recipient_id, timestamp = request.sent_timestamp),
        err
    )]
    pub fn resend(&self, request: &ResendRequest) -> Result<ResendOutcome, ResendError> {
        let recipient = self.directory.resolve(request.recipient_id)?;
        if recipient.is_unregistered() {
            warn!("recipient is unregistered, skipping resend");
            return Ok(ResendOutcome::Skipped(SkipReason::Unregistered));
        }
        let service_id = recipient
            .service_id
            .ok_or(ResendError::MissingServiceId(request.recipient_id))?;

        let mut content = Content::from_bytes(&request.content)?;

        if let Some(distribution_id) = request.distribution_id {
            if let Some(reason) = self.check_membership(request, distribution_id)? {
                warn!(%distribution_id, ?reason, "membership changed since original send, skipping resend");
                return Ok(ResendOutcome::Skipped(reason));
            }

            let distribution_message = {
                let guard = self.session_lock.acquire();
                self.store
                    .sender_key_distribution_message(&guard, distribution_id)?
            };
            content = content.with_sender_key_distribution_message(distribution_message.serialize());
        }

        let envelope = ResendEnvelope {
            destination: service_id,
            unidentified_access: self.directory.unidentified_access(request.recipient_id)?,
            timestamp: request.sent_timestamp,
            content,
            content_hint: request.content_hint,
            group_id: request.group_id.clone(),
            urgent: request.urgent,
        };

        let result = self.transport.resend_content(&envelope)?;
        if !result.is_success() {
            info!(status = ?result.status, "resend not accepted by service");
            return Ok(ResendOutcome::NotDelivered(result.status));
        }

        let devices = result.success_devices();
        if let Some(distribution_id) = request.distribution_id {
            let addresses: Vec<ProtocolAddress> = devices
                .iter()
                .map(|device| ProtocolAddress::new(result.destination, *device))
                .collect();
            let guard = self.session_lock.acquire();
            self.store
                .mark_sender_key_shared_with(&guard, distribution_id, &addresses)?;
            debug!(%distribution_id, devices = addresses.len(), "sender key marked as shared");
        }

        Ok(ResendOutcome::Sent {
            devices: devices.len(),
        })
    }

    fn check_membership(
        &self,
        request: &ResendRequest,
        distribution_id: DistributionId,
    ) -> Result<Option<SkipReason>, ResendError> {
        if request.group_id.is_some() {
            return Ok(match self.directory.group_by_distribution_id(distribution_id)? {
                None => Some(SkipReason::GroupNotFound),
                Some(group) if !group.is_member(request.recipient_id) => {
                    Some(SkipReason::NotGroupMember)
                }
                Some(_) => None,
            });
        }

        Ok(
            match self
                .directory
                .distribution_list_by_distribution_id(distribution_id)?
            {
                None => Some(SkipReason::DistributionListNotFound),
                Some(list) if !list.is_member(request.recipient_id) => {
                    Some(SkipReason::NotListMember)
                }
                Some(_) => None,
            },
        )
    }
}

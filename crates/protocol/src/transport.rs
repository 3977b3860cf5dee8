//! Delivery of protocol content to a peer.

use serde::{Deserialize, Serialize};

use courier_core::{DeviceId, GroupId, ServiceId};

use crate::content::{Content, ContentHint};
use crate::directory::UnidentifiedAccess;
use crate::error::TransportError;

/// Everything the transport needs to re-deliver one piece of content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResendEnvelope {
    pub destination: ServiceId,
    pub unidentified_access: Option<UnidentifiedAccess>,
    pub timestamp: i64,
    pub content: Content,
    pub content_hint: ContentHint,
    pub group_id: Option<GroupId>,
    pub urgent: bool,
}

/// Per-destination outcome of a send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendStatus {
    Success {
        devices: Vec<DeviceId>,
        unidentified: bool,
    },
    UnregisteredFailure,
    IdentityFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageResult {
    pub destination: ServiceId,
    pub status: SendStatus,
}

impl SendMessageResult {
    pub fn success(destination: ServiceId, devices: Vec<DeviceId>, unidentified: bool) -> Self {
        Self {
            destination,
            status: SendStatus::Success {
                devices,
                unidentified,
            },
        }
    }

    /// Devices that accepted the message; empty unless the send succeeded.
    pub fn success_devices(&self) -> &[DeviceId] {
        match &self.status {
            SendStatus::Success { devices, .. } => devices,
            _ => &[],
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, SendStatus::Success { .. })
    }
}

/// Network transport. Implementations block until the service answers.
pub trait MessageTransport: Send + Sync {
    fn resend_content(&self, envelope: &ResendEnvelope) -> Result<SendMessageResult, TransportError>;
}

//! Protocol content carried by messages and resends.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use courier_core::DistributionId;

use crate::error::ProtocolError;

/// How the receiving client should treat content it fails to decrypt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ContentHint {
    /// Show an error to the user.
    #[default]
    Default,
    /// Request a resend; only show an error if the resend also fails.
    Resendable,
    /// Ignore silently.
    Implicit,
}

impl ContentHint {
    /// Decode the wire value. Unknown values map to `Default`.
    pub fn from_type(value: i32) -> Self {
        match value {
            1 => ContentHint::Resendable,
            2 => ContentHint::Implicit,
            _ => ContentHint::Default,
        }
    }

    pub fn to_type(self) -> i32 {
        match self {
            ContentHint::Default => 0,
            ContentHint::Resendable => 1,
            ContentHint::Implicit => 2,
        }
    }
}

/// Plaintext protocol content, before encryption for a particular device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_message: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_message: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_key_distribution_message: Option<Vec<u8>>,
}

impl Content {
    pub fn data(body: impl Into<Vec<u8>>) -> Self {
        Self {
            data_message: Some(body.into()),
            ..Default::default()
        }
    }

    pub fn with_sender_key_distribution_message(mut self, serialized: Vec<u8>) -> Self {
        self.sender_key_distribution_message = Some(serialized);
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::MalformedContent(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::MalformedContent(e.to_string()))
    }
}

/// Sender-key state handed to a peer so it can decrypt our group messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderKeyDistributionMessage {
    pub distribution_id: DistributionId,
    pub chain_id: u32,
    pub iteration: u32,
    pub chain_key: [u8; 32],
}

impl SenderKeyDistributionMessage {
    const VERSION: u8 = 3;
    const ENCODED_LEN: usize = 1 + 16 + 4 + 4 + 32;

    /// Fixed layout: version, distribution id, chain id (BE), iteration (BE), chain key.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_LEN);
        out.push(Self::VERSION);
        out.extend_from_slice(self.distribution_id.as_uuid().as_bytes());
        out.extend_from_slice(&self.chain_id.to_be_bytes());
        out.extend_from_slice(&self.iteration.to_be_bytes());
        out.extend_from_slice(&self.chain_key);
        out
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() != Self::ENCODED_LEN {
            return Err(ProtocolError::MalformedDistributionMessage(format!(
                "expected {} bytes, got {}",
                Self::ENCODED_LEN,
                bytes.len()
            )));
        }
        if bytes[0] != Self::VERSION {
            return Err(ProtocolError::MalformedDistributionMessage(format!(
                "unsupported version {}",
                bytes[0]
            )));
        }

        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&bytes[1..17]);
        let mut chain_id = [0u8; 4];
        chain_id.copy_from_slice(&bytes[17..21]);
        let mut iteration = [0u8; 4];
        iteration.copy_from_slice(&bytes[21..25]);
        let mut chain_key = [0u8; 32];
        chain_key.copy_from_slice(&bytes[25..]);

        Ok(Self {
            distribution_id: DistributionId::from_uuid(Uuid::from_bytes(uuid)),
            chain_id: u32::from_be_bytes(chain_id),
            iteration: u32::from_be_bytes(iteration),
            chain_key,
        })
    }
}

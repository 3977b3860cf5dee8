//! Resend of a previously-sent message after a peer's retry receipt.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use courier_core::{DistributionId, GroupId, RecipientId};
use courier_protocol::{ContentHint, MessageResender, ResendError, ResendOutcome, ResendRequest};

use crate::jobs::constraints::NETWORK;
use crate::jobs::job::{Job, JobError, JobRegistry};
use crate::jobs::types::{JobDescriptor, JobParameters};

pub const KEY: &str = "ResendMessageJob";

const LIFESPAN: Duration = Duration::from_secs(24 * 60 * 60);

/// Stored payload. Blobs are base64 strings.
#[derive(Debug, Serialize, Deserialize)]
struct ResendData {
    recipient_id: RecipientId,
    sent_timestamp: i64,
    content: String,
    content_hint: i32,
    #[serde(default = "default_urgent")]
    urgent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    distribution_id: Option<DistributionId>,
}

fn default_urgent() -> bool {
    true
}

impl From<&ResendRequest> for ResendData {
    fn from(request: &ResendRequest) -> Self {
        Self {
            recipient_id: request.recipient_id,
            sent_timestamp: request.sent_timestamp,
            content: STANDARD.encode(&request.content),
            content_hint: request.content_hint.to_type(),
            urgent: request.urgent,
            group_id: request.group_id.as_ref().map(|id| STANDARD.encode(id.as_bytes())),
            distribution_id: request.distribution_id,
        }
    }
}

impl TryFrom<ResendData> for ResendRequest {
    type Error = JobError;

    fn try_from(data: ResendData) -> Result<Self, Self::Error> {
        let content = STANDARD
            .decode(&data.content)
            .map_err(|e| JobError::Serialization(format!("content: {e}")))?;
        let group_id = data
            .group_id
            .map(|raw| {
                let bytes = STANDARD
                    .decode(&raw)
                    .map_err(|e| JobError::Serialization(format!("group_id: {e}")))?;
                GroupId::from_bytes(bytes).map_err(|e| JobError::Serialization(e.to_string()))
            })
            .transpose()?;

        Ok(ResendRequest {
            recipient_id: data.recipient_id,
            sent_timestamp: data.sent_timestamp,
            content,
            content_hint: ContentHint::from_type(data.content_hint),
            urgent: data.urgent,
            group_id,
            distribution_id: data.distribution_id,
        })
    }
}

/// Resends content to one recipient. Runs on the recipient's queue so it is
/// ordered with that recipient's other outgoing work.
#[derive(Debug)]
pub struct ResendMessageJob {
    request: ResendRequest,
    resender: MessageResender,
}

impl ResendMessageJob {
    pub fn new(resender: MessageResender, request: ResendRequest) -> Self {
        Self { request, resender }
    }

    pub fn request(&self) -> &ResendRequest {
        &self.request
    }

    fn decode(resender: MessageResender, data: &[u8]) -> Result<Self, JobError> {
        let data: ResendData = serde_json::from_slice(data)?;
        Ok(Self::new(resender, data.try_into()?))
    }
}

impl Job for ResendMessageJob {
    fn factory_key(&self) -> &str {
        KEY
    }

    fn parameters(&self) -> JobParameters {
        JobParameters::default()
            .with_queue(self.request.recipient_id.to_queue_key())
            .with_lifespan(LIFESPAN)
            .with_unlimited_attempts()
            .with_constraint(NETWORK)
    }

    fn serialize(&self) -> Result<Option<Vec<u8>>, JobError> {
        Ok(Some(serde_json::to_vec(&ResendData::from(&self.request))?))
    }

    fn run(&mut self) -> Result<(), JobError> {
        match self.resender.resend(&self.request).map_err(classify)? {
            ResendOutcome::Sent { devices } => {
                info!(recipient = %self.request.recipient_id, devices, "resend delivered");
            }
            ResendOutcome::NotDelivered(status) => {
                warn!(recipient = %self.request.recipient_id, ?status, "resend not delivered");
            }
            ResendOutcome::Skipped(reason) => {
                info!(recipient = %self.request.recipient_id, ?reason, "resend skipped");
            }
        }
        Ok(())
    }

    fn should_retry(&self, error: &JobError) -> bool {
        matches!(error, JobError::Network(_))
    }
}

fn classify(error: ResendError) -> JobError {
    if error.is_retryable() {
        return JobError::Network(error.to_string());
    }
    match error {
        ResendError::Protocol(e) => JobError::Protocol(e.to_string()),
        other => JobError::Permanent(other.to_string()),
    }
}

pub(crate) fn register(registry: &mut JobRegistry, resender: MessageResender) {
    registry.register(KEY, move |descriptor: &JobDescriptor| {
        let data = descriptor
            .serialized_data
            .as_deref()
            .ok_or_else(|| JobError::Serialization("missing payload".to_string()))?;
        Ok(Box::new(ResendMessageJob::decode(resender.clone(), data)?) as Box<dyn Job>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::definitions::fixtures;
    use crate::jobs::job::describe;

    use courier_core::{DeviceId, ProtocolAddress, ServiceId};
    use courier_protocol::{
        Content, DistributionListRecord, ProtocolStore, Recipient, TransportError,
    };

    fn request(recipient_id: RecipientId) -> ResendRequest {
        ResendRequest {
            recipient_id,
            sent_timestamp: 1_700_000_000_000,
            content: Content::data(b"hi".to_vec()).to_bytes().unwrap(),
            content_hint: ContentHint::Resendable,
            urgent: false,
            group_id: Some(GroupId::from_bytes(vec![4u8; 32]).unwrap()),
            distribution_id: Some(DistributionId::new()),
        }
    }

    #[test]
    fn parameters_follow_recipient_queue() {
        let resend = fixtures::resend(Ok(vec![]));
        let job = ResendMessageJob::new(resend.resender, request(RecipientId::new(5)));
        let descriptor = describe(&job).unwrap();

        assert_eq!(descriptor.factory_key, KEY);
        assert_eq!(descriptor.queue_key.as_deref(), Some("RECIPIENT::5"));
        assert_eq!(descriptor.max_attempts, None);
        assert_eq!(descriptor.lifespan, Some(LIFESPAN));
        assert_eq!(descriptor.constraints, vec![NETWORK.to_string()]);
    }

    #[test]
    fn payload_survives_the_factory() {
        let resend = fixtures::resend(Ok(vec![]));
        let original = request(RecipientId::new(5));
        let job = ResendMessageJob::new(resend.resender.clone(), original.clone());
        let descriptor = describe(&job).unwrap();

        let mut registry = JobRegistry::new();
        register(&mut registry, resend.resender);
        let rebuilt = registry.create(&descriptor).unwrap().unwrap();
        assert_eq!(rebuilt.factory_key(), KEY);

        let data = descriptor.serialized_data.unwrap();
        let decoded = ResendMessageJob::decode(fixtures::resend(Ok(vec![])).resender, &data).unwrap();
        assert_eq!(decoded.request(), &original);
    }

    #[test]
    fn urgent_defaults_to_true_and_unknown_hints_decode_as_default() {
        let content = STANDARD.encode(Content::data(b"x".to_vec()).to_bytes().unwrap());
        let json = format!(
            r#"{{"recipient_id": 9, "sent_timestamp": 1, "content": "{content}", "content_hint": 42}}"#
        );
        let job = ResendMessageJob::decode(fixtures::resend(Ok(vec![])).resender, json.as_bytes())
            .unwrap();

        assert!(job.request().urgent);
        assert_eq!(job.request().content_hint, ContentHint::Default);
        assert_eq!(job.request().group_id, None);
        assert_eq!(job.request().distribution_id, None);
    }

    #[test]
    fn bad_group_id_fails_decoding() {
        let json = r#"{"recipient_id": 9, "sent_timestamp": 1, "content": "", "content_hint": 0, "group_id": "AAAA"}"#;
        assert!(matches!(
            ResendMessageJob::decode(fixtures::resend(Ok(vec![])).resender, json.as_bytes()),
            Err(JobError::Serialization(_))
        ));
    }

    #[test]
    fn run_marks_sender_key_shared_with_delivered_devices() {
        let resend = fixtures::resend(Ok(vec![DeviceId::new(1), DeviceId::new(3)]));
        let recipient_id = RecipientId::new(5);
        let service_id = ServiceId::new();
        resend
            .directory
            .upsert_recipient(Recipient::new(recipient_id, service_id))
            .unwrap();

        let mut request = request(recipient_id);
        request.group_id = None;
        let distribution_id = request.distribution_id.unwrap();
        resend
            .directory
            .upsert_distribution_list(DistributionListRecord {
                name: "friends".into(),
                distribution_id,
                members: vec![recipient_id],
            })
            .unwrap();

        let mut job = ResendMessageJob::new(resend.resender.clone(), request);
        job.run().unwrap();

        assert_eq!(resend.transport.sent().len(), 1);
        let guard = resend.lock.acquire();
        let shared = resend
            .store
            .sender_key_shared_with(&guard, distribution_id)
            .unwrap();
        assert_eq!(
            shared.into_iter().collect::<Vec<_>>(),
            vec![
                ProtocolAddress::new(service_id, DeviceId::new(1)),
                ProtocolAddress::new(service_id, DeviceId::new(3)),
            ]
        );
    }

    #[test]
    fn only_push_network_failures_are_retried() {
        let resend = fixtures::resend(Err(TransportError::push_network("reset")));
        let recipient_id = RecipientId::new(6);
        resend
            .directory
            .upsert_recipient(Recipient::new(recipient_id, ServiceId::new()))
            .unwrap();
        let mut plain = request(recipient_id);
        plain.group_id = None;
        plain.distribution_id = None;

        let mut job = ResendMessageJob::new(resend.resender.clone(), plain.clone());
        let error = job.run().unwrap_err();
        assert!(matches!(error, JobError::Network(_)));
        assert!(job.should_retry(&error));

        *resend.transport.answer.lock().unwrap() = Err(TransportError::Rejected("413".into()));
        let error = job.run().unwrap_err();
        assert!(matches!(error, JobError::Permanent(_)));
        assert!(!job.should_retry(&error));

        plain.content = b"\x00garbage".to_vec();
        let mut broken = ResendMessageJob::new(resend.resender, plain);
        let error = broken.run().unwrap_err();
        assert!(matches!(error, JobError::Protocol(_)));
        assert!(!broken.should_retry(&error));
        assert!(!broken.should_retry(&JobError::RetryLater("429".into())));
    }
}

//! `courier-protocol`: session state, peers, transport and message resends.
//!
//! ## Components
//!
//! - `SessionLock`: process-wide reentrant guard over the protocol store
//! - `ProtocolStore`: sessions, identities and sender-key state (guard-gated)
//! - `RecipientDirectory`: recipients, groups and distribution lists
//! - `MessageTransport`: delivery of protocol content to a peer
//! - `MessageResender`: resend of previously-sent content after a retry receipt

pub mod content;
pub mod directory;
pub mod error;
pub mod resend;
pub mod session_lock;
pub mod store;
pub mod transport;

pub use content::{Content, ContentHint, SenderKeyDistributionMessage};
pub use directory::{
    DistributionListRecord, GroupRecord, InMemoryRecipientDirectory, Recipient,
    RecipientDirectory, RegistrationState, UnidentifiedAccess,
};
pub use error::{DirectoryError, ProtocolError, ResendError, TransportError};
pub use resend::{MessageResender, ResendOutcome, ResendRequest, SkipReason};
pub use session_lock::{SessionGuard, SessionLock};
pub use store::{
    IdentityChange, IdentityKey, IdentityRecord, InMemoryProtocolStore, ProtocolStore,
    SessionRecord, VerifiedStatus,
};
pub use transport::{MessageTransport, ResendEnvelope, SendMessageResult, SendStatus};

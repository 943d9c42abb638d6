pub mod domain;
pub mod error;
pub mod protocol;

pub use domain::{ChannelId, ChannelKind, MessageId, Topic, UserId, UserProfile};
pub use protocol::{Attachment, EnvelopeKind, EventEnvelope, ParseError, Reaction};

//! Messaging channel implementations and shared channel traits.

pub mod instagram;
pub mod traits;

pub use instagram::{InstagramChannel, WebhookPayload};
pub use traits::{
    ChannelStatus, EventKind, InboundEvent, ReplyPayload, ReplyPipeline, StatusPatch, StatusSink,
};

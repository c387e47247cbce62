//! Convenience re-exports for downstream crates.

pub use crate::backoff::Backoff;
pub use crate::envelope::{CONTENT_TYPE_JSON, Envelope, EnvelopeHeaders, SecurityHeaders};
pub use crate::episode::{Episode, EpisodeKind};
pub use crate::types::{
    CorrelationId, MessageId, Priority, SiteId, TenantId, VsmSystem, now_ms,
};

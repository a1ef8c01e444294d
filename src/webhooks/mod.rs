//! GitHub webhook ingestion: signature check, classification, handlers.

pub mod events;
pub mod handlers;
pub mod router;
pub mod signature;

pub use handlers::{EventHandlers, HandlerOutcome};
pub use router::GitHubEvent;
pub use signature::{payload_hash, WebhookVerifier};

//! Inbound webhook handling.

pub mod ingest;
pub mod validation;

pub use ingest::{WebhookIngestor, WebhookResponse};
pub use validation::{
    RejectionReason, WebhookRequest, WebhookValidation, WebhookVerdict, sign_request,
};

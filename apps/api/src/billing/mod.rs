//! Billing-provider webhooks: signature check, idempotency ledger, plan changes.

pub mod handlers;
pub mod ledger;
pub mod service;
pub mod signature;

pub use ledger::{PgWebhookLedger, WebhookLedger};
pub use service::{BillingDeps, BillingService};

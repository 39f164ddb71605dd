use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// Billing providers whose webhooks we accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Stripe,
    LemonSqueezy,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Stripe => "stripe",
            Provider::LemonSqueezy => "lemonsqueezy",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "stripe" => Some(Provider::Stripe),
            "lemonsqueezy" => Some(Provider::LemonSqueezy),
            _ => None,
        }
    }

    /// Header carrying the delivery signature.
    pub fn signature_header(&self) -> &'static str {
        match self {
            Provider::Stripe => "stripe-signature",
            Provider::LemonSqueezy => "x-signature",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookEventType {
    #[serde(rename = "subscription.created")]
    SubscriptionCreated,
    #[serde(rename = "subscription.updated")]
    SubscriptionUpdated,
    #[serde(rename = "subscription.renewed")]
    SubscriptionRenewed,
    #[serde(rename = "subscription.canceled")]
    SubscriptionCanceled,
}

impl WebhookEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEventType::SubscriptionCreated => "subscription.created",
            WebhookEventType::SubscriptionUpdated => "subscription.updated",
            WebhookEventType::SubscriptionRenewed => "subscription.renewed",
            WebhookEventType::SubscriptionCanceled => "subscription.canceled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "subscription.created" => Some(WebhookEventType::SubscriptionCreated),
            "subscription.updated" => Some(WebhookEventType::SubscriptionUpdated),
            "subscription.renewed" => Some(WebhookEventType::SubscriptionRenewed),
            "subscription.canceled" => Some(WebhookEventType::SubscriptionCanceled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookStatus {
    Processing,
    Processed,
    Failed,
}

impl WebhookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookStatus::Processing => "PROCESSING",
            WebhookStatus::Processed => "PROCESSED",
            WebhookStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PROCESSING" => Some(WebhookStatus::Processing),
            "PROCESSED" => Some(WebhookStatus::Processed),
            "FAILED" => Some(WebhookStatus::Failed),
            _ => None,
        }
    }
}

/// The side effect a processed event had. Replays return it verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppliedAction {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "planChanged")]
    PlanChanged,
    #[serde(rename = "planScheduled")]
    PlanScheduled,
}

impl AppliedAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppliedAction::None => "none",
            AppliedAction::PlanChanged => "planChanged",
            AppliedAction::PlanScheduled => "planScheduled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(AppliedAction::None),
            "planChanged" => Some(AppliedAction::PlanChanged),
            "planScheduled" => Some(AppliedAction::PlanScheduled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BillingWebhookEventRow {
    pub id: Uuid,
    pub provider: String,
    pub external_event_id: String,
    pub event_type: String,
    pub signature: String,
    pub payload: Value,
    pub user_id: Option<Uuid>,
    pub status: String,
    pub applied_action: String,
    pub error: Option<String>,
    pub replay_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BillingWebhookEventRow {
    pub fn status(&self) -> WebhookStatus {
        WebhookStatus::parse(&self.status).unwrap_or(WebhookStatus::Processing)
    }

    pub fn applied(&self) -> AppliedAction {
        AppliedAction::parse(&self.applied_action).unwrap_or(AppliedAction::None)
    }
}

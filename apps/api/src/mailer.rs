//! Outgoing email through an HTTP mail relay. Delivery is best-effort; the
//! export pipeline retries failed sends through the job queue.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use crate::errors::AppError;

#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub content: Bytes,
}

#[derive(Debug, Clone)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub text: String,
    pub attachments: Vec<Attachment>,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), AppError>;
}

#[derive(Clone)]
pub struct HttpMailer {
    client: Client,
    relay_url: String,
    token: Option<String>,
    from: String,
}

impl HttpMailer {
    pub fn new(relay_url: String, token: Option<String>, from: String) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            relay_url,
            token,
            from,
        })
    }

    fn payload(&self, email: &OutgoingEmail) -> Value {
        let attachments: Vec<Value> = email
            .attachments
            .iter()
            .map(|a| {
                json!({
                    "filename": a.filename,
                    "content_type": a.content_type,
                    "content": STANDARD.encode(&a.content),
                })
            })
            .collect();
        json!({
            "from": self.from,
            "to": email.to,
            "subject": email.subject,
            "text": email.text,
            "attachments": attachments,
        })
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), AppError> {
        let mut request = self.client.post(&self.relay_url).json(&self.payload(email));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::Upstream(format!("Mail relay unreachable: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Upstream(format!(
                "Mail relay returned {status}: {body}"
            )));
        }

        debug!(to = %email.to, subject = %email.subject, "Email handed to relay");
        Ok(())
    }
}

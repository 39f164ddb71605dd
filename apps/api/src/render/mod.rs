//! PDF rendering. Snapshot content is turned into HTML here; the HTML → PDF
//! conversion is delegated to an external rendering service.

pub mod html;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use crate::errors::AppError;

pub use html::render_resume_html;

#[async_trait]
pub trait PdfRenderer: Send + Sync {
    async fn render_pdf(&self, html: &str) -> Result<Bytes, AppError>;
}

#[derive(Serialize)]
struct RenderRequest<'a> {
    html: &'a str,
    format: &'a str,
    print_background: bool,
}

/// Client for the HTML → PDF service.
#[derive(Clone)]
pub struct HttpPdfRenderer {
    client: Client,
    url: String,
}

impl HttpPdfRenderer {
    pub fn new(url: String, timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl PdfRenderer for HttpPdfRenderer {
    async fn render_pdf(&self, html: &str) -> Result<Bytes, AppError> {
        let response = self
            .client
            .post(&self.url)
            .json(&RenderRequest {
                html,
                format: "Letter",
                print_background: true,
            })
            .send()
            .await
            .map_err(|e| AppError::Upstream(format!("PDF renderer unreachable: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Upstream(format!(
                "PDF renderer returned {status}: {body}"
            )));
        }

        let pdf = response
            .bytes()
            .await
            .map_err(|e| AppError::Upstream(format!("PDF renderer body: {e}")))?;
        if pdf.is_empty() {
            return Err(AppError::Upstream("PDF renderer returned an empty document".into()));
        }

        debug!(size = pdf.len(), "Rendered PDF");
        Ok(pdf)
    }
}

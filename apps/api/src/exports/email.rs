//! Export emails: the message sent for a READY export, and the total parser
//! that rebuilds an `EmailJob` from a failure row's metadata.

use bytes::Bytes;
use serde_json::{json, Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::mailer::{Attachment, OutgoingEmail};
use crate::queue::{EmailJob, EmailReason};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EmailJobParseError {
    #[error("failure record has no job payload")]
    MissingJob,

    #[error("job field '{0}' is missing")]
    Missing(&'static str),

    #[error("job field '{0}' is invalid")]
    Invalid(&'static str),
}

/// Metadata stored with an `export.email.failed` row.
pub fn failure_metadata(job: &EmailJob, error: &str) -> Value {
    json!({
        "exportId": job.export_id,
        "reason": job.reason.as_str(),
        "error": error,
        "job": job,
    })
}

pub fn parse_email_job(metadata: &Value) -> Result<EmailJob, EmailJobParseError> {
    let job = metadata
        .get("job")
        .and_then(Value::as_object)
        .ok_or(EmailJobParseError::MissingJob)?;

    let reason = EmailReason::parse(&required_str(job, "reason")?)
        .ok_or(EmailJobParseError::Invalid("reason"))?;
    let to = required_str(job, "to")?;
    if !looks_like_email(&to) {
        return Err(EmailJobParseError::Invalid("to"));
    }

    let recipient = match job.get("recipient") {
        None | Some(Value::Null) => None,
        Some(Value::String(r)) if looks_like_email(r) => Some(r.clone()),
        Some(_) => return Err(EmailJobParseError::Invalid("recipient")),
    };
    if reason == EmailReason::BulkApply && recipient.is_none() {
        return Err(EmailJobParseError::Missing("recipient"));
    }

    Ok(EmailJob {
        export_id: required_uuid(job, "exportId")?,
        user_id: required_uuid(job, "userId")?,
        to,
        reason,
        recipient,
    })
}

fn required_str(job: &Map<String, Value>, field: &'static str) -> Result<String, EmailJobParseError> {
    match job.get(field) {
        None | Some(Value::Null) => Err(EmailJobParseError::Missing(field)),
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(_) => Err(EmailJobParseError::Invalid(field)),
    }
}

fn required_uuid(job: &Map<String, Value>, field: &'static str) -> Result<Uuid, EmailJobParseError> {
    Uuid::parse_str(&required_str(job, field)?).map_err(|_| EmailJobParseError::Invalid(field))
}

/// Loose shape check: one `@`, non-empty local part, dotted domain, no whitespace.
pub fn looks_like_email(value: &str) -> bool {
    if value.chars().any(char::is_whitespace) {
        return false;
    }
    let mut parts = value.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(local), Some(domain), None) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        _ => false,
    }
}

pub fn build_export_email(job: &EmailJob, pdf: Bytes) -> OutgoingEmail {
    let filename = format!("resume-{}.pdf", job.export_id);
    let (to, subject, text) = match (job.reason, &job.recipient) {
        (EmailReason::BulkApply, Some(recipient)) => (
            recipient.clone(),
            "Job application".to_string(),
            format!(
                "Please find the applicant's resume attached. Replies can go to {}.",
                job.to
            ),
        ),
        _ => (
            job.to.clone(),
            "Your resume export is ready".to_string(),
            "Your exported resume is attached to this email.".to_string(),
        ),
    };

    OutgoingEmail {
        to,
        subject,
        text,
        attachments: vec![Attachment {
            filename,
            content_type: "application/pdf".to_string(),
            content: pdf,
        }],
    }
}

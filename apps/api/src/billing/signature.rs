//! Webhook signature schemes. Every comparison goes through `Mac::verify_slice`.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use crate::config::WebhookConfig;
use crate::models::billing::Provider;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("no webhook secret configured for {0}")]
    NotConfigured(&'static str),

    #[error("signature header missing")]
    MissingHeader,

    #[error("signature header malformed")]
    Malformed,

    #[error("signature timestamp outside tolerance")]
    Expired,

    #[error("signature mismatch")]
    Mismatch,
}

fn mac(secret: &str) -> HmacSha256 {
    HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can use any key length")
}

/// `stripe-signature: t=<unix>,v1=<hex>[,v1=<hex>...]` over `"{t}.{body}"`.
pub fn verify_stripe(
    secret: &str,
    header: &str,
    body: &[u8],
    tolerance_secs: i64,
    now_unix: i64,
) -> Result<(), SignatureError> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<Vec<u8>> = Vec::new();
    for part in header.split(',') {
        let Some((name, value)) = part.trim().split_once('=') else {
            return Err(SignatureError::Malformed);
        };
        match name {
            "t" => timestamp = Some(value.parse().map_err(|_| SignatureError::Malformed)?),
            "v1" => {
                if let Ok(bytes) = hex::decode(value) {
                    candidates.push(bytes);
                }
            }
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    if candidates.is_empty() {
        return Err(SignatureError::Malformed);
    }
    if (now_unix - timestamp).abs() > tolerance_secs {
        return Err(SignatureError::Expired);
    }

    let mut signed = mac(secret);
    signed.update(timestamp.to_string().as_bytes());
    signed.update(b".");
    signed.update(body);
    let matched = candidates
        .iter()
        .any(|candidate| signed.clone().verify_slice(candidate).is_ok());
    if matched {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// `x-signature: <hex hmac of body>`.
pub fn verify_lemonsqueezy(secret: &str, header: &str, body: &[u8]) -> Result<(), SignatureError> {
    let provided = hex::decode(header.trim()).map_err(|_| SignatureError::Malformed)?;
    let mut signed = mac(secret);
    signed.update(body);
    signed
        .verify_slice(&provided)
        .map_err(|_| SignatureError::Mismatch)
}

pub fn verify(
    provider: Provider,
    config: &WebhookConfig,
    header: Option<&str>,
    body: &[u8],
    now_unix: i64,
) -> Result<(), SignatureError> {
    let secret = match provider {
        Provider::Stripe => config.stripe_secret.as_deref(),
        Provider::LemonSqueezy => config.lemonsqueezy_secret.as_deref(),
    }
    .ok_or(SignatureError::NotConfigured(provider.as_str()))?;
    let header = header.ok_or(SignatureError::MissingHeader)?;

    match provider {
        Provider::Stripe => {
            verify_stripe(secret, header, body, config.stripe_tolerance_secs, now_unix)
        }
        Provider::LemonSqueezy => verify_lemonsqueezy(secret, header, body),
    }
}

#[cfg(test)]
pub(crate) fn sign_for_tests(secret: &str, message: &[u8]) -> String {
    let mut signed = mac(secret);
    signed.update(message);
    hex::encode(signed.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = br#"{"eventId":"evt_1"}"#;
    const NOW: i64 = 1_700_000_000;

    fn stripe_header(secret: &str, t: i64) -> String {
        let message = format!("{t}.{}", std::str::from_utf8(BODY).unwrap());
        format!("t={t},v1={}", sign_for_tests(secret, message.as_bytes()))
    }

    #[test]
    fn test_stripe_signature_accepted() {
        let header = stripe_header("whsec_test", NOW);
        assert_eq!(verify_stripe("whsec_test", &header, BODY, 300, NOW), Ok(()));
    }

    #[test]
    fn test_stripe_any_v1_may_match() {
        let good = stripe_header("whsec_test", NOW);
        let header = format!("t={NOW},v1={},{}", "00".repeat(32), &good[good.find("v1=").unwrap()..]);
        assert_eq!(verify_stripe("whsec_test", &header, BODY, 300, NOW), Ok(()));
    }

    #[test]
    fn test_stripe_wrong_secret_rejected() {
        let header = stripe_header("other", NOW);
        assert_eq!(
            verify_stripe("whsec_test", &header, BODY, 300, NOW),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_stripe_stale_timestamp_rejected() {
        let header = stripe_header("whsec_test", NOW - 301);
        assert_eq!(
            verify_stripe("whsec_test", &header, BODY, 300, NOW),
            Err(SignatureError::Expired)
        );
    }

    #[test]
    fn test_stripe_malformed_header_rejected() {
        assert_eq!(
            verify_stripe("whsec_test", "garbage", BODY, 300, NOW),
            Err(SignatureError::Malformed)
        );
        assert_eq!(
            verify_stripe("whsec_test", &format!("t={NOW}"), BODY, 300, NOW),
            Err(SignatureError::Malformed)
        );
    }

    #[test]
    fn test_lemonsqueezy_signature() {
        let header = sign_for_tests("ls_test", BODY);
        assert_eq!(verify_lemonsqueezy("ls_test", &header, BODY), Ok(()));
        assert_eq!(
            verify_lemonsqueezy("ls_test", &header, b"{}"),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify_lemonsqueezy("ls_test", "zz", BODY),
            Err(SignatureError::Malformed)
        );
    }

    #[test]
    fn test_unconfigured_provider_rejected() {
        let config = WebhookConfig {
            stripe_secret: None,
            lemonsqueezy_secret: Some("ls_test".into()),
            stripe_tolerance_secs: 300,
        };
        assert_eq!(
            verify(Provider::Stripe, &config, Some("t=1,v1=00"), BODY, NOW),
            Err(SignatureError::NotConfigured("stripe"))
        );
        assert_eq!(
            verify(Provider::LemonSqueezy, &config, None, BODY, NOW),
            Err(SignatureError::MissingHeader)
        );
    }
}

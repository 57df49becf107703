//! Payment provider webhook verification and parsing.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;

use crate::domain::reconciliation::PaymentEvent;
use crate::{Result, StorefrontError};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-signature";

/// Checks the HMAC-SHA256 signature providers attach to webhook bodies.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Vec<u8>,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier").finish_non_exhaustive()
    }
}

impl SignatureVerifier {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self { secret: secret.as_ref().to_vec() }
    }

    /// Hex signature of `payload`, as a provider would send it.
    pub fn sign(&self, payload: &[u8]) -> String {
        hex::encode(self.mac(payload).finalize().into_bytes())
    }

    /// Constant-time check of a hex signature, optionally prefixed with `sha256=`.
    pub fn verify(&self, payload: &[u8], signature: Option<&str>) -> Result<()> {
        let signature = signature.map(str::trim).ok_or(StorefrontError::InvalidSignature)?;
        let signature = signature.strip_prefix("sha256=").unwrap_or(signature);
        let expected = hex::decode(signature).map_err(|_| StorefrontError::InvalidSignature)?;
        self.mac(payload).verify_slice(&expected).map_err(|_| StorefrontError::InvalidSignature)
    }

    fn mac(&self, payload: &[u8]) -> HmacSha256 {
        // HMAC accepts keys of any length, so this cannot fail.
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.secret)
            .unwrap_or_else(|_| unreachable!("HMAC key length is unrestricted"));
        mac.update(payload);
        mac
    }
}

/// Body of a provider status callback.
#[derive(Debug, Deserialize)]
pub struct PaymentNotification {
    #[serde(alias = "reference", alias = "order_id")]
    pub order_reference: String,
    #[serde(alias = "payment_status")]
    pub status: String,
    #[serde(default, alias = "confirmation_code")]
    pub transaction_id: Option<String>,
}

impl PaymentNotification {
    /// Parse a verified body into a reconciliation event for `provider`.
    pub fn parse(provider: &str, body: &[u8]) -> Result<PaymentEvent> {
        let raw_payload: Value =
            serde_json::from_slice(body).map_err(|e| StorefrontError::MalformedPayload(e.to_string()))?;
        let notification = PaymentNotification::deserialize(&raw_payload)
            .map_err(|e| StorefrontError::MalformedPayload(e.to_string()))?;
        if notification.order_reference.trim().is_empty() {
            return Err(StorefrontError::MalformedPayload("empty order reference".into()));
        }
        Ok(PaymentEvent {
            provider: provider.to_string(),
            order_reference: notification.order_reference,
            reported_status: notification.status,
            transaction_id: notification.transaction_id.filter(|t| !t.trim().is_empty()),
            raw_payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = br#"{"order_reference":"0191b3c4-0000-7000-8000-000000000001","status":"COMPLETED","transaction_id":"TX1"}"#;

    #[test]
    fn test_valid_signature() {
        let verifier = SignatureVerifier::new("whsec_test");
        let sig = verifier.sign(BODY);
        assert!(verifier.verify(BODY, Some(&sig)).is_ok());
        assert!(verifier.verify(BODY, Some(&format!("sha256={sig}"))).is_ok());
    }

    #[test]
    fn test_invalid_signature() {
        let verifier = SignatureVerifier::new("whsec_test");
        let wrong = SignatureVerifier::new("wrong_secret").sign(BODY);
        assert!(matches!(verifier.verify(BODY, Some(&wrong)), Err(StorefrontError::InvalidSignature)));
        assert!(matches!(verifier.verify(BODY, None), Err(StorefrontError::InvalidSignature)));
        assert!(matches!(verifier.verify(BODY, Some("not-hex")), Err(StorefrontError::InvalidSignature)));

        let sig = verifier.sign(BODY);
        let tampered = br#"{"order_reference":"x","status":"COMPLETED"}"#;
        assert!(matches!(verifier.verify(tampered, Some(&sig)), Err(StorefrontError::InvalidSignature)));
    }

    #[test]
    fn test_parse_notification() {
        let event = PaymentNotification::parse("card", BODY).unwrap();
        assert_eq!(event.provider, "card");
        assert_eq!(event.reported_status, "COMPLETED");
        assert_eq!(event.transaction_id.as_deref(), Some("TX1"));
        assert_eq!(event.raw_payload["order_reference"], "0191b3c4-0000-7000-8000-000000000001");
    }

    #[test]
    fn test_parse_aliases() {
        let body = br#"{"reference":"abc","payment_status":"FAILED","confirmation_code":"","phone":"+254700"}"#;
        let event = PaymentNotification::parse("mobile_money", body).unwrap();
        assert_eq!(event.order_reference, "abc");
        assert_eq!(event.reported_status, "FAILED");
        assert_eq!(event.transaction_id, None);
        assert_eq!(event.raw_payload["phone"], "+254700");
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(matches!(PaymentNotification::parse("card", b"not json"), Err(StorefrontError::MalformedPayload(_))));
        assert!(matches!(PaymentNotification::parse("card", br#"{"status":"COMPLETED"}"#), Err(StorefrontError::MalformedPayload(_))));
        assert!(matches!(
            PaymentNotification::parse("card", br#"{"order_reference":" ","status":"COMPLETED"}"#),
            Err(StorefrontError::MalformedPayload(_))
        ));
    }
}

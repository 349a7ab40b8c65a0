//! Webhook signature verification.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// Verify the lowercase-hex HMAC-SHA256 signature the gateway computes over
/// the raw request body. Comparison is constant time. An empty configured
/// secret is a deployment fault, not an authentication failure.
pub fn verify_webhook_signature(secret: &str, body: &[u8], signature: &str) -> BillingResult<()> {
    if secret.is_empty() {
        return Err(BillingError::Configuration(
            "webhook secret is not configured".to_string(),
        ));
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Configuration("webhook secret is unusable".to_string()))?;
    mac.update(body);
    let expected = hex::encode(mac.finalize().into_bytes());

    let provided = signature.trim().to_lowercase();
    if expected.as_bytes().ct_eq(provided.as_bytes()).into() {
        Ok(())
    } else {
        Err(BillingError::Signature)
    }
}

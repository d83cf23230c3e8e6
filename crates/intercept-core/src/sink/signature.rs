//! Webhook payload signing.

use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tracing::info;

use crate::error::{InterceptError, InterceptResult};
use crate::http::env_lookup;

type HmacSha256 = Hmac<Sha256>;

const SECRET_PREFIX: &str = "whsec_";

/// HMAC-SHA256 key for the `X-Signature` header.
#[derive(Clone)]
pub struct WebhookSecret {
    secret: String,
    key: Vec<u8>,
}

impl std::fmt::Debug for WebhookSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookSecret")
            .field("key_len", &self.key.len())
            .finish_non_exhaustive()
    }
}

impl WebhookSecret {
    /// `whsec_` + URL-safe base64 of 32 random bytes.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self {
            secret: format!("{SECRET_PREFIX}{}", URL_SAFE.encode(bytes)),
            key: bytes.to_vec(),
        }
    }

    /// Parse a configured secret. The `whsec_` form carries base64 key
    /// bytes; anything else is used verbatim.
    pub fn parse(secret: &str) -> InterceptResult<Self> {
        let key = match secret.strip_prefix(SECRET_PREFIX) {
            Some(encoded) => URL_SAFE
                .decode(encoded)
                .or_else(|_| URL_SAFE_NO_PAD.decode(encoded))
                .map_err(|e| InterceptError::config(format!("invalid webhook secret: {e}")))?,
            None => secret.as_bytes().to_vec(),
        };
        if key.is_empty() {
            return Err(InterceptError::config("webhook secret is empty"));
        }
        Ok(Self {
            secret: secret.to_string(),
            key,
        })
    }

    /// Secret from the environment variable named by `Flags.webhook_secret`,
    /// else a fresh one for this process.
    pub fn resolve(env_var: Option<&str>) -> InterceptResult<Self> {
        let configured = env_var
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .and_then(env_lookup);
        match configured {
            Some(secret) => Self::parse(secret.trim()),
            None => {
                if let Some(name) = env_var.filter(|n| !n.trim().is_empty()) {
                    info!(variable = %name, "webhook secret variable unset, generating one");
                }
                Ok(Self::generate())
            }
        }
    }

    /// The secret as configured or generated.
    pub fn expose(&self) -> &str {
        &self.secret
    }

    /// base64(HMAC-SHA256(body, key)).
    pub fn sign(&self, body: &[u8]) -> InterceptResult<String> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| InterceptError::config(format!("invalid webhook key: {e}")))?;
        mac.update(body);
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// Constant-time check of a received signature.
    pub fn verify(&self, body: &[u8], signature: &str) -> bool {
        let Ok(expected) = STANDARD.decode(signature) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.key) else {
            return false;
        };
        mac.update(body);
        mac.verify_slice(&expected).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn generated_secret_round_trips_through_parse() {
        let secret = WebhookSecret::generate();
        assert!(secret.expose().starts_with("whsec_"));
        let parsed = WebhookSecret::parse(secret.expose()).unwrap();
        assert_eq!(parsed.sign(b"body").unwrap(), secret.sign(b"body").unwrap());
    }

    #[test]
    fn raw_secret_is_used_verbatim() {
        // RFC 4231 test case 2.
        let secret = WebhookSecret::parse("Jefe").unwrap();
        let signature = secret.sign(b"what do ya want for nothing?").unwrap();
        let expected =
            hex::decode("5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843").unwrap();
        assert_eq!(signature, STANDARD.encode(expected));
        assert!(secret.verify(b"what do ya want for nothing?", &signature));
        assert!(!secret.verify(b"tampered", &signature));
    }

    #[test]
    fn invalid_prefixed_secret_is_rejected() {
        assert!(WebhookSecret::parse("whsec_***").is_err());
        assert!(WebhookSecret::parse("").is_err());
    }

    #[test]
    #[serial]
    fn resolve_reads_named_variable() {
        std::env::set_var("INTERCEPT_TEST_HOOK_SECRET", "Jefe");
        let secret = WebhookSecret::resolve(Some("INTERCEPT_TEST_HOOK_SECRET")).unwrap();
        std::env::remove_var("INTERCEPT_TEST_HOOK_SECRET");
        assert_eq!(secret.expose(), "Jefe");

        let generated = WebhookSecret::resolve(Some("INTERCEPT_TEST_HOOK_SECRET")).unwrap();
        assert!(generated.expose().starts_with("whsec_"));
        assert!(WebhookSecret::resolve(None).is_ok());
    }
}

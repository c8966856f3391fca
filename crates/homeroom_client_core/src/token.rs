#![forbid(unsafe_code)]

//! Client-side minting of `v1.<payload>.<sig>` access tokens.
//!
//! The identity service signs these for real deployments; this module exists
//! for tooling and test harnesses that need a token for a known shared secret.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Mint a token for `user_id`, valid for `ttl` from now.
pub fn mint_user_token(user_id: &str, secret: &str, ttl: Duration) -> String {
	let exp = SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default()
		.as_secs()
		.saturating_add(ttl.as_secs());
	mint_user_token_with_expiry(user_id, secret, exp)
}

/// Mint a token with an explicit expiry (unix seconds).
pub fn mint_user_token_with_expiry(user_id: &str, secret: &str, exp_unix_secs: u64) -> String {
	let payload = serde_json::json!({ "sub": user_id, "exp": exp_unix_secs });
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload.to_string());

	let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
	mac.update(payload_b64.as_bytes());
	let sig_b64 = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

	format!("v1.{payload_b64}.{sig_b64}")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn token_has_v1_shape() {
		let token = mint_user_token("u-77", "secret", Duration::from_secs(60));
		let parts: Vec<&str> = token.split('.').collect();
		assert_eq!(parts.len(), 3);
		assert_eq!(parts[0], "v1");

		let payload = URL_SAFE_NO_PAD.decode(parts[1]).expect("payload decodes");
		let claims: serde_json::Value = serde_json::from_slice(&payload).expect("payload is json");
		assert_eq!(claims["sub"], "u-77");
		assert!(claims["exp"].as_u64().unwrap() > 0);
	}

	#[test]
	fn different_secrets_produce_different_signatures() {
		let a = mint_user_token_with_expiry("u-77", "secret-a", 4_000_000_000);
		let b = mint_user_token_with_expiry("u-77", "secret-b", 4_000_000_000);
		assert_ne!(a, b);

		// Same payload, so only the signature part differs.
		assert_eq!(a.split('.').nth(1), b.split('.').nth(1));
	}
}

//! Challenge/response login
//!
//! The relay hands every new session a random challenge; the client proves it
//! knows the pre-shared key by returning `hex(HMAC-SHA1(key, challenge))`.

use rand::distributions::Alphanumeric;
use rand::Rng;
use ring::hmac;
use thiserror::Error;

/// Challenge length in characters
pub const CHALLENGE_LEN: usize = 16;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("Challenge response does not match")]
    ChallengeMismatch,

    #[error("Session is not authenticated")]
    NotAuthenticated,
}

/// Fresh random alphanumeric challenge
pub fn new_challenge() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CHALLENGE_LEN)
        .map(char::from)
        .collect()
}

/// Lowercase hex HMAC-SHA1 of `challenge` under `key`
pub fn sign_challenge(challenge: &str, key: &str) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, key.as_bytes());
    hex::encode(hmac::sign(&key, challenge.as_bytes()).as_ref())
}

/// Check a client's response. Without a key every response is accepted.
pub fn verify(challenge: &str, key: Option<&str>, response: &str) -> Result<(), AuthError> {
    let key = match key {
        Some(key) => key,
        None => return Ok(()),
    };

    let tag = hex::decode(response.trim()).map_err(|_| AuthError::ChallengeMismatch)?;
    let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, key.as_bytes());
    hmac::verify(&key, challenge.as_bytes(), &tag).map_err(|_| AuthError::ChallengeMismatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_shape() {
        let a = new_challenge();
        let b = new_challenge();
        assert_eq!(a.len(), CHALLENGE_LEN);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_sign_rfc2202_vector() {
        // RFC 2202 test case 2
        assert_eq!(
            sign_challenge("what do ya want for nothing?", "Jefe"),
            "effcdf6ae5eb2fa2d27416d5f184df9c259a7c79"
        );
    }

    #[test]
    fn test_verify() {
        let challenge = new_challenge();
        let response = sign_challenge(&challenge, "secret");

        assert_eq!(verify(&challenge, Some("secret"), &response), Ok(()));
        assert_eq!(
            verify(&challenge, Some("secret"), &response.to_uppercase()),
            Ok(())
        );
        assert_eq!(
            verify(&challenge, Some("other"), &response),
            Err(AuthError::ChallengeMismatch)
        );
        assert_eq!(
            verify(&challenge, Some("secret"), "not hex"),
            Err(AuthError::ChallengeMismatch)
        );
    }

    #[test]
    fn test_no_key_accepts_anything() {
        assert_eq!(verify("abc", None, ""), Ok(()));
    }
}

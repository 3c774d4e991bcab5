//! Password hashing.
//!
//! Argon2id with PHC-string storage. Verification is constant-time inside
//! the `argon2` crate. The generated salt is returned separately so it can
//! be persisted in the `salt` column alongside the hash.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;

use crate::error::{Error, Result};

/// Hash a password with a fresh random salt.
///
/// Returns `(phc_string, salt)`.
///
/// # Errors
/// Returns an error if the hasher rejects its inputs, which does not happen
/// for ordinary UTF-8 passwords.
pub fn hash_password(password: &str) -> Result<(String, String)> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| Error::PasswordHash(e.to_string()))?;
    Ok((hash.to_string(), salt.to_string()))
}

/// Verify a password against a stored PHC string.
///
/// Malformed stored hashes verify as false rather than erroring; a corrupted
/// row must not let anybody in.
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_verifies() {
        let (hash, _salt) = hash_password("password1234").unwrap();
        assert!(verify_password("password1234", &hash));
    }

    #[test]
    fn wrong_password_fails() {
        let (hash, _salt) = hash_password("password1234").unwrap();
        assert!(!verify_password("password1235", &hash));
    }

    #[test]
    fn salts_are_unique_per_hash() {
        let (hash_a, salt_a) = hash_password("password1234").unwrap();
        let (hash_b, salt_b) = hash_password("password1234").unwrap();
        assert_ne!(salt_a, salt_b);
        assert_ne!(hash_a, hash_b);
    }

    #[test]
    fn malformed_stored_hash_is_rejected() {
        assert!(!verify_password("password1234", "not-a-phc-string"));
    }
}

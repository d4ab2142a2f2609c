use argon2::{Argon2, PasswordHash, PasswordVerifier};

/// Checks a candidate password against the credential stored for an account
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, stored: &str, candidate: &str) -> bool;
}

/// Trimmed equality against a plaintext credential
pub struct PlaintextVerifier;

impl CredentialVerifier for PlaintextVerifier {
    fn verify(&self, stored: &str, candidate: &str) -> bool {
        stored.trim() == candidate.trim()
    }
}

/// Verifies against an argon2 PHC string; anything else is rejected
pub struct Argon2Verifier;

impl CredentialVerifier for Argon2Verifier {
    fn verify(&self, stored: &str, candidate: &str) -> bool {
        match PasswordHash::new(stored.trim()) {
            Ok(hash) => Argon2::default()
                .verify_password(candidate.trim().as_bytes(), &hash)
                .is_ok(),
            Err(_) => false,
        }
    }
}

/// Argon2 for hashed credentials, plaintext equality for legacy rows
pub struct CompatibleVerifier;

impl CredentialVerifier for CompatibleVerifier {
    fn verify(&self, stored: &str, candidate: &str) -> bool {
        if stored.trim_start().starts_with("$argon2") {
            Argon2Verifier.verify(stored, candidate)
        } else {
            PlaintextVerifier.verify(stored, candidate)
        }
    }
}

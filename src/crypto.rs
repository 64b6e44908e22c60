//! Cryptographic logics: password hashing, OTPs and invite codes.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Argon2, Params, Version};
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use validator::{ValidationError, ValidationErrors};

use crate::config::Argon2 as ArgonConfig;

/// Invite codes are 4 random bytes rendered as uppercase hex.
pub const INVITE_CODE_BYTES: usize = 4;
pub const OTP_DIGITS: u32 = 6;

type Result<T> = std::result::Result<T, CryptoError>;

#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
    #[error("argon2 error: {0}")]
    Argon2(String),
}

/// Cryptographic manager.
pub struct Crypto {
    pub pwd: PasswordManager,
}

impl Crypto {
    /// Create a new [`Crypto`].
    pub fn new(config: Option<ArgonConfig>) -> Result<Self> {
        let pwd = PasswordManager::new(config)?;

        Ok(Self { pwd })
    }
}

/// Password manager that uses Argon2id and PHC string format for hashing and
/// verification.
pub struct PasswordManager {
    params: Params,
}

impl PasswordManager {
    /// Create a new [`PasswordManager`].
    pub fn new(config: Option<ArgonConfig>) -> Result<Self> {
        let config = config.unwrap_or_default();

        let params = Params::new(
            config.memory_cost,
            config.iterations,
            config.parallelism,
            Some(config.hash_length),
        )
        .map_err(|err| CryptoError::Argon2(err.to_string()))?;

        Ok(Self { params })
    }

    /// Hash password using Argon2id.
    pub fn hash_password(&self, password: impl AsRef<[u8]>) -> Result<String> {
        let argon2 = Argon2::new(
            argon2::Algorithm::Argon2id,
            Version::V0x13,
            self.params.clone(),
        );
        let salt = SaltString::generate(&mut OsRng);
        let hash = argon2
            .hash_password(password.as_ref(), &salt)
            .map_err(|e| CryptoError::Argon2(e.to_string()))?;

        Ok(hash.to_string())
    }

    fn invalid_password() -> ValidationErrors {
        let mut errors = ValidationErrors::new();
        errors.add(
            "password",
            ValidationError::new("invalid_password")
                .with_message("Invalid email or password.".into()),
        );
        errors
    }

    /// Verify password against a PHC.
    pub fn verify_password(
        &self,
        password: impl AsRef<[u8]>,
        phc_hash: impl ToString,
    ) -> std::result::Result<(), ValidationErrors> {
        let argon2 = Argon2::new(
            argon2::Algorithm::Argon2id,
            Version::V0x13,
            self.params.clone(),
        );
        let phc_hash = phc_hash.to_string();

        let parsed = PasswordHash::new(&phc_hash).map_err(|_| Self::invalid_password())?;

        argon2
            .verify_password(password.as_ref(), &parsed)
            .map_err(|_| Self::invalid_password())
    }
}

/// Generate a 6-digit one-time password.
pub fn generate_otp() -> String {
    let code: u32 = OsRng.gen_range(0..10u32.pow(OTP_DIGITS));
    format!("{code:06}")
}

/// Generate an 8-character uppercase hexadecimal invite code.
///
/// Uniqueness against existing users is the caller's concern; this only
/// produces the candidate.
pub fn generate_invite_code() -> String {
    let mut bytes = [0u8; INVITE_CODE_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes).to_uppercase()
}

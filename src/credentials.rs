//! Credential service (C2): bearer token issuance/verification and password
//! hashing. Stateless — holds only the keying material and cost parameters
//! needed to do both.
//!
//! Grounded on `auth/tokens/jwt_generator.rs` (HS256 encode/decode shape) and
//! `auth/password.rs` (Argon2id hash/verify/needs_rehash), narrowed to a
//! single shared-secret algorithm and a fixed claim set since the bearer
//! format here is a plain `{sub, role, exp, iat}` token, not a multi-purpose
//! user/client JWT with roles and permission lists.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString},
    Algorithm as Argon2Algorithm, Argon2, Params, Version,
};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};

use crate::config::CredentialConfig;
use crate::error::{Error, Result};
use crate::models::{Claims, Role};

/// OWASP-recommended Argon2id parameters: 19 MiB memory, 2 iterations,
/// 1-degree parallelism.
const ARGON2_MEMORY_COST_KIB: u32 = 19456;
const ARGON2_TIME_COST: u32 = 2;
const ARGON2_PARALLELISM: u32 = 1;
const MIN_PASSWORD_LENGTH: usize = 8;

/// Issues and verifies bearer tokens, hashes and compares passwords.
#[derive(Clone)]
pub struct Credentials {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    token_expiry_secs: i64,
    argon2_params: Params,
}

impl Credentials {
    pub fn new(config: &CredentialConfig) -> Result<Self> {
        let algorithm = parse_algorithm(&config.algorithm)?;

        // Tokens here carry a fixed {sub, role, exp, iat} claim set with no
        // iss/aud; issuer/audience in config are validated by callers that
        // read them directly, not by this decoder.
        let mut validation = Validation::new(algorithm);
        validation.validate_aud = false;

        let params = Params::new(
            ARGON2_MEMORY_COST_KIB,
            ARGON2_TIME_COST,
            ARGON2_PARALLELISM,
            None,
        )
        .map_err(|e| Error::Config(format!("invalid argon2 parameters: {e}")))?;

        Ok(Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
            token_expiry_secs: config.token_expiry().as_secs() as i64,
            argon2_params: params,
        })
    }

    /// Issue a bearer token for `user_id`/`role`, expiring after the
    /// configured lifetime.
    pub fn issue(&self, user_id: &str, role: Role) -> Result<String> {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            role,
            iat: now,
            exp: now + self.token_expiry_secs,
        };

        let header = Header::new(self.validation.algorithms[0]);
        encode(&header, &claims, &self.encoding_key).map_err(Error::Jwt)
    }

    /// Verify a bearer token, returning its claims.
    ///
    /// An empty token, or the literal strings `"undefined"`/`"null"` sent by
    /// a client with no stored credential, are treated as a missing token
    /// rather than a malformed one.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        if token.is_empty() || token == "undefined" || token == "null" {
            return Err(Error::Auth("token is missing or invalid".into()));
        }

        match decode::<Claims>(token, &self.decoding_key, &self.validation) {
            Ok(data) => Ok(data.claims),
            Err(e) => match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => Err(Error::Expired),
                _ => Err(Error::Auth(format!("token verification failed: {e}"))),
            },
        }
    }

    /// Hash a plaintext password, returning a PHC-format string.
    pub fn hash_password(&self, password: &str) -> Result<String> {
        if password.len() < MIN_PASSWORD_LENGTH {
            return Err(Error::Validation(format!(
                "password must be at least {MIN_PASSWORD_LENGTH} characters"
            )));
        }

        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::new(Argon2Algorithm::Argon2id, Version::V0x13, self.argon2_params.clone());
        let hash = argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| Error::Internal(format!("password hash failed: {e}")))?;

        Ok(hash.to_string())
    }

    /// Compare a plaintext password against a stored digest.
    pub fn verify_password(&self, password: &str, digest: &str) -> Result<bool> {
        let parsed = PasswordHash::new(digest)
            .map_err(|e| Error::Internal(format!("stored password digest is corrupt: {e}")))?;

        match Argon2::default().verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(Error::Internal(format!("password verification failed: {e}"))),
        }
    }
}

fn parse_algorithm(alg: &str) -> Result<jsonwebtoken::Algorithm> {
    match alg.to_uppercase().as_str() {
        "HS256" => Ok(jsonwebtoken::Algorithm::HS256),
        "HS384" => Ok(jsonwebtoken::Algorithm::HS384),
        "HS512" => Ok(jsonwebtoken::Algorithm::HS512),
        other => Err(Error::Config(format!("unsupported credential algorithm: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> Credentials {
        let config = CredentialConfig {
            secret: "test-secret-key-at-least-32-bytes-long".into(),
            algorithm: "HS256".into(),
            issuer: None,
            audience: None,
            token_expiry_minutes: 30,
        };
        Credentials::new(&config).unwrap()
    }

    #[test]
    fn issue_then_verify_round_trips_claims() {
        let creds = credentials();
        let token = creds.issue("alice", Role::Admin).unwrap();
        let claims = creds.verify(&token).unwrap();
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.role, Role::Admin);
    }

    #[test]
    fn empty_and_sentinel_tokens_are_missing_not_malformed() {
        let creds = credentials();
        for bad in ["", "undefined", "null"] {
            let err = creds.verify(bad).unwrap_err();
            assert!(matches!(err, Error::Auth(_)));
        }
    }

    #[test]
    fn garbage_token_is_auth_error() {
        let creds = credentials();
        let err = creds.verify("not.a.jwt").unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[test]
    fn password_hash_round_trips() {
        let creds = credentials();
        let digest = creds.hash_password("correct horse battery staple").unwrap();
        assert!(creds.verify_password("correct horse battery staple", &digest).unwrap());
        assert!(!creds.verify_password("wrong password", &digest).unwrap());
    }

    #[test]
    fn short_password_is_rejected() {
        let creds = credentials();
        let err = creds.hash_password("short").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}

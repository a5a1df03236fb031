//! Password hashing shared by every realm.
//!
//! Hashes use the RFC 2307 layout common to LDAP directories:
//! `{SSHA512}` followed by base64 of the digest with the salt appended.

use std::{fmt::Debug, str::FromStr};

use dyn_clone::DynClone;
use ring::{
    constant_time::verify_slices_are_equal,
    digest,
    rand::{SecureRandom, SystemRandom},
};
use secrecy::{ExposeSecret, SecretString};

use crate::{Error, Result};

const SALT_LEN: usize = 8;

/// Hashes new passwords and checks candidates against stored hashes.
pub trait PasswordHasher: DynClone + Debug + Send + Sync {
    /// Hashes `password` with the named algorithm.
    fn encrypt(&self, password: &SecretString, algorithm: &str) -> Result<String>;

    /// Returns `true` when `password` matches the stored hash.
    fn matches(&self, password: &SecretString, stored: &str) -> bool;
}

dyn_clone::clone_trait_object!(PasswordHasher);

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// SHA-1, kept for existing `{SSHA}` hashes.
    Sha1,
    /// SHA-256.
    Sha256,
    /// SHA-384.
    Sha384,
    /// SHA-512.
    Sha512,
}

impl Algorithm {
    fn digest(self) -> &'static digest::Algorithm {
        match self {
            Algorithm::Sha1 => &digest::SHA1_FOR_LEGACY_USE_ONLY,
            Algorithm::Sha256 => &digest::SHA256,
            Algorithm::Sha384 => &digest::SHA384,
            Algorithm::Sha512 => &digest::SHA512,
        }
    }

    fn scheme(self) -> &'static str {
        match self {
            Algorithm::Sha1 => "SSHA",
            Algorithm::Sha256 => "SSHA256",
            Algorithm::Sha384 => "SSHA384",
            Algorithm::Sha512 => "SSHA512",
        }
    }

    /// Parses a `{SCHEME}` tag into the algorithm and whether it is salted.
    fn from_scheme(scheme: &str) -> Option<(Self, bool)> {
        let scheme = scheme.to_ascii_uppercase();
        let (name, salted) = match scheme.strip_prefix("SSHA") {
            Some(rest) => (rest, true),
            None => (scheme.strip_prefix("SHA")?, false),
        };

        let algorithm = match name {
            "" | "1" => Algorithm::Sha1,
            "256" => Algorithm::Sha256,
            "384" => Algorithm::Sha384,
            "512" => Algorithm::Sha512,
            _ => return None,
        };

        Some((algorithm, salted))
    }

    fn hash(self, password: &[u8], salt: &[u8]) -> digest::Digest {
        let mut context = digest::Context::new(self.digest());
        context.update(password);
        context.update(salt);
        context.finish()
    }

    fn output_len(self) -> usize {
        digest::digest(self.digest(), b"").as_ref().len()
    }
}

impl FromStr for Algorithm {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        let normalized = name.to_ascii_uppercase().replace('-', "");
        match normalized.as_str() {
            "SHA" | "SHA1" => Ok(Algorithm::Sha1),
            "SHA256" => Ok(Algorithm::Sha256),
            "SHA384" => Ok(Algorithm::Sha384),
            "SHA512" => Ok(Algorithm::Sha512),
            _ => Err(Error::UnsupportedAlgorithm(name.to_string())),
        }
    }
}

/// Salted digest hasher backed by `ring`.
#[derive(Debug, Clone)]
pub struct SaltedDigest {
    rng: SystemRandom,
}

impl SaltedDigest {
    /// Creates a hasher drawing salts from the system random source.
    pub fn new() -> Self {
        Self {
            rng: SystemRandom::new(),
        }
    }
}

impl Default for SaltedDigest {
    fn default() -> Self {
        Self::new()
    }
}

impl PasswordHasher for SaltedDigest {
    fn encrypt(&self, password: &SecretString, algorithm: &str) -> Result<String> {
        let algorithm: Algorithm = algorithm.parse()?;

        let mut salt = [0u8; SALT_LEN];
        self.rng.fill(&mut salt).map_err(|_| Error::Hashing)?;

        let hash = algorithm.hash(password.expose_secret().as_bytes(), &salt);
        let mut payload = hash.as_ref().to_vec();
        payload.extend_from_slice(&salt);

        Ok(format!(
            "{{{}}}{}",
            algorithm.scheme(),
            base64::encode(payload)
        ))
    }

    fn matches(&self, password: &SecretString, stored: &str) -> bool {
        let password = password.expose_secret().as_bytes();

        let Some((scheme, encoded)) = stored
            .strip_prefix('{')
            .and_then(|tagged| tagged.split_once('}'))
        else {
            // Unhashed legacy value.
            return verify_slices_are_equal(password, stored.as_bytes()).is_ok();
        };

        let Some((algorithm, salted)) = Algorithm::from_scheme(scheme) else {
            tracing::debug!(scheme, "unsupported password hash scheme");
            return false;
        };

        let Ok(payload) = base64::decode(encoded) else {
            return false;
        };

        let digest_len = algorithm.output_len();
        if payload.len() < digest_len || (!salted && payload.len() != digest_len) {
            return false;
        }

        let (expected, salt) = payload.split_at(digest_len);
        let actual = algorithm.hash(password, salt);

        verify_slices_are_equal(actual.as_ref(), expected).is_ok()
    }
}

use std::fmt::{self, Write as _};
use std::str::FromStr;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::mlkem::{MlKem1024, MlKem512, MlKem768};

/// Shared secrets never leave this wrapper un-zeroized.
pub type SharedSecret = Zeroizing<Vec<u8>>;

const FINGERPRINT_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum KemError {
    #[error("unknown kem scheme {0:?}")]
    UnknownScheme(String),
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("invalid secret key")]
    InvalidSecretKey,
    #[error("invalid ciphertext: expected {expected} bytes, got {actual}")]
    InvalidCiphertext { expected: usize, actual: usize },
    #[error("kem operation failed: {0}")]
    Operation(String),
}

/// Freshly generated key material. The secret half is wiped on drop.
pub struct KemKeyPair {
    pub public: Vec<u8>,
    pub secret: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for KemKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KemKeyPair")
            .field("public_len", &self.public.len())
            .field("secret_len", &self.secret.len())
            .finish()
    }
}

/// Sender-side result of an encapsulation.
pub struct Encapsulation {
    pub ciphertext: Vec<u8>,
    pub shared_secret: SharedSecret,
}

impl fmt::Debug for Encapsulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Encapsulation")
            .field("ciphertext_len", &self.ciphertext.len())
            .field("shared_secret", &fingerprint(&self.shared_secret))
            .finish()
    }
}

/// Capability interface over a named key-encapsulation mechanism.
///
/// Sizes are fixed for a given scheme and never vary between calls.
/// Implementations must be stateless so one instance can serve every
/// concurrent session.
pub trait KemScheme: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;
    fn public_key_size(&self) -> usize;
    fn ciphertext_size(&self) -> usize;
    fn shared_secret_size(&self) -> usize;

    fn generate_keypair(&self) -> Result<KemKeyPair, KemError>;

    /// Check that `public_key` is a structurally valid encoded key for this scheme.
    fn validate_public_key(&self, public_key: &[u8]) -> Result<(), KemError>;

    fn encapsulate(&self, public_key: &[u8]) -> Result<Encapsulation, KemError>;

    fn decapsulate(&self, secret_key: &[u8], ciphertext: &[u8]) -> Result<SharedSecret, KemError>;
}

/// Schemes selectable by name from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum KemAlgorithm {
    MlKem512,
    #[default]
    MlKem768,
    MlKem1024,
}

impl KemAlgorithm {
    pub const ALL: [KemAlgorithm; 3] = [
        KemAlgorithm::MlKem512,
        KemAlgorithm::MlKem768,
        KemAlgorithm::MlKem1024,
    ];

    /// Resolve a scheme from its canonical name or a legacy Kyber alias.
    pub fn from_name(name: &str) -> Result<Self, KemError> {
        let normalized: String = name
            .trim()
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "mlkem512" | "kyber512" => Ok(KemAlgorithm::MlKem512),
            "mlkem768" | "kyber768" => Ok(KemAlgorithm::MlKem768),
            "mlkem1024" | "kyber1024" => Ok(KemAlgorithm::MlKem1024),
            _ => Err(KemError::UnknownScheme(name.to_string())),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            KemAlgorithm::MlKem512 => MlKem512::NAME,
            KemAlgorithm::MlKem768 => MlKem768::NAME,
            KemAlgorithm::MlKem1024 => MlKem1024::NAME,
        }
    }

    pub fn scheme(&self) -> Arc<dyn KemScheme> {
        match self {
            KemAlgorithm::MlKem512 => Arc::new(MlKem512),
            KemAlgorithm::MlKem768 => Arc::new(MlKem768),
            KemAlgorithm::MlKem1024 => Arc::new(MlKem1024),
        }
    }
}

impl FromStr for KemAlgorithm {
    type Err = KemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s)
    }
}

impl fmt::Display for KemAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Short, log-safe digest of secret material: the first 8 bytes of SHA-256 as hex.
pub fn fingerprint(secret: &[u8]) -> String {
    let digest = Sha256::digest(secret);
    let mut out = String::with_capacity(FINGERPRINT_LEN * 2);
    for byte in &digest[..FINGERPRINT_LEN] {
        let _ = write!(&mut out, "{:02x}", byte);
    }
    out
}

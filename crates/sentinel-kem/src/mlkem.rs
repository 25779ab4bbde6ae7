use pqcrypto_mlkem::{mlkem1024, mlkem512, mlkem768};
use pqcrypto_traits::kem::{Ciphertext as _, PublicKey as _, SecretKey as _, SharedSecret as _};
use zeroize::Zeroizing;

use crate::scheme::{Encapsulation, KemError, KemKeyPair, KemScheme, SharedSecret};

/// ML-KEM prime modulus; every coefficient of an encoded key must be reduced below it.
const MLKEM_Q: u16 = 3329;
/// Bytes of packed 12-bit coefficients per polynomial in an encapsulation key.
const POLY_BYTES: usize = 384;
const SHARED_SECRET_BYTES: usize = 32;

/// FIPS 203 encapsulation-key check: exact length, then every packed 12-bit
/// coefficient of the `k` polynomials must be `< q`. The trailing 32-byte seed
/// is not constrained.
fn check_encapsulation_key(bytes: &[u8], rank: usize, expected_len: usize) -> Result<(), KemError> {
    if bytes.len() != expected_len {
        return Err(KemError::InvalidPublicKey(format!(
            "expected {expected_len} bytes, got {}",
            bytes.len()
        )));
    }
    let packed = &bytes[..rank * POLY_BYTES];
    for (idx, chunk) in packed.chunks_exact(3).enumerate() {
        let lo = u16::from(chunk[0]) | (u16::from(chunk[1] & 0x0f) << 8);
        let hi = u16::from(chunk[1] >> 4) | (u16::from(chunk[2]) << 4);
        if lo >= MLKEM_Q || hi >= MLKEM_Q {
            return Err(KemError::InvalidPublicKey(format!(
                "coefficient {} is not reduced modulo {MLKEM_Q}",
                idx * 2 + usize::from(lo < MLKEM_Q)
            )));
        }
    }
    Ok(())
}

macro_rules! mlkem_provider {
    ($ty:ident, $module:ident, $name:literal, $rank:literal, $pk:literal, $ct:literal) => {
        #[derive(Debug, Default, Clone, Copy)]
        pub struct $ty;

        impl $ty {
            pub const NAME: &'static str = $name;
            pub const PUBLIC_KEY_BYTES: usize = $pk;
            pub const CIPHERTEXT_BYTES: usize = $ct;
        }

        impl KemScheme for $ty {
            fn name(&self) -> &'static str {
                Self::NAME
            }

            fn public_key_size(&self) -> usize {
                Self::PUBLIC_KEY_BYTES
            }

            fn ciphertext_size(&self) -> usize {
                Self::CIPHERTEXT_BYTES
            }

            fn shared_secret_size(&self) -> usize {
                SHARED_SECRET_BYTES
            }

            fn generate_keypair(&self) -> Result<KemKeyPair, KemError> {
                let (public, secret) = $module::keypair();
                Ok(KemKeyPair {
                    public: public.as_bytes().to_vec(),
                    secret: Zeroizing::new(secret.as_bytes().to_vec()),
                })
            }

            fn validate_public_key(&self, public_key: &[u8]) -> Result<(), KemError> {
                check_encapsulation_key(public_key, $rank, Self::PUBLIC_KEY_BYTES)?;
                $module::PublicKey::from_bytes(public_key)
                    .map(|_| ())
                    .map_err(|err| KemError::InvalidPublicKey(format!("{err:?}")))
            }

            fn encapsulate(&self, public_key: &[u8]) -> Result<Encapsulation, KemError> {
                let public_key = $module::PublicKey::from_bytes(public_key)
                    .map_err(|err| KemError::InvalidPublicKey(format!("{err:?}")))?;
                let (shared, ciphertext) = $module::encapsulate(&public_key);
                Ok(Encapsulation {
                    ciphertext: ciphertext.as_bytes().to_vec(),
                    shared_secret: Zeroizing::new(shared.as_bytes().to_vec()),
                })
            }

            fn decapsulate(
                &self,
                secret_key: &[u8],
                ciphertext: &[u8],
            ) -> Result<SharedSecret, KemError> {
                let secret_key = $module::SecretKey::from_bytes(secret_key)
                    .map_err(|_| KemError::InvalidSecretKey)?;
                let ciphertext = $module::Ciphertext::from_bytes(ciphertext).map_err(|_| {
                    KemError::InvalidCiphertext {
                        expected: Self::CIPHERTEXT_BYTES,
                        actual: ciphertext.len(),
                    }
                })?;
                let shared = $module::decapsulate(&ciphertext, &secret_key);
                Ok(Zeroizing::new(shared.as_bytes().to_vec()))
            }
        }
    };
}

mlkem_provider!(MlKem512, mlkem512, "ML-KEM-512", 2, 800, 768);
mlkem_provider!(MlKem768, mlkem768, "ML-KEM-768", 3, 1184, 1088);
mlkem_provider!(MlKem1024, mlkem1024, "ML-KEM-1024", 4, 1568, 1568);

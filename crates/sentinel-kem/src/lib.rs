//! Key-encapsulation providers used by the Sentinel handshake probe.
//!
//! The proxy and the peer simulator only ever talk to a scheme through the
//! [`KemScheme`] capability trait, so any compliant KEM can be dropped in
//! without touching the protocol driver. ML-KEM providers backed by the
//! `pqcrypto` bindings ship by default.

mod mlkem;
mod scheme;

pub use mlkem::{MlKem1024, MlKem512, MlKem768};
pub use scheme::{
    fingerprint, Encapsulation, KemAlgorithm, KemError, KemKeyPair, KemScheme, SharedSecret,
};

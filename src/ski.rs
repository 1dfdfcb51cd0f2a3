//! Subject Key Identifier derivation (RFC 5280 section 4.2.1.2, method 1)
//!
//! The identifier is the SHA-1 digest of the `subjectPublicKey` BIT STRING
//! contents of the key's SubjectPublicKeyInfo. The tag, length and unused-bits
//! octet are not hashed, only the key bytes themselves.

use crate::error::SkiError;
use openssl::pkey::{HasPublic, PKeyRef};
use openssl::sha::sha1;
use x509_parser::prelude::FromDer;
use x509_parser::x509::SubjectPublicKeyInfo;

pub const SKI_LEN: usize = 20;

/// Compute the 160-bit subject key identifier of `public_key`
pub fn compute_ski<T: HasPublic>(public_key: &PKeyRef<T>) -> Result<[u8; SKI_LEN], SkiError> {
    let spki_der = public_key
        .public_key_to_der()
        .map_err(SkiError::PublicKeyEncoding)?;
    ski_from_spki_der(&spki_der)
}

/// Compute the identifier from an already encoded SubjectPublicKeyInfo
pub fn ski_from_spki_der(spki_der: &[u8]) -> Result<[u8; SKI_LEN], SkiError> {
    let (remaining, spki) =
        SubjectPublicKeyInfo::from_der(spki_der).map_err(|e| SkiError::Decode(e.to_string()))?;
    if !remaining.is_empty() {
        return Err(SkiError::TrailingData(remaining.len()));
    }
    Ok(sha1(&spki.subject_public_key.data))
}

//! Error types for certificate issuance
//!
//! Every failure is scoped to a single issuance attempt. None of these errors
//! leave shared state (the CA store) in a broken condition; a later call simply
//! tries again.

use openssl::error::ErrorStack;
use std::path::PathBuf;
use thiserror::Error;

/// Failures while reading and parsing the CA certificate and key files
#[derive(Debug, Error)]
pub enum CaLoadError {
    #[error("failed to read CA certificate file {path}: {source}")]
    CertificateUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("CA certificate file {path} does not contain a PEM block")]
    CertificateMalformedPem { path: PathBuf },
    #[error("failed to parse CA certificate: {0}")]
    CertificateUnparsable(#[source] ErrorStack),
    #[error("failed to read CA key file {path}: {source}")]
    KeyUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("CA key file {path} does not contain a PEM block")]
    KeyMalformedPem { path: PathBuf },
    #[error("failed to parse CA key as PKCS#1 RSA: {0}")]
    KeyUnparsable(#[source] ErrorStack),
    #[error("CA key does not match the public key of the CA certificate")]
    KeyMismatch,
}

#[derive(Debug, Error)]
#[error("failed to generate RSA key pair: {0}")]
pub struct KeyGenerationError(#[from] pub ErrorStack);

#[derive(Debug, Error)]
pub enum CsrError {
    #[error("failed to build CSR: {0}")]
    BuildFailed(#[source] ErrorStack),
    #[error("failed to parse CSR: {0}")]
    ParseFailed(#[source] ErrorStack),
    #[error("CSR self-signature does not verify")]
    SignatureInvalid,
}

#[derive(Debug, Error)]
pub enum SkiError {
    #[error("failed to encode public key as SubjectPublicKeyInfo: {0}")]
    PublicKeyEncoding(#[source] ErrorStack),
    #[error("failed to decode SubjectPublicKeyInfo: {0}")]
    Decode(String),
    #[error("{0} trailing bytes after SubjectPublicKeyInfo")]
    TrailingData(usize),
}

/// Failure while assembling or signing the final certificate
#[derive(Debug, Error)]
#[error("failed to {step}: {source}")]
pub struct SigningError {
    pub step: &'static str,
    #[source]
    pub source: ErrorStack,
}

impl SigningError {
    pub(crate) fn at(step: &'static str) -> impl FnOnce(ErrorStack) -> Self {
        move |source| Self { step, source }
    }
}

/// The single error surfaced by [`crate::generate_device_cert::DeviceCertificateIssuer::issue`]
#[derive(Debug, Error)]
pub enum IssuanceError {
    #[error("device name must not be empty")]
    EmptyDeviceName,
    #[error(transparent)]
    CaLoad(#[from] CaLoadError),
    #[error(transparent)]
    KeyGeneration(#[from] KeyGenerationError),
    #[error(transparent)]
    Csr(#[from] CsrError),
    #[error(transparent)]
    Ski(#[from] SkiError),
    #[error(transparent)]
    Signing(#[from] SigningError),
    #[error("certificate lifetime {0:?} is out of range")]
    ValidityOutOfRange(std::time::Duration),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("registry rejected device {device}: HTTP {status}: {body}")]
    Rejected {
        device: String,
        status: u16,
        body: String,
    },
    #[error("registry response is missing the device resource name")]
    MissingResourceName,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DurationParseError {
    #[error("empty duration")]
    Empty,
    #[error("invalid duration {0:?}")]
    Invalid(String),
    #[error("missing unit in duration {0:?}")]
    MissingUnit(String),
    #[error("unknown unit {unit:?} in duration {input:?}")]
    UnknownUnit { unit: String, input: String },
    #[error("duration {0:?} is out of range")]
    Overflow(String),
}

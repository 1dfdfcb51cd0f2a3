//! Device Certificate Issuance Module
//!
//! Ties the pieces together: make sure the CA is loaded, generate a fresh device
//! key, build and verify a CSR for it, and sign a client certificate with the CA
//! key.
//!
//! # Certificate Properties
//! - **Version**: X.509v3
//! - **Subject / public key**: copied from the verified CSR
//! - **Serial Number**: 20 random bytes, top bit cleared (positive INTEGER)
//! - **Validity**: `now - 1 minute` until `not_before + expiration`, UTC
//! - **Key Usage**: digitalSignature, keyEncipherment (critical)
//! - **Extended Key Usage**: clientAuth
//! - **Basic Constraints**: CA=false (critical)
//! - **Subject Key Identifier**: RFC 5280 method 1
//! - **Authority Key Identifier**: copied from the CA when it has one
//! - **Signature Algorithm**: SHA-256 with RSA

use crate::ca_store::{CaMaterial, CaStore};
use crate::configs::AppConfig;
use crate::error::{IssuanceError, SigningError};
use crate::generate_csr::{build_and_validate_csr, SubjectTemplate};
use crate::generate_keypair::generate_device_keypair;
use crate::generate_root_ca::subject_key_identifier_extension;
use crate::pem_block::{self, CERTIFICATE_TAG};
use crate::ski::compute_ski;
use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage,
};
use openssl::x509::{X509Req, X509};
use secrecy::SecretString;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2
pub const SERIAL_NUMBER_LEN: usize = 20;

/// Backdating applied to `notBefore` to tolerate clock skew on devices
pub const CLOCK_SKEW_ALLOWANCE: TimeDelta = TimeDelta::minutes(1);

/// PEM-encoded certificate and private key handed back to the caller
pub struct IssuedCredentials {
    certificate_pem: String,
    private_key_pem: SecretString,
    serial_number: String,
}

impl IssuedCredentials {
    /// `CERTIFICATE` PEM block
    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    /// `RSA PRIVATE KEY` PEM block (PKCS#1)
    pub fn private_key_pem(&self) -> &SecretString {
        &self.private_key_pem
    }

    /// Serial number as upper-case hex
    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }
}

impl fmt::Debug for IssuedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCredentials")
            .field("serial_number", &self.serial_number)
            .field("private_key_pem", &"<redacted>")
            .finish_non_exhaustive()
    }
}

/// 20 random bytes with the most significant bit cleared
pub fn random_serial_number() -> Result<[u8; SERIAL_NUMBER_LEN], ErrorStack> {
    let mut serial = [0u8; SERIAL_NUMBER_LEN];
    openssl::rand::rand_bytes(&mut serial)?;
    serial[0] &= 0x7f;
    Ok(serial)
}

/// Issues client certificates for devices, signed by the CA in the store
///
/// Cheap to share between threads; every call to [`issue`](Self::issue) works on
/// its own key pair, CSR and certificate builder.
pub struct DeviceCertificateIssuer {
    ca_store: Arc<CaStore>,
    subject: SubjectTemplate,
    expiration: Duration,
}

impl DeviceCertificateIssuer {
    pub fn new(ca_store: Arc<CaStore>, subject: SubjectTemplate, expiration: Duration) -> Self {
        Self {
            ca_store,
            subject,
            expiration,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let ca_store = CaStore::new(&config.ca.certificate_path, &config.ca.key_path);
        Self::new(
            Arc::new(ca_store),
            config.certificate.subject_template(),
            config.certificate.expiration(),
        )
    }

    pub fn ca_store(&self) -> &Arc<CaStore> {
        &self.ca_store
    }

    pub fn subject(&self) -> &SubjectTemplate {
        &self.subject
    }

    pub fn expiration(&self) -> Duration {
        self.expiration
    }

    /// Issue a certificate and private key for `device_name`
    ///
    /// # Errors
    /// Any failure along the way is returned as [`IssuanceError`]; nothing is
    /// returned partially and the CA store remains usable.
    pub fn issue(&self, device_name: &str) -> Result<IssuedCredentials, IssuanceError> {
        if device_name.is_empty() {
            return Err(IssuanceError::EmptyDeviceName);
        }

        let ca = self.ca_store.load()?;
        let keypair = generate_device_keypair().map_err(|e| {
            tracing::error!(device = device_name, error = %e, "unable to generate RSA private key");
            e
        })?;
        let csr = build_and_validate_csr(device_name, &self.subject, keypair.private_key())
            .map_err(|e| {
                tracing::error!(device = device_name, error = %e, "CSR validation failed");
                e
            })?;

        let certificate = self.sign_request(&csr, ca, Utc::now())?;

        let serial_number = certificate
            .serial_number()
            .to_bn()
            .and_then(|bn| bn.to_hex_str().map(|hex| hex.to_string()))
            .map_err(SigningError::at("read serial number"))?;
        let certificate_der = certificate
            .to_der()
            .map_err(SigningError::at("encode certificate"))?;
        let private_key_pem = keypair
            .private_key_pem()
            .map_err(SigningError::at("encode private key"))?;

        tracing::info!(
            device = device_name,
            serial = %serial_number,
            not_after = %certificate.not_after(),
            "issued device certificate"
        );

        Ok(IssuedCredentials {
            certificate_pem: pem_block::encode(CERTIFICATE_TAG, certificate_der),
            private_key_pem,
            serial_number,
        })
    }

    /// Sign a verified CSR with the CA key, as of `issued_at`
    pub fn sign_request(
        &self,
        csr: &X509Req,
        ca: &CaMaterial,
        issued_at: DateTime<Utc>,
    ) -> Result<X509, IssuanceError> {
        let public_key = csr
            .public_key()
            .map_err(SigningError::at("read CSR public key"))?;
        let ski = compute_ski(&public_key)?;

        let not_before = issued_at.trunc_subsecs(0) - CLOCK_SKEW_ALLOWANCE;
        let not_after = TimeDelta::from_std(self.expiration)
            .ok()
            .and_then(|lifetime| not_before.checked_add_signed(lifetime))
            .ok_or(IssuanceError::ValidityOutOfRange(self.expiration))?;

        let mut builder = X509::builder().map_err(SigningError::at("create X509 builder"))?;
        builder
            .set_version(X509_VERSION_3)
            .map_err(SigningError::at("set version"))?;

        let serial = random_serial_number()
            .and_then(|bytes| BigNum::from_slice(&bytes))
            .and_then(|bn| bn.to_asn1_integer())
            .map_err(SigningError::at("generate serial number"))?;
        builder
            .set_serial_number(&serial)
            .map_err(SigningError::at("set serial number"))?;

        builder
            .set_subject_name(csr.subject_name())
            .map_err(SigningError::at("set subject"))?;
        builder
            .set_issuer_name(ca.certificate().subject_name())
            .map_err(SigningError::at("set issuer"))?;
        builder
            .set_pubkey(&public_key)
            .map_err(SigningError::at("set public key"))?;

        let not_before_time = asn1_time(not_before).map_err(SigningError::at("create not_before"))?;
        builder
            .set_not_before(&not_before_time)
            .map_err(SigningError::at("set not_before"))?;
        let not_after_time = asn1_time(not_after).map_err(SigningError::at("create not_after"))?;
        builder
            .set_not_after(&not_after_time)
            .map_err(SigningError::at("set not_after"))?;

        // CA=false; an empty BasicConstraints still marks the extension present
        let bc = BasicConstraints::new()
            .critical()
            .build()
            .map_err(SigningError::at("build BasicConstraints"))?;
        builder
            .append_extension(bc)
            .map_err(SigningError::at("add BasicConstraints"))?;

        let ku = KeyUsage::new()
            .critical()
            .digital_signature()
            .key_encipherment()
            .build()
            .map_err(SigningError::at("build KeyUsage"))?;
        builder
            .append_extension(ku)
            .map_err(SigningError::at("add KeyUsage"))?;

        let eku = ExtendedKeyUsage::new()
            .client_auth()
            .build()
            .map_err(SigningError::at("build ExtendedKeyUsage"))?;
        builder
            .append_extension(eku)
            .map_err(SigningError::at("add ExtendedKeyUsage"))?;

        let ski_extension =
            subject_key_identifier_extension(&ski).map_err(SigningError::at("build SubjectKeyIdentifier"))?;
        builder
            .append_extension(ski_extension)
            .map_err(SigningError::at("add SubjectKeyIdentifier"))?;

        if ca.certificate().subject_key_id().is_some() {
            let aki = AuthorityKeyIdentifier::new()
                .keyid(true)
                .build(&builder.x509v3_context(Some(ca.certificate()), None))
                .map_err(SigningError::at("build AuthorityKeyIdentifier"))?;
            builder
                .append_extension(aki)
                .map_err(SigningError::at("add AuthorityKeyIdentifier"))?;
        }

        builder
            .sign(ca.signing_key(), MessageDigest::sha256())
            .map_err(SigningError::at("sign certificate"))?;

        Ok(builder.build())
    }
}

fn asn1_time(at: DateTime<Utc>) -> Result<Asn1Time, ErrorStack> {
    // The X.509 variant picks UTCTime before 2050 and GeneralizedTime after.
    Asn1Time::from_str_x509(&at.format("%Y%m%d%H%M%SZ").to_string())
}

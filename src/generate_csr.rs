//! Certificate Signing Request Module
//!
//! Builds a PKCS#10 request for a device, self-signs it with the device key and
//! then parses the serialized request back and checks its signature before the
//! CA key is ever touched. The round trip catches encoding or signing defects
//! early; callers should always go through [`build_and_validate_csr`].

use crate::error::CsrError;
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509Name, X509Req, X509ReqBuilder};

/// PKCS#10 version 1 is encoded as 0
const X509_REQ_VERSION_1: i32 = 0;

/// Subject attributes shared by every certificate issued in this process
///
/// Only the common name varies per device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectTemplate {
    pub country: String,
    pub province: String,
    pub locality: String,
    pub organization: String,
    pub organizational_unit: String,
}

impl SubjectTemplate {
    /// Build the distinguished name for `common_name`
    ///
    /// Attributes are appended in the order C, ST, L, O, OU, CN. Empty template
    /// fields are left out.
    pub fn to_x509_name(&self, common_name: &str) -> Result<X509Name, ErrorStack> {
        let mut name_builder = X509Name::builder()?;
        let entries = [
            (Nid::COUNTRYNAME, self.country.as_str()),
            (Nid::STATEORPROVINCENAME, self.province.as_str()),
            (Nid::LOCALITYNAME, self.locality.as_str()),
            (Nid::ORGANIZATIONNAME, self.organization.as_str()),
            (Nid::ORGANIZATIONALUNITNAME, self.organizational_unit.as_str()),
        ];
        for (nid, value) in entries {
            if !value.is_empty() {
                name_builder.append_entry_by_nid(nid, value)?;
            }
        }
        name_builder.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
        Ok(name_builder.build())
    }
}

/// Build a CSR for `device_name` signed with SHA-256-with-RSA by `key`, as DER
pub fn build_csr_der(
    device_name: &str,
    subject: &SubjectTemplate,
    key: &PKey<Private>,
) -> Result<Vec<u8>, CsrError> {
    let build = || -> Result<Vec<u8>, ErrorStack> {
        let mut builder = X509ReqBuilder::new()?;
        builder.set_version(X509_REQ_VERSION_1)?;
        let subject_name = subject.to_x509_name(device_name)?;
        builder.set_subject_name(&subject_name)?;
        builder.set_pubkey(key)?;
        builder.sign(key, MessageDigest::sha256())?;
        builder.build().to_der()
    };
    build().map_err(CsrError::BuildFailed)
}

/// Parse a DER CSR and verify its self-signature against its embedded key
pub fn validate_csr_der(der: &[u8]) -> Result<X509Req, CsrError> {
    let request = X509Req::from_der(der).map_err(CsrError::ParseFailed)?;
    let public_key = request.public_key().map_err(CsrError::ParseFailed)?;

    match request.verify(&public_key) {
        Ok(true) => Ok(request),
        Ok(false) => Err(CsrError::SignatureInvalid),
        Err(e) => {
            tracing::debug!(error = %e, "CSR signature verification errored");
            Err(CsrError::SignatureInvalid)
        }
    }
}

/// Build the CSR, then re-parse it and check the self-signature
pub fn build_and_validate_csr(
    device_name: &str,
    subject: &SubjectTemplate,
    key: &PKey<Private>,
) -> Result<X509Req, CsrError> {
    let der = build_csr_der(device_name, subject, key)?;
    validate_csr_der(&der)
}
